//! Peer connection adapter backed by the `webrtc` crate
//!
//! Local media is represented by static-sample tracks; feeding captured frames into
//! them is left to the embedding application.

use crate::adapter::{
    expect_description, AdapterError, AdapterEvent, AdapterEvents, EngineConnectionState,
    LocalStream, PeerConnectionAdapter, RemoteStream,
};
use crate::service::AdapterFactory;
use crate::types::{
    CameraFacing, IceCandidate, IceConfig, MediaConstraints, MediaKind, SdpType,
    SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn engine_error(err: webrtc::Error) -> AdapterError {
    AdapterError::Engine(err.to_string())
}

struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
    /// A disabled track stays detached from its sender until re-enabled
    enabled: bool,
}

impl LocalTrack {
    fn as_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

#[derive(Default)]
struct LocalTracks {
    stream_id: String,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

/// [`PeerConnectionAdapter`] over an `RTCPeerConnection`
pub struct WebRtcPeerAdapter {
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<AdapterEvents>>,
    local: tokio::sync::Mutex<LocalTracks>,
    closed: AtomicBool,
}

impl WebRtcPeerAdapter {
    /// Create a peer connection using the given ICE servers
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be initialized
    pub async fn new(ice: &IceConfig) -> Result<Self, AdapterError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(engine_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(engine_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(engine_error)?);

        let (tx, rx) = mpsc::unbounded_channel();
        Self::wire_events(&pc, tx);
        tracing::debug!(servers = ice.ice_servers.len(), "Peer connection created");

        Ok(Self {
            pc,
            events: Mutex::new(Some(rx)),
            local: tokio::sync::Mutex::new(LocalTracks::default()),
            closed: AtomicBool::new(false),
        })
    }

    fn wire_events(pc: &RTCPeerConnection, tx: mpsc::UnboundedSender<AdapterEvent>) {
        let ice_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(AdapterEvent::LocalIceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let track_tx = tx.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = track_tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        other => {
                            tracing::debug!(kind = %other, "Ignoring remote track of unknown kind");
                            return;
                        }
                    };
                    let _ = tx.send(AdapterEvent::RemoteTrackAdded(RemoteStream {
                        id: track.stream_id(),
                        kind,
                    }));
                })
            },
        ));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => EngineConnectionState::New,
                    RTCPeerConnectionState::Connecting => EngineConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => EngineConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => EngineConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => EngineConnectionState::Failed,
                    RTCPeerConnectionState::Closed => EngineConnectionState::Closed,
                    RTCPeerConnectionState::Unspecified => return,
                };
                let _ = tx.send(AdapterEvent::ConnectionStateChanged(mapped));
            })
        }));
    }

    fn ensure_open(&self) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(AdapterError::Closed)
        } else {
            Ok(())
        }
    }

    async fn add_local_track(
        &self,
        kind: MediaKind,
        stream_id: &str,
        facing: CameraFacing,
    ) -> Result<LocalTrack, AdapterError> {
        let track = Arc::new(new_track(kind, stream_id, facing));
        let local: Arc<dyn TrackLocal + Send + Sync> = track.clone();
        let sender = self.pc.add_track(local).await.map_err(engine_error)?;
        Ok(LocalTrack {
            track,
            sender,
            enabled: true,
        })
    }

    async fn remote_type(&self) -> Option<RTCSdpType> {
        self.pc.remote_description().await.map(|d| d.sdp_type)
    }
}

fn new_track(kind: MediaKind, stream_id: &str, facing: CameraFacing) -> TrackLocalStaticSample {
    let (codec, id) = match kind {
        MediaKind::Audio => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
        ),
        MediaKind::Video => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{facing:?}").to_lowercase(),
        ),
    };
    TrackLocalStaticSample::new(codec, id, stream_id.to_string())
}

fn to_engine_description(desc: &SessionDescription) -> Result<RTCSessionDescription, AdapterError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    result.map_err(|e| AdapterError::InvalidDescription(e.to_string()))
}

fn from_engine_description(desc: RTCSessionDescription) -> Result<SessionDescription, AdapterError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(AdapterError::InvalidDescription(format!(
            "unsupported description type {other}"
        ))),
    }
}

fn sdp_type_of(desc: &SessionDescription) -> RTCSdpType {
    match desc.sdp_type {
        SdpType::Offer => RTCSdpType::Offer,
        SdpType::Answer => RTCSdpType::Answer,
    }
}

#[async_trait]
impl PeerConnectionAdapter for WebRtcPeerAdapter {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, AdapterError> {
        self.ensure_open()?;
        if constraints.to_media_kinds().is_empty() {
            return Err(AdapterError::MediaUnavailable(
                "no audio or video requested".to_string(),
            ));
        }

        let mut local = self.local.lock().await;
        if local.stream_id.is_empty() {
            local.stream_id = format!("stream-{}", uuid::Uuid::new_v4().simple());
        }
        let stream_id = local.stream_id.clone();

        if constraints.has_audio() && local.audio.is_none() {
            local.audio = Some(
                self.add_local_track(MediaKind::Audio, &stream_id, constraints.facing)
                    .await
                    .map_err(|e| AdapterError::MediaUnavailable(e.to_string()))?,
            );
        }
        if constraints.has_video() && local.video.is_none() {
            local.video = Some(
                self.add_local_track(MediaKind::Video, &stream_id, constraints.facing)
                    .await
                    .map_err(|e| AdapterError::MediaUnavailable(e.to_string()))?,
            );
        }

        tracing::debug!(stream = %stream_id, kinds = ?constraints.to_media_kinds(), "Local tracks added");
        Ok(LocalStream {
            id: stream_id,
            kinds: constraints.to_media_kinds(),
            facing: constraints.facing,
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, AdapterError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        from_engine_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, AdapterError> {
        self.ensure_open()?;
        if self.remote_type().await != Some(RTCSdpType::Offer) {
            return Err(AdapterError::InvalidState(
                "no remote offer to answer".to_string(),
            ));
        }
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        from_engine_description(answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), AdapterError> {
        self.ensure_open()?;
        expect_description(desc, desc.sdp_type)?;
        self.pc
            .set_local_description(to_engine_description(desc)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), AdapterError> {
        self.ensure_open()?;
        expect_description(desc, desc.sdp_type)?;
        if self.remote_type().await == Some(sdp_type_of(desc)) {
            tracing::debug!(sdp_type = ?desc.sdp_type, "Remote description already applied");
            return Ok(());
        }
        self.pc
            .set_remote_description(to_engine_description(desc)?)
            .await
            .map_err(|e| AdapterError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), AdapterError> {
        self.ensure_open()?;
        if self.remote_type().await.is_none() {
            return Err(AdapterError::NoRemoteDescription);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await.map_err(engine_error)
    }

    async fn replace_video_track(&self, facing: CameraFacing) -> Result<(), AdapterError> {
        self.ensure_open()?;
        let mut local = self.local.lock().await;
        let stream_id = local.stream_id.clone();
        let video = local.video.as_mut().ok_or(AdapterError::NoActiveSender)?;

        let track = Arc::new(new_track(MediaKind::Video, &stream_id, facing));
        if video.enabled {
            let replacement: Arc<dyn TrackLocal + Send + Sync> = track.clone();
            video
                .sender
                .replace_track(Some(replacement))
                .await
                .map_err(engine_error)?;
        }
        video.track = track;
        Ok(())
    }

    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), AdapterError> {
        self.ensure_open()?;
        let mut local = self.local.lock().await;
        let slot = match kind {
            MediaKind::Audio => local.audio.as_mut(),
            MediaKind::Video => local.video.as_mut(),
        };
        let track = slot.ok_or(AdapterError::NoActiveSender)?;
        let replacement = enabled.then(|| track.as_local());
        track
            .sender
            .replace_track(replacement)
            .await
            .map_err(engine_error)?;
        track.enabled = enabled;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut local = self.local.lock().await;
        local.audio = None;
        local.video = None;
        drop(local);
        self.pc.close().await.map_err(engine_error)
    }

    fn take_events(&self) -> Option<AdapterEvents> {
        self.events.lock().take()
    }
}

/// Builds a [`WebRtcPeerAdapter`] per call
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcAdapterFactory;

#[async_trait]
impl AdapterFactory for WebRtcAdapterFactory {
    async fn create(&self, ice: &IceConfig) -> Result<Arc<dyn PeerConnectionAdapter>, AdapterError> {
        Ok(Arc::new(WebRtcPeerAdapter::new(ice).await?))
    }
}
