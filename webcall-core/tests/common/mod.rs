//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use webcall_core::{
    AdapterError, AdapterEvent, AdapterEvents, CallEvent, CameraFacing, EngineConnectionState,
    IceCandidate, LocalStream, MediaConstraints, MediaKind, PeerConnectionAdapter, RemoteStream,
    SdpType, SessionDescription,
};

#[derive(Default)]
struct Side {
    local: Option<SdpType>,
    remote: Option<SdpType>,
    remote_sets: usize,
    added: Vec<IceCandidate>,
    kinds: Vec<MediaKind>,
    closed: bool,
}

impl Side {
    fn negotiated(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }
}

#[derive(Default)]
struct Link {
    sides: [Side; 2],
    connected: bool,
}

/// One end of an in-process engine pair.
///
/// Each end gathers one host candidate when its local description is set; both ends
/// report `Connected` once both have local and remote descriptions and at least one
/// remote candidate.
pub struct LinkedEngine {
    index: usize,
    link: Arc<Mutex<Link>>,
    peers: [mpsc::UnboundedSender<AdapterEvent>; 2],
    events: Mutex<Option<AdapterEvents>>,
    closes: AtomicUsize,
}

/// Build a connected pair of engines
pub fn linked_pair() -> (Arc<LinkedEngine>, Arc<LinkedEngine>) {
    let link = Arc::new(Mutex::new(Link::default()));
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let make = |index, rx| {
        Arc::new(LinkedEngine {
            index,
            link: link.clone(),
            peers: [tx_a.clone(), tx_b.clone()],
            events: Mutex::new(Some(rx)),
            closes: AtomicUsize::new(0),
        })
    };
    (make(0, rx_a), make(1, rx_b))
}

impl LinkedEngine {
    /// Remote candidates accepted so far
    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.link.lock().unwrap().sides[self.index].added.clone()
    }

    /// Successful remote description applications, repeats excluded
    pub fn remote_description_sets(&self) -> usize {
        self.link.lock().unwrap().sides[self.index].remote_sets
    }

    /// Number of `close` invocations
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Inject an engine event on this end
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.peers[self.index].send(event);
    }

    fn check_open(&self, link: &Link) -> Result<(), AdapterError> {
        if link.sides[self.index].closed {
            Err(AdapterError::Closed)
        } else {
            Ok(())
        }
    }

    fn maybe_connect(&self, link: &mut Link) {
        let ready = link.sides.iter().all(|s| s.negotiated() && !s.added.is_empty());
        if !ready || link.connected {
            return;
        }
        link.connected = true;
        for (index, tx) in self.peers.iter().enumerate() {
            let other = &link.sides[1 - index];
            for kind in &other.kinds {
                let _ = tx.send(AdapterEvent::RemoteTrackAdded(RemoteStream {
                    id: format!("remote-{index}"),
                    kind: *kind,
                }));
            }
            let _ = tx.send(AdapterEvent::ConnectionStateChanged(
                EngineConnectionState::Connecting,
            ));
            let _ = tx.send(AdapterEvent::ConnectionStateChanged(
                EngineConnectionState::Connected,
            ));
        }
    }
}

#[async_trait]
impl PeerConnectionAdapter for LinkedEngine {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, AdapterError> {
        let mut link = self.link.lock().unwrap();
        self.check_open(&link)?;
        link.sides[self.index].kinds = constraints.to_media_kinds();
        Ok(LocalStream {
            id: format!("local-{}", self.index),
            kinds: constraints.to_media_kinds(),
            facing: constraints.facing,
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, AdapterError> {
        self.check_open(&self.link.lock().unwrap())?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\n",
            self.index
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, AdapterError> {
        let link = self.link.lock().unwrap();
        self.check_open(&link)?;
        if link.sides[self.index].remote != Some(SdpType::Offer) {
            return Err(AdapterError::InvalidState("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=- {} 3 IN IP4 127.0.0.1\r\n",
            self.index
        )))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), AdapterError> {
        let mut link = self.link.lock().unwrap();
        self.check_open(&link)?;
        link.sides[self.index].local = Some(desc.sdp_type);
        self.emit(AdapterEvent::LocalIceCandidate(IceCandidate::new(
            format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.index,
                50000 + self.index
            ),
            Some("0".to_string()),
            Some(0),
        )));
        self.maybe_connect(&mut link);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), AdapterError> {
        let mut link = self.link.lock().unwrap();
        self.check_open(&link)?;
        let side = &mut link.sides[self.index];
        match side.remote {
            Some(current) if current == desc.sdp_type => return Ok(()),
            Some(current) => {
                return Err(AdapterError::InvalidState(format!(
                    "remote {current:?} already applied"
                )))
            }
            None => {
                side.remote = Some(desc.sdp_type);
                side.remote_sets += 1;
            }
        }
        self.maybe_connect(&mut link);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), AdapterError> {
        let mut link = self.link.lock().unwrap();
        self.check_open(&link)?;
        let side = &mut link.sides[self.index];
        if side.remote.is_none() {
            return Err(AdapterError::NoRemoteDescription);
        }
        side.added.push(candidate.clone());
        self.maybe_connect(&mut link);
        Ok(())
    }

    async fn replace_video_track(&self, _facing: CameraFacing) -> Result<(), AdapterError> {
        let link = self.link.lock().unwrap();
        self.check_open(&link)?;
        if link.sides[self.index].kinds.contains(&MediaKind::Video) {
            Ok(())
        } else {
            Err(AdapterError::NoActiveSender)
        }
    }

    async fn set_track_enabled(&self, _kind: MediaKind, _enabled: bool) -> Result<(), AdapterError> {
        self.check_open(&self.link.lock().unwrap())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.link.lock().unwrap().sides[self.index].closed = true;
        Ok(())
    }

    fn take_events(&self) -> Option<AdapterEvents> {
        self.events.lock().unwrap().take()
    }
}

/// Wait for the first event matching `pred`, failing the test after two seconds
pub async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap()
}
