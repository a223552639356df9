//! In-process connection objects with a faithful offer/answer state machine
//! but no network. They back the `--loopback` dry-run mode and the tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::connection::{
    ConnectionFactory, ConnectionState, PeerConnection, PeerEventSink, SignalingState,
};
use super::{Track, TrackKind};
use crate::error::ConnectionError;
use crate::signal::{IceCandidate, ParticipantId, SdpKind, SessionDescription};

/// Faults injected into every connection a factory creates.
#[derive(Default)]
pub struct LoopbackFaults {
    /// Number of upcoming remote-description calls that fail.
    pub fail_remote_descriptions: AtomicUsize,
    pub fail_rollback: AtomicBool,
}

enum Emit {
    Candidate(IceCandidate),
    RemoteTrack(TrackKind),
    Connection(ConnectionState),
    Signaling(SignalingState),
}

#[derive(Default)]
struct LoopbackState {
    signaling: Option<SignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<(TrackKind, Option<Track>)>,
    candidates: Vec<IceCandidate>,
    replacements: usize,
    offers_created: usize,
    rollback_attempts: usize,
    connected: bool,
    closed: bool,
}

impl LoopbackState {
    fn signaling(&self) -> SignalingState {
        self.signaling.unwrap_or(SignalingState::Stable)
    }
}

pub struct LoopbackConnection {
    peer_id: ParticipantId,
    state: Mutex<LoopbackState>,
    faults: Arc<LoopbackFaults>,
    emit_tx: mpsc::UnboundedSender<Emit>,
    candidate_port: AtomicU64,
}

fn sdp_for(kind: SdpKind, peer: &ParticipantId, serial: usize, kinds: &[TrackKind]) -> String {
    let tracks: Vec<&str> = kinds
        .iter()
        .map(|k| match k {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
        .collect();
    format!(
        "v=0\r\no=meshlink-loopback {} {} IN IP4 127.0.0.1\r\ns={:?}\r\na=tracks:{}\r\n",
        peer,
        serial,
        kind,
        tracks.join(",")
    )
}

fn tracks_in(sdp: &str) -> Vec<TrackKind> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("a=tracks:"))
        .map(|list| {
            list.split(',')
                .filter_map(|k| match k.trim() {
                    "audio" => Some(TrackKind::Audio),
                    "video" => Some(TrackKind::Video),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

impl LoopbackConnection {
    fn new(sink: PeerEventSink, faults: Arc<LoopbackFaults>) -> Self {
        let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<Emit>();
        let peer_id = sink.peer_id().clone();
        // Forward in order, off the caller's task
        tokio::spawn(async move {
            while let Some(emit) = emit_rx.recv().await {
                match emit {
                    Emit::Candidate(c) => sink.ice_candidate(c).await,
                    Emit::RemoteTrack(kind) => sink.remote_track(kind).await,
                    Emit::Connection(state) => sink.connection_state(state).await,
                    Emit::Signaling(state) => sink.signaling_state(state).await,
                }
            }
        });
        Self {
            peer_id,
            state: Mutex::new(LoopbackState::default()),
            faults,
            emit_tx,
            candidate_port: AtomicU64::new(50000),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, emit: Emit) {
        let _ = self.emit_tx.send(emit);
    }

    fn transition(&self, state: &mut LoopbackState, next: SignalingState) {
        state.signaling = Some(next);
        self.emit(Emit::Signaling(next));
        if next == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && !state.connected
        {
            state.connected = true;
            self.emit(Emit::Connection(ConnectionState::Connecting));
            self.emit(Emit::Connection(ConnectionState::Connected));
        }
    }

    fn invalid(state: &LoopbackState, reason: &str) -> ConnectionError {
        ConnectionError::InvalidState {
            state: format!("{:?}", state.signaling()),
            reason: reason.to_string(),
        }
    }

    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub fn current_signaling_state(&self) -> SignalingState {
        self.lock().signaling()
    }

    /// Tracks currently attached to a sender.
    pub fn senders(&self) -> Vec<Track> {
        self.lock()
            .senders
            .iter()
            .filter_map(|(_, track)| track.clone())
            .collect()
    }

    /// What the sender of `kind` transmits; `None` when there is no sender
    /// or it is idle.
    pub fn sending(&self, kind: TrackKind) -> Option<Track> {
        self.lock()
            .senders
            .iter()
            .find(|(k, _)| *k == kind)
            .and_then(|(_, track)| track.clone())
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.lock().offers_created
    }

    pub fn replacements(&self) -> usize {
        self.lock().replacements
    }

    /// Calls to `rollback`, successful or not.
    pub fn rollback_attempts(&self) -> usize {
        self.lock().rollback_attempts
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Simulate the network dropping the connection.
    pub fn fail(&self) {
        self.emit(Emit::Connection(ConnectionState::Failed));
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_track(&self, track: &Track) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.senders.push((track.kind(), Some(track.clone())));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<&Track>) -> Result<bool, ConnectionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        let Some(slot) = state.senders.iter_mut().find(|(k, _)| *k == kind) else {
            return Ok(false);
        };
        slot.1 = track.cloned();
        state.replacements += 1;
        Ok(true)
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.offers_created += 1;
        let kinds: Vec<TrackKind> = state.senders.iter().map(|(kind, _)| *kind).collect();
        Ok(SessionDescription::offer(sdp_for(
            SdpKind::Offer,
            &self.peer_id,
            state.offers_created,
            &kinds,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let state = self.lock();
        if state.signaling() != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid(&state, "no remote offer to answer"));
        }
        let kinds: Vec<TrackKind> = state.senders.iter().map(|(kind, _)| *kind).collect();
        Ok(SessionDescription::answer(sdp_for(
            SdpKind::Answer,
            &self.peer_id,
            0,
            &kinds,
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        let next = match (desc.kind, state.signaling()) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            _ => return Err(Self::invalid(&state, "local description out of order")),
        };
        state.local = Some(desc);
        self.transition(&mut state, next);

        let port = self.candidate_port.fetch_add(1, Ordering::Relaxed);
        self.emit(Emit::Candidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if self
            .faults
            .fail_remote_descriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Self::invalid(&state, "injected failure"));
        }
        let next = match (desc.kind, state.signaling()) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            _ => return Err(Self::invalid(&state, "remote description out of order")),
        };
        for kind in tracks_in(&desc.sdp) {
            self.emit(Emit::RemoteTrack(kind));
        }
        state.remote = Some(desc);
        self.transition(&mut state, next);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        state.rollback_attempts += 1;
        if self.faults.fail_rollback.load(Ordering::SeqCst) {
            return Err(Self::invalid(&state, "injected rollback failure"));
        }
        match state.signaling() {
            SignalingState::HaveLocalOffer => state.local = None,
            SignalingState::HaveRemoteOffer => state.remote = None,
            _ => return Err(Self::invalid(&state, "nothing to roll back")),
        }
        self.transition(&mut state, SignalingState::Stable);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(Self::invalid(&state, "remote description not set"));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.current_signaling_state()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.signaling = Some(SignalingState::Closed);
        self.emit(Emit::Connection(ConnectionState::Closed));
        debug!("Loopback connection to {} closed", self.peer_id);
        Ok(())
    }
}

/// Factory that hands out `LoopbackConnection`s and remembers them.
#[derive(Default)]
pub struct LoopbackFactory {
    faults: Arc<LoopbackFaults>,
    created: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &LoopbackFaults {
        &self.faults
    }

    pub fn created(&self) -> Vec<Arc<LoopbackConnection>> {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Most recent connection created for `peer`.
    pub fn latest_for(&self, peer: &ParticipantId) -> Option<Arc<LoopbackConnection>> {
        self.created().into_iter().rev().find(|c| c.peer_id() == peer)
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let conn = Arc::new(LoopbackConnection::new(events, self.faults.clone()));
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn.clone());
        Ok(conn)
    }
}
