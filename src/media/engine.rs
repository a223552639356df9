use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionFactory, PeerConnection, PeerEvent, SignalingState};
use super::peer::{LinkTransition, NegotiationState, PeerLink, PeerLinkRegistry};
use super::source::{CaptureDevices, MediaTrackSource};
use super::{EngineCommand, EngineHandle, SessionState, Track};
use crate::config::EngineConfig;
use crate::error::{MediaError, NegotiationError, RelayError};
use crate::events::{EngineEvent, EventSender};
use crate::roster::{Roster, RosterEvent};
use crate::signal::{
    Announcement, IceCandidate, OutboundSignal, ParticipantId, SdpKind, SessionDescription,
    SignalEnvelope, SignalKind, SignalRelay,
};

/// External collaborators of one session.
#[derive(Clone)]
pub struct EngineDeps {
    pub relay: Arc<dyn SignalRelay>,
    pub roster: Arc<dyn Roster>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub capture: Arc<dyn CaptureDevices>,
}

/// Which local devices to ask for when joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Drives offer/answer negotiation with every other participant in one room.
pub struct NegotiationEngine {
    local_id: ParticipantId,
    registry: PeerLinkRegistry,
    relay: Arc<dyn SignalRelay>,
    roster: Arc<dyn Roster>,
    media: MediaTrackSource,
    config: EngineConfig,
    event_tx: EventSender,
    state_tx: watch::Sender<SessionState>,
    /// Highest relay sequence processed so far.
    last_sequence: Option<u64>,
    /// Other participants currently on the roster.
    present: HashSet<ParticipantId>,
    joined: bool,
}

/// Start an engine for `local_id` on its own task. The local participant
/// must already be on the roster.
pub fn spawn_engine(
    local_id: ParticipantId,
    deps: EngineDeps,
    config: EngineConfig,
    request: MediaRequest,
    event_tx: EventSender,
) -> (EngineHandle, JoinHandle<Result<(), NegotiationError>>) {
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
    let (state_tx, state_rx) = watch::channel(SessionState {
        local_id: Some(local_id.clone()),
        ..Default::default()
    });
    let (engine, peer_rx) = NegotiationEngine::new(local_id, deps, config, event_tx, state_tx);
    let task = tokio::spawn(engine.run(command_rx, peer_rx, request));
    (
        EngineHandle {
            command_tx,
            state_rx,
        },
        task,
    )
}

impl NegotiationEngine {
    pub fn new(
        local_id: ParticipantId,
        deps: EngineDeps,
        config: EngineConfig,
        event_tx: EventSender,
        state_tx: watch::Sender<SessionState>,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (peer_event_tx, peer_rx) = mpsc::channel(config.peer_event_buffer.max(1));
        let registry = PeerLinkRegistry::new(
            deps.connections,
            peer_event_tx,
            config.max_pending_candidates,
        );
        let engine = Self {
            local_id,
            registry,
            relay: deps.relay,
            roster: deps.roster,
            media: MediaTrackSource::new(deps.capture),
            config,
            event_tx,
            state_tx,
            last_sequence: None,
            present: HashSet::new(),
            joined: false,
        };
        (engine, peer_rx)
    }

    /// Join the room and process relay, roster, connection and command
    /// events until the session ends. Only a lost relay or roster stream is
    /// an error; per-peer failures are logged and contained.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<EngineCommand>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
        request: MediaRequest,
    ) -> Result<(), NegotiationError> {
        info!("Negotiation engine started for {}", self.local_id);

        let mut relay_rx = self.relay.subscribe().await?;
        let mut roster_rx = self.roster.watch().await?;
        if let Err(e) = self.join(request).await {
            error!("{} failed to join the room: {}", self.local_id, e);
            self.shutdown().await;
            return Err(e);
        }

        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let screen = self.media.screen_track().cloned();

            tokio::select! {
                envelope = relay_rx.recv() => match envelope {
                    Some(envelope) => {
                        if let Err(e) = self.handle_envelope(envelope).await {
                            warn!("Signal handling failed: {}", e);
                        }
                    }
                    None => {
                        error!("Relay stream closed, ending session");
                        break Err(NegotiationError::Relay(RelayError::Closed));
                    }
                },

                Some(event) = peer_rx.recv() => {
                    if let Err(e) = self.handle_peer_event(event).await {
                        warn!("Peer event handling failed: {}", e);
                    }
                }

                roster_event = roster_rx.recv() => match roster_event {
                    Some(RosterEvent::Removed(id)) if id == self.local_id => {
                        warn!("{} was removed from the room", self.local_id);
                        self.emit(EngineEvent::Evicted);
                        break Ok(());
                    }
                    Some(event) => self.handle_roster_event(event).await,
                    None => {
                        error!("Roster stream closed, ending session");
                        break Err(NegotiationError::Relay(RelayError::Closed));
                    }
                },

                command = command_rx.recv() => match command {
                    Some(EngineCommand::Leave) | None => {
                        info!("{} leaving the room", self.local_id);
                        if let Err(e) = self.roster.leave(&self.local_id).await {
                            warn!("Failed to leave roster: {}", e);
                        }
                        self.emit(EngineEvent::Left);
                        break Ok(());
                    }
                    Some(command) => self.handle_command(command).await,
                },

                _ = sweep.tick() => self.sweep_stalled().await,

                _ = screen_ended(screen) => {
                    info!("Screen capture ended externally, switching back to camera");
                    self.finish_screen_share().await;
                }
            }

            self.publish_state();
        };

        self.shutdown().await;
        outcome
    }

    async fn join(&mut self, request: MediaRequest) -> Result<(), NegotiationError> {
        for denied in self.media.acquire(request.audio, request.video).await {
            self.emit(EngineEvent::CaptureDenied {
                reason: denied.to_string(),
            });
        }

        let tracks = self.media.current_tracks();
        let announcement = Announcement {
            audio: tracks.audio.is_some(),
            video: tracks.video.is_some(),
        };
        self.send_signal(None, SignalKind::Announce, &announcement)
            .await?;

        self.present = self
            .roster
            .list()
            .await?
            .into_iter()
            .filter(|p| *p != self.local_id)
            .collect();
        self.joined = true;
        info!(
            "{} joined, {} participant(s) already present",
            self.local_id,
            self.present.len()
        );
        self.emit(EngineEvent::Joined {
            local_id: self.local_id.clone(),
        });

        let mut present: Vec<ParticipantId> = self.present.iter().cloned().collect();
        present.sort();
        for remote in present {
            if let Err(e) = self.discover(&remote).await {
                warn!("Failed to connect to {}: {}", remote, e);
            }
        }
        self.publish_state();
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.registry.close_all().await;
        self.media.stop_all();
        self.joined = false;
        self.publish_state();
        info!("Negotiation engine for {} stopped", self.local_id);
    }

    // --- Relay ---

    async fn handle_envelope(&mut self, envelope: SignalEnvelope) -> Result<(), NegotiationError> {
        if let Some(last) = self.last_sequence {
            if envelope.sequence <= last {
                debug!("Skipping redelivered envelope #{}", envelope.sequence);
                return Ok(());
            }
        }
        self.last_sequence = Some(envelope.sequence);

        if !envelope.is_for(&self.local_id) {
            return Ok(());
        }

        let from = envelope.from.clone();
        match envelope.kind {
            SignalKind::Announce => {
                // Replayed history still holds announcements of departed peers
                if !self.present.contains(&from) {
                    debug!("Ignoring announcement from {}, not in the room", from);
                    return Ok(());
                }
                debug!("{} announced presence", from);
                self.discover(&from).await
            }
            SignalKind::Offer => {
                let offer: SessionDescription = decode(&envelope)?;
                if offer.kind != SdpKind::Offer {
                    warn!("Offer envelope from {} carries an answer, ignoring", from);
                    return Ok(());
                }
                self.handle_offer(&from, offer).await
            }
            SignalKind::Answer => {
                let answer: SessionDescription = decode(&envelope)?;
                if answer.kind != SdpKind::Answer {
                    warn!("Answer envelope from {} carries an offer, ignoring", from);
                    return Ok(());
                }
                self.handle_answer(&from, answer).await
            }
            SignalKind::IceCandidate => {
                let candidate: IceCandidate = decode(&envelope)?;
                self.handle_remote_candidate(&from, candidate).await
            }
        }
    }

    async fn send_signal<T: Serialize>(
        &self,
        to: Option<&ParticipantId>,
        kind: SignalKind,
        payload: &T,
    ) -> Result<u64, NegotiationError> {
        let payload = serde_json::to_string(payload).map_err(RelayError::from)?;
        let sequence = self
            .relay
            .publish(OutboundSignal {
                from: self.local_id.clone(),
                to: to.cloned(),
                kind,
                payload,
            })
            .await?;
        Ok(sequence)
    }

    // --- Negotiation ---

    /// Apply the initiator rule to a newly seen participant.
    async fn discover(&mut self, remote: &ParticipantId) -> Result<(), NegotiationError> {
        if self.local_id.initiates_to(remote) {
            self.initiate(remote).await
        } else {
            debug!("Waiting for offer from {}", remote);
            Ok(())
        }
    }

    /// Open a link to `remote` and send it our offer. Does nothing while a
    /// link to `remote` is live.
    async fn initiate(&mut self, remote: &ParticipantId) -> Result<(), NegotiationError> {
        if self.registry.contains(remote) {
            debug!("Link to {} already exists, not initiating", remote);
            return Ok(());
        }

        let tracks = self.media.current_tracks();
        let connection = self
            .registry
            .get_or_create(remote, &tracks)
            .await
            .map_err(|e| NegotiationError::connection(remote, e))?
            .connection()
            .clone();

        if let Err(e) = self.send_offer(remote, &connection).await {
            self.drop_link(remote).await;
            return Err(e);
        }

        // The offer is committed and on the wire; answers that showed up
        // early can be applied now.
        let queued = match self.registry.get_mut(remote) {
            Some(link) => link.set_state(NegotiationState::Offering),
            None => return Ok(()),
        };
        info!("Sent offer to {}", remote);
        self.apply_queued_answers(remote, queued).await
    }

    async fn send_offer(
        &self,
        remote: &ParticipantId,
        connection: &Arc<dyn PeerConnection>,
    ) -> Result<(), NegotiationError> {
        let offer = connection
            .create_offer()
            .await
            .map_err(|e| NegotiationError::connection(remote, e))?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::connection(remote, e))?;
        self.send_signal(Some(remote), SignalKind::Offer, &offer)
            .await?;
        Ok(())
    }

    async fn handle_offer(
        &mut self,
        from: &ParticipantId,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        match self.registry.get(from).map(PeerLink::state) {
            Some(NegotiationState::Answering | NegotiationState::Stable | NegotiationState::Closed) => {
                debug!("Ignoring duplicate offer from {}", from);
                return Ok(());
            }
            Some(NegotiationState::Offering) => {
                if self.local_id.initiates_to(from) {
                    info!("Offer from {} crossed ours, keeping our offer", from);
                    return Ok(());
                }
                info!("Offer from {} crossed ours, rolling back", from);
                let Some(connection) = self.registry.get(from).map(|l| l.connection().clone()) else {
                    return Ok(());
                };
                if let Err(e) = connection.rollback().await {
                    self.drop_link(from).await;
                    return Err(NegotiationError::connection(from, e));
                }
                if let Some(link) = self.registry.get_mut(from) {
                    link.set_state(NegotiationState::Idle);
                }
            }
            Some(NegotiationState::Idle) | None => {}
        }

        let tracks = self.media.current_tracks();
        let connection = self
            .registry
            .get_or_create(from, &tracks)
            .await
            .map_err(|e| NegotiationError::connection(from, e))?
            .connection()
            .clone();

        if let Err(e) = self.answer_offer(from, &connection, offer).await {
            self.drop_link(from).await;
            return Err(e);
        }
        Ok(())
    }

    async fn answer_offer(
        &mut self,
        from: &ParticipantId,
        connection: &Arc<dyn PeerConnection>,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        connection
            .set_remote_description(offer)
            .await
            .map_err(|e| NegotiationError::connection(from, e))?;

        let candidates = match self.registry.get_mut(from) {
            Some(link) => {
                link.set_state(NegotiationState::Answering);
                link.mark_remote_description()
            }
            None => return Ok(()),
        };
        add_candidates(from, connection, candidates).await;

        let answer = connection
            .create_answer()
            .await
            .map_err(|e| NegotiationError::connection(from, e))?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| NegotiationError::connection(from, e))?;
        self.send_signal(Some(from), SignalKind::Answer, &answer)
            .await?;

        if let Some(link) = self.registry.get_mut(from) {
            link.set_state(NegotiationState::Stable);
        }
        info!("Answered offer from {}", from);
        Ok(())
    }

    async fn handle_answer(
        &mut self,
        from: &ParticipantId,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        match self.registry.get(from).map(PeerLink::state) {
            Some(NegotiationState::Offering) => self.apply_answer(from, answer).await,
            Some(NegotiationState::Stable | NegotiationState::Closed) => {
                debug!("Ignoring answer from {}, one was already applied", from);
                Ok(())
            }
            None | Some(NegotiationState::Idle | NegotiationState::Answering) => {
                debug!("Answer from {} arrived before our offer was committed, queueing", from);
                self.registry.queue_answer(from, answer);
                Ok(())
            }
        }
    }

    async fn apply_queued_answers(
        &mut self,
        from: &ParticipantId,
        answers: Vec<SessionDescription>,
    ) -> Result<(), NegotiationError> {
        for answer in answers {
            if self.registry.get(from).map(PeerLink::state) != Some(NegotiationState::Offering) {
                debug!("Dropping surplus queued answer from {}", from);
                continue;
            }
            self.apply_answer(from, answer).await?;
        }
        Ok(())
    }

    /// Set `answer` as the remote description. A rejected answer gets one
    /// retry after rolling back; a second rejection tears the link down.
    async fn apply_answer(
        &mut self,
        from: &ParticipantId,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(connection) = self.registry.get(from).map(|l| l.connection().clone()) else {
            return Ok(());
        };

        if let Err(first) = connection.set_remote_description(answer.clone()).await {
            warn!("Answer from {} rejected ({}), retrying", from, first);
            // An answer only applies on top of our own offer: revert
            // anything else that is in progress, but keep that offer.
            if connection.signaling_state() != SignalingState::HaveLocalOffer {
                if let Err(e) = connection.rollback().await {
                    warn!("Rollback with {} failed: {}", from, e);
                }
            }
            if let Err(second) = connection.set_remote_description(answer).await {
                error!("Answer from {} rejected again ({}), dropping link", from, second);
                self.drop_link(from).await;
                return Err(NegotiationError::Unrecoverable(from.clone()));
            }
        }

        let candidates = match self.registry.get_mut(from) {
            Some(link) => {
                link.set_state(NegotiationState::Stable);
                link.mark_remote_description()
            }
            None => return Ok(()),
        };
        add_candidates(from, &connection, candidates).await;
        info!("Applied answer from {}", from);
        Ok(())
    }

    async fn handle_remote_candidate(
        &mut self,
        from: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let ready = self
            .registry
            .get(from)
            .filter(|l| l.has_remote_description())
            .map(|l| l.connection().clone());
        match ready {
            Some(connection) => connection
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| NegotiationError::connection(from, e)),
            None => {
                debug!("Holding early ICE candidate from {}", from);
                self.registry.queue_candidate(from, candidate);
                Ok(())
            }
        }
    }

    async fn drop_link(&mut self, peer: &ParticipantId) {
        if self.registry.remove(peer).await.is_some() {
            self.emit(EngineEvent::PeerDisconnected {
                peer_id: peer.clone(),
            });
        }
    }

    async fn sweep_stalled(&mut self) {
        let timeout = self.config.negotiation_timeout();
        for peer in self.registry.stalled(Instant::now(), timeout) {
            warn!("Negotiation with {} timed out after {:?}", peer, timeout);
            self.drop_link(&peer).await;
        }
    }

    // --- Connection events ---

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), NegotiationError> {
        let peer_id = event.peer_id().clone();
        // Closing a link still reports Closed after it is gone
        if !self.registry.is_current(&peer_id, event.link_id()) {
            debug!("Ignoring event from stale link {} to {}", event.link_id(), peer_id);
            return Ok(());
        }

        match event {
            PeerEvent::IceCandidate { candidate, .. } => {
                self.send_signal(Some(&peer_id), SignalKind::IceCandidate, &candidate)
                    .await?;
            }
            PeerEvent::RemoteTrack { kind, .. } => {
                info!("Receiving {:?} from {}", kind, peer_id);
                self.emit(EngineEvent::RemoteTrack { peer_id, kind });
            }
            PeerEvent::ConnectionStateChanged { link_id, state, .. } => {
                match self.registry.on_connection_state(&peer_id, link_id, state).await {
                    LinkTransition::Connected => {
                        info!("Connected to {}", peer_id);
                        self.emit(EngineEvent::PeerConnected { peer_id });
                    }
                    LinkTransition::Removed => {
                        info!("Connection to {} ended ({:?})", peer_id, state);
                        self.emit(EngineEvent::PeerDisconnected { peer_id });
                    }
                    LinkTransition::Ignored => {}
                }
            }
            PeerEvent::SignalingStateChanged { state, .. } => {
                if state == SignalingState::HaveLocalOffer {
                    let queued = self
                        .registry
                        .get_mut(&peer_id)
                        .map(|link| link.take_pending_answers())
                        .unwrap_or_default();
                    self.apply_queued_answers(&peer_id, queued).await?;
                }
            }
        }
        Ok(())
    }

    // --- Roster ---

    async fn handle_roster_event(&mut self, event: RosterEvent) {
        match event {
            RosterEvent::Added(id) => {
                if id == self.local_id {
                    return;
                }
                self.present.insert(id.clone());
                if let Err(e) = self.discover(&id).await {
                    warn!("Failed to connect to {}: {}", id, e);
                }
            }
            RosterEvent::Removed(id) => {
                self.present.remove(&id);
                if self.registry.contains(&id) {
                    info!("{} left the room, closing link", id);
                }
                self.drop_link(&id).await;
            }
        }
    }

    // --- Commands ---

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetAudioEnabled(enabled) => {
                info!("Audio {}", if enabled { "enabled" } else { "muted" });
                self.media.set_audio_enabled(enabled);
            }
            EngineCommand::SetVideoEnabled(enabled) => {
                info!("Camera {}", if enabled { "enabled" } else { "disabled" });
                self.media.set_video_enabled(enabled);
            }
            EngineCommand::StartScreenShare { reply } => {
                let result = match self.media.start_screen_share().await {
                    Ok(track) => {
                        self.registry.replace_outgoing_video(Some(&track)).await;
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Screen share unavailable: {}", e);
                        self.emit(EngineEvent::CaptureDenied {
                            reason: e.to_string(),
                        });
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            EngineCommand::StopScreenShare => self.finish_screen_share().await,
            EngineCommand::Connect { peer_id } => {
                if peer_id == self.local_id {
                    return;
                }
                info!("Manual connect to {}", peer_id);
                if let Err(e) = self.initiate(&peer_id).await {
                    warn!("Failed to connect to {}: {}", peer_id, e);
                }
            }
            // Handled by the loop
            EngineCommand::Leave => {}
        }
    }

    /// Stop sharing and put the camera (or nothing) back on every link.
    async fn finish_screen_share(&mut self) {
        match self.media.stop_screen_share() {
            Ok(camera) => {
                self.registry.replace_outgoing_video(camera.as_ref()).await;
                self.emit(EngineEvent::ScreenShareEnded);
            }
            Err(MediaError::NotSharing) => debug!("Not sharing the screen"),
            Err(e) => warn!("Failed to stop screen share: {}", e),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish_state(&self) {
        let next = SessionState {
            local_id: Some(self.local_id.clone()),
            joined: self.joined,
            links: self.registry.summaries(),
            audio_enabled: self.media.audio_enabled(),
            video_enabled: self.media.video_enabled(),
            screen_sharing: self.media.is_screen_sharing(),
        };
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn decode<T: DeserializeOwned>(envelope: &SignalEnvelope) -> Result<T, NegotiationError> {
    serde_json::from_str(&envelope.payload).map_err(|source| NegotiationError::Payload {
        peer: envelope.from.clone(),
        kind: envelope.kind.as_str(),
        source,
    })
}

async fn add_candidates(
    peer: &ParticipantId,
    connection: &Arc<dyn PeerConnection>,
    candidates: Vec<IceCandidate>,
) {
    if !candidates.is_empty() {
        debug!("Applying {} held ICE candidate(s) from {}", candidates.len(), peer);
    }
    for candidate in candidates {
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from {}: {}", peer, e);
        }
    }
}

async fn screen_ended(track: Option<Track>) {
    match track {
        Some(track) => track.ended().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::events::create_event_bus;
    use crate::media::loopback::LoopbackFactory;
    use crate::media::source::{CapturedMedia, SyntheticCapture};
    use crate::media::OutgoingTracks;
    use crate::roster::MemoryRoster;
    use crate::signal::MemoryRelay;

    struct BrokenRoster;

    #[async_trait::async_trait]
    impl Roster for BrokenRoster {
        async fn list(&self) -> Result<Vec<ParticipantId>, RelayError> {
            Err(RelayError::Closed)
        }

        async fn watch(&self) -> Result<mpsc::UnboundedReceiver<RosterEvent>, RelayError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn leave(&self, _participant: &ParticipantId) -> Result<(), RelayError> {
            Ok(())
        }
    }

    /// Remembers every track it hands out.
    #[derive(Default)]
    struct RecordingCapture {
        inner: SyntheticCapture,
        handed_out: std::sync::Mutex<Vec<Track>>,
    }

    #[async_trait::async_trait]
    impl CaptureDevices for RecordingCapture {
        async fn acquire_camera_and_mic(&self, want_audio: bool, want_video: bool) -> CapturedMedia {
            let captured = self.inner.acquire_camera_and_mic(want_audio, want_video).await;
            let mut handed_out = self.handed_out.lock().unwrap();
            handed_out.extend(captured.audio.iter().cloned());
            handed_out.extend(captured.video.iter().cloned());
            captured
        }

        async fn acquire_screen(&self) -> Result<Track, MediaError> {
            self.inner.acquire_screen().await
        }
    }

    async fn start(
        local: &str,
        relay: &MemoryRelay,
        roster: &MemoryRoster,
    ) -> (EngineHandle, Arc<LoopbackFactory>) {
        roster.join(local.into()).await;
        let factory = Arc::new(LoopbackFactory::new());
        let deps = EngineDeps {
            relay: Arc::new(relay.clone()),
            roster: Arc::new(roster.clone()),
            connections: factory.clone(),
            capture: Arc::new(SyntheticCapture::new()),
        };
        let (event_tx, _) = create_event_bus();
        let (handle, _task) = spawn_engine(
            local.into(),
            deps,
            EngineConfig::default(),
            MediaRequest::default(),
            event_tx,
        );
        let mut state_rx = handle.state_rx.clone();
        tokio::time::timeout(Duration::from_secs(2), state_rx.wait_for(|s| s.joined))
            .await
            .unwrap()
            .unwrap();
        (handle, factory)
    }

    #[tokio::test]
    async fn malformed_payload_does_not_stop_the_loop() {
        let relay = MemoryRelay::new();
        let roster = MemoryRoster::new();
        let (handle, factory) = start("b", &relay, &roster).await;

        relay
            .publish(OutboundSignal {
                from: "a".into(),
                to: Some("b".into()),
                kind: SignalKind::Offer,
                payload: "not json".into(),
            })
            .await
            .unwrap();
        roster.join("a".into()).await;

        let mut state_rx = handle.state_rx.clone();
        tokio::time::timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|s| s.links.len() == 1),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(factory.created().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_envelopes_are_processed_once() {
        let relay = MemoryRelay::new();
        let deps = EngineDeps {
            relay: Arc::new(relay.clone()),
            roster: Arc::new(MemoryRoster::new()),
            connections: Arc::new(LoopbackFactory::new()),
            capture: Arc::new(SyntheticCapture::new()),
        };
        let (event_tx, _) = create_event_bus();
        let (state_tx, _state_rx) = watch::channel(SessionState::default());
        let (mut engine, _peer_rx) =
            NegotiationEngine::new("a".into(), deps, EngineConfig::default(), event_tx, state_tx);

        let offer = SessionDescription::offer("v=0\r\na=tracks:audio\r\n");
        let envelope = SignalEnvelope {
            from: "b".into(),
            to: Some("a".into()),
            kind: SignalKind::Offer,
            payload: serde_json::to_string(&offer).unwrap(),
            sequence: 7,
            created_at: Utc::now(),
        };
        engine.handle_envelope(envelope.clone()).await.unwrap();
        engine.handle_envelope(envelope).await.unwrap();

        let history = relay.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, SignalKind::Answer);
        assert_eq!(engine.last_sequence, Some(7));
        assert_eq!(
            engine.registry.get(&"b".into()).map(PeerLink::state),
            Some(NegotiationState::Stable)
        );
    }

    #[tokio::test]
    async fn answer_outside_local_offer_rolls_back_before_retry() {
        let factory = Arc::new(LoopbackFactory::new());
        let deps = EngineDeps {
            relay: Arc::new(MemoryRelay::new()),
            roster: Arc::new(MemoryRoster::new()),
            connections: factory.clone(),
            capture: Arc::new(SyntheticCapture::new()),
        };
        let (event_tx, mut events) = create_event_bus();
        let (state_tx, _state_rx) = watch::channel(SessionState::default());
        let (mut engine, _peer_rx) =
            NegotiationEngine::new("b".into(), deps, EngineConfig::default(), event_tx, state_tx);

        // The link thinks it offered, but the connection holds a remote offer
        let peer = ParticipantId::from("a");
        engine
            .registry
            .get_or_create(&peer, &OutgoingTracks::default())
            .await
            .unwrap()
            .set_state(NegotiationState::Offering);
        let conn = factory.latest_for(&peer).unwrap();
        conn.set_remote_description(SessionDescription::offer("v=0\r\na=tracks:audio\r\n"))
            .await
            .unwrap();

        let err = engine
            .handle_answer(&peer, SessionDescription::answer("v=0\r\na=tracks:audio\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Unrecoverable(ref id) if *id == peer));
        assert_eq!(conn.rollback_attempts(), 1);
        assert!(conn.is_closed());
        assert!(engine.registry.is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::PeerDisconnected { peer_id: peer }
        );
    }

    #[tokio::test]
    async fn failed_join_releases_local_media() {
        let relay = MemoryRelay::new();
        let capture = Arc::new(RecordingCapture::default());
        let deps = EngineDeps {
            relay: Arc::new(relay.clone()),
            roster: Arc::new(BrokenRoster),
            connections: Arc::new(LoopbackFactory::new()),
            capture: capture.clone(),
        };
        let (event_tx, _) = create_event_bus();
        let (handle, task) = spawn_engine(
            "a".into(),
            deps,
            EngineConfig::default(),
            MediaRequest::default(),
            event_tx,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(NegotiationError::Relay(RelayError::Closed))));
        // The announcement went out before the roster failed
        assert_eq!(relay.history().await[0].kind, SignalKind::Announce);

        let tracks = capture.handed_out.lock().unwrap().clone();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(Track::is_stopped));
        assert!(!handle.state().joined);
    }
}
