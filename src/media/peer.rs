use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::{
    ConnectionFactory, ConnectionState, LinkId, PeerConnection, PeerEvent, PeerEventSink,
};
use super::{LinkSummary, OutgoingTracks, Track, TrackKind};
use crate::error::ConnectionError;
use crate::signal::{IceCandidate, ParticipantId, SessionDescription};

/// Per-link negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Stable,
    Closed,
}

/// One direct connection to one remote participant.
pub struct PeerLink {
    remote_id: ParticipantId,
    link_id: LinkId,
    connection: Arc<dyn PeerConnection>,
    state: NegotiationState,
    pending_answers: VecDeque<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    outgoing: OutgoingTracks,
    remote_description_set: bool,
    connected: bool,
    created_at: Instant,
}

impl PeerLink {
    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn outgoing(&self) -> &OutgoingTracks {
        &self.outgoing
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn pending_answers(&self) -> usize {
        self.pending_answers.len()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Move to `next`. Entering `Offering` means the local offer is
    /// committed, so every queued answer is handed back, oldest first.
    pub fn set_state(&mut self, next: NegotiationState) -> Vec<SessionDescription> {
        if self.state != next {
            debug!(
                "Link {} to {}: {:?} -> {:?}",
                self.link_id, self.remote_id, self.state, next
            );
        }
        self.state = next;
        if next == NegotiationState::Offering {
            self.pending_answers.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Answers already queued while in `Offering` (delivered during the
    /// offer's own publish).
    pub fn take_pending_answers(&mut self) -> Vec<SessionDescription> {
        if self.state == NegotiationState::Offering {
            self.pending_answers.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    fn queue_answer(&mut self, answer: SessionDescription, max: usize) {
        push_bounded(&mut self.pending_answers, answer, max, &self.remote_id, "answers");
    }

    /// Record that a remote description is in place and hand back the
    /// candidates that were waiting for it.
    pub fn mark_remote_description(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending_candidates.drain(..).collect()
    }

    fn queue_candidate(&mut self, candidate: IceCandidate, max: usize) {
        push_bounded(&mut self.pending_candidates, candidate, max, &self.remote_id, "ICE candidates");
    }

    fn summary(&self) -> LinkSummary {
        LinkSummary {
            peer_id: self.remote_id.clone(),
            state: self.state,
            connected: self.connected,
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, max: usize, peer: &ParticipantId, what: &str) {
    if queue.len() >= max.max(1) {
        warn!("Too many early {} from {}, dropping oldest", what, peer);
        queue.pop_front();
    }
    queue.push_back(item);
}

/// What a connection-state report did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    /// Stale link, unknown peer, or nothing worth reporting.
    Ignored,
    Connected,
    Removed,
}

/// Owns every `PeerLink`, keyed by remote participant.
pub struct PeerLinkRegistry {
    factory: Arc<dyn ConnectionFactory>,
    event_tx: mpsc::Sender<PeerEvent>,
    links: HashMap<ParticipantId, PeerLink>,
    early_answers: HashMap<ParticipantId, VecDeque<SessionDescription>>,
    early_candidates: HashMap<ParticipantId, VecDeque<IceCandidate>>,
    next_link_id: u64,
    /// Bound on every per-peer queue of early answers or candidates.
    max_pending: usize,
}

impl PeerLinkRegistry {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        event_tx: mpsc::Sender<PeerEvent>,
        max_pending: usize,
    ) -> Self {
        Self {
            factory,
            event_tx,
            links: HashMap::new(),
            early_answers: HashMap::new(),
            early_candidates: HashMap::new(),
            next_link_id: 0,
            max_pending,
        }
    }

    /// Return the live link to `remote`, creating it first if needed. A new
    /// link gets its connection wired to the event channel and starts out
    /// transmitting `tracks`. Calling again for a live link does nothing.
    pub async fn get_or_create(
        &mut self,
        remote: &ParticipantId,
        tracks: &OutgoingTracks,
    ) -> Result<&mut PeerLink, ConnectionError> {
        match self.links.entry(remote.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                self.next_link_id += 1;
                let link_id = LinkId(self.next_link_id);
                let sink = PeerEventSink::new(remote.clone(), link_id, self.event_tx.clone());
                let connection = self.factory.create(sink).await?;

                for track in tracks.iter() {
                    if let Err(e) = connection.add_track(track).await {
                        warn!("Failed to attach {:?} track for {}: {}", track.kind(), remote, e);
                    }
                }

                let pending_answers = self.early_answers.remove(remote).unwrap_or_default();
                let pending_candidates = self.early_candidates.remove(remote).unwrap_or_default();
                if !pending_answers.is_empty() || !pending_candidates.is_empty() {
                    debug!(
                        "Link {} to {} adopts {} early answer(s), {} early candidate(s)",
                        link_id,
                        remote,
                        pending_answers.len(),
                        pending_candidates.len()
                    );
                }

                info!("Created link {} to {}", link_id, remote);
                Ok(entry.insert(PeerLink {
                    remote_id: remote.clone(),
                    link_id,
                    connection,
                    state: NegotiationState::Idle,
                    pending_answers,
                    pending_candidates,
                    outgoing: tracks.clone(),
                    remote_description_set: false,
                    connected: false,
                    created_at: Instant::now(),
                }))
            }
        }
    }

    pub fn get(&self, remote: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    pub fn get_mut(&mut self, remote: &ParticipantId) -> Option<&mut PeerLink> {
        self.links.get_mut(remote)
    }

    pub fn contains(&self, remote: &ParticipantId) -> bool {
        self.links.contains_key(remote)
    }

    /// Whether `link_id` is still the live link to `remote`.
    pub fn is_current(&self, remote: &ParticipantId, link_id: LinkId) -> bool {
        self.links
            .get(remote)
            .map(|l| l.link_id == link_id)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn summaries(&self) -> Vec<LinkSummary> {
        let mut rows: Vec<LinkSummary> = self.links.values().map(PeerLink::summary).collect();
        rows.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        rows
    }

    /// Close and forget the link to `remote`. Absent ids are a no-op.
    pub async fn remove(&mut self, remote: &ParticipantId) -> Option<PeerLink> {
        self.early_answers.remove(remote);
        self.early_candidates.remove(remote);
        let mut link = self.links.remove(remote)?;
        link.state = NegotiationState::Closed;
        if let Err(e) = link.connection.close().await {
            warn!("Error closing peer connection to {}: {}", remote, e);
        }
        info!("Closed link {} to {}", link.link_id, remote);
        Some(link)
    }

    /// Queue an answer that cannot be applied yet. Without a link it waits
    /// for the link to be created.
    pub fn queue_answer(&mut self, remote: &ParticipantId, answer: SessionDescription) {
        let max = self.max_pending;
        match self.links.get_mut(remote) {
            Some(link) => link.queue_answer(answer, max),
            None => push_bounded(
                self.early_answers.entry(remote.clone()).or_default(),
                answer,
                max,
                remote,
                "answers",
            ),
        }
    }

    /// Queue a candidate until the link has a remote description.
    pub fn queue_candidate(&mut self, remote: &ParticipantId, candidate: IceCandidate) {
        let max = self.max_pending;
        match self.links.get_mut(remote) {
            Some(link) => link.queue_candidate(candidate, max),
            None => push_bounded(
                self.early_candidates.entry(remote.clone()).or_default(),
                candidate,
                max,
                remote,
                "ICE candidates",
            ),
        }
    }

    /// Apply a connection-state report. Terminal states remove the link;
    /// this is the only way a link tears itself down.
    pub async fn on_connection_state(
        &mut self,
        remote: &ParticipantId,
        link_id: LinkId,
        state: ConnectionState,
    ) -> LinkTransition {
        if !self.is_current(remote, link_id) {
            debug!("Ignoring {:?} from stale link {} to {}", state, link_id, remote);
            return LinkTransition::Ignored;
        }
        if state.is_terminal() {
            self.remove(remote).await;
            return LinkTransition::Removed;
        }
        match (state, self.links.get_mut(remote)) {
            (ConnectionState::Connected, Some(link)) if !link.connected => {
                link.connected = true;
                LinkTransition::Connected
            }
            _ => LinkTransition::Ignored,
        }
    }

    /// Swap the outgoing video on every live link without renegotiating.
    /// Links with no video sender get one added. Returns how many links
    /// now carry `video`.
    pub async fn replace_outgoing_video(&mut self, video: Option<&Track>) -> usize {
        let mut updated = 0;
        for link in self.links.values_mut() {
            let replaced = match link.connection.replace_track(TrackKind::Video, video).await {
                Ok(true) => Ok(()),
                Ok(false) => match video {
                    Some(track) => link.connection.add_track(track).await,
                    None => Ok(()),
                },
                Err(e) => Err(e),
            };
            match replaced {
                Ok(()) => {
                    link.outgoing.video = video.cloned();
                    updated += 1;
                }
                Err(e) => warn!("Failed to switch video for {}: {}", link.remote_id, e),
            }
        }
        debug!("Outgoing video switched on {} link(s)", updated);
        updated
    }

    /// Links that have been negotiating for longer than `timeout`.
    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        self.links
            .values()
            .filter(|l| {
                l.state != NegotiationState::Stable
                    && now.saturating_duration_since(l.created_at) >= timeout
            })
            .map(|l| l.remote_id.clone())
            .collect()
    }

    /// Close every link. Used when leaving the room.
    pub async fn close_all(&mut self) {
        let ids: Vec<ParticipantId> = self.links.keys().cloned().collect();
        for id in ids {
            self.remove(&id).await;
        }
        self.early_answers.clear();
        self.early_candidates.clear();
    }
}
