#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshlink::config::EngineConfig;
use meshlink::error::NegotiationError;
use meshlink::events::{create_event_bus, EngineEvent, EventReceiver};
use meshlink::media::engine::{spawn_engine, EngineDeps, MediaRequest};
use meshlink::media::loopback::{LoopbackConnection, LoopbackFactory};
use meshlink::media::source::SyntheticCapture;
use meshlink::media::{EngineHandle, SessionState};
use meshlink::roster::MemoryRoster;
use meshlink::signal::{
    IceCandidate, MemoryRelay, OutboundSignal, ParticipantId, SessionDescription, SignalKind,
    SignalRelay,
};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestPeer {
    pub id: ParticipantId,
    pub handle: EngineHandle,
    pub factory: Arc<LoopbackFactory>,
    pub events: EventReceiver,
    pub task: JoinHandle<Result<(), NegotiationError>>,
}

impl TestPeer {
    pub async fn wait_for(&self, mut f: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut rx = self.handle.state_rx.clone();
        let state = tokio::time::timeout(WAIT, rx.wait_for(|s| f(s)))
            .await
            .expect("timed out waiting for session state")
            .expect("engine stopped");
        state.clone()
    }

    pub async fn wait_stable(&self, links: usize) -> SessionState {
        self.wait_for(|s| s.stable_links() == links && s.links.iter().all(|l| l.connected))
            .await
    }

    /// Next event matching `f`, skipping the rest.
    pub async fn expect_event(&mut self, mut f: impl FnMut(&EngineEvent) -> bool) -> EngineEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event bus closed");
                if f(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub fn connection_to(&self, peer: &str) -> Arc<LoopbackConnection> {
        self.factory
            .latest_for(&peer.into())
            .expect("no connection to peer")
    }
}

/// One room on an in-process relay and roster.
#[derive(Clone, Default)]
pub struct TestRoom {
    pub relay: MemoryRelay,
    pub roster: MemoryRoster,
}

impl TestRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to the roster and start its engine.
    pub async fn join(&self, id: &str) -> TestPeer {
        self.join_with(id, SyntheticCapture::new(), EngineConfig::default())
            .await
    }

    pub async fn join_with(
        &self,
        id: &str,
        capture: SyntheticCapture,
        config: EngineConfig,
    ) -> TestPeer {
        self.roster.join(id.into()).await;
        let peer = self.start(id, capture, config);
        peer.wait_for(|s| s.joined).await;
        peer
    }

    /// Start an engine for a participant already on the roster.
    pub fn start(&self, id: &str, capture: SyntheticCapture, config: EngineConfig) -> TestPeer {
        let factory = Arc::new(LoopbackFactory::new());
        let deps = EngineDeps {
            relay: Arc::new(self.relay.clone()),
            roster: Arc::new(self.roster.clone()),
            connections: factory.clone(),
            capture: Arc::new(capture),
        };
        let (event_tx, events) = create_event_bus();
        let (handle, task) = spawn_engine(
            id.into(),
            deps,
            config,
            MediaRequest::default(),
            event_tx,
        );
        TestPeer {
            id: id.into(),
            handle,
            factory,
            events,
            task,
        }
    }

    /// Publish as a participant that has no engine.
    pub async fn send_as(&self, from: &str, to: &str, kind: SignalKind, payload: String) {
        self.relay
            .publish(OutboundSignal {
                from: from.into(),
                to: Some(to.into()),
                kind,
                payload,
            })
            .await
            .unwrap();
    }

    pub async fn send_offer(&self, from: &str, to: &str) {
        let offer = SessionDescription::offer("v=0\r\na=tracks:audio,video\r\n");
        self.send_as(from, to, SignalKind::Offer, serde_json::to_string(&offer).unwrap())
            .await;
    }

    pub async fn send_answer(&self, from: &str, to: &str) {
        let answer = SessionDescription::answer("v=0\r\na=tracks:audio,video\r\n");
        self.send_as(from, to, SignalKind::Answer, serde_json::to_string(&answer).unwrap())
            .await;
    }

    pub async fn send_candidate(&self, from: &str, to: &str, candidate: &IceCandidate) {
        self.send_as(from, to, SignalKind::IceCandidate, serde_json::to_string(candidate).unwrap())
            .await;
    }

    /// Envelopes of `kind` sent by `from`, to anyone when `to` is `None`.
    pub async fn count(&self, kind: SignalKind, from: &str, to: Option<&str>) -> usize {
        self.relay
            .history()
            .await
            .iter()
            .filter(|e| e.kind == kind && e.from.as_str() == from)
            .filter(|e| match to {
                Some(to) => e.to.as_ref().map(|t| t.as_str()) == Some(to),
                None => true,
            })
            .count()
    }

    pub async fn total(&self, kind: SignalKind) -> usize {
        self.relay
            .history()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

/// Let queued events drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
