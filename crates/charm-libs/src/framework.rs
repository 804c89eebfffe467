//! Event bus between the host runtime and the library components
//!
//! The host delivers [`HostEvent`]s one at a time through
//! [`Framework::dispatch`]; every observer interested in the event's kind is
//! awaited to completion, in registration order, before dispatch returns.
//! Components report outward through an [`EventEmitter`] and the charm drains
//! those [`LibraryEvent`]s with [`Framework::take_events`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::certs::protocol::{CertificateAvailable, CertificateExpiring, CertificateInvalidated};

/// Events delivered by the host runtime
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Install,
    ConfigChanged,
    UpgradeCharm,
    UpdateStatus,
    LeaderElected,
    /// A workload container became reachable
    PebbleReady { container: String },
    RelationJoined { relation: String },
    RelationChanged { relation: String },
    RelationBroken { relation: String },
    CertificateAvailable(CertificateAvailable),
    CertificateExpiring(CertificateExpiring),
    CertificateInvalidated(CertificateInvalidated),
    AllCertificatesInvalidated,
}

/// Kind of a [`HostEvent`], used to register interest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    ConfigChanged,
    UpgradeCharm,
    UpdateStatus,
    LeaderElected,
    PebbleReady(String),
    RelationJoined(String),
    RelationChanged(String),
    RelationBroken(String),
    CertificateAvailable,
    CertificateExpiring,
    CertificateInvalidated,
    AllCertificatesInvalidated,
}

impl HostEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HostEvent::Install => EventKind::Install,
            HostEvent::ConfigChanged => EventKind::ConfigChanged,
            HostEvent::UpgradeCharm => EventKind::UpgradeCharm,
            HostEvent::UpdateStatus => EventKind::UpdateStatus,
            HostEvent::LeaderElected => EventKind::LeaderElected,
            HostEvent::PebbleReady { container } => EventKind::PebbleReady(container.clone()),
            HostEvent::RelationJoined { relation } => EventKind::RelationJoined(relation.clone()),
            HostEvent::RelationChanged { relation } => EventKind::RelationChanged(relation.clone()),
            HostEvent::RelationBroken { relation } => EventKind::RelationBroken(relation.clone()),
            HostEvent::CertificateAvailable(_) => EventKind::CertificateAvailable,
            HostEvent::CertificateExpiring(_) => EventKind::CertificateExpiring,
            HostEvent::CertificateInvalidated(_) => EventKind::CertificateInvalidated,
            HostEvent::AllCertificatesInvalidated => EventKind::AllCertificatesInvalidated,
        }
    }

    pub fn relation_joined(relation: impl Into<String>) -> Self {
        HostEvent::RelationJoined {
            relation: relation.into(),
        }
    }

    pub fn relation_changed(relation: impl Into<String>) -> Self {
        HostEvent::RelationChanged {
            relation: relation.into(),
        }
    }

    pub fn relation_broken(relation: impl Into<String>) -> Self {
        HostEvent::RelationBroken {
            relation: relation.into(),
        }
    }
}

/// Events emitted by library components towards the charm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryEvent {
    /// The compute-resources patch could not be applied
    PatchFailed { message: String },
    /// Certificate material changed; re-read it from the handler
    CertChanged,
}

/// Sending side of the library event queue
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: UnboundedSender<LibraryEvent>,
}

impl EventEmitter {
    pub fn emit(&self, event: LibraryEvent) {
        trace!(event = ?event, "Emitting library event");
        if self.tx.send(event).is_err() {
            debug!("Library event dropped, framework already torn down");
        }
    }

    /// An emitter paired with its own receiver, for components used standalone
    pub fn channel() -> (Self, UnboundedReceiver<LibraryEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

/// A component reacting to host events
#[async_trait]
pub trait Observer: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Kinds of events this observer wants to receive
    fn observed_events(&self) -> Vec<EventKind>;

    /// Handle one event; failures are reported through emitted events
    async fn handle(&mut self, event: &HostEvent);
}

type SharedObserver = Arc<Mutex<dyn Observer>>;

/// Callback registry with an explicit lifecycle:
/// construct, observe, dispatch, teardown
pub struct Framework {
    observers: Vec<(Vec<EventKind>, SharedObserver)>,
    emitter: EventEmitter,
    events: UnboundedReceiver<LibraryEvent>,
}

impl Default for Framework {
    fn default() -> Self {
        Self::new()
    }
}

impl Framework {
    pub fn new() -> Self {
        let (emitter, events) = EventEmitter::channel();
        Self {
            observers: Vec::new(),
            emitter,
            events,
        }
    }

    /// Emitter to hand to components at construction
    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    /// Register an observer; the returned handle gives the charm access to it
    pub fn observe<O>(&mut self, observer: O) -> Arc<Mutex<O>>
    where
        O: Observer + 'static,
    {
        let kinds = observer.observed_events();
        debug!(observer = %observer.name(), kinds = ?kinds, "Registering observer");
        let shared = Arc::new(Mutex::new(observer));
        let erased: SharedObserver = shared.clone();
        self.observers.push((kinds, erased));
        shared
    }

    /// Deliver one event; returns how many observers handled it
    pub async fn dispatch(&mut self, event: HostEvent) -> usize {
        let kind = event.kind();
        let mut handled = 0;

        for (kinds, observer) in &self.observers {
            if !kinds.contains(&kind) {
                continue;
            }
            let mut observer = observer.lock().await;
            trace!(observer = %observer.name(), kind = ?kind, "Dispatching event");
            observer.handle(&event).await;
            handled += 1;
        }

        handled
    }

    /// Drain the library events emitted so far
    pub fn take_events(&mut self) -> Vec<LibraryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Drop every observer and return events that were never taken
    pub fn teardown(mut self) -> Vec<LibraryEvent> {
        self.observers.clear();
        self.take_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        seen: Vec<EventKind>,
        emitter: EventEmitter,
    }

    #[async_trait]
    impl Observer for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn observed_events(&self) -> Vec<EventKind> {
            vec![
                EventKind::ConfigChanged,
                EventKind::RelationJoined("certificates".into()),
            ]
        }

        async fn handle(&mut self, event: &HostEvent) {
            self.seen.push(event.kind());
            self.emitter.emit(LibraryEvent::CertChanged);
        }
    }

    #[tokio::test]
    async fn test_dispatch_only_reaches_interested_observers() {
        let mut framework = Framework::new();
        let counter = framework.observe(Counter {
            seen: Vec::new(),
            emitter: framework.emitter(),
        });

        assert_eq!(framework.dispatch(HostEvent::ConfigChanged).await, 1);
        assert_eq!(framework.dispatch(HostEvent::UpdateStatus).await, 0);
        assert_eq!(framework.dispatch(HostEvent::relation_joined("peers")).await, 0);
        assert_eq!(framework.dispatch(HostEvent::relation_joined("certificates")).await, 1);

        assert_eq!(counter.lock().await.seen.len(), 2);
        assert_eq!(framework.take_events(), vec![LibraryEvent::CertChanged; 2]);
        assert!(framework.take_events().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_returns_pending_events() {
        let mut framework = Framework::new();
        let emitter = framework.emitter();
        framework.observe(Counter {
            seen: Vec::new(),
            emitter: emitter.clone(),
        });
        framework.dispatch(HostEvent::ConfigChanged).await;

        assert_eq!(framework.teardown(), vec![LibraryEvent::CertChanged]);
        // receiver is gone; emitting must not panic
        emitter.emit(LibraryEvent::CertChanged);
    }
}
