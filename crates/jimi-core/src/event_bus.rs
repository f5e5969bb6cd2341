//! Event bus ("the wire", C1, `spec.md` §4.1). Grounded in the teacher's
//! `EventBus` (`event_bus.rs`): a bounded `tokio::sync::broadcast` channel
//! for `subscribe()`, plus out-of-band `EventObserver` registration for
//! push-only integrations that don't want to hold a `Receiver`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;

use crate::events::{ApprovalDecision, Event, EventKind, EventObserver};

/// Bounded per-subscriber queue depth (§4.1: "default 1024").
const EVENT_BUS_BUFFER: usize = 1024;

pub type ObserverToken = u64;

type ObserverList = Vec<(ObserverToken, Arc<dyn EventObserver>)>;

/// A stream of events delivered in publish order, with built-in translation
/// of broadcast lag into a synthetic `SubscriberLagged` event so a slow
/// subscriber never sees a raw channel error (§4.1 backpressure policy).
pub struct Subscription {
    inner: broadcast::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Event {
                        seq: 0,
                        timestamp: 0,
                        session_id: String::new(),
                        kind: EventKind::SubscriberLagged { n_dropped: n },
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<Event>,
    observers: Arc<Mutex<ObserverList>>,
    sequence: AtomicU64,
    observer_sequence: AtomicU64,
    observer_tasks: Arc<tokio::sync::Mutex<JoinSet<()>>>,
    pending_approvals: Arc<Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_BUFFER);
        Self {
            sender,
            observers: Arc::new(Mutex::new(Vec::new())),
            sequence: AtomicU64::new(1),
            observer_sequence: AtomicU64::new(1),
            observer_tasks: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
            pending_approvals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            inner: self.sender.subscribe(),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) -> ObserverToken {
        let token = self.observer_sequence.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((token, observer));
        token
    }

    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(t, _)| *t != token);
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Non-blocking: publish an event to all subscribers and observers.
    pub fn publish(&self, session_id: &str, kind: EventKind) -> Event {
        let event = self.build_event(session_id, kind);
        self.dispatch(event.clone());
        event
    }

    /// Publish `ApprovalRequested` and block until a subscriber replies via
    /// `respond_approval` with the matching `tool_call_id` (§4.1, §4.3:
    /// "exactly one approval prompt per concurrent request").
    pub async fn request_approval(
        &self,
        session_id: &str,
        tool_call_id: &str,
        action_label: &str,
        description: &str,
    ) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        self.pending_approvals
            .lock()
            .insert(tool_call_id.to_string(), tx);

        self.publish(
            session_id,
            EventKind::ApprovalRequested {
                tool_call_id: tool_call_id.to_string(),
                action_label: action_label.to_string(),
                description: description.to_string(),
            },
        );

        // Approval wait is infinite per spec §5; if every subscriber drops
        // without replying the channel closes and we default to reject
        // rather than hang the dispatcher forever.
        rx.await.unwrap_or(ApprovalDecision::Reject)
    }

    /// Called by a subscriber UI to answer a pending `ApprovalRequested`.
    /// Returns `false` if no prompt with that id is outstanding (already
    /// answered, or unknown id).
    pub fn respond_approval(&self, tool_call_id: &str, decision: ApprovalDecision) -> bool {
        if let Some(tx) = self.pending_approvals.lock().remove(tool_call_id) {
            let _ = tx.send(decision);
            true
        } else {
            false
        }
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.observer_tasks.lock().await;
        tasks.shutdown().await;
    }

    fn dispatch(&self, event: Event) {
        let _ = self.sender.send(event.clone());

        let observers: Vec<_> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        if observers.is_empty() {
            return;
        }

        let tasks = self.observer_tasks.clone();
        tokio::spawn(async move {
            let mut guard = tasks.lock().await;
            for observer in observers {
                let event = event.clone();
                guard.spawn(async move {
                    if let Err(err) = observer.on_event(&event).await {
                        log::error!(
                            "EventBus observer failure: session_id={}, seq={}, error={}",
                            event.session_id,
                            event.seq,
                            err
                        );
                    }
                });
            }
        });
    }

    fn build_event(&self, session_id: &str, kind: EventKind) -> Event {
        Event {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            session_id: session_id.to_string(),
            kind,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TokioMutex;

    struct CountingObserver {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EventObserver for CountingObserver {
        async fn on_event(&self, _event: &Event) -> Result<(), crate::error::AgentError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingObserver;

    #[async_trait::async_trait]
    impl EventObserver for FailingObserver {
        async fn on_event(&self, _event: &Event) -> Result<(), crate::error::AgentError> {
            Err(crate::error::AgentError::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn subscribe_receives_published_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish("s1", EventKind::StepBegin { step_no: 1 });

        let event = sub.recv().await.expect("event");
        assert_eq!(event.session_id, "s1");
        assert!(matches!(event.kind, EventKind::StepBegin { step_no: 1 }));
    }

    #[tokio::test]
    async fn sequence_numbers_increment_monotonically() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish("s1", EventKind::StepBegin { step_no: 1 });
        bus.publish("s1", EventKind::StepEnd { step_no: 1 });

        let e1 = sub.recv().await.unwrap();
        let e2 = sub.recv().await.unwrap();
        assert_eq!(e1.seq + 1, e2.seq);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive_events() {
        let bus = EventBus::new();
        let mut s1 = bus.subscribe();
        let mut s2 = bus.subscribe();
        bus.publish("s1", EventKind::StepInterrupted);

        let e1 = s1.recv().await.unwrap();
        let e2 = s2.recv().await.unwrap();
        assert_eq!(e1.seq, e2.seq);
    }

    #[tokio::test]
    async fn observer_failure_does_not_block_other_observers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.add_observer(Arc::new(CountingObserver {
            count: count.clone(),
        }));
        bus.add_observer(Arc::new(FailingObserver));

        bus.publish("s1", EventKind::StepInterrupted);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_approval_blocks_until_respond_approval() {
        let bus = Arc::new(EventBus::new());
        let bus2 = bus.clone();

        let handle = tokio::spawn(async move {
            bus2.request_approval("s1", "c1", "run shell", "rm -rf /tmp/x")
                .await
        });

        // Give the request time to register before responding.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(bus.respond_approval("c1", ApprovalDecision::Approve));

        let decision = handle.await.unwrap();
        assert_eq!(decision, ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn respond_approval_unknown_id_returns_false() {
        let bus = EventBus::new();
        assert!(!bus.respond_approval("missing", ApprovalDecision::Reject));
    }

    #[tokio::test]
    async fn exactly_one_prompt_per_tool_call_id() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe();
        let bus2 = bus.clone();

        let handle = tokio::spawn(async move {
            bus2.request_approval("s1", "c1", "label", "desc").await
        });

        let mut prompts = 0;
        // Drain exactly the ApprovalRequested event, then answer.
        let event = sub.recv().await.unwrap();
        if matches!(event.kind, EventKind::ApprovalRequested { .. }) {
            prompts += 1;
        }
        bus.respond_approval("c1", ApprovalDecision::ApproveSession);
        handle.await.unwrap();
        assert_eq!(prompts, 1);
    }

    #[tokio::test]
    async fn remove_observer_detaches_it() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let token = bus.add_observer(Arc::new(CountingObserver {
            count: count.clone(),
        }));
        assert_eq!(bus.observer_count(), 1);
        assert!(bus.remove_observer(token));
        assert_eq!(bus.observer_count(), 0);
    }

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn static_checks() {
        assert_send_sync::<EventBus>();
    }

    #[allow(dead_code)]
    async fn unused_silencer(_m: TokioMutex<()>) {}
}
