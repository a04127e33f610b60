//! Central event routing hub.
//!
//! Subscribes to a stream and routes each incoming entry to the handlers
//! registered for its event type, plus any global handlers. Replaces
//! polling loops with event-driven processing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pubsub::{EventType, StreamEntry, Subscriber};

use super::handlers::{HandlerResult, SignalHandler};

type HandlerMap = HashMap<EventType, Vec<Arc<dyn SignalHandler>>>;

/// Routes incoming events to registered handlers.
pub struct EventDispatcher {
    subscriber: Arc<Subscriber>,
    handlers: Mutex<HandlerMap>,
    global_handlers: Mutex<Vec<Arc<dyn SignalHandler>>>,
    running: AtomicBool,
    listen_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_count: AtomicU64,
    error_count: AtomicU64,
}

impl EventDispatcher {
    pub fn new(subscriber: Arc<Subscriber>) -> Self {
        Self {
            subscriber,
            handlers: Mutex::new(HashMap::new()),
            global_handlers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            listen_task: Mutex::new(None),
            dispatch_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Register a handler for a specific event type.
    ///
    /// Multiple handlers may be registered per type; they run in
    /// registration order.
    pub fn register(&self, event_type: EventType, handler: Arc<dyn SignalHandler>) {
        info!(handler = handler.name(), event_type = %event_type, "Registered handler");
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Register a handler that receives every event.
    pub fn register_global(&self, handler: Arc<dyn SignalHandler>) {
        self.global_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Event types with at least one registered handler.
    pub fn registered_events(&self) -> Vec<EventType> {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Route a single entry to its handlers and aggregate their results.
    ///
    /// The aggregate acknowledges only when every matched handler wants
    /// the entry acknowledged.
    pub fn dispatch(&self, entry: &StreamEntry) -> HandlerResult {
        let message = &entry.message;
        let matched: Vec<Arc<dyn SignalHandler>> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            let global = self
                .global_handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&message.event_type)
                .into_iter()
                .flatten()
                .chain(global.iter())
                .cloned()
                .collect()
        };

        if matched.is_empty() {
            debug!(event_type = %message.event_type, "No handler, acknowledging");
            return HandlerResult::ok("no_handler");
        }

        let mut combined = HandlerResult::ok("");
        let mut actions = Vec::new();

        for handler in matched {
            let result = handler.handle(message);
            if !result.success {
                combined.success = false;
                combined.errors.extend(result.errors);
                self.error_count.fetch_add(1, Ordering::SeqCst);
            }
            if !result.should_ack {
                combined.should_ack = false;
            }
            if !result.action_taken.is_empty() {
                actions.push(result.action_taken);
            }
            combined.data.extend(result.data);
        }

        combined.action_taken = actions.join("; ");
        self.dispatch_count.fetch_add(1, Ordering::SeqCst);
        combined
    }

    /// Begin listening for events on a background task. The dispatcher
    /// is shared with the task, so call through an `Arc` clone.
    pub async fn start(self: Arc<Self>, channel: Option<&str>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Dispatcher already running");
            return;
        }

        let target = channel
            .map(String::from)
            .unwrap_or_else(|| self.subscriber.channels().signals());
        let dispatcher = Arc::clone(&self);
        let channel_name = target.clone();

        let task = tokio::spawn(async move {
            dispatcher.listen_loop(&channel_name).await;
        });
        *self.listen_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!(channel = %target, "Event dispatcher started");
    }

    /// Gracefully stop the dispatcher and join its listen task.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.subscriber.stop();
        let task = self
            .listen_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(
            dispatched = self.dispatch_count(),
            errors = self.error_count(),
            "Event dispatcher stopped"
        );
    }

    async fn listen_loop(self: Arc<Self>, channel: &str) {
        if let Err(e) = self.subscriber.ensure_group(channel).await {
            error!(error = %e, "Failed to ensure consumer group");
            self.running.store(false, Ordering::SeqCst);
            return;
        }

        while self.running.load(Ordering::SeqCst) {
            let entries = match self
                .subscriber
                .read(Some(channel), None, Some(Duration::from_millis(500)))
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!(error = %e, "Listen loop error");
                        self.error_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    continue;
                }
            };

            for entry in entries {
                let result = self.dispatch(&entry);
                if result.should_ack {
                    if let Err(e) = self.subscriber.ack(channel, &[entry.stream_id.clone()]).await
                    {
                        error!(error = %e, "Failed to ack entry");
                    }
                }
                if !result.success {
                    warn!(
                        event_type = %entry.message.event_type,
                        errors = ?result.errors,
                        "Dispatch failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{MemoryBroker, Publisher, StreamClient, WaveMessage};
    use serde_json::json;

    struct CountingHandler {
        count: AtomicU64,
        ack: bool,
    }

    impl CountingHandler {
        fn new(ack: bool) -> Self {
            Self {
                count: AtomicU64::new(0),
                ack,
            }
        }
    }

    impl SignalHandler for CountingHandler {
        fn handle(&self, _message: &WaveMessage) -> HandlerResult {
            self.count.fetch_add(1, Ordering::SeqCst);
            let mut result = HandlerResult::ok("counted");
            result.should_ack = self.ack;
            result
        }

        fn name(&self) -> &'static str {
            "CountingHandler"
        }
    }

    fn fixture() -> (Arc<Publisher>, Arc<EventDispatcher>) {
        let broker = MemoryBroker::new().shared();
        let client = StreamClient::new(broker as _, "redis://localhost:6379/0").shared();
        let publisher = Publisher::new(Arc::clone(&client), "demo", "pub")
            .unwrap()
            .shared();
        let subscriber = Subscriber::new(client, "demo", "orchestrator", "main")
            .unwrap()
            .with_block(Duration::from_millis(50))
            .shared();
        (publisher, EventDispatcher::new(subscriber).shared())
    }

    fn entry(event_type: EventType) -> StreamEntry {
        StreamEntry {
            stream_id: "1-0".to_string(),
            message: WaveMessage::new(event_type, json!({}), "src", "demo"),
        }
    }

    #[test]
    fn test_dispatch_without_handlers_acks() {
        let (_publisher, dispatcher) = fixture();
        let result = dispatcher.dispatch(&entry(EventType::HealthCheck));
        assert!(result.success);
        assert!(result.should_ack);
        assert_eq!(result.action_taken, "no_handler");
    }

    #[test]
    fn test_dispatch_runs_typed_and_global_handlers() {
        let (_publisher, dispatcher) = fixture();
        let typed = Arc::new(CountingHandler::new(true));
        let global = Arc::new(CountingHandler::new(true));
        dispatcher.register(EventType::GatePassed, Arc::clone(&typed) as _);
        dispatcher.register_global(Arc::clone(&global) as _);

        dispatcher.dispatch(&entry(EventType::GatePassed));
        dispatcher.dispatch(&entry(EventType::HealthCheck));

        assert_eq!(typed.count.load(Ordering::SeqCst), 1);
        assert_eq!(global.count.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.dispatch_count(), 2);
    }

    #[test]
    fn test_ack_requires_unanimity() {
        let (_publisher, dispatcher) = fixture();
        dispatcher.register(EventType::GatePassed, Arc::new(CountingHandler::new(true)));
        dispatcher.register(EventType::GatePassed, Arc::new(CountingHandler::new(false)));

        let result = dispatcher.dispatch(&entry(EventType::GatePassed));
        assert!(!result.should_ack);
    }

    #[tokio::test]
    async fn test_start_dispatches_published_events() {
        let (publisher, dispatcher) = fixture();
        let handler = Arc::new(CountingHandler::new(true));
        dispatcher.register(EventType::StoryStarted, Arc::clone(&handler) as _);

        Arc::clone(&dispatcher).start(None).await;
        publisher
            .publish(EventType::StoryStarted, json!({"story_id": "S-1"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        dispatcher.stop().await;

        assert_eq!(handler.count.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_running());
    }
}
