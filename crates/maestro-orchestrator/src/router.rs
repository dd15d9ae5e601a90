use crate::message::{CoordinationMessage, MessagePriority};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use maestro_core::event::topic;
use maestro_core::{EventBus, MaestroError, MaestroResult, SystemEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delivery callback attached to an agent's mailbox.
///
/// Multiple handlers may be subscribed per agent; the delivery loop
/// invokes all of them concurrently for each message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivered message. Returning an error schedules a retry.
    async fn handle(&self, message: &CoordinationMessage) -> MaestroResult<()>;
}

/// Tuning knobs for the router's delivery loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Delivery loop tick, milliseconds.
    pub tick_interval_ms: u64,
    /// Delivery attempts before a message is dead-lettered.
    pub max_retries: u32,
    /// Base for exponential backoff, milliseconds.
    pub base_backoff_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub max_backoff_ms: u64,
    /// How long shutdown waits for in-flight processing to drain.
    pub drain_grace_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            drain_grace_ms: 2_000,
        }
    }
}

/// Aggregate mailbox counters for dashboards and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatistics {
    pub total_mailboxes: usize,
    pub total_pending: usize,
    pub pending_per_agent: HashMap<Uuid, usize>,
}

struct QueuedMessage {
    message: CoordinationMessage,
    retries: u32,
    next_retry: Option<DateTime<Utc>>,
    acknowledged: bool,
}

struct Mailbox {
    /// Kept sorted by descending priority, FIFO within equal priority.
    messages: Vec<QueuedMessage>,
    processing: bool,
    last_activity: DateTime<Utc>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            processing: false,
            last_activity: Utc::now(),
        }
    }

    fn insert_by_priority(&mut self, queued: QueuedMessage) {
        let priority = queued.message.priority;
        let index = self
            .messages
            .iter()
            .position(|existing| existing.message.priority < priority)
            .unwrap_or(self.messages.len());
        self.messages.insert(index, queued);
    }
}

/// Per-agent priority mailboxes with a background delivery loop.
///
/// Delivery is at-least-once per subscribed handler: a failed handler
/// schedules an exponential-backoff retry, and after `max_retries`
/// attempts the message is dead-lettered (acknowledged anyway) so it
/// cannot block the rest of the mailbox.
pub struct MessageRouter {
    config: RouterConfig,
    mailboxes: Arc<RwLock<HashMap<Uuid, Mailbox>>>,
    handlers: Arc<RwLock<HashMap<Uuid, Vec<Arc<dyn MessageHandler>>>>>,
    events: Arc<EventBus>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            events,
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    /// Starts the background delivery loop.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(tx);

        let router = Arc::clone(&self);
        let tick = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        router.deliver_due().await;
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!(tick_ms = self.config.tick_interval_ms, "Message router started");
    }

    /// Creates a mailbox for an agent if it does not already exist.
    pub async fn register_agent(&self, agent_id: Uuid) {
        let mut mailboxes = self.mailboxes.write().await;
        if let std::collections::hash_map::Entry::Vacant(entry) = mailboxes.entry(agent_id) {
            entry.insert(Mailbox::new());
            debug!(agent = %agent_id, "Registered mailbox");
        }
    }

    /// Destroys an agent's mailbox and drops its handlers.
    pub async fn unregister_agent(&self, agent_id: Uuid) {
        self.mailboxes.write().await.remove(&agent_id);
        self.handlers.write().await.remove(&agent_id);
        debug!(agent = %agent_id, "Unregistered mailbox");
    }

    /// Attaches a delivery handler for an agent, creating its mailbox if
    /// needed.
    pub async fn subscribe(&self, agent_id: Uuid, handler: Arc<dyn MessageHandler>) {
        self.register_agent(agent_id).await;
        self.handlers
            .write()
            .await
            .entry(agent_id)
            .or_default()
            .push(handler);
    }

    /// Queues a message into the recipient's mailbox, ordered by priority.
    ///
    /// Fails with [`MaestroError::UnknownAgent`] if the recipient has no
    /// mailbox.
    pub async fn send_message(
        &self,
        from: Uuid,
        to: Uuid,
        mut message: CoordinationMessage,
    ) -> MaestroResult<()> {
        message.from = from;
        message.to = Some(to);
        message.timestamp = Utc::now();

        let mut mailboxes = self.mailboxes.write().await;
        let mailbox = mailboxes
            .get_mut(&to)
            .ok_or(MaestroError::UnknownAgent(to))?;

        debug!(message = %message.id, to = %to, kind = message.payload.label(), "Queued message");
        mailbox.insert_by_priority(QueuedMessage {
            message,
            retries: 0,
            next_retry: None,
            acknowledged: false,
        });
        Ok(())
    }

    /// Fans a copy of the message out to every mailbox except the sender's.
    pub async fn broadcast_message(
        &self,
        from: Uuid,
        message: CoordinationMessage,
    ) -> MaestroResult<usize> {
        let recipients: Vec<Uuid> = {
            let mailboxes = self.mailboxes.read().await;
            mailboxes.keys().filter(|id| **id != from).copied().collect()
        };

        for recipient in &recipients {
            let copy = message.clone();
            self.send_message(from, *recipient, copy).await?;
        }

        info!(message = %message.id, recipients = recipients.len(), "Broadcast message");
        Ok(recipients.len())
    }

    /// Unacknowledged messages waiting in an agent's mailbox, in delivery
    /// order.
    pub async fn pending_messages(&self, agent_id: Uuid) -> Vec<CoordinationMessage> {
        let mailboxes = self.mailboxes.read().await;
        mailboxes
            .get(&agent_id)
            .map(|mailbox| {
                mailbox
                    .messages
                    .iter()
                    .filter(|qm| !qm.acknowledged)
                    .map(|qm| qm.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Explicit acknowledgement path for handlers that finish processing
    /// outside the delivery loop.
    pub async fn acknowledge_message(&self, agent_id: Uuid, message_id: Uuid) -> MaestroResult<()> {
        let mut mailboxes = self.mailboxes.write().await;
        let mailbox = mailboxes
            .get_mut(&agent_id)
            .ok_or(MaestroError::UnknownAgent(agent_id))?;
        mailbox.messages.retain(|qm| qm.message.id != message_id);
        Ok(())
    }

    /// Current mailbox counters.
    pub async fn statistics(&self) -> RouterStatistics {
        let mailboxes = self.mailboxes.read().await;
        let pending_per_agent: HashMap<Uuid, usize> = mailboxes
            .iter()
            .map(|(id, mb)| {
                (
                    *id,
                    mb.messages.iter().filter(|qm| !qm.acknowledged).count(),
                )
            })
            .collect();
        RouterStatistics {
            total_mailboxes: mailboxes.len(),
            total_pending: pending_per_agent.values().sum(),
            pending_per_agent,
        }
    }

    /// One delivery pass: for every mailbox not currently processing, take
    /// the highest-priority unacknowledged message whose retry time has
    /// elapsed and run its handlers.
    ///
    /// Called by the background loop each tick; also directly callable so
    /// tests can drive delivery without waiting on wall-clock ticks.
    pub async fn deliver_due(&self) {
        let now = Utc::now();
        let due: Vec<(Uuid, CoordinationMessage)> = {
            let mut mailboxes = self.mailboxes.write().await;
            let mut batch = Vec::new();
            for (agent_id, mailbox) in mailboxes.iter_mut() {
                if mailbox.processing {
                    continue;
                }
                let candidate = mailbox
                    .messages
                    .iter()
                    .find(|qm| !qm.acknowledged && qm.next_retry.map_or(true, |at| at <= now))
                    .map(|qm| qm.message.clone());
                if let Some(message) = candidate {
                    mailbox.processing = true;
                    mailbox.last_activity = now;
                    batch.push((*agent_id, message));
                }
            }
            batch
        };

        for (agent_id, message) in due {
            self.process_message(agent_id, message).await;
        }
    }

    async fn process_message(&self, agent_id: Uuid, message: CoordinationMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = {
            let map = self.handlers.read().await;
            map.get(&agent_id).cloned().unwrap_or_default()
        };

        // No handlers counts as a failed attempt: the subscriber may
        // simply not be attached yet, so the message goes through the
        // normal retry schedule instead of being dropped.
        let failure: Option<String> = if handlers.is_empty() {
            Some("no handlers subscribed".to_string())
        } else {
            let results = join_all(handlers.iter().map(|h| h.handle(&message))).await;
            results
                .into_iter()
                .find_map(|r| r.err())
                .map(|e| e.to_string())
        };

        let mut mailboxes = self.mailboxes.write().await;
        let Some(mailbox) = mailboxes.get_mut(&agent_id) else {
            return;
        };
        if let Some(qm) = mailbox
            .messages
            .iter_mut()
            .find(|qm| qm.message.id == message.id)
        {
            match failure {
                None => {
                    qm.acknowledged = true;
                    debug!(message = %message.id, agent = %agent_id, "Delivered message");
                }
                Some(reason) => {
                    qm.retries += 1;
                    if qm.retries >= self.config.max_retries {
                        warn!(
                            message = %message.id,
                            agent = %agent_id,
                            retries = qm.retries,
                            reason = %reason,
                            "Message exceeded max retries, dead-lettering"
                        );
                        qm.acknowledged = true;
                        self.events.publish(
                            SystemEvent::new(topic::MESSAGE_DEAD_LETTER)
                                .with_agent(agent_id)
                                .with_detail(serde_json::json!({
                                    "message_id": message.id,
                                    "kind": message.payload.label(),
                                    "reason": reason,
                                })),
                        );
                    } else {
                        let delay_ms = (self.config.base_backoff_ms
                            .saturating_mul(1u64 << qm.retries.min(16)))
                        .min(self.config.max_backoff_ms);
                        qm.next_retry =
                            Some(Utc::now() + ChronoDuration::milliseconds(delay_ms as i64));
                        debug!(
                            message = %message.id,
                            retry = qm.retries,
                            delay_ms,
                            reason = %reason,
                            "Scheduled message retry"
                        );
                    }
                }
            }
        }
        mailbox.messages.retain(|qm| !qm.acknowledged);
        mailbox.processing = false;
    }

    /// Stops the delivery loop, waiting up to the configured drain grace
    /// for the current pass to finish, then clears all mailboxes.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let grace = Duration::from_millis(self.config.drain_grace_ms);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Message router delivery loop did not drain in time");
            }
        }
        self.mailboxes.write().await.clear();
        self.handlers.write().await.clear();
        info!("Message router shut down");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;
    use std::sync::atomic::AtomicUsize;

    /// Handler that counts invocations and optionally fails every time.
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, message: &CoordinationMessage) -> MaestroResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MaestroError::HandlerFailure {
                    message_id: message.id,
                    reason: "simulated failure".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn router() -> Arc<MessageRouter> {
        Arc::new(MessageRouter::new(
            RouterConfig::default(),
            Arc::new(EventBus::new()),
        ))
    }

    fn custom_message(from: Uuid, priority: MessagePriority) -> CoordinationMessage {
        CoordinationMessage::new(
            from,
            MessagePayload::Custom {
                kind: "test".to_string(),
                data: serde_json::Value::Null,
            },
        )
        .with_priority(priority)
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails() {
        let router = router();
        let to = Uuid::new_v4();
        let result = router
            .send_message(Uuid::new_v4(), to, custom_message(Uuid::new_v4(), MessagePriority::Normal))
            .await;
        assert!(matches!(result, Err(MaestroError::UnknownAgent(id)) if id == to));
    }

    #[tokio::test]
    async fn test_priority_ordering_within_mailbox() {
        let router = router();
        let sender = Uuid::new_v4();
        let agent = Uuid::new_v4();
        router.register_agent(agent).await;

        for priority in [
            MessagePriority::Low,
            MessagePriority::High,
            MessagePriority::Normal,
        ] {
            router
                .send_message(sender, agent, custom_message(sender, priority))
                .await
                .unwrap();
        }

        let pending = router.pending_messages(agent).await;
        let priorities: Vec<MessagePriority> = pending.iter().map(|m| m.priority).collect();
        assert_eq!(
            priorities,
            vec![
                MessagePriority::High,
                MessagePriority::Normal,
                MessagePriority::Low
            ]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_equal_priority() {
        let router = router();
        let sender = Uuid::new_v4();
        let agent = Uuid::new_v4();
        router.register_agent(agent).await;

        let first = custom_message(sender, MessagePriority::Normal);
        let second = custom_message(sender, MessagePriority::Normal);
        let (first_id, second_id) = (first.id, second.id);
        router.send_message(sender, agent, first).await.unwrap();
        router.send_message(sender, agent, second).await.unwrap();

        let pending = router.pending_messages(agent).await;
        assert_eq!(pending[0].id, first_id);
        assert_eq!(pending[1].id, second_id);
    }

    #[tokio::test]
    async fn test_delivery_acknowledges_on_success() {
        let router = router();
        let sender = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let calls = Arc::new(AtomicUsize::new(0));
        router
            .subscribe(
                agent,
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail: false,
                }),
            )
            .await;

        router
            .send_message(sender, agent, custom_message(sender, MessagePriority::Normal))
            .await
            .unwrap();
        router.deliver_due().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(router.pending_messages(agent).await.is_empty());
    }

    #[tokio::test]
    async fn test_all_handlers_invoked() {
        let router = router();
        let sender = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        for calls in [&first, &second] {
            router
                .subscribe(
                    agent,
                    Arc::new(CountingHandler {
                        calls: calls.clone(),
                        fail: false,
                    }),
                )
                .await;
        }

        router
            .send_message(sender, agent, custom_message(sender, MessagePriority::Normal))
            .await
            .unwrap();
        router.deliver_due().await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters_after_max_retries() {
        let events = Arc::new(EventBus::new());
        let dead_letters = Arc::new(AtomicUsize::new(0));
        let dead_clone = dead_letters.clone();
        events.subscribe(
            topic::MESSAGE_DEAD_LETTER,
            Arc::new(move |_| {
                dead_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Zero backoff so every pass retries immediately.
        let config = RouterConfig {
            base_backoff_ms: 0,
            ..RouterConfig::default()
        };
        let router = Arc::new(MessageRouter::new(config, events));
        let sender = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let calls = Arc::new(AtomicUsize::new(0));
        router
            .subscribe(
                agent,
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail: true,
                }),
            )
            .await;

        router
            .send_message(sender, agent, custom_message(sender, MessagePriority::Normal))
            .await
            .unwrap();

        for _ in 0..6 {
            router.deliver_due().await;
        }

        // Three attempts, then dead-lettered; never a fourth.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dead_letters.load(Ordering::SeqCst), 1);
        assert!(router.pending_messages(agent).await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let router = router();
        let sender = Uuid::new_v4();
        let other_a = Uuid::new_v4();
        let other_b = Uuid::new_v4();
        for id in [sender, other_a, other_b] {
            router.register_agent(id).await;
        }

        let sent = router
            .broadcast_message(sender, custom_message(sender, MessagePriority::Normal))
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert!(router.pending_messages(sender).await.is_empty());
        assert_eq!(router.pending_messages(other_a).await.len(), 1);
        assert_eq!(router.pending_messages(other_b).await.len(), 1);
        let copy = &router.pending_messages(other_a).await[0];
        assert_eq!(copy.to, Some(other_a));
    }

    #[tokio::test]
    async fn test_explicit_acknowledge() {
        let router = router();
        let sender = Uuid::new_v4();
        let agent = Uuid::new_v4();
        router.register_agent(agent).await;

        let message = custom_message(sender, MessagePriority::Normal);
        let message_id = message.id;
        router.send_message(sender, agent, message).await.unwrap();

        router.acknowledge_message(agent, message_id).await.unwrap();
        assert!(router.pending_messages(agent).await.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let router = router();
        let sender = Uuid::new_v4();
        let agent = Uuid::new_v4();
        router.register_agent(sender).await;
        router.register_agent(agent).await;
        router
            .send_message(sender, agent, custom_message(sender, MessagePriority::Normal))
            .await
            .unwrap();

        let stats = router.statistics().await;
        assert_eq!(stats.total_mailboxes, 2);
        assert_eq!(stats.total_pending, 1);
        assert_eq!(stats.pending_per_agent[&agent], 1);
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let router = router();
        router.clone().start().await;
        router.shutdown().await;
        router.shutdown().await;
        assert_eq!(router.statistics().await.total_mailboxes, 0);
    }
}
