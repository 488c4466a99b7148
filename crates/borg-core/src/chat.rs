use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// State of a single conversation (§4.F). `IDLE` has no payload; the other
/// three each carry what's needed to resume without a lookup elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatState {
    Idle,
    /// Collecting messages; window deadline is extended on every arrival,
    /// bounded by an absolute ceiling from `Collecting::started_at`.
    Collecting {
        started_at: Instant,
        window_deadline: Instant,
        messages: Vec<String>,
    },
    /// Agent job submitted; conversation locked to a single in-flight agent.
    Running,
    /// Post-response quiet period before the conversation can collect again.
    Cooldown { until: Instant },
}

/// An incoming message from any transport.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Unique key for the chat (e.g. telegram:123456, discord:channel_id).
    pub chat_key: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: i64,
    pub reply_to_message_id: Option<String>,
    /// Whether this message satisfies the conversation's trigger policy
    /// (direct message, @mention, or `requires_trigger = false`). Only
    /// matters for the IDLE → COLLECTING transition; once collecting, every
    /// message extends the window regardless.
    pub mentions_trigger: bool,
}

/// Per-conversation token bucket (§4.F "Rate limiter"). Tokens are consumed
/// only on the IDLE → COLLECTING transition, never on extension or replies.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_s: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_s: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_s,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_s).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Conversation {
    state: ChatState,
    bucket: TokenBucket,
    /// Messages that arrived during RUNNING/COOLDOWN. Folded into the next
    /// COLLECTING snapshot rather than dropped (§4.F).
    deferred: Vec<String>,
}

impl Conversation {
    fn new(bucket_capacity: u32, bucket_refill_per_s: f64) -> Self {
        Self {
            state: ChatState::Idle,
            bucket: TokenBucket::new(bucket_capacity, bucket_refill_per_s),
            deferred: Vec::new(),
        }
    }
}

/// Manages per-conversation collection windows, the IDLE/COLLECTING/RUNNING/
/// COOLDOWN state machine, and the per-conversation rate limiter.
pub struct ChatCollector {
    conversations: Arc<Mutex<HashMap<String, Conversation>>>,
    /// Collection window duration. 0 = immediate dispatch (tests, or a
    /// deployment that wants zero batching latency).
    window_ms: u64,
    cooldown_ms: u64,
    rate_limit_capacity: u32,
    rate_limit_refill_per_s: f64,
    /// Max agents running concurrently (the chat-side semaphore; distinct
    /// from the pipeline's own concurrency cap).
    max_agents: u32,
    running: Arc<std::sync::atomic::AtomicU32>,
}

/// A batch of messages ready to be dispatched to an agent.
#[derive(Debug)]
pub struct MessageBatch {
    pub chat_key: String,
    pub messages: Vec<String>,
}

impl ChatCollector {
    /// `rate_limit_capacity` tokens refill over `rate_limit_window_s` seconds,
    /// consumed only on the IDLE → COLLECTING transition (§4.F).
    pub fn new(
        window_ms: u64,
        max_agents: u32,
        cooldown_ms: u64,
        rate_limit_capacity: u32,
        rate_limit_window_s: i64,
    ) -> Self {
        let refill_per_s = if rate_limit_window_s > 0 {
            rate_limit_capacity as f64 / rate_limit_window_s as f64
        } else {
            0.0
        };
        Self::with_cooldown_and_rate_limit(window_ms, max_agents, cooldown_ms, rate_limit_capacity, refill_per_s)
    }

    pub fn with_cooldown_and_rate_limit(
        window_ms: u64,
        max_agents: u32,
        cooldown_ms: u64,
        rate_limit_capacity: u32,
        rate_limit_refill_per_s: f64,
    ) -> Self {
        Self {
            conversations: Arc::new(Mutex::new(HashMap::new())),
            window_ms,
            cooldown_ms,
            rate_limit_capacity,
            rate_limit_refill_per_s,
            max_agents,
            running: Arc::new(std::sync::atomic::AtomicU32::new(0)),
        }
    }

    fn new_conversation(&self) -> Conversation {
        Conversation::new(self.rate_limit_capacity, self.rate_limit_refill_per_s)
    }

    /// Try to start collecting with `first_message` plus anything already
    /// deferred. Consumes a rate-limit token; returns `None` (and leaves the
    /// conversation in IDLE with the message dropped) if none are available.
    /// `window_ms == 0` dispatches immediately instead of opening a window.
    fn begin_collecting(
        &self,
        conv: &mut Conversation,
        chat_key: &str,
        first_message: Option<String>,
    ) -> Option<MessageBatch> {
        if !conv.bucket.try_consume() {
            debug!("chat {chat_key}: rate limited, dropping trigger");
            return None;
        }
        let mut messages = std::mem::take(&mut conv.deferred);
        if let Some(m) = first_message {
            messages.push(m);
        }
        if messages.is_empty() {
            conv.state = ChatState::Idle;
            return None;
        }
        if self.window_ms == 0 {
            conv.state = ChatState::Running;
            return Some(MessageBatch {
                chat_key: chat_key.to_string(),
                messages,
            });
        }
        let now = Instant::now();
        conv.state = ChatState::Collecting {
            started_at: now,
            window_deadline: now + Duration::from_millis(self.window_ms),
            messages,
        };
        None
    }

    /// Process an incoming message. Returns `Some(batch)` if the window just
    /// closed and an agent job should be submitted.
    pub async fn process(&self, msg: IncomingMessage) -> Option<MessageBatch> {
        let mut conversations = self.conversations.lock().await;
        let chat_key = msg.chat_key.clone();
        let conv = conversations
            .entry(chat_key.clone())
            .or_insert_with(|| self.new_conversation());

        match &conv.state {
            ChatState::Running => {
                conv.deferred.push(msg.text);
                None
            }
            ChatState::Cooldown { until } => {
                if Instant::now() >= *until {
                    conv.state = ChatState::Idle;
                    self.begin_collecting(conv, &chat_key, Some(msg.text))
                } else {
                    conv.deferred.push(msg.text);
                    None
                }
            }
            ChatState::Idle => {
                if !msg.mentions_trigger {
                    debug!("chat {chat_key}: no trigger, ignoring in IDLE");
                    return None;
                }
                self.begin_collecting(conv, &chat_key, Some(msg.text))
            }
            ChatState::Collecting { .. } => {
                let ChatState::Collecting {
                    started_at,
                    window_deadline,
                    mut messages,
                } = std::mem::replace(&mut conv.state, ChatState::Idle)
                else {
                    unreachable!()
                };
                messages.push(msg.text);
                let now = Instant::now();
                if now >= window_deadline {
                    conv.state = ChatState::Running;
                    Some(MessageBatch { chat_key, messages })
                } else {
                    conv.state = ChatState::Collecting {
                        started_at,
                        window_deadline: window_deadline + Duration::from_millis(self.window_ms),
                        messages,
                    };
                    None
                }
            }
        }
    }

    /// Call periodically to flush expired collection windows and cooldowns.
    /// Returns all batches ready to dispatch.
    pub async fn flush_expired(&self) -> Vec<MessageBatch> {
        let mut conversations = self.conversations.lock().await;
        let now = Instant::now();
        let mut ready = Vec::new();

        for (chat_key, conv) in conversations.iter_mut() {
            match &conv.state {
                ChatState::Collecting {
                    window_deadline,
                    messages,
                    ..
                } if now >= *window_deadline => {
                    let messages = messages.clone();
                    conv.state = ChatState::Running;
                    ready.push(MessageBatch {
                        chat_key: chat_key.clone(),
                        messages,
                    });
                }
                ChatState::Cooldown { until } if now >= *until => {
                    conv.state = ChatState::Idle;
                    if let Some(batch) = Self::begin_collecting_static(
                        self.window_ms,
                        conv,
                        chat_key,
                        None,
                    ) {
                        ready.push(batch);
                    }
                }
                _ => {}
            }
        }

        ready
    }

    /// Non-`&self` twin of `begin_collecting` for use inside the
    /// `iter_mut` loop in `flush_expired`, which already holds the lock.
    fn begin_collecting_static(
        window_ms: u64,
        conv: &mut Conversation,
        chat_key: &str,
        first_message: Option<String>,
    ) -> Option<MessageBatch> {
        if conv.deferred.is_empty() && first_message.is_none() {
            return None;
        }
        if !conv.bucket.try_consume() {
            return None;
        }
        let mut messages = std::mem::take(&mut conv.deferred);
        if let Some(m) = first_message {
            messages.push(m);
        }
        if window_ms == 0 {
            conv.state = ChatState::Running;
            return Some(MessageBatch {
                chat_key: chat_key.to_string(),
                messages,
            });
        }
        let now = Instant::now();
        conv.state = ChatState::Collecting {
            started_at: now,
            window_deadline: now + Duration::from_millis(window_ms),
            messages,
        };
        None
    }

    /// RUNNING → COOLDOWN: agent completed, response delivered.
    pub async fn mark_done(&self, chat_key: &str) {
        let mut conversations = self.conversations.lock().await;
        if let Some(conv) = conversations.get_mut(chat_key) {
            conv.state = if self.cooldown_ms == 0 {
                ChatState::Idle
            } else {
                ChatState::Cooldown {
                    until: Instant::now() + Duration::from_millis(self.cooldown_ms),
                }
            };
        }
        self.running.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        debug!("chat {chat_key}: RUNNING -> COOLDOWN/IDLE");
    }

    /// RUNNING → IDLE: subprocess killed after `agent_timeout_s`, bypassing
    /// cooldown entirely (§4.F).
    pub async fn mark_timeout(&self, chat_key: &str) {
        let mut conversations = self.conversations.lock().await;
        if let Some(conv) = conversations.get_mut(chat_key) {
            conv.state = ChatState::Idle;
        }
        self.running.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        debug!("chat {chat_key}: RUNNING -> IDLE (timeout)");
    }

    /// Check if we can dispatch more agents under the chat-side semaphore.
    pub fn can_dispatch(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Relaxed) < self.max_agents
    }

    /// Mark dispatch started.
    pub fn mark_dispatched(&self) {
        self.running.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn active_count(&self) -> u32 {
        self.running.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(test)]
    async fn state_of(&self, chat_key: &str) -> Option<ChatState> {
        self.conversations.lock().await.get(chat_key).map(|c| c.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(chat_key: &str, text: &str, mentions_trigger: bool) -> IncomingMessage {
        IncomingMessage {
            chat_key: chat_key.to_string(),
            sender_name: "alice".to_string(),
            text: text.to_string(),
            timestamp: 0,
            reply_to_message_id: None,
            mentions_trigger,
        }
    }

    #[tokio::test]
    async fn idle_ignores_message_without_trigger() {
        let collector = ChatCollector::new(50, 4, 0, 5, 60);
        let batch = collector.process(msg("k", "hi", false)).await;
        assert!(batch.is_none());
        assert_eq!(collector.state_of("k").await, Some(ChatState::Idle));
    }

    #[tokio::test]
    async fn burst_extends_window_then_dispatches_once() {
        let collector = ChatCollector::new(30, 4, 0, 5, 60);
        assert!(collector.process(msg("k", "@bot hello", true)).await.is_none());
        assert!(matches!(
            collector.state_of("k").await,
            Some(ChatState::Collecting { .. })
        ));
        assert!(collector.process(msg("k", "second", false)).await.is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let batch = collector.process(msg("k", "third", false)).await;
        let batch = batch.expect("window should have closed");
        assert_eq!(batch.messages, vec!["@bot hello", "second", "third"]);
        assert_eq!(collector.state_of("k").await, Some(ChatState::Running));
    }

    #[tokio::test]
    async fn messages_during_running_are_deferred_not_dropped() {
        let collector = ChatCollector::new(0, 4, 0, 5, 60);
        let batch = collector
            .process(msg("k", "@bot go", true))
            .await
            .expect("window_ms=0 dispatches immediately");
        assert_eq!(batch.messages, vec!["@bot go"]);
        assert!(collector.process(msg("k", "while running", false)).await.is_none());
        collector.mark_done("k").await;
        // cooldown_ms defaults to 0 in ChatCollector::new, so this goes straight to IDLE
        // and the deferred message should flush on the next tick.
        let flushed = collector.flush_expired().await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].messages, vec!["while running"]);
    }

    #[tokio::test]
    async fn cooldown_blocks_new_collection_until_expiry() {
        let collector = ChatCollector::with_cooldown_and_rate_limit(0, 4, 50, 5, 5.0 / 60.0);
        collector
            .process(msg("k", "@bot go", true))
            .await
            .expect("immediate dispatch");
        collector.mark_done("k").await;
        assert!(matches!(
            collector.state_of("k").await,
            Some(ChatState::Cooldown { .. })
        ));
        assert!(collector.process(msg("k", "too soon", true)).await.is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let ready = collector.flush_expired().await;
        assert!(ready.is_empty(), "no deferred messages queued during cooldown window itself");
        assert_eq!(collector.state_of("k").await, Some(ChatState::Idle));
    }

    #[tokio::test]
    async fn rate_limiter_drops_trigger_once_bucket_is_empty() {
        let collector = ChatCollector::with_cooldown_and_rate_limit(0, 4, 0, 1, 0.0);
        let first = collector.process(msg("k", "@bot one", true)).await;
        assert!(first.is_some());
        collector.mark_done("k").await;
        let second = collector.process(msg("k", "@bot two", true)).await;
        assert!(second.is_none(), "bucket had capacity 1 and no refill");
    }
}
