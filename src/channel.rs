//! Event channels for live progress feeds
//!
//! A [`StreamManager`] owns named, bounded FIFO queues. Producers `send`
//! typed events; a single consumer drains a channel as a stream of
//! [`StreamFrame`]s (or server-sent-event text via `consume_sse`). While the
//! queue is idle the consumer emits heartbeats, and after the configured
//! number of idle heartbeats it terminates the stream with an error frame.
//! Every consumed stream ends with an explicit `end` frame.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{BackpressurePolicy, StreamConfig};

/// A typed event on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// What a consumer sees
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Event(StreamEvent),
    /// Keep-alive emitted after an idle wait
    Heartbeat,
    /// Stream is being terminated abnormally; always followed by `End`
    Error(StreamEvent),
    /// Terminal frame
    End(StreamEvent),
}

impl StreamFrame {
    fn error(message: impl Into<String>) -> Self {
        StreamFrame::Error(StreamEvent::new("error", json!({ "error": message.into() })))
    }

    fn end() -> Self {
        StreamFrame::End(StreamEvent::new("end", Value::Null))
    }

    pub fn event_type(&self) -> &str {
        match self {
            StreamFrame::Event(e) | StreamFrame::Error(e) | StreamFrame::End(e) => &e.event_type,
            StreamFrame::Heartbeat => "heartbeat",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::End(_))
    }

    /// Render as a `text/event-stream` record
    pub fn to_sse(&self) -> String {
        match self {
            StreamFrame::Heartbeat => ": heartbeat\n\n".to_string(),
            StreamFrame::Event(e) | StreamFrame::Error(e) | StreamFrame::End(e) => {
                let body = serde_json::to_string(e).unwrap_or_else(|_| "{}".to_string());
                format!("data: {}\n\n", body)
            }
        }
    }
}

/// Result of a `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Delivered after evicting the oldest queued event
    DroppedOldest,
    /// Queue full under the reject policy
    Rejected,
    /// No open channel with that id
    ChannelAbsent,
}

/// Channel metadata snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub created_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub event_count: u64,
    pub queued: usize,
}

enum Queued {
    Event(StreamEvent),
    End,
}

struct StreamMeta {
    created_at: DateTime<Utc>,
    last_event_at: DateTime<Utc>,
    event_count: u64,
}

struct StreamState {
    stream_id: String,
    queue: Mutex<VecDeque<Queued>>,
    meta: Mutex<StreamMeta>,
    closed: AtomicBool,
    item_ready: Notify,
    space_ready: Notify,
}

impl StreamState {
    fn new(stream_id: String) -> Self {
        let now = Utc::now();
        Self {
            stream_id,
            queue: Mutex::new(VecDeque::new()),
            meta: Mutex::new(StreamMeta {
                created_at: now,
                last_event_at: now,
                event_count: 0,
            }),
            closed: AtomicBool::new(false),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and queue the terminal marker. Returns false if already closed.
    fn shut(&self) -> bool {
        let mut queue = self.queue.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        queue.push_back(Queued::End);
        drop(queue);

        self.item_ready.notify_one();
        self.space_ready.notify_waiters();
        true
    }

    async fn push(&self, event: StreamEvent, capacity: usize, policy: BackpressurePolicy) -> SendOutcome {
        let mut event = Some(event);
        loop {
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue.lock();
                if self.is_closed() {
                    return SendOutcome::ChannelAbsent;
                }

                let outcome = if queue.len() < capacity {
                    Some(SendOutcome::Delivered)
                } else {
                    match policy {
                        BackpressurePolicy::Block => None,
                        BackpressurePolicy::Reject => return SendOutcome::Rejected,
                        BackpressurePolicy::DropOldest => {
                            queue.pop_front();
                            Some(SendOutcome::DroppedOldest)
                        }
                    }
                };

                if let Some(outcome) = outcome {
                    if let Some(event) = event.take() {
                        queue.push_back(Queued::Event(event));
                    }
                    drop(queue);

                    let mut meta = self.meta.lock();
                    meta.last_event_at = Utc::now();
                    meta.event_count += 1;
                    drop(meta);

                    self.item_ready.notify_one();
                    return outcome;
                }
            }

            notified.await;
        }
    }

    /// Next queued item, or `None` once closed and drained
    async fn next(&self) -> Option<Queued> {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue.lock();
                if let Some(item) = queue.pop_front() {
                    drop(queue);
                    self.space_ready.notify_waiters();
                    return Some(item);
                }
                if self.is_closed() {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn info(&self) -> StreamInfo {
        let meta = self.meta.lock();
        StreamInfo {
            stream_id: self.stream_id.clone(),
            created_at: meta.created_at,
            last_event_at: meta.last_event_at,
            event_count: meta.event_count,
            queued: self.queue.lock().len(),
        }
    }
}

type Registry = RwLock<HashMap<String, Arc<StreamState>>>;

/// Removes a channel from the registry when its consumer goes away
struct ConsumerGuard {
    registry: Arc<Registry>,
    state: Arc<StreamState>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.state.shut();
        let mut streams = self.registry.write();
        let ours = streams
            .get(&self.state.stream_id)
            .is_some_and(|s| Arc::ptr_eq(s, &self.state));
        if ours {
            streams.remove(&self.state.stream_id);
            info!(stream_id = %self.state.stream_id, "Stream closed by consumer");
        }
    }
}

/// Handle to one open channel
#[derive(Clone)]
pub struct StreamHandle {
    state: Arc<StreamState>,
    registry: Arc<Registry>,
    config: StreamConfig,
}

impl StreamHandle {
    /// Caller-supplied channel id
    pub fn id(&self) -> &str {
        &self.state.stream_id
    }

    /// Metadata snapshot for this channel
    pub fn info(&self) -> StreamInfo {
        self.state.info()
    }

    /// Check if the terminal marker has been queued
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Drain the channel as frames until the terminal frame.
    ///
    /// Once a channel has ended, consuming it again yields nothing.
    pub fn consume(&self) -> BoxStream<'static, StreamFrame> {
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        let interval = self.config.heartbeat_interval();
        let max_idle = self.config.max_idle_heartbeats;

        let frames = async_stream::stream! {
            let _guard = ConsumerGuard { registry, state: Arc::clone(&state) };
            let mut idle: u32 = 0;

            loop {
                match tokio::time::timeout(interval, state.next()).await {
                    Ok(Some(Queued::Event(event))) => {
                        idle = 0;
                        yield StreamFrame::Event(event);
                    }
                    Ok(Some(Queued::End)) => {
                        yield StreamFrame::end();
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        if max_idle.is_some_and(|max| idle >= max) {
                            warn!(stream_id = %state.stream_id, idle, "Stream idle limit reached");
                            yield StreamFrame::error("stream idle timeout");
                            yield StreamFrame::end();
                            break;
                        }
                        idle += 1;
                        debug!(stream_id = %state.stream_id, idle, "Heartbeat");
                        yield StreamFrame::Heartbeat;
                    }
                }
            }
        };
        frames.boxed()
    }

    /// Same as [`consume`](Self::consume), rendered as event-stream text
    pub fn consume_sse(&self) -> BoxStream<'static, String> {
        self.consume().map(|frame| frame.to_sse()).boxed()
    }
}

/// Registry of named event channels
#[derive(Clone)]
pub struct StreamManager {
    streams: Arc<Registry>,
    config: StreamConfig,
}

impl StreamManager {
    /// Create a manager. Zero capacity or heartbeat interval is raised to 1.
    pub fn new(mut config: StreamConfig) -> Self {
        // A zero-capacity queue would block every sender forever
        config.capacity = config.capacity.max(1);
        config.heartbeat_interval_secs = config.heartbeat_interval_secs.max(1);
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Effective settings, after clamping
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open a channel, or return the existing one with this id
    pub fn open(&self, stream_id: impl Into<String>) -> StreamHandle {
        let stream_id = stream_id.into();
        let mut streams = self.streams.write();
        let state = streams
            .entry(stream_id.clone())
            .or_insert_with(|| {
                info!(stream_id = %stream_id, "Stream created");
                Arc::new(StreamState::new(stream_id.clone()))
            })
            .clone();

        StreamHandle {
            state,
            registry: Arc::clone(&self.streams),
            config: self.config.clone(),
        }
    }

    /// Handle to an already open channel
    pub fn handle(&self, stream_id: &str) -> Option<StreamHandle> {
        let state = self.streams.read().get(stream_id).cloned()?;
        Some(StreamHandle {
            state,
            registry: Arc::clone(&self.streams),
            config: self.config.clone(),
        })
    }

    /// Enqueue an event. Unknown channels are logged and ignored.
    pub async fn send(&self, stream_id: &str, event_type: &str, data: Value) -> SendOutcome {
        let Some(state) = self.streams.read().get(stream_id).cloned() else {
            warn!(stream_id, event_type, "Send to unknown stream");
            return SendOutcome::ChannelAbsent;
        };

        let outcome = state
            .push(
                StreamEvent::new(event_type, data),
                self.config.capacity,
                self.config.backpressure,
            )
            .await;

        match outcome {
            SendOutcome::Rejected => warn!(stream_id, event_type, "Stream full, event rejected"),
            SendOutcome::DroppedOldest => debug!(stream_id, "Stream full, dropped oldest event"),
            SendOutcome::ChannelAbsent => warn!(stream_id, event_type, "Send to closed stream"),
            SendOutcome::Delivered => {}
        }
        outcome
    }

    /// Consume a channel by id. An unknown id yields an error frame and `end`.
    pub fn consume(&self, stream_id: &str) -> BoxStream<'static, StreamFrame> {
        match self.handle(stream_id) {
            Some(handle) => handle.consume(),
            None => {
                warn!(stream_id, "Consume on unknown stream");
                futures::stream::iter(vec![
                    StreamFrame::error(format!("unknown stream {stream_id}")),
                    StreamFrame::end(),
                ])
                .boxed()
            }
        }
    }

    pub fn consume_sse(&self, stream_id: &str) -> BoxStream<'static, String> {
        self.consume(stream_id).map(|frame| frame.to_sse()).boxed()
    }

    /// Queue the terminal marker and forget the channel. Unknown ids are a no-op.
    pub fn close(&self, stream_id: &str) -> bool {
        let Some(state) = self.streams.write().remove(stream_id) else {
            return false;
        };
        let closed = state.shut();
        info!(stream_id, "Stream closed");
        closed
    }

    /// Metadata for an open channel
    pub fn info(&self, stream_id: &str) -> Option<StreamInfo> {
        self.streams.read().get(stream_id).map(|s| s.info())
    }

    /// Ids of all open channels
    pub fn active_streams(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}
