//! Connection supervisor (§4.H): owns the WebSocket, the event-routing
//! trie, keep-alive, reconnect backoff, and session-health monitoring.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};

use crate::binary_node::{BinaryNode, NodeContent};
use crate::error::{SupervisorError, TransportError};
use crate::transport::WsTransport;

type Handler = Box<dyn Fn(&BinaryNode) + Send + Sync>;

const KEEP_ALIVE_FAILURE_LIMIT: u32 = 6;
const RATE_LIMIT_MAX_RETRIES: u32 = 20;
const RATE_LIMIT_JITTER_MIN_MS: u64 = 300;
const RATE_LIMIT_JITTER_MAX_MS: u64 = 1000;
const RECONNECT_BASE_NETWORK_ERROR: Duration = Duration::from_secs(2);
const RECONNECT_BASE_OTHER: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const RECONNECT_MAX_ATTEMPTS: u32 = 5;
const SEND_QUEUE_MIN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct AttrRoutes {
    handlers: Vec<Handler>,
    by_child: HashMap<String, Vec<Handler>>,
}

#[derive(Default)]
struct TagRoutes {
    handlers: Vec<Handler>,
    by_attr: HashMap<(String, String), AttrRoutes>,
    by_child_only: HashMap<String, Vec<Handler>>,
}

/// A small trie of `(tag, attr-matchers, child-tag)` nodes, registered
/// once at construction, dispatched against every decrypted frame (§4.H
/// "Event routing").
#[derive(Default)]
pub struct EventRouter {
    by_tag: HashMap<String, TagRoutes>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `CB:tag`
    pub fn on_tag(&mut self, tag: &str, handler: Handler) {
        self.by_tag.entry(tag.to_owned()).or_default().handlers.push(handler);
    }

    /// `CB:tag,attr:value`
    pub fn on_tag_attr(&mut self, tag: &str, attr: &str, value: &str, handler: Handler) {
        self.by_tag
            .entry(tag.to_owned())
            .or_default()
            .by_attr
            .entry((attr.to_owned(), value.to_owned()))
            .or_default()
            .handlers
            .push(handler);
    }

    /// `CB:tag,attr:value,childTag`
    pub fn on_tag_attr_child(&mut self, tag: &str, attr: &str, value: &str, child_tag: &str, handler: Handler) {
        self.by_tag
            .entry(tag.to_owned())
            .or_default()
            .by_attr
            .entry((attr.to_owned(), value.to_owned()))
            .or_default()
            .by_child
            .entry(child_tag.to_owned())
            .or_default()
            .push(handler);
    }

    /// `CB:tag,,childTag`
    pub fn on_tag_child(&mut self, tag: &str, child_tag: &str, handler: Handler) {
        self.by_tag.entry(tag.to_owned()).or_default().by_child_only.entry(child_tag.to_owned()).or_default().push(handler);
    }

    /// Fires every handler whose selector matches `node`, most general
    /// (`CB:tag`) first.
    pub fn dispatch(&self, node: &BinaryNode) {
        let Some(routes) = self.by_tag.get(&node.tag) else { return };

        for handler in &routes.handlers {
            handler(node);
        }

        let child_tags: Vec<&str> = match &node.content {
            NodeContent::Nodes(children) => children.iter().map(|child| child.tag.as_str()).collect(),
            _ => Vec::new(),
        };

        for child_tag in &child_tags {
            if let Some(handlers) = routes.by_child_only.get(*child_tag) {
                for handler in handlers {
                    handler(node);
                }
            }
        }

        for (key, value) in &node.attrs {
            let Some(attr_routes) = routes.by_attr.get(&(key.clone(), value.clone())) else { continue };
            for handler in &attr_routes.handlers {
                handler(node);
            }
            for child_tag in &child_tags {
                if let Some(handlers) = attr_routes.by_child.get(*child_tag) {
                    for handler in handlers {
                        handler(node);
                    }
                }
            }
        }
    }
}

/// Tracks reconnect backoff state; resets on a successful `open`.
struct ReconnectState {
    attempt: u32,
    network_error: bool,
}

impl ReconnectState {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= RECONNECT_MAX_ATTEMPTS {
            return None;
        }
        let base = if self.network_error { RECONNECT_BASE_NETWORK_ERROR } else { RECONNECT_BASE_OTHER };
        let delay = base.saturating_mul(1 << self.attempt).min(RECONNECT_CAP);
        self.attempt += 1;
        Some(delay)
    }
}

/// Owns the socket, routes inbound stanzas, and keeps the connection
/// alive. Each background task it spawns is tracked in `tasks`, drained
/// by [`Supervisor::end`].
pub struct Supervisor {
    transport: Arc<Mutex<Option<WsTransport>>>,
    router: Arc<EventRouter>,
    pending_replies: Arc<DashMap<String, oneshot::Sender<BinaryNode>>>,
    keep_alive_failures: Arc<AtomicU32>,
    last_message_recv: Arc<Mutex<Instant>>,
    reconnect: Arc<Mutex<ReconnectState>>,
    tasks: Mutex<JoinSet<()>>,
    keep_alive_interval: Duration,
}

impl Supervisor {
    pub fn new(transport: WsTransport, router: EventRouter, keep_alive_interval: Duration) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Some(transport))),
            router: Arc::new(router),
            pending_replies: Arc::new(DashMap::new()),
            keep_alive_failures: Arc::new(AtomicU32::new(0)),
            last_message_recv: Arc::new(Mutex::new(Instant::now())),
            reconnect: Arc::new(Mutex::new(ReconnectState { attempt: 0, network_error: false })),
            tasks: Mutex::new(JoinSet::new()),
            keep_alive_interval,
        }
    }

    /// Sends `node`, assigning an `id` attribute if absent, and awaits the
    /// matching `TAG:{id}` reply, retrying up to 20 times on `code=429`
    /// with 300-1000ms jitter.
    pub async fn query(&self, mut node: BinaryNode, timeout: Duration) -> Result<BinaryNode, SupervisorError> {
        let id = node.attrs.entry("id".to_owned()).or_insert_with(generate_query_id).clone();

        for _attempt in 0..=RATE_LIMIT_MAX_RETRIES {
            let (tx, rx) = oneshot::channel();
            self.pending_replies.insert(id.clone(), tx);

            self.send_raw(&node).await?;

            let reply = tokio::time::timeout(timeout, rx).await.map_err(|_| SupervisorError::QueryTimedOut(id.clone()))?;
            let Ok(reply) = reply else {
                return Err(SupervisorError::QueryTimedOut(id.clone()));
            };

            if reply.attrs.get("code").map(String::as_str) == Some("429") {
                let jitter_ms = rand::rng().random_range(RATE_LIMIT_JITTER_MIN_MS..=RATE_LIMIT_JITTER_MAX_MS);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                continue;
            }

            return Ok(reply);
        }

        Err(SupervisorError::RateLimited)
    }

    async fn send_raw(&self, node: &BinaryNode) -> Result<(), SupervisorError> {
        let encoded = crate::binary_node::encode(node).map_err(|_| SupervisorError::Transport(TransportError::InvalidFrame("encode failed")))?;
        let mut guard = self.transport.lock().await;
        let Some(transport) = guard.as_mut() else { return Err(SupervisorError::Transport(TransportError::Closed)) };
        transport.send_frame(&encoded).await?;
        Ok(())
    }

    /// Dispatches one inbound frame: resolves `TAG:{id}` replies and fans
    /// the rest out through the router.
    pub async fn on_frame(&self, node: BinaryNode) {
        *self.last_message_recv.lock().await = Instant::now();

        if let Some(id) = node.attrs.get("id").cloned() {
            if let Some((_, sender)) = self.pending_replies.remove(&id) {
                let _ = sender.send(node);
                return;
            }
        }

        self.router.dispatch(&node);
    }

    /// Spawns the keep-alive ticker as a named background task.
    pub async fn spawn_keep_alive(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        self.tasks.lock().await.spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.keep_alive_interval);
            loop {
                ticker.tick().await;

                let ping = BinaryNode {
                    tag: "iq".to_owned(),
                    attrs: HashMap::from([("type".to_owned(), "get".to_owned()), ("xmlns".to_owned(), "w:p".to_owned())]),
                    content: NodeContent::Nodes(vec![BinaryNode { tag: "ping".to_owned(), attrs: HashMap::new(), content: NodeContent::Empty }]),
                };

                let is_closed = supervisor.transport.lock().await.is_none();
                if is_closed {
                    supervisor.request_reconnect().await;
                    continue;
                }

                match supervisor.query(ping, Duration::from_secs(10)).await {
                    Ok(_) => supervisor.keep_alive_failures.store(0, Ordering::SeqCst),
                    Err(_) => {
                        let failures = supervisor.keep_alive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        if failures >= KEEP_ALIVE_FAILURE_LIMIT {
                            tracing::warn!(failures, "keep-alive failure limit reached, ending connection");
                            supervisor.end().await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Spawns the independent session-health timer (§4.H "Session
    /// health"): if the socket is closed and no message has arrived for
    /// 10x the keep-alive interval, triggers reconnection.
    pub async fn spawn_session_health(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let threshold = supervisor.keep_alive_interval * 10;
        self.tasks.lock().await.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;

                let is_closed = supervisor.transport.lock().await.is_none();
                if !is_closed {
                    continue;
                }

                let elapsed = supervisor.last_message_recv.lock().await.elapsed();
                if elapsed > threshold {
                    supervisor.request_reconnect().await;
                }
            }
        });
    }

    async fn request_reconnect(&self) {
        let delay = self.reconnect.lock().await.next_delay();
        match delay {
            Some(delay) => {
                tracing::info!(?delay, "scheduling reconnect attempt");
                tokio::time::sleep(delay).await;
            }
            None => {
                tracing::warn!("reconnect attempts exhausted");
            }
        }
    }

    /// Marks a successful reconnect, resetting both backoff counters.
    pub async fn on_reconnected(&self, transport: WsTransport) {
        *self.transport.lock().await = Some(transport);
        self.keep_alive_failures.store(0, Ordering::SeqCst);
        self.reconnect.lock().await.reset();
    }

    /// Drains every tracked background task, aborting anything still
    /// running.
    pub async fn end(&self) {
        *self.transport.lock().await = None;
        self.tasks.lock().await.abort_all();
    }
}

fn generate_query_id() -> String {
    use rand_core::{OsRng, RngCore};
    let mut raw = [0_u8; 8];
    OsRng.fill_bytes(&mut raw);
    format!("{:016X}", u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn leaf(tag: &str) -> BinaryNode {
        BinaryNode { tag: tag.to_owned(), attrs: HashMap::new(), content: NodeContent::Empty }
    }

    #[test]
    fn dispatches_tag_only_handler() {
        let mut router = EventRouter::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        router.on_tag("iq", Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        router.dispatch(&leaf("iq"));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn dispatches_tag_attr_child_handler_only_on_full_match() {
        let mut router = EventRouter::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        router.on_tag_attr_child("iq", "type", "set", "pair-device", Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        let node = BinaryNode {
            tag: "iq".to_owned(),
            attrs: HashMap::from([("type".to_owned(), "set".to_owned())]),
            content: NodeContent::Nodes(vec![leaf("pair-device")]),
        };
        router.dispatch(&node);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn reconnect_backoff_doubles_and_caps() {
        let mut state = ReconnectState { attempt: 0, network_error: true };
        assert_eq!(state.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(state.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(state.next_delay(), Some(Duration::from_secs(8)));
        assert_eq!(state.next_delay(), Some(Duration::from_secs(16)));
        assert_eq!(state.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(state.next_delay(), None);
    }
}
