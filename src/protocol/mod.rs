//! Agent-to-agent messaging protocol
//!
//! Wraps a [`SocketChannel`] for one agent identity: a handler table for
//! incoming message types, a pending-request table for correlated
//! replies, and a pump that drains the channel and routes messages.

pub mod message;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

pub use message::{AgentMessage, MessageType, BROADCAST};

use crate::channel::SocketChannel;
use crate::error::{ConductorError, Result};

/// How long one pump iteration waits for an incoming message
const PUMP_POLL: Duration = Duration::from_millis(100);
/// Completed request ids remembered for duplicate detection
const COMPLETED_MEMORY: usize = 256;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(AgentMessage) -> HandlerFuture + Send + Sync>;

struct PendingRequest {
    deadline: Instant,
    reply: oneshot::Sender<AgentMessage>,
}

/// Protocol endpoint bound to one agent identity
pub struct AgentProtocol {
    agent_id: String,
    channel: Arc<SocketChannel>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    completed: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl AgentProtocol {
    pub fn new(agent_id: impl Into<String>, channel: Arc<SocketChannel>) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn channel(&self) -> &Arc<SocketChannel> {
        &self.channel
    }

    /// Register (or replace) the handler for a message type
    pub async fn register_handler<F, Fut>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.handlers.write().await.insert(message_type, handler);
    }

    /// Send a task request and register a reply slot with a deadline.
    /// Returns the message id and the receiver that yields either the
    /// correlated response or a synthetic timeout error message.
    pub async fn send_request(
        &self,
        receiver_id: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<(String, oneshot::Receiver<AgentMessage>)> {
        let message = AgentMessage::new(
            self.agent_id.clone(),
            receiver_id,
            MessageType::TaskRequest,
            payload,
        );
        let message_id = message.message_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            message_id.clone(),
            PendingRequest {
                deadline: Instant::now() + timeout,
                reply: tx,
            },
        );

        if let Err(e) = self.channel.send(&message).await {
            self.pending.lock().await.remove(&message_id);
            return Err(e);
        }

        Ok((message_id, rx))
    }

    /// Send a request and wait for its correlated reply
    pub async fn request(
        &self,
        receiver_id: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<AgentMessage> {
        let (message_id, rx) = self.send_request(receiver_id, payload, timeout).await?;
        rx.await.map_err(|_| {
            ConductorError::protocol(format!("reply slot for {} dropped", message_id))
        })
    }

    /// Send a response correlated to `request`
    pub async fn send_response(
        &self,
        request: &AgentMessage,
        payload: serde_json::Value,
    ) -> Result<()> {
        let response = AgentMessage::response_to(request, self.agent_id.clone(), payload);
        self.channel.send(&response).await
    }

    /// Send a status update to the orchestrator
    pub async fn send_status(&self, receiver_id: &str, payload: serde_json::Value) -> Result<()> {
        let message = AgentMessage::new(
            self.agent_id.clone(),
            receiver_id,
            MessageType::StatusUpdate,
            payload,
        );
        self.channel.send(&message).await
    }

    /// Drain incoming messages once, routing responses to their reply
    /// slots and everything else to registered handlers, then evict
    /// expired pending requests.
    pub async fn pump(&self) {
        while let Some(message) = self.channel.receive(PUMP_POLL).await {
            self.dispatch(message).await;
        }
        self.evict_expired().await;
    }

    /// Keep pumping until `running` is flipped off
    pub async fn run(self: Arc<Self>, running: Arc<std::sync::atomic::AtomicBool>) {
        while running.load(std::sync::atomic::Ordering::SeqCst) {
            self.pump().await;
        }
        self.fail_all_pending("shutdown").await;
    }

    async fn dispatch(&self, message: AgentMessage) {
        // The server channel feeds every relayed frame back; only act on
        // frames addressed to this identity or to everyone.
        if message.receiver_id != self.agent_id && !message.is_broadcast() {
            debug!(
                receiver = %message.receiver_id,
                "ignoring frame addressed to another peer"
            );
            return;
        }

        if message.message_type == MessageType::TaskResponse {
            if let Some(correlation_id) = message.correlation_id.clone() {
                let entry = self.pending.lock().await.remove(&correlation_id);
                match entry {
                    Some(pending) => {
                        self.remember_completed(correlation_id).await;
                        let _ = pending.reply.send(message);
                        return;
                    }
                    None => {
                        let completed = self.completed.lock().await;
                        if completed.1.contains(&correlation_id) {
                            warn!(correlation_id = %correlation_id, "dropping duplicate response");
                        } else {
                            warn!(correlation_id = %correlation_id, "response without pending request");
                        }
                        return;
                    }
                }
            }
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&message.message_type).cloned()
        };
        match handler {
            Some(handler) => handler(message).await,
            None => warn!(
                message_type = %message.message_type,
                sender = %message.sender_id,
                "no handler registered, message ignored"
            ),
        }
    }

    async fn evict_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        for (message_id, entry) in expired {
            warn!(request = %message_id, "request timed out, delivering synthetic error");
            self.remember_completed(message_id.clone()).await;
            let synthetic = AgentMessage::error_for(
                &message_id,
                self.agent_id.clone(),
                "timeout",
                "no response before deadline",
            );
            let _ = entry.reply.send(synthetic);
        }
    }

    async fn fail_all_pending(&self, kind: &str) {
        let drained: Vec<(String, PendingRequest)> =
            self.pending.lock().await.drain().collect();
        for (message_id, entry) in drained {
            let synthetic =
                AgentMessage::error_for(&message_id, self.agent_id.clone(), kind, "endpoint closed");
            let _ = entry.reply.send(synthetic);
        }
    }

    async fn remember_completed(&self, message_id: String) {
        let mut completed = self.completed.lock().await;
        if completed.0.len() >= COMPLETED_MEMORY {
            if let Some(evicted) = completed.0.pop_front() {
                completed.1.remove(&evicted);
            }
        }
        completed.0.push_back(message_id.clone());
        completed.1.insert(message_id);
    }

    /// Number of requests still awaiting a reply
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn connected_pair(dir: &TempDir) -> (Arc<SocketChannel>, Arc<SocketChannel>) {
        let path = dir.path().join("proto.sock");
        let server = Arc::new(SocketChannel::bind(&path).await.unwrap());
        let client = Arc::new(SocketChannel::connect(&path).await.unwrap());
        (server, client)
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let dir = TempDir::new().unwrap();
        let (server_chan, client_chan) = connected_pair(&dir).await;

        let orchestrator = Arc::new(AgentProtocol::new("orchestrator", server_chan));
        let agent = Arc::new(AgentProtocol::new("agent_000", client_chan));

        let agent_clone = Arc::clone(&agent);
        agent
            .register_handler(MessageType::TaskRequest, move |msg| {
                let agent = Arc::clone(&agent_clone);
                async move {
                    agent
                        .send_response(&msg, serde_json::json!({"status": "success"}))
                        .await
                        .unwrap();
                }
            })
            .await;

        // Register the peer on the server side before the orchestrator
        // sends anything to it.
        agent
            .send_status("orchestrator", serde_json::json!({"state": "idle"}))
            .await
            .unwrap();
        orchestrator.pump().await;

        let (_, reply) = orchestrator
            .send_request(
                "agent_000",
                serde_json::json!({"task_id": "t1"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(orchestrator.pending_count().await, 1);

        agent.pump().await;
        orchestrator.pump().await;

        let response = reply.await.unwrap();
        assert_eq!(response.message_type, MessageType::TaskResponse);
        assert_eq!(response.payload["status"], "success");
        assert_eq!(orchestrator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_delivers_synthetic_error() {
        let dir = TempDir::new().unwrap();
        let (server_chan, client_chan) = connected_pair(&dir).await;

        let orchestrator = Arc::new(AgentProtocol::new("orchestrator", server_chan));
        let agent = Arc::new(AgentProtocol::new("agent_000", client_chan));

        agent
            .send_status("orchestrator", serde_json::json!({"state": "idle"}))
            .await
            .unwrap();
        orchestrator.pump().await;

        let (_, reply) = orchestrator
            .send_request(
                "agent_000",
                serde_json::json!({"task_id": "t1"}),
                Duration::from_millis(50),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        orchestrator.pump().await;

        let synthetic = reply.await.unwrap();
        assert_eq!(synthetic.message_type, MessageType::Error);
        assert_eq!(synthetic.payload["kind"], "timeout");
        assert_eq!(orchestrator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored_with_warning() {
        let dir = TempDir::new().unwrap();
        let (server_chan, client_chan) = connected_pair(&dir).await;

        let orchestrator = Arc::new(AgentProtocol::new("orchestrator", server_chan));
        let agent = AgentProtocol::new("agent_000", client_chan);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        orchestrator
            .register_handler(MessageType::StatusUpdate, move |_| {
                let hits = Arc::clone(&hits_clone);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        agent
            .send_status("orchestrator", serde_json::json!({"state": "idle"}))
            .await
            .unwrap();
        // Heartbeat has no registered handler; it must not break the pump
        let heartbeat = AgentMessage::new(
            "agent_000",
            "orchestrator",
            MessageType::Heartbeat,
            serde_json::json!({}),
        );
        agent.channel().send(&heartbeat).await.unwrap();

        orchestrator.pump().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
