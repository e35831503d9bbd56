//! The parent process: spawns child subprocesses, pipes their stdio, and
//! routes every message by its `target` field.
//!
//! Each child's stdout feeds one central inbound queue through a dedicated
//! reader task; a single routing loop drains the queue and writes to the
//! target child's stdin. One queue plus one loop preserves send order per
//! `(source, target)` link while leaving unrelated links free to interleave.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, Mutex},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    message::{self, Message, MessageType},
    subprocess::Handler,
    FabricError,
};

/// Process identifier of the broker itself; the default RPC target.
pub const BROKER_ID: &str = "broker";

/// Environment variable children read to learn their own process ID.
pub const PROCESS_ID_ENV: &str = "PROCESS_ID";

type DynWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum BrokerEvent {
    Inbound(Message),
    Exited(String),
}

struct Route {
    writer: DynWriter,
    child: Option<Child>,
}

struct PendingRpc {
    source: String,
    target: String,
    method: String,
}

/// The routing hub. Construct once, spawn children, then drive [`Broker::run`].
pub struct Broker {
    handlers: StdMutex<HashMap<String, Handler>>,
    routes: Mutex<HashMap<String, Route>>,
    pending: StdMutex<HashMap<String, PendingRpc>>,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<BrokerEvent>>>,
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<Message>>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            handlers: StdMutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            subscribers: StdMutex::new(Vec::new()),
        }
    }

    /// Installs a local handler for requests addressed to the broker itself.
    /// Must happen before [`Broker::run`].
    pub fn register_handler(&self, method: impl Into<String>, handler: Handler) {
        self.handlers
            .lock()
            .expect("handler registry poisoned")
            .insert(method.into(), handler);
    }

    /// Receives every event delivered to the broker: self-targeted messages
    /// and EVENTs addressed to it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// IDs of the currently live routes.
    pub async fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Launches a child with `PROCESS_ID=id`, captures its stdio, and records
    /// a routing entry for it. Stderr lines are relayed to the log.
    pub async fn spawn_rpc(
        &self,
        id: impl Into<String>,
        program: impl Into<String>,
        args: &[String],
    ) -> Result<(), FabricError> {
        let id = id.into();
        let program = program.into();
        let mut command = Command::new(&program);
        command
            .args(args)
            .env(PROCESS_ID_ENV, &id)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // A child that cannot spawn fails broker startup; there is no retry.
        let mut child = command.spawn().map_err(|source| FabricError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FabricError::ChildIo(id.clone()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FabricError::ChildIo(id.clone()))?;
        if let Some(stderr) = child.stderr.take() {
            let stderr_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(child = %stderr_id, "{line}");
                }
            });
        }

        self.attach_reader(&id, stdout);
        self.routes.lock().await.insert(
            id.clone(),
            Route {
                writer: Box::new(stdin),
                child: Some(child),
            },
        );
        info!(child = %id, program = %program, "spawned fabric child");
        Ok(())
    }

    /// Registers an already-connected peer (no child process). The seam the
    /// in-process tests use; also handy for same-process services.
    pub async fn attach_peer(
        &self,
        id: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) {
        let id = id.into();
        self.attach_reader(&id, reader);
        self.routes.lock().await.insert(
            id,
            Route {
                writer: Box::new(writer),
                child: None,
            },
        );
    }

    fn attach_reader(&self, id: &str, reader: impl AsyncRead + Send + Unpin + 'static) {
        let events = self.events_tx.clone();
        let reader_id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match message::decode_line(&line) {
                    Ok(msg) => {
                        if events.send(BrokerEvent::Inbound(msg)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(child = %reader_id, %err, "skipping malformed line from child");
                    }
                }
            }
            let _ = events.send(BrokerEvent::Exited(reader_id));
        });
    }

    /// The routing loop. Runs until cancellation; child exits and routing
    /// errors never terminate it.
    pub async fn run(&self, token: CancellationToken) -> Result<(), FabricError> {
        let mut events = self
            .events_rx
            .lock()
            .expect("event queue slot poisoned")
            .take()
            .ok_or(FabricError::ReaderConsumed)?;
        let handlers: Arc<HashMap<String, Handler>> = Arc::new(
            self.handlers
                .lock()
                .expect("handler registry poisoned")
                .clone(),
        );

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                BrokerEvent::Inbound(msg) => self.route(&handlers, &token, msg).await,
                BrokerEvent::Exited(id) => self.handle_exit(&id).await,
            }
        }
        Ok(())
    }

    async fn route(
        &self,
        handlers: &Arc<HashMap<String, Handler>>,
        token: &CancellationToken,
        msg: Message,
    ) {
        // A message addressed to its own sender is an event, not traffic to
        // forward.
        if !msg.source.is_empty() && msg.target == msg.source {
            self.publish(msg);
            return;
        }

        if msg.target == BROKER_ID {
            match msg.kind {
                MessageType::Request => self.dispatch_local(handlers, token, msg),
                _ => self.publish(msg),
            }
            return;
        }

        match msg.kind {
            MessageType::Request => {
                self.pending.lock().expect("pending table poisoned").insert(
                    msg.correlation_id.clone(),
                    PendingRpc {
                        source: msg.source.clone(),
                        target: msg.target.clone(),
                        method: msg.id.clone(),
                    },
                );
            }
            MessageType::Response | MessageType::Error => {
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&msg.correlation_id);
            }
            MessageType::Event => {}
        }

        if !self.forward(&msg).await {
            self.pending
                .lock()
                .expect("pending table poisoned")
                .remove(&msg.correlation_id);
            if msg.kind == MessageType::Request {
                let text = FabricError::UnknownTarget(msg.target.clone()).to_string();
                let mut reply = Message::error_reply(&msg, text);
                reply.source = BROKER_ID.to_string();
                self.deliver(reply).await;
            } else {
                debug!(target = %msg.target, id = %msg.id, "dropping unroutable reply");
            }
        }
    }

    /// Writes `msg` to its target's stdin. Returns false when no live route
    /// exists or the write fails.
    async fn forward(&self, msg: &Message) -> bool {
        let line = match message::encode_line(msg) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to encode message for forwarding");
                return false;
            }
        };
        let mut routes = self.routes.lock().await;
        let Some(route) = routes.get_mut(&msg.target) else {
            return false;
        };
        if let Err(err) = route.writer.write_all(line.as_bytes()).await {
            warn!(child = %msg.target, %err, "write to child failed; dropping route");
            routes.remove(&msg.target);
            return false;
        }
        if let Err(err) = route.writer.flush().await {
            warn!(child = %msg.target, %err, "flush to child failed; dropping route");
            routes.remove(&msg.target);
            return false;
        }
        true
    }

    /// Delivers an already-built reply to its target, or to subscribers when
    /// the target is the broker. Never fabricates further errors.
    async fn deliver(&self, msg: Message) {
        if msg.target == BROKER_ID || msg.target.is_empty() {
            self.publish(msg);
            return;
        }
        if !self.forward(&msg).await {
            debug!(target = %msg.target, "dropping undeliverable reply");
        }
    }

    fn dispatch_local(
        &self,
        handlers: &Arc<HashMap<String, Handler>>,
        token: &CancellationToken,
        msg: Message,
    ) {
        let events = self.events_tx.clone();
        let Some(handler) = handlers.get(&msg.id).cloned() else {
            let reply = Message::error_reply(&msg, FabricError::UnknownMethod(msg.id.clone()).to_string());
            let _ = events.send(BrokerEvent::Inbound(reply));
            return;
        };
        let request_token = token.child_token();
        tokio::spawn(async move {
            let reply = match handler(request_token, msg.clone()).await {
                Ok(reply) => reply,
                Err(err) => Some(Message::error_reply(&msg, err.reply_text())),
            };
            if let Some(reply) = reply {
                let _ = events.send(BrokerEvent::Inbound(reply));
            }
        });
    }

    async fn handle_exit(&self, id: &str) {
        let removed = self.routes.lock().await.remove(id);
        if let Some(route) = removed {
            if let Some(mut child) = route.child {
                let reap_id = id.to_string();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => info!(child = %reap_id, %status, "child exited"),
                        Err(err) => warn!(child = %reap_id, %err, "failed to reap child"),
                    }
                });
            } else {
                info!(peer = %id, "peer disconnected");
            }
        }

        // Waiters on the dead child would otherwise hang until timeout.
        let orphaned: Vec<(String, PendingRpc)> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let correlation_ids: Vec<String> = pending
                .iter()
                .filter(|(_, rpc)| rpc.target == id)
                .map(|(correlation_id, _)| correlation_id.clone())
                .collect();
            correlation_ids
                .into_iter()
                .filter_map(|correlation_id| {
                    pending
                        .remove(&correlation_id)
                        .map(|rpc| (correlation_id, rpc))
                })
                .collect()
        };
        for (correlation_id, rpc) in orphaned {
            let reply = Message {
                kind: MessageType::Error,
                id: rpc.method,
                correlation_id,
                source: BROKER_ID.to_string(),
                target: rpc.source,
                payload: None,
                error: FabricError::ChildDead(rpc.target).to_string(),
            };
            self.deliver(reply).await;
        }
    }

    fn publish(&self, msg: Message) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
        if subscribers.is_empty() {
            debug!(id = %msg.id, source = %msg.source, "event with no subscribers dropped");
        }
    }

    /// Closes every child's stdin, waits up to `grace` for exits, then kills
    /// whatever remains.
    pub async fn shutdown(&self, grace: Duration) {
        let drained: Vec<(String, Route)> = self.routes.lock().await.drain().collect();
        let mut waits = Vec::new();
        for (id, route) in drained {
            drop(route.writer);
            let Some(mut child) = route.child else {
                continue;
            };
            waits.push(tokio::spawn(async move {
                match time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!(child = %id, %status, "child drained"),
                    Ok(Err(err)) => warn!(child = %id, %err, "failed to wait for child"),
                    Err(_) => {
                        warn!(child = %id, "shutdown grace expired; killing");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }));
        }
        for wait in waits {
            let _ = wait.await;
        }
    }
}
