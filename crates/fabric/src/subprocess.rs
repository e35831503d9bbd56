//! Per-process runtime: one reader loop, a serialised writer, and a handler
//! registry dispatching each inbound REQUEST on its own task.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    message::{self, Message, MessageType},
    FabricError,
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Outcome of one handler invocation: a reply to write, or nothing for
/// fire-and-forget EVENT handlers.
pub type HandlerResult = Result<Option<Message>, FabricError>;

/// A method handler. The token is the only cancellation signal a handler may
/// observe and must not be retained past return.
pub type Handler = Arc<dyn Fn(CancellationToken, Message) -> BoxFuture<HandlerResult> + Send + Sync>;

/// Hook receiving every inbound RESPONSE/ERROR/EVENT (the RPC client's waiter
/// dispatcher).
pub type ResponseHook = Arc<dyn Fn(Message) + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |token, msg| Box::pin(f(token, msg)))
}

type DynReader = Box<dyn AsyncRead + Send + Unpin>;
type DynWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One process's end of the fabric.
///
/// Defaults to stdin/stdout; stdout must carry nothing but fabric lines, so
/// processes log to stderr. Handlers are registered during init, before
/// [`Subprocess::run`] snapshots the registry.
pub struct Subprocess {
    id: String,
    writer: Mutex<DynWriter>,
    reader: StdMutex<Option<DynReader>>,
    handlers: StdMutex<HashMap<String, Handler>>,
    response_hook: StdMutex<Option<ResponseHook>>,
}

impl Subprocess {
    /// Runtime over this process's stdin/stdout.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_io(
            id,
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        )
    }

    /// Runtime over explicit streams; the seam used by every in-memory test.
    pub fn with_io(id: impl Into<String>, reader: DynReader, writer: DynWriter) -> Self {
        Self {
            id: id.into(),
            writer: Mutex::new(writer),
            reader: StdMutex::new(Some(reader)),
            handlers: StdMutex::new(HashMap::new()),
            response_hook: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Installs a handler for `method`, replacing any previous one. Must
    /// happen before [`Subprocess::run`]; later registrations are not seen by
    /// the running loop.
    pub fn register_handler(&self, method: impl Into<String>, handler: Handler) {
        self.handlers
            .lock()
            .expect("handler registry poisoned")
            .insert(method.into(), handler);
    }

    /// Replaces the writer sink. Intended for tests.
    pub async fn set_output(&self, writer: DynWriter) {
        *self.writer.lock().await = writer;
    }

    /// Installs the hook receiving every non-REQUEST inbound message.
    pub fn set_response_hook(&self, hook: ResponseHook) {
        *self
            .response_hook
            .lock()
            .expect("response hook slot poisoned") = Some(hook);
    }

    /// Encodes and writes one message. The writer mutex serialises concurrent
    /// senders; the sink's write error is returned verbatim.
    pub async fn send(&self, msg: &Message) -> Result<(), FabricError> {
        let line = message::encode_line(msg)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(FabricError::Write)?;
        writer.flush().await.map_err(FabricError::Write)
    }

    /// The reader loop. Terminates on cancellation or EOF; a malformed line
    /// is logged and skipped. Each REQUEST dispatches on its own task under a
    /// child token, so handlers run in parallel while replies are serialised
    /// through [`Subprocess::send`].
    pub async fn run(self: &Arc<Self>, token: CancellationToken) -> Result<(), FabricError> {
        let reader = self
            .reader
            .lock()
            .expect("reader slot poisoned")
            .take()
            .ok_or(FabricError::ReaderConsumed)?;
        let handlers: Arc<HashMap<String, Handler>> = Arc::new(
            self.handlers
                .lock()
                .expect("handler registry poisoned")
                .clone(),
        );
        let hook = self
            .response_hook
            .lock()
            .expect("response hook slot poisoned")
            .clone();

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match message::decode_line(&line) {
                        Ok(msg) => self.handle_inbound(&handlers, hook.as_ref(), &token, msg),
                        Err(err) => {
                            warn!(process = %self.id, %err, "skipping malformed fabric line");
                        }
                    }
                }
                Ok(None) => {
                    debug!(process = %self.id, "fabric reader reached EOF");
                    break;
                }
                Err(err) => {
                    warn!(process = %self.id, %err, "fabric read failed; stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_inbound(
        self: &Arc<Self>,
        handlers: &Arc<HashMap<String, Handler>>,
        hook: Option<&ResponseHook>,
        token: &CancellationToken,
        msg: Message,
    ) {
        match msg.kind {
            MessageType::Request => self.dispatch(handlers, token, msg),
            MessageType::Response | MessageType::Error | MessageType::Event => match hook {
                Some(hook) => hook(msg),
                None => debug!(
                    process = %self.id,
                    id = %msg.id,
                    "no response hook installed; dropping reply"
                ),
            },
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        handlers: &Arc<HashMap<String, Handler>>,
        token: &CancellationToken,
        msg: Message,
    ) {
        let Some(handler) = handlers.get(&msg.id).cloned() else {
            let reply = Message::error_reply(&msg, FabricError::UnknownMethod(msg.id.clone()).to_string());
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.send(&reply).await {
                    warn!(process = %this.id, %err, "failed to write unknown-method reply");
                }
            });
            return;
        };

        let this = self.clone();
        let request_token = token.child_token();
        tokio::spawn(async move {
            let reply = match handler(request_token, msg.clone()).await {
                Ok(reply) => reply,
                Err(err) => Some(Message::error_reply(&msg, err.reply_text())),
            };
            if let Some(reply) = reply {
                if let Err(err) = this.send(&reply).await {
                    warn!(
                        process = %this.id,
                        method = %msg.id,
                        %err,
                        "failed to write reply"
                    );
                }
            }
        });
    }
}
