//! The CWE import pipeline: one long-running loop fetching view pages from
//! the remote service and persisting each item via the local store.
//!
//! Single-writer state machine: only the controller mutates its own
//! `running`/`cancel` fields, always under its internal lock. Concurrent
//! `start` calls are refused while a session is live.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use fabric::{unmarshal_payload, FabricError, RpcClient};

use crate::JobError;

/// Method invoked on the remote fetcher for one page of CWE views.
pub const FETCH_VIEWS_METHOD: &str = "RPCFetchCWEViews";
/// Method invoked on the local store for each fetched view.
pub const SAVE_VIEW_METHOD: &str = "RPCSaveCWEView";

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub remote_target: String,
    pub local_target: String,
    pub page_size: u64,
    /// Backoff after a failed fetch before retrying the same page.
    pub retry_backoff: Duration,
    /// Pause between successfully processed pages.
    pub batch_delay: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            remote_target: "remote".to_string(),
            local_target: "local".to_string(),
            page_size: 100,
            retry_backoff: Duration::from_secs(5),
            batch_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobParams {
    #[serde(default)]
    pub start_index: u64,
    #[serde(default)]
    pub page_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_unix: Option<u64>,
}

#[derive(Default)]
struct JobState {
    running: bool,
    cancel: Option<CancellationToken>,
    session_id: Option<String>,
    started_at: Option<SystemTime>,
}

#[derive(Debug, Deserialize)]
struct ViewPage {
    #[serde(default)]
    views: Vec<Value>,
}

pub struct JobController {
    client: Arc<RpcClient>,
    config: JobConfig,
    state: Mutex<JobState>,
}

impl JobController {
    pub fn new(client: Arc<RpcClient>, config: JobConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            state: Mutex::new(JobState::default()),
        })
    }

    /// Begins a new import session, refusing when one is already live.
    pub fn start(self: &Arc<Self>, params: JobParams) -> Result<String, JobError> {
        let token = CancellationToken::new();
        let session_id = Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().expect("job state poisoned");
            if state.running {
                return Err(JobError::AlreadyRunning);
            }
            state.running = true;
            state.cancel = Some(token.clone());
            state.session_id = Some(session_id.clone());
            state.started_at = Some(SystemTime::now());
        }

        let this = self.clone();
        let loop_session = session_id.clone();
        tokio::spawn(async move {
            this.run_loop(&token, &params).await;
            this.finish(&loop_session);
        });
        Ok(session_id)
    }

    /// Cancels the named session. Stale or unknown session IDs are refused.
    pub fn stop(&self, session_id: &str) -> Result<(), JobError> {
        let mut state = self.state.lock().expect("job state poisoned");
        if !state.running || state.session_id.as_deref() != Some(session_id) {
            return Err(JobError::NotRunning);
        }
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.running = false;
        state.session_id = None;
        state.started_at = None;
        info!(session = %session_id, "import job stopped");
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        let state = self.state.lock().expect("job state poisoned");
        JobStatus {
            running: state.running,
            session_id: state.session_id.clone(),
            started_at_unix: state.started_at.and_then(|at| {
                at.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("job state poisoned").running
    }

    async fn run_loop(&self, token: &CancellationToken, params: &JobParams) {
        let page_size = params.page_size.unwrap_or(self.config.page_size).max(1);
        let mut start_index = params.start_index;
        info!(start_index, page_size, "import job started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let fetch = self
                .client
                .invoke_rpc_with_target(
                    token,
                    &self.config.remote_target,
                    FETCH_VIEWS_METHOD,
                    &json!({"start_index": start_index, "page_size": page_size}),
                )
                .await;
            let reply = match fetch {
                Ok(reply) => reply,
                Err(FabricError::Cancelled) => break,
                Err(err) => {
                    warn!(%err, start_index, "fetch failed; backing off");
                    if !self.pause(token, self.config.retry_backoff).await {
                        break;
                    }
                    continue;
                }
            };
            if let Some(text) = reply.is_error() {
                warn!(error = %text, start_index, "remote refused fetch; backing off");
                if !self.pause(token, self.config.retry_backoff).await {
                    break;
                }
                continue;
            }

            let page: ViewPage = match unmarshal_payload(&reply) {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, start_index, "unreadable view page; backing off");
                    if !self.pause(token, self.config.retry_backoff).await {
                        break;
                    }
                    continue;
                }
            };
            if page.views.is_empty() {
                info!(start_index, "import complete; no more views");
                break;
            }

            for view in &page.views {
                match self
                    .client
                    .invoke_rpc_with_target(token, &self.config.local_target, SAVE_VIEW_METHOD, view)
                    .await
                {
                    Ok(saved) => {
                        if let Some(text) = saved.is_error() {
                            warn!(error = %text, "failed to save view; continuing batch");
                        }
                    }
                    Err(FabricError::Cancelled) => return,
                    Err(err) => warn!(%err, "failed to save view; continuing batch"),
                }
            }

            start_index += page_size;
            if !self.pause(token, self.config.batch_delay).await {
                break;
            }
        }
    }

    /// Sleeps for `delay` unless cancelled first; returns false on cancel.
    async fn pause(&self, token: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Clears the state when the loop exits on its own. A `stop` (or a newer
    /// session) may already have moved the state on; never clobber it.
    fn finish(&self, session_id: &str) {
        let mut state = self.state.lock().expect("job state poisoned");
        if state.session_id.as_deref() == Some(session_id) {
            state.running = false;
            state.cancel = None;
            state.session_id = None;
            state.started_at = None;
        }
    }
}
