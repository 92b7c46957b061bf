use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, RunEventStream, RunRequest};
use crate::config::ClientConfig;
use crate::session::ClientUpdate;
use crate::timeline::Generation;

pub const SEARCH_SERVICE_ERROR_TEXT: &str =
    "Dịch vụ tìm kiếm đang gặp sự cố. Vui lòng thử lại sau.";
pub const UNSTABLE_CONNECTION_TEXT: &str =
    "Kết nối không ổn định. Vui lòng kiểm tra mạng và thử lại.";

const TRANSPORT_ERROR_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "connection closed",
    "dns error",
    "502",
    "503",
    "504",
    "network unreachable",
    "broken pipe",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Submitting,
    Streaming,
    RetryPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Abort,
    BackendService,
    Transport,
    Other,
}

pub fn classify_error(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();
    if lowered.contains("abort") || lowered.contains("cancel") {
        return ErrorClass::Abort;
    }
    if lowered.contains("search api") {
        return ErrorClass::BackendService;
    }
    if TRANSPORT_ERROR_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return ErrorClass::Transport;
    }
    ErrorClass::Other
}

/// How a stream failure was resolved, for the coordinator to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Belonged to a superseded turn; nothing to do.
    Stale,
    /// Expected (abort/cancel); never shown to the user.
    Silent,
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },
    SurfaceError {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            exponential: false,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            exponential: config.retry_backoff_exponential,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.base_delay * (1u32 << attempt.saturating_sub(1).min(2))
        } else {
            self.base_delay
        }
    }
}

#[async_trait]
pub trait RunTransport: Send + Sync {
    async fn open(&self, request: &RunRequest) -> Result<Box<dyn RunEvents>>;
}

#[async_trait]
pub trait RunEvents: Send {
    async fn next_event(&mut self) -> Result<Option<Value>>;
}

#[async_trait]
impl RunEvents for RunEventStream {
    async fn next_event(&mut self) -> Result<Option<Value>> {
        RunEventStream::next_event(self).await
    }
}

pub struct HttpRunTransport {
    api: ApiClient,
}

impl HttpRunTransport {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl RunTransport for HttpRunTransport {
    async fn open(&self, request: &RunRequest) -> Result<Box<dyn RunEvents>> {
        Ok(Box::new(self.api.start_run(request).await?))
    }
}

/// Owns the streaming connection lifecycle for research runs: spawning the
/// reader task, classifying failures, scheduling bounded retries of the last
/// payload, and cancelling everything on demand. Updates flow to the
/// coordinator through the shared channel, stamped with the generation the
/// run was submitted under.
pub struct RunSupervisor {
    transport: Arc<dyn RunTransport>,
    updates: flume::Sender<ClientUpdate>,
    policy: RetryPolicy,
    phase: RunPhase,
    generation: Generation,
    last_payload: Option<RunRequest>,
    retry_attempts: u32,
    run_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl RunSupervisor {
    pub fn new(
        transport: Arc<dyn RunTransport>,
        updates: flume::Sender<ClientUpdate>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            updates,
            policy,
            phase: RunPhase::Idle,
            generation: 0,
            last_payload: None,
            retry_attempts: 0,
            run_task: None,
            retry_task: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Starts a fresh run, superseding whatever was in flight.
    pub fn submit(&mut self, generation: Generation, request: RunRequest) {
        self.abort_tasks();
        self.generation = generation;
        self.retry_attempts = 0;
        self.last_payload = Some(request.clone());
        self.spawn_run(generation, request);
    }

    /// Re-issues the last payload under a new generation, keeping the retry
    /// attempt count.
    pub fn resubmit(&mut self, generation: Generation) -> bool {
        let Some(request) = self.last_payload.clone() else {
            return false;
        };
        self.abort_tasks();
        self.generation = generation;
        self.spawn_run(generation, request);
        true
    }

    /// Marks the stream live once its first event arrives.
    pub fn note_stream_activity(&mut self, generation: Generation) {
        if generation == self.generation && self.phase == RunPhase::Submitting {
            self.phase = RunPhase::Streaming;
        }
    }

    pub fn handle_finished(&mut self, generation: Generation) -> bool {
        if generation != self.generation || self.phase == RunPhase::Idle {
            return false;
        }
        self.phase = RunPhase::Idle;
        self.retry_attempts = 0;
        true
    }

    pub fn handle_failure(&mut self, generation: Generation, error: &str) -> FailureOutcome {
        if generation != self.generation {
            return FailureOutcome::Stale;
        }
        if self.phase == RunPhase::Idle {
            // The user already cancelled this run; its dying gasp is expected.
            debug!("Ignoring failure from cancelled run: {error}");
            return FailureOutcome::Silent;
        }

        match classify_error(error) {
            ErrorClass::Abort => {
                debug!("Run stream aborted: {error}");
                self.abort_retry_task();
                self.phase = RunPhase::Idle;
                FailureOutcome::Silent
            }
            ErrorClass::BackendService => {
                warn!("Research backend reported a service failure: {error}");
                self.phase = RunPhase::Idle;
                self.retry_attempts = 0;
                FailureOutcome::SurfaceError {
                    message: SEARCH_SERVICE_ERROR_TEXT.to_string(),
                }
            }
            ErrorClass::Transport => {
                if self.retry_attempts < self.policy.max_retries && self.last_payload.is_some() {
                    self.retry_attempts += 1;
                    let attempt = self.retry_attempts;
                    let delay = self.policy.delay_for(attempt);
                    info!(
                        "Stream failed ({error}); retry {attempt}/{} in {delay:?}",
                        self.policy.max_retries
                    );
                    self.phase = RunPhase::RetryPending;
                    self.schedule_retry(generation, delay);
                    FailureOutcome::RetryScheduled { attempt, delay }
                } else {
                    warn!("Stream failed after {} retries: {error}", self.retry_attempts);
                    self.phase = RunPhase::Idle;
                    self.retry_attempts = 0;
                    FailureOutcome::SurfaceError {
                        message: UNSTABLE_CONNECTION_TEXT.to_string(),
                    }
                }
            }
            ErrorClass::Other => {
                warn!("Run stream failed: {error}");
                self.phase = RunPhase::Idle;
                self.retry_attempts = 0;
                FailureOutcome::SurfaceError {
                    message: error.to_string(),
                }
            }
        }
    }

    /// Checks that a fired retry timer still belongs to the current turn.
    pub fn retry_due(&mut self, generation: Generation) -> bool {
        if generation != self.generation || self.phase != RunPhase::RetryPending {
            return false;
        }
        self.retry_task = None;
        true
    }

    pub fn cancel(&mut self) {
        self.abort_tasks();
        self.phase = RunPhase::Idle;
        self.retry_attempts = 0;
    }

    fn spawn_run(&mut self, generation: Generation, request: RunRequest) {
        self.phase = RunPhase::Submitting;
        let transport = Arc::clone(&self.transport);
        let updates = self.updates.clone();
        self.run_task = Some(tokio::spawn(async move {
            let mut events = match transport.open(&request).await {
                Ok(events) => events,
                Err(error) => {
                    let _ = updates.send(ClientUpdate::RunFailed {
                        generation,
                        error: format!("{error:#}"),
                    });
                    return;
                }
            };

            loop {
                match events.next_event().await {
                    Ok(Some(event)) => {
                        let _ = updates.send(ClientUpdate::RunEvent { generation, event });
                    }
                    Ok(None) => {
                        let _ = updates.send(ClientUpdate::RunFinished { generation });
                        break;
                    }
                    Err(error) => {
                        let _ = updates.send(ClientUpdate::RunFailed {
                            generation,
                            error: format!("{error:#}"),
                        });
                        break;
                    }
                }
            }
        }));
    }

    fn schedule_retry(&mut self, generation: Generation, delay: Duration) {
        self.abort_retry_task();
        let updates = self.updates.clone();
        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = updates.send(ClientUpdate::RetryFire { generation });
        }));
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.run_task.take() {
            task.abort();
        }
        self.abort_retry_task();
    }

    fn abort_retry_task(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }
}

impl Drop for RunSupervisor {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
