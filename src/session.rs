use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{ApiClient, AspectRatio, EffortLevel, IntentResponse, RunRequest};
use crate::config::ClientConfig;
use crate::events::{classify, EventTitle, ProcessedEvent, SourceRef};
use crate::image_tasks::{ImageTaskOutcome, ImageTaskTracker};
use crate::research_store::{generate_session_id, ResearchSession, ResearchStore};
use crate::supervisor::{FailureOutcome, HttpRunTransport, RetryPolicy, RunSupervisor, RunTransport};
use crate::timeline::{ActivityTimeline, Generation, HistoricalActivities};
use crate::transcript::{merge_transcript, Message, MessageRole};

/// One value on the coordinator's update channel. Network tasks produce
/// these; the coordinator applies them in arrival order.
#[derive(Debug)]
pub enum ClientUpdate {
    RunEvent {
        generation: Generation,
        event: Value,
    },
    RunFinished {
        generation: Generation,
    },
    RunFailed {
        generation: Generation,
        error: String,
    },
    RetryFire {
        generation: Generation,
    },
    ImageCompleted {
        op_id: String,
        outcome: ImageTaskOutcome,
    },
    DocumentPreview(DocumentPreviewRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPreviewRequest {
    pub title: String,
    pub content: String,
}

/// Owns the whole client state for one conversation: the remote thread, the
/// local image-task thread, the activity timeline and its history, the run
/// supervisor, and the research cache. All mutation goes through explicit
/// methods; callers render from the snapshots only.
pub struct SessionCoordinator {
    api: ApiClient,
    config: ClientConfig,
    supervisor: RunSupervisor,
    timeline: ActivityTimeline,
    history: HistoricalActivities,
    image_tasks: ImageTaskTracker,
    store: Option<ResearchStore>,
    session_id: String,
    remote_messages: Vec<Message>,
    transcript: Vec<Message>,
    loading: bool,
    finalize_observed: bool,
    error: Option<String>,
    document_previews: VecDeque<DocumentPreviewRequest>,
    updates_tx: flume::Sender<ClientUpdate>,
    updates_rx: flume::Receiver<ClientUpdate>,
}

impl SessionCoordinator {
    pub fn new(config: ClientConfig) -> Self {
        let api = ApiClient::from_config(&config);
        let transport = Arc::new(HttpRunTransport::new(api.clone()));
        Self::with_transport(config, api, transport)
    }

    /// Builds a coordinator over an arbitrary run transport so tests can
    /// script the stream.
    pub fn with_transport(
        config: ClientConfig,
        api: ApiClient,
        transport: Arc<dyn RunTransport>,
    ) -> Self {
        let (updates_tx, updates_rx) = flume::unbounded();
        let supervisor = RunSupervisor::new(
            transport,
            updates_tx.clone(),
            RetryPolicy::from_config(&config),
        );
        let store = match ResearchStore::open(&config.database_path) {
            Ok(store) => Some(store),
            Err(error) => {
                warn!("Research cache unavailable: {error:#}");
                None
            }
        };

        Self {
            api,
            config,
            supervisor,
            timeline: ActivityTimeline::new(),
            history: HistoricalActivities::new(),
            image_tasks: ImageTaskTracker::new(),
            store,
            session_id: generate_session_id(),
            remote_messages: Vec::new(),
            transcript: Vec::new(),
            loading: false,
            finalize_observed: false,
            error: None,
            document_previews: VecDeque::new(),
            updates_tx,
            updates_rx,
        }
    }

    /// Starts a chat turn. Returns false when the input is blank.
    pub fn submit_text(&mut self, text: &str, effort: EffortLevel) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }

        self.error = None;
        self.finalize_observed = false;
        self.remote_messages.push(Message::remote(
            now_millis().to_string(),
            MessageRole::Human,
            trimmed,
        ));

        let (initial_search_query_count, max_research_loops) = effort.search_parameters();
        let request = RunRequest {
            messages: self.remote_messages.iter().map(Into::into).collect(),
            initial_search_query_count,
            max_research_loops,
            reasoning_model: self.config.reasoning_model.clone(),
        };

        // The timeline must be reset before the stream task can observe
        // anything, so no event from the previous turn lands in this one.
        let generation = self.timeline.reset();
        self.persist_research();
        self.loading = true;
        self.supervisor.submit(generation, request);
        self.rebuild_transcript();
        true
    }

    /// Routes free-form input: a confident create intent goes to the image
    /// flow, everything else to a chat turn.
    pub async fn submit_auto(&mut self, text: &str, effort: EffortLevel) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }

        let intent = match self.api.classify_intent(trimmed).await {
            Ok(intent) => intent,
            Err(error) => {
                debug!("Intent classification unavailable: {error:#}");
                IntentResponse::fallback()
            }
        };

        if intent.wants_image() {
            self.generate_image(trimmed, AspectRatio::default());
            true
        } else {
            self.submit_text(trimmed, effort)
        }
    }

    /// Kicks off an out-of-band image generation. The request/placeholder
    /// pair is in the transcript before the HTTP call leaves. Returns the
    /// operation id.
    pub fn generate_image(&mut self, prompt: &str, aspect_ratio: AspectRatio) -> String {
        let op_id = uuid::Uuid::new_v4().simple().to_string();
        self.image_tasks
            .start_task(&op_id, prompt, aspect_ratio, false);
        self.rebuild_transcript();

        let api = self.api.clone();
        let updates = self.updates_tx.clone();
        let prompt = prompt.to_string();
        let task_id = op_id.clone();
        tokio::spawn(async move {
            let outcome = match api.generate_image(&prompt, aspect_ratio).await {
                Ok(response) => ImageTaskOutcome::Payload {
                    image: response.data_url,
                    caption: response.caption,
                },
                Err(error) => {
                    warn!("Image generation failed: {error:#}");
                    ImageTaskOutcome::Failed
                }
            };
            let _ = updates.send(ClientUpdate::ImageCompleted {
                op_id: task_id,
                outcome,
            });
        });
        op_id
    }

    pub fn edit_image(
        &mut self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        file_name: &str,
        file_bytes: Vec<u8>,
    ) -> String {
        let op_id = uuid::Uuid::new_v4().simple().to_string();
        self.image_tasks.start_task(&op_id, prompt, aspect_ratio, true);
        self.rebuild_transcript();

        let api = self.api.clone();
        let updates = self.updates_tx.clone();
        let prompt = prompt.to_string();
        let file_name = file_name.to_string();
        let task_id = op_id.clone();
        tokio::spawn(async move {
            let outcome = match api
                .edit_image(&prompt, aspect_ratio, &file_name, file_bytes)
                .await
            {
                Ok(response) => ImageTaskOutcome::Payload {
                    image: response.data_url,
                    caption: response.caption,
                },
                Err(error) => {
                    warn!("Image edit failed: {error:#}");
                    ImageTaskOutcome::Failed
                }
            };
            let _ = updates.send(ClientUpdate::ImageCompleted {
                op_id: task_id,
                outcome,
            });
        });
        op_id
    }

    /// Stops the in-flight run without surfacing an error. Events already
    /// appended stay.
    pub fn cancel(&mut self) {
        self.supervisor.cancel();
        if self.loading {
            self.loading = false;
            self.maybe_commit_history();
        }
        self.rebuild_transcript();
    }

    /// Persists the current session and starts a fresh one.
    pub fn new_session(&mut self) {
        self.supervisor.cancel();
        self.persist_research();
        self.session_id = generate_session_id();
        self.timeline.reset();
        self.history.clear();
        self.image_tasks.clear();
        self.remote_messages.clear();
        self.loading = false;
        self.finalize_observed = false;
        self.error = None;
        self.rebuild_transcript();
    }

    /// Replaces the live timeline with a stored session's activity and
    /// adopts its id. The chat thread itself stays with the backend; only
    /// research activity is cached locally.
    pub fn restore_session(&mut self, session_id: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let events = match store.load(session_id) {
            Ok(Some(events)) => events,
            Ok(None) => return false,
            Err(error) => {
                warn!("Failed to load research session: {error:#}");
                return false;
            }
        };

        self.supervisor.cancel();
        self.persist_research();
        self.session_id = session_id.to_string();
        self.timeline.restore(events);
        self.history.clear();
        self.image_tasks.clear();
        self.remote_messages.clear();
        self.loading = false;
        self.finalize_observed = false;
        self.error = None;
        self.rebuild_transcript();
        true
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.delete(session_id) {
            Ok(removed) => removed,
            Err(error) => {
                warn!("Failed to delete research session: {error:#}");
                false
            }
        }
    }

    /// Saved sessions, newest first, excluding the live one.
    pub fn research_history(&self) -> Vec<ResearchSession> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store.sessions() {
            Ok(sessions) => sessions
                .into_iter()
                .filter(|session| session.session_id != self.session_id)
                .collect(),
            Err(error) => {
                warn!("Failed to list research sessions: {error:#}");
                Vec::new()
            }
        }
    }

    /// Applies one update from the network tasks. Returns true when visible
    /// state changed.
    pub fn apply_update(&mut self, update: ClientUpdate) -> bool {
        match update {
            ClientUpdate::RunEvent { generation, event } => {
                if generation != self.timeline.generation() {
                    debug!("Dropping stream event from superseded turn {generation}");
                    return false;
                }
                self.supervisor.note_stream_activity(generation);
                self.sync_remote_messages(&event);
                if let Some(processed) = classify(&event) {
                    if processed.title == EventTitle::FinalizingAnswer {
                        self.finalize_observed = true;
                    }
                    self.timeline.append(generation, processed);
                    self.persist_research();
                }
                self.rebuild_transcript();
                true
            }
            ClientUpdate::RunFinished { generation } => {
                if !self.supervisor.handle_finished(generation) {
                    return false;
                }
                self.loading = false;
                self.maybe_commit_history();
                self.rebuild_transcript();
                true
            }
            ClientUpdate::RunFailed { generation, error } => {
                match self.supervisor.handle_failure(generation, &error) {
                    FailureOutcome::Stale => false,
                    FailureOutcome::RetryScheduled { .. } => false,
                    FailureOutcome::Silent => {
                        self.loading = false;
                        self.maybe_commit_history();
                        self.rebuild_transcript();
                        true
                    }
                    FailureOutcome::SurfaceError { message } => {
                        self.error = Some(message);
                        self.loading = false;
                        self.maybe_commit_history();
                        self.rebuild_transcript();
                        true
                    }
                }
            }
            ClientUpdate::RetryFire { generation } => {
                if !self.supervisor.retry_due(generation) {
                    return false;
                }
                let next = self.timeline.reset();
                self.persist_research();
                if !self.supervisor.resubmit(next) {
                    self.loading = false;
                }
                true
            }
            ClientUpdate::ImageCompleted { op_id, outcome } => {
                let resolved = self.image_tasks.complete_task(&op_id, outcome);
                if resolved {
                    self.rebuild_transcript();
                }
                resolved
            }
            ClientUpdate::DocumentPreview(request) => {
                self.document_previews.push_back(request);
                true
            }
        }
    }

    /// Drains every queued update. Returns true when any changed visible
    /// state.
    pub fn pump(&mut self) -> bool {
        let mut changed = false;
        while let Ok(update) = self.updates_rx.try_recv() {
            changed |= self.apply_update(update);
        }
        changed
    }

    /// Waits for the next update, then drains the rest of the queue.
    pub async fn wait_for_change(&mut self) -> bool {
        let Ok(update) = self.updates_rx.recv_async().await else {
            return false;
        };
        let mut changed = self.apply_update(update);
        changed |= self.pump();
        changed
    }

    /// Queues a document preview through the typed update channel, the same
    /// path network tasks use.
    pub fn request_document_preview(&self, title: impl Into<String>, content: impl Into<String>) {
        let _ = self
            .updates_tx
            .send(ClientUpdate::DocumentPreview(DocumentPreviewRequest {
                title: title.into(),
                content: content.into(),
            }));
    }

    pub fn take_document_previews(&mut self) -> Vec<DocumentPreviewRequest> {
        self.document_previews.drain(..).collect()
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn live_activity(&self) -> &[ProcessedEvent] {
        self.timeline.events()
    }

    pub fn historical_activity(&self, message_id: &str) -> Option<&[ProcessedEvent]> {
        self.history.get(message_id)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// True when the current timeline did actual research.
    pub fn used_search(&self) -> bool {
        self.timeline
            .events()
            .iter()
            .any(|event| event.title.is_research())
    }

    /// The most recent plan object produced by a Planner stage.
    pub fn latest_plan(&self) -> Option<&Value> {
        self.timeline.events().iter().rev().find_map(|event| {
            if event.title != EventTitle::Planner {
                return None;
            }
            event.details.as_ref()?.get("plan")
        })
    }

    /// The most recent artifact list produced by an Actor stage.
    pub fn artifacts(&self) -> Option<&Value> {
        self.timeline.events().iter().rev().find_map(|event| {
            if event.title != EventTitle::Actor {
                return None;
            }
            event.details.as_ref()?.get("artifacts")
        })
    }

    /// Every citation gathered so far this turn, in arrival order.
    pub fn gathered_sources(&self) -> Vec<&SourceRef> {
        self.timeline
            .events()
            .iter()
            .filter_map(|event| event.sources.as_deref())
            .flatten()
            .collect()
    }

    /// The trailing streamed content once the configured gate deems it
    /// renderable. None while warming up or when idle.
    pub fn streaming_preview(&self) -> Option<&str> {
        if !self.loading {
            return None;
        }
        let last = self.remote_messages.last()?;
        if last.role != MessageRole::Ai {
            return None;
        }
        self.config
            .gate_policy
            .ready(&last.content, self.config.gate_min_length)
            .then_some(last.content.as_str())
    }

    /// Stream events carrying a `messages` array (top level or inside the
    /// node payload) replace the remote thread wholesale; the backend owns
    /// that sequence.
    fn sync_remote_messages(&mut self, event: &Value) -> bool {
        let payload = event.get("messages").or_else(|| {
            event
                .as_object()
                .and_then(|map| map.values().find_map(|node| node.get("messages")))
        });
        let Some(messages) = payload.and_then(parse_thread_snapshot) else {
            return false;
        };
        self.remote_messages = messages;
        true
    }

    /// Commit trigger: finalize observed, stream no longer loading, and the
    /// thread ends with an AI message carrying a non-empty id.
    fn maybe_commit_history(&mut self) {
        if !self.finalize_observed || self.loading {
            return;
        }
        let Some(last) = self.remote_messages.last() else {
            return;
        };
        if last.role != MessageRole::Ai || last.id.is_empty() {
            return;
        }
        self.history.commit(&last.id, self.timeline.events());
        self.finalize_observed = false;
    }

    fn persist_research(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(error) = store.save(&self.session_id, self.timeline.events()) {
            warn!("Failed to persist research activity: {error:#}");
        }
    }

    fn rebuild_transcript(&mut self) {
        self.transcript = merge_transcript(
            &self.remote_messages,
            self.image_tasks.messages(),
            self.loading,
        );
    }
}

fn parse_thread_snapshot(payload: &Value) -> Option<Vec<Message>> {
    let raw = payload.as_array()?;
    let mut messages = Vec::with_capacity(raw.len());
    for entry in raw {
        let role = match entry.get("type").and_then(Value::as_str) {
            Some("human") => MessageRole::Human,
            Some("ai") => MessageRole::Ai,
            // Tool and system entries are not rendered.
            _ => continue,
        };
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content = entry.get("content").map(normalize_content).unwrap_or_default();
        messages.push(Message::remote(id, role, content));
    }
    Some(messages)
}

/// Backend-native structured content becomes its JSON text; only plain
/// strings pass through unchanged.
fn normalize_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
