//! Discussion orchestration.
//!
//! Owns every live discussion: synthesizes the panel at creation, runs the
//! turn loop in the background, selects speakers (AI-driven, not
//! round-robin), coordinates the consensus evaluator and the event bus, and
//! exposes the session-level operations (create, run, post user message,
//! inspect, transcript paging, stop, delete, subscribe).
//!
//! The loop is sequential per discussion; parallelism exists only across
//! discussions and across subscriber deliveries. Gateway failures never end
//! a session; each has a documented local fallback.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use concord::clients::openrouter::OpenRouterClient;
//! use concord::config::EngineConfig;
//! use concord::orchestrator::{CreateDiscussionRequest, DiscussionOrchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(OpenRouterClient::new(&std::env::var("OPENROUTER_API_KEY")?));
//! let orchestrator = Arc::new(DiscussionOrchestrator::new(client, EngineConfig::default()));
//!
//! let created = orchestrator
//!     .create_discussion(CreateDiscussionRequest {
//!         topic: "What are the best strategies for treating chronic migraine?".to_string(),
//!         user_tag: "demo".to_string(),
//!         num_agents: 3,
//!         preferred_models: None,
//!         max_turns: None,
//!     })
//!     .await?;
//!
//! let mut subscription = orchestrator.subscribe(&created.id).await?;
//! let background = {
//!     let orchestrator = Arc::clone(&orchestrator);
//!     let id = created.id.clone();
//!     tokio::spawn(async move { orchestrator.run_discussion(&id, None).await })
//! };
//!
//! while let Some(event) = subscription.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! let result = background.await??;
//! println!("consensus: {}", result.consensus_reached);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::client_wrapper::{ChatMessage, ChatRole, GatewayClient};
use crate::config::EngineConfig;
use crate::consensus::{ConsensusEvaluator, Recommendation, TranscriptEntry};
use crate::event_bus::{DiscussionEvent, EventBus, Subscription};
use crate::roles::{RoleDefinition, RoleSynthesizer};

const TOPIC_LEN: std::ops::RangeInclusive<usize> = 10..=500;
const NUM_AGENTS: std::ops::RangeInclusive<usize> = 2..=8;
const MAX_TURNS: std::ops::RangeInclusive<u32> = 3..=50;
const USER_BODY_LEN: std::ops::RangeInclusive<usize> = 1..=2000;

/// How much recent context feeds the speaker-selection prompt.
const SPEAKER_CONTEXT_WINDOW: usize = 5;
/// Window for the least-recently-active fallback.
const FALLBACK_ACTIVITY_WINDOW: usize = 10;
/// The speaker pick is a short call; it gets a tighter deadline than the
/// configured per-call timeout.
const SPEAKER_PICK_TIMEOUT: Duration = Duration::from_secs(15);
const SPEAKER_PICK_MAX_TOKENS: u32 = 50;
const UTTERANCE_MAX_TOKENS: u32 = 500;

/// Sentinel backing-model ids for non-agent messages.
const SYSTEM_MODEL_ID: &str = "system";
const USER_MODEL_ID: &str = "user";

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Where a discussion currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionStatus {
    Active,
    Completed,
    NoConsensus,
    Stopped,
    Failed,
}

impl DiscussionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DiscussionStatus::Active)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    System,
    Agent,
    User,
}

/// One entry in a discussion's append-only transcript.
#[derive(Debug, Clone, Serialize)]
pub struct DiscussionMessage {
    /// 1-based per discussion.
    pub sequence: u64,
    pub author_kind: AuthorKind,
    /// Role name for agents, `"User"` for users, `"System"` for framing.
    pub author_name: String,
    /// Model that produced the message, or a sentinel for non-agent authors.
    pub backing_model_id: String,
    pub body: String,
    /// Turn in effect when produced; the framing message uses turn 0.
    pub turn: u32,
    pub created_at: DateTime<Utc>,
}

/// The core entity: topic + panel + transcript + status.
#[derive(Debug, Clone)]
pub struct Discussion {
    pub id: String,
    pub topic: String,
    pub user_tag: String,
    /// Fixed at creation; names unique; length 2..=8.
    pub roles: Vec<RoleDefinition>,
    pub status: DiscussionStatus,
    pub current_turn: u32,
    pub max_turns: u32,
    /// Sticky: transitions false → true at most once.
    pub consensus_reached: bool,
    pub consensus_confidence: Option<f32>,
    pub final_summary: Option<String>,
    pub messages: Vec<DiscussionMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Discussion {
    fn push_message(
        &mut self,
        author_kind: AuthorKind,
        author_name: &str,
        backing_model_id: &str,
        body: String,
        turn: u32,
    ) -> u64 {
        let sequence = self.messages.len() as u64 + 1;
        self.messages.push(DiscussionMessage {
            sequence,
            author_kind,
            author_name: author_name.to_string(),
            backing_model_id: backing_model_id.to_string(),
            body,
            turn,
            created_at: Utc::now(),
        });
        self.updated_at = Utc::now();
        sequence
    }

    /// Typed entries for the consensus evaluator. User messages are filtered
    /// out; the framing entry is kept (it counts toward the evaluator's
    /// minimum-exchanges guard).
    fn evaluator_entries(&self) -> Vec<TranscriptEntry> {
        self.messages
            .iter()
            .filter(|m| m.author_kind != AuthorKind::User)
            .map(|m| TranscriptEntry {
                role_name: m.author_name.clone(),
                body: m.body.clone(),
                turn: m.turn,
            })
            .collect()
    }
}

struct DiscussionHandle {
    state: Mutex<Discussion>,
    /// At most one background runner per discussion.
    runner_claimed: AtomicBool,
}

/// Session-level failures. Gateway failures never appear here; they are
/// absorbed by the documented fallbacks.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    InvalidArgument(String),
    NotFound(String),
    Terminated(String),
    Internal(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            OrchestratorError::NotFound(msg) => write!(f, "not found: {}", msg),
            OrchestratorError::Terminated(msg) => write!(f, "terminated: {}", msg),
            OrchestratorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

/// Input to [`DiscussionOrchestrator::create_discussion`].
#[derive(Debug, Clone)]
pub struct CreateDiscussionRequest {
    /// 10–500 characters.
    pub topic: String,
    pub user_tag: String,
    /// 2–8 panel members.
    pub num_agents: usize,
    /// User-friendly or canonical model names; normalized, then cycled.
    pub preferred_models: Option<Vec<String>>,
    /// 3–50; engine default when absent.
    pub max_turns: Option<u32>,
}

/// Panel entry as surfaced to callers (system instruction stays internal).
#[derive(Debug, Clone, Serialize)]
pub struct RoleSummary {
    pub name: String,
    pub expertise: String,
    pub perspective: String,
    pub backing_model_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDiscussionResponse {
    pub id: String,
    pub topic: String,
    pub roles: Vec<RoleSummary>,
    pub status: DiscussionStatus,
    pub created_at: DateTime<Utc>,
    /// Where the event stream for this discussion can be joined.
    pub subscription_hint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserMessageAck {
    pub status: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscussionStatusView {
    pub id: String,
    pub topic: String,
    pub status: DiscussionStatus,
    pub current_turn: u32,
    pub max_turns: u32,
    pub consensus_reached: bool,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptPage {
    pub messages: Vec<DiscussionMessage>,
    pub count: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopAck {
    pub status: DiscussionStatus,
}

/// Final snapshot produced when a run terminates.
#[derive(Debug, Clone, Serialize)]
pub struct DiscussionResult {
    pub discussion_id: String,
    pub topic: String,
    pub status: DiscussionStatus,
    pub total_turns: u32,
    pub consensus_reached: bool,
    pub consensus_confidence: f32,
    pub final_summary: String,
    pub key_agreements: Vec<String>,
    pub disagreements: Vec<String>,
}

/// Process-scoped owner of all live discussions.
pub struct DiscussionOrchestrator {
    client: Arc<dyn GatewayClient>,
    config: EngineConfig,
    synthesizer: RoleSynthesizer,
    evaluator: ConsensusEvaluator,
    bus: EventBus,
    discussions: RwLock<HashMap<String, Arc<DiscussionHandle>>>,
}

impl DiscussionOrchestrator {
    pub fn new(client: Arc<dyn GatewayClient>, config: EngineConfig) -> Self {
        let synthesizer = RoleSynthesizer::new(
            Arc::clone(&client),
            config.meta_model_id.clone(),
            config.default_panel_model_ids.clone(),
        );
        let evaluator = ConsensusEvaluator::new(
            Arc::clone(&client),
            config.meta_model_id.clone(),
            config.consensus_threshold,
        );
        let bus = EventBus::new(config.subscriber_queue_bound);
        Self {
            client,
            config,
            synthesizer,
            evaluator,
            bus,
            discussions: RwLock::new(HashMap::new()),
        }
    }

    async fn lookup(&self, discussion_id: &str) -> Result<Arc<DiscussionHandle>, OrchestratorError> {
        self.discussions
            .read()
            .await
            .get(discussion_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("discussion {} not found", discussion_id))
            })
    }

    /// Create a discussion: synthesize the panel and register the entity.
    ///
    /// The loop does not start here; callers drive it with
    /// [`run_discussion`](Self::run_discussion) (typically inside
    /// `tokio::spawn`).
    pub async fn create_discussion(
        &self,
        request: CreateDiscussionRequest,
    ) -> Result<CreateDiscussionResponse, OrchestratorError> {
        let topic = request.topic.trim().to_string();
        if !TOPIC_LEN.contains(&topic.chars().count()) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "topic must be {}-{} characters",
                TOPIC_LEN.start(),
                TOPIC_LEN.end()
            )));
        }
        if !NUM_AGENTS.contains(&request.num_agents) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "num_agents must be {}-{}",
                NUM_AGENTS.start(),
                NUM_AGENTS.end()
            )));
        }
        if let Some(cap) = request.max_turns {
            if !MAX_TURNS.contains(&cap) {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "max_turns must be {}-{}",
                    MAX_TURNS.start(),
                    MAX_TURNS.end()
                )));
            }
        }

        log::info!(
            "concord::orchestrator: creating discussion: {} (num_agents={})",
            topic,
            request.num_agents
        );

        let roles = self
            .synthesizer
            .synthesize(
                &topic,
                request.num_agents,
                request.preferred_models.as_deref(),
            )
            .await;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let discussion = Discussion {
            id: id.clone(),
            topic: topic.clone(),
            user_tag: request.user_tag,
            roles: roles.clone(),
            status: DiscussionStatus::Active,
            current_turn: 0,
            max_turns: request.max_turns.unwrap_or(self.config.max_turns),
            consensus_reached: false,
            consensus_confidence: None,
            final_summary: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.discussions.write().await.insert(
            id.clone(),
            Arc::new(DiscussionHandle {
                state: Mutex::new(discussion),
                runner_claimed: AtomicBool::new(false),
            }),
        );

        log::info!(
            "concord::orchestrator: discussion created: {} | roles: {:?}",
            short(&id),
            roles.iter().map(|r| r.name.as_str()).collect::<Vec<_>>()
        );

        Ok(CreateDiscussionResponse {
            id: id.clone(),
            topic,
            roles: roles
                .iter()
                .map(|r| RoleSummary {
                    name: r.name.clone(),
                    expertise: r.expertise.clone(),
                    perspective: r.perspective.clone(),
                    backing_model_id: r.backing_model_id.clone(),
                })
                .collect(),
            status: DiscussionStatus::Active,
            created_at: now,
            subscription_hint: format!("/ws/discussions/{}", id),
        })
    }

    /// Drive the discussion until consensus, stalemate, turn cap, or stop.
    ///
    /// At most one runner per discussion; a second call is rejected. The
    /// loop body runs in its own task so that a panic is contained: it
    /// drives `status=failed` and an `error` event instead of poisoning the
    /// caller.
    pub async fn run_discussion(
        self: Arc<Self>,
        discussion_id: &str,
        max_turns: Option<u32>,
    ) -> Result<DiscussionResult, OrchestratorError> {
        let handle = self.lookup(discussion_id).await?;

        if handle.runner_claimed.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "discussion {} already has a runner",
                discussion_id
            )));
        }

        let cap = {
            let state = handle.state.lock().await;
            max_turns.unwrap_or(state.max_turns)
        };

        let runner = {
            let orchestrator = Arc::clone(&self);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { orchestrator.run_loop(handle, cap).await })
        };

        match runner.await {
            Ok(result) => Ok(result),
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    "discussion loop panicked"
                } else {
                    "discussion loop cancelled"
                };
                log::error!(
                    "concord::orchestrator: {} in {}",
                    message,
                    short(discussion_id)
                );
                self.fail_discussion(&handle, message).await;
                Err(OrchestratorError::Internal(message.to_string()))
            }
        }
    }

    async fn run_loop(&self, handle: Arc<DiscussionHandle>, max_turns: u32) -> DiscussionResult {
        let (id, topic, roles) = {
            let mut state = handle.state.lock().await;
            // Framing message, exactly once, at sequence 1 / turn 0.
            if state.messages.is_empty() {
                let participants = state
                    .roles
                    .iter()
                    .map(|r| r.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let body = format!(
                    "Discussion started: {}\nParticipants: {}",
                    state.topic, participants
                );
                state.push_message(AuthorKind::System, "System", SYSTEM_MODEL_ID, body, 0);
            }
            (state.id.clone(), state.topic.clone(), state.roles.clone())
        };

        log::info!(
            "concord::orchestrator: starting discussion {} (max {} turns)",
            short(&id),
            max_turns
        );

        let mut stopped = false;

        loop {
            // The stop predicate is observed here, between turns.
            let (status, current_turn, history) = {
                let state = handle.state.lock().await;
                (state.status, state.current_turn, state.messages.clone())
            };
            if status != DiscussionStatus::Active {
                stopped = status == DiscussionStatus::Stopped;
                break;
            }
            if current_turn >= max_turns {
                break;
            }

            let turn = current_turn + 1;
            log::debug!(
                "concord::orchestrator: {} turn {}/{}",
                short(&id),
                turn,
                max_turns
            );

            let speaker = self.select_next_speaker(&topic, &roles, &history).await;

            let transcript = build_role_transcript(&speaker, &history);
            let body = match self
                .client
                .complete_text(
                    &speaker.backing_model_id,
                    &transcript,
                    0.7,
                    Some(UTTERANCE_MAX_TOKENS),
                )
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    log::error!(
                        "concord::orchestrator: utterance from {} failed in {}: {}",
                        speaker.name,
                        short(&id),
                        e
                    );
                    format!("[Error generating response: {}]", e)
                }
            };

            // The in-flight call may have raced a stop; an append after stop
            // must not occur.
            let appended = {
                let mut state = handle.state.lock().await;
                if state.status != DiscussionStatus::Active {
                    false
                } else {
                    state.current_turn = turn;
                    state.push_message(
                        AuthorKind::Agent,
                        &speaker.name,
                        &speaker.backing_model_id,
                        body.clone(),
                        turn,
                    );
                    true
                }
            };
            if !appended {
                stopped = true;
                break;
            }

            self.bus
                .publish(DiscussionEvent::AgentMessage {
                    discussion_id: id.clone(),
                    timestamp: Utc::now(),
                    role_name: speaker.name.clone(),
                    backing_model_id: speaker.backing_model_id.clone(),
                    body,
                    turn,
                })
                .await;

            // Consensus cadence: even turns once the discussion has warmed
            // up, so the first check lands on turn 4.
            if turn >= 3 && turn % 2 == 0 {
                let entries = handle.state.lock().await.evaluator_entries();
                let snapshot = self.evaluator.evaluate(&entries, &topic, turn, max_turns).await;

                {
                    let mut state = handle.state.lock().await;
                    state.consensus_confidence = Some(snapshot.confidence);
                    if snapshot.reached {
                        state.consensus_reached = true;
                    }
                    state.updated_at = Utc::now();
                }

                if snapshot.reached {
                    log::info!(
                        "concord::orchestrator: consensus reached at turn {} in {}",
                        turn,
                        short(&id)
                    );
                    let mut state = handle.state.lock().await;
                    if state.status == DiscussionStatus::Active {
                        state.status = DiscussionStatus::Completed;
                    }
                    break;
                }
                if snapshot.recommendation == Recommendation::Escalate {
                    log::warn!(
                        "concord::orchestrator: stalemate detected in {}, concluding",
                        short(&id)
                    );
                    break;
                }

                self.bus
                    .publish(DiscussionEvent::ConsensusUpdate {
                        discussion_id: id.clone(),
                        timestamp: Utc::now(),
                        reached: snapshot.reached,
                        confidence: snapshot.confidence,
                        summary: snapshot.summary.clone(),
                        agreements: snapshot.agreements.clone(),
                        disagreements: snapshot.disagreements.clone(),
                    })
                    .await;
            }
        }

        self.finalize(&handle, &id, &topic, max_turns, stopped).await
    }

    /// Compute the closing snapshot + summary, settle the terminal status,
    /// publish the terminal event, and close the stream.
    async fn finalize(
        &self,
        handle: &Arc<DiscussionHandle>,
        id: &str,
        topic: &str,
        max_turns: u32,
        stopped: bool,
    ) -> DiscussionResult {
        let (entries, current_turn) = {
            let state = handle.state.lock().await;
            (state.evaluator_entries(), state.current_turn)
        };

        let snapshot = self
            .evaluator
            .evaluate(&entries, topic, current_turn, max_turns)
            .await;
        let summary = self.evaluator.final_summary(&entries, topic, &snapshot).await;

        let result = {
            let mut state = handle.state.lock().await;
            if snapshot.reached {
                state.consensus_reached = true;
            }
            state.consensus_confidence = Some(snapshot.confidence);
            state.final_summary = Some(summary.clone());
            if !state.status.is_terminal() {
                state.status = if state.consensus_reached {
                    DiscussionStatus::Completed
                } else {
                    DiscussionStatus::NoConsensus
                };
            }
            state.updated_at = Utc::now();

            DiscussionResult {
                discussion_id: state.id.clone(),
                topic: state.topic.clone(),
                status: state.status,
                total_turns: state.current_turn,
                consensus_reached: state.consensus_reached,
                consensus_confidence: snapshot.confidence,
                final_summary: summary.clone(),
                key_agreements: snapshot.agreements.clone(),
                disagreements: snapshot.disagreements.clone(),
            }
        };

        let terminal = if stopped {
            DiscussionEvent::DiscussionStopped {
                discussion_id: id.to_string(),
                timestamp: Utc::now(),
                reason: "stopped by user".to_string(),
            }
        } else {
            DiscussionEvent::DiscussionComplete {
                discussion_id: id.to_string(),
                timestamp: Utc::now(),
                total_turns: result.total_turns,
                consensus_reached: result.consensus_reached,
                final_summary: result.final_summary.clone(),
            }
        };
        self.bus.publish(terminal).await;
        self.bus.close(id).await;

        log::info!(
            "concord::orchestrator: discussion {} done | turns: {} | consensus: {} | status: {:?}",
            short(id),
            result.total_turns,
            result.consensus_reached,
            result.status
        );

        result
    }

    /// Drive a discussion to `failed` after an invariant breach in the loop.
    async fn fail_discussion(&self, handle: &Arc<DiscussionHandle>, message: &str) {
        let id = {
            let mut state = handle.state.lock().await;
            if !state.status.is_terminal() {
                state.status = DiscussionStatus::Failed;
                state.updated_at = Utc::now();
            }
            state.id.clone()
        };
        self.bus
            .publish(DiscussionEvent::Error {
                discussion_id: id.clone(),
                timestamp: Utc::now(),
                message: message.to_string(),
            })
            .await;
        self.bus.close(&id).await;
    }

    /// AI-driven pick of the next speaker; deterministic fallbacks when the
    /// meta-model is unavailable or answers with something unmatchable.
    async fn select_next_speaker(
        &self,
        topic: &str,
        roles: &[RoleDefinition],
        history: &[DiscussionMessage],
    ) -> RoleDefinition {
        // Bootstrap: only the framing message exists, so the first role opens.
        if history.len() <= 1 {
            return roles[0].clone();
        }

        let window_start = history.len().saturating_sub(SPEAKER_CONTEXT_WINDOW);
        let formatted_context = history[window_start..]
            .iter()
            .map(|m| format!("{}: {}...", m.author_name, truncate(&m.body, 100)))
            .collect::<Vec<_>>()
            .join("\n");
        let participants = roles
            .iter()
            .map(|r| format!("- {}: {}", r.name, r.expertise))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "This is a multi-expert discussion. Based on the recent conversation, who should speak next?\n\n\
             **Topic**: {}\n\n\
             **Available participants**:\n{}\n\n\
             **Recent conversation**:\n{}\n\n\
             Who should logically respond next based on:\n\
             1. What was just discussed\n\
             2. Whose expertise is most relevant\n\
             3. Natural conversation flow\n\n\
             Return ONLY the name of the participant (exactly as listed above).",
            topic, participants, formatted_context
        );

        let pick = tokio::time::timeout(
            SPEAKER_PICK_TIMEOUT,
            self.client.complete_text(
                &self.config.meta_model_id,
                &[ChatMessage::new(ChatRole::User, prompt)],
                0.5,
                Some(SPEAKER_PICK_MAX_TOKENS),
            ),
        )
        .await;

        match pick {
            Ok(Ok(selection)) => {
                let selection = selection.trim().to_string();
                if let Some(role) = match_role(roles, &selection) {
                    log::debug!("concord::orchestrator: meta-model selected {}", role.name);
                    return role.clone();
                }
                log::warn!(
                    "concord::orchestrator: could not match selection '{}', using fallback",
                    selection
                );
            }
            Ok(Err(e)) => {
                log::warn!(
                    "concord::orchestrator: speaker selection failed ({}), using fallback",
                    e
                );
            }
            Err(_) => {
                log::warn!("concord::orchestrator: speaker selection timed out, using fallback");
            }
        }

        least_recently_active(roles, history).clone()
    }

    /// Accept a live user interjection into an active discussion.
    pub async fn post_user_message(
        &self,
        discussion_id: &str,
        body: &str,
        user_tag: &str,
    ) -> Result<UserMessageAck, OrchestratorError> {
        if !USER_BODY_LEN.contains(&body.chars().count()) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "message body must be {}-{} characters",
                USER_BODY_LEN.start(),
                USER_BODY_LEN.end()
            )));
        }

        let handle = self.lookup(discussion_id).await?;
        {
            let mut state = handle.state.lock().await;
            if state.status != DiscussionStatus::Active {
                return Err(OrchestratorError::Terminated(format!(
                    "discussion {} is no longer active",
                    discussion_id
                )));
            }
            let turn = state.current_turn;
            state.push_message(AuthorKind::User, "User", USER_MODEL_ID, body.to_string(), turn);
        }

        self.bus
            .publish(DiscussionEvent::UserMessage {
                discussion_id: discussion_id.to_string(),
                timestamp: Utc::now(),
                body: body.to_string(),
                user_tag: user_tag.to_string(),
            })
            .await;

        // Let the turn loop (and subscriber deliveries) make progress before
        // the caller regains control.
        tokio::task::yield_now().await;

        Ok(UserMessageAck {
            status: "accepted".to_string(),
            id: discussion_id.to_string(),
        })
    }

    /// Status snapshot for one discussion.
    pub async fn inspect(&self, discussion_id: &str) -> Result<DiscussionStatusView, OrchestratorError> {
        let handle = self.lookup(discussion_id).await?;
        let state = handle.state.lock().await;
        Ok(DiscussionStatusView {
            id: state.id.clone(),
            topic: state.topic.clone(),
            status: state.status,
            current_turn: state.current_turn,
            max_turns: state.max_turns,
            consensus_reached: state.consensus_reached,
            message_count: state.messages.len(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        })
    }

    /// Page through the transcript, ascending by sequence.
    pub async fn transcript(
        &self,
        discussion_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<TranscriptPage, OrchestratorError> {
        let handle = self.lookup(discussion_id).await?;
        let state = handle.state.lock().await;
        let messages: Vec<DiscussionMessage> = state
            .messages
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(TranscriptPage {
            count: messages.len(),
            messages,
            offset,
            limit,
        })
    }

    /// Mark a runnable discussion as stopped. The running loop observes this
    /// between turns and exits; if no runner was ever started, the terminal
    /// event is published here.
    pub async fn stop(&self, discussion_id: &str) -> Result<StopAck, OrchestratorError> {
        let handle = self.lookup(discussion_id).await?;
        let (status, had_runner) = {
            let mut state = handle.state.lock().await;
            if state.status == DiscussionStatus::Active {
                state.status = DiscussionStatus::Stopped;
                state.updated_at = Utc::now();
            }
            (state.status, handle.runner_claimed.load(Ordering::SeqCst))
        };

        if status == DiscussionStatus::Stopped && !had_runner {
            self.bus
                .publish(DiscussionEvent::DiscussionStopped {
                    discussion_id: discussion_id.to_string(),
                    timestamp: Utc::now(),
                    reason: "stopped by user".to_string(),
                })
                .await;
            self.bus.close(discussion_id).await;
        }

        log::info!("concord::orchestrator: stop requested for {}", short(discussion_id));
        Ok(StopAck { status })
    }

    /// Remove a discussion from the registry. Idempotent: deleting an absent
    /// id succeeds without side effects.
    pub async fn delete(&self, discussion_id: &str) -> Result<(), OrchestratorError> {
        let removed = self.discussions.write().await.remove(discussion_id);
        if let Some(handle) = removed {
            let mut state = handle.state.lock().await;
            if state.status == DiscussionStatus::Active {
                state.status = DiscussionStatus::Stopped;
                state.updated_at = Utc::now();
            }
            drop(state);
            self.bus.close(discussion_id).await;
            log::info!("concord::orchestrator: deleted {}", short(discussion_id));
        }
        Ok(())
    }

    /// Join a discussion's event stream.
    pub async fn subscribe(&self, discussion_id: &str) -> Result<Subscription, OrchestratorError> {
        let handle = self.lookup(discussion_id).await?;
        let subscription = self.bus.subscribe(discussion_id).await;
        // A terminal discussion produces no further events; close right away
        // so the new subscriber sees its greeting and then end-of-stream.
        let terminal = handle.state.lock().await.status.is_terminal();
        if terminal {
            self.bus.close(discussion_id).await;
        }
        Ok(subscription)
    }

    /// Ids of discussions still in `active`.
    pub async fn list_active(&self) -> Vec<String> {
        let map = self.discussions.read().await;
        let mut active = Vec::new();
        for (id, handle) in map.iter() {
            if handle.state.lock().await.status == DiscussionStatus::Active {
                active.push(id.clone());
            }
        }
        active
    }

    /// Process teardown: non-terminal discussions become `failed`, every
    /// subscriber channel closes with end-of-stream.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<DiscussionHandle>> =
            self.discussions.read().await.values().cloned().collect();
        for handle in handles {
            let mut state = handle.state.lock().await;
            if !state.status.is_terminal() {
                state.status = DiscussionStatus::Failed;
                state.updated_at = Utc::now();
            }
        }
        self.bus.shutdown().await;
        log::info!("concord::orchestrator: shutdown complete");
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Resolve the meta-model's pick against the panel: exact case-insensitive
/// equality first, then substring containment either way.
fn match_role<'a>(roles: &'a [RoleDefinition], selection: &str) -> Option<&'a RoleDefinition> {
    let selection = selection.trim().to_lowercase();
    if selection.is_empty() {
        return None;
    }
    roles
        .iter()
        .find(|r| r.name.to_lowercase() == selection)
        .or_else(|| {
            roles.iter().find(|r| {
                let name = r.name.to_lowercase();
                selection.contains(&name) || name.contains(&selection)
            })
        })
}

/// Deterministic fallback: the role with the fewest agent messages in the
/// recent window; ties break by panel order.
fn least_recently_active<'a>(
    roles: &'a [RoleDefinition],
    history: &[DiscussionMessage],
) -> &'a RoleDefinition {
    let window_start = history.len().saturating_sub(FALLBACK_ACTIVITY_WINDOW);
    let recent = &history[window_start..];

    let mut best = &roles[0];
    let mut best_count = usize::MAX;
    for role in roles {
        let count = recent
            .iter()
            .filter(|m| m.author_kind == AuthorKind::Agent && m.author_name == role.name)
            .count();
        if count < best_count {
            best = role;
            best_count = count;
        }
    }
    best
}

/// Build the transcript a role sees for its turn: its system instruction,
/// then every prior message: the role's own messages as `assistant`, all
/// others as `user` with an inline `[Author]:` prefix. The third-person
/// framing keeps multi-speaker awareness inside a two-role chat model.
fn build_role_transcript(role: &RoleDefinition, history: &[DiscussionMessage]) -> Vec<ChatMessage> {
    let mut transcript = Vec::with_capacity(history.len() + 1);
    transcript.push(ChatMessage::new(ChatRole::System, &role.system_instruction));
    for msg in history {
        let entry = match msg.author_kind {
            AuthorKind::Agent if msg.author_name == role.name => {
                ChatMessage::new(ChatRole::Assistant, &msg.body)
            }
            _ => ChatMessage::new(
                ChatRole::User,
                format!("[{}]: {}", msg.author_name, msg.body),
            ),
        };
        transcript.push(entry);
    }
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str) -> RoleDefinition {
        RoleDefinition {
            name: name.to_string(),
            expertise: format!("{} expertise", name),
            perspective: format!("{} perspective", name),
            backing_model_id: "model-x".to_string(),
            system_instruction: format!("You are {}.", name),
        }
    }

    fn agent_msg(sequence: u64, author: &str, body: &str, turn: u32) -> DiscussionMessage {
        DiscussionMessage {
            sequence,
            author_kind: AuthorKind::Agent,
            author_name: author.to_string(),
            backing_model_id: "model-x".to_string(),
            body: body.to_string(),
            turn,
            created_at: Utc::now(),
        }
    }

    fn framing(topic: &str) -> DiscussionMessage {
        DiscussionMessage {
            sequence: 1,
            author_kind: AuthorKind::System,
            author_name: "System".to_string(),
            backing_model_id: SYSTEM_MODEL_ID.to_string(),
            body: format!("Discussion started: {}", topic),
            turn: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn match_role_prefers_exact_over_containment() {
        let roles = vec![role("Analyst"), role("Data Analyst")];
        let matched = match_role(&roles, "data analyst").unwrap();
        assert_eq!(matched.name, "Data Analyst");
    }

    #[test]
    fn match_role_accepts_surrounding_prose() {
        let roles = vec![role("Neurologist"), role("Pharmacologist")];
        let matched = match_role(&roles, "I think the Pharmacologist should respond.").unwrap();
        assert_eq!(matched.name, "Pharmacologist");
    }

    #[test]
    fn match_role_accepts_partial_name() {
        let roles = vec![role("Patient Advocate"), role("Neurologist")];
        let matched = match_role(&roles, "Advocate").unwrap();
        assert_eq!(matched.name, "Patient Advocate");
    }

    #[test]
    fn match_role_rejects_empty_and_unknown() {
        let roles = vec![role("Analyst")];
        assert!(match_role(&roles, "").is_none());
        assert!(match_role(&roles, "   ").is_none());
        assert!(match_role(&roles, "Economist").is_none());
    }

    #[test]
    fn least_recently_active_picks_minimum_with_stable_tiebreak() {
        let roles = vec![role("A"), role("B"), role("C")];
        let history = vec![
            framing("t"),
            agent_msg(2, "A", "x", 1),
            agent_msg(3, "B", "y", 2),
            agent_msg(4, "A", "z", 3),
        ];
        // C never spoke.
        assert_eq!(least_recently_active(&roles, &history).name, "C");

        // All tied at zero → first role in panel order.
        let history = vec![framing("t")];
        assert_eq!(least_recently_active(&roles, &history).name, "A");
    }

    #[test]
    fn least_recently_active_only_counts_recent_window() {
        let roles = vec![role("A"), role("B")];
        let mut history = vec![framing("t")];
        // A spoke long ago, outside the 10-message window; B fills it.
        history.push(agent_msg(2, "A", "old", 1));
        for i in 0..10 {
            history.push(agent_msg(3 + i, "B", "recent", 2 + i as u32));
        }
        assert_eq!(least_recently_active(&roles, &history).name, "A");
    }

    #[test]
    fn role_transcript_uses_third_person_framing() {
        let speaker = role("Analyst");
        let history = vec![
            framing("energy policy"),
            agent_msg(2, "Analyst", "My first take.", 1),
            agent_msg(3, "Economist", "A rebuttal.", 2),
            DiscussionMessage {
                sequence: 4,
                author_kind: AuthorKind::User,
                author_name: "User".to_string(),
                backing_model_id: USER_MODEL_ID.to_string(),
                body: "Please consider cost.".to_string(),
                turn: 2,
                created_at: Utc::now(),
            },
        ];

        let transcript = build_role_transcript(&speaker, &history);
        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript[0].role, ChatRole::System);
        assert_eq!(transcript[0].content.as_ref(), "You are Analyst.");
        // Framing message arrives as a tagged user entry.
        assert_eq!(transcript[1].role, ChatRole::User);
        assert!(transcript[1].content.starts_with("[System]:"));
        // Own message maps to assistant, untagged.
        assert_eq!(transcript[2].role, ChatRole::Assistant);
        assert_eq!(transcript[2].content.as_ref(), "My first take.");
        // Peer and user messages map to user with name prefixes.
        assert_eq!(transcript[3].content.as_ref(), "[Economist]: A rebuttal.");
        assert_eq!(transcript[4].content.as_ref(), "[User]: Please consider cost.");
    }

    #[test]
    fn push_message_numbers_sequences_from_one() {
        let mut discussion = Discussion {
            id: "d".to_string(),
            topic: "t".to_string(),
            user_tag: "u".to_string(),
            roles: vec![role("A"), role("B")],
            status: DiscussionStatus::Active,
            current_turn: 0,
            max_turns: 20,
            consensus_reached: false,
            consensus_confidence: None,
            final_summary: None,
            messages: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(
            discussion.push_message(AuthorKind::System, "System", SYSTEM_MODEL_ID, "f".into(), 0),
            1
        );
        assert_eq!(
            discussion.push_message(AuthorKind::Agent, "A", "m", "hello".into(), 1),
            2
        );
        assert_eq!(discussion.messages[1].sequence, 2);
    }

    #[test]
    fn evaluator_entries_exclude_user_messages() {
        let mut discussion = Discussion {
            id: "d".to_string(),
            topic: "t".to_string(),
            user_tag: "u".to_string(),
            roles: vec![role("A")],
            status: DiscussionStatus::Active,
            current_turn: 1,
            max_turns: 20,
            consensus_reached: false,
            consensus_confidence: None,
            final_summary: None,
            messages: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        discussion.push_message(AuthorKind::System, "System", SYSTEM_MODEL_ID, "f".into(), 0);
        discussion.push_message(AuthorKind::Agent, "A", "m", "point".into(), 1);
        discussion.push_message(AuthorKind::User, "User", USER_MODEL_ID, "aside".into(), 1);

        let entries = discussion.evaluator_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.role_name != "User"));
    }

    #[test]
    fn terminal_statuses_are_every_status_but_active() {
        assert!(!DiscussionStatus::Active.is_terminal());
        for status in [
            DiscussionStatus::Completed,
            DiscussionStatus::NoConsensus,
            DiscussionStatus::Stopped,
            DiscussionStatus::Failed,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello world", 5), "hello");
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 100), "short");
    }
}
