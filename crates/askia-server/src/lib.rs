use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use askia_config::{Config, Triggers};
use askia_contracts::{
    contracts_manifest_v1, ActiveTrigger, BeforeNewChatRequest, BeforeNewChatResponse,
    CompleteTriggerRequest, ContractsMetadata, ConversationSignals, ErrorBody, ErrorResponse,
    SessionStatsResponse, TriggerKind, TriggerResponse, API_VERSION,
};
use askia_kernel::{summarize, FeedbackLevel, FeedbackScheduler, TriggerProfile};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

mod journal;

pub use journal::{verify_journal_chain, DecisionJournal, JournalEvent, JournalRecord};

const MAX_ID_LEN: usize = 256;
const MAX_COMMENT_LEN: usize = 2000;

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "feedback trigger service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/v1/sessions/{session_id}", axum::routing::delete(end_session))
        .route("/v1/sessions/{session_id}/signals", post(signals))
        .route("/v1/sessions/{session_id}/trigger", get(active_trigger))
        .route("/v1/sessions/{session_id}/complete", post(complete))
        .route("/v1/sessions/{session_id}/dismiss", post(dismiss))
        .route("/v1/sessions/{session_id}/before-new-chat", post(before_new_chat))
        .route("/v1/sessions/{session_id}/stats", get(stats))
        .with_state(state))
}

/// Resolves the named preset and applies per-constant overrides.
pub fn profile_from_config(triggers: &Triggers) -> Result<TriggerProfile, String> {
    let mut profile = TriggerProfile::by_name(&triggers.profile)
        .ok_or_else(|| format!("unknown trigger profile: {}", triggers.profile))?;
    if let Some(v) = triggers.after_every_n_responses {
        profile.after_every_n_responses = v;
    }
    if let Some(v) = triggers.periodic_check {
        profile.periodic_check = v;
    }
    if let Some(v) = triggers.new_conversation_delay {
        profile.new_conversation_delay = v;
    }
    if let Some(v) = triggers.before_new_chat_threshold {
        profile.before_new_chat_threshold = v;
    }
    if let Some(v) = triggers.min_time_between_prompts_ms {
        profile.min_time_between_prompts_ms = v;
    }
    Ok(profile)
}

#[derive(Clone)]
struct AppState {
    profile: TriggerProfile,
    max_sessions: usize,
    sessions: Arc<Mutex<HashMap<String, FeedbackScheduler>>>,
    journal: Option<Arc<DecisionJournal>>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let journal = match cfg.journal.jsonl_path.as_deref() {
            Some(path) => Some(Arc::new(DecisionJournal::open(path).await?)),
            None => None,
        };
        Ok(Self {
            profile: profile_from_config(&cfg.triggers)?,
            max_sessions: cfg.sessions.max_sessions,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            journal,
        })
    }

    fn session_mut<'a>(
        &self,
        sessions: &'a mut HashMap<String, FeedbackScheduler>,
        session_id: &str,
    ) -> Result<&'a mut FeedbackScheduler, ApiError> {
        if !sessions.contains_key(session_id) {
            if sessions.len() >= self.max_sessions {
                warn!(
                    session_id,
                    max_sessions = self.max_sessions,
                    "refusing new session"
                );
                return Err(api_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "sessions.capacity_exhausted",
                    "too many live sessions",
                ));
            }
            info!(session_id, "session opened");
        }
        Ok(sessions
            .entry(session_id.to_string())
            .or_insert_with(|| FeedbackScheduler::new(self.profile)))
    }

    async fn record(&self, rec: JournalRecord) {
        if let Some(journal) = &self.journal {
            journal.append(rec).await;
        }
    }

    async fn observe(
        &self,
        session_id: &str,
        signals: ConversationSignals,
    ) -> Result<TriggerResponse, ApiError> {
        let now = Utc::now();
        let (previous, active) = {
            let mut sessions = self.sessions.lock().await;
            let scheduler = self.session_mut(&mut sessions, session_id)?;
            let previous = scheduler.active().cloned();
            let active = scheduler.observe(signals, now).cloned();
            (previous, active)
        };

        if let Some(trigger) = active.as_ref().filter(|t| Some(*t) != previous.as_ref()) {
            info!(
                session_id,
                kind = trigger.kind.as_str(),
                priority = trigger.priority.as_str(),
                "feedback prompt raised"
            );
            self.record(JournalRecord::for_trigger(
                session_id,
                JournalEvent::TriggerShown,
                trigger,
            ))
            .await;
        }
        Ok(TriggerResponse {
            active_trigger: active,
        })
    }

    async fn active(&self, session_id: &str) -> Option<ActiveTrigger> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .and_then(|scheduler| scheduler.active().cloned())
    }

    async fn complete(
        &self,
        session_id: &str,
        input: CompleteTriggerRequest,
    ) -> Result<(), ApiError> {
        {
            let mut sessions = self.sessions.lock().await;
            let scheduler = self.session_mut(&mut sessions, session_id)?;
            scheduler.complete_trigger(&input.conversation_id, input.kind, Utc::now());
        }

        let mut rec = JournalRecord::new(session_id, JournalEvent::TriggerCompleted);
        rec.conversation_id = Some(input.conversation_id);
        rec.kind = Some(input.kind);
        rec.priority = Some(askia_kernel::priority_for(input.kind));
        rec.rating = input.rating;
        rec.resolved = input.resolved;
        rec.comment = input.comment;
        self.record(rec).await;
        Ok(())
    }

    async fn dismiss(&self, session_id: &str) {
        let dismissed = {
            let mut sessions = self.sessions.lock().await;
            sessions.get_mut(session_id).and_then(|scheduler| {
                let current = scheduler.active().cloned();
                scheduler.dismiss_trigger();
                current
            })
        };
        if let Some(trigger) = dismissed {
            self.record(JournalRecord::for_trigger(
                session_id,
                JournalEvent::TriggerDismissed,
                &trigger,
            ))
            .await;
        }
    }

    async fn before_new_chat(
        &self,
        session_id: &str,
        conversation_id: &str,
    ) -> BeforeNewChatResponse {
        let response = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(scheduler) => BeforeNewChatResponse {
                    blocked: scheduler.trigger_before_new_chat(conversation_id),
                    active_trigger: scheduler.active().cloned(),
                },
                None => BeforeNewChatResponse {
                    blocked: false,
                    active_trigger: None,
                },
            }
        };
        if let Some(trigger) = response.active_trigger.as_ref().filter(|_| response.blocked) {
            self.record(JournalRecord::for_trigger(
                session_id,
                JournalEvent::NewChatBlocked,
                trigger,
            ))
            .await;
        }
        response
    }

    async fn stats(&self, session_id: &str) -> SessionStatsResponse {
        let stats = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(scheduler) => scheduler.stats(),
                None => summarize(std::iter::empty()),
            }
        };
        SessionStatsResponse {
            level: FeedbackLevel::for_total(stats.total_feedbacks).view(),
            stats,
        }
    }

    async fn end_session(&self, session_id: &str) {
        if self.sessions.lock().await.remove(session_id).is_some() {
            info!(session_id, "session closed");
        }
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts(State(state): State<AppState>) -> Json<ContractsMetadata> {
    let manifest = contracts_manifest_v1();
    Json(ContractsMetadata {
        api_version: API_VERSION.to_string(),
        openapi_sha256: manifest.openapi_sha256.to_string(),
        contracts_set_sha256: manifest.contracts_set_sha256.to_string(),
        generated_at: manifest.generated_at.to_string(),
        schemas: manifest
            .schemas
            .iter()
            .map(|s| (s.path.to_string(), s.sha256.to_string()))
            .collect(),
        trigger_kinds: TriggerKind::ALL.to_vec(),
        profile: state.profile.view(),
    })
}

async fn signals(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(input): Json<ConversationSignals>,
) -> Result<Json<TriggerResponse>, ApiError> {
    validate_id("session_id", &session_id)?;
    if let Some(conversation_id) = input.conversation_id.as_deref() {
        validate_len("conversation_id", conversation_id, MAX_ID_LEN)?;
    }
    state.observe(&session_id, input).await.map(Json)
}

async fn active_trigger(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<TriggerResponse> {
    Json(TriggerResponse {
        active_trigger: state.active(&session_id).await,
    })
}

async fn complete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(input): Json<CompleteTriggerRequest>,
) -> Result<StatusCode, ApiError> {
    validate_id("session_id", &session_id)?;
    validate_id("conversation_id", &input.conversation_id)?;
    if let Some(rating) = input.rating {
        if !(1..=5).contains(&rating) {
            return Err(validation_error("rating must be between 1 and 5"));
        }
    }
    if let Some(comment) = input.comment.as_deref() {
        validate_len("comment", comment, MAX_COMMENT_LEN)?;
    }
    state.complete(&session_id, input).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dismiss(State(state): State<AppState>, Path(session_id): Path<String>) -> StatusCode {
    state.dismiss(&session_id).await;
    StatusCode::NO_CONTENT
}

async fn before_new_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(input): Json<BeforeNewChatRequest>,
) -> Result<Json<BeforeNewChatResponse>, ApiError> {
    validate_len("conversation_id", &input.conversation_id, MAX_ID_LEN)?;
    Ok(Json(
        state
            .before_new_chat(&session_id, &input.conversation_id)
            .await,
    ))
}

async fn stats(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<SessionStatsResponse> {
    Json(state.stats(&session_id).await)
}

async fn end_session(State(state): State<AppState>, Path(session_id): Path<String>) -> StatusCode {
    state.end_session(&session_id).await;
    StatusCode::NO_CONTENT
}

fn validate_id(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(validation_error(&format!("{field} is required")));
    }
    validate_len(field, value, MAX_ID_LEN)
}

fn validate_len(field: &str, value: &str, max: usize) -> Result<(), ApiError> {
    if value.chars().count() > max {
        return Err(validation_error(&format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

fn validation_error(message: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_overrides_apply_on_top_of_preset() {
        let triggers = Triggers {
            profile: "relaxed".to_string(),
            periodic_check: Some(10),
            ..Triggers::default()
        };
        let profile = profile_from_config(&triggers).unwrap();
        assert_eq!(profile.periodic_check, 10);
        assert_eq!(profile.after_every_n_responses, 6);
        assert_eq!(profile.min_time_between_prompts_ms, 120_000);
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let triggers = Triggers {
            profile: "chatty".to_string(),
            ..Triggers::default()
        };
        assert!(profile_from_config(&triggers).is_err());
    }

    #[test]
    fn overlong_ids_are_rejected() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        let (status, body) = validate_id("session_id", &long).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0.error.code, "validation_error");
        assert!(validate_id("session_id", "  ").is_err());
        assert!(validate_id("session_id", "s-1").is_ok());
    }
}
