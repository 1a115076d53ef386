//! Session manager: the in-process control surface.
//!
//! Each session owns one conversation and one orchestrator behind an async
//! mutex, so messages within a session are handled strictly one at a time
//! while different sessions run concurrently. All sessions share the tool
//! catalog, the model provider and the debug event manager.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use toolrelay_config::{
    AppConfig, ContextConfig, LoopGuardConfig, OrchestratorConfig, SessionConfig,
};
use toolrelay_core::message::Turn;
use toolrelay_core::provider::Provider;
use toolrelay_core::tool::ToolCatalog;
use toolrelay_telemetry::{ConversationFlow, DebugEventManager, DebugStats};
use tracing::{info, warn};
use uuid::Uuid;

use crate::conversation::ConversationState;
use crate::orchestrator::{OrchestratorError, ToolCallOrchestrator};

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session limit reached (max {max})")]
    CapacityExceeded { max: usize },

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session {0} is not active")]
    NotActive(SessionId),

    #[error(transparent)]
    Orchestration(#[from] OrchestratorError),
}

/// A point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// User messages handled.
    pub message_count: usize,
    /// Failed messages since the last `start`.
    pub error_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_messages: usize,
    pub total_errors: u64,
    pub debug: DebugStats,
}

/// Everything a new session's orchestrator is built from.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub orchestrator: OrchestratorConfig,
    pub loop_guard: LoopGuardConfig,
    pub context: ContextConfig,
    pub sessions: SessionConfig,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: config.default_temperature,
            max_tokens: Some(config.default_max_tokens),
            orchestrator: config.orchestrator.clone(),
            loop_guard: config.loop_guard.clone(),
            context: config.context.clone(),
            sessions: config.sessions.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let config = AppConfig::default();
        Self::from_config(&config, config.default_model.clone())
    }
}

struct SessionMeta {
    name: String,
    status: SessionStatus,
    error_count: u32,
    total_errors: u64,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: usize,
}

struct SessionRuntime {
    conversation: ConversationState,
    orchestrator: ToolCallOrchestrator,
}

struct Session {
    id: SessionId,
    meta: Mutex<SessionMeta>,
    cancel: Mutex<CancellationToken>,
    runtime: tokio::sync::Mutex<SessionRuntime>,
}

impl Session {
    fn meta(&self) -> std::sync::MutexGuard<'_, SessionMeta> {
        self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn cancel(&self) {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    fn renew_token(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    fn is_active(&self) -> bool {
        self.meta().status == SessionStatus::Active
    }

    fn info(&self) -> SessionInfo {
        let meta = self.meta();
        SessionInfo {
            id: self.id.clone(),
            name: meta.name.clone(),
            status: meta.status,
            created_at: meta.created_at,
            last_activity: meta.last_activity,
            message_count: meta.message_count,
            error_count: meta.error_count,
        }
    }
}

pub struct SessionManager {
    provider: Arc<dyn Provider>,
    catalog: Arc<ToolCatalog>,
    debug: Arc<DebugEventManager>,
    settings: SessionSettings,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn Provider>,
        catalog: Arc<ToolCatalog>,
        debug: Arc<DebugEventManager>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            provider,
            catalog,
            debug,
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn debug(&self) -> &Arc<DebugEventManager> {
        &self.debug
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.read_sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn build_runtime(&self) -> SessionRuntime {
        let settings = &self.settings;
        let prompt = settings.orchestrator.system_prompt.trim();
        let conversation = if prompt.is_empty() {
            ConversationState::new(settings.context.max_turns)
        } else {
            ConversationState::with_system_prompt(settings.context.max_turns, prompt)
        };

        let mut orchestrator = ToolCallOrchestrator::new(
            self.provider.clone(),
            self.catalog.clone(),
            self.debug.clone(),
            settings.model.clone(),
        )
        .with_temperature(settings.temperature)
        .with_config(&settings.orchestrator)
        .with_loop_guard(settings.loop_guard.clone());
        if let Some(max) = settings.max_tokens {
            orchestrator = orchestrator.with_max_tokens(max);
        }

        SessionRuntime {
            conversation,
            orchestrator,
        }
    }

    /// Create an active session seeded with the system prompt.
    pub fn create_session(&self, name: impl Into<String>) -> Result<SessionId, SessionError> {
        let max = self.settings.sessions.max_sessions;
        let runtime = self.build_runtime();

        let mut sessions = self.write_sessions();
        if sessions.len() >= max {
            return Err(SessionError::CapacityExceeded { max });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let name = name.into();
        info!(session_id = %id, name = %name, "Session created");

        sessions.insert(
            id.clone(),
            Arc::new(Session {
                id: id.clone(),
                meta: Mutex::new(SessionMeta {
                    name,
                    status: SessionStatus::Active,
                    error_count: 0,
                    total_errors: 0,
                    created_at: now,
                    last_activity: now,
                    message_count: 0,
                }),
                cancel: Mutex::new(CancellationToken::new()),
                runtime: tokio::sync::Mutex::new(runtime),
            }),
        );
        Ok(id)
    }

    /// Reactivate a session and clear its error counter. A cancelled token
    /// is replaced; a live one is kept so `stop` still reaches the message
    /// that holds it.
    pub fn start(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.renew_token();
        let mut meta = session.meta();
        meta.status = SessionStatus::Active;
        meta.error_count = 0;
        meta.last_activity = Utc::now();
        info!(session_id = %id, "Session started");
        Ok(())
    }

    /// Stop a session and cancel whatever it is doing.
    pub fn stop(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.meta().status = SessionStatus::Stopped;
        session.cancel();
        info!(session_id = %id, "Session stopped");
        Ok(())
    }

    /// Cancel the in-flight message but leave the session active, with its
    /// error counter untouched.
    pub fn interrupt(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.cancel();
        session.renew_token();
        info!(session_id = %id, "Session interrupted");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .write_sessions()
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.cancel();
        info!(session_id = %id, "Session removed");
        Ok(())
    }

    pub fn rename(&self, id: &str, name: impl Into<String>) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.meta().name = name.into();
        Ok(())
    }

    /// Run one user message through the session's orchestrator.
    pub async fn process_message(&self, id: &str, text: &str) -> Result<String, SessionError> {
        let session = self.get(id)?;
        if !session.is_active() {
            return Err(SessionError::NotActive(id.to_string()));
        }

        let mut runtime = session.runtime.lock().await;
        // Stopped while waiting for the previous message.
        if !session.is_active() {
            return Err(SessionError::NotActive(id.to_string()));
        }

        {
            let mut meta = session.meta();
            meta.message_count += 1;
            meta.last_activity = Utc::now();
        }

        let SessionRuntime {
            conversation,
            orchestrator,
        } = &mut *runtime;
        orchestrator.set_cancellation(session.token());

        let result = orchestrator.process(conversation, id, text).await;
        session.meta().last_activity = Utc::now();

        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if !matches!(e, OrchestratorError::Cancelled) {
                    self.record_error(&session, &e);
                }
                Err(e.into())
            }
        }
    }

    fn record_error(&self, session: &Session, error: &OrchestratorError) {
        let max_errors = self.settings.sessions.max_errors;
        let mut meta = session.meta();
        meta.error_count += 1;
        meta.total_errors += 1;
        warn!(
            session_id = %session.id,
            error_count = meta.error_count,
            error = %error,
            "Message failed"
        );

        if meta.error_count > max_errors {
            meta.status = SessionStatus::Stopped;
            drop(meta);
            session.cancel();
            warn!(session_id = %session.id, max_errors, "Too many errors, session stopped");
        }
    }

    /// The session's turns, oldest first. Waits for an in-flight message.
    pub async fn history(&self, id: &str) -> Result<Vec<Turn>, SessionError> {
        let session = self.get(id)?;
        let runtime = session.runtime.lock().await;
        Ok(runtime.conversation.turns().to_vec())
    }

    /// Drop the session's turns, keeping its system prompt.
    pub async fn clear_history(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.runtime.lock().await.conversation.clear(true);
        Ok(())
    }

    /// All sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.read_sessions().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub fn session_info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        Ok(self.get(id)?.info())
    }

    pub fn flows(&self, id: &str) -> Result<Vec<ConversationFlow>, SessionError> {
        self.get(id)?;
        Ok(self.debug.flows_for_session(id))
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.read_sessions();
        let mut stats = SessionStats {
            total_sessions: sessions.len(),
            active_sessions: 0,
            total_messages: 0,
            total_errors: 0,
            debug: self.debug.stats(),
        };
        for session in sessions.values() {
            let meta = session.meta();
            if meta.status == SessionStatus::Active {
                stats.active_sessions += 1;
            }
            stats.total_messages += meta.message_count;
            stats.total_errors += meta.total_errors;
        }
        stats
    }
}
