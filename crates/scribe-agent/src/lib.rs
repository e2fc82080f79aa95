//! The document-editing agent core.
//!
//! Converts a natural-language instruction plus a project file context
//! into a validated, ordered sequence of text edits, streaming progress
//! events to the caller and keeping per-session memory across turns.

pub mod compile;
pub mod context;
pub mod intent;
pub mod observe;
pub mod session;
pub mod tools;
pub mod turn;
pub mod validate;

pub use compile::{CompileClient, CompileOutcome};
pub use intent::{IntentResult, classify_intent};
pub use session::{SessionEntry, SessionStore};
pub use turn::TurnOutcome;
pub use validate::ValidationOutcome;

use observe::Observer;
use scribe_core::{AppConfig, Result};
use scribe_llm::{ChatClient, LlmClient};
use std::path::Path;
use std::sync::Arc;

/// Long-lived handle shared by the request handlers. Each inbound turn
/// runs on its own handler; the session store is the only mutable state
/// shared across turns.
pub struct Agent {
    pub(crate) cfg: AppConfig,
    pub(crate) llm: Arc<dyn LlmClient + Send + Sync>,
    pub(crate) compiler: CompileClient,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) observer: Arc<Observer>,
}

impl Agent {
    pub fn new(workspace: &Path) -> Result<Self> {
        let cfg = AppConfig::load(workspace)?;
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(ChatClient::new(cfg.llm.clone())?);
        Self::with_client(workspace, cfg, llm)
    }

    /// Build an agent around an injected model client and session store
    /// capacity from the config. Used directly by tests.
    pub fn with_client(
        workspace: &Path,
        cfg: AppConfig,
        llm: Arc<dyn LlmClient + Send + Sync>,
    ) -> Result<Self> {
        let compiler = CompileClient::new(&cfg.compile)?;
        let sessions = Arc::new(SessionStore::new(cfg.session.capacity));
        let observer = Arc::new(Observer::new(workspace, cfg.verbose)?);
        Ok(Self {
            cfg,
            llm,
            compiler,
            sessions,
            observer,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }
}
