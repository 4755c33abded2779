use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use opencode_ask_error::OpenCodeError;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::client::OpenCodeClient;
use crate::context::ClientContext;
use crate::types::{Agent, PromptOptions, Session};

const TITLE_PREFIX: &str = "Raycast: ";
const TITLE_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { version: String },
    Failed,
}

/// Consistent view of a [`Connection`], published after every transition.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub working_directory: Option<String>,
    pub generation: u64,
    pub agents: Vec<Agent>,
    pub current_session: Option<Session>,
    pub error: Option<Arc<OpenCodeError>>,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting)
    }
}

#[derive(Debug)]
pub enum ConnectOutcome {
    Connected { version: String },
    Failed(Arc<OpenCodeError>),
    /// A newer directory change or reconnect started while this attempt ran.
    Superseded,
}

/// Connection lifecycle against an OpenCode server for one working directory.
///
/// Every connect attempt is tagged with the generation current when it
/// started. Changing the directory or reconnecting bumps the generation, and
/// results of older attempts are dropped, so the last requested directory
/// always decides the final state.
pub struct Connection {
    context: Arc<ClientContext>,
    state: StdMutex<ConnectionSnapshot>,
    session_lock: Mutex<()>,
    updates: watch::Sender<ConnectionSnapshot>,
}

impl Connection {
    pub fn new(context: Arc<ClientContext>, working_directory: Option<String>) -> Self {
        let snapshot = ConnectionSnapshot {
            state: ConnectionState::Disconnected,
            working_directory,
            generation: 0,
            agents: Vec::new(),
            current_session: None,
            error: None,
        };
        let (updates, _) = watch::channel(snapshot.clone());
        Self {
            context,
            state: StdMutex::new(snapshot),
            session_lock: Mutex::new(()),
            updates,
        }
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.lock_state().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().is_connected()
    }

    pub fn is_loading(&self) -> bool {
        self.lock_state().is_loading()
    }

    pub fn error(&self) -> Option<Arc<OpenCodeError>> {
        self.lock_state().error.clone()
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.lock_state().agents.clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.lock_state().current_session.clone()
    }

    pub fn working_directory(&self) -> Option<String> {
        self.lock_state().working_directory.clone()
    }

    /// Health-checks the server for the current working directory and loads
    /// the selectable agents.
    pub async fn connect(&self) -> ConnectOutcome {
        let (generation, directory) = self.update(|state| {
            state.state = ConnectionState::Connecting;
            state.error = None;
            (state.generation, state.working_directory.clone())
        });
        debug!(generation, directory = ?directory, "connecting to opencode");

        let result = self.probe(directory.as_deref()).await;

        self.update(|state| {
            if state.generation != generation {
                debug!(
                    generation,
                    current = state.generation,
                    "discarding stale connect result"
                );
                return ConnectOutcome::Superseded;
            }

            match result {
                Ok((version, agents)) => {
                    info!(version = %version, directory = ?directory, "connected to opencode");
                    state.state = ConnectionState::Connected {
                        version: version.clone(),
                    };
                    state.agents = agents;
                    ConnectOutcome::Connected { version }
                }
                Err(err) => {
                    warn!(error = %err, directory = ?directory, "failed to connect to opencode");
                    let err = Arc::new(err);
                    state.state = ConnectionState::Failed;
                    state.error = Some(err.clone());
                    ConnectOutcome::Failed(err)
                }
            }
        })
    }

    /// Rebinds the connection to `directory` and reconnects. The current
    /// session belongs to the old directory and is dropped.
    pub async fn set_working_directory(&self, directory: impl Into<String>) -> ConnectOutcome {
        let directory = directory.into();
        self.update(|state| {
            state.working_directory = Some(directory);
            state.generation += 1;
            state.current_session = None;
        });
        self.context.reset_client();
        self.connect().await
    }

    pub async fn reconnect(&self) -> ConnectOutcome {
        self.context.reset_client();
        self.update(|state| {
            state.generation += 1;
            state.current_session = None;
        });
        self.connect().await
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<Session, OpenCodeError> {
        let (generation, directory) = self.generation_and_directory();
        let client = self.context.get_client(directory.as_deref()).await?;
        let session = client.create_session(title).await?;
        self.store_session(generation, &session);
        Ok(session)
    }

    /// Sends `text` to the current session, creating one first if needed, and
    /// returns the reply's text.
    pub async fn send_prompt(
        &self,
        text: &str,
        options: &PromptOptions,
    ) -> Result<String, OpenCodeError> {
        if options.model.is_none() {
            return Err(OpenCodeError::MissingModel);
        }

        let (generation, directory) = self.generation_and_directory();
        let client = self.context.get_client(directory.as_deref()).await?;
        let session = self.ensure_session(&client, generation, text).await?;

        let response = client.send_prompt(&session.id, text, options).await?;
        Ok(response.text())
    }

    async fn ensure_session(
        &self,
        client: &OpenCodeClient,
        generation: u64,
        text: &str,
    ) -> Result<Session, OpenCodeError> {
        let _guard = self.session_lock.lock().await;

        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        let title = session_title(text);
        let session = client.create_session(Some(&title)).await?;
        info!(session_id = %session.id, title = %title, "created opencode session");
        self.store_session(generation, &session);
        Ok(session)
    }

    async fn probe(
        &self,
        directory: Option<&str>,
    ) -> Result<(String, Vec<Agent>), OpenCodeError> {
        let client = self.context.get_client(directory).await?;
        let health = client.health().await?;
        if !health.healthy {
            return Err(OpenCodeError::Unhealthy {
                version: health.version,
            });
        }

        let agents = client
            .list_agents()
            .await?
            .into_iter()
            .filter(Agent::is_selectable)
            .collect();
        Ok((health.version, agents))
    }

    fn store_session(&self, generation: u64, session: &Session) {
        self.update(|state| {
            if state.generation == generation {
                state.current_session = Some(session.clone());
            } else {
                debug!(session_id = %session.id, "not keeping session for a previous directory");
            }
        });
    }

    fn generation_and_directory(&self) -> (u64, Option<String>) {
        let state = self.lock_state();
        (state.generation, state.working_directory.clone())
    }

    fn update<R>(&self, apply: impl FnOnce(&mut ConnectionSnapshot) -> R) -> R {
        let mut state = self.lock_state();
        let result = apply(&mut state);
        self.updates.send_replace(state.clone());
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Title for sessions created from a prompt: a prefixed preview of at most
/// 50 characters, with `...` when the prompt was cut.
pub fn session_title(text: &str) -> String {
    let mut chars = text.chars();
    let preview: String = chars.by_ref().take(TITLE_PREVIEW_CHARS).collect();
    let ellipsis = if chars.next().is_some() { "..." } else { "" };
    format!("{TITLE_PREFIX}{preview}{ellipsis}")
}
