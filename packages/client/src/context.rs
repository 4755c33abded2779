use std::sync::{Arc, Mutex as StdMutex};

use opencode_ask_error::OpenCodeError;
use opencode_ask_server_manager::ServerResolver;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::OpenCodeClient;

#[derive(Debug, Clone)]
pub struct Preferences {
    /// Directory used when a caller does not ask for one explicitly.
    pub default_project: Option<String>,
    pub auto_start_server: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            default_project: None,
            auto_start_server: true,
        }
    }
}

/// Owns the one cached [`OpenCodeClient`] of an application session.
///
/// Callers share the context through an `Arc`; the cached client is rebuilt
/// only when a different directory is requested or after
/// [`ClientContext::reset_client`].
pub struct ClientContext {
    resolver: Arc<dyn ServerResolver>,
    preferences: Preferences,
    http: Client,
    ensure_lock: Mutex<()>,
    state: StdMutex<ContextState>,
}

#[derive(Default)]
struct ContextState {
    client: Option<Arc<OpenCodeClient>>,
    server_url: Option<String>,
    clients_built: u64,
}

impl ClientContext {
    pub fn new(resolver: Arc<dyn ServerResolver>, preferences: Preferences) -> Self {
        Self::with_http(resolver, preferences, Client::new())
    }

    pub fn with_http(
        resolver: Arc<dyn ServerResolver>,
        preferences: Preferences,
        http: Client,
    ) -> Self {
        Self {
            resolver,
            preferences,
            http,
            ensure_lock: Mutex::new(()),
            state: StdMutex::new(ContextState::default()),
        }
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    /// Returns the cached client, building one bound to `directory` (or the
    /// default project) when none is cached or a directory is supplied.
    pub async fn get_client(
        &self,
        directory: Option<&str>,
    ) -> Result<Arc<OpenCodeClient>, OpenCodeError> {
        let _guard = self.ensure_lock.lock().await;

        let server = match self
            .resolver
            .ensure_server(self.preferences.auto_start_server)
            .await
        {
            Ok(server) => server,
            Err(err) => {
                warn!(error = %err, kind = ?err.kind(), "failed to resolve opencode server");
                return Err(err);
            }
        };

        let mut state = self.lock_state();
        state.server_url = Some(server.url.clone());

        if let Some(client) = state.client.as_ref() {
            let same_server = client.base_url() == server.url;
            let same_directory =
                directory.map_or(true, |dir| client.directory().as_deref() == Some(dir));
            if same_server && same_directory {
                return Ok(client.clone());
            }
        }

        let effective = directory
            .map(str::to_string)
            .or_else(|| self.preferences.default_project.clone());
        let client = Arc::new(OpenCodeClient::with_http(
            self.http.clone(),
            server.url.clone(),
            effective.clone(),
        ));
        state.clients_built += 1;
        state.client = Some(client.clone());
        info!(
            url = %server.url,
            directory = ?effective,
            clients_built = state.clients_built,
            "created opencode client"
        );

        Ok(client)
    }

    pub fn reset_client(&self) {
        let mut state = self.lock_state();
        if state.client.take().is_some() {
            debug!("reset cached opencode client");
        }
    }

    /// Last resolved server URL, for diagnostics.
    pub fn server_url(&self) -> Option<String> {
        self.lock_state().server_url.clone()
    }

    pub fn clients_built(&self) -> u64 {
        self.lock_state().clients_built
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
