use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use opencode_ask_error::OpenCodeError;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:4096";
pub const OPENCODE_BIN_ENV: &str = "OPENCODE_BIN";

const HEALTH_PATH: &str = "global/health";
const HEALTH_ATTEMPTS: usize = 20;
const HEALTH_DELAY_MS: u64 = 150;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Location of a reachable OpenCode server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub url: String,
}

pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ServerInfo, OpenCodeError>> + Send + 'a>>;

/// Makes sure an OpenCode server is reachable and reports where.
///
/// Fails with [`OpenCodeError::ServerNotRunning`] or
/// [`OpenCodeError::NotInstalled`] so callers can offer the matching fix.
pub trait ServerResolver: Send + Sync + 'static {
    fn ensure_server(&self, auto_start: bool) -> ResolveFuture<'_>;
}

/// Resolver for a server whose URL is already known.
#[derive(Debug, Clone)]
pub struct StaticServer {
    url: String,
}

impl StaticServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl ServerResolver for StaticServer {
    fn ensure_server(&self, _auto_start: bool) -> ResolveFuture<'_> {
        let url = self.url.clone();
        Box::pin(async move { Ok(ServerInfo { url }) })
    }
}

#[derive(Debug, Clone)]
pub struct OpenCodeServerManagerConfig {
    pub base_url: String,
    pub binary: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl Default for OpenCodeServerManagerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SERVER_URL.to_string(),
            binary: None,
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenCodeServerManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http_client: Client,
    config: OpenCodeServerManagerConfig,
    ensure_lock: Mutex<()>,
    state: Mutex<ManagerState>,
}

#[derive(Debug, Default)]
struct ManagerState {
    server: Option<RunningServer>,
    launch_count: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct RunningServer {
    base_url: String,
    child: Arc<StdMutex<Option<Child>>>,
}

impl OpenCodeServerManager {
    pub fn new(config: OpenCodeServerManagerConfig) -> Result<Self, OpenCodeError> {
        let http_client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                http_client,
                config,
                ensure_lock: Mutex::new(()),
                state: Mutex::new(ManagerState::default()),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        self.inner.config.base_url.trim_end_matches('/')
    }

    pub async fn ensure_server(&self, auto_start: bool) -> Result<ServerInfo, OpenCodeError> {
        let _guard = self.inner.ensure_lock.lock().await;

        if let Some(url) = self.running_base_url().await {
            if self.probe(&url).await {
                return Ok(ServerInfo { url });
            }
        }

        let base_url = self.base_url().to_string();
        if self.probe(&base_url).await {
            debug!(url = %base_url, "opencode server already running");
            return Ok(ServerInfo { url: base_url });
        }

        let binary = resolve_binary(self.inner.config.binary.as_deref())
            .ok_or(OpenCodeError::NotInstalled)?;

        if !auto_start {
            return Err(OpenCodeError::ServerNotRunning {
                url: base_url,
                reason: None,
            });
        }

        let port = loopback_port(&base_url)?;
        let child = self.spawn_server(binary, port).await?;
        let url = format!("http://127.0.0.1:{port}");

        if let Err(err) = self.wait_for_health(&url).await {
            kill_child(&child);
            let mut state = self.inner.state.lock().await;
            state.last_error = Some(err.to_string());
            return Err(err);
        }

        let mut state = self.inner.state.lock().await;
        state.launch_count += 1;
        state.server = Some(RunningServer {
            base_url: url.clone(),
            child,
        });
        state.last_error = None;
        info!(url = %url, launches = state.launch_count, "started opencode server");

        Ok(ServerInfo { url })
    }

    pub async fn shutdown(&self) {
        let _guard = self.inner.ensure_lock.lock().await;

        let child = {
            let mut state = self.inner.state.lock().await;
            state.server.take().map(|server| server.child)
        };

        if let Some(child) = child {
            kill_child(&child);
        }
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.state.lock().await.last_error.clone()
    }

    async fn running_base_url(&self) -> Option<String> {
        let running = {
            let state = self.inner.state.lock().await;
            state.server.clone()
        }?;

        if child_is_alive(&running.child) {
            return Some(running.base_url);
        }

        warn!(url = %running.base_url, "launched opencode server exited");
        let mut state = self.inner.state.lock().await;
        state.server = None;
        None
    }

    async fn probe(&self, base_url: &str) -> bool {
        let url = format!("{base_url}/{HEALTH_PATH}");
        match self.inner.http_client.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "health probe returned non-success status");
                false
            }
            Err(err) => {
                debug!(url = %url, error = %err, "health probe failed");
                false
            }
        }
    }

    async fn wait_for_health(&self, base_url: &str) -> Result<(), OpenCodeError> {
        for _ in 0..HEALTH_ATTEMPTS {
            if self.probe(base_url).await {
                return Ok(());
            }
            sleep(Duration::from_millis(HEALTH_DELAY_MS)).await;
        }

        Err(OpenCodeError::ServerNotRunning {
            url: base_url.to_string(),
            reason: Some("health check failed after launch".to_string()),
        })
    }

    async fn spawn_server(
        &self,
        binary: PathBuf,
        port: u16,
    ) -> Result<Arc<StdMutex<Option<Child>>>, OpenCodeError> {
        let log_dir = self.inner.config.log_dir.clone();

        let child = tokio::task::spawn_blocking(move || {
            let stderr = open_opencode_log(&log_dir).unwrap_or_else(|err| {
                warn!(error = %err, "failed to open opencode log, discarding output");
                Stdio::null()
            });
            info!(binary = %binary.display(), port, "launching opencode serve");
            Command::new(&binary)
                .arg("serve")
                .arg("--hostname")
                .arg("127.0.0.1")
                .arg("--port")
                .arg(port.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(stderr)
                .spawn()
        })
        .await
        .map_err(|err| OpenCodeError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, err)))?
        .map_err(OpenCodeError::Spawn)?;

        Ok(Arc::new(StdMutex::new(Some(child))))
    }
}

impl ServerResolver for OpenCodeServerManager {
    fn ensure_server(&self, auto_start: bool) -> ResolveFuture<'_> {
        Box::pin(OpenCodeServerManager::ensure_server(self, auto_start))
    }
}

/// Finds the `opencode` binary: explicit path, `OPENCODE_BIN`, `PATH`, then
/// the installer's default location under the home directory.
pub fn resolve_binary(explicit: Option<&Path>) -> Option<PathBuf> {
    let env_value = std::env::var_os(OPENCODE_BIN_ENV);
    let path_var = std::env::var_os("PATH");
    resolve_binary_from(
        explicit,
        env_value.as_deref(),
        path_var.as_deref(),
        dirs::home_dir().as_deref(),
    )
}

fn resolve_binary_from(
    explicit: Option<&Path>,
    env_value: Option<&OsStr>,
    path_var: Option<&OsStr>,
    home: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|value| !value.is_empty()) {
        let path = PathBuf::from(value);
        if path.is_file() {
            return Some(path);
        }
    }
    if let Some(path) = path_var.and_then(|path_var| find_in_path(path_var, "opencode")) {
        return Some(path);
    }
    let installed = home?.join(".opencode").join("bin").join("opencode");
    installed.is_file().then_some(installed)
}

fn find_in_path(path_var: &OsStr, binary_name: &str) -> Option<PathBuf> {
    for path in std::env::split_paths(path_var) {
        let candidate = path.join(binary_name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn loopback_port(base_url: &str) -> Result<u16, OpenCodeError> {
    let parsed = Url::parse(base_url).map_err(|err| OpenCodeError::InvalidUrl {
        url: base_url.to_string(),
        message: err.to_string(),
    })?;
    let is_loopback = matches!(
        parsed.host_str(),
        Some("127.0.0.1") | Some("localhost") | Some("[::1]")
    );
    if !is_loopback {
        return Err(OpenCodeError::ServerNotRunning {
            url: base_url.to_string(),
            reason: Some("only servers on this machine can be started automatically".to_string()),
        });
    }
    parsed
        .port_or_known_default()
        .ok_or_else(|| OpenCodeError::InvalidUrl {
            url: base_url.to_string(),
            message: "missing port".to_string(),
        })
}

fn default_log_dir() -> PathBuf {
    let mut base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.push("opencode-ask");
    base.push("logs");
    base
}

fn open_opencode_log(log_dir: &Path) -> Result<Stdio, std::io::Error> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("opencode-serve.log"))?;
    Ok(file.into())
}

fn child_is_alive(child: &Arc<StdMutex<Option<Child>>>) -> bool {
    let mut guard = match child.lock() {
        Ok(guard) => guard,
        Err(_) => return false,
    };
    let Some(child) = guard.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(Some(_)) => {
            *guard = None;
            false
        }
        Ok(None) => true,
        Err(_) => false,
    }
}

fn kill_child(child: &Arc<StdMutex<Option<Child>>>) {
    if let Ok(mut guard) = child.lock() {
        if let Some(child) = guard.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *guard = None;
    }
}
