use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use opencode_ask_client::providers::{
    default_model, favorite_models, filter_agents, selectable_agents,
};
use opencode_ask_client::sessions::{
    display_directory, format_relative, last_exchange, recent_projects, session_command,
    sort_by_recent, RecentProject,
};
use opencode_ask_client::{
    Agent, ClientContext, ConnectOutcome, Connection, FavoriteModel, ModelRef, OpenCodeError,
    PathResolver, Preferences, PromptOptions, ServerResolver, Session, StaticServer,
};
use opencode_ask_server_manager::{
    OpenCodeServerManager, OpenCodeServerManagerConfig, DEFAULT_SERVER_URL, OPENCODE_BIN_ENV,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "warn";
const SERVER_URL_ENV: &str = "OPENCODE_URL";
const DEFAULT_PROJECT_ENV: &str = "OPENCODE_ASK_DEFAULT_PROJECT";

#[derive(Parser, Debug)]
#[command(name = "opencode-ask", bin_name = "opencode-ask")]
#[command(about = "Ask a local OpenCode server questions", version)]
#[command(arg_required_else_help = true)]
pub struct OpenCodeAskCli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Base URL of the OpenCode server [default: http://127.0.0.1:4096].
    #[arg(long, global = true, env = SERVER_URL_ENV)]
    server_url: Option<String>,

    /// Project directory used when a question names none.
    #[arg(long, global = true, env = DEFAULT_PROJECT_ENV)]
    default_project: Option<String>,

    /// Fail instead of launching `opencode serve` when no server answers.
    #[arg(long, global = true)]
    no_auto_start: bool,

    #[arg(long, global = true, env = OPENCODE_BIN_ENV)]
    opencode_bin: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask a question; `@path` in the question picks the project directory.
    Ask(AskArgs),
    /// Check that the server is up.
    Health,
    /// List the agents a prompt can be sent to.
    Agents(AgentsArgs),
    /// List the default models of the configured providers.
    Models,
    /// List recently used project directories.
    Projects,
    /// Complete a trailing `@path` token.
    Complete(CompleteArgs),
    /// Inspect and manage sessions.
    Sessions(SessionsArgs),
}

#[derive(Args, Debug)]
pub struct AskArgs {
    #[arg(required = true, num_args = 1..)]
    question: Vec<String>,

    #[arg(long, short = 'a')]
    agent: Option<String>,

    /// Model as provider/model; defaults to the first favorite model.
    #[arg(long, short = 'm')]
    model: Option<ModelRef>,
}

#[derive(Args, Debug)]
pub struct AgentsArgs {
    filter: Option<String>,
}

#[derive(Args, Debug)]
pub struct CompleteArgs {
    text: String,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(subcommand)]
    command: SessionsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// List sessions, most recently updated first.
    List(SessionListArgs),
    /// Show a session and its last exchange.
    Show(SessionShowArgs),
    Delete(SessionIdArgs),
    /// Stop the session's in-flight prompt.
    Abort(SessionIdArgs),
    /// Print the shell command that resumes a session in the OpenCode TUI.
    Command(SessionIdArgs),
}

#[derive(Args, Debug)]
pub struct SessionListArgs {
    #[arg(long, short = 'n')]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SessionShowArgs {
    session_id: String,

    /// Number of messages to fetch.
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Args, Debug)]
pub struct SessionIdArgs {
    session_id: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    OpenCode(#[from] OpenCodeError),
    #[error("{0}")]
    Connect(Arc<OpenCodeError>),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("interrupted")]
    Interrupted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn opencode(&self) -> Option<&OpenCodeError> {
        match self {
            Self::OpenCode(err) => Some(err),
            Self::Connect(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Where command output goes: answers and listings on stdout, status notes
/// on stderr.
pub struct Terminal<'a> {
    stdout: &'a mut dyn Write,
    stderr: &'a mut dyn Write,
    json: bool,
}

impl<'a> Terminal<'a> {
    pub fn new(stdout: &'a mut dyn Write, stderr: &'a mut dyn Write, json: bool) -> Self {
        Self {
            stdout,
            stderr,
            json,
        }
    }

    fn text(&mut self, text: &str) -> Result<(), CliError> {
        self.stdout.write_all(text.as_bytes())?;
        self.stdout.flush()?;
        Ok(())
    }

    fn line(&mut self, text: &str) -> Result<(), CliError> {
        self.stdout.write_all(text.as_bytes())?;
        self.stdout.write_all(b"\n")?;
        self.stdout.flush()?;
        Ok(())
    }

    fn note(&mut self, text: &str) -> Result<(), CliError> {
        self.stderr.write_all(text.as_bytes())?;
        self.stderr.write_all(b"\n")?;
        self.stderr.flush()?;
        Ok(())
    }

    fn print_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CliError> {
        let pretty = serde_json::to_string_pretty(value)?;
        self.line(&pretty)
    }
}

/// Runs the CLI. Failures are reported on stderr here, once.
pub fn run_opencode_ask() -> Result<(), CliError> {
    let cli = OpenCodeAskCli::parse();
    let json = cli.global.json;
    let result = run_cli(&cli);
    if let Err(err) = &result {
        report_error(err, json, &mut std::io::stderr());
    }
    result
}

fn run_cli(cli: &OpenCodeAskCli) -> Result<(), CliError> {
    init_logging()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let context = build_context(&cli.global)?;
    let paths = PathResolver::from_env();

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut terminal = Terminal::new(&mut stdout, &mut stderr, cli.global.json);
    runtime.block_on(run_command(&cli.command, &context, &paths, &mut terminal))
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub async fn run_command(
    command: &Command,
    context: &Arc<ClientContext>,
    paths: &PathResolver,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    match command {
        Command::Ask(args) => run_ask(context, paths, args, terminal).await,
        Command::Health => run_health(context, terminal).await,
        Command::Agents(args) => run_agents(context, args, terminal).await,
        Command::Models => run_models(context, terminal).await,
        Command::Projects => run_projects(context, paths, terminal).await,
        Command::Complete(args) => run_complete(paths, args, terminal),
        Command::Sessions(args) => run_sessions(context, paths, &args.command, terminal).await,
    }
}

pub fn build_context(global: &GlobalArgs) -> Result<Arc<ClientContext>, CliError> {
    let preferences = Preferences {
        default_project: global.default_project.clone(),
        auto_start_server: !global.no_auto_start,
    };
    Ok(Arc::new(ClientContext::new(resolver_for(global)?, preferences)))
}

/// An explicit URL without auto-start is used as given; everything else goes
/// through the server manager, which can launch `opencode serve`.
fn resolver_for(global: &GlobalArgs) -> Result<Arc<dyn ServerResolver>, CliError> {
    let resolver: Arc<dyn ServerResolver> = match global.server_url.as_deref() {
        Some(url) if global.no_auto_start => Arc::new(StaticServer::new(url)),
        url => Arc::new(OpenCodeServerManager::new(OpenCodeServerManagerConfig {
            base_url: url.unwrap_or(DEFAULT_SERVER_URL).to_string(),
            binary: global.opencode_bin.clone(),
            ..OpenCodeServerManagerConfig::default()
        })?),
    };
    Ok(resolver)
}

async fn run_ask(
    context: &Arc<ClientContext>,
    paths: &PathResolver,
    args: &AskArgs,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    let extracted = paths.extract_path_from_query(&args.question.join(" "));
    if extracted.clean_query.is_empty() {
        return Err(CliError::InvalidArgument("question is empty".to_string()));
    }
    let directory = extracted
        .directory
        .as_deref()
        .map(|directory| directory.to_string_lossy().into_owned());

    let connection = Connection::new(context.clone(), directory);
    match connection.connect().await {
        ConnectOutcome::Connected { version } => {
            if !terminal.json {
                terminal.note(&format!("Connected to OpenCode {version}"))?;
            }
        }
        ConnectOutcome::Failed(err) => return Err(CliError::Connect(err)),
        ConnectOutcome::Superseded => {}
    }

    if let Some(agent) = args.agent.as_deref() {
        validate_agent(agent, &connection.agents())?;
    }

    let model = match args.model.clone() {
        Some(model) => Some(model),
        None => {
            let client = context
                .get_client(connection.working_directory().as_deref())
                .await?;
            default_model(&favorite_models(&client.list_providers().await?))
        }
    };
    let options = PromptOptions {
        agent: args.agent.clone(),
        model,
    };

    let answer = tokio::select! {
        answer = connection.send_prompt(&extracted.clean_query, &options) => answer?,
        _ = tokio::signal::ctrl_c() => {
            abort_current(context, &connection).await;
            return Err(CliError::Interrupted);
        }
    };

    if terminal.json {
        let session = connection.current_session();
        terminal.print_json(&json!({
            "answer": answer,
            "sessionID": session.as_ref().map(|session| session.id.as_str()),
            "directory": connection.working_directory(),
            "model": options.model.as_ref().map(ModelRef::to_string),
        }))
    } else {
        terminal.line(answer.trim_end())
    }
}

async fn abort_current(context: &ClientContext, connection: &Connection) {
    let Some(session) = connection.current_session() else {
        return;
    };
    let result = match context
        .get_client(connection.working_directory().as_deref())
        .await
    {
        Ok(client) => client.abort_session(&session.id).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        tracing::warn!(session_id = %session.id, error = %err, "failed to abort session");
    }
}

fn validate_agent(name: &str, agents: &[Agent]) -> Result<(), CliError> {
    if agents.iter().any(|agent| agent.name == name) {
        return Ok(());
    }
    let available: Vec<_> = agents.iter().map(|agent| agent.name.as_str()).collect();
    Err(CliError::InvalidArgument(format!(
        "unknown agent '{name}' (available: {})",
        available.join(", ")
    )))
}

async fn run_health(
    context: &Arc<ClientContext>,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    let client = context.get_client(None).await?;
    let health = client.health().await?;
    if terminal.json {
        return terminal.print_json(&json!({
            "url": client.base_url(),
            "healthy": health.healthy,
            "version": health.version,
        }));
    }
    let status = if health.healthy { "healthy" } else { "unhealthy" };
    terminal.line(&format!(
        "{} is {status} (version {})",
        client.base_url(),
        health.version
    ))
}

async fn run_agents(
    context: &Arc<ClientContext>,
    args: &AgentsArgs,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    let client = context.get_client(None).await?;
    let agents = selectable_agents(&client.list_agents().await?);
    let matching = filter_agents(&agents, args.filter.as_deref().unwrap_or_default());
    if terminal.json {
        return terminal.print_json(&matching);
    }
    terminal.text(&render_agents(&matching))
}

async fn run_models(
    context: &Arc<ClientContext>,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    let client = context.get_client(None).await?;
    let favorites = favorite_models(&client.list_providers().await?);
    if terminal.json {
        return terminal.print_json(&favorites);
    }
    terminal.text(&render_models(&favorites))
}

async fn run_projects(
    context: &Arc<ClientContext>,
    paths: &PathResolver,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    let client = context.get_client(None).await?;
    let mut sessions = client.list_sessions().await?;
    sort_by_recent(&mut sessions);
    let projects = recent_projects(&sessions);
    if terminal.json {
        return terminal.print_json(&projects);
    }
    terminal.text(&render_projects(&projects, paths.home(), Utc::now()))
}

fn run_complete(
    paths: &PathResolver,
    args: &CompleteArgs,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    let suggestions = paths.suggest_paths(&args.text);
    if terminal.json {
        return terminal.print_json(&suggestions);
    }
    for suggestion in &suggestions.suggestions {
        terminal.line(suggestion)?;
    }
    Ok(())
}

async fn run_sessions(
    context: &Arc<ClientContext>,
    paths: &PathResolver,
    command: &SessionsCommand,
    terminal: &mut Terminal<'_>,
) -> Result<(), CliError> {
    let client = context.get_client(None).await?;
    match command {
        SessionsCommand::List(args) => {
            let mut sessions = client.list_sessions().await?;
            sort_by_recent(&mut sessions);
            if let Some(limit) = args.limit {
                sessions.truncate(limit);
            }
            if terminal.json {
                return terminal.print_json(&sessions);
            }
            terminal.text(&render_sessions(&sessions, paths.home(), Utc::now()))
        }
        SessionsCommand::Show(args) => {
            let session = client.get_session(&args.session_id).await?;
            let messages = client
                .get_session_messages(&args.session_id, args.limit)
                .await?;
            let exchange = last_exchange(&messages);
            if terminal.json {
                return terminal.print_json(&json!({
                    "session": session,
                    "lastExchange": exchange,
                    "messageCount": messages.len(),
                }));
            }
            let mut out = render_session_detail(&session, paths.home(), Utc::now());
            if let Some(exchange) = exchange {
                out.push_str(&format!(
                    "\nQuestion:\n{}\n\nAnswer:\n{}\n",
                    exchange.question, exchange.answer
                ));
            }
            terminal.text(&out)
        }
        SessionsCommand::Delete(args) => {
            let deleted = client.delete_session(&args.session_id).await?;
            print_flag(terminal, "deleted", deleted, &args.session_id)
        }
        SessionsCommand::Abort(args) => {
            let aborted = client.abort_session(&args.session_id).await?;
            print_flag(terminal, "aborted", aborted, &args.session_id)
        }
        SessionsCommand::Command(args) => {
            let session = client.get_session(&args.session_id).await?;
            let command = session_command(&session.id, Some(session.directory.as_str()));
            if terminal.json {
                return terminal.print_json(&json!({ "command": command }));
            }
            terminal.line(&command)
        }
    }
}

fn print_flag(
    terminal: &mut Terminal<'_>,
    key: &str,
    value: bool,
    session_id: &str,
) -> Result<(), CliError> {
    if terminal.json {
        let mut report = serde_json::Map::new();
        report.insert(key.to_string(), json!(value));
        report.insert("sessionID".to_string(), json!(session_id));
        return terminal.print_json(&report);
    }
    let status = if value { key.to_string() } else { format!("not {key}") };
    terminal.line(&format!("{session_id}: {status}"))
}

fn render_agents(agents: &[&Agent]) -> String {
    let width = agents.iter().map(|agent| agent.name.len()).max().unwrap_or(0);
    agents
        .iter()
        .map(|agent| match agent.description.as_deref() {
            Some(description) => format!("{:<width$}  {description}\n", agent.name),
            None => format!("{}\n", agent.name),
        })
        .collect()
}

fn render_models(favorites: &[FavoriteModel]) -> String {
    favorites
        .iter()
        .enumerate()
        .map(|(index, favorite)| {
            let marker = if index == 0 { " (default)" } else { "" };
            format!(
                "{}  {} - {}{marker}\n",
                favorite.model_ref(),
                favorite.provider_name,
                favorite.model_name
            )
        })
        .collect()
}

fn render_projects(projects: &[RecentProject], home: &Path, now: DateTime<Utc>) -> String {
    projects
        .iter()
        .map(|project| {
            format!(
                "{}  {}\n",
                display_directory(&project.path, home),
                format_relative(project.last_used, now)
            )
        })
        .collect()
}

fn render_sessions(sessions: &[Session], home: &Path, now: DateTime<Utc>) -> String {
    sessions
        .iter()
        .map(|session| {
            format!(
                "{}  {}  {}  {}\n",
                session.id,
                format_relative(session.time.updated, now),
                display_directory(&session.directory, home),
                session.title
            )
        })
        .collect()
}

fn render_session_detail(session: &Session, home: &Path, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "{}\nID:        {}\nDirectory: {}\nUpdated:   {}\nResume:    {}\n",
        session.title,
        session.id,
        display_directory(&session.directory, home),
        format_relative(session.time.updated, now),
        session_command(&session.id, Some(session.directory.as_str())),
    );
    if let Some(share) = &session.share {
        out.push_str(&format!("Shared:    {}\n", share.url));
    }
    out
}

fn report_error(err: &CliError, as_json: bool, out: &mut dyn Write) {
    let _ = writeln!(out, "{}", render_error(err, as_json));
    let _ = out.flush();
}

/// Error text for stderr, with the remediation when one applies.
fn render_error(err: &CliError, as_json: bool) -> String {
    if as_json {
        let value = match err.opencode() {
            Some(opencode) => serde_json::to_value(opencode.to_report()),
            None => Ok(json!({ "message": err.to_string() })),
        };
        return value
            .and_then(|value| serde_json::to_string_pretty(&value))
            .unwrap_or_else(|_| err.to_string());
    }

    let Some(opencode) = err.opencode() else {
        return format!("error: {err}");
    };
    match opencode.remediation() {
        Some(remediation) => format!(
            "{}: {opencode}\n{}\n\n    {}",
            remediation.title, remediation.message, remediation.command
        ),
        None => format!("{}: {opencode}", opencode.kind().title()),
    }
}
