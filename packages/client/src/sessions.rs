use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;

use crate::types::{Message, MessageRole, Session};

const MAX_RECENT_PROJECTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentProject {
    pub path: String,
    pub last_used: i64,
}

/// Most recently updated first.
pub fn sort_by_recent(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
}

/// The last question and answer of a conversation.
pub fn last_exchange(messages: &[Message]) -> Option<Exchange> {
    let question = messages
        .iter()
        .rev()
        .find(|message| message.info.role == MessageRole::User)?;
    let answer = messages
        .iter()
        .rev()
        .find(|message| message.info.role == MessageRole::Assistant)?;
    Some(Exchange {
        question: question.text(),
        answer: answer.text(),
    })
}

pub fn recent_projects(sessions: &[Session]) -> Vec<RecentProject> {
    let mut seen = HashSet::new();
    let mut projects: Vec<RecentProject> = sessions
        .iter()
        .filter(|session| !session.directory.is_empty())
        .filter(|session| seen.insert(session.directory.as_str()))
        .map(|session| RecentProject {
            path: session.directory.clone(),
            last_used: session.time.updated,
        })
        .collect();
    projects.sort_by(|a, b| b.last_used.cmp(&a.last_used));
    projects.truncate(MAX_RECENT_PROJECTS);
    projects
}

/// Short age of a millisecond timestamp relative to `now`.
pub fn format_relative(timestamp_ms: i64, now: DateTime<Utc>) -> String {
    let Some(then) = Utc.timestamp_millis_opt(timestamp_ms).single() else {
        return "Unknown".to_string();
    };
    let elapsed = now.signed_duration_since(then);

    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();
    let days = elapsed.num_days();
    if minutes < 1 {
        "Just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if hours < 24 {
        format!("{hours}h ago")
    } else if days < 7 {
        format!("{days}d ago")
    } else {
        then.with_timezone(&Local).format("%Y-%m-%d").to_string()
    }
}

pub fn display_directory(directory: &str, home: &Path) -> String {
    if directory.is_empty() {
        return "N/A".to_string();
    }
    let home = home.to_string_lossy();
    match directory.strip_prefix(home.as_ref()) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("~{rest}"),
        _ => directory.to_string(),
    }
}

/// Shell command that resumes `session_id` in the OpenCode TUI.
pub fn session_command(session_id: &str, directory: Option<&str>) -> String {
    match directory.filter(|directory| !directory.is_empty()) {
        Some(directory) => format!("cd \"{directory}\" && opencode --session={session_id}"),
        None => format!("opencode --session={session_id}"),
    }
}
