//! `@path` handling for free-text questions.
//!
//! A question may name a project directory inline (`@~/src/app why does the
//! build fail?`). [`PathResolver::extract_path_from_query`] pulls that
//! directory out, and [`PathResolver::suggest_paths`] completes a partially
//! typed one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

const MAX_SUGGESTIONS: usize = 8;

fn path_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"@([A-Za-z0-9_/~.\-]+)").expect("valid path token regex"))
}

fn path_token_with_trailing_space() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"@[A-Za-z0-9_/~.\-]+\s*").expect("valid path token regex"))
}

fn trailing_path_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"@([A-Za-z0-9_/~.\-]*)$").expect("valid path token regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedQuery {
    pub clean_query: String,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathSuggestions {
    pub suggestions: Vec<String>,
    pub is_active: bool,
    pub path_prefix: String,
}

#[derive(Debug, Error)]
enum SuggestError {
    #[error("relative paths are not completed")]
    Relative,
    #[error("directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),
    #[error("failed to list directory: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    home: PathBuf,
}

impl PathResolver {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Uses the current user's home directory, or `/` when it is unknown.
    pub fn from_env() -> Self {
        Self::new(dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Splits an existing directory named by an `@path` token off `query`.
    ///
    /// The query is returned untouched when there is no token or the token
    /// does not name an existing directory.
    pub fn extract_path_from_query(&self, query: &str) -> ExtractedQuery {
        let unchanged = || ExtractedQuery {
            clean_query: query.to_string(),
            directory: None,
        };

        let Some(token) = path_token()
            .captures(query)
            .and_then(|captures| captures.get(1))
        else {
            return unchanged();
        };

        let path = PathBuf::from(self.expand_home(token.as_str()));
        if !path.is_dir() {
            return unchanged();
        }

        let clean_query = path_token_with_trailing_space()
            .replacen(query, 1, "")
            .trim()
            .to_string();
        ExtractedQuery {
            clean_query,
            directory: Some(path),
        }
    }

    /// Directory completions for a trailing `@path` token in `text`.
    ///
    /// Listing failures are never reported; they produce no suggestions.
    pub fn suggest_paths(&self, text: &str) -> PathSuggestions {
        let path_prefix = trailing_path_token()
            .captures(text)
            .and_then(|captures| captures.get(1))
            .map(|token| token.as_str().to_string());

        let Some(path_prefix) = path_prefix else {
            return PathSuggestions::default();
        };

        let is_active = path_prefix.starts_with('/')
            || path_prefix.starts_with("~/")
            || path_prefix.starts_with("./")
            || path_prefix == "~"
            || path_prefix == ".";

        let suggestions = if is_active {
            match self.list_directories(&path_prefix) {
                Ok(suggestions) => suggestions,
                Err(err) => {
                    debug!(prefix = %path_prefix, error = %err, "no path suggestions");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        PathSuggestions {
            suggestions,
            is_active,
            path_prefix,
        }
    }

    fn list_directories(&self, prefix: &str) -> Result<Vec<String>, SuggestError> {
        let expanded = self.expand_home(prefix);
        if !expanded.starts_with('/') {
            return Err(SuggestError::Relative);
        }

        let (parent, stem) = split_prefix(&expanded);
        if !parent.is_dir() {
            return Err(SuggestError::MissingDirectory(parent));
        }

        let stem = stem.to_lowercase();
        let mut names = Vec::new();
        for entry in fs::read_dir(&parent)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.to_lowercase().starts_with(&stem) {
                continue;
            }
            // Follows symlinks, so linked project folders are offered too.
            if fs::metadata(entry.path()).map(|meta| meta.is_dir()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();

        Ok(names
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|name| self.collapse_home(&parent.join(name)))
            .collect())
    }

    fn expand_home(&self, value: &str) -> String {
        match value.strip_prefix('~') {
            Some(rest) => format!("{}{rest}", self.home.display()),
            None => value.to_string(),
        }
    }

    /// Replaces a leading home directory with `~`.
    pub fn collapse_home(&self, path: &Path) -> String {
        match path.strip_prefix(&self.home) {
            Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Parent directory to list and the name prefix to match. A trailing `/`
/// lists that directory itself.
fn split_prefix(expanded: &str) -> (PathBuf, String) {
    if expanded.ends_with('/') {
        return (PathBuf::from(expanded), String::new());
    }
    let path = Path::new(expanded);
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("/"));
    let stem = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    (parent.to_path_buf(), stem)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn home_with(dirs: &[&str], files: &[&str]) -> (TempDir, PathResolver) {
        let home = tempfile::tempdir().expect("create home");
        for dir in dirs {
            fs::create_dir_all(home.path().join(dir)).expect("create dir");
        }
        for file in files {
            fs::write(home.path().join(file), "").expect("create file");
        }
        let resolver = PathResolver::new(home.path());
        (home, resolver)
    }

    #[test]
    fn query_without_token_is_unchanged() {
        let (_home, resolver) = home_with(&[], &[]);
        let extracted = resolver.extract_path_from_query("  why is the sky blue? ");
        assert_eq!(extracted.clean_query, "  why is the sky blue? ");
        assert_eq!(extracted.directory, None);

        let extracted = resolver.extract_path_from_query("mail me @ noon");
        assert_eq!(extracted.directory, None);
    }

    #[test]
    fn home_token_resolves_to_existing_directory() {
        let (home, resolver) = home_with(&["Projects"], &[]);
        let extracted = resolver.extract_path_from_query("@~/Projects   list the crates ");
        assert_eq!(extracted.directory, Some(home.path().join("Projects")));
        assert_eq!(extracted.clean_query, "list the crates");

        let extracted = resolver.extract_path_from_query("explain main.rs in @~/Projects");
        assert_eq!(extracted.clean_query, "explain main.rs in");
    }

    #[test]
    fn missing_directory_keeps_token() {
        let (_home, resolver) = home_with(&["Projects"], &["notes.txt"]);
        let query = "@/no/such/dir what is here?";
        let extracted = resolver.extract_path_from_query(query);
        assert_eq!(extracted.clean_query, query);
        assert_eq!(extracted.directory, None);

        let extracted = resolver.extract_path_from_query("@~/notes.txt summarize");
        assert_eq!(extracted.clean_query, "@~/notes.txt summarize");
        assert_eq!(extracted.directory, None);
    }

    #[test]
    fn suggests_matching_directories_under_home() {
        let (_home, resolver) = home_with(
            &["Documents", "docker", "Downloads", ".docs", "Desktop"],
            &["doc.txt"],
        );
        let result = resolver.suggest_paths("look in @~/Doc");
        assert!(result.is_active);
        assert_eq!(result.path_prefix, "~/Doc");
        assert_eq!(result.suggestions, vec!["~/Documents", "~/docker"]);
    }

    #[test]
    fn suggestions_are_capped() {
        let names: Vec<String> = (0..12).map(|i| format!("proj{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (_home, resolver) = home_with(&refs, &[]);

        let result = resolver.suggest_paths("@~/proj");
        assert_eq!(result.suggestions.len(), MAX_SUGGESTIONS);
        assert_eq!(result.suggestions[0], "~/proj00");
    }

    #[test]
    fn trailing_slash_lists_directory_contents() {
        let (_home, resolver) = home_with(&["code/alpha", "code/beta"], &["code/readme.md"]);
        let result = resolver.suggest_paths("@~/code/");
        assert_eq!(result.suggestions, vec!["~/code/alpha", "~/code/beta"]);
    }

    #[test]
    fn absolute_prefix_outside_home_is_left_as_is() {
        let (_home, resolver) = home_with(&[], &[]);
        let outside = tempfile::tempdir().expect("create dir");
        fs::create_dir(outside.path().join("target")).expect("create dir");

        let text = format!("@{}/tar", outside.path().display());
        let result = resolver.suggest_paths(&text);
        assert_eq!(
            result.suggestions,
            vec![outside.path().join("target").display().to_string()]
        );
    }

    #[test]
    fn inactive_and_failing_prefixes_yield_nothing() {
        let (_home, resolver) = home_with(&[], &[]);

        let result = resolver.suggest_paths("@build what changed");
        assert!(!result.is_active);
        assert!(result.suggestions.is_empty());

        let result = resolver.suggest_paths("@src");
        assert!(!result.is_active);

        let result = resolver.suggest_paths("@./src");
        assert!(result.is_active);
        assert!(result.suggestions.is_empty());

        let result = resolver.suggest_paths("@~/missing/deeper/pa");
        assert!(result.is_active);
        assert!(result.suggestions.is_empty());

        assert_eq!(resolver.suggest_paths("no token"), PathSuggestions::default());
    }

    #[test]
    fn collapse_home_only_touches_the_prefix() {
        let resolver = PathResolver::new("/home/dev");
        assert_eq!(resolver.collapse_home(Path::new("/home/dev")), "~");
        assert_eq!(resolver.collapse_home(Path::new("/home/dev/src")), "~/src");
        assert_eq!(resolver.collapse_home(Path::new("/srv/home/dev")), "/srv/home/dev");
    }
}
