//! Client-side core for talking to a local OpenCode server.

pub mod client;
pub mod connection;
pub mod context;
pub mod paths;
pub mod providers;
pub mod sessions;
pub mod types;

pub use client::OpenCodeClient;
pub use connection::{ConnectOutcome, Connection, ConnectionSnapshot, ConnectionState};
pub use context::{ClientContext, Preferences};
pub use opencode_ask_error::{ErrorKind, OpenCodeError, Remediation};
pub use opencode_ask_server_manager::{ServerInfo, ServerResolver, StaticServer};
pub use paths::{ExtractedQuery, PathResolver, PathSuggestions};
pub use types::*;
