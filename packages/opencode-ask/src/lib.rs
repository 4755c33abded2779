//! Command-line front end for asking a local OpenCode server questions.

pub mod cli;
