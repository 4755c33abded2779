use std::sync::RwLock;
use std::time::Instant;

use opencode_ask_error::OpenCodeError;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::types::{
    Agent, CreateSessionRequest, HealthResponse, Message, PromptOptions, PromptRequest,
    ProviderResponse, Session, TextPartInput,
};

pub const DIRECTORY_HEADER: &str = "x-opencode-directory";
pub const DIRECTORY_QUERY: &str = "directory";

/// Typed client for the OpenCode REST API.
///
/// When a working directory is bound it is attached to every request, both as
/// the `directory` query parameter and the `x-opencode-directory` header, so
/// the server scopes sessions to that project.
#[derive(Debug)]
pub struct OpenCodeClient {
    http: Client,
    base_url: String,
    directory: RwLock<Option<String>>,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>, directory: Option<String>) -> Self {
        Self::with_http(Client::new(), base_url, directory)
    }

    pub fn with_http(http: Client, base_url: impl Into<String>, directory: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            directory: RwLock::new(directory),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn directory(&self) -> Option<String> {
        self.directory
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_directory(&self, directory: impl Into<String>) {
        *self
            .directory
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(directory.into());
    }

    pub async fn health(&self) -> Result<HealthResponse, OpenCodeError> {
        self.get("/global/health").await
    }

    /// Sessions in server order; callers sort as needed.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, OpenCodeError> {
        self.get("/session").await
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<Session, OpenCodeError> {
        let body = CreateSessionRequest { title };
        self.request(Method::POST, "/session", Some(&body), &[]).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, OpenCodeError> {
        self.get(&format!("/session/{session_id}")).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool, OpenCodeError> {
        self.request::<bool, ()>(Method::DELETE, &format!("/session/{session_id}"), None, &[])
            .await
    }

    pub async fn get_session_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, OpenCodeError> {
        self.request::<_, ()>(
            Method::GET,
            &format!("/session/{session_id}/message"),
            None,
            &[("limit", limit.map(|limit| limit.to_string()))],
        )
        .await
    }

    /// Posts a text prompt and waits for the assistant's reply.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
        options: &PromptOptions,
    ) -> Result<Message, OpenCodeError> {
        let model = options.model.as_ref().ok_or(OpenCodeError::MissingModel)?;
        let body = PromptRequest {
            parts: vec![TextPartInput {
                part_type: "text",
                text,
            }],
            agent: options.agent.as_deref(),
            model,
        };
        self.request(
            Method::POST,
            &format!("/session/{session_id}/message"),
            Some(&body),
            &[],
        )
        .await
    }

    pub async fn abort_session(&self, session_id: &str) -> Result<bool, OpenCodeError> {
        self.request::<bool, ()>(Method::POST, &format!("/session/{session_id}/abort"), None, &[])
            .await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, OpenCodeError> {
        self.get("/agent").await
    }

    pub async fn list_providers(&self) -> Result<ProviderResponse, OpenCodeError> {
        self.get("/provider").await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, OpenCodeError> {
        self.request::<T, ()>(Method::GET, path, None, &[]).await
    }

    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        query: &[(&str, Option<String>)],
    ) -> Result<T, OpenCodeError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let directory = self.directory();
        let started_at = Instant::now();

        let mut builder = self
            .http
            .request(method.clone(), url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if let Some(directory) = directory.as_deref() {
            builder = builder
                .query(&[(DIRECTORY_QUERY, directory)])
                .header(DIRECTORY_HEADER, directory);
        }
        for (key, value) in query {
            if let Some(value) = value {
                builder = builder.query(&[(key, value)]);
            }
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        debug!(
            method = %method,
            path,
            status = status.as_u16(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "opencode request finished"
        );

        if !status.is_success() {
            return Err(OpenCodeError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|source| OpenCodeError::Decode {
            path: path.to_string(),
            source,
        })
    }
}
