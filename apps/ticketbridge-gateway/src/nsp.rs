//! REST client for the NSP Public API.
//!
//! Split in two: [`NspAuthenticator`] only knows how to log on, while [`NspApi`]
//! performs entity operations with tokens from the credential manager.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use ticketbridge_core::{
    AuthError, Authenticator, CredentialError, CredentialManager, LookupError, TokenRecord,
    UserDirectory,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NspConfig;

const AUTH_ENDPOINT: &str = "logon/getauthenticationtoken";

fn build_http(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthEnvelope {
    result: Option<AuthResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthResult {
    #[serde(default)]
    token: String,
    #[serde(default)]
    expires: String,
}

/// Logs on with the configured service account.
#[derive(Debug, Clone)]
pub struct NspAuthenticator {
    cfg: NspConfig,
    http: reqwest::Client,
}

impl NspAuthenticator {
    pub fn new(cfg: NspConfig) -> anyhow::Result<Self> {
        let http = build_http(cfg.timeout)?;
        Ok(Self { cfg, http })
    }
}

#[async_trait]
impl Authenticator for NspAuthenticator {
    async fn authenticate(&self) -> Result<TokenRecord, AuthError> {
        let url = self
            .cfg
            .base_url
            .join(AUTH_ENDPOINT)
            .map_err(|e| AuthError::Transport(format!("join auth url: {e}")))?;

        info!(username = %self.cfg.username, "authenticating against NSP");
        let req = self
            .http
            .get(url)
            .header("accept", "application/json")
            .headers(ticketbridge_otel::trace_headers())
            .query(&[
                ("email", self.cfg.username.as_str()),
                ("password", self.cfg.password.0.as_str()),
            ]);

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::Timeout(self.cfg.timeout)
            } else {
                // Drop the URL: it carries the password as a query parameter.
                AuthError::Transport(e.without_url().to_string())
            }
        })?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::Timeout(self.cfg.timeout)
            } else {
                AuthError::Transport(e.without_url().to_string())
            }
        })?;

        if !status.is_success() {
            let detail = format!("{status}: {}", truncate(&String::from_utf8_lossy(&body)));
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AuthError::Rejected(detail)
                }
                _ => AuthError::Transport(detail),
            });
        }

        let envelope: AuthEnvelope = serde_json::from_slice(&body)
            .map_err(|e| AuthError::InvalidResponse(format!("decode: {e}")))?;
        let result = envelope
            .result
            .ok_or_else(|| AuthError::Rejected("no token in authentication response".to_string()))?;
        let expires_at = parse_expiry(&result.expires)?;

        TokenRecord::new(result.token, Utc::now(), expires_at)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }
}

/// NSP reports expiry as RFC 3339, usually with a `Z` suffix.
fn parse_expiry(raw: &str) -> Result<DateTime<Utc>, AuthError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AuthError::InvalidResponse(format!("token expiry {raw:?}: {e}")))
}

fn truncate(s: &str) -> String {
    const MAX: usize = 300;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[derive(Debug, Error)]
pub enum NspError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("NSP did not respond within {0:?}")]
    Timeout(Duration),
    #[error("NSP request failed: {0}")]
    Transport(String),
    #[error("NSP returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("NSP response was not valid JSON: {0}")]
    Decode(String),
    #[error("invalid NSP endpoint {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Get,
    Post,
}

/// Entity operations against NSP, authenticated through the credential manager.
#[derive(Debug, Clone)]
pub struct NspApi {
    base_url: Url,
    timeout: Duration,
    http: reqwest::Client,
    credentials: CredentialManager,
}

impl NspApi {
    pub fn new(cfg: &NspConfig, credentials: CredentialManager) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: cfg.base_url.clone(),
            timeout: cfg.timeout,
            http: build_http(cfg.timeout)?,
            credentials,
        })
    }

    pub async fn get_tickets(
        &self,
        page: u32,
        page_size: u32,
        filters: Option<Value>,
    ) -> Result<Value, NspError> {
        let mut query = json!({
            "EntityType": "Ticket",
            "Page": page,
            "PageSize": page_size,
        });
        merge_object(&mut query, filters);
        self.request(Verb::Post, "GetEntityListByQuery", Some(query))
            .await
    }

    pub async fn get_ticket_by_id(&self, ticket_id: i64) -> Result<Value, NspError> {
        self.request(
            Verb::Post,
            "GetEntityById",
            Some(json!({ "EntityType": "Ticket", "Id": ticket_id })),
        )
        .await
    }

    pub async fn create_ticket(&self, ticket: Value) -> Result<Value, NspError> {
        let mut body = json!({ "EntityType": "Ticket" });
        merge_object(&mut body, Some(ticket));
        self.request(Verb::Post, "CreateEntity", Some(body)).await
    }

    pub async fn update_ticket(&self, ticket_id: i64, updates: Value) -> Result<Value, NspError> {
        let mut body = json!({ "EntityType": "Ticket" });
        merge_object(&mut body, Some(updates));
        body["Id"] = json!(ticket_id);
        self.request(Verb::Post, "UpdateEntity", Some(body)).await
    }

    pub async fn search_entities(
        &self,
        entity_type: &str,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Value, NspError> {
        self.request(
            Verb::Post,
            "GetEntityListByQuery",
            Some(json!({
                "EntityType": entity_type,
                "SearchText": query,
                "Page": page,
                "PageSize": page_size,
            })),
        )
        .await
    }

    pub async fn get_entity_types(&self) -> Result<Value, NspError> {
        self.request(Verb::Get, "GetEntityTypes", None).await
    }

    pub async fn get_entity_metadata(&self, entity_type: &str) -> Result<Value, NspError> {
        self.request(
            Verb::Post,
            "GetEntityTypeInfo",
            Some(json!({ "EntityType": entity_type })),
        )
        .await
    }

    pub async fn get_attachments(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Value, NspError> {
        self.request(
            Verb::Post,
            "GetEntityAttachments",
            Some(json!({ "EntityType": entity_type, "Id": entity_id })),
        )
        .await
    }

    /// Find a `Person` by email. `Ok(None)` when nobody matches.
    pub async fn find_person_by_email(&self, email: &str) -> Result<Option<Value>, NspError> {
        let resp = self
            .request(
                Verb::Post,
                "GetEntityListByQuery",
                Some(json!({
                    "EntityType": "Person",
                    "Page": 1,
                    "PageSize": 1,
                    "filters": { "field": "Email", "operator": "eq", "value": email },
                })),
            )
            .await?;
        Ok(first_row(resp))
    }

    async fn request(
        &self,
        verb: Verb,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, NspError> {
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|e| NspError::Endpoint(format!("{endpoint}: {e}")))?;

        let token = self.credentials.token_for_request().await?;
        let resp = self.send(verb, &url, body.as_ref(), token.token()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return self.decode(endpoint, resp).await;
        }

        warn!(endpoint, "NSP rejected token; refreshing and retrying once");
        let fresh = self.credentials.refresh_rejected(token.token()).await?;
        let resp = self.send(verb, &url, body.as_ref(), fresh.token()).await?;
        self.decode(endpoint, resp).await
    }

    async fn send(
        &self,
        verb: Verb,
        url: &Url,
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response, NspError> {
        let req = match verb {
            Verb::Get => self.http.get(url.clone()),
            Verb::Post => self.http.post(url.clone()).json(body.unwrap_or(&json!({}))),
        };
        req.header("accept", "application/json")
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
            .headers(ticketbridge_otel::trace_headers())
            .send()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn decode(&self, endpoint: &str, resp: reqwest::Response) -> Result<Value, NspError> {
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(NspError::Status {
                status,
                body: truncate(&String::from_utf8_lossy(&bytes)),
            });
        }
        debug!(endpoint, bytes = bytes.len(), "NSP response");
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| NspError::Decode(e.to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> NspError {
        if e.is_timeout() {
            NspError::Timeout(self.timeout)
        } else {
            NspError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl UserDirectory for NspApi {
    async fn fetch_user_by_email(&self, email: &str) -> Result<Value, LookupError> {
        match self.find_person_by_email(email).await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(LookupError::NotFound(email.to_string())),
            Err(NspError::Credentials(CredentialError::Auth(e))) => Err(LookupError::Auth(e)),
            Err(NspError::Timeout(d)) => Err(LookupError::Timeout(d)),
            Err(NspError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                Err(LookupError::NotFound(email.to_string()))
            }
            Err(e) => Err(LookupError::Upstream(e.to_string())),
        }
    }
}

fn merge_object(target: &mut Value, extra: Option<Value>) {
    let (Some(target), Some(Value::Object(extra))) = (target.as_object_mut(), extra) else {
        return;
    };
    for (k, v) in extra {
        target.insert(k, v);
    }
}

/// Rows live under `Data`, either at the top level or inside `Result`.
fn first_row(resp: Value) -> Option<Value> {
    let rows = resp
        .get("Data")
        .or_else(|| resp.get("Result").and_then(|r| r.get("Data")))
        .or_else(|| resp.get("Result").filter(|r| r.is_array()))?;
    rows.as_array()?.first().cloned()
}
