//! MCP connection requests and per-provider resolution to a server URL and
//! headers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::error::{AiError, Result};
use crate::http_client::build_http_client;

pub const PIPEDREAM_TOKEN_URL: &str = "https://api.pipedream.com/v1/oauth/token";
pub const PIPEDREAM_MCP_URL: &str = "https://remote.mcp.pipedream.net";

/// Tokens this close to expiry are refreshed before use.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpProvider {
    #[default]
    Custom,
    Composio,
    Pipedream,
}

/// One MCP server an agent wants connected.
///
/// `config` depends on the provider: `{url, headers}` for custom servers,
/// `{profile_id}` for composio and `{app_slug}` for pipedream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConnectionRequest {
    pub qualified_name: String,
    #[serde(default)]
    pub config: Value,
    /// Tools callable on this server; empty allows all.
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub provider: McpProvider,
    #[serde(default)]
    pub external_user_id: Option<String>,
}

impl McpConnectionRequest {
    pub fn custom(qualified_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            config: json!({ "url": url.into() }),
            enabled_tools: Vec::new(),
            provider: McpProvider::Custom,
            external_user_id: None,
        }
    }

    pub fn with_enabled_tools(mut self, tools: Vec<String>) -> Self {
        self.enabled_tools = tools;
        self
    }

    fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Where and how to reach a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServer {
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// Resolves a composio profile to its tenant-scoped MCP endpoint.
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve_profile(&self, profile_id: &str) -> Result<ResolvedServer>;
}

/// Profile service reached over HTTP.
pub struct HttpProfileResolver {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ProfileResponse {
    mcp_url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl HttpProfileResolver {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: build_http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ProfileResolver for HttpProfileResolver {
    async fn resolve_profile(&self, profile_id: &str) -> Result<ResolvedServer> {
        let url = format!(
            "{}/profiles/{}/mcp",
            self.base_url,
            urlencoding::encode(profile_id)
        );
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AiError::Mcp(format!(
                "Profile service returned {} for profile {profile_id}",
                response.status()
            )));
        }
        let profile: ProfileResponse = response.json().await?;
        Ok(ResolvedServer {
            url: profile.mcp_url,
            headers: profile.headers,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipedreamCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub project_id: String,
    #[serde(default = "default_pipedream_environment")]
    pub environment: String,
}

fn default_pipedream_environment() -> String {
    "production".to_string()
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth client-credentials access to Pipedream's hosted MCP servers.
pub struct PipedreamAuth {
    client: Client,
    credentials: PipedreamCredentials,
    token_url: String,
    mcp_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl PipedreamAuth {
    pub fn new(credentials: PipedreamCredentials) -> Self {
        Self {
            client: build_http_client(),
            credentials,
            token_url: PIPEDREAM_TOKEN_URL.to_string(),
            mcp_url: PIPEDREAM_MCP_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub fn with_endpoints(mut self, token_url: impl Into<String>, mcp_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self.mcp_url = mcp_url.into();
        self
    }

    pub async fn access_token(&self) -> Result<String> {
        let cached = self
            .cached
            .lock()
            .as_ref()
            .filter(|cached| cached.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN)
            .map(|cached| cached.token.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let response = self
            .client
            .post(&self.token_url)
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": self.credentials.client_id,
                "client_secret": self.credentials.client_secret,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AiError::Mcp(format!(
                "Pipedream token request failed with {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        *self.cached.lock() = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    pub async fn resolve(&self, app_slug: &str, external_user_id: &str) -> Result<ResolvedServer> {
        let token = self.access_token().await?;

        let mut url = Url::parse(&self.mcp_url)
            .map_err(|e| AiError::Mcp(format!("Invalid Pipedream MCP URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| AiError::Mcp("Pipedream MCP URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push(external_user_id)
            .push(app_slug);

        let headers = HashMap::from([
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("x-pd-project-id".to_string(), self.credentials.project_id.clone()),
            ("x-pd-environment".to_string(), self.credentials.environment.clone()),
            ("x-pd-external-user-id".to_string(), external_user_id.to_string()),
            ("x-pd-app-slug".to_string(), app_slug.to_string()),
        ]);
        Ok(ResolvedServer {
            url: url.to_string(),
            headers,
        })
    }
}

/// Provider integrations available to the pool. Missing integrations make
/// the matching requests fail to resolve.
#[derive(Clone, Default)]
pub struct McpResolver {
    pub pipedream: Option<Arc<PipedreamAuth>>,
    pub profiles: Option<Arc<dyn ProfileResolver>>,
}

impl McpResolver {
    pub async fn resolve(&self, request: &McpConnectionRequest) -> Result<ResolvedServer> {
        match request.provider {
            McpProvider::Custom => {
                let url = request.config_str("url").ok_or_else(|| {
                    AiError::Mcp(format!("{}: custom server has no url", request.qualified_name))
                })?;
                Url::parse(url).map_err(|e| {
                    AiError::Mcp(format!("{}: invalid url {url}: {e}", request.qualified_name))
                })?;
                let headers = request
                    .config
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|headers| {
                        headers
                            .iter()
                            .filter_map(|(name, value)| {
                                value.as_str().map(|value| (name.clone(), value.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ResolvedServer {
                    url: url.to_string(),
                    headers,
                })
            }
            McpProvider::Composio => {
                let profile_id = request.config_str("profile_id").ok_or_else(|| {
                    AiError::Mcp(format!("{}: composio server has no profile_id", request.qualified_name))
                })?;
                let profiles = self
                    .profiles
                    .as_ref()
                    .ok_or_else(|| AiError::Mcp("Composio profile service is not configured".to_string()))?;
                profiles.resolve_profile(profile_id).await
            }
            McpProvider::Pipedream => {
                let auth = self
                    .pipedream
                    .as_ref()
                    .ok_or_else(|| AiError::Mcp("Pipedream credentials are not configured".to_string()))?;
                let app_slug = request
                    .config_str("app_slug")
                    .or_else(|| request.qualified_name.strip_prefix("pipedream:"))
                    .ok_or_else(|| {
                        AiError::Mcp(format!("{}: pipedream server has no app_slug", request.qualified_name))
                    })?;
                let external_user_id = request
                    .external_user_id
                    .as_deref()
                    .or_else(|| request.config_str("external_user_id"))
                    .ok_or_else(|| {
                        AiError::Mcp(format!(
                            "{}: pipedream server needs an external_user_id",
                            request.qualified_name
                        ))
                    })?;
                auth.resolve(app_slug, external_user_id).await
            }
        }
    }
}
