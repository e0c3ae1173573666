//! HTTP client for the Actions dispatch service
//!
//! Clients are built from a `DispatchConfig` and cached by a fingerprint of
//! (config URL, token, scale set, proxy) so repeated reconciles reuse the
//! underlying connection pool. Deregistration is idempotent: a 404 from the
//! service means the runner is already gone and is treated as success.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// API version sent with every dispatch service request
const API_VERSION: &str = "6.0-preview";

/// Per-request deadline; dispatch calls must never block a reconcile forever
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the dispatch service client
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The configuration could not produce a working client
    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),

    /// The service answered with a non-success status
    #[error("dispatch service returned {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or status text
        message: String,
    },

    /// The request never produced a response (connect, timeout, TLS)
    #[error("transport error: {source}")]
    Transport {
        /// Underlying reqwest error
        #[from]
        source: reqwest::Error,
    },
}

impl DispatchError {
    /// Whether the caller should retry later.
    ///
    /// 5xx and transport failures are transient. 4xx responses mean the
    /// request itself is wrong and retrying without a change is pointless.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidConfig(_) => false,
            Self::Api { status, .. } => *status >= 500,
            Self::Transport { .. } => true,
        }
    }
}

/// One proxy endpoint with resolved credentials
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    /// Username from the credential secret, if any
    pub username: Option<String>,
    /// Password from the credential secret, if any
    pub password: Option<String>,
}

/// Fully resolved proxy settings for outbound dispatch traffic
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct ResolvedProxy {
    /// Proxy for plain HTTP traffic
    pub http: Option<ProxyEndpoint>,
    /// Proxy for HTTPS traffic
    pub https: Option<ProxyEndpoint>,
    /// Comma-separated hosts that bypass the proxy
    pub no_proxy: Option<String>,
}

/// Everything needed to talk to the dispatch service for one runner set
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Base URL of the dispatch service scope
    pub config_url: String,
    /// Auth token resolved from the GitHub config secret
    pub token: String,
    /// Scale set id the runners are registered under
    pub runner_scale_set_id: i64,
    /// Proxy settings, if configured
    pub proxy: Option<ResolvedProxy>,
}

impl DispatchConfig {
    /// Stable in-process fingerprint used as the client cache key
    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Operations the operator performs against the dispatch service
#[async_trait]
pub trait DispatchClient: Send + Sync {
    /// Deregister a runner by its dispatch-service id.
    ///
    /// Idempotent: a 404 means the runner is already gone and is success.
    async fn remove_runner(&self, runner_id: i64) -> Result<(), DispatchError>;
}

/// Produces configured dispatch clients for a given runner set
#[async_trait]
pub trait DispatchClientFactory: Send + Sync {
    /// Return a client for the given configuration, reusing cached ones.
    async fn client_for(
        &self,
        config: &DispatchConfig,
    ) -> Result<Arc<dyn DispatchClient>, DispatchError>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Real client backed by reqwest
struct HttpDispatchClient {
    http: reqwest::Client,
    base: String,
    token: String,
    runner_scale_set_id: i64,
}

#[async_trait]
impl DispatchClient for HttpDispatchClient {
    async fn remove_runner(&self, runner_id: i64) -> Result<(), DispatchError> {
        let url = format!(
            "{}/_apis/runtime/runnerscalesets/{}/runners/{}?api-version={}",
            self.base, self.runner_scale_set_id, runner_id, API_VERSION
        );

        debug!(runner_id, scale_set = self.runner_scale_set_id, "removing runner from dispatch service");
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            if status == reqwest::StatusCode::NOT_FOUND {
                debug!(runner_id, "runner already removed from dispatch service");
            }
            return Ok(());
        }

        let message = response.text().await.unwrap_or_else(|_| status.to_string());
        warn!(runner_id, status = status.as_u16(), "dispatch service rejected runner removal");
        Err(DispatchError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Factory caching HTTP clients by configuration fingerprint
#[derive(Default)]
pub struct HttpDispatchClientFactory {
    cache: DashMap<u64, Arc<HttpDispatchClient>>,
}

impl HttpDispatchClientFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchClientFactory for HttpDispatchClientFactory {
    async fn client_for(
        &self,
        config: &DispatchConfig,
    ) -> Result<Arc<dyn DispatchClient>, DispatchError> {
        let key = config.fingerprint();
        if let Some(client) = self.cache.get(&key) {
            return Ok(client.clone() as Arc<dyn DispatchClient>);
        }

        let http = build_http_client(config.proxy.as_ref())?;
        let client = Arc::new(HttpDispatchClient {
            http,
            base: config.config_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            runner_scale_set_id: config.runner_scale_set_id,
        });
        self.cache.insert(key, client.clone());
        Ok(client as Arc<dyn DispatchClient>)
    }
}

/// Build a reqwest client honoring the resolved proxy settings.
///
/// HTTP and HTTPS traffic each route through their own proxy; credentials
/// become Basic `Proxy-Authorization` on requests sent through that proxy.
fn build_http_client(proxy: Option<&ResolvedProxy>) -> Result<reqwest::Client, DispatchError> {
    let mut builder = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("gantry/", env!("CARGO_PKG_VERSION")));

    if let Some(proxy) = proxy {
        let no_proxy = proxy
            .no_proxy
            .as_deref()
            .and_then(reqwest::NoProxy::from_string);

        if let Some(endpoint) = &proxy.http {
            let mut p = reqwest::Proxy::http(&endpoint.url)
                .map_err(|e| DispatchError::InvalidConfig(format!("http proxy: {}", e)))?;
            if let (Some(user), Some(pass)) = (&endpoint.username, &endpoint.password) {
                p = p.basic_auth(user, pass);
            }
            builder = builder.proxy(p.no_proxy(no_proxy.clone()));
        }

        if let Some(endpoint) = &proxy.https {
            let mut p = reqwest::Proxy::https(&endpoint.url)
                .map_err(|e| DispatchError::InvalidConfig(format!("https proxy: {}", e)))?;
            if let (Some(user), Some(pass)) = (&endpoint.username, &endpoint.password) {
                p = p.basic_auth(user, pass);
            }
            builder = builder.proxy(p.no_proxy(no_proxy));
        }
    }

    builder.build().map_err(DispatchError::from)
}

// =============================================================================
// Tests
// =============================================================================
