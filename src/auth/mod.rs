use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;

use crate::config::AuthConfig;
use crate::environment::Environment;
use crate::error::AuthError;
use crate::events::EventEmitter;
use crate::token_store::{DEFAULT_REFRESH_BUFFER, TokenStorage, select_token_storage};

pub mod authorization_code;
pub mod bearer;
pub mod client_credentials;
pub mod flow_registry;

pub use authorization_code::AuthorizationCodeProvider;
pub use bearer::BearerProvider;
pub use client_credentials::ClientCredentialsProvider;
pub use flow_registry::{FlowHandler, OAuthFlowRegistry};

pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Produces auth headers on demand. `headers` acquires a token when none is
/// live; `refresh` forces acquisition, coalescing concurrent callers onto a
/// single in-flight attempt.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn headers(&self) -> Result<HashMap<String, String>, AuthError>;
    async fn is_valid(&self) -> bool;
    async fn refresh(&self) -> Result<(), AuthError>;
}

/// Coalesces concurrent refreshes: while one acquisition is in flight every
/// caller awaits the same shared future and observes the same outcome. The
/// slot is released once resolved so the next burst re-acquires freshly.
pub(crate) struct RefreshGate {
    inflight: tokio::sync::Mutex<Option<Shared<BoxFuture<'static, Result<(), AuthError>>>>>,
}

impl RefreshGate {
    pub(crate) fn new() -> Self {
        Self {
            inflight: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn run<F>(&self, acquire: F) -> Result<(), AuthError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), AuthError>>,
    {
        let shared = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fut = acquire().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        let result = shared.await;
        let mut slot = self.inflight.lock().await;
        if slot.as_ref().is_some_and(|fut| fut.peek().is_some()) {
            *slot = None;
        }
        result
    }
}

/// Wire shape of an RFC 6749 token-endpoint success body.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenEndpointResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn default_expires_in() -> u64 {
    3600
}

/// POST a form-encoded grant to a token endpoint and classify the outcome.
/// Error text never echoes the request body.
pub(crate) async fn post_token_request(
    http: &reqwest::Client,
    endpoint: &str,
    params: &[(&str, &str)],
) -> Result<TokenEndpointResponse, AuthError> {
    let response = http
        .post(endpoint)
        .form(params)
        .send()
        .await
        .map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                AuthError::NetworkError("token endpoint unreachable".into())
            } else {
                AuthError::NetworkError(err.without_url().to_string())
            }
        })?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| AuthError::NetworkError(err.without_url().to_string()))?;

    if !status.is_success() {
        if let Ok(err_body) = serde_json::from_slice::<serde_json::Value>(&body)
            && let Some(code) = err_body.get("error").and_then(|v| v.as_str())
        {
            return Err(AuthError::from_oauth_code(code));
        }
        return Err(AuthError::from_status(status.as_u16()));
    }

    let parsed: TokenEndpointResponse = serde_json::from_slice(&body)
        .map_err(|err| AuthError::ParseError(format!("token response: {err}")))?;
    if parsed.access_token.is_empty() {
        return Err(AuthError::TokenAcquisitionFailed(
            "token endpoint returned no access token".into(),
        ));
    }
    Ok(parsed)
}

pub(crate) fn authorization_header_value(token_type: &str, access_token: &str) -> String {
    format!("{token_type} {access_token}")
}

/// Build the auth provider for one server, selecting token storage for the
/// OAuth variants. Returns `None` when the server needs no authentication.
pub fn build_provider(
    server_name: &str,
    auth: Option<&AuthConfig>,
    env: &dyn Environment,
    flows: &Arc<OAuthFlowRegistry>,
    emitter: Arc<dyn EventEmitter>,
) -> anyhow::Result<Option<Arc<dyn AuthProvider>>> {
    let storage_for = |env: &dyn Environment| -> anyhow::Result<Arc<dyn TokenStorage>> {
        Ok(select_token_storage(env, server_name, DEFAULT_REFRESH_BUFFER)?)
    };
    match auth {
        None | Some(AuthConfig::None) => Ok(None),
        Some(AuthConfig::Bearer { token, token_env }) => {
            let provider =
                BearerProvider::from_config(token.as_deref(), token_env.as_deref(), env)?;
            Ok(Some(Arc::new(provider)))
        }
        Some(AuthConfig::Oauth2Client {
            client_id,
            client_secret,
            token_endpoint,
            scope,
            audience,
        }) => {
            let provider = ClientCredentialsProvider::new(
                client_id.clone(),
                client_secret.clone(),
                token_endpoint.clone(),
                scope.clone(),
                audience.clone(),
                storage_for(env)?,
            );
            Ok(Some(provider))
        }
        Some(AuthConfig::Oauth2Code {
            client_id,
            client_secret,
            authorization_endpoint,
            token_endpoint,
            redirect_uri,
            scope,
            audience,
        }) => {
            let provider = AuthorizationCodeProvider::new(
                server_name.to_string(),
                client_id.clone(),
                client_secret.clone(),
                authorization_endpoint.clone(),
                token_endpoint.clone(),
                redirect_uri.clone(),
                scope.clone(),
                audience.clone(),
                storage_for(env)?,
                flows.clone(),
                emitter,
            );
            Ok(Some(provider))
        }
    }
}

/// Completion window for a pending authorization-code flow.
pub const FLOW_TTL: Duration = Duration::from_secs(600);
