//! HTTP client for the identity provider's local-auth endpoint.

use super::IdentityProvider;
use crate::config::TrackerConfig;
use crate::error::ServiceError;
use crate::session::UserIdentity;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    jwt: String,
    user: LoginUser,
}

#[derive(Deserialize)]
struct LoginUser {
    id: u64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl From<LoginUser> for UserIdentity {
    fn from(u: LoginUser) -> Self {
        let username = u
            .username
            .or_else(|| u.email.clone())
            .unwrap_or_else(|| u.id.to_string());
        UserIdentity {
            id: u.id,
            username,
            email: u.email,
        }
    }
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderError,
}

#[derive(Deserialize)]
struct ProviderError {
    message: String,
}

/// [`IdentityProvider`] posting `{identifier, password}` to
/// `{identity_url}/api/auth/local`.
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
    timeout_secs: u64,
}

impl HttpIdentityProvider {
    pub fn new(config: &TrackerConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.identity_url.trim_end_matches('/').to_string(),
            timeout_secs: config.request_timeout_secs,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(String, UserIdentity), ServiceError> {
        let url = format!("{}/api/auth/local", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&LoginRequest {
                identifier,
                password,
            })
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, self.timeout_secs))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ProviderErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| format!("identity provider returned HTTP {status}"));
            warn!(status, "Login rejected: {detail}");
            return Err(ServiceError::Status { status, detail });
        }

        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        let user = UserIdentity::from(parsed.user);
        info!(user = %user.username, "Logged in");
        Ok((parsed.jwt, user))
    }
}
