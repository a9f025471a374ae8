//! HTTP client for a remote authority
//!
//! Speaks the JSON surface served by [`crate::server::authority_router`].
//! Claims lookups need no key; issuing credentials needs the listener's
//! [`ServiceKey`].

use crate::auth::authority::{Authority, AuthorityError};
use crate::auth::claims::{ThingClaims, UserClaims};
use crate::auth::tokens::{ServiceKey, TokenError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// `{"jwt": ...}` request/response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtBody {
    pub jwt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTokenRequest {
    #[serde(rename = "UserId")]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThingTokenRequest {
    #[serde(rename = "ThingId")]
    pub thing_id: String,
    #[serde(rename = "UserId")]
    pub user_id: String,
}

/// Error body returned by the authority surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: String,
}

/// Authority reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    base_url: String,
    client: reqwest::Client,
    service_key: Option<ServiceKey>,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AuthorityError::Unavailable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            service_key: None,
        })
    }

    /// Present `key` on every request so token issuance is allowed
    pub fn with_service_key(mut self, key: ServiceKey) -> Self {
        self.service_key = Some(key);
        self
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, AuthorityError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Authority request");

        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.service_key {
            request = request.bearer_auth(key.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| AuthorityError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| AuthorityError::Unavailable(e.to_string()));
        }

        let body = response.json::<ErrorBody>().await.ok();
        match (status, body) {
            (StatusCode::UNAUTHORIZED | StatusCode::INTERNAL_SERVER_ERROR, Some(body)) => {
                match TokenError::from_code(&body.error, &body.message) {
                    Some(e) => Err(e.into()),
                    None => Err(AuthorityError::Unavailable(format!(
                        "{}: {}",
                        status, body.error
                    ))),
                }
            }
            (StatusCode::FORBIDDEN, _) => Err(AuthorityError::Unavailable(
                "authority refused the request: missing or wrong service key".to_string(),
            )),
            (status, _) => Err(AuthorityError::Unavailable(format!(
                "unexpected status {}",
                status
            ))),
        }
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn admin_token(&self) -> Result<String, AuthorityError> {
        let res: JwtBody = self.post("/auth/token/admin", &serde_json::json!({})).await?;
        Ok(res.jwt)
    }

    async fn user_token(&self, user_id: &str) -> Result<String, AuthorityError> {
        let req = UserTokenRequest {
            user_id: user_id.to_string(),
        };
        let res: JwtBody = self.post("/auth/token/user", &req).await?;
        Ok(res.jwt)
    }

    async fn thing_token(&self, thing_id: &str, user_id: &str) -> Result<String, AuthorityError> {
        let req = ThingTokenRequest {
            thing_id: thing_id.to_string(),
            user_id: user_id.to_string(),
        };
        let res: JwtBody = self.post("/auth/token/thing", &req).await?;
        Ok(res.jwt)
    }

    async fn user_claims(&self, token: &str) -> Result<UserClaims, AuthorityError> {
        let req = JwtBody {
            jwt: token.to_string(),
        };
        self.post("/auth/claims/user", &req).await
    }

    async fn thing_claims(&self, token: &str) -> Result<ThingClaims, AuthorityError> {
        let req = JwtBody {
            jwt: token.to_string(),
        };
        self.post("/auth/claims/thing", &req).await
    }
}
