//! The authority service boundary
//!
//! Components never call [`CredentialAuthority`] directly; they hold an
//! `Arc<dyn Authority>` so the authority can live in-process or behind the
//! HTTP surface ([`crate::auth::HttpAuthority`]).

use crate::auth::claims::{Claims, PrincipalKind, ThingClaims, UserClaims};
use crate::auth::tokens::{CredentialAuthority, TokenError};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("authority unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Authority: Send + Sync {
    /// `GetAdminToken`
    async fn admin_token(&self) -> Result<String, AuthorityError>;

    /// `GetUserToken`
    async fn user_token(&self, user_id: &str) -> Result<String, AuthorityError>;

    /// `GetThingToken`
    async fn thing_token(&self, thing_id: &str, user_id: &str) -> Result<String, AuthorityError>;

    /// `GetClaimsUserToken`: user-shaped claims, role may be admin or user
    async fn user_claims(&self, token: &str) -> Result<UserClaims, AuthorityError>;

    /// `GetClaimsThingToken`
    async fn thing_claims(&self, token: &str) -> Result<ThingClaims, AuthorityError>;

    /// Validate a credential against one principal kind
    async fn validate(&self, kind: PrincipalKind, token: &str) -> Result<Claims, AuthorityError> {
        match kind {
            PrincipalKind::Thing => Ok(Claims::Thing(self.thing_claims(token).await?)),
            PrincipalKind::Admin | PrincipalKind::User => {
                let claims = self.user_claims(token).await?;
                if claims.role != kind {
                    return Err(TokenError::WrongShape.into());
                }
                Ok(Claims::User(claims))
            }
        }
    }
}

#[async_trait]
impl Authority for CredentialAuthority {
    async fn admin_token(&self) -> Result<String, AuthorityError> {
        Ok(self.issue_admin_token()?)
    }

    async fn user_token(&self, user_id: &str) -> Result<String, AuthorityError> {
        Ok(self.issue_user_token(user_id)?)
    }

    async fn thing_token(&self, thing_id: &str, user_id: &str) -> Result<String, AuthorityError> {
        Ok(self.issue_thing_token(thing_id, user_id)?)
    }

    async fn user_claims(&self, token: &str) -> Result<UserClaims, AuthorityError> {
        Ok(CredentialAuthority::user_claims(self, token)?)
    }

    async fn thing_claims(&self, token: &str) -> Result<ThingClaims, AuthorityError> {
        match CredentialAuthority::validate(self, PrincipalKind::Thing, token)? {
            Claims::Thing(claims) => Ok(claims),
            Claims::User(_) => Err(TokenError::WrongShape.into()),
        }
    }

    async fn validate(&self, kind: PrincipalKind, token: &str) -> Result<Claims, AuthorityError> {
        Ok(CredentialAuthority::validate(self, kind, token)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn authority() -> Arc<dyn Authority> {
        Arc::new(CredentialAuthority::new(b"authority-test".to_vec(), "test"))
    }

    #[tokio::test]
    async fn test_trait_round_trip() {
        let auth = authority();

        let token = auth.thing_token("t1", "u1").await.unwrap();
        let claims = auth.thing_claims(&token).await.unwrap();
        assert_eq!(claims.sub, "t1");
        assert_eq!(claims.user_id, "u1");

        let token = auth.user_token("u1").await.unwrap();
        let claims = auth.validate(PrincipalKind::User, &token).await.unwrap();
        assert_eq!(claims.subject(), "u1");
    }

    #[tokio::test]
    async fn test_trait_rejects_cross_kind() {
        let auth = authority();
        let thing = auth.thing_token("t1", "u1").await.unwrap();
        let user = auth.user_token("u1").await.unwrap();

        assert_eq!(
            auth.user_claims(&thing).await,
            Err(AuthorityError::Token(TokenError::WrongShape))
        );
        assert_eq!(
            auth.thing_claims(&user).await,
            Err(AuthorityError::Token(TokenError::WrongShape))
        );
    }
}
