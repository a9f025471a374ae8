//! Claim sets carried inside credentials
//!
//! Two claim schemas exist:
//! - user-shaped claims, shared by `admin` and `user` principals
//! - thing-shaped claims, which additionally carry the owning user id
//!
//! Both schemas reject unknown fields so a thing-shaped claim can never be
//! decoded as a user-shaped one (and vice versa).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of principal a credential represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    /// Deployment administrator
    Admin,
    /// End user owning devices
    User,
    /// Device ("thing") publishing readings
    Thing,
}

impl PrincipalKind {
    pub const ALL: [PrincipalKind; 3] = [PrincipalKind::Admin, PrincipalKind::User, PrincipalKind::Thing];

    /// Parse from string. `device` is accepted as an alias for `thing`.
    pub fn parse(s: &str) -> Option<PrincipalKind> {
        match s.to_lowercase().as_str() {
            "admin" => Some(PrincipalKind::Admin),
            "user" => Some(PrincipalKind::User),
            "thing" | "device" => Some(PrincipalKind::Thing),
            _ => None,
        }
    }

    /// Credential lifetime in seconds
    pub fn ttl_secs(&self) -> u64 {
        match self {
            PrincipalKind::Admin => 60 * 60,
            PrincipalKind::User | PrincipalKind::Thing => 24 * 60 * 60,
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalKind::Admin => write!(f, "admin"),
            PrincipalKind::User => write!(f, "user"),
            PrincipalKind::Thing => write!(f, "thing"),
        }
    }
}

/// Claims of an admin or user credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserClaims {
    #[serde(rename = "Role")]
    pub role: PrincipalKind,
    /// User id (`"0"` for the admin principal)
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    /// Deployment environment tag
    pub iss: String,
}

/// Claims of a thing credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThingClaims {
    #[serde(rename = "Role")]
    pub role: PrincipalKind,
    /// Thing id
    pub sub: String,
    /// Owning user id
    #[serde(rename = "UserId")]
    pub user_id: String,
    pub iat: u64,
    pub exp: u64,
    pub iss: String,
}

/// Validated claims, tagged by schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claims {
    User(UserClaims),
    Thing(ThingClaims),
}

impl Claims {
    pub fn kind(&self) -> PrincipalKind {
        match self {
            Claims::User(c) => c.role,
            Claims::Thing(c) => c.role,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Claims::User(c) => &c.sub,
            Claims::Thing(c) => &c.sub,
        }
    }

    pub fn expires_at(&self) -> u64 {
        match self {
            Claims::User(c) => c.exp,
            Claims::Thing(c) => c.exp,
        }
    }

    pub fn issuer(&self) -> &str {
        match self {
            Claims::User(c) => &c.iss,
            Claims::Thing(c) => &c.iss,
        }
    }

    /// Owning user id, only present on thing claims
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Claims::User(_) => None,
            Claims::Thing(c) => Some(&c.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_kind_parse() {
        assert_eq!(PrincipalKind::parse("admin"), Some(PrincipalKind::Admin));
        assert_eq!(PrincipalKind::parse("USER"), Some(PrincipalKind::User));
        assert_eq!(PrincipalKind::parse("thing"), Some(PrincipalKind::Thing));
        assert_eq!(PrincipalKind::parse("device"), Some(PrincipalKind::Thing));
        assert_eq!(PrincipalKind::parse("root"), None);
    }

    #[test]
    fn test_ttl() {
        assert_eq!(PrincipalKind::Admin.ttl_secs(), 3600);
        assert_eq!(PrincipalKind::User.ttl_secs(), 86400);
        assert_eq!(PrincipalKind::Thing.ttl_secs(), 86400);
    }

    #[test]
    fn test_thing_claims_do_not_decode_as_user_claims() {
        let thing = ThingClaims {
            role: PrincipalKind::Thing,
            sub: "t1".to_string(),
            user_id: "u1".to_string(),
            iat: 1,
            exp: 2,
            iss: "test".to_string(),
        };
        let json = serde_json::to_vec(&thing).unwrap();
        assert!(serde_json::from_slice::<UserClaims>(&json).is_err());
    }

    #[test]
    fn test_user_claims_do_not_decode_as_thing_claims() {
        let user = UserClaims {
            role: PrincipalKind::User,
            sub: "u1".to_string(),
            iat: 1,
            exp: 2,
            iss: "test".to_string(),
        };
        let json = serde_json::to_vec(&user).unwrap();
        assert!(serde_json::from_slice::<ThingClaims>(&json).is_err());
    }

    #[test]
    fn test_claims_accessors() {
        let claims = Claims::Thing(ThingClaims {
            role: PrincipalKind::Thing,
            sub: "t1".to_string(),
            user_id: "u1".to_string(),
            iat: 1,
            exp: 2,
            iss: "test".to_string(),
        });
        assert_eq!(claims.kind(), PrincipalKind::Thing);
        assert_eq!(claims.subject(), "t1");
        assert_eq!(claims.owner_id(), Some("u1"));
        assert_eq!(claims.expires_at(), 2);
    }
}
