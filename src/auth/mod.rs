//! Credential authority
//!
//! Principal kinds:
//! - `admin`: deployment administrator, 1 hour credentials
//! - `user`: device owner and viewer, 24 hour credentials
//! - `thing`: device publishing readings, 24 hour credentials bound to an owner
//!
//! Credentials are stateless and signed with a shared secret; nothing is
//! stored when they are issued.

mod authority;
mod claims;
mod remote;
mod tokens;

pub use authority::{Authority, AuthorityError};
pub use claims::{Claims, PrincipalKind, ThingClaims, UserClaims};
pub use remote::{ErrorBody, HttpAuthority, JwtBody, ThingTokenRequest, UserTokenRequest};
pub use tokens::{token_prefix, CredentialAuthority, ServiceKey, TokenError, ADMIN_SUBJECT};
