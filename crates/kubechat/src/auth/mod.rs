//! Identity verification for hub sessions.
//!
//! Sessions authenticate once with a bearer token carried in an `auth`
//! message. Tokens are HS256 JWTs; dev mode additionally accepts
//! `dev:<user-id>` tokens for the configured dev users.

mod claims;
mod config;
mod error;
mod verifier;

pub use claims::{Claims, Identity, Role};
pub use config::{AuthConfig, ConfigValidationError, DevUser};
pub use error::AuthError;
pub use verifier::{IdentityVerifier, JwtIdentityVerifier};
