//! Token validation.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};

use super::{AuthConfig, AuthError, Claims, Identity};

/// Validates a session's bearer token and resolves who it belongs to.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HS256 JWT verifier with optional dev-mode tokens.
pub struct JwtIdentityVerifier {
    config: AuthConfig,
    secret: Option<String>,
    decoding_key: Option<DecodingKey>,
}

impl JwtIdentityVerifier {
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(config: AuthConfig) -> Self {
        let secret = match config.resolve_jwt_secret() {
            Ok(secret) => secret,
            Err(e) => {
                warn!("JWT secret could not be resolved: {}", e);
                None
            }
        };
        let decoding_key = secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config,
            secret,
            decoding_key,
        }
    }

    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    fn validate_claims(&self, token: &str) -> Result<Claims, AuthError> {
        if self.config.dev_mode {
            if let Some(user_id) = token.strip_prefix("dev:") {
                return self.dev_user_claims(user_id);
            }
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    fn dev_user_claims(&self, user_id: &str) -> Result<Claims, AuthError> {
        let user = self
            .config
            .dev_users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or(AuthError::UserNotFound)?;

        debug!("accepted dev token for {}", user.id);
        Ok(Claims {
            sub: user.id.clone(),
            iss: Some("dev".to_string()),
            exp: Utc::now().timestamp() + 3600 * 24,
            iat: Some(Utc::now().timestamp()),
            email: None,
            name: Some(user.name.clone()),
            preferred_username: Some(user.id.clone()),
            role: Some(user.role.to_string()),
            roles: Vec::new(),
            sid: None,
        })
    }

    /// Sign a token for a user. Used by tooling and tests.
    pub fn issue_token(
        &self,
        user_id: &str,
        name: &str,
        role: &str,
        session_scope_id: Option<&str>,
        ttl_secs: i64,
    ) -> Result<String, AuthError> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: Some("kubechat".to_string()),
            exp: now + ttl_secs,
            iat: Some(now),
            email: None,
            name: Some(name.to_string()),
            preferred_username: Some(user_id.to_string()),
            role: Some(role.to_string()),
            roles: Vec::new(),
            sid: session_scope_id.map(str::to_string),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(format!("failed to sign token: {}", e)))
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidToken("empty token".to_string()));
        }
        self.validate_claims(token).map(Claims::into_identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DevUser, Role};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn verifier(dev_mode: bool) -> JwtIdentityVerifier {
        JwtIdentityVerifier::new(AuthConfig {
            dev_mode,
            jwt_secret: Some(SECRET.to_string()),
            dev_users: vec![DevUser {
                id: "dev".to_string(),
                name: "Developer".to_string(),
                role: Role::Admin,
            }],
        })
    }

    #[tokio::test]
    async fn test_issued_token_validates() {
        let v = verifier(false);
        let token = v
            .issue_token("u-1", "Alice", "user", Some("scope-9"), 3600)
            .unwrap();
        let identity = v.validate(&token).await.unwrap();
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.username, "Alice");
        assert_eq!(identity.role, Role::User);
        assert_eq!(identity.session_scope_id, "scope-9");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let v = verifier(false);
        let token = v.issue_token("u-1", "Alice", "user", None, -3600).unwrap();
        assert_eq!(v.validate(&token).await, Err(AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let v = verifier(false);
        assert!(matches!(
            v.validate("not-a-jwt").await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(v.validate("   ").await.is_err());
    }

    #[tokio::test]
    async fn test_dev_tokens_only_in_dev_mode() {
        let identity = verifier(true).validate("dev:dev").await.unwrap();
        assert_eq!(identity.role, Role::Admin);
        assert_eq!(identity.username, "Developer");

        assert_eq!(
            verifier(true).validate("dev:nobody").await,
            Err(AuthError::UserNotFound)
        );
        assert!(verifier(false).validate("dev:dev").await.is_err());
    }
}
