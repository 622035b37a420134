//! JWT claims, user roles and the resolved session identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-mostly access.
    Viewer,
    /// Regular operator.
    #[default]
    User,
    /// Administrator.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "viewer"),
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub preferred_username: Option<String>,

    /// Single role claim.
    #[serde(default)]
    pub role: Option<String>,

    /// Roles array (OIDC style).
    #[serde(default)]
    pub roles: Vec<String>,

    /// Session scope id issued by the identity provider.
    #[serde(default)]
    pub sid: Option<String>,
}

impl Claims {
    /// Get the effective role for the user. The highest role claimed wins.
    pub fn effective_role(&self) -> Role {
        let mut best: Option<Role> = None;
        for claimed in self.role.iter().chain(self.roles.iter()) {
            let Ok(role) = claimed.parse::<Role>() else {
                continue;
            };
            best = Some(match (best, role) {
                (Some(Role::Admin), _) | (_, Role::Admin) => Role::Admin,
                (Some(Role::User), _) | (_, Role::User) => Role::User,
                _ => Role::Viewer,
            });
        }
        best.unwrap_or_default()
    }

    /// Get the display name for the user.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.preferred_username.as_deref())
            .or(self.email.as_deref())
            .unwrap_or(&self.sub)
    }

    /// Resolve the identity a session will carry.
    ///
    /// A missing session scope gets a fresh random id.
    pub fn into_identity(self) -> Identity {
        let role = self.effective_role();
        let username = self.display_name().to_string();
        let session_scope_id = self
            .sid
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Identity {
            user_id: self.sub,
            username,
            role,
            session_scope_id,
        }
    }
}

/// Who a session is acting as once authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub session_scope_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(role: Option<&str>, roles: &[&str]) -> Claims {
        Claims {
            sub: "user1".to_string(),
            iss: None,
            exp: 0,
            iat: None,
            email: Some("user1@example.com".to_string()),
            name: None,
            preferred_username: Some("alice".to_string()),
            role: role.map(str::to_string),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            sid: None,
        }
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_effective_role() {
        assert_eq!(claims(None, &[]).effective_role(), Role::User);
        assert_eq!(claims(Some("viewer"), &[]).effective_role(), Role::Viewer);
        assert_eq!(claims(Some("viewer"), &["admin"]).effective_role(), Role::Admin);
        assert_eq!(claims(Some("bogus"), &["user"]).effective_role(), Role::User);
    }

    #[test]
    fn test_identity_generates_scope_id() {
        let a = claims(None, &[]).into_identity();
        let b = claims(None, &[]).into_identity();
        assert_eq!(a.user_id, "user1");
        assert_eq!(a.username, "alice");
        assert_ne!(a.session_scope_id, b.session_scope_id);
        assert!(Uuid::parse_str(&a.session_scope_id).is_ok());

        let mut with_sid = claims(None, &[]);
        with_sid.sid = Some("scope-1".to_string());
        assert_eq!(with_sid.into_identity().session_scope_id, "scope-1");
    }
}
