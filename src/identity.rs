use serde::{Deserialize, Serialize};

/// The authenticated principal on whose behalf a script runs.
///
/// Created by the caller (after its own authentication) and handed to the
/// engine by value. The engine never mutates it, and every capability call
/// made during one execution receives this same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque principal id (e.g. a user UUID).
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let role = role.into();
        if !self.has_role(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// An identity with an empty (or whitespace) id is treated as absent.
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_role_deduplicates() {
        let id = Identity::new("alice").with_role("admin").with_role("admin");
        assert_eq!(id.roles, vec!["admin"]);
        assert!(id.has_role("admin"));
        assert!(!id.has_role("editor"));
    }

    #[test]
    fn test_blank_id_is_invalid() {
        assert!(Identity::new("alice").is_valid());
        assert!(!Identity::new("").is_valid());
        assert!(!Identity::new("   ").is_valid());
    }

    #[test]
    fn test_deserialize_without_roles() {
        let id: Identity = serde_json::from_str(r#"{"id":"bob"}"#).unwrap();
        assert_eq!(id, Identity::new("bob"));
    }
}
