use serde::{Deserialize, Serialize};

use super::{Resource, ResourceKind, REFERENCE_STALE_AFTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(UserRole::User),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_since: Option<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
    /// Drives the `by-role` index.
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

impl Resource for User {
    const KIND: ResourceKind = ResourceKind::User;
    const STALE_AFTER: std::time::Duration = REFERENCE_STALE_AFTER;

    fn key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user() {
        let json = r#"{"_id":"u1","name":"Ana","email":"ana@example.com","city":"Cuenca","member_since":"2024-01-01T00:00:00","preferences":["cultural"],"role":"admin"}"#;
        let user: User = serde_json::from_str(json).expect("Failed to parse user JSON");
        assert!(user.is_admin());
        assert_eq!(user.preferences, vec!["cultural"]);
        assert_eq!("ADMIN".parse::<UserRole>(), Ok(UserRole::Admin));
    }
}
