use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    /// Human-readable name for attribution: `user_metadata.full_name`,
    /// then email, then the raw id.
    pub fn display_name(&self) -> String {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.get("full_name"))
            .and_then(|name| name.as_str())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(metadata: Option<serde_json::Value>, email: Option<&str>) -> User {
        User {
            id: "user-1".to_string(),
            email: email.map(str::to_string),
            role: Some("patient".to_string()),
            metadata,
            created_at: None,
        }
    }

    #[test]
    fn test_display_name_prefers_full_name() {
        let u = user(Some(json!({ "full_name": "Ana Torres" })), Some("ana@example.com"));
        assert_eq!(u.display_name(), "Ana Torres");
    }

    #[test]
    fn test_display_name_falls_back() {
        assert_eq!(user(Some(json!({ "full_name": "  " })), Some("ana@example.com")).display_name(), "ana@example.com");
        assert_eq!(user(None, None).display_name(), "user-1");
    }
}
