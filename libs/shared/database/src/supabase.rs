use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

/// PostgreSQL SQLSTATE raised on a unique index violation.
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Constraint violated ({code}): {message}")]
    Constraint { code: String, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, code: Option<String>, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl DatabaseError {
    /// SQLSTATE reported by PostgREST, when the failure came from Postgres.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            DatabaseError::Constraint { code, .. } => Some(code),
            DatabaseError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.sql_state() == Some(UNIQUE_VIOLATION)
    }
}

impl From<reqwest::Error> for DatabaseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DatabaseError::Timeout
        } else if err.is_decode() {
            DatabaseError::Decode(err.to_string())
        } else {
            DatabaseError::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        let client = Client::builder()
            .timeout(config.scheduling.storage_timeout())
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to build HTTP client with timeout, using defaults: {}", e);
                Client::new()
            });

        Self {
            client,
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap, DatabaseError> {
        let mut headers = HeaderMap::new();

        headers.insert(
            "apikey",
            HeaderValue::from_str(&self.anon_key)
                .map_err(|_| DatabaseError::InvalidRequest("anon key is not a valid header value".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| DatabaseError::Auth("token is not a valid header value".to_string()))?,
            );
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T, DatabaseError>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let headers = self.get_headers(auth_token)?;

        let mut req = self.client.request(method, &url)
            .headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("API error ({}): {}", status, error_text);
            return Err(Self::classify_error(status, &error_text));
        }

        let data = response.json::<T>().await
            .map_err(|e| DatabaseError::Decode(e.to_string()))?;
        Ok(data)
    }

    /// Invoke a Postgres function exposed by PostgREST under `/rest/v1/rpc`.
    /// The function body runs inside a single database transaction.
    pub async fn rpc<T>(&self, function: &str, args: Value, auth_token: Option<&str>) -> Result<T, DatabaseError>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/rpc/{}", function);
        self.request(Method::POST, &path, auth_token, Some(args)).await
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }

    fn classify_error(status: StatusCode, body: &str) -> DatabaseError {
        let parsed: Option<PostgrestError> = serde_json::from_str(body).ok();
        let code = parsed.as_ref().and_then(|p| p.code.clone());
        let message = parsed
            .as_ref()
            .and_then(|p| p.message.clone().or_else(|| p.details.clone()))
            .unwrap_or_else(|| body.to_string());

        if code.as_deref() == Some(UNIQUE_VIOLATION) || status == StatusCode::CONFLICT {
            return DatabaseError::Constraint {
                code: code.unwrap_or_else(|| UNIQUE_VIOLATION.to_string()),
                message,
            };
        }

        match status.as_u16() {
            401 | 403 => DatabaseError::Auth(message),
            404 => DatabaseError::NotFound(message),
            408 | 504 => DatabaseError::Timeout,
            502 | 503 => DatabaseError::Unavailable(message),
            s => DatabaseError::Api { status: s, code, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_unique_violation() {
        let body = r#"{"code":"23505","message":"duplicate key value violates unique constraint \"appointments_active_slot_key\"","details":null}"#;
        let err = SupabaseClient::classify_error(StatusCode::CONFLICT, body);
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_classify_custom_sql_state() {
        let body = r#"{"code":"AUD01","message":"audit append rejected"}"#;
        let err = SupabaseClient::classify_error(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.sql_state(), Some("AUD01"));
        assert!(!err.is_unique_violation());
    }

    #[test]
    fn test_classify_gateway_timeout() {
        let err = SupabaseClient::classify_error(StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
        assert!(matches!(err, DatabaseError::Timeout));
    }
}
