// Authentication types

use serde::{Deserialize, Deserializer, Serialize};

/// Complete credential set of a signed-in session
///
/// Never persisted as one unit: each token is cached under its own key and TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: Option<String>,
}

/// Application-level result codes carried in every response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCodes {
    pub ok: i64,
    /// Access token expired, a refresh is needed
    pub token_expired: i64,
    /// Refresh token rejected, the session must end
    pub login_again: i64,
}

impl Default for ResultCodes {
    fn default() -> Self {
        Self {
            ok: 200,
            token_expired: 3000,
            login_again: 2000,
        }
    }
}

/// Standard backend response envelope: `{code, data, msg}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub msg: String,
}

/// Refresh exchange request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh exchange response payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPayload {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_user_id")]
    pub user_id: Option<String>,
}

/// New credentials obtained from a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the backend rotated the refresh token
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
}

impl From<RefreshPayload> for TokenGrant {
    fn from(payload: RefreshPayload) -> Self {
        Self {
            access_token: payload.token,
            refresh_token: payload.refresh_token.filter(|t| !t.is_empty()),
            user_id: payload.user_id,
        }
    }
}

/// User ids arrive as numbers or strings depending on the endpoint
fn deserialize_user_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
