use serde::{Deserialize, Serialize};

/// Token pair returned by the credential endpoints (login and refresh).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Short-lived JWT access token.
    pub access_token: String,
    /// Long-lived refresh token for obtaining new access tokens.
    pub refresh_token: String,
    /// Access token expiry in millis since Unix epoch.
    pub expires_at: u64,
}
