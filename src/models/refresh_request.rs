use serde::{Deserialize, Serialize};

/// Refresh request body for the credential endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// The long-lived refresh token obtained at login.
    pub refresh_token: String,
}
