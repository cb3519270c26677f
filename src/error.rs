//! Error types shared across the session core and the portal API.

use reqwest::StatusCode;
use thiserror::Error;

use crate::session::Role;

/// Network-level failure talking to the backend.
///
/// Non-2xx statuses are not transport errors unless a caller asks for them
/// via [`crate::transport::ApiResponse::error_for_status`].
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session file {path} is not valid JSON: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Login was not accepted. The session is left as it was.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The backend answered but refused the credentials.
    #[error("{0}")]
    Rejected(String),

    #[error("login failed: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed login response: {0}")]
    MalformedResponse(String),
}

/// Token refresh failed. A rejected or missing refresh token also forces a
/// logout; `Interrupted` leaves whatever session is current in place.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("session expired, please log in again (no refresh token)")]
    MissingRefreshToken,

    #[error("session expired, please log in again ({0})")]
    Rejected(String),

    #[error("session expired, please log in again ({0})")]
    Transport(#[from] TransportError),

    #[error("session expired, please log in again (refresh was interrupted)")]
    Interrupted,
}

/// Protected-route guard failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("not logged in")]
    NotAuthenticated,

    #[error("this action requires the {required} role, session has {actual}")]
    Forbidden { required: Role, actual: Role },
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Still unauthorized after the single retry with a refreshed token.
    #[error("request unauthorized after token refresh")]
    Unauthorized,

    /// The backend envelope reported `success: false`.
    #[error("{0}")]
    Api(String),
}
