use thiserror::Error;

/// Error kinds shared by every layer and by the HTTP frontend.
///
/// Mirrors the five-way taxonomy the bridge's internals are built around:
/// a caller-supplied argument was malformed, a referenced entity does not
/// exist, an invariant was violated inside the bridge itself, the IM
/// back-end rejected an otherwise well-formed request, or the underlying
/// transport to either side failed.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("client failure: {0}")]
    ClientFailure(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl BridgeError {
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        Self::BadArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn client_failure(msg: impl Into<String>) -> Self {
        Self::ClientFailure(msg.into())
    }

    pub fn transport_failure(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    /// Stable error code used on the HTTP frontend, `CH.ENDL.PUMADUCT_<REASON>`.
    pub fn frontend_code(&self) -> &'static str {
        match self {
            BridgeError::BadArgument(_) => "CH.ENDL.PUMADUCT_BAD_REQUEST",
            BridgeError::NotFound(_) => "CH.ENDL.PUMADUCT_NOT_FOUND",
            BridgeError::ClientFailure(_) => "CH.ENDL.PUMADUCT_FORBIDDEN",
            BridgeError::Internal(_) | BridgeError::TransportFailure(_) => {
                "CH.ENDL.PUMADUCT_UNAUTHORIZED"
            }
        }
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        BridgeError::Internal(format!("sqlite: {e}"))
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::TransportFailure(format!("http: {e}"))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
