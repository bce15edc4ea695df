use std::error::Error as _;

use reqwest::StatusCode;
use url::Url;

use crate::journal::JournalError;
use crate::queue::QueueError;
use crate::subscription::TrackingError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unable to resolve host {host}")]
    NameResolutionFailed { host: String },
    #[error("connection refused by {host}:{port}")]
    ConnectionRefused { host: String, port: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("resource not found")]
    ResourceNotFound,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("message not acknowledged by the receiver")]
    MessageNotAcknowledged,
    #[error("endpoint {0} not found")]
    EndpointNotFound(String),
    #[error("message has no destination")]
    MissingDestination,
    #[error("local delivery failed: {0}")]
    LocalDelivery(String),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl TransportError {
    /// Whether repeating the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::NameResolutionFailed { .. }
                | TransportError::ConnectionRefused { .. }
                | TransportError::Transport(_)
                | TransportError::Unauthorized
                | TransportError::ResourceNotFound
                | TransportError::LocalDelivery(_)
        )
    }

    /// Classifies a failure to obtain any response at all.
    pub fn from_reqwest(error: reqwest::Error, uri: &Url) -> Self {
        let host = uri.host_str().unwrap_or_default().to_string();
        if error.is_builder() {
            return TransportError::InvalidRequest(error.to_string());
        }
        if error.is_connect() {
            if caused_by_name_resolution(&error) {
                return TransportError::NameResolutionFailed { host };
            }
            let port = uri.port_or_known_default().unwrap_or_default();
            return TransportError::ConnectionRefused { host, port };
        }
        TransportError::Transport(error.to_string())
    }
}

/// Maps a response status onto the transport taxonomy. `Ok(())` for 2xx.
pub fn classify_status(status: StatusCode) -> Result<(), TransportError> {
    match status.as_u16() {
        200..=299 => Ok(()),
        401 => Err(TransportError::Unauthorized),
        404 => Err(TransportError::ResourceNotFound),
        422 => Err(TransportError::MessageNotAcknowledged),
        400..=499 => Err(TransportError::InvalidRequest(format!("status {status}"))),
        _ => Err(TransportError::Transport(format!("status {status}"))),
    }
}

fn caused_by_name_resolution(error: &reqwest::Error) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns") || text.contains("resolve") || text.contains("lookup") {
            return true;
        }
        source = cause.source();
    }
    false
}
