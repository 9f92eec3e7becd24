//! Protocol errors shared by every provider call

use pia_network::HttpError;

/// Value of the `status` field on a successful provider response
pub const STATUS_OK: &str = "OK";

/// Failure of a single provider call
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(#[from] HttpError),

    #[error("Could not decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("{operation} rejected by provider: status=\"{status}\" message=\"{message}\"")]
    Rejected {
        operation: &'static str,
        status: String,
        message: String,
    },
}

impl ProtocolError {
    pub(crate) fn decode(what: &'static str, reason: impl ToString) -> Self {
        Self::Decode {
            what,
            reason: reason.to_string(),
        }
    }

    /// Provider-supplied message, if the provider rejected the call
    pub fn provider_message(&self) -> Option<&str> {
        match self {
            Self::Rejected { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Fail with [`ProtocolError::Rejected`] unless `status` is [`STATUS_OK`]
pub(crate) fn ensure_ok(
    operation: &'static str,
    status: &str,
    message: Option<&str>,
) -> Result<(), ProtocolError> {
    if status == STATUS_OK {
        return Ok(());
    }
    Err(ProtocolError::Rejected {
        operation,
        status: status.to_string(),
        message: message.unwrap_or_default().to_string(),
    })
}
