//! Link failure taxonomy
//!
//! Every failure here degrades one serial link to "disconnected" and is
//! non-fatal to the process. Open failures split into two user-facing
//! categories (denied vs busy); everything mid-stream collapses into
//! `Lost`/`WriteFailed`, which are handled identically by the manager.
//! A line that matches no grammar rule is not an error at all and never
//! appears here.

use thiserror::Error;

/// Classified link failure.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The platform refused serial access (permissions).
    #[error("serial access denied: {0}")]
    Denied(String),

    /// The port is claimed elsewhere or failed to open.
    #[error("serial port busy or unreachable: {0}")]
    Busy(String),

    /// Mid-stream I/O failure or physical unplug.
    #[error("connection lost: {0}")]
    Lost(String),

    /// Outbound write failed; treated the same as `Lost` by the manager.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Outcome of an open attempt before a read loop exists.
///
/// `Denied` and `Busy` are reported to the user with a short classified
/// message. `Cancelled` (the user dismissed a device picker, where the
/// transport has one) and `Other` degrade silently with diagnostic logging
/// only.
#[derive(Debug)]
pub enum OpenFailure {
    Denied(String),
    Busy(String),
    Cancelled,
    Other(String),
}

/// Map a serial open error into the user-facing categories.
///
/// Permission refusals become `Denied`; a missing or already-claimed device
/// and every other open-time I/O error become `Busy`, matching the two alert
/// classes the dashboard shows.
pub fn classify_open_error(err: &tokio_serial::Error) -> OpenFailure {
    use tokio_serial::ErrorKind;

    match &err.kind {
        ErrorKind::Io(io_kind) if *io_kind == std::io::ErrorKind::PermissionDenied => {
            OpenFailure::Denied(err.description.clone())
        }
        // Port claimed elsewhere, missing device, or any other open-time
        // failure: the dashboard shows the same "busy" guidance for all.
        _ => OpenFailure::Busy(err.description.clone()),
    }
}

impl From<OpenFailure> for Option<LinkError> {
    /// Only the two classified categories surface to the user.
    fn from(failure: OpenFailure) -> Self {
        match failure {
            OpenFailure::Denied(msg) => Some(LinkError::Denied(msg)),
            OpenFailure::Busy(msg) => Some(LinkError::Busy(msg)),
            OpenFailure::Cancelled | OpenFailure::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classifies_as_denied() {
        let err = tokio_serial::Error::new(
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "no access to /dev/ttyUSB0",
        );
        assert!(matches!(classify_open_error(&err), OpenFailure::Denied(_)));
    }

    #[test]
    fn test_missing_device_classifies_as_busy() {
        let err = tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "device gone");
        assert!(matches!(classify_open_error(&err), OpenFailure::Busy(_)));
    }

    #[test]
    fn test_cancelled_surfaces_no_user_error() {
        let surfaced: Option<LinkError> = OpenFailure::Cancelled.into();
        assert!(surfaced.is_none());
    }
}
