// SPDX-License-Identifier: MPL-2.0

//! Error codes of the inter-world memory subsystem.
//!
//! The kinds carry Linux errno values so that the device-node and client-API
//! layers can translate them into their own error domains.

use crate::hyp::HypError;

/// The kind of an [`Error`].
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// An allocation failed at some layer. Always recoverable.
    ResourceExhaustion = 12, /* ENOMEM */
    /// A zero or oversized region, an out-of-range mapping request, an unknown id.
    InvalidArgument = 22, /* EINVAL */
    /// The trusted peer or the hypervisor answered with a non-success status.
    ProtocolFailure = 71, /* EPROTO */
    /// The ownership of the memory involved is indeterminate.
    ///
    /// No subsequent step may free or reuse that memory.
    Irrecoverable = 99, /* EADDRNOTAVAIL */
    /// A bounded handshake with the peer was not acknowledged in time.
    Timeout = 110, /* ETIMEDOUT */
}

/// error used in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(kind: ErrorKind) -> Self {
        Error { kind, msg: None }
    }

    pub const fn with_message(kind: ErrorKind, msg: &'static str) -> Self {
        Error {
            kind,
            msg: Some(msg),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }

    /// Returns the negated errno, as handed back to the outer layers.
    pub const fn errno(&self) -> i32 {
        -(self.kind as i32)
    }

    /// Returns whether the memory involved must never be freed or reused.
    pub const fn is_irrecoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::Irrecoverable)
    }

    /// Returns whether the peer may still have access to the memory involved.
    ///
    /// This holds for irrecoverable errors and for handshakes that were
    /// never acknowledged.
    pub const fn leaves_memory_shared(&self) -> bool {
        matches!(self.kind, ErrorKind::Irrecoverable | ErrorKind::Timeout)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl From<HypError> for Error {
    fn from(hyp_error: HypError) -> Self {
        match hyp_error {
            HypError::Unavailable => {
                Error::with_message(ErrorKind::Irrecoverable, "the hypervisor revoked the memory")
            }
            HypError::NoMemory => Error::new(ErrorKind::ResourceExhaustion),
            HypError::InvalidArgs => Error::new(ErrorKind::InvalidArgument),
            HypError::Failed(_) => {
                Error::with_message(ErrorKind::ProtocolFailure, "the hypervisor call failed")
            }
        }
    }
}

impl From<int_to_c_enum::TryFromIntError> for Error {
    fn from(_: int_to_c_enum::TryFromIntError) -> Self {
        Error::with_message(ErrorKind::InvalidArgument, "Invalid enum value")
    }
}

#[macro_export]
macro_rules! return_errno {
    ($kind: expr) => {
        return Err($crate::error::Error::new($kind))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($kind: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($kind, $message))
    };
}
