// SPDX-License-Identifier: MPL-2.0

//! Error numbers and the error type of the multiprocessor services.

use core::fmt;

/// Error number.
///
/// Validation errors are reported before any processor is touched.
/// [`Errno::NotReady`] and [`Errno::Timeout`] are recoverable: every
/// processor stays usable for later calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Errno {
    /// Malformed caller input, or a handle playing the wrong role.
    InvalidArgument,
    /// The handle is out of range or unknown.
    NotFound,
    /// A BSP-only operation was invoked from an AP.
    WrongCaller,
    /// The target processor is busy.
    NotReady,
    /// There is no eligible processor to run on.
    NotStarted,
    /// The deadline elapsed with work outstanding.
    Timeout,
    /// The operation cannot complete synchronously.
    Unsupported,
    /// An unrecoverable boot-time setup failure.
    Fatal,
}

const EFI_ERROR_BIT: usize = 1 << (usize::BITS - 1);

impl Errno {
    /// Returns the firmware status code a C caller of the function table
    /// observes for this error.
    pub const fn as_efi_status(self) -> usize {
        let code = match self {
            Errno::InvalidArgument => 2,
            Errno::Unsupported => 3,
            Errno::NotReady => 6,
            // EFI_DEVICE_ERROR
            Errno::WrongCaller => 7,
            // EFI_OUT_OF_RESOURCES
            Errno::Fatal => 9,
            Errno::NotFound => 14,
            Errno::Timeout => 18,
            Errno::NotStarted => 19,
        };
        EFI_ERROR_BIT | code
    }
}

/// The error type which is returned from the APIs of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates an error without a message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates an error with a static message.
    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error number.
    pub const fn error(&self) -> Errno {
        self.errno
    }

    /// Returns the message attached to the error, if any.
    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

/// Returns early with an [`Error`] built from an [`Errno`].
#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::error::Error::new($errno).into())
    };
}

/// Returns early with an [`Error`] built from an [`Errno`] and a message.
#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($errno, $message).into())
    };
}
