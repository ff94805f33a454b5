// SPDX-License-Identifier: MPL-2.0

//! Types describing a dispatch request and its outcome.

use core::{fmt, time::Duration};

use crate::{cpu::CpuSet, error::Error};

/// A procedure dispatched to a processor.
///
/// It runs on the target processor with the argument of the dispatch call.
pub type ApProcedure = fn(ProcedureArgument);

/// The opaque argument handed to an [`ApProcedure`].
///
/// The argument is shared by every processor of a dispatch. The crate never
/// dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcedureArgument(*mut ());

// SAFETY: The pointer is only carried across processors, never dereferenced by
// this crate. Whoever dereferences it must uphold the aliasing rules of the
// pointee, which `from_ref` restricts to `Sync` types.
unsafe impl Send for ProcedureArgument {}
// SAFETY: See above.
unsafe impl Sync for ProcedureArgument {}

impl ProcedureArgument {
    /// An argument that points to nothing.
    pub const fn null() -> Self {
        Self(core::ptr::null_mut())
    }

    /// Creates an argument pointing to a value shared by all processors.
    pub fn from_ref<T: Sync>(value: &T) -> Self {
        Self(value as *const T as *mut ())
    }

    /// Creates an argument from a raw pointer.
    pub const fn from_ptr(ptr: *mut ()) -> Self {
        Self(ptr)
    }

    /// Returns the raw pointer.
    pub const fn as_ptr(self) -> *mut () {
        self.0
    }

    /// Returns `true` if the argument points to nothing.
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Reborrows the argument as a reference.
    ///
    /// # Safety
    ///
    /// The argument must have been created by [`ProcedureArgument::from_ref`]
    /// with a `T`, and the value must outlive `'a`.
    pub unsafe fn as_ref<'a, T: Sync>(self) -> Option<&'a T> {
        // SAFETY: The caller guarantees the pointee type and its lifetime.
        unsafe { (self.0 as *const T).as_ref() }
    }
}

impl Default for ProcedureArgument {
    fn default() -> Self {
        Self::null()
    }
}

/// The maximum time a blocking dispatch waits for its processors.
///
/// A timeout of zero means waiting forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timeout(u64);

impl Timeout {
    /// Waits forever.
    pub const INFINITE: Timeout = Timeout(0);

    /// Creates a timeout from microseconds. Zero means infinite.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Creates a timeout from a duration, saturating at `u64::MAX`
    /// microseconds. A zero duration means infinite.
    pub fn from_duration(duration: Duration) -> Self {
        Self(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
    }

    /// Returns the timeout in microseconds.
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Returns `true` if the timeout never elapses.
    pub const fn is_infinite(self) -> bool {
        self.0 == 0
    }

    /// Returns the timeout as a duration, or `None` if it is infinite.
    pub const fn as_duration(self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::from_micros(self.0))
        }
    }
}

/// How a dispatch to a single processor waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Waits for the procedure to complete, at most for the timeout.
    Blocking(Timeout),
    /// Submits the procedure and returns immediately.
    NonBlocking,
}

/// The failure of a dispatch to several processors.
///
/// Besides the error it carries the processors that did not complete the
/// procedure, which is non-empty only for [`crate::Errno::Timeout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    error: Error,
    failed_cpus: CpuSet,
}

impl DispatchError {
    /// Creates a dispatch error.
    pub fn new(error: Error, failed_cpus: CpuSet) -> Self {
        Self { error, failed_cpus }
    }

    /// Returns the error.
    pub fn error(&self) -> Error {
        self.error
    }

    /// Returns the processors that did not complete the procedure.
    pub fn failed_cpus(&self) -> &CpuSet {
        &self.failed_cpus
    }
}

impl From<Error> for DispatchError {
    fn from(error: Error) -> Self {
        Self {
            error,
            failed_cpus: CpuSet::new_empty(),
        }
    }
}

impl From<crate::error::Errno> for DispatchError {
    fn from(errno: crate::error::Errno) -> Self {
        Error::new(errno).into()
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.failed_cpus.is_empty() {
            write!(f, " (failed:")?;
            for cpu in self.failed_cpus.iter() {
                write!(f, " {}", cpu)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// The result of a dispatch to several processors.
pub type DispatchResult = core::result::Result<(), DispatchError>;
