//! Errors reported by `MappingManager` operations.  Every error
//! carries an `ErrorKind` with a stable integer code (shared with the
//! C interface), a diagnostic message, and the originating `errno`
//! when the failure came from the operating system.
use std::os::raw::c_char;

/// The failure taxonomy.  The discriminants are the C error codes;
/// `0` is reserved for "no error".
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorKind {
    /// Unclassified failure.
    Unknown = 1,
    /// Failed to extend the file mapping inside the current reservation.
    FailedToRemap = 2,
    /// Failed to reserve address space, or to map the file into a
    /// fresh reservation.
    FailedToMmap = 3,
    FailedToStatFile = 4,
    FailedToOpenFile = 5,
    FailedToFtruncate = 6,
    FailedToUnmap = 7,
    FailedToCloseFile = 8,
    /// The request needs more address space, and the caller did not
    /// allow (or size) growth.  The manager is unchanged.
    FullyMapped = 9,
    /// The chunk size is not a positive multiple of the page size.
    PageSizeNonMultiple = 10,
    /// The caller broke an argument contract.
    InvalidArgument = 11,
    /// The manager was already deleted.
    NotAlive = 12,
}

impl ErrorKind {
    /// Returns the C error code for this kind.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Returns a static description of this kind, NUL-terminated for
    /// the C interface.
    fn description_with_nul(self) -> &'static str {
        match self {
            ErrorKind::Unknown => "unknown error\0",
            ErrorKind::FailedToRemap => "failed to extend mapping within reserved address space\0",
            ErrorKind::FailedToMmap => "failed to map address space\0",
            ErrorKind::FailedToStatFile => "failed to stat backing file\0",
            ErrorKind::FailedToOpenFile => "failed to open backing file\0",
            ErrorKind::FailedToFtruncate => "failed to resize backing file\0",
            ErrorKind::FailedToUnmap => "failed to unmap reserved address space\0",
            ErrorKind::FailedToCloseFile => "failed to close backing file\0",
            ErrorKind::FullyMapped => "reserved address space is fully mapped\0",
            ErrorKind::PageSizeNonMultiple => "chunk size is not a multiple of the page size\0",
            ErrorKind::InvalidArgument => "invalid argument\0",
            ErrorKind::NotAlive => "manager is not alive\0",
        }
    }

    /// Returns a static description of this kind.
    pub fn description(self) -> &'static str {
        let with_nul = self.description_with_nul();

        &with_nul[..with_nul.len() - 1]
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// An error from a `MappingManager` operation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({kind}){}", describe_errno(.errno))]
pub struct Error {
    kind: ErrorKind,
    message: String,
    errno: Option<i32>,
}

fn describe_errno(errno: &Option<i32>) -> String {
    match errno {
        Some(errno) => format!(": {}", std::io::Error::from_raw_os_error(*errno)),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates an error that did not originate in a system call.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
            errno: None,
        }
    }

    /// Creates an error for a system call that failed with `errno`.
    pub fn os(kind: ErrorKind, message: impl Into<String>, errno: i32) -> Error {
        Error {
            kind,
            message: message.into(),
            errno: Some(errno),
        }
    }

    /// Creates an error from a failed `std::io` call.
    pub fn io(kind: ErrorKind, message: impl Into<String>, err: &std::io::Error) -> Error {
        Error {
            kind,
            message: message.into(),
            errno: err.raw_os_error(),
        }
    }

    pub(crate) fn not_alive() -> Error {
        Error::new(ErrorKind::NotAlive, "the manager was deleted")
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the `errno` of the failed system call, if any.
    #[inline]
    pub fn raw_os_error(&self) -> Option<i32> {
        self.errno
    }
}

/// The extern "C" interface reports errors with this struct.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ForeignError {
    /// 0 on success, an `ErrorKind` code otherwise.
    pub error_code: i32,
    /// NULL on success, a static NUL-terminated string otherwise.
    pub error_message: *const c_char,
    /// The originating errno, or 0.
    pub saved_errno: i32,
}

impl ForeignError {
    pub fn none() -> ForeignError {
        ForeignError {
            error_code: 0,
            error_message: std::ptr::null(),
            saved_errno: 0,
        }
    }
}

impl From<&Error> for ForeignError {
    fn from(error: &Error) -> ForeignError {
        ForeignError {
            error_code: error.kind.code(),
            error_message: error.kind.description_with_nul().as_ptr() as *const c_char,
            saved_errno: error.errno.unwrap_or(0),
        }
    }
}

impl<T> From<&Result<T>> for ForeignError {
    fn from(result: &Result<T>) -> ForeignError {
        match result {
            Ok(_) => ForeignError::none(),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::Unknown.code(), 1);
        assert_eq!(ErrorKind::FailedToRemap.code(), 2);
        assert_eq!(ErrorKind::FullyMapped.code(), 9);
        assert_eq!(ErrorKind::PageSizeNonMultiple.code(), 10);
        assert_eq!(ErrorKind::NotAlive.code(), 12);
    }

    #[test]
    fn display_includes_os_error() {
        const ENOENT: i32 = 2;

        let error = Error::os(ErrorKind::FailedToOpenFile, "could not open /nonexistent", ENOENT);
        let rendered = error.to_string();

        assert!(rendered.starts_with("could not open /nonexistent (failed to open backing file): "));
        assert!(rendered.contains("os error 2"), "{}", rendered);
        assert_eq!(error.raw_os_error(), Some(ENOENT));

        let plain = Error::new(ErrorKind::FullyMapped, "no room");
        assert_eq!(plain.to_string(), "no room (reserved address space is fully mapped)");
    }

    #[test]
    fn foreign_error_has_static_message() {
        let error = Error::os(ErrorKind::FailedToUnmap, "munmap failed", 22);
        let foreign = ForeignError::from(&error);

        assert_eq!(foreign.error_code, 7);
        assert_eq!(foreign.saved_errno, 22);

        let message = unsafe { std::ffi::CStr::from_ptr(foreign.error_message) };
        assert_eq!(
            message.to_str().expect("must be utf-8"),
            "failed to unmap reserved address space"
        );

        let ok: Result<()> = Ok(());
        let foreign_ok = ForeignError::from(&ok);
        assert_eq!(foreign_ok.error_code, 0);
        assert!(foreign_ok.error_message.is_null());
    }
}
