//! Stable error codes shared by every subsystem of the engine core.
//!
//! The numeric values are part of the public contract and must not be
//! reordered.

use std::fmt::{Display, Formatter};

use ash::vk;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Error {
    InternalError = 1,
    AlreadyExistsError = 2,
    InvalidArgumentError = 3,
    NotFoundError = 4,
    UnavailableError = 5,
    UnimplementedError = 6,
    AbortedError = 7,
    FailedPreconditionError = 8,
    FeatureNotSupported = 9,
    SchemaError = 10,
}

impl Error {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::InternalError => "Internal Error",
            Error::AlreadyExistsError => "Already Exists Error",
            Error::InvalidArgumentError => "Invalid Argument Error",
            Error::NotFoundError => "Not Found Error",
            Error::UnavailableError => "Unavailable Error",
            Error::UnimplementedError => "Unimplemented Error",
            Error::AbortedError => "Aborted Error",
            Error::FailedPreconditionError => "Failed Precondition Error",
            Error::FeatureNotSupported => "Feature Not Supported",
            Error::SchemaError => "Schema Error",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Error {
}

impl From<vk::Result> for Error {
    fn from(_: vk::Result) -> Self {
        Error::InternalError
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFoundError
        } else {
            Error::InternalError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(Error::from(missing), Error::NotFoundError);

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(Error::from(denied), Error::InternalError);
    }

    #[test]
    fn stable_codes() {
        assert_eq!(Error::InternalError as u8, 1);
        assert_eq!(Error::SchemaError as u8, 10);
    }
}
