use std::fmt;
use std::io;

/// Errors returned by the reactor framework.
#[derive(Debug)]
pub enum Error {
    /// Underlying I/O operation failed.
    Io(io::Error),
    /// Address string could not be parsed as `A.B.C.D:P`.
    InvalidAddress(String),
    /// Host name resolution failed or yielded no IPv4 address.
    Resolve(String),
    /// A worker thread failed to bring up its event loop.
    WorkerStartup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(s) => write!(f, "invalid address: {s}"),
            Error::Resolve(msg) => write!(f, "resolve: {msg}"),
            Error::WorkerStartup(name) => write!(f, "worker startup failed: {name}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
