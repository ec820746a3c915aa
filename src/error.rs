use std::str::Utf8Error;

/// When things go awry.
#[derive(Debug)]
pub enum PvddError {
    IoError(std::io::Error),
    /// Something failed during daemon startup (bind, listen, config load).
    StartupError(String),
    ConfigError(String),
    Utf8Error(Utf8Error),
    /// A netlink/socket-option call against the kernel failed for a reason
    /// other than "kernel is not PvD-aware".
    KernelError(String),
    /// A malformed Router Advertisement was dropped.
    RaParseError(String),
    /// A client protocol violation severe enough to release the connection.
    ClientError(String),
    Generic(String),
}

impl std::fmt::Display for PvddError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PvddError::IoError(err) => write!(f, "IO error: {err}"),
            PvddError::StartupError(err) => write!(f, "startup error: {err}"),
            PvddError::ConfigError(err) => write!(f, "config error: {err}"),
            PvddError::Utf8Error(err) => write!(f, "invalid utf8: {err}"),
            PvddError::KernelError(err) => write!(f, "kernel interface error: {err}"),
            PvddError::RaParseError(err) => write!(f, "RA parse error: {err}"),
            PvddError::ClientError(err) => write!(f, "client protocol error: {err}"),
            PvddError::Generic(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PvddError {}

impl From<std::io::Error> for PvddError {
    fn from(error: std::io::Error) -> Self {
        PvddError::IoError(error)
    }
}

impl From<Utf8Error> for PvddError {
    fn from(error: Utf8Error) -> Self {
        PvddError::Utf8Error(error)
    }
}

impl From<config::ConfigError> for PvddError {
    fn from(error: config::ConfigError) -> Self {
        PvddError::ConfigError(error.to_string())
    }
}

impl From<PvddError> for std::io::Error {
    fn from(error: PvddError) -> Self {
        match error {
            PvddError::IoError(err) => err,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
