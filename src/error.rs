// src/error.rs

use std::io;

use log::debug;
use thiserror::Error;

/// Crate-wide error type.
///
/// Variants follow the failure classes of the engine: privilege and driver
/// problems surface at start, packet errors never leave a capture loop, and
/// upstream/certificate errors are turned into gateway responses by the proxy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    #[error("Capture driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Malformed packet: {0}")]
    Packet(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Report error: {0}")]
    Report(String),
}

impl Error {
    pub fn certificate<S: Into<String>>(msg: S) -> Self {
        let msg = msg.into();
        debug!("Certificate error: {}", msg);
        Error::Certificate(msg)
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        let msg = msg.into();
        debug!("TLS error: {}", msg);
        Error::Tls(msg)
    }

    pub fn http<S: Into<String>>(msg: S) -> Self {
        Error::Http(msg.into())
    }

    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        let msg = msg.into();
        debug!("Upstream error: {}", msg);
        Error::Upstream(msg)
    }

    pub fn state<S: Into<String>>(msg: S) -> Self {
        Error::State(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Whether the error came from the far side of a proxied connection.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Error::Upstream(_) | Error::Timeout(_))
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::certificate(err.to_string())
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Error::tls(err.to_string())
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Error::http(err.to_string())
    }
}

impl From<handlebars::RenderError> for Error {
    fn from(err: handlebars::RenderError) -> Self {
        Error::Report(err.to_string())
    }
}

impl From<handlebars::TemplateError> for Error {
    fn from(err: handlebars::TemplateError) -> Self {
        Error::Report(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Privilege("root required".to_string());
        assert_eq!(err.to_string(), "Insufficient privileges: root required");
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_is_upstream() {
        assert!(Error::upstream("refused").is_upstream());
        assert!(Error::Timeout("connect".into()).is_upstream());
        assert!(!Error::http("bad head").is_upstream());
    }
}
