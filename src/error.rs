//! Error types for SRPC.
//!
//! Server-side call failures travel to the peer as a single text line. The
//! client rebuilds a typed [`Error`] from that line with
//! [`Error::from_remote_line`], so callers can tell denials, missing methods,
//! decode failures and application errors apart without string matching.

use std::result;
use thiserror::Error;

/// A specialized Result type for SRPC operations.
pub type Result<T> = result::Result<T, Error>;

/// Text sent for a denied call.
pub(crate) const ACCESS_DENIED_TEXT: &str = "access to method denied";

const UNKNOWN_SERVICE_PREFIX: &str = "unknown service: ";
const UNKNOWN_METHOD_INFIX: &str = ": unknown method: ";
const MALFORMED_PREFIX: &str = "malformed Service.Method: ";
const DECODE_PREFIX: &str = "decode error: ";

/// Errors that can occur during SRPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller is not authorized for the method.
    #[error("access to method denied")]
    AccessDenied,

    /// No service registered under this name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The service exists but has no such method.
    #[error("{service}: unknown method: {method}")]
    UnknownMethod { service: String, method: String },

    /// The call line was not of the form `Service.Method`.
    #[error("malformed Service.Method: {0}")]
    MalformedServiceMethod(String),

    /// A value could not be decoded with the bound coder.
    #[error("decode error: {0}")]
    Decode(String),

    /// A value could not be encoded with the bound coder.
    #[error("encode error: {0}")]
    Encode(String),

    /// An application error reported by the remote handler.
    #[error("{0}")]
    Remote(String),

    /// Returned by a handler after it has sent its final response to ask
    /// the server to close the connection cleanly.
    #[error("close client")]
    CloseClient,

    /// A handler panicked. The connection is torn down.
    #[error("handler fault: {0}")]
    HandlerFault(String),

    /// A service with this name is already registered.
    #[error("SRPC receiver already registered: {0}")]
    AlreadyRegistered(String),

    /// The server does not expose any SRPC endpoint usable by this client.
    #[error("no SRPC endpoint at {0}")]
    NoSrpcEndpoint(String),

    /// The HTTP CONNECT exchange failed.
    #[error("HTTP negotiation failed: {0}")]
    Http(String),

    /// The same-host Unix socket upgrade failed after the server committed
    /// to it.
    #[error("local upgrade failed: {0}")]
    LocalUpgrade(String),

    /// An operation did not finish in time.
    #[error("timed out {0}")]
    Timeout(&'static str),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key material could not be used.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Rebuild an error from the text line a server sent in place of an
    /// acknowledgement.
    pub fn from_remote_line(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == ACCESS_DENIED_TEXT {
            return Error::AccessDenied;
        }
        if let Some(service) = line.strip_prefix(UNKNOWN_SERVICE_PREFIX) {
            return Error::UnknownService(service.to_string());
        }
        if let Some(name) = line.strip_prefix(MALFORMED_PREFIX) {
            return Error::MalformedServiceMethod(name.to_string());
        }
        if let Some(reason) = line.strip_prefix(DECODE_PREFIX) {
            return Error::Decode(reason.to_string());
        }
        if let Some((service, method)) = line.split_once(UNKNOWN_METHOD_INFIX) {
            if !service.contains(' ') {
                return Error::UnknownMethod {
                    service: service.to_string(),
                    method: method.to_string(),
                };
            }
        }
        Error::Remote(line.to_string())
    }

    /// The caller lacked rights for the method.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Error::AccessDenied)
    }

    /// The service, method or endpoint does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::UnknownService(_)
                | Error::UnknownMethod { .. }
                | Error::MalformedServiceMethod(_)
                | Error::NoSrpcEndpoint(_)
        )
    }

    /// A value failed to decode, locally or on the server.
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode(_))
    }

    /// The remote handler reported an application error.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }

    /// Transport failures where the connection can no longer be trusted.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Tls(_)
                | Error::Http(_)
                | Error::Timeout(_)
                | Error::LocalUpgrade(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
