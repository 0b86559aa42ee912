//! Secure RPC over HTTP CONNECT.
//!
//! Clients open a connection with an HTTP `CONNECT` to one of the SRPC
//! endpoints, optionally upgrade it to TLS, and then make calls by writing
//! `Service.Method` lines. Caller identity and pre-granted method patterns
//! come from the client certificate. Same-host connections can move onto a
//! Unix socket after dialing.

pub mod auth;
pub mod cli;
pub mod client;
pub mod coder;
pub mod config;
pub mod conn;
pub mod echo;
pub mod error;
pub mod local;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod stream;
pub mod tls;

// Re-export commonly used types
pub use auth::{AuthInformation, PermittedMethods};
pub use client::{CallHandle, Client, ClientResource, DialOptions, RetryClient};
pub use coder::Coder;
pub use conn::Conn;
pub use error::{Error, Result};
pub use registry::{AccessControl, MethodKind, Registry, Service};
pub use server::{Server, ServerOptions};
pub use tls::{ClientTls, ClientTlsSource, ServerTls, ServerTlsSource};
