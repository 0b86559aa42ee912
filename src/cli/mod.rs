//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running a demonstration server
//! - Probing servers (ping, method listing, host name)
//! - Making one-off JSON calls

pub mod commands;
pub mod handlers;

pub use handlers::{handle_call, handle_hostname, handle_methods, handle_ping, handle_serve};
