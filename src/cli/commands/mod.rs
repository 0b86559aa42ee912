pub mod client;
pub mod serve;

pub use client::{CallCommand, MethodsCommand, TargetArgs};
pub use serve::ServeCommand;

use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum Commands {
    /// Run an SRPC server exposing the Echo demonstration service
    Serve(ServeCommand),
    /// Check that a server answers calls
    Ping(TargetArgs),
    /// List the methods a server exposes
    Methods(MethodsCommand),
    /// Print a server's fully qualified host name
    Hostname(TargetArgs),
    /// Make a request/reply call with a JSON request
    Call(CallCommand),
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SRPC_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Full tracing filter directive, e.g. "srpc=debug,reqwest=warn"
    #[arg(long, global = true, env = "SRPC_LOG_FILTER")]
    pub log_filter: Option<String>,
}
