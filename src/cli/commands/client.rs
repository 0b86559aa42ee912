use crate::coder::Coder;
use crate::config::ClientSettings;
use clap::Args;
use std::path::PathBuf;

/// Where and how to connect.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Server address in host:port format
    #[arg(value_name = "HOST:PORT")]
    pub address: String,

    /// Dial the TLS endpoints
    #[arg(long)]
    pub tls: bool,

    /// Directory of NAME.cert/NAME.key client certificates (implies --tls)
    #[arg(long, value_name = "DIR", env = "SRPC_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    /// CA bundle for verifying the server; unverified when omitted
    #[arg(long, value_name = "FILE")]
    pub server_ca: Option<PathBuf>,

    /// Use the JSON coder instead of binary
    #[arg(long)]
    pub json: bool,

    /// Stay on TCP even when the server is on this host
    #[arg(long)]
    pub no_local_upgrade: bool,

    /// Ask the server to ignore the permitted methods in the certificate
    #[arg(long)]
    pub no_method_powers: bool,

    /// Dial timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl TargetArgs {
    /// Apply command-line overrides.
    pub fn apply(&self, settings: &mut ClientSettings) {
        if self.tls {
            settings.use_tls = true;
        }
        if let Some(dir) = &self.cert_dir {
            settings.cert_dir = Some(dir.clone());
        }
        if let Some(ca) = &self.server_ca {
            settings.server_ca = Some(ca.clone());
        }
        if self.json {
            settings.coder = Some(Coder::Json);
        }
        if self.no_local_upgrade {
            settings.local_upgrade = false;
        }
        if self.no_method_powers {
            settings.disable_method_powers = true;
        }
        if let Some(timeout) = self.timeout {
            settings.timeout_secs = timeout;
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct MethodsCommand {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Only list public methods
    #[arg(long)]
    pub public: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CallCommand {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Method to call, as Service.Method
    #[arg(value_name = "SERVICE.METHOD")]
    pub method: String,

    /// Request as a JSON document
    #[arg(value_name = "JSON", default_value = "{}")]
    pub request: String,
}
