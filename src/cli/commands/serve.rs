use crate::config::Settings;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct ServeCommand {
    /// Listen address in host:port format
    #[arg(long, value_name = "HOST:PORT")]
    pub address: Option<String>,

    /// Server certificate (PEM)
    #[arg(long, value_name = "FILE")]
    pub tls_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, value_name = "FILE")]
    pub tls_key: Option<PathBuf>,

    /// CA bundle for client certificates that may carry method powers
    #[arg(long, value_name = "FILE")]
    pub tls_ca: Option<PathBuf>,

    /// CA bundle trusted for client identity only
    #[arg(long, value_name = "FILE")]
    pub tls_identity_ca: Option<PathBuf>,

    /// Refuse the plaintext SRPC endpoints
    #[arg(long)]
    pub tls_required: bool,

    /// Unix socket path for same-host upgrades; empty disables them
    #[arg(long, value_name = "PATH")]
    pub unix_socket: Option<String>,

    /// Grant every method to the owners of this VM (small-stack hosts only)
    #[arg(long)]
    pub trust_vm_owners: bool,
}

impl ServeCommand {
    /// Apply command-line overrides.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(address) = &self.address {
            settings.server.address = address.clone();
        }
        if let Some(cert) = &self.tls_cert {
            settings.tls.cert = Some(cert.clone());
        }
        if let Some(key) = &self.tls_key {
            settings.tls.key = Some(key.clone());
        }
        if let Some(ca) = &self.tls_ca {
            settings.tls.ca = Some(ca.clone());
        }
        if let Some(ca) = &self.tls_identity_ca {
            settings.tls.identity_ca = Some(ca.clone());
        }
        if self.tls_required {
            settings.server.tls_required = true;
        }
        if let Some(path) = &self.unix_socket {
            settings.local.socket_path = Some(path.clone());
        }
        if self.trust_vm_owners {
            settings.owners.trust_vm_owners = true;
        }
    }
}
