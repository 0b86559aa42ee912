//! Configuration management for SRPC servers and clients.
//!
//! Settings are layered from:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/srpc/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `SRPC_`, `__` between levels)
//! 5. Command-line arguments
//!
//! Later sources override earlier ones.
//!
//! # Environment Variables
//!
//! - `SRPC_SERVER__ADDRESS` - Listen address
//! - `SRPC_SERVER__TLS_REQUIRED` - Refuse plaintext SRPC endpoints
//! - `SRPC_TLS__CERT`, `SRPC_TLS__KEY`, `SRPC_TLS__CA` - Server TLS material
//! - `SRPC_CLIENT__CERT_DIR` - Directory of client `*.cert`/`*.key` pairs
//! - `SRPC_IDENTITY__METADATA_FALLBACK` - Fetch the instance certificate from
//!   the metadata service when no local certificate is found
//! - `SRPC_UNIX_SOCKET_PATH` - Local upgrade socket (read directly, not
//!   through this module, when `local.socket_path` is unset)

use crate::auth::{MetadataService, OwnerAllowlist};
use crate::client::DialOptions;
use crate::coder::Coder;
use crate::error::Result;
use crate::local::LocalUpgrader;
use crate::server::ServerOptions;
use crate::tls::{self, ClientTlsSource, ServerTls, ServerTlsSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// System-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/srpc/config.toml";

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub local: LocalTransportSettings,
    #[serde(default)]
    pub identity: IdentitySettings,
    #[serde(default)]
    pub owners: OwnerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener and connection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_address")]
    pub address: String,
    /// Refuse plaintext SRPC endpoints
    #[serde(default)]
    pub tls_required: bool,
    /// Terminate TLS on accept instead of after CONNECT
    #[serde(default)]
    pub tls_at_listener: bool,
    /// Give plaintext callers every method power
    #[serde(default)]
    pub plaintext_method_powers: bool,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            tls_required: false,
            tls_at_listener: false,
            plaintext_method_powers: false,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl ServerSettings {
    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            tls_required: self.tls_required,
            tls_at_listener: self.tls_at_listener,
            plaintext_method_powers: self.plaintext_method_powers,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }
}

/// Server certificate material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// CAs whose client certificates may carry method powers
    pub ca: Option<PathBuf>,
    /// CAs trusted for identity only
    pub identity_ca: Option<PathBuf>,
    /// Accept TLS clients that present no certificate
    #[serde(default)]
    pub client_auth_optional: bool,
}

impl TlsSettings {
    /// `None` unless a CA is configured. Without `cert` and `key` files the
    /// instance certificate from the metadata service is used, if allowed.
    pub async fn server_tls(&self, identity: &IdentitySettings) -> Result<Option<ServerTls>> {
        let Some(ca) = &self.ca else {
            return Ok(None);
        };
        let source = ServerTlsSource {
            cert: self.cert.clone(),
            key: self.key.clone(),
            ca: ca.clone(),
            identity_ca: self.identity_ca.clone(),
            client_auth_optional: self.client_auth_optional,
            metadata: identity.metadata()?,
        };
        let server_tls = source.load(false).await?;
        if identity.reload {
            server_tls.spawn_reloader(source);
        }
        Ok(Some(server_tls))
    }
}

/// Dialing defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub local_upgrade: bool,
    #[serde(default)]
    pub disable_method_powers: bool,
    /// Insist on one coder instead of trying binary then JSON
    pub coder: Option<Coder>,
    #[serde(default)]
    pub use_tls: bool,
    /// Directory of `NAME.cert`/`NAME.key` pairs to present
    pub cert_dir: Option<PathBuf>,
    /// CA bundle for verifying servers; unverified when unset
    pub server_ca: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_client_timeout(),
            local_upgrade: true,
            disable_method_powers: false,
            coder: None,
            use_tls: false,
            cert_dir: None,
            server_ca: None,
        }
    }
}

impl ClientSettings {
    pub async fn dial_options(&self, identity: &IdentitySettings) -> Result<DialOptions> {
        let mut options = DialOptions {
            coder: self.coder,
            timeout: Duration::from_secs(self.timeout_secs),
            local_upgrade: self.local_upgrade,
            disable_method_powers: self.disable_method_powers,
            ..DialOptions::default()
        };
        if self.use_tls || self.cert_dir.is_some() {
            let source = ClientTlsSource {
                cert_dir: self.cert_dir.clone(),
                roots: self.server_ca.as_deref().map(tls::load_ca_file).transpose()?,
                metadata: identity.metadata()?,
            };
            let client_tls = source.load(false).await?;
            if identity.reload {
                client_tls.spawn_reloader(source);
            }
            options.tls = Some(client_tls);
        }
        Ok(options)
    }
}

/// Where certificates come from when not found on disk, and whether they
/// are reloaded before they expire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySettings {
    #[serde(default = "default_true")]
    pub metadata_fallback: bool,
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    #[serde(default = "default_identity_timeout")]
    pub metadata_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub reload: bool,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            metadata_fallback: true,
            metadata_url: default_metadata_url(),
            metadata_timeout_ms: default_identity_timeout(),
            reload: true,
        }
    }
}

impl IdentitySettings {
    pub fn metadata(&self) -> Result<Option<Arc<MetadataService>>> {
        if !self.metadata_fallback {
            return Ok(None);
        }
        let service = MetadataService::new(
            self.metadata_url.clone(),
            Duration::from_millis(self.metadata_timeout_ms),
        )?;
        Ok(Some(Arc::new(service)))
    }
}

/// Same-host Unix socket upgrade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalTransportSettings {
    /// Socket path; empty disables the upgrade, unset falls back to
    /// `SRPC_UNIX_SOCKET_PATH` and then the per-process default
    pub socket_path: Option<String>,
}

impl LocalTransportSettings {
    pub fn upgrader(&self) -> Option<Arc<LocalUpgrader>> {
        match &self.socket_path {
            Some(path) => LocalUpgrader::new(path.clone()),
            None => LocalUpgrader::from_env(),
        }
        .map(Arc::new)
    }
}

/// Small-stack VM owner trust. Off unless switched on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerSettings {
    #[serde(default)]
    pub trust_vm_owners: bool,
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    #[serde(default = "default_owner_refresh")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_owner_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for OwnerSettings {
    fn default() -> Self {
        Self {
            trust_vm_owners: false,
            metadata_url: default_metadata_url(),
            refresh_interval_secs: default_owner_refresh(),
            request_timeout_secs: default_owner_request_timeout(),
        }
    }
}

impl OwnerSettings {
    /// Start the refresher when owner trust is enabled.
    pub fn start(&self) -> Result<Option<OwnerAllowlist>> {
        if !self.trust_vm_owners {
            return Ok(None);
        }
        let source = MetadataService::new(
            self.metadata_url.clone(),
            Duration::from_secs(self.request_timeout_secs),
        )?;
        let allowlist = OwnerAllowlist::new();
        allowlist.spawn_refresher(
            Arc::new(source),
            Duration::from_secs(self.refresh_interval_secs.max(1)),
        );
        info!(metadata_url = %self.metadata_url, "VM owner trust enabled");
        Ok(Some(allowlist))
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Full `EnvFilter` directive string, overriding `level`
    pub filter: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name(SYSTEM_CONFIG_PATH).required(false));

        // Load user config if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("SRPC")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parse a TOML document on top of the embedded defaults.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

fn default_address() -> String {
    "0.0.0.0:6910".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_client_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_metadata_url() -> String {
    "http://169.254.169.254".to_string()
}

fn default_identity_timeout() -> u64 {
    tls::METADATA_CERT_TIMEOUT.as_millis() as u64
}

fn default_owner_refresh() -> u64 {
    10
}

fn default_owner_request_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
