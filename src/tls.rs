//! TLS material for servers and clients.
//!
//! Servers require client certificates issued by a configured CA bundle. An
//! optional second bundle is trusted for identity only: certificates from it
//! authenticate a username and groups, but their permitted-method extension
//! is ignored.
//!
//! Clients present their best certificate and, unless given a CA bundle, do
//! not verify the server (fleet servers use self-signed certificates).
//!
//! Both sides can fall back to the identity certificate published by the
//! metadata service, and can reload their material in the background as the
//! certificate nears expiry (see [`refresh_delay`]).

use crate::auth::owners::{IDENTITY_CERT_PATH, IDENTITY_KEY_PATH};
use crate::auth::{Authenticator, CertIdentity, MetadataService};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::cmp::Reverse;
use std::fs::File;
use std::future::Future;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// How long to wait for the metadata service when fetching the identity
/// certificate.
pub const METADATA_CERT_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Certificate(format!("{}: {}", path.display(), e)))?;
    parse_certs(&mut BufReader::new(file), &path.display().to_string())
}

fn parse_certs(reader: &mut dyn BufRead, name: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!("no certificates found in {name}")));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Certificate(format!("{}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| Error::Certificate(format!("no private key found in {}", path.display())))
}

/// Load a CA bundle into a root store.
pub fn load_ca_file(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Validity window of a certificate, as Unix timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: i64,
    pub not_after: i64,
}

impl Validity {
    pub fn of(identity: &CertIdentity) -> Self {
        Self {
            not_before: identity.not_before,
            not_after: identity.not_after,
        }
    }

    fn of_chain(chain: &[CertificateDer<'_>]) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate("empty certificate chain".into()))?;
        Ok(Self::of(&CertIdentity::parse(leaf.as_ref())?))
    }

    /// Fail unless `now` falls inside the window. `name` labels the error.
    pub fn check(&self, name: &str, now: i64) -> Result<()> {
        if self.not_before > now {
            return Err(Error::Certificate(format!(
                "{} will not be valid for {}",
                name,
                format_seconds(self.not_before - now)
            )));
        }
        if self.not_after < now {
            return Err(Error::Certificate(format!(
                "{} expired {} ago",
                name,
                format_seconds(now - self.not_after)
            )));
        }
        Ok(())
    }
}

/// How long to wait before reloading a certificate valid for `validity`.
///
/// The first reload is due 7/8 of the way through the lifetime. Once that
/// point has passed, retries come more often the closer expiry is: weekly,
/// daily, hourly, each minute and finally every five seconds.
pub fn refresh_delay(validity: Validity, now: i64) -> Duration {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;
    const WEEK: i64 = 7 * DAY;

    let lifetime = validity.not_after - validity.not_before;
    let refresh_at = validity.not_before + lifetime * 7 / 8;
    if refresh_at > now {
        return Duration::from_secs((refresh_at - now) as u64);
    }
    let expires_in = validity.not_after - now;
    let seconds = if expires_in > 2 * WEEK {
        WEEK
    } else if expires_in > 2 * DAY {
        DAY
    } else if expires_in > 2 * HOUR {
        HOUR
    } else if expires_in > 2 * MINUTE {
        MINUTE
    } else {
        5
    };
    Duration::from_secs(seconds as u64)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A certificate chain with its key, as found in a certificate directory.
#[derive(Debug)]
pub struct LoadedCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub identity: CertIdentity,
}

/// Load every `NAME.key`/`NAME.cert` pair in `dir`.
///
/// Certificates that are expired or not yet valid are an error. The result is
/// ordered best first: admin (`*.*`) certificates, then by number of
/// permitted methods, then by remaining lifetime.
pub fn load_certificates(dir: &Path) -> Result<Vec<LoadedCert>> {
    let now = unix_now();
    let mut loaded = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let key_path = entry?.path();
        if key_path.extension().and_then(|e| e.to_str()) != Some("key") {
            continue;
        }
        let cert_path = key_path.with_extension("cert");
        let chain = load_certs(&cert_path)?;
        let key = load_private_key(&key_path)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate(format!("{} holds no certificate", cert_path.display())))?;
        let identity = CertIdentity::parse(leaf.as_ref())?;
        let name = cert_path.display();
        Validity::of(&identity).check(&name.to_string(), now)?;
        debug!(cert = %name, username = %identity.username, "loaded certificate");
        loaded.push(LoadedCert {
            chain,
            key,
            identity,
        });
    }
    loaded.sort_by_key(|c| Reverse(c.identity.not_after));
    loaded.sort_by_key(|c| {
        (
            !c.identity.is_admin(),
            Reverse(c.identity.permitted_methods.len()),
        )
    });
    Ok(loaded)
}

/// Fetch the identity certificate and key published by the metadata
/// service.
///
/// When either is unavailable the result is `Ok(None)`, or an error if
/// `error_if_missing`. With `error_if_expired`, a certificate outside its
/// validity window is an error too.
pub async fn load_certificate_from_metadata(
    metadata: &MetadataService,
    error_if_missing: bool,
    error_if_expired: bool,
) -> Result<Option<LoadedCert>> {
    let pems = async {
        let cert = metadata.fetch(IDENTITY_CERT_PATH).await?;
        let key = metadata.fetch(IDENTITY_KEY_PATH).await?;
        Ok::<_, Error>((cert, key))
    };
    let (cert_pem, key_pem) = match pems.await {
        Ok(pems) => pems,
        Err(e) if error_if_missing => return Err(e),
        Err(e) => {
            debug!(metadata_url = metadata.base_url(), "no identity certificate from metadata: {}", e);
            return Ok(None);
        }
    };
    let chain = parse_certs(&mut cert_pem.as_slice(), IDENTITY_CERT_PATH)?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| Error::Certificate(format!("no private key found in {IDENTITY_KEY_PATH}")))?;
    let leaf = chain
        .first()
        .ok_or_else(|| Error::Certificate("metadata certificate chain is empty".into()))?;
    let identity = CertIdentity::parse(leaf.as_ref())?;
    if error_if_expired {
        Validity::of(&identity).check("metadata certificate", unix_now())?;
    }
    debug!(username = %identity.username, "loaded certificate from metadata service");
    Ok(Some(LoadedCert {
        chain,
        key,
        identity,
    }))
}

/// Run `reload` whenever the current certificate is due for renewal.
/// `reload` returns the validity of the freshly installed certificate.
/// Failures keep the old certificate and try again later.
fn spawn_reload_loop<F, Fut>(what: &'static str, validity: Validity, reload: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Validity>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut validity = validity;
        loop {
            let delay = refresh_delay(validity, unix_now());
            info!(what, delay = ?delay, "certificate reload scheduled");
            tokio::time::sleep(delay).await;
            match reload().await {
                Ok(fresh) => {
                    info!(what, not_after = fresh.not_after, "certificate reloaded");
                    validity = fresh;
                }
                Err(e) => warn!(what, "certificate reload failed: {}", e),
            }
        }
    })
}

fn format_seconds(seconds: i64) -> String {
    let d = chrono::Duration::seconds(seconds);
    if d.num_days() > 0 {
        format!("{}d{}h", d.num_days(), d.num_hours() % 24)
    } else if d.num_hours() > 0 {
        format!("{}h{}m", d.num_hours(), d.num_minutes() % 60)
    } else {
        format!("{}s", d.num_seconds())
    }
}

struct ServerTlsState {
    acceptor: TlsAcceptor,
    authenticator: Authenticator,
    ca_subjects: Vec<Vec<u8>>,
    validity: Validity,
}

/// Server-side TLS state: the rustls configuration plus the authenticator
/// derived from the CA bundles.
///
/// Clones share state, so material installed by [`ServerTls::replace_with`]
/// or the reloader is seen by every server holding a clone.
#[derive(Clone)]
pub struct ServerTls {
    state: Arc<RwLock<Arc<ServerTlsState>>>,
}

impl ServerTls {
    /// Build from DER material.
    ///
    /// `cas` may grant identity and method powers. If `identity_cas` is
    /// non-empty, certificates chaining to it are accepted too, and method
    /// powers are honored only for leaves issued by `cas`.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        cas: &[CertificateDer<'static>],
        identity_cas: &[CertificateDer<'static>],
        client_auth_optional: bool,
    ) -> Result<Self> {
        let validity = Validity::of_chain(&chain)?;
        let mut roots = RootCertStore::empty();
        let mut ca_subjects = Vec::new();
        for ca in cas.iter().chain(identity_cas) {
            roots.add(ca.clone())?;
            ca_subjects.push(CertIdentity::parse(ca.as_ref())?.raw_subject);
        }
        let authenticator = if identity_cas.is_empty() {
            Authenticator::new()
        } else {
            Authenticator::with_full_auth_cas(cas)?
        };
        let provider = provider();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone());
        let verifier = if client_auth_optional {
            verifier.allow_unauthenticated()
        } else {
            verifier
        }
        .build()
        .map_err(|e| Error::Certificate(e.to_string()))?;
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;
        info!(
            cas = cas.len(),
            identity_cas = identity_cas.len(),
            "server TLS configured"
        );
        let state = ServerTlsState {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            authenticator,
            ca_subjects,
            validity,
        };
        Ok(Self {
            state: Arc::new(RwLock::new(Arc::new(state))),
        })
    }

    /// Load PEM files.
    pub fn from_files(
        cert: &Path,
        key: &Path,
        ca: &Path,
        identity_ca: Option<&Path>,
        client_auth_optional: bool,
    ) -> Result<Self> {
        Self::new(
            load_certs(cert)?,
            load_private_key(key)?,
            &load_certs(ca)?,
            &load_identity_cas(identity_ca)?,
            client_auth_optional,
        )
    }

    fn current(&self) -> Arc<ServerTlsState> {
        Arc::clone(&self.state.read())
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        self.current().acceptor.clone()
    }

    pub fn authenticator(&self) -> Authenticator {
        self.current().authenticator.clone()
    }

    /// Validity of the server's own certificate.
    pub fn validity(&self) -> Validity {
        self.current().validity
    }

    /// Install the material of `fresh`. Connections already established
    /// keep the material they were accepted with.
    pub fn replace_with(&self, fresh: &ServerTls) {
        let next = fresh.current();
        *self.state.write() = next;
    }

    /// Whether the leaf of `chain` was issued by one of the configured CAs.
    pub fn issued_by_known_ca(&self, chain: &[CertificateDer<'_>]) -> bool {
        let Some(leaf) = chain.first() else {
            return false;
        };
        match CertIdentity::parse(leaf.as_ref()) {
            Ok(identity) => self
                .current()
                .ca_subjects
                .iter()
                .any(|s| *s == identity.raw_issuer),
            Err(_) => false,
        }
    }

    /// Reload from `source` as the certificate nears expiry.
    pub fn spawn_reloader(&self, source: ServerTlsSource) -> JoinHandle<()> {
        let tls = self.clone();
        let source = Arc::new(source);
        spawn_reload_loop("server", self.validity(), move || {
            let tls = tls.clone();
            let source = Arc::clone(&source);
            async move {
                let fresh = source.load(true).await?;
                tls.replace_with(&fresh);
                Ok::<_, Error>(tls.validity())
            }
        })
    }
}

fn load_identity_cas(path: Option<&Path>) -> Result<Vec<CertificateDer<'static>>> {
    match path {
        Some(path) if path.exists() => load_certs(path),
        _ => Ok(Vec::new()),
    }
}

/// Where a server's TLS material comes from.
#[derive(Clone)]
pub struct ServerTlsSource {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// CAs whose client certificates may carry method powers.
    pub ca: PathBuf,
    /// CAs trusted for identity only. Ignored if the file does not exist.
    pub identity_ca: Option<PathBuf>,
    pub client_auth_optional: bool,
    /// Used when `cert` or `key` is unset or missing.
    pub metadata: Option<Arc<MetadataService>>,
}

impl ServerTlsSource {
    /// Load the current material. A certificate outside its validity window
    /// is an error with `fail_if_expired`, otherwise only a warning.
    pub async fn load(&self, fail_if_expired: bool) -> Result<ServerTls> {
        let (chain, key) = self.load_identity().await?;
        let validity = Validity::of_chain(&chain)?;
        match validity.check("server certificate", unix_now()) {
            Err(e) if fail_if_expired => return Err(e),
            Err(e) => warn!("{}", e),
            Ok(()) => debug!(not_after = validity.not_after, "server certificate is valid"),
        }
        ServerTls::new(
            chain,
            key,
            &load_certs(&self.ca)?,
            &load_identity_cas(self.identity_ca.as_deref())?,
            self.client_auth_optional,
        )
    }

    async fn load_identity(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            if (cert.exists() && key.exists()) || self.metadata.is_none() {
                return Ok((load_certs(cert)?, load_private_key(key)?));
            }
            debug!(cert = %cert.display(), "server certificate missing, trying metadata service");
        }
        let Some(metadata) = &self.metadata else {
            return Err(Error::Certificate("no server certificate configured".into()));
        };
        let loaded = load_certificate_from_metadata(metadata, true, false)
            .await?
            .ok_or_else(|| Error::Certificate("no certificate from metadata service".into()))?;
        info!(username = %loaded.identity.username, "using certificate from metadata service");
        Ok((loaded.chain, loaded.key))
    }
}

#[derive(Clone)]
struct ClientTlsState {
    connector: TlsConnector,
    validity: Option<Validity>,
}

/// Client-side TLS configuration. Clones share state, like [`ServerTls`].
#[derive(Clone)]
pub struct ClientTls {
    state: Arc<RwLock<ClientTlsState>>,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls").finish_non_exhaustive()
    }
}

impl ClientTls {
    /// `identity` is presented to the server. Without `roots`, the server's
    /// certificate is not verified.
    pub fn new(
        identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
        roots: Option<RootCertStore>,
    ) -> Result<Self> {
        let provider = provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)?;
        let builder = match roots {
            Some(roots) => builder.with_root_certificates(roots),
            None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider))),
        };
        let (config, validity) = match identity {
            Some((chain, key)) => {
                let validity = Validity::of_chain(&chain).ok();
                (builder.with_client_auth_cert(chain, key)?, validity)
            }
            None => (builder.with_no_client_auth(), None),
        };
        let state = ClientTlsState {
            connector: TlsConnector::from(Arc::new(config)),
            validity,
        };
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Present the best certificate from a certificate directory.
    pub fn from_cert_dir(dir: &Path, roots: Option<RootCertStore>) -> Result<Self> {
        let identity = load_certificates(dir)?
            .into_iter()
            .next()
            .map(|cert| (cert.chain, cert.key));
        if identity.is_none() {
            debug!(dir = %dir.display(), "no client certificates found");
        }
        Self::new(identity, roots)
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        self.state.read().connector.clone()
    }

    /// Validity of the presented certificate, if any.
    pub fn validity(&self) -> Option<Validity> {
        self.state.read().validity
    }

    /// Install the material of `fresh` for future dials.
    pub fn replace_with(&self, fresh: &ClientTls) {
        let next = fresh.state.read().clone();
        *self.state.write() = next;
    }

    /// Reload from `source` as the certificate nears expiry. Nothing is
    /// spawned when no certificate is presented.
    pub fn spawn_reloader(&self, source: ClientTlsSource) -> Option<JoinHandle<()>> {
        let validity = self.validity()?;
        let tls = self.clone();
        let source = Arc::new(source);
        Some(spawn_reload_loop("client", validity, move || {
            let tls = tls.clone();
            let source = Arc::clone(&source);
            async move {
                let fresh = source.load(true).await?;
                tls.replace_with(&fresh);
                tls.validity()
                    .ok_or_else(|| Error::Certificate("reloaded client has no certificate".into()))
            }
        }))
    }

    pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
        ServerName::try_from(host.to_string())
            .map_err(|e| Error::Certificate(format!("invalid server name {host}: {e}")))
    }
}

/// Where a client's certificate comes from.
#[derive(Clone, Default)]
pub struct ClientTlsSource {
    /// Directory of `NAME.cert`/`NAME.key` pairs.
    pub cert_dir: Option<PathBuf>,
    /// CA bundle for verifying servers; unverified when unset.
    pub roots: Option<RootCertStore>,
    /// Used when the directory is unset, missing or empty.
    pub metadata: Option<Arc<MetadataService>>,
}

impl ClientTlsSource {
    /// Load the best available certificate. Without one, the result
    /// presents no certificate, or is an error if `require_certificate`.
    pub async fn load(&self, require_certificate: bool) -> Result<ClientTls> {
        let mut best = None;
        if let Some(dir) = &self.cert_dir {
            match load_certificates(dir) {
                Ok(certs) => best = certs.into_iter().next(),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(dir = %dir.display(), "certificate directory missing");
                }
                Err(e) => return Err(e),
            }
        }
        if best.is_none() {
            if let Some(metadata) = &self.metadata {
                best = load_certificate_from_metadata(metadata, false, true).await?;
            }
        }
        match best {
            Some(cert) => ClientTls::new(Some((cert.chain, cert.key)), self.roots.clone()),
            None if require_certificate => {
                Err(Error::Certificate("no client certificate available".into()))
            }
            None => ClientTls::new(None, self.roots.clone()),
        }
    }
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(42), "42s");
        assert_eq!(format_seconds(3 * 3600 + 120), "3h2m");
        assert_eq!(format_seconds(2 * 86400 + 3600), "2d1h");
    }

    #[test]
    fn test_missing_files_are_certificate_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_certs(&dir.path().join("missing.pem")).unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_empty_cert_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), "not a key").unwrap();
        assert!(load_certificates(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_client_without_identity_builds() {
        let tls = ClientTls::new(None, None).unwrap();
        assert_eq!(tls.validity(), None);
    }

    #[test]
    fn test_refresh_due_at_seven_eighths() {
        let validity = Validity {
            not_before: 0,
            not_after: 8000,
        };
        assert_eq!(refresh_delay(validity, 0), Duration::from_secs(7000));
        assert_eq!(refresh_delay(validity, 6000), Duration::from_secs(1000));
    }

    #[test]
    fn test_refresh_retries_speed_up_near_expiry() {
        const DAY: i64 = 86400;
        let validity = Validity {
            not_before: 0,
            not_after: 160 * DAY,
        };
        let at = |left: i64| refresh_delay(validity, validity.not_after - left);
        assert_eq!(at(15 * DAY), Duration::from_secs(7 * DAY as u64));
        assert_eq!(at(3 * DAY), Duration::from_secs(DAY as u64));
        assert_eq!(at(3 * 3600), Duration::from_secs(3600));
        assert_eq!(at(300), Duration::from_secs(60));
        assert_eq!(at(60), Duration::from_secs(5));
        assert_eq!(at(-DAY), Duration::from_secs(5));
    }

    #[test]
    fn test_validity_check() {
        let validity = Validity {
            not_before: 100,
            not_after: 200,
        };
        assert!(validity.check("cert", 150).is_ok());
        let err = validity.check("cert", 40).unwrap_err().to_string();
        assert!(err.contains("will not be valid for 60s"), "{err}");
        let err = validity.check("cert", 230).unwrap_err().to_string();
        assert!(err.contains("expired 30s ago"), "{err}");
    }

    #[tokio::test]
    async fn test_client_source_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let source = ClientTlsSource {
            cert_dir: Some(dir.path().join("missing")),
            ..ClientTlsSource::default()
        };
        assert_eq!(source.load(false).await.unwrap().validity(), None);
        let err = source.load(true).await.unwrap_err();
        assert!(matches!(err, Error::Certificate(_)), "{err}");
    }

    #[tokio::test]
    async fn test_server_source_needs_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let source = ServerTlsSource {
            cert: None,
            key: None,
            ca: dir.path().join("ca.pem"),
            identity_ca: None,
            client_auth_optional: false,
            metadata: None,
        };
        let err = source.load(false).await.err().unwrap();
        assert!(matches!(err, Error::Certificate(_)), "{err}");
    }
}
