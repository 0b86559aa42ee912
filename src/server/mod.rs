//! SRPC server.
//!
//! Each accepted TCP connection carries one HTTP request. A `CONNECT` to one
//! of the SRPC paths is acknowledged, optionally upgraded to TLS, and then
//! handed to the call loop for the rest of its life. The utility paths answer
//! a single plain-text `GET` and close.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(Registry::new());
//! registry.register(echo_service())?;
//! let server = Server::new(registry).with_tls(ServerTls::from_files(&cert, &key, &ca, None, false)?);
//! server.serve(TcpListener::bind("0.0.0.0:6910").await?).await?;
//! ```

mod dispatch;
pub mod http;

use crate::auth::{AuthInformation, OwnerAllowlist, PermittedMethods};
use crate::coder::Coder;
use crate::conn::{BoxedStream, Conn};
use crate::error::{Error, Result};
use crate::metrics::ServerMetrics;
use crate::registry::Registry;
use crate::tls::ServerTls;
use http::{Endpoint, RequestHead, CONNECT_ACK};
use nix::sys::socket::{getsockopt, setsockopt, sockopt};
use rustls::pki_types::CertificateDer;
use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

/// TCP keepalive period for hijacked connections.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5 * 60);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Connection policy.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Refuse the plaintext SRPC paths.
    pub tls_required: bool,
    /// Terminate TLS on accept, before the HTTP request is read.
    pub tls_at_listener: bool,
    /// Give plaintext callers every method power instead of none.
    pub plaintext_method_powers: bool,
    pub handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tls_required: false,
            tls_at_listener: false,
            plaintext_method_powers: false,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// An SRPC server. Cheap to clone; clones share the registry and metrics.
#[derive(Clone)]
pub struct Server {
    registry: Arc<Registry>,
    tls: Option<ServerTls>,
    options: ServerOptions,
    owners: Option<OwnerAllowlist>,
    metrics: Arc<ServerMetrics>,
    hostname: Arc<OnceCell<std::result::Result<String, String>>>,
}

impl Server {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            tls: None,
            options: ServerOptions::default(),
            owners: None,
            metrics: Arc::new(ServerMetrics::default()),
            hostname: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_tls(mut self, tls: ServerTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Treat members of `owners` as holding every method power.
    pub fn with_owners(mut self, owners: OwnerAllowlist) -> Self {
        self.owners = Some(owners);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Accept connections forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// being served keep running.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.options.tls_at_listener && self.tls.is_none() {
            return Err(Error::Config(
                "TLS at the listener requires server certificates".into(),
            ));
        }
        info!(
            addr = ?listener.local_addr().ok(),
            tls = self.tls.is_some(),
            tls_required = self.options.tls_required,
            "SRPC server listening"
        );
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("SRPC server stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp, _)) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(tcp).await });
                    }
                    Err(e) => {
                        warn!("error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// Serve one accepted TCP connection to completion.
    pub async fn handle_connection(&self, tcp: TcpStream) {
        let local = tcp.local_addr().ok();
        let remote = tcp.peer_addr().ok();
        if let Err(e) = set_keepalive(&tcp) {
            debug!(remote = ?remote, "error setting keepalive: {}", e);
        }
        if let Err(e) = self.route(Box::new(tcp), local, remote).await {
            debug!(remote = ?remote, "connection closed: {}", e);
        }
    }

    /// Serve calls on a stream that needs no HTTP negotiation, such as an
    /// in-process pipe. The caller is anonymous.
    pub async fn serve_stream(&self, stream: BoxedStream, coder: Coder) -> Result<()> {
        self.metrics.record_attempt();
        let mut conn = Conn::new(stream, coder)
            .with_identity(AuthInformation::anonymous(), self.plaintext_permissions(true));
        let _open = self.metrics.open_connection();
        dispatch::serve_calls(&self.registry, self.owners.as_ref(), &mut conn).await
    }

    async fn route(
        &self,
        stream: BoxedStream,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<()> {
        let (mut stream, listener_chain) = if self.options.tls_at_listener {
            let tls = self
                .tls
                .as_ref()
                .ok_or_else(|| Error::Config("server TLS not configured".into()))?;
            let tls_stream = self.handshake(tls, stream).await?;
            let chain = peer_chain(&tls_stream);
            (Box::new(tls_stream) as BoxedStream, Some(chain))
        } else {
            (stream, None)
        };
        let (head, rest) = http::read_head(&mut stream).await?;
        let request = match http::parse_request(&head) {
            Ok(request) => request,
            Err(e) => {
                http::write_response(&mut stream, 400, &format!("{e}\n")).await?;
                return Err(e);
            }
        };
        let mut stream = http::rewind(stream, rest);
        match Endpoint::from_path(&request.path) {
            Some(Endpoint::Rpc { coder, tls }) => {
                let peer = Peer {
                    local,
                    remote,
                    listener_chain,
                };
                self.connect(stream, request, coder, tls, peer).await
            }
            Some(Endpoint::Hostname) => {
                let hostname = self.hostname.get_or_init(http::fqdn).await;
                match hostname {
                    Ok(name) => http::write_response(&mut stream, 200, name).await?,
                    Err(e) => http::write_response(&mut stream, 500, e).await?,
                }
                Ok(())
            }
            Some(Endpoint::ListMethods { public_only }) => {
                let mut body = String::new();
                for method in self.registry.list_methods(public_only) {
                    body.push_str(&method);
                    body.push('\n');
                }
                http::write_response(&mut stream, 200, &body).await?;
                Ok(())
            }
            None => {
                http::write_response(&mut stream, 404, "404 page not found\n").await?;
                Ok(())
            }
        }
    }

    async fn connect(
        &self,
        mut stream: BoxedStream,
        request: RequestHead,
        coder: Coder,
        tls: bool,
        peer: Peer,
    ) -> Result<()> {
        self.metrics.record_attempt();
        if tls && self.tls.is_none() {
            http::write_response(&mut stream, 404, "TLS not configured\n").await?;
            return Ok(());
        }
        if (self.options.tls_required && !tls) || request.method != "CONNECT" {
            self.metrics.record_rejected();
            http::write_response(&mut stream, 405, "405 must CONNECT\n").await?;
            return Ok(());
        }
        if let (true, Some(chain), Some(server_tls)) =
            (self.options.tls_required, &peer.listener_chain, &self.tls)
        {
            if !server_tls.issued_by_known_ca(chain) {
                self.metrics.record_rejected();
                http::write_response(&mut stream, 401, "no certificate from a known CA\n")
                    .await?;
                return Ok(());
            }
        }
        stream.write_all(CONNECT_ACK.as_bytes()).await?;
        stream.flush().await?;

        let allow_method_powers = request.allows_method_powers();
        let conn = match (&self.tls, tls) {
            (Some(server_tls), true) => {
                let (stream, chain) = match peer.listener_chain {
                    Some(chain) => (stream, chain),
                    None => match self.handshake(server_tls, stream).await {
                        Ok(tls_stream) => {
                            let chain = peer_chain(&tls_stream);
                            (Box::new(tls_stream) as BoxedStream, chain)
                        }
                        Err(e) => {
                            self.metrics.record_rejected();
                            return Err(e);
                        }
                    },
                };
                let (auth, permitted) = server_tls
                    .authenticator()
                    .authenticate(&chain, allow_method_powers)?;
                Conn::new(stream, coder)
                    .with_identity(auth, permitted)
                    .with_encryption(true)
            }
            _ => Conn::new(stream, coder)
                .with_identity(
                    AuthInformation::anonymous(),
                    self.plaintext_permissions(allow_method_powers),
                )
                .with_encryption(peer.listener_chain.is_some()),
        };
        let mut conn = conn.with_addrs(peer.local, peer.remote);
        debug!(
            remote = ?peer.remote,
            coder = %coder,
            encrypted = conn.is_encrypted(),
            username = %conn.username(),
            "SRPC connection established"
        );
        let _open = self.metrics.open_connection();
        dispatch::serve_calls(&self.registry, self.owners.as_ref(), &mut conn).await
    }

    async fn handshake(
        &self,
        tls: &ServerTls,
        stream: BoxedStream,
    ) -> Result<TlsStream<BoxedStream>> {
        match tokio::time::timeout(self.options.handshake_timeout, tls.acceptor().accept(stream))
            .await
        {
            Ok(Ok(tls_stream)) => Ok(tls_stream),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout("waiting for TLS handshake")),
        }
    }

    fn plaintext_permissions(&self, allow_method_powers: bool) -> PermittedMethods {
        if self.options.plaintext_method_powers && allow_method_powers {
            PermittedMethods::Unrestricted
        } else {
            PermittedMethods::none()
        }
    }
}

struct Peer {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    listener_chain: Option<Vec<CertificateDer<'static>>>,
}

fn peer_chain(stream: &TlsStream<BoxedStream>) -> Vec<CertificateDer<'static>> {
    stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|chain| chain.to_vec())
        .unwrap_or_default()
}

fn set_keepalive(tcp: &TcpStream) -> nix::Result<()> {
    set_tcp_keepalive(tcp, true)?;
    set_tcp_keepalive_period(tcp, KEEPALIVE_PERIOD)
}

pub(crate) fn set_tcp_keepalive(fd: &impl AsFd, enabled: bool) -> nix::Result<()> {
    setsockopt(fd, sockopt::KeepAlive, &enabled)
}

/// Idle time before the first keepalive packet and between packets. Only
/// Linux exposes these; elsewhere the system defaults stay.
pub(crate) fn set_tcp_keepalive_period(fd: &impl AsFd, period: Duration) -> nix::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let secs = period.as_secs().clamp(1, u32::MAX as u64) as u32;
        setsockopt(fd, sockopt::TcpKeepIdle, &secs)?;
        setsockopt(fd, sockopt::TcpKeepInterval, &secs)?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = (fd, period);
    Ok(())
}

pub(crate) fn tcp_keepalive(fd: &impl AsFd) -> nix::Result<bool> {
    getsockopt(fd, sockopt::KeepAlive)
}
