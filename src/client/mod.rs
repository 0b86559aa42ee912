//! SRPC client.
//!
//! A [`Client`] owns one negotiated connection. Calls are serialized by a
//! call lock: [`Client::call`] returns a [`CallHandle`] that holds the lock
//! and gives exclusive use of the connection until it is dropped.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::dial("10.0.0.5:6910", &DialOptions::default().with_tls(tls)).await?;
//! let reply: EchoResponse = client
//!     .request_reply("Echo.Echo", &EchoRequest { text: "hello".into() })
//!     .await?;
//! client.close().await?;
//! ```

pub mod resource;
pub mod retry;

pub use resource::{ClientLease, ClientResource};
pub use retry::{Backoff, RetryClient};

use crate::coder::Coder;
use crate::conn::{BoxedStream, Conn};
use crate::error::{Error, Result};
use crate::local;
use crate::metrics;
use crate::server::http::{self, rpc_path, NO_METHOD_POWERS_PARAM};
use crate::server::{set_tcp_keepalive, set_tcp_keepalive_period, tcp_keepalive};
use crate::tls::ClientTls;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// How to reach a server.
#[derive(Clone)]
pub struct DialOptions {
    /// Coder to insist on. `None` tries binary, then JSON.
    pub coder: Option<Coder>,
    /// Dial the TLS endpoints with this configuration.
    pub tls: Option<ClientTls>,
    /// Covers the TCP connect, the CONNECT exchange, the TLS handshake and
    /// the local upgrade.
    pub timeout: Duration,
    /// Move same-host connections onto a Unix socket.
    pub local_upgrade: bool,
    /// Ask the server to ignore the permitted methods in our certificate.
    pub disable_method_powers: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            coder: None,
            tls: None,
            timeout: Duration::from_secs(30),
            local_upgrade: true,
            disable_method_powers: false,
        }
    }
}

impl DialOptions {
    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_coder(mut self, coder: Coder) -> Self {
        self.coder = Some(coder);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn without_local_upgrade(mut self) -> Self {
        self.local_upgrade = false;
        self
    }

    pub fn without_method_powers(mut self) -> Self {
        self.disable_method_powers = true;
        self
    }
}

/// One client connection to an SRPC server.
pub struct Client {
    conn: Mutex<Conn>,
    coder: Coder,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    encrypted: bool,
    /// Duplicate of the TCP socket, for socket options. `None` once the
    /// connection moves to a Unix socket.
    tcp_fd: parking_lot::Mutex<Option<OwnedFd>>,
    unix: AtomicBool,
    from_resource: AtomicBool,
    closed: AtomicBool,
}

impl Client {
    /// Connect to `addr` (`host:port`).
    pub async fn dial(addr: &str, options: &DialOptions) -> Result<Self> {
        let attempt = async {
            let client = Self::dial_endpoints(addr, options).await?;
            if options.local_upgrade && local::attempt_upgrade(&client).await? {
                debug!(addr, "using Unix socket for same-host connection");
                client.unix.store(true, Ordering::Relaxed);
                client.tcp_fd.lock().take();
            }
            Ok::<_, Error>(client)
        };
        tokio::time::timeout(options.timeout, attempt)
            .await
            .map_err(|_| Error::Timeout("dialing SRPC server"))?
    }

    async fn dial_endpoints(addr: &str, options: &DialOptions) -> Result<Self> {
        let coders = match options.coder {
            Some(coder) => vec![coder],
            None => vec![Coder::Binary, Coder::Json],
        };
        for coder in coders {
            if let Some(client) = Self::dial_endpoint(addr, coder, options).await? {
                return Ok(client);
            }
        }
        Err(Error::NoSrpcEndpoint(addr.to_string()))
    }

    /// `Ok(None)` means the server does not serve this endpoint.
    async fn dial_endpoint(addr: &str, coder: Coder, options: &DialOptions) -> Result<Option<Self>> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let tcp_fd = tcp.as_fd().try_clone_to_owned()?;
        let local_addr = tcp.local_addr().ok();
        let remote_addr = tcp.peer_addr().ok();
        let mut stream: BoxedStream = Box::new(tcp);

        let mut path = rpc_path(coder, options.tls.is_some()).to_string();
        if options.disable_method_powers {
            path.push_str(&format!("?{NO_METHOD_POWERS_PARAM}=true"));
        }
        stream
            .write_all(format!("CONNECT {path} HTTP/1.0\r\n\r\n").as_bytes())
            .await?;
        stream.flush().await?;
        let (head, rest) = http::read_head(&mut stream).await?;
        match http::parse_status(&head)? {
            200 => {}
            404 | 405 => {
                debug!(addr, path = %path, "endpoint not served");
                return Ok(None);
            }
            status => {
                return Err(Error::Http(format!("{path}: unexpected status {status}")));
            }
        }
        let stream = http::rewind(stream, rest);
        let stream = match &options.tls {
            Some(tls) => {
                let name = ClientTls::server_name(host_of(addr))?;
                Box::new(tls.connector().connect(name, stream).await?) as BoxedStream
            }
            None => stream,
        };
        let conn = Conn::new(stream, coder)
            .with_addrs(local_addr, remote_addr)
            .with_encryption(options.tls.is_some());
        let mut client = Self::from_conn(conn);
        *client.tcp_fd.get_mut() = Some(tcp_fd);
        Ok(Some(client))
    }

    /// Wrap a stream that is already past the HTTP exchange, such as one end
    /// of an in-process pipe served by [`crate::Server::serve_stream`].
    pub fn from_stream(stream: BoxedStream, coder: Coder) -> Self {
        Self::from_conn(Conn::new(stream, coder))
    }

    fn from_conn(conn: Conn) -> Self {
        metrics::client_connection_opened();
        Self {
            coder: conn.coder(),
            local_addr: conn.local_addr(),
            remote_addr: conn.remote_addr(),
            encrypted: conn.is_encrypted(),
            conn: Mutex::new(conn),
            tcp_fd: parking_lot::Mutex::new(None),
            unix: AtomicBool::new(false),
            from_resource: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) {
        if self.closed.load(Ordering::Acquire) {
            panic!("use of closed SRPC client");
        }
    }

    /// Start a call. On success the server has acknowledged the method and
    /// the returned handle owns the connection for the method's exchange.
    ///
    /// # Panics
    ///
    /// If the client has been closed.
    pub async fn call(&self, service_method: &str) -> Result<CallHandle<'_>> {
        let mut conn = self.lock_idle().await?;
        let reply = exchange_line(&mut conn, service_method).await?;
        if !reply.is_empty() {
            return Err(Error::from_remote_line(&reply));
        }
        Ok(CallHandle { conn })
    }

    /// Send one request and wait for its response.
    ///
    /// Dropping the future part way through leaves the client unusable:
    /// later calls fail with a transport error instead of reading this
    /// call's reply.
    pub async fn request_reply<Req, Resp>(&self, service_method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut call = self.call(service_method).await?;
        call.begin_exchange();
        call.encode(request).await?;
        call.flush().await?;
        let status = read_reply(&mut call).await?;
        if !status.is_empty() {
            call.end_exchange();
            return Err(Error::from_remote_line(&status));
        }
        let reply = call.decode().await?;
        call.end_exchange();
        Ok(reply)
    }

    /// Round-trip an empty call line.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.lock_idle().await?;
        let reply = exchange_line(&mut conn, "").await?;
        if !reply.is_empty() {
            return Err(Error::from_remote_line(&reply));
        }
        Ok(())
    }

    /// Take the call lock, refusing a connection some earlier call left
    /// part way through its exchange.
    async fn lock_idle(&self) -> Result<MutexGuard<'_, Conn>> {
        self.check_open();
        let conn = self.conn.lock().await;
        if conn.is_mid_exchange() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection abandoned mid-call",
            )));
        }
        Ok(conn)
    }

    /// Whether an abandoned call has left the connection unusable.
    pub fn is_broken(&self) -> bool {
        self.conn
            .try_lock()
            .map(|conn| conn.is_mid_exchange())
            .unwrap_or(false)
    }

    /// Close the connection. Closing again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        metrics::client_connection_closed();
        let mut conn = self.conn.lock().await;
        conn.call_release();
        match conn.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Turn TCP keepalive on or off. A no-op unless the connection is TCP.
    pub fn set_keep_alive(&self, enabled: bool) -> Result<()> {
        if let Some(fd) = self.tcp_fd.lock().as_ref() {
            set_tcp_keepalive(fd, enabled).map_err(io::Error::from)?;
        }
        Ok(())
    }

    /// Set the TCP keepalive idle time and packet interval.
    pub fn set_keep_alive_period(&self, period: Duration) -> Result<()> {
        if let Some(fd) = self.tcp_fd.lock().as_ref() {
            set_tcp_keepalive_period(fd, period).map_err(io::Error::from)?;
        }
        Ok(())
    }

    /// Whether TCP keepalive is on, or `None` for a non-TCP connection.
    pub fn keep_alive(&self) -> Result<Option<bool>> {
        match self.tcp_fd.lock().as_ref() {
            Some(fd) => Ok(Some(tcp_keepalive(fd).map_err(io::Error::from)?)),
            None => Ok(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn coder(&self) -> Coder {
        self.coder
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Whether the connection was moved onto a Unix socket.
    pub fn is_unix(&self) -> bool {
        self.unix.load(Ordering::Relaxed)
    }

    pub fn is_from_client_resource(&self) -> bool {
        self.from_resource.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_from_client_resource(&self) {
        self.from_resource.store(true, Ordering::Relaxed);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            metrics::client_connection_closed();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("coder", &self.coder)
            .field("remote_addr", &self.remote_addr)
            .field("encrypted", &self.encrypted)
            .field("unix", &self.is_unix())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Send a call line and read the server's answer. The connection stays
/// marked as mid-exchange unless the answer arrives.
async fn exchange_line(conn: &mut Conn, line: &str) -> Result<String> {
    conn.begin_exchange();
    conn.write_line(line).await?;
    conn.flush().await?;
    let reply = read_reply(conn).await?;
    conn.end_exchange();
    Ok(reply)
}

async fn read_reply(conn: &mut Conn) -> Result<String> {
    conn.read_line().await?.ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed connection",
        ))
    })
}

fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Sorted `Service.Method` names from a server's listing endpoint.
pub async fn list_methods(addr: &str, public_only: bool, timeout: Duration) -> Result<Vec<String>> {
    let path = if public_only {
        http::LIST_PUBLIC_METHODS_PATH
    } else {
        http::LIST_METHODS_PATH
    };
    let body = fetch_utility(addr, path, timeout).await?;
    Ok(body.lines().map(str::to_string).collect())
}

/// A server's fully qualified host name.
pub async fn get_hostname(addr: &str, timeout: Duration) -> Result<String> {
    let body = fetch_utility(addr, http::HOSTNAME_PATH, timeout).await?;
    Ok(body.trim().to_string())
}

async fn fetch_utility(addr: &str, path: &str, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Http(e.to_string()))?;
    let resp = client
        .get(format!("http://{addr}{path}"))
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Http(format!("{path}: {}", resp.status())));
    }
    resp.text().await.map_err(|e| Error::Http(e.to_string()))
}

/// Exclusive use of a client's connection for one call.
pub struct CallHandle<'a> {
    conn: MutexGuard<'a, Conn>,
}

impl Deref for CallHandle<'_> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        &self.conn
    }
}

impl DerefMut for CallHandle<'_> {
    fn deref_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }
}

impl std::fmt::Debug for CallHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CallHandle").field(&*self.conn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.1.2.3:6910"), "10.1.2.3");
        assert_eq!(host_of("hv1.example.com:6910"), "hv1.example.com");
        assert_eq!(host_of("[::1]:6910"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn test_dial_options_builders() {
        let options = DialOptions::default()
            .with_coder(Coder::Json)
            .without_local_upgrade()
            .without_method_powers();
        assert_eq!(options.coder, Some(Coder::Json));
        assert!(!options.local_upgrade);
        assert!(options.disable_method_powers);
        assert!(options.tls.is_none());
    }
}
