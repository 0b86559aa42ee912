//! Same-host transport upgrade onto a Unix socket.
//!
//! After dialing, a client whose local and remote IP addresses match calls the
//! built-in `.LocalUpgradeToUnix` method:
//!
//! 1. client sends a random client cookie
//! 2. server answers with a random server cookie and the socket path
//! 3. client connects to the socket, writes the server cookie, and reports
//!    that it did so over the original connection
//! 4. server matches the socket by cookie, acknowledges, writes the client
//!    cookie on the socket, and swaps its stream
//! 5. client checks the returned client cookie and swaps its stream
//!
//! Anything that fails before the server commits leaves the original
//! transport in place.

use crate::client::Client;
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::registry::{AllowAll, Service};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, OnceCell};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

pub const CLIENT_COOKIE_LENGTH: usize = 8;
pub const SERVER_COOKIE_LENGTH: usize = 8;

/// Name of the built-in upgrade method.
pub const UPGRADE_METHOD: &str = ".LocalUpgradeToUnix";

/// Environment variable overriding the socket path. Empty disables the
/// upgrade.
pub const SOCKET_PATH_ENV: &str = "SRPC_UNIX_SOCKET_PATH";

/// How long the server waits for the dialer's socket to show up.
const COOKIE_ARRIVAL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long an unclaimed socket is kept.
const UNCLAIMED_SOCKET_TTL: Duration = Duration::from_secs(30);

/// How long a fresh socket has to send its cookie.
const COOKIE_READ_TIMEOUT: Duration = Duration::from_secs(5);

type ServerCookie = [u8; SERVER_COOKIE_LENGTH];

#[derive(Debug, Serialize, Deserialize)]
struct UpgradeRequestOne {
    client_cookie: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UpgradeResponseOne {
    error: String,
    server_cookie: Vec<u8>,
    socket_pathname: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpgradeRequestTwo {
    sent_server_cookie: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UpgradeResponseTwo {
    error: String,
}

/// Abstract-namespace path derived from the process id on Linux; empty
/// (disabled) elsewhere.
pub fn default_socket_path() -> String {
    if cfg!(target_os = "linux") {
        format!("@SRPC.{}", std::process::id())
    } else {
        String::new()
    }
}

/// Whether two endpoints of a connection sit on the same host.
pub fn is_local(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> bool {
    match (local, remote) {
        (Some(local), Some(remote)) => local.ip() == remote.ip(),
        _ => false,
    }
}

/// Server side of the upgrade: a lazily started Unix listener plus the table
/// of sockets waiting to be claimed by cookie.
#[derive(Debug)]
pub struct LocalUpgrader {
    path: String,
    listening: OnceCell<bool>,
    pending: Mutex<HashMap<ServerCookie, UnixStream>>,
    arrived: Notify,
}

impl LocalUpgrader {
    /// `None` when `path` is empty.
    pub fn new(path: impl Into<String>) -> Option<Self> {
        let path = path.into();
        if path.is_empty() {
            return None;
        }
        Some(Self {
            path,
            listening: OnceCell::new(),
            pending: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
        })
    }

    /// Use [`SOCKET_PATH_ENV`] if set, else [`default_socket_path`].
    pub fn from_env() -> Option<Self> {
        let path = std::env::var(SOCKET_PATH_ENV).unwrap_or_else(|_| default_socket_path());
        Self::new(path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bind the listener on first use. Returns whether it is listening.
    pub async fn ensure_listening(self: &Arc<Self>) -> bool {
        *self
            .listening
            .get_or_init(|| async {
                match bind_unix(&self.path) {
                    Ok(listener) => {
                        info!(path = %self.path, "listening for local upgrades");
                        tokio::spawn(accept_loop(Arc::clone(self), listener));
                        true
                    }
                    Err(e) => {
                        warn!(path = %self.path, "error listening on Unix socket: {}", e);
                        false
                    }
                }
            })
            .await
    }

    fn park(self: &Arc<Self>, cookie: ServerCookie, stream: UnixStream) {
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&cookie) {
                // Concurrent upgrades drew the same cookie. The newcomer loses
                // and its dialer sees "cookie not found" or a cookie mismatch.
                warn!("dropping Unix connection with colliding cookie");
                return;
            }
            pending.insert(cookie, stream);
        }
        self.arrived.notify_waiters();
        let upgrader = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(UNCLAIMED_SOCKET_TTL).await;
            if upgrader.pending.lock().remove(&cookie).is_some() {
                debug!("discarded unclaimed Unix connection");
            }
        });
    }

    fn claim(&self, cookie: &ServerCookie) -> Option<UnixStream> {
        self.pending.lock().remove(cookie)
    }

    async fn wait_for(&self, cookie: &ServerCookie, limit: Duration) -> Option<UnixStream> {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.arrived.notified();
            if let Some(stream) = self.claim(cookie) {
                return Some(stream);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.claim(cookie);
            }
        }
    }
}

async fn accept_loop(upgrader: Arc<LocalUpgrader>, listener: UnixListener) {
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("error accepting Unix connection: {}", e);
                return;
            }
        };
        let upgrader = Arc::clone(&upgrader);
        tokio::spawn(async move {
            let mut cookie = [0u8; SERVER_COOKIE_LENGTH];
            match timeout(COOKIE_READ_TIMEOUT, stream.read_exact(&mut cookie)).await {
                Ok(Ok(_)) => upgrader.park(cookie, stream),
                Ok(Err(e)) => debug!("error reading Unix cookie: {}", e),
                Err(_) => debug!("timed out reading Unix cookie"),
            }
        });
    }
}

fn bind_unix(path: &str) -> io::Result<UnixListener> {
    if let Some(name) = path.strip_prefix('@') {
        return bind_abstract(name);
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    UnixListener::bind(path)
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract Unix sockets are only available on Linux",
    ))
}

async fn connect_unix(path: &str) -> io::Result<UnixStream> {
    match path.strip_prefix('@') {
        Some(name) => connect_abstract(name),
        None => UnixStream::connect(path).await,
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract Unix sockets are only available on Linux",
    ))
}

/// The reserved service holding the upgrade method. It grants every call.
pub(crate) fn builtin_service(upgrader: Option<Arc<LocalUpgrader>>) -> Service {
    let method = UPGRADE_METHOD.trim_start_matches('.');
    Service::new("")
        .raw(method, move |conn| {
            let upgrader = upgrader.clone();
            async move { serve_upgrade(upgrader, conn).await }.boxed()
        })
        .access_control(AllowAll)
}

async fn serve_upgrade(upgrader: Option<Arc<LocalUpgrader>>, conn: &mut Conn) -> Result<()> {
    let request: UpgradeRequestOne = conn.decode().await?;
    let listening = match &upgrader {
        Some(upgrader) => upgrader.ensure_listening().await,
        None => false,
    };
    let upgrader = match upgrader {
        Some(upgrader) if listening => upgrader,
        _ => {
            let refusal = UpgradeResponseOne {
                error: "no socket".into(),
                ..Default::default()
            };
            return conn.encode(&refusal).await;
        }
    };
    let cookie: ServerCookie = rand::random();
    conn.encode(&UpgradeResponseOne {
        error: String::new(),
        server_cookie: cookie.to_vec(),
        socket_pathname: upgrader.path().to_string(),
    })
    .await?;
    conn.flush().await?;
    let request_two: UpgradeRequestTwo = conn.decode().await?;
    if !request_two.sent_server_cookie {
        return Ok(());
    }
    let Some(mut unix) = upgrader.wait_for(&cookie, COOKIE_ARRIVAL_TIMEOUT).await else {
        return conn
            .encode(&UpgradeResponseTwo {
                error: "cookie not found".into(),
            })
            .await;
    };
    conn.encode(&UpgradeResponseTwo::default()).await?;
    conn.flush().await?;
    unix.write_all(&request.client_cookie).await?;
    unix.flush().await?;
    conn.replace_stream(Box::new(unix)).await?;
    debug!(remote = ?conn.remote_addr(), "connection moved to Unix socket");
    Ok(())
}

/// Client side of the upgrade. `Ok(false)` means the original transport is
/// still in use; an error means the connection is no longer usable.
pub(crate) async fn attempt_upgrade(client: &Client) -> Result<bool> {
    if !is_local(client.local_addr(), client.remote_addr()) {
        return Ok(false);
    }
    let client_cookie: [u8; CLIENT_COOKIE_LENGTH] = rand::random();
    let mut call = match client.call(UPGRADE_METHOD).await {
        Ok(call) => call,
        Err(e) if e.is_transport() => return Err(e),
        Err(e) => {
            debug!("server refused local upgrade: {}", e);
            return Ok(false);
        }
    };
    call.encode(&UpgradeRequestOne {
        client_cookie: client_cookie.to_vec(),
    })
    .await?;
    call.flush().await?;
    let reply_one: UpgradeResponseOne = call.decode().await?;
    if !reply_one.error.is_empty() {
        debug!("local upgrade unavailable: {}", reply_one.error);
        return Ok(false);
    }
    let unix = match connect_unix(&reply_one.socket_pathname).await {
        Ok(mut unix) => match unix.write_all(&reply_one.server_cookie).await {
            Ok(()) => Some(unix),
            Err(e) => {
                debug!("error sending server cookie: {}", e);
                None
            }
        },
        Err(e) => {
            debug!(path = %reply_one.socket_pathname, "error dialing Unix socket: {}", e);
            None
        }
    };
    call.encode(&UpgradeRequestTwo {
        sent_server_cookie: unix.is_some(),
    })
    .await?;
    call.flush().await?;
    let Some(mut unix) = unix else {
        return Ok(false);
    };
    let reply_two: UpgradeResponseTwo = call.decode().await?;
    if !reply_two.error.is_empty() {
        debug!("server could not match Unix socket: {}", reply_two.error);
        return Ok(false);
    }
    let mut returned = [0u8; CLIENT_COOKIE_LENGTH];
    unix.read_exact(&mut returned)
        .await
        .map_err(|e| Error::LocalUpgrade(format!("reading returned cookie: {e}")))?;
    if returned != client_cookie {
        return Err(Error::LocalUpgrade("returned client cookie does not match".into()));
    }
    call.replace_stream(Box::new(unix)).await?;
    Ok(true)
}
