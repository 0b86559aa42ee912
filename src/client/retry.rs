//! A client that re-dials after failures.

use super::{Client, DialOptions};
use crate::conn::Conn;
use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Idle time after which a cached connection is pinged before use.
pub const PING_AFTER_IDLE: Duration = Duration::from_secs(1);

/// Exponential back-off between dial attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Dial attempts before giving up.
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            attempts: 5,
        }
    }
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(1 << attempt.min(16))
            .min(self.max)
    }
}

/// TCP keepalive settings applied to every connection a [`RetryClient`]
/// dials. `None` leaves the system default.
#[derive(Debug, Clone, Copy, Default)]
struct KeepAlive {
    enabled: Option<bool>,
    period: Option<Duration>,
}

impl KeepAlive {
    fn apply(&self, client: &Client) -> Result<()> {
        if let Some(enabled) = self.enabled {
            client.set_keep_alive(enabled)?;
        }
        if let Some(period) = self.period {
            client.set_keep_alive_period(period)?;
        }
        Ok(())
    }
}

/// Wraps a [`Client`], re-dialing when the connection goes bad.
pub struct RetryClient {
    addr: String,
    options: DialOptions,
    backoff: Backoff,
    keep_alive: Mutex<KeepAlive>,
    client: tokio::sync::Mutex<Option<Arc<Client>>>,
    last_good: Mutex<Instant>,
}

impl RetryClient {
    pub fn new(addr: impl Into<String>, options: DialOptions) -> Self {
        Self {
            addr: addr.into(),
            options,
            backoff: Backoff::default(),
            keep_alive: Mutex::new(KeepAlive::default()),
            client: tokio::sync::Mutex::new(None),
            last_good: Mutex::new(Instant::now()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Turn TCP keepalive on or off for the current connection and every
    /// later one.
    pub async fn set_keep_alive(&self, enabled: bool) -> Result<()> {
        self.keep_alive.lock().enabled = Some(enabled);
        match self.client.lock().await.as_ref() {
            Some(client) => client.set_keep_alive(enabled),
            None => Ok(()),
        }
    }

    /// Set the TCP keepalive period for the current connection and every
    /// later one.
    pub async fn set_keep_alive_period(&self, period: Duration) -> Result<()> {
        self.keep_alive.lock().period = Some(period);
        match self.client.lock().await.as_ref() {
            Some(client) => client.set_keep_alive_period(period),
            None => Ok(()),
        }
    }

    /// A connected client, pinged first if it has been idle.
    pub async fn client(&self) -> Result<Arc<Client>> {
        let mut slot = self.client.lock().await;
        if slot.as_ref().is_some_and(|client| client.is_broken()) {
            debug!(addr = %self.addr, "connection left mid-call, redialing");
            *slot = None;
        }
        if let Some(client) = slot.as_ref() {
            if self.last_good.lock().elapsed() < PING_AFTER_IDLE {
                return Ok(Arc::clone(client));
            }
            match client.ping().await {
                Ok(()) => {
                    self.mark_good();
                    return Ok(Arc::clone(client));
                }
                Err(e) => {
                    debug!(addr = %self.addr, "ping failed, redialing: {}", e);
                    *slot = None;
                }
            }
        }
        let client = Arc::new(self.dial().await?);
        *slot = Some(Arc::clone(&client));
        self.mark_good();
        Ok(client)
    }

    async fn dial(&self) -> Result<Client> {
        let mut attempt = 0;
        loop {
            let dialed = match Client::dial(&self.addr, &self.options).await {
                Ok(client) => {
                    let keep_alive = *self.keep_alive.lock();
                    keep_alive.apply(&client).map(|()| client)
                }
                Err(e) => Err(e),
            };
            match dialed {
                Ok(client) => return Ok(client),
                Err(e) if attempt + 1 >= self.backoff.attempts.max(1) => return Err(e),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(addr = %self.addr, ?delay, "error dialing: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// [`Client::request_reply`] on the current connection. A transport
    /// failure drops the connection so the next call re-dials.
    pub async fn request_reply<Req, Resp>(&self, service_method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let client = self.client().await?;
        let result = client.request_reply(service_method, request).await;
        self.observe(&client, &result).await;
        result
    }

    /// Run a raw call: `exchange` gets the connection once the server has
    /// acknowledged `service_method`, and owns it until its future
    /// completes.
    pub async fn call<T, F>(&self, service_method: &str, exchange: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Conn) -> BoxFuture<'a, Result<T>>,
    {
        let client = self.client().await?;
        let result = match client.call(service_method).await {
            Ok(mut call) => exchange(&mut *call).await,
            Err(e) => Err(e),
        };
        self.observe(&client, &result).await;
        result
    }

    /// Close the current connection, if any.
    pub async fn close(&self) -> Result<()> {
        match self.client.lock().await.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    async fn observe<T>(&self, client: &Arc<Client>, result: &Result<T>) {
        match result {
            Err(e) if e.is_transport() => self.forget(client).await,
            _ => self.mark_good(),
        }
    }

    /// Stop handing out `client`. Callers still holding it keep it until
    /// they drop it, which closes the connection.
    async fn forget(&self, client: &Arc<Client>) {
        let mut slot = self.client.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, client)) {
            *slot = None;
        }
    }

    fn mark_good(&self) {
        *self.last_good.lock() = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_secs(5));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = RetryClient::new(addr, DialOptions::default()).with_backoff(Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            attempts: 3,
        });
        let err = client.client().await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
    }
}
