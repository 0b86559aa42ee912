//! A lazily dialed client that is checked out and returned.

use super::{Client, DialOptions};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io;
use std::ops::Deref;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct ResourceState {
    client: Option<Client>,
    checked_out: bool,
    closed: bool,
}

/// One logical connection to `addr`, dialed on first use and kept across
/// [`ClientResource::get`]/[`ClientLease::put`] cycles.
///
/// At most one lease exists at a time; [`ClientResource::get`] waits for the
/// current lease to come back.
pub struct ClientResource {
    addr: String,
    options: DialOptions,
    state: Mutex<ResourceState>,
    returned: Notify,
}

impl ClientResource {
    pub fn new(addr: impl Into<String>, options: DialOptions) -> Self {
        Self {
            addr: addr.into(),
            options,
            state: Mutex::new(ResourceState::default()),
            returned: Notify::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Check the client out, dialing if there is no usable cached one.
    pub async fn get(&self) -> Result<ClientLease<'_>> {
        let cached = loop {
            let returned = self.returned.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(closed_error());
                }
                if !state.checked_out {
                    state.checked_out = true;
                    break state
                        .client
                        .take()
                        .filter(|c| !c.is_closed() && !c.is_broken());
                }
            }
            returned.await;
        };
        let client = match cached {
            Some(client) => client,
            None => match Client::dial(&self.addr, &self.options).await {
                Ok(client) => {
                    client.mark_from_client_resource();
                    client
                }
                Err(e) => {
                    self.check_in(None);
                    return Err(e);
                }
            },
        };
        Ok(ClientLease {
            resource: self,
            client: Some(client),
            keep: true,
        })
    }

    /// Close the cached client. A client currently checked out is closed when
    /// its lease comes back, and later calls to [`ClientResource::get`] fail.
    pub async fn close(&self) -> Result<()> {
        let cached = {
            let mut state = self.state.lock();
            state.closed = true;
            state.client.take()
        };
        self.returned.notify_waiters();
        match cached {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    pub fn is_checked_out(&self) -> bool {
        self.state.lock().checked_out
    }

    fn check_in(&self, client: Option<Client>) {
        {
            let mut state = self.state.lock();
            state.checked_out = false;
            if !state.closed {
                state.client = client;
            } else if client.is_some() {
                debug!(addr = %self.addr, "dropping client returned to closed resource");
            }
        }
        self.returned.notify_one();
    }
}

fn closed_error() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "client resource closed",
    ))
}

/// A checked-out client. Returning it (by [`ClientLease::put`] or by
/// dropping) makes it available to the next [`ClientResource::get`].
pub struct ClientLease<'a> {
    resource: &'a ClientResource,
    client: Option<Client>,
    keep: bool,
}

impl ClientLease<'_> {
    /// Return the client for reuse.
    pub fn put(self) {}

    /// Return the lease but close the client, for example after a transport
    /// error left the connection in an unknown state.
    pub async fn discard(mut self) -> Result<()> {
        self.keep = false;
        match self.client.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}

impl Deref for ClientLease<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        match &self.client {
            Some(client) => client,
            None => panic!("use of SRPC client after it was returned"),
        }
    }
}

impl Drop for ClientLease<'_> {
    fn drop(&mut self) {
        let client = self.client.take().filter(|_| self.keep);
        self.resource.check_in(client);
    }
}
