//! Server-side helpers for streaming (raw) methods.
//!
//! [`serve_updates`] multiplexes four event sources over one connection:
//! messages from the peer, updates from a channel, a short timer that
//! coalesces several updates into one flush, and a long heartbeat timer that
//! keeps idle long-poll connections alive.

use crate::conn::{Conn, Readiness};
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::trace;

pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15 * 60);

/// Far enough away to never fire while disarmed.
const DISARMED: Duration = Duration::from_secs(86400 * 365);

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// How long to wait for more updates before flushing.
    pub flush_delay: Duration,
    /// Idle time after which a heartbeat update is sent.
    pub heartbeat: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            flush_delay: DEFAULT_FLUSH_DELAY,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

/// Why [`serve_updates`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The peer closed its side.
    PeerClosed,
    /// Every sender of the update channel was dropped.
    UpdatesClosed,
    /// The message callback asked to stop.
    Stopped,
}

/// Send updates from `updates` to the peer until one side is done.
///
/// Each update is encoded as it arrives and flushed after
/// [`StreamOptions::flush_delay`], so a burst goes out in one write.
/// `heartbeat` produces the update sent after [`StreamOptions::heartbeat`]
/// without a flush. Values sent by the peer are decoded as `In` and passed to
/// `on_message`; returning `false` ends the stream.
///
/// Everything written is flushed before returning.
pub async fn serve_updates<T, In, H, M>(
    conn: &mut Conn,
    updates: &mut mpsc::Receiver<T>,
    options: &StreamOptions,
    mut heartbeat: H,
    mut on_message: M,
) -> Result<StreamEnd>
where
    T: Serialize,
    In: DeserializeOwned,
    H: FnMut() -> T,
    M: FnMut(In) -> bool,
{
    let flush_timer = sleep(DISARMED);
    let heartbeat_timer = sleep(options.heartbeat);
    tokio::pin!(flush_timer, heartbeat_timer);
    let mut pending = 0usize;
    loop {
        tokio::select! {
            readiness = conn.wait_readable() => {
                if readiness? == Readiness::Closed {
                    conn.flush().await?;
                    return Ok(StreamEnd::PeerClosed);
                }
                let message: In = conn.decode().await?;
                if !on_message(message) {
                    conn.flush().await?;
                    return Ok(StreamEnd::Stopped);
                }
            }
            update = updates.recv() => match update {
                Some(update) => {
                    conn.encode(&update).await?;
                    if pending == 0 {
                        flush_timer.as_mut().reset(Instant::now() + options.flush_delay);
                    }
                    pending += 1;
                }
                None => {
                    conn.flush().await?;
                    return Ok(StreamEnd::UpdatesClosed);
                }
            },
            _ = &mut flush_timer, if pending > 0 => {
                trace!(updates = pending, "flushing coalesced updates");
                conn.flush().await?;
                pending = 0;
                flush_timer.as_mut().reset(Instant::now() + DISARMED);
                heartbeat_timer.as_mut().reset(Instant::now() + options.heartbeat);
            }
            _ = &mut heartbeat_timer => {
                conn.encode(&heartbeat()).await?;
                conn.flush().await?;
                pending = 0;
                flush_timer.as_mut().reset(Instant::now() + DISARMED);
                heartbeat_timer.as_mut().reset(Instant::now() + options.heartbeat);
            }
        }
    }
}
