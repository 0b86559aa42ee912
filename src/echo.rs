//! `Echo` demonstration service served by `srpc serve`.
//!
//! - `Echo.Echo` (request/reply, public) returns its request.
//! - `Echo.Ticker` (streaming) sends `count` ticks `interval_ms` apart.

use crate::error::Error;
use crate::registry::Service;
use crate::stream::{self, StreamEnd, StreamOptions};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub const SERVICE_NAME: &str = "Echo";

/// Largest tick count a single `Echo.Ticker` call may ask for.
const MAX_TICKS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerRequest {
    pub count: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub sequence: u64,
    /// Sent when the stream has been idle, carries no sequence.
    pub heartbeat: bool,
    /// Set on the final tick.
    pub last: bool,
}

pub fn service() -> Service {
    Service::new(SERVICE_NAME)
        .request_reply("Echo", |_conn, request: EchoRequest| {
            async move { Ok(EchoResponse { text: request.text }) }.boxed()
        })
        .raw("Ticker", |conn| {
            async move {
                let request: TickerRequest = conn.decode().await?;
                if request.count > MAX_TICKS {
                    conn.write_line(&format!("count exceeds {MAX_TICKS}")).await?;
                    return Ok(());
                }
                conn.write_line("").await?;
                conn.flush().await?;
                let (tx, mut rx) = mpsc::channel(16);
                let producer = tokio::spawn(produce_ticks(tx, request));
                let end = stream::serve_updates(
                    conn,
                    &mut rx,
                    &StreamOptions::default(),
                    || Tick {
                        sequence: 0,
                        heartbeat: true,
                        last: false,
                    },
                    |_: Tick| true,
                )
                .await;
                producer.abort();
                match end? {
                    StreamEnd::UpdatesClosed => Ok(()),
                    StreamEnd::PeerClosed => Err(Error::CloseClient),
                    StreamEnd::Stopped => Ok(()),
                }
            }
            .boxed()
        })
        .public(["Echo"])
}

async fn produce_ticks(tx: mpsc::Sender<Tick>, request: TickerRequest) {
    let mut interval = tokio::time::interval(Duration::from_millis(request.interval_ms.max(1)));
    for sequence in 1..=request.count {
        interval.tick().await;
        let tick = Tick {
            sequence,
            heartbeat: false,
            last: sequence == request.count,
        };
        if tx.send(tick).await.is_err() {
            debug!(sequence, "ticker receiver gone");
            return;
        }
    }
}
