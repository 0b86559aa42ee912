//! Buffered, coder-bound connection shared by clients and servers.
//!
//! A [`Conn`] wraps any boxed async byte stream (TCP, TLS, Unix socket or an
//! in-memory pipe) in read and write buffers. The stream can be replaced in
//! place, which is how the same-host Unix socket upgrade re-homes a live connection.

use crate::auth::{AuthInformation, PermittedMethods};
use crate::coder::Coder;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter, ReadBuf,
};

/// Buffer size used once a connection has moved to a Unix socket.
pub const UNIX_BUFFER_SIZE: usize = 1 << 16;

/// Longest call or error line accepted.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed stream type held by a [`Conn`].
pub type BoxedStream = Box<dyn AsyncStream>;

/// Called when the current call completes, as returned by a service's block
/// hook.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

type Buffered = BufReader<BufWriter<BoxedStream>>;

/// Result of waiting for the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Buffered input is available.
    Readable,
    /// The peer closed its side.
    Closed,
}

/// One end of an SRPC connection.
pub struct Conn {
    stream: Buffered,
    coder: Coder,
    auth: AuthInformation,
    permitted_methods: Arc<PermittedMethods>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    encrypted: bool,
    release: Option<ReleaseFn>,
    mid_call: bool,
}

impl Conn {
    pub fn new(stream: BoxedStream, coder: Coder) -> Self {
        Self {
            stream: BufReader::new(BufWriter::new(stream)),
            coder,
            auth: AuthInformation::anonymous(),
            permitted_methods: Arc::new(PermittedMethods::none()),
            local_addr: None,
            remote_addr: None,
            encrypted: false,
            release: None,
            mid_call: false,
        }
    }

    pub(crate) fn with_addrs(
        mut self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    pub(crate) fn with_identity(
        mut self,
        auth: AuthInformation,
        permitted_methods: PermittedMethods,
    ) -> Self {
        self.auth = auth;
        self.permitted_methods = Arc::new(permitted_methods);
        self
    }

    pub(crate) fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Identity of the caller. Only meaningful on the server side.
    pub fn auth_information(&self) -> &AuthInformation {
        &self.auth
    }

    /// Username of the caller, empty if anonymous.
    pub fn username(&self) -> &str {
        &self.auth.username
    }

    pub(crate) fn permitted_methods(&self) -> &PermittedMethods {
        &self.permitted_methods
    }

    pub(crate) fn set_have_method_access(&mut self, have: bool) {
        self.auth.have_method_access = have;
    }

    pub fn coder(&self) -> Coder {
        self.coder
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Read one line without its terminator. `None` means the peer closed
    /// the stream before sending anything.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let n = (&mut self.stream)
            .take(MAX_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() > MAX_LINE_LENGTH {
                self.discard_line().await?;
                return Err(Error::Decode("line too long".into()));
            }
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            )));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| Error::Decode(e.to_string()))
    }

    /// Skip input up to and including the next newline.
    async fn discard_line(&mut self) -> Result<()> {
        loop {
            let (used, done) = {
                let buf = self.stream.fill_buf().await?;
                match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (buf.len(), buf.is_empty()),
                }
            };
            self.stream.consume(used);
            if done {
                return Ok(());
            }
        }
    }

    /// Write `line` followed by a newline. Not flushed.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        Ok(())
    }

    /// Write an error as a single status line. Not flushed.
    pub async fn write_error(&mut self, err: &Error) -> Result<()> {
        self.write_line(&error_line(err)).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Encode a value with the bound coder. Not flushed.
    ///
    /// The value is serialized before the returned future is polled, so the
    /// future holds no reference to it.
    pub fn encode<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> impl Future<Output = Result<()>> + Send + '_ {
        let frame = self.coder.to_frame(value);
        async move { self.write_frame(&frame?).await }
    }

    /// Write bytes produced by [`Coder::to_frame`]. Not flushed.
    pub(crate) async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await?;
        Ok(())
    }

    /// Decode a value with the bound coder.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T> {
        let coder = self.coder;
        coder.decode(&mut self.stream).await
    }

    /// Wait until the peer sends data or closes, without consuming input.
    ///
    /// Cancel-safe, so it can sit in a `select!` as a close notifier.
    pub async fn wait_readable(&mut self) -> io::Result<Readiness> {
        let buf = self.stream.fill_buf().await?;
        Ok(if buf.is_empty() {
            Readiness::Closed
        } else {
            Readiness::Readable
        })
    }

    /// Swap the underlying transport. Any buffered output is flushed to the
    /// old stream first; buffered input must already have been consumed.
    pub(crate) async fn replace_stream(&mut self, stream: BoxedStream) -> Result<()> {
        self.stream.flush().await?;
        if !self.stream.buffer().is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unread input pending on connection being replaced",
            )));
        }
        self.stream = BufReader::with_capacity(
            UNIX_BUFFER_SIZE,
            BufWriter::with_capacity(UNIX_BUFFER_SIZE, stream),
        );
        Ok(())
    }

    pub(crate) fn set_release(&mut self, release: Option<ReleaseFn>) {
        self.release = release;
    }

    /// Run and clear the pending release function, if any.
    pub(crate) fn call_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Mark that a call's replies may still be in flight.
    pub(crate) fn begin_exchange(&mut self) {
        self.mid_call = true;
    }

    pub(crate) fn end_exchange(&mut self) {
        self.mid_call = false;
    }

    /// Whether an earlier call was abandoned before its replies were read.
    pub(crate) fn is_mid_exchange(&self) -> bool {
        self.mid_call
    }
}

/// Render an error for a status line. Line breaks would end the line early
/// and leave the rest to be read as the next message.
pub(crate) fn error_line(err: &Error) -> String {
    err.to_string().replace(['\r', '\n'], " ")
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.call_release();
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("coder", &self.coder)
            .field("username", &self.auth.username)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("encrypted", &self.encrypted)
            .field("mid_call", &self.mid_call)
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncBufRead for Conn {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().stream).poll_fill_buf(cx)
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.stream).consume(amt)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
