//! The HTTP/1.0 side of SRPC: endpoint paths, request head parsing and the
//! bytes exchanged before a connection is handed to the call loop.

use crate::coder::Coder;
use crate::conn::BoxedStream;
use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub const BINARY_PATH: &str = "/_SRPC_/unsecured/binary";
pub const TLS_BINARY_PATH: &str = "/_SRPC_/TLS/binary";
pub const JSON_PATH: &str = "/_SRPC_/unsecured/JSON";
pub const TLS_JSON_PATH: &str = "/_SRPC_/TLS/JSON";
pub const HOSTNAME_PATH: &str = "/_SRPC_/getHostname";
pub const LIST_METHODS_PATH: &str = "/_SRPC_/listMethods";
pub const LIST_PUBLIC_METHODS_PATH: &str = "/_SRPC_/listPublicMethods";

/// Query parameter that disables certificate method powers for a connection.
pub const NO_METHOD_POWERS_PARAM: &str = "doNotUseMethodPowers";

/// Status line sent once a CONNECT request is accepted.
pub const CONNECT_ACK: &str = "HTTP/1.0 200 Connected to SRPC\n\n";

const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;

/// Path of the SRPC endpoint for a coder and transport.
pub fn rpc_path(coder: Coder, tls: bool) -> &'static str {
    match (coder, tls) {
        (Coder::Binary, false) => BINARY_PATH,
        (Coder::Binary, true) => TLS_BINARY_PATH,
        (Coder::Json, false) => JSON_PATH,
        (Coder::Json, true) => TLS_JSON_PATH,
    }
}

/// What a request path asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Rpc { coder: Coder, tls: bool },
    Hostname,
    ListMethods { public_only: bool },
}

impl Endpoint {
    pub(crate) fn from_path(path: &str) -> Option<Self> {
        Some(match path {
            BINARY_PATH => Endpoint::Rpc {
                coder: Coder::Binary,
                tls: false,
            },
            TLS_BINARY_PATH => Endpoint::Rpc {
                coder: Coder::Binary,
                tls: true,
            },
            JSON_PATH => Endpoint::Rpc {
                coder: Coder::Json,
                tls: false,
            },
            TLS_JSON_PATH => Endpoint::Rpc {
                coder: Coder::Json,
                tls: true,
            },
            HOSTNAME_PATH => Endpoint::Hostname,
            LIST_METHODS_PATH => Endpoint::ListMethods { public_only: false },
            LIST_PUBLIC_METHODS_PATH => Endpoint::ListMethods { public_only: true },
            _ => return None,
        })
    }
}

/// Parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RequestHead {
    pub(crate) fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Method powers stay on unless the caller opted out.
    pub(crate) fn allows_method_powers(&self) -> bool {
        self.query_value(NO_METHOD_POWERS_PARAM) != Some("true")
    }
}

pub(crate) fn parse_request(head: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::Http("incomplete request".into())),
        Err(e) => return Err(Error::Http(e.to_string())),
    }
    let method = req
        .method
        .ok_or_else(|| Error::Http("missing method".into()))?;
    let target = req.path.ok_or_else(|| Error::Http("missing path".into()))?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, Vec::new()),
    };
    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Status code of a response head, as read by a dialing client.
pub(crate) fn parse_status(head: &[u8]) -> Result<u16> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::Http("incomplete response".into())),
        Err(e) => return Err(Error::Http(e.to_string())),
    }
    resp.code
        .ok_or_else(|| Error::Http("missing status code".into()))
}

/// Read up to and including the blank line ending an HTTP head. Bytes read
/// past it are returned separately so they can be replayed.
pub(crate) async fn read_head<S>(stream: &mut S) -> Result<(Vec<u8>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf.to_vec(), rest.freeze()));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(Error::Http("HTTP head too large".into()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during HTTP exchange",
            )));
        }
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(i, &b)| {
        if b != b'\n' {
            return None;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") {
            Some(i + 2)
        } else if rest.starts_with(b"\r\n") {
            Some(i + 3)
        } else {
            None
        }
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

/// Write a complete plain-text response. The connection is not reused.
pub(crate) async fn write_response<S>(stream: &mut S, status: u16, body: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Put already-read bytes back in front of a stream.
pub(crate) fn rewind(stream: BoxedStream, prefix: Bytes) -> BoxedStream {
    if prefix.is_empty() {
        stream
    } else {
        Box::new(Rewind {
            prefix,
            inner: stream,
        })
    }
}

struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Fully qualified name of this host: `hostname -f`, falling back to the
/// kernel hostname.
pub(crate) async fn fqdn() -> std::result::Result<String, String> {
    if let Ok(output) = tokio::process::Command::new("hostname")
        .arg("-f")
        .output()
        .await
    {
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !name.is_empty() {
            return Ok(name);
        }
    }
    nix::unistd::gethostname()
        .map_err(|e| e.to_string())?
        .into_string()
        .map_err(|_| "hostname is not valid UTF-8".to_string())
}
