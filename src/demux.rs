use std::error::Error as _;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf as _, Bytes, BytesMut};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, trace};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::error::ProxyCacheError;
use crate::{AppState, ProxyCacheBody, global_config, mitm, reverse, socks5, web_interface};

const PEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol selected from the first bytes of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protocol {
    Socks5,
    Tls,
    Http,
    Unknown,
}

/// Stream wrapper replaying already-peeked bytes in FIFO order before
/// handing reads through to the inner stream. Writes pass through.
#[derive(Debug)]
pub(crate) struct PeekStream<S> {
    inner: S,
    buffer: Bytes,
}

impl<S> PeekStream<S> {
    #[must_use]
    pub(crate) fn new(inner: S, buffer: Bytes) -> Self {
        Self { inner, buffer }
    }

    #[must_use]
    pub(crate) fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.buffer.is_empty() {
            let n = std::cmp::min(self.buffer.len(), buf.remaining());
            buf.put_slice(&self.buffer[..n]);
            self.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Reads the first bytes of a stream and classifies the protocol.
/// The consumed bytes are returned for replay through [`PeekStream`].
pub(crate) async fn detect_protocol<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<(Protocol, Bytes)> {
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(PEEK_TIMEOUT, stream.read(&mut first))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    if n == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
    }

    let mut peeked = BytesMut::with_capacity(4);
    peeked.extend_from_slice(&first);

    /* SOCKS5 version byte */
    if first[0] == 0x05 {
        return Ok((Protocol::Socks5, peeked.freeze()));
    }

    /* TLS handshake record type */
    if first[0] == 0x16 {
        return Ok((Protocol::Tls, peeked.freeze()));
    }

    /* one more read for HTTP method detection */
    let mut more = [0u8; 3];
    if let Ok(Ok(m)) = tokio::time::timeout(PEEK_TIMEOUT, stream.read(&mut more)).await {
        peeked.extend_from_slice(&more[..m]);
    }

    let protocol = if peeked.len() >= 4
        && matches!(
            &peeked[..4],
            b"GET " | b"POST" | b"CONN" | b"HEAD" | b"PUT "
        ) {
        Protocol::Http
    } else {
        Protocol::Unknown
    };

    Ok((protocol, peeked.freeze()))
}

/// Fixed target of a decrypted MITM stream: requests read from it are
/// rewritten to this scheme and authority before processing.
#[derive(Clone, Debug)]
pub(crate) struct MitmTarget {
    pub(crate) scheme: &'static str,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl MitmTarget {
    /// Authority with the scheme's default port omitted and IPv6
    /// addresses bracketed.
    #[must_use]
    pub(crate) fn authority(&self) -> String {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');

        let default_port = match self.scheme {
            "https" => 443,
            _ => 80,
        };

        let bracketed = if host.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{host}]")
        } else {
            host.to_string()
        };

        if self.port != 0 && self.port != default_port {
            format!("{bracketed}:{}", self.port)
        } else {
            bracketed
        }
    }
}

/// Dispatches one accepted connection by its first bytes.
pub(crate) async fn handle_connection(mut stream: TcpStream, client: SocketAddr, state: AppState) {
    let (protocol, peeked) = match detect_protocol(&mut stream).await {
        Ok(v) => v,
        Err(err) => {
            debug!(
                "Failed to detect protocol for client {}:  {err}",
                client.ip()
            );
            return;
        }
    };

    trace!("Detected {protocol:?} connection from client {}", client.ip());

    let stream = PeekStream::new(stream, peeked);

    match protocol {
        Protocol::Socks5 => {
            if !global_config().proxy_mode.socks5_enabled() {
                debug!(
                    "Rejecting SOCKS5 connection from client {}: disabled by proxy_mode",
                    client.ip()
                );
                return;
            }
            let local_addr = stream
                .get_ref()
                .local_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
            if let Err(err) = socks5::serve(stream, local_addr, client, state).await {
                info!("SOCKS5 session of client {} ended:  {err}", client.ip());
            }
        }
        Protocol::Tls => {
            let acceptor = TlsAcceptor::from(state.sni_tls.clone());
            match acceptor.accept(stream).await {
                Ok(tls_stream) => serve_http_connection(tls_stream, client, state, None).await,
                Err(err) => {
                    info!("TLS handshake with client {} failed:  {err}", client.ip());
                }
            }
        }
        Protocol::Http => serve_http_connection(stream, client, state, None).await,
        Protocol::Unknown => {
            debug!("Closing connection of unknown protocol from {}", client.ip());
        }
    }
}

/// Keep-alive HTTP/1.1 loop over an arbitrary byte stream. hyper handles
/// `Connection: close`, HTTP/1.0, chunked framing and CONNECT upgrades.
/// With `target` set, every request is normalized to that authority and
/// fed to the MITM request processor (decrypted tunnel mode).
pub(crate) async fn serve_http_connection<S>(
    stream: S,
    client: SocketAddr,
    state: AppState,
    target: Option<MitmTarget>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let target = target.clone();
        async move {
            Ok::<_, ProxyCacheError>(handle_demuxed_request(client, req, state, target).await)
        }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        if err.is_incomplete_message() || is_connection_reset(&err) {
            info!("Connection to client {} cancelled", client.ip());
        } else if is_shutdown_disconnect(&err) || is_broken_pipe(&err) {
            info!(
                "Improper connection shutdown for client {}:  {err}",
                client.ip()
            );
        } else {
            error!(
                "Error serving connection for client {}:  {err} -- {err:?}",
                client.ip()
            );
        }
    }
}

async fn handle_demuxed_request(
    client: SocketAddr,
    req: Request<Incoming>,
    state: AppState,
    target: Option<MitmTarget>,
) -> Response<ProxyCacheBody> {
    trace!("Incoming request: {req:?}");

    match target {
        Some(target) => mitm::process_tunneled_request(client, req, &target, &state).await,
        None => route_request(client, req, &state).await,
    }
}

/// Path-based routing inside the HTTP loop.
async fn route_request(
    client: SocketAddr,
    req: Request<Incoming>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    let path = req.uri().path().to_string();

    if path == "/api/status" || path == "/api/status/" {
        return web_interface::serve_api_status(state).await;
    }
    if path == "/status" || path == "/status/" {
        return web_interface::serve_status_page(state).await;
    }
    if path.starts_with("/cache/yt/") {
        return web_interface::serve_cache_yt(&req, state).await;
    }

    /* URL-path reverse proxy: /https://origin/... (possibly percent-encoded) */
    let decoded = match urlencoding::decode(&path) {
        Ok(d) => d.into_owned(),
        Err(_) => path,
    };
    if (decoded.starts_with("/http://") || decoded.starts_with("/https://"))
        && global_config().proxy_mode.url_path_enabled()
    {
        return reverse::serve(client, req, state).await;
    }

    mitm::handle_request(client, req, state).await
}

#[must_use]
fn is_iokind(err: &hyper::Error, kind: std::io::ErrorKind) -> bool {
    if let Some(err) = err.source() {
        if let Some(ioerr) = err.downcast_ref::<std::io::Error>() {
            if ioerr.kind() == kind {
                return true;
            }
        }
    }

    false
}

#[must_use]
fn is_connection_reset(err: &hyper::Error) -> bool {
    is_iokind(err, std::io::ErrorKind::ConnectionReset)
}

#[must_use]
fn is_shutdown_disconnect(err: &hyper::Error) -> bool {
    is_iokind(err, std::io::ErrorKind::NotConnected)
}

#[must_use]
fn is_broken_pipe(err: &hyper::Error) -> bool {
    is_iokind(err, std::io::ErrorKind::BrokenPipe)
}
