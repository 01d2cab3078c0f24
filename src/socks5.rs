use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio_rustls::TlsAcceptor;

use crate::demux::{MitmTarget, PeekStream, Protocol, detect_protocol, serve_http_connection};
use crate::error::ProxyCacheError;
use crate::humanfmt::HumanFmt;
use crate::mitm::dial_target;
use crate::{AppState, global_config};

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRTYPE_NOT_SUPPORTED: u8 = 0x08;

/// Terminates a SOCKS5 session on the unified listener.
///
/// Intercepted targets get a success reply followed by a protocol re-peek
/// of the tunneled stream and MITM processing; everything else is relayed
/// bidirectionally (directly or through the upstream proxy).
pub(crate) async fn serve<S>(
    mut stream: PeekStream<S>,
    local_addr: SocketAddr,
    client: SocketAddr,
    state: AppState,
) -> Result<(), ProxyCacheError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (host, port) = match negotiate(&mut stream).await {
        Ok(target) => target,
        Err(NegotiateError::Refuse(code, reason)) => {
            send_reply(&mut stream, code, None).await?;
            return Err(ProxyCacheError::Socks(reason));
        }
        Err(NegotiateError::NoAcceptableMethod) => {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
            return Err(ProxyCacheError::Socks("no acceptable authentication method"));
        }
        Err(NegotiateError::Protocol(reason)) => {
            return Err(ProxyCacheError::Socks(reason));
        }
        Err(NegotiateError::Io(err)) => {
            return Err(ProxyCacheError::Io(err));
        }
    };

    debug!(
        "SOCKS5 CONNECT of client {} to {host}:{port}",
        client.ip()
    );

    if global_config().host_intercepted(&host) {
        handle_intercepted(stream, local_addr, client, host, port, state).await
    } else {
        relay(stream, client, &host, port).await
    }
}

enum NegotiateError {
    /// Reply with this code, then close.
    Refuse(u8, &'static str),
    NoAcceptableMethod,
    /// Wire-level violation, close without replying.
    Protocol(&'static str),
    Io(std::io::Error),
}

impl From<std::io::Error> for NegotiateError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// RFC 1928 negotiation up to the parsed CONNECT target.
async fn negotiate<S>(stream: &mut S) -> Result<(String, u16), NegotiateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /* greeting: VER NMETHODS METHODS... */
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(NegotiateError::Protocol("unsupported SOCKS version"));
    }

    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    if nmethods > 0 {
        stream.read_exact(&mut methods).await?;
    }

    /* the proxy does not authenticate clients */
    if !methods.contains(&METHOD_NO_AUTH) {
        return Err(NegotiateError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    /* request: VER CMD RSV ATYP DST.ADDR DST.PORT */
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(NegotiateError::Protocol("unsupported SOCKS version"));
    }
    if request[1] != CMD_CONNECT {
        return Err(NegotiateError::Refuse(
            REP_COMMAND_NOT_SUPPORTED,
            "command not supported",
        ));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) if !name.is_empty() => name,
                _ => {
                    return Err(NegotiateError::Refuse(
                        REP_GENERAL_FAILURE,
                        "invalid domain name",
                    ));
                }
            }
        }
        _ => {
            return Err(NegotiateError::Refuse(
                REP_ADDRTYPE_NOT_SUPPORTED,
                "address type not supported",
            ));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    if port == 0 {
        return Err(NegotiateError::Refuse(
            REP_GENERAL_FAILURE,
            "invalid target port",
        ));
    }

    Ok((host, port))
}

/// Taps the tunneled stream: success reply first, then the same
/// byte-peeking protocol detection as the listener, with local TLS
/// termination when the client speaks TLS to its target.
async fn handle_intercepted<S>(
    mut stream: PeekStream<S>,
    local_addr: SocketAddr,
    client: SocketAddr,
    host: String,
    port: u16,
    state: AppState,
) -> Result<(), ProxyCacheError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    send_reply(&mut stream, REP_SUCCESS, Some(local_addr)).await?;

    /* bytes buffered during negotiation stay ahead of the tunnel */
    let (protocol, peeked) = detect_protocol(&mut stream).await?;
    let stream = PeekStream::new(stream, peeked);

    info!(
        "Intercepting SOCKS5 tunnel of client {} to {host}:{port} ({})",
        client.ip(),
        if protocol == Protocol::Tls { "TLS" } else { "plain" }
    );

    if protocol == Protocol::Tls {
        let tls_config = state.ca.server_config(&host)?;
        let acceptor = TlsAcceptor::from(tls_config);
        let tls_stream = acceptor.accept(stream).await?;

        let target = MitmTarget {
            scheme: "https",
            host,
            port,
        };
        serve_http_connection(tls_stream, client, state, Some(target)).await;
    } else {
        let target = MitmTarget {
            scheme: "http",
            host,
            port,
        };
        serve_http_connection(stream, client, state, Some(target)).await;
    }

    Ok(())
}

/// Transparent relay for non-intercepted targets, mapping dial failures
/// to the SOCKS5 reply codes.
async fn relay<S>(
    mut stream: PeekStream<S>,
    client: SocketAddr,
    host: &str,
    port: u16,
) -> Result<(), ProxyCacheError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();

    let mut target = match dial_target(host, port).await {
        Ok(t) => t,
        Err(err) => {
            send_reply(&mut stream, map_dial_error_to_reply(&err), None).await?;
            return Err(ProxyCacheError::Io(err));
        }
    };

    let bind_addr = target.local_addr().ok();
    send_reply(&mut stream, REP_SUCCESS, bind_addr).await?;

    let bufsize = global_config().buffer_size;
    let (from_client, from_server) =
        tokio::io::copy_bidirectional_with_sizes(&mut stream, &mut target, bufsize, bufsize)
            .await?;

    info!(
        "Relayed SOCKS5 client {} wrote {} and received {} from {host}:{port} in {}",
        client.ip(),
        HumanFmt::Size(from_client),
        HumanFmt::Size(from_server),
        HumanFmt::Time(start.elapsed())
    );

    Ok(())
}

#[must_use]
fn map_dial_error_to_reply(err: &std::io::Error) -> u8 {
    if err.kind() == std::io::ErrorKind::ConnectionRefused {
        return REP_CONNECTION_REFUSED;
    }

    if err.to_string().contains("unreachable") && err.to_string().contains("network") {
        return REP_NETWORK_UNREACHABLE;
    }

    REP_HOST_UNREACHABLE
}

/// Reply: VER REP RSV ATYP BND.ADDR BND.PORT.
async fn send_reply<S>(
    stream: &mut S,
    code: u8,
    bind_addr: Option<SocketAddr>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[SOCKS_VERSION, code, 0x00]);

    match bind_addr {
        Some(SocketAddr::V4(addr)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }

    stream.write_all(&reply).await?;
    stream.flush().await
}
