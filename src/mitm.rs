use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use hyper::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_TYPE, COOKIE, HOST, HeaderValue, RANGE, SERVER,
    TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::config::{UpstreamKind, UpstreamProxy};
use crate::demux::MitmTarget;
use crate::error::ProxyCacheError;
use crate::fingerprint::extract_filename;
use crate::humanfmt::HumanFmt;
use crate::stream::serve_cache_entry;
use crate::{APP_NAME, APP_USER_AGENT, AppState, ProxyCacheBody, full, global_config, quick_response};

/// Forward-proxy entry point: CONNECT tunnels and absolute-form requests.
#[must_use]
pub(crate) async fn handle_request(
    client: SocketAddr,
    req: Request<Incoming>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    if req.method() == Method::CONNECT {
        return handle_connect(client, req, state);
    }

    /* origin-form or degenerate URLs (e.g. https:///favicon.ico) cannot be
     * proxied; try the static assets fallback */
    if req.uri().scheme().is_none() || req.uri().host().map_or(true, str::is_empty) {
        let path = req.uri().path().to_string();
        if let Some(response) = serve_from_assets(&path).await {
            return response;
        }
        return quick_response(StatusCode::NOT_FOUND, "Not Found");
    }

    if !global_config().proxy_mode.http_enabled() {
        return quick_response(StatusCode::FORBIDDEN, "HTTP proxying disabled");
    }

    process_request(client, req, state).await
}

/// Requests read from a decrypted CONNECT or SOCKS5 tunnel: rewrite them
/// to the tunnel target before processing.
#[must_use]
pub(crate) async fn process_tunneled_request(
    client: SocketAddr,
    req: Request<Incoming>,
    target: &MitmTarget,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", hyper::http::uri::PathAndQuery::as_str);

    let authority = target.authority();
    let uri = Uri::builder()
        .scheme(target.scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build();

    match uri {
        Ok(uri) => parts.uri = uri,
        Err(err) => {
            warn!("Failed to normalize tunneled request URI:  {err}");
            return quick_response(StatusCode::BAD_REQUEST, "Invalid request target");
        }
    }

    if !parts.headers.contains_key(HOST) {
        if let Ok(hv) = HeaderValue::try_from(authority.as_str()) {
            parts.headers.insert(HOST, hv);
        }
    }

    process_request(client, Request::from_parts(parts, body), state).await
}

/// Shared processor for all intercepted plaintext requests: rule match,
/// then cache/stream path or transparent forward.
#[must_use]
pub(crate) async fn process_request(
    client: SocketAddr,
    req: Request<Incoming>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    let url = req.uri().to_string();

    let Some(rule) = global_config().find_rule(&url) else {
        return forward_transparent(client, req, state).await;
    };

    let cookie = match req.headers().get(COOKIE).and_then(|hv| hv.to_str().ok()) {
        Some(c) => c.to_string(),
        None => rule.request_cookie.clone(),
    };

    let filename = extract_filename(req.uri().path()).to_string();

    let record = match state
        .cache
        .get_or_create(&url, &cookie, &filename, rule.dedup_strategy)
        .await
    {
        Ok(record) => record,
        Err(err) => {
            error!("Failed to get or create cache record for `{url}`:  {err}");
            return forward_transparent(client, req, state).await;
        }
    };

    debug!(
        "Request of client {} for `{url}` mapped to cache entry {} ({})",
        client.ip(),
        record.file_hash,
        record.download_status
    );

    let range = req
        .headers()
        .get(RANGE)
        .and_then(|hv| hv.to_str().ok())
        .map(str::to_string);

    serve_cache_entry(client, record, range.as_deref(), state).await
}

/// CONNECT: MITM-terminate intercepted hosts, tunnel everything else.
#[must_use]
fn handle_connect(
    client: SocketAddr,
    req: Request<Incoming>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    if !global_config().proxy_mode.http_enabled() {
        return quick_response(StatusCode::FORBIDDEN, "HTTP proxying disabled");
    }

    let Some((host, port)) = req
        .uri()
        .authority()
        .map(|a| (a.host().to_string(), a.port_u16().unwrap_or(443)))
    else {
        warn!("Invalid CONNECT address: {}", req.uri());
        return quick_response(StatusCode::BAD_REQUEST, "Invalid CONNECT address");
    };

    let intercept = global_config().host_intercepted(&host);
    let state = state.clone();

    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if intercept {
                    mitm_terminate(client, upgraded, host, port, state).await;
                } else if let Err(err) = tunnel(client, upgraded, &host, port).await {
                    if err.kind() == std::io::ErrorKind::NotConnected
                        || err.kind() == std::io::ErrorKind::ConnectionReset
                    {
                        info!(
                            "Tunnel for client {} to {host}:{port} ended:  {err}",
                            client.ip()
                        );
                    } else {
                        error!(
                            "Error tunneling connection for client {} to {host}:{port}:  {err}",
                            client.ip()
                        );
                    }
                }
            }
            Err(err) => error!(
                "Error upgrading connection for client {} to {host}:{port}:  {err}",
                client.ip()
            ),
        }
    });

    /*
     * The 200 Connection Established response with an empty body; only
     * after the client received it can the connection be upgraded.
     */
    let mut response = Response::new(crate::empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(
            b"Connection Established",
        ));
    response
}

/// Drives a TLS server handshake with a freshly minted leaf for `host`
/// and re-enters the HTTP loop on the decrypted stream.
async fn mitm_terminate(
    client: SocketAddr,
    upgraded: hyper::upgrade::Upgraded,
    host: String,
    port: u16,
    state: AppState,
) {
    let tls_config = match state.ca.server_config(&host) {
        Ok(c) => c,
        Err(err) => {
            error!("Failed to mint certificate for `{host}`:  {err}");
            return;
        }
    };

    let acceptor = TlsAcceptor::from(tls_config);
    match acceptor.accept(TokioIo::new(upgraded)).await {
        Ok(tls_stream) => {
            info!(
                "Intercepting TLS session of client {} to {host}:{port}",
                client.ip()
            );
            let target = MitmTarget {
                scheme: "https",
                host,
                port,
            };
            crate::demux::serve_http_connection(tls_stream, client, state, Some(target)).await;
        }
        Err(err) => {
            info!(
                "MITM TLS handshake with client {} for `{host}` failed:  {err}",
                client.ip()
            );
        }
    }
}

/// Create a TCP connection to host:port (directly or through the
/// configured upstream proxy) and shuttle bytes between it and the
/// upgraded client connection.
async fn tunnel(
    client: SocketAddr,
    upgraded: hyper::upgrade::Upgraded,
    host: &str,
    port: u16,
) -> std::io::Result<()> {
    let start = Instant::now();

    let mut server = dial_target(host, port).await?;
    let mut upgraded = TokioIo::new(upgraded);

    let bufsize = global_config().buffer_size;
    let (from_client, from_server) =
        tokio::io::copy_bidirectional_with_sizes(&mut upgraded, &mut server, bufsize, bufsize)
            .await?;

    info!(
        "Tunneled client {} wrote {} and received {} from {host}:{port} in {}",
        client.ip(),
        HumanFmt::Size(from_client),
        HumanFmt::Size(from_server),
        HumanFmt::Time(start.elapsed())
    );

    Ok(())
}

/// Dials `host:port`, relaying through the configured upstream proxy when
/// one is set.
pub(crate) async fn dial_target(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let config = global_config();

    let dial = async {
        match config.upstream() {
            None => TcpStream::connect((host, port)).await,
            Some(proxy) => dial_via_upstream(proxy, host, port).await,
        }
    };

    match tokio::time::timeout(config.connect_timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connection to {host}:{port} timed out"),
        )),
    }
}

async fn dial_via_upstream(
    proxy: &UpstreamProxy,
    host: &str,
    port: u16,
) -> std::io::Result<TcpStream> {
    match proxy.kind {
        UpstreamKind::Socks5 => {
            let stream = tokio_socks::tcp::Socks5Stream::connect(
                (proxy.host.as_str(), proxy.port),
                (host, port),
            )
            .await
            .map_err(std::io::Error::other)?;
            Ok(stream.into_inner())
        }
        UpstreamKind::Http => {
            let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
            http_connect_handshake(&mut stream, host, port).await?;
            Ok(stream)
        }
    }
}

/// Plain-bytes CONNECT handshake with an HTTP upstream proxy.
async fn http_connect_handshake(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> std::io::Result<()> {
    let request =
        format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = [0u8; 1024];
    let mut pos = 0;
    loop {
        let n = stream.read(&mut buf[pos..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream proxy closed connection during handshake",
            ));
        }
        pos += n;

        if buf[..pos].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if pos >= buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upstream proxy handshake response too large",
            ));
        }
    }

    if !(buf[..pos].starts_with(b"HTTP/1.1 200") || buf[..pos].starts_with(b"HTTP/1.0 200")) {
        let first_line = buf[..pos].split(|&b| b == b'\n').next().unwrap_or(&[]);
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!(
                "upstream proxy CONNECT failed: {}",
                String::from_utf8_lossy(first_line).trim()
            ),
        ));
    }

    Ok(())
}

/// Forwards a non-intercepted request upstream. `Accept-Encoding` is
/// stripped so downstream response filters can operate on plain bodies.
#[must_use]
pub(crate) async fn forward_transparent(
    client: SocketAddr,
    req: Request<Incoming>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    let request_path = req.uri().path().to_string();
    let requested_host = req.uri().host().unwrap_or_default().to_string();

    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    parts.headers.remove(ACCEPT_ENCODING);
    parts
        .headers
        .insert(USER_AGENT, HeaderValue::from_static(APP_USER_AGENT));

    debug!(
        "Forwarding request of client {} for host {requested_host} (without caching)",
        client.ip()
    );

    let result = if global_config().upstream().is_some() {
        forward_via_upstream(Request::from_parts(parts, body), state).await
    } else {
        let boxed = Request::from_parts(parts, body.map_err(ProxyCacheError::Hyper).boxed());
        state
            .https_client
            .request(boxed)
            .await
            .map(|resp| {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, body.map_err(ProxyCacheError::Hyper).boxed())
            })
            .map_err(ProxyCacheError::HyperUtil)
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            warn!(
                "Proxy request of client {} to host {requested_host} failed:  {err}",
                client.ip()
            );
            if let Some(response) = serve_from_assets(&request_path).await {
                return response;
            }
            quick_response(StatusCode::BAD_GATEWAY, "Proxy request failed")
        }
    }
}

/// One-shot forward through the configured upstream proxy: a manual dial,
/// an optional client-side TLS handshake, then a plain HTTP/1.1 exchange.
async fn forward_via_upstream(
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<ProxyCacheBody>, ProxyCacheError> {
    let uri = req.uri().clone();
    let is_tls = uri.scheme_str() == Some("https");
    let host = uri
        .host()
        .ok_or_else(|| ProxyCacheError::InvalidUri(uri.to_string()))?
        .to_string();
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let upstream = global_config()
        .upstream()
        .expect("caller checked that an upstream proxy is configured");

    /* an HTTP upstream proxy speaks absolute-form itself for plain HTTP */
    let via_absolute_form = upstream.kind == UpstreamKind::Http && !is_tls;

    let stream = if via_absolute_form {
        TcpStream::connect((upstream.host.as_str(), upstream.port)).await?
    } else {
        dial_via_upstream(upstream, &host, port).await?
    };

    let (mut parts, body) = req.into_parts();
    if !via_absolute_form {
        /* origin-form towards the target server */
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", hyper::http::uri::PathAndQuery::as_str);
        parts.uri = path_and_query
            .parse::<Uri>()
            .map_err(|_| ProxyCacheError::InvalidUri(path_and_query.to_string()))?;
    }
    if !parts.headers.contains_key(HOST) {
        if let Ok(hv) = HeaderValue::try_from(host.as_str()) {
            parts.headers.insert(HOST, hv);
        }
    }
    let request = Request::from_parts(parts, body.map_err(ProxyCacheError::Hyper).boxed());

    let response = if is_tls {
        let connector = tokio_rustls::TlsConnector::from(Arc::clone(&state.tls_client));
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| ProxyCacheError::InvalidUri(host.clone()))?;
        let tls_stream = connector.connect(server_name, stream).await?;
        send_on_connection(tls_stream, request).await?
    } else {
        send_on_connection(stream, request).await?
    };

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(
        parts,
        body.map_err(ProxyCacheError::Hyper).boxed(),
    ))
}

async fn send_on_connection<S>(
    stream: S,
    request: Request<ProxyCacheBody>,
) -> Result<Response<Incoming>, ProxyCacheError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::task::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Forward connection ended:  {err}");
        }
    });

    Ok(sender.send_request(request).await?)
}

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
    headers.remove(UPGRADE);
    headers.remove("te");
    headers.remove("trailer");
    headers.remove(TRANSFER_ENCODING);
}

/// Serves the URL's last path segment from the configured assets
/// directory, guarding against path traversal. Returns `None` when the
/// directory or file does not exist.
pub(crate) async fn serve_from_assets(request_path: &str) -> Option<Response<ProxyCacheBody>> {
    let assets_dir = &global_config().assets_dir;

    let mut filename = extract_filename(request_path);
    if filename.is_empty() {
        filename = "index.html";
    }

    let assets_root = tokio::fs::canonicalize(assets_dir).await.ok()?;
    let candidate: PathBuf = assets_root.join(filename);
    let candidate = tokio::fs::canonicalize(&candidate).await.ok()?;
    if !candidate.starts_with(&assets_root) {
        warn!("Rejecting assets lookup escaping `{}`", assets_root.display());
        return None;
    }

    let content = tokio::fs::read(&candidate).await.ok()?;

    debug!("Serving asset `{}`", candidate.display());

    let content_type = match candidate.extension().and_then(|ext| ext.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    };

    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, HeaderValue::from_static(content_type))
            .header(SERVER, HeaderValue::from_static(APP_NAME))
            .body(full(content))
            .expect("HTTP response is valid"),
    )
}
