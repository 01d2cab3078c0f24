use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::header::{HOST, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use log::{debug, warn};

use crate::mitm::{process_request, serve_from_assets};
use crate::{AppState, ProxyCacheBody, quick_response};

/// URL-path reverse proxy: interprets `/<scheme>://host/path?query`
/// request paths (optionally percent-encoded) as proxy requests for the
/// embedded URL and dispatches them like any intercepted request.
#[must_use]
pub(crate) async fn serve(
    client: SocketAddr,
    req: Request<Incoming>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    let decoded: String = match urlencoding::decode(req.uri().path()) {
        Ok(d) => d.into_owned(),
        Err(_) => req.uri().path().to_string(),
    };

    let embedded = decoded.strip_prefix('/').unwrap_or(&decoded);
    if embedded.is_empty() {
        return quick_response(StatusCode::BAD_REQUEST, "No target URL provided in path");
    }

    let target = match extract_target_url(embedded, req.uri().query()) {
        Ok(target) => target,
        Err(err) => {
            debug!(
                "Invalid reverse-proxy target from client {}: {err}",
                client.ip()
            );
            /* degenerate targets like /https:///favicon.ico fall back to assets */
            if let Some(response) = serve_from_assets(&decoded).await {
                return response;
            }
            return quick_response(StatusCode::NOT_FOUND, "Not Found");
        }
    };

    let (mut parts, body) = req.into_parts();

    parts.uri = match target.as_str().parse::<Uri>() {
        Ok(uri) => uri,
        Err(err) => {
            warn!("Reverse-proxy target `{target}` is not a valid URI:  {err}");
            return quick_response(StatusCode::BAD_REQUEST, "Invalid target URL");
        }
    };

    /* the upstream sees the embedded target's host */
    let authority = match (target.host_str(), target.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    if let Ok(hv) = HeaderValue::try_from(authority) {
        parts.headers.insert(HOST, hv);
    }

    debug!(
        "Reverse-proxy request of client {} for `{target}`",
        client.ip()
    );

    process_request(client, Request::from_parts(parts, body), state).await
}

/// Parses the embedded URL and merges outer query parameters into it.
/// Parameters of the embedded URL take precedence; outer parameters that
/// do not collide are appended.
fn extract_target_url(
    embedded: &str,
    outer_query: Option<&str>,
) -> Result<url::Url, &'static str> {
    let mut target = url::Url::parse(embedded).map_err(|_| "unparseable URL")?;

    if target.host_str().map_or(true, str::is_empty) {
        return Err("URL has no host");
    }
    if target.cannot_be_a_base() {
        return Err("URL has no authority");
    }

    let outer_query = outer_query.unwrap_or_default();
    if !outer_query.is_empty() {
        let embedded_pairs: Vec<(String, String)> = target
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut merged = embedded_pairs.clone();
        for (key, value) in url::form_urlencoded::parse(outer_query.as_bytes()) {
            if !embedded_pairs.iter().any(|(k, _)| *k == key) {
                merged.push((key.into_owned(), value.into_owned()));
            }
        }

        if merged.is_empty() {
            target.set_query(None);
        } else {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(merged.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            target.set_query(Some(&query));
        }
    }

    Ok(target)
}
