use std::time::Instant;

use build_html::{Container, ContainerType, Html, HtmlContainer, HtmlPage, Table};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue, RANGE, SERVER};
use hyper::{Request, Response, StatusCode};
use log::{debug, error, trace};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::config::DedupStrategy;
use crate::database::DownloadStatus;
use crate::fingerprint::compute_file_hash;
use crate::humanfmt::HumanFmt;
use crate::stream::serve_file_ranged;
use crate::{
    APP_NAME, APP_VERSION, AppState, ProxyCacheBody, RUNTIMEDETAILS, full, global_config,
    quick_response,
};

const WEBUI_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[day] [month repr:short] [year] [hour]:[minute]:[second]");

const RECENT_FILES_LIMIT: i64 = 50;

/// JSON status document for machine consumption.
#[must_use]
pub(crate) async fn serve_api_status(state: &AppState) -> Response<ProxyCacheBody> {
    let counts = match state.database.status_counts().await {
        Ok(c) => c,
        Err(err) => {
            error!("Failed to query record counts:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Status failure");
        }
    };

    let cache_bytes = match state.cache.total_complete_bytes().await {
        Ok(b) => b,
        Err(err) => {
            error!("Failed to compute cache size:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Status failure");
        }
    };

    let rd = RUNTIMEDETAILS.get().expect("global is set in main()");
    let uptime = (OffsetDateTime::now_utc() - rd.start_time).whole_seconds();

    let mut records = serde_json::Map::new();
    for (status, count) in counts {
        records.insert(status, serde_json::Value::from(count));
    }

    let document = serde_json::json!({
        "version": APP_VERSION,
        "uptime_seconds": uptime,
        "active_downloads": state.scheduler.active_count(),
        "records": records,
        "cache_bytes": cache_bytes,
        "cache_max_total_size": global_config().cache.max_total_size,
        "cache_max_file_size": global_config().cache.max_file_size,
    });

    let body = serde_json::to_vec(&document).expect("status document is serializable");

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(body))
        .expect("HTTP response is valid")
}

/// Human-readable status page with the most recently accessed records.
#[must_use]
pub(crate) async fn serve_status_page(state: &AppState) -> Response<ProxyCacheBody> {
    let start = Instant::now();

    let files = match state.database.recent_files(RECENT_FILES_LIMIT).await {
        Ok(f) => f,
        Err(err) => {
            error!("Failed to query recent files:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Status failure");
        }
    };

    let mut files_table = Table::new().with_header_row([
        "Fingerprint",
        "Filename",
        "Status",
        "Size",
        "Downloaded",
        "Last Accessed",
    ]);

    for file in files {
        let last_accessed_fmt = OffsetDateTime::from_unix_timestamp(file.last_accessed_at)
            .ok()
            .and_then(|ts| ts.format(WEBUI_DATE_FORMAT).ok())
            .unwrap_or_else(|| "N/A".to_string());

        let size_fmt = if file.file_size > 0 {
            format!(
                "{}",
                HumanFmt::Size(u64::try_from(file.file_size).unwrap_or(0))
            )
        } else {
            "unknown".to_string()
        };

        files_table.add_body_row([
            file.file_hash.chars().take(12).collect::<String>(),
            file.filename,
            file.download_status.to_string(),
            size_fmt,
            format!(
                "{}",
                HumanFmt::Size(u64::try_from(file.downloaded_bytes).unwrap_or(0))
            ),
            last_accessed_fmt,
        ]);
    }

    let rd = RUNTIMEDETAILS.get().expect("global is set in main()");

    let html: String = HtmlPage::new()
        .with_title(concat!(env!("CARGO_PKG_NAME"), " status"))
        .with_header(1, "Proxy Status")
        .with_container(
            Container::new(ContainerType::Div)
                .with_header(2, "Program Details")
                .with_paragraph(format!(
                    "Version: {}<br>Start Time: {}<br>Current Time: {}<br>Listen Address: {}<br>Active Downloads: {}",
                    APP_VERSION,
                    rd.start_time
                        .format(WEBUI_DATE_FORMAT)
                        .expect("timestamp should be formattable"),
                    OffsetDateTime::now_utc()
                        .format(WEBUI_DATE_FORMAT)
                        .expect("timestamp should be formattable"),
                    global_config().listen_address,
                    state.scheduler.active_count(),
                )),
        )
        .with_container(
            Container::new(ContainerType::Div)
                .with_header(2, "Cached Files")
                .with_paragraph("Most recently accessed records:")
                .with_table(files_table),
        )
        .with_container(
            Container::new(ContainerType::Footer).with_paragraph(format!(
                "<hr>All dates are in UTC.   --   Generated in {}.",
                HumanFmt::Time(start.elapsed())
            )),
        )
        .to_html_string();

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
        .body(full(html))
        .expect("HTTP response is valid");

    trace!("Status page response: {response:?}");

    response
}

/// `/cache/yt/<id>/{video,player}`: cache-id-addressed delivery of records
/// fingerprinted from `yt-dlp://<id>` (created by external tooling).
#[must_use]
pub(crate) async fn serve_cache_yt(
    req: &Request<Incoming>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    let path = req.uri().path();

    let Some(rest) = path.strip_prefix("/cache/yt/") else {
        return quick_response(StatusCode::NOT_FOUND, "Not Found");
    };
    let Some((video_id, action)) = rest.split_once('/') else {
        return quick_response(StatusCode::NOT_FOUND, "Not Found");
    };

    if video_id.len() < 6
        || !video_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return quick_response(StatusCode::NOT_FOUND, "Not Found");
    }

    let cache_url = format!("yt-dlp://{video_id}");
    let file_hash = compute_file_hash(&cache_url, "", DedupStrategy::FullUrl);

    let record = match state.database.get_file(&file_hash).await {
        Ok(Some(record)) => record,
        Ok(None) => return quick_response(StatusCode::NOT_FOUND, "Video not cached"),
        Err(err) => {
            error!("Failed to look up cached video {video_id}:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Cache Access Failure");
        }
    };

    debug!("Cache-id request for video {video_id} ({action})");

    match action {
        "video" => {
            if record.download_status != DownloadStatus::Complete {
                return quick_response(StatusCode::SERVICE_UNAVAILABLE, "Video still downloading");
            }

            let content_type = if record.content_type.is_empty() {
                "video/mp4"
            } else {
                &record.content_type
            };
            let range = req.headers().get(RANGE).and_then(|hv| hv.to_str().ok());

            serve_file_ranged(&record.saved_path, content_type, range).await
        }
        "player" => serve_video_player(video_id, &record),
        _ => quick_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Minimal HTML5 player page referencing the video route.
#[must_use]
fn serve_video_player(
    video_id: &str,
    record: &crate::database::FileRecord,
) -> Response<ProxyCacheBody> {
    let video_src = format!("/cache/yt/{video_id}/video");

    let status_note = match record.download_status {
        DownloadStatus::Complete => String::new(),
        DownloadStatus::Downloading => {
            r#"<p style="color:#f0ad4e;text-align:center;">Video is still downloading&hellip; Refresh later.</p>"#
                .to_string()
        }
        other => format!(
            r#"<p style="color:#d9534f;text-align:center;">Video status: {other}</p>"#
        ),
    };

    let content_type = if record.content_type.is_empty() {
        "video/mp4"
    } else {
        &record.content_type
    };

    let html = format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><meta name="viewport" content="width=device-width,initial-scale=1">
<title>{video_id} - Cached Video</title>
<style>*{{margin:0;padding:0;box-sizing:border-box}}html,body{{width:100%;height:100%;background:#000;overflow:hidden}}
video{{width:100%;height:100%;object-fit:contain}}</style></head>
<body>{status_note}<video controls autoplay><source src="{video_src}" type="{content_type}">Your browser does not support the video tag.</video></body></html>"#
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(html))
        .expect("HTTP response is valid")
}
