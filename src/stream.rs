use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::Poll::Ready;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::TryStreamExt as _;
use http_body_util::{BodyExt as _, StreamBody};
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderValue, LAST_MODIFIED, SERVER,
};
use hyper::{Response, StatusCode};
use log::{error, info, warn};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio_util::io::ReaderStream;

use crate::database::{Database, DownloadStatus, FileRecord};
use crate::error::ProxyCacheError;
use crate::http_range::{RangeOutcome, http_evaluate_range, systemtime_to_http_datetime};
use crate::humanfmt::HumanFmt;
use crate::{APP_NAME, AppState, ProxyCacheBody, global_config, quick_response};

/// Priority used for downloads admitted on behalf of a live client.
pub(crate) const STREAM_PRIORITY: i32 = 100;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const METADATA_POLL_ROUNDS: u32 = 20;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Serves a cache entry to one response: complete entries directly from
/// disk, failed ones as the recorded upstream error, anything else by
/// tapping the (possibly freshly started) background download.
#[must_use]
pub(crate) async fn serve_cache_entry(
    client: SocketAddr,
    record: FileRecord,
    range: Option<&str>,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    match record.download_status {
        DownloadStatus::Complete => {
            let content_type = if record.content_type.is_empty() {
                FALLBACK_CONTENT_TYPE
            } else {
                &record.content_type
            };
            info!(
                "Serving cached file {} ({}) for client {}",
                record.filename,
                record.file_hash,
                client.ip()
            );
            serve_file_ranged(&record.saved_path, content_type, range).await
        }
        DownloadStatus::Failed => serve_failed(&state.database, &record.file_hash).await,
        DownloadStatus::Pending | DownloadStatus::Downloading | DownloadStatus::Paused => {
            serve_streaming(client, record, state).await
        }
    }
}

/// Serves an on-disk file with single-range support.
/// Unsatisfiable ranges are refused with 416; malformed ones fall back to
/// the full representation.
#[must_use]
pub(crate) async fn serve_file_ranged(
    path: &str,
    content_type: &str,
    range: Option<&str>,
) -> Response<ProxyCacheBody> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(err) => {
            error!("Error opening cached file `{path}`:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Cache Access Failure");
        }
    };

    let metadata = match file.metadata().await {
        Ok(md) => md,
        Err(err) => {
            error!("Error getting metadata of cached file `{path}`:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Cache Access Failure");
        }
    };

    let file_size = metadata.len();
    let modification_date = metadata
        .modified()
        .expect("platform should support modification time");

    let buf_size = global_config().buffer_size;

    let (http_status, content_length, content_range) = match http_evaluate_range(range, file_size) {
        RangeOutcome::Partial {
            content_range,
            start,
            length,
        } => {
            if let Err(err) = file.seek(std::io::SeekFrom::Start(start)).await {
                error!("Error seeking cached file `{path}` to {start}/{file_size}:  {err}");
                return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Cache Access Failure");
            }
            (
                StatusCode::PARTIAL_CONTENT,
                length,
                Some(content_range),
            )
        }
        RangeOutcome::Unsatisfiable => {
            let mut response = quick_response(
                StatusCode::RANGE_NOT_SATISFIABLE,
                "Requested Range Not Satisfiable",
            );
            response.headers_mut().insert(
                CONTENT_RANGE,
                HeaderValue::try_from(format!("bytes */{file_size}"))
                    .expect("content range string is valid"),
            );
            return response;
        }
        RangeOutcome::Full => (StatusCode::OK, file_size, None),
    };

    let reader_stream = ReaderStream::with_capacity(file.take(content_length), buf_size);
    let boxed_body = http_body_util::BodyExt::map_err(
        StreamBody::new(reader_stream.map_ok(Frame::data)),
        ProxyCacheError::Io,
    )
    .boxed();

    let mut response = Response::builder()
        .status(http_status)
        .header(CONTENT_LENGTH, HeaderValue::from(content_length))
        .header(
            CONTENT_TYPE,
            HeaderValue::try_from(content_type).unwrap_or(HeaderValue::from_static(
                FALLBACK_CONTENT_TYPE,
            )),
        )
        .header(
            LAST_MODIFIED,
            HeaderValue::try_from(systemtime_to_http_datetime(modification_date))
                .expect("date string is valid"),
        )
        .header(ACCEPT_RANGES, HeaderValue::from_static("bytes"))
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(boxed_body)
        .expect("HTTP response is valid");

    if let Some(cr) = content_range {
        response.headers_mut().insert(
            CONTENT_RANGE,
            cr.try_into().expect("content range string is valid"),
        );
    }

    response
}

/// Replies with the upstream failure recorded for this hash: the original
/// status code when the log message carries one, 502 otherwise.
#[must_use]
pub(crate) async fn serve_failed(database: &Database, file_hash: &str) -> Response<ProxyCacheBody> {
    let entry = match database.latest_error_log(file_hash).await {
        Ok(e) => e,
        Err(err) => {
            error!("Failed to look up failure log for {file_hash}:  {err}");
            None
        }
    };

    let (status, message) = match entry {
        Some(entry) => {
            let status = parse_error_status(&entry.message).unwrap_or(StatusCode::BAD_GATEWAY);
            let message = entry
                .message
                .strip_prefix("Download failed: ")
                .unwrap_or(&entry.message)
                .to_string();
            (status, message)
        }
        None => (StatusCode::BAD_GATEWAY, "Download failed".to_string()),
    };

    quick_response(status, message)
}

/// Extracts the upstream status code from a failure message of the form
/// `... unexpected status code: NNN ...`.
#[must_use]
fn parse_error_status(message: &str) -> Option<StatusCode> {
    let (_, tail) = message.split_once("unexpected status code:")?;
    let digits: String = tail
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();

    StatusCode::from_u16(digits.parse().ok()?).ok()
}

#[must_use]
async fn serve_streaming(
    client: SocketAddr,
    record: FileRecord,
    state: &AppState,
) -> Response<ProxyCacheBody> {
    /* page out lower-priority work only when this request actually has to
     * start or resume a download */
    let needs_start = !matches!(
        state.scheduler.task_status(&record.file_hash),
        Some(DownloadStatus::Downloading | DownloadStatus::Complete)
    );
    if needs_start {
        state.scheduler.pause_below(STREAM_PRIORITY);
    }
    let task = state.scheduler.start_or_resume(
        &record,
        &record.original_url,
        &record.request_cookie,
        STREAM_PRIORITY,
    );

    /* bytes already on disk can be served even if the start times out */
    let snap = match tokio::fs::metadata(&record.saved_path).await {
        Ok(md) => md.len(),
        Err(_) => 0,
    };

    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        match task.status() {
            DownloadStatus::Failed => {
                if snap == 0 {
                    return serve_failed(&state.database, &record.file_hash).await;
                }
                break;
            }
            DownloadStatus::Downloading | DownloadStatus::Complete => break,
            DownloadStatus::Pending | DownloadStatus::Paused => {
                if Instant::now() >= deadline {
                    if snap > 0 {
                        break;
                    }
                    warn!(
                        "Timeout waiting for download of `{}` to start",
                        record.original_url
                    );
                    return quick_response(
                        StatusCode::GATEWAY_TIMEOUT,
                        "Timeout waiting for download to start",
                    );
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        }
    }

    /* wait (bounded) for the upstream response headers to be parsed */
    let mut file_size = 0;
    let mut content_type = String::new();
    for _ in 0..METADATA_POLL_ROUNDS {
        if task.status() == DownloadStatus::Failed && snap == 0 {
            return serve_failed(&state.database, &record.file_hash).await;
        }

        let (fs, ct, _downloaded) = task.metadata();
        if !ct.is_empty() {
            file_size = fs;
            content_type = ct;
            break;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    if task.status() == DownloadStatus::Failed && snap == 0 {
        return serve_failed(&state.database, &record.file_hash).await;
    }
    if content_type.is_empty() {
        content_type = FALLBACK_CONTENT_TYPE.to_string();
    }

    info!(
        "Streaming file {} ({}) for client {} while downloading...",
        record.filename,
        record.file_hash,
        client.ip()
    );

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, ProxyCacheError>>(64);

    let mut progress = task.subscribe();
    let pump_task = Arc::clone(&task);
    let saved_path = PathBuf::from(&record.saved_path);
    let filename = record.filename.clone();
    let buf_size = global_config().buffer_size;

    tokio::task::spawn(async move {
        let start = Instant::now();
        let mut sent: u64 = 0;
        let mut finished = false;
        let mut file: Option<tokio::fs::File> = None;

        loop {
            if file.is_none() {
                match tokio::fs::File::open(&saved_path).await {
                    Ok(f) => file = Some(f),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                    Err(err) => {
                        error!("Error opening streamed file `{}`:  {err}", saved_path.display());
                        return;
                    }
                }
            }

            /* drain whatever is on disk past our cursor */
            if let Some(f) = file.as_mut() {
                loop {
                    let mut buf = bytes::BytesMut::with_capacity(buf_size);
                    let n = match f.read_buf(&mut buf).await {
                        Ok(n) if n > 0 => n,
                        Ok(_) => break,
                        Err(err) => {
                            error!(
                                "Error reading streamed file `{}`:  {err}",
                                saved_path.display()
                            );
                            return;
                        }
                    };
                    sent += n as u64;

                    if tx.send(Ok(buf.freeze())).await.is_err() {
                        /* client disconnected, the download continues */
                        info!("Receiver of streamed file closed; stopping delivery");
                        return;
                    }
                }
            }

            if finished {
                break;
            }

            match progress.changed().await {
                Ok(()) => (),
                Err(_) => {
                    /* sender dropped: the worker reached a terminal state */
                    match pump_task.status() {
                        DownloadStatus::Complete => finished = true,
                        DownloadStatus::Failed => {
                            let _ = tx
                                .send(Err(ProxyCacheError::Io(std::io::Error::other(
                                    "upstream download failed",
                                ))))
                                .await;
                            return;
                        }
                        other => {
                            error!(
                                "Invalid terminal download state {other} for `{}`",
                                saved_path.display()
                            );
                            return;
                        }
                    }
                }
            }
        }

        info!(
            "Served streamed file {} for client {} in {} (size={})",
            filename,
            client.ip(),
            HumanFmt::Time(start.elapsed()),
            HumanFmt::Size(sent)
        );
    });

    let mut response_builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            HeaderValue::try_from(content_type.as_str()).unwrap_or(HeaderValue::from_static(
                FALLBACK_CONTENT_TYPE,
            )),
        )
        .header(SERVER, HeaderValue::from_static(APP_NAME));
    if file_size > 0 {
        response_builder = response_builder.header(CONTENT_LENGTH, HeaderValue::from(file_size));
    }

    let channel_body = ChannelBody::new(rx, (file_size > 0).then_some(file_size));

    response_builder
        .body(channel_body.boxed())
        .expect("HTTP response is valid")
}

/// Response body fed by the file-pump task. Completes when the sender
/// closes; with a known total size it reports an exact size hint so the
/// connection is framed with `Content-Length` instead of chunking.
struct ChannelBody {
    receiver: tokio::sync::mpsc::Receiver<Result<Bytes, ProxyCacheError>>,
    remaining: Option<u64>,
    complete: bool,
}

impl ChannelBody {
    #[must_use]
    fn new(
        receiver: tokio::sync::mpsc::Receiver<Result<Bytes, ProxyCacheError>>,
        total: Option<u64>,
    ) -> Self {
        Self {
            receiver,
            remaining: total,
            complete: false,
        }
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = ProxyCacheError;

    fn size_hint(&self) -> SizeHint {
        match self.remaining {
            Some(rem) => SizeHint::with_exact(rem),
            None => SizeHint::default(),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.complete
    }

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.is_end_stream() {
            return Ready(None);
        }

        let msg = self.receiver.poll_recv(cx);
        if matches!(msg, Ready(None)) {
            self.complete = true;
        }

        msg.map(|opt| {
            opt.map(|res| {
                res.map(|data| {
                    if let Some(rem) = self.remaining.as_mut() {
                        *rem = rem.saturating_sub(data.len() as u64);
                    }
                    Frame::data(data)
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupStrategy;
    use crate::testutil::test_state;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    /// Two clients requesting the same fingerprint while it downloads must
    /// both receive the full body from a single upstream fetch.
    #[tokio::test]
    async fn tap_serves_two_clients_from_one_upstream_fetch() {
        let (state, _dirs) = test_state().await;

        let half = 32 * 1024;
        let payload: Vec<u8> = (0..2 * half).map(|i| u8::try_from(i % 251).unwrap()).collect();
        let payload_for_upstream = payload.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let conn_count = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                conn_count.fetch_add(1, Ordering::SeqCst);

                let payload = payload_for_upstream.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        match sock.read(&mut byte).await {
                            Ok(n) if n > 0 => head.push(byte[0]),
                            _ => return,
                        }
                    }

                    let headers = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        payload.len()
                    );
                    let _ = sock.write_all(headers.as_bytes()).await;
                    /* slow tail so the second client taps mid-download */
                    let _ = sock.write_all(&payload[..half]).await;
                    let _ = sock.flush().await;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let _ = sock.write_all(&payload[half..]).await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        let url = format!("http://{addr}/file.bin");
        let client_a = SocketAddr::from(([127, 0, 0, 1], 40001));
        let client_b = SocketAddr::from(([127, 0, 0, 1], 40002));

        let record_a = state
            .cache
            .get_or_create(&url, "", "file.bin", DedupStrategy::FullUrl)
            .await
            .unwrap();
        let file_hash = record_a.file_hash.clone();
        let saved_path = record_a.saved_path.clone();

        let response_a = serve_cache_entry(client_a, record_a, None, &state).await;
        assert_eq!(response_a.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let record_b = state
            .cache
            .get_or_create(&url, "", "file.bin", DedupStrategy::FullUrl)
            .await
            .unwrap();
        let response_b = serve_cache_entry(client_b, record_b, None, &state).await;
        assert_eq!(response_b.status(), StatusCode::OK);

        let collect = |response: Response<ProxyCacheBody>| async move {
            response.into_body().collect().await.unwrap().to_bytes()
        };

        let (body_a, body_b) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(collect(response_a), collect(response_b))
        })
        .await
        .expect("both streams should finish");

        assert_eq!(body_a.as_ref(), payload.as_slice());
        assert_eq!(body_b.as_ref(), payload.as_slice());
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        /* the record converges to complete with the full file on disk */
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let record = state.database.get_file(&file_hash).await.unwrap().unwrap();
            if record.download_status == DownloadStatus::Complete {
                assert_eq!(record.downloaded_bytes, i64::try_from(payload.len()).unwrap());
                break;
            }
            assert!(Instant::now() < deadline, "download did not complete");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let on_disk = tokio::fs::read(&saved_path).await.unwrap();
        assert_eq!(on_disk, payload);
    }

    #[test]
    fn error_status_extraction() {
        assert_eq!(
            parse_error_status("Download failed: unexpected status code: 404"),
            Some(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            parse_error_status("unexpected status code: 503 (upstream)"),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(parse_error_status("Download failed: connection refused"), None);
        assert_eq!(
            parse_error_status("unexpected status code: notanumber"),
            None
        );
        /* out of the valid status range */
        assert_eq!(parse_error_status("unexpected status code: 9999"), None);
    }
}
