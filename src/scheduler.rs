use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use http_body_util::BodyExt as _;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, RANGE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use log::{debug, error, info, trace, warn};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::database::{Database, DownloadStatus, FileRecord};
use crate::humanfmt::HumanFmt;
use crate::{APP_USER_AGENT, Client, empty};

/// Persist `downloaded_bytes` whenever this many new bytes arrived.
const PROGRESS_PERSIST_INTERVAL: u64 = 1024 * 1024; /* 1 MiB */

/// One live background download, at most one per fileHash.
///
/// The watch channel publishes the flushed byte count; readers serve from
/// the on-disk file and use the channel only as a wake-up and close signal,
/// so back-pressure can never drop data. The sender lives in the worker and
/// is dropped exactly once, on transition to `complete` or `failed`.
pub(crate) struct Task {
    file_hash: String,
    url: String,
    cookie: String,
    saved_path: PathBuf,
    state: Mutex<TaskState>,
    cancel: CancellationToken,
    resume: Notify,
    progress: watch::Receiver<u64>,
}

#[derive(Debug)]
struct TaskState {
    status: DownloadStatus,
    priority: i32,
    file_size: u64,
    content_type: String,
    downloaded: u64,
}

impl Task {
    #[must_use]
    pub(crate) fn status(&self) -> DownloadStatus {
        self.state.lock().expect("other users should not panic").status
    }

    /// In-memory mirror of `(file_size, content_type, downloaded_bytes)`,
    /// updated by the worker ahead of the periodic database persistence.
    #[must_use]
    pub(crate) fn metadata(&self) -> (u64, String, u64) {
        let st = self.state.lock().expect("other users should not panic");
        (st.file_size, st.content_type.clone(), st.downloaded)
    }

    /// New subscription to the progress fan-out. `changed()` failing means
    /// the worker reached a terminal state; consult [`Task::status`] then.
    #[must_use]
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.progress.clone()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("file_hash", &self.file_hash)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Priority-preemptive background download scheduler.
///
/// Lock order is scheduler table, then task state; no network or disk I/O
/// happens while the table lock is held.
pub(crate) struct Scheduler {
    tasks: RwLock<HashMap<String, Arc<Task>>>,
    database: Database,
    https_client: Client,
}

impl Scheduler {
    #[must_use]
    pub(crate) fn new(database: Database, https_client: Client) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            database,
            https_client,
        }
    }

    /// Number of tasks currently in `downloading`.
    #[must_use]
    pub(crate) fn active_count(&self) -> usize {
        let tasks = self.tasks.read().expect("other users should not panic");

        tasks
            .values()
            .filter(|task| task.status() == DownloadStatus::Downloading)
            .count()
    }

    #[must_use]
    pub(crate) fn task_status(&self, file_hash: &str) -> Option<DownloadStatus> {
        self.tasks
            .read()
            .expect("other users should not panic")
            .get(file_hash)
            .map(|task| task.status())
    }

    /// Starts a background download, or adjusts an existing one.
    ///
    /// Idempotent: a `downloading`, `pending` or `complete` task only gets
    /// its priority updated; a `paused` one additionally receives a resume
    /// signal; a `failed` one is replaced by a fresh task and worker.
    pub(crate) fn start_or_resume(
        &self,
        record: &FileRecord,
        url: &str,
        cookie: &str,
        priority: i32,
    ) -> Arc<Task> {
        let mut tasks = self.tasks.write().expect("other users should not panic");

        if let Some(task) = tasks.get(&record.file_hash) {
            let mut st = task.state.lock().expect("other users should not panic");
            st.priority = priority;

            match st.status {
                DownloadStatus::Downloading
                | DownloadStatus::Pending
                | DownloadStatus::Complete => {
                    drop(st);
                    return Arc::clone(task);
                }
                DownloadStatus::Paused => {
                    drop(st);
                    task.resume.notify_one();
                    return Arc::clone(task);
                }
                DownloadStatus::Failed => {
                    drop(st);
                    debug!(
                        "Replacing failed download task for {} with a fresh one",
                        record.file_hash
                    );
                    task.cancel.cancel();
                    tasks.remove(&record.file_hash);
                }
            }
        }

        let (progress_tx, progress_rx) = watch::channel(u64::try_from(record.downloaded_bytes).unwrap_or(0));

        let task = Arc::new(Task {
            file_hash: record.file_hash.clone(),
            url: url.to_string(),
            cookie: cookie.to_string(),
            saved_path: PathBuf::from(&record.saved_path),
            state: Mutex::new(TaskState {
                status: DownloadStatus::Pending,
                priority,
                file_size: u64::try_from(record.file_size).unwrap_or(0),
                content_type: record.content_type.clone(),
                downloaded: u64::try_from(record.downloaded_bytes).unwrap_or(0),
            }),
            cancel: CancellationToken::new(),
            resume: Notify::new(),
            progress: progress_rx,
        });

        tasks.insert(record.file_hash.clone(), Arc::clone(&task));
        drop(tasks);

        let worker_task = Arc::clone(&task);
        let database = self.database.clone();
        let client = self.https_client.clone();
        tokio::task::spawn(async move {
            download_task(&worker_task, progress_tx, &database, &client).await;
        });

        task
    }

    /// Delivers a non-blocking pause signal to every `downloading` task
    /// whose priority is below `min_priority`; the workers observe it at
    /// their next cooperative check.
    pub(crate) fn pause_below(&self, min_priority: i32) {
        let candidates: Vec<Arc<Task>> = {
            let tasks = self.tasks.read().expect("other users should not panic");
            tasks
                .values()
                .filter(|task| {
                    let st = task.state.lock().expect("other users should not panic");
                    st.status == DownloadStatus::Downloading && st.priority < min_priority
                })
                .cloned()
                .collect()
        };

        /* flip outside of the table lock */
        for task in candidates {
            let mut st = task.state.lock().expect("other users should not panic");
            if st.status == DownloadStatus::Downloading {
                debug!(
                    "Pausing download task {} (priority {} < {min_priority})",
                    task.file_hash, st.priority
                );
                st.status = DownloadStatus::Paused;
            }
        }
    }

    /// Cancels and drops the task for a hash, if any. Used when the cache
    /// manager evicts a record, so a stale `complete` task cannot shadow a
    /// later re-download of the same fingerprint.
    pub(crate) fn forget(&self, file_hash: &str) {
        let removed = self
            .tasks
            .write()
            .expect("other users should not panic")
            .remove(file_hash);

        if let Some(task) = removed {
            task.cancel.cancel();
        }
    }

    #[cfg(test)]
    fn insert_for_test(&self, file_hash: &str, status: DownloadStatus, priority: i32) -> Arc<Task> {
        let (_progress_tx, progress_rx) = watch::channel(0);
        let task = Arc::new(Task {
            file_hash: file_hash.to_string(),
            url: format!("http://127.0.0.1:1/{file_hash}"),
            cookie: String::new(),
            saved_path: PathBuf::from("/nonexistent"),
            state: Mutex::new(TaskState {
                status,
                priority,
                file_size: 0,
                content_type: String::new(),
                downloaded: 0,
            }),
            cancel: CancellationToken::new(),
            resume: Notify::new(),
            progress: progress_rx,
        });

        self.tasks
            .write()
            .unwrap()
            .insert(file_hash.to_string(), Arc::clone(&task));

        task
    }
}

/// The background worker: resumes via Range, appends to the cache file,
/// publishes progress and honors pause/cancel between chunks.
async fn download_task(
    task: &Arc<Task>,
    progress_tx: watch::Sender<u64>,
    database: &Database,
    client: &Client,
) {
    {
        let mut st = task.state.lock().expect("other users should not panic");
        st.status = DownloadStatus::Downloading;
    }
    if let Err(err) = database
        .update_status(&task.file_hash, DownloadStatus::Downloading)
        .await
    {
        error!("Failed to persist download state:  {err}");
    }

    let start = Instant::now();

    let start_offset = match tokio::fs::metadata(&task.saved_path).await {
        Ok(md) => md.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => {
            fail_task(
                task,
                database,
                format!("Download failed: cache file access: {err}"),
            )
            .await;
            return;
        }
    };

    let mut request = Request::builder()
        .method(Method::GET)
        .uri(task.url.as_str())
        .header(USER_AGENT, APP_USER_AGENT);
    if !task.cookie.is_empty() {
        request = request.header(COOKIE, task.cookie.as_str());
    }
    if start_offset > 0 {
        request = request.header(RANGE, format!("bytes={start_offset}-"));
    }
    let request = match request.body(empty()) {
        Ok(r) => r,
        Err(err) => {
            fail_task(task, database, format!("Download failed: {err}")).await;
            return;
        }
    };

    trace!("Upstream download request: {request:?}");

    let response = match client.request(request).await {
        Ok(r) => r,
        Err(err) => {
            fail_task(task, database, format!("Download failed: {err}")).await;
            return;
        }
    };

    trace!("Upstream download response: {response:?}");

    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        fail_task(
            task,
            database,
            format!("Download failed: unexpected status code: {}", status.as_u16()),
        )
        .await;
        return;
    }

    /* upstream ignored the Range request, truncate and restart */
    let mut write_offset = start_offset;
    if start_offset > 0 && status == StatusCode::OK {
        warn!(
            "Upstream answered 200 to a ranged resume of `{}`, rewriting from offset 0",
            task.url
        );
        write_offset = 0;
        if let Err(err) = database.update_progress(&task.file_hash, 0).await {
            error!("Failed to reset download progress:  {err}");
        }
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|hv| hv.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|hv| hv.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    /* 0 means still unknown; chunked upstream responses stay unknown */
    let file_size = content_length.map_or(0, |cl| write_offset + cl);

    {
        let mut st = task.state.lock().expect("other users should not panic");
        st.file_size = file_size;
        st.content_type = content_type.clone();
        st.downloaded = write_offset;
    }
    if let Err(err) = database
        .update_download_metadata(
            &task.file_hash,
            i64::try_from(file_size).unwrap_or(0),
            &content_type,
        )
        .await
    {
        error!("Failed to persist download metadata:  {err}");
    }

    let mut open_options = tokio::fs::OpenOptions::new();
    open_options.create(true).write(true);
    if write_offset == 0 && start_offset > 0 {
        open_options.truncate(true);
    } else {
        open_options.append(true);
    }
    let mut file = match open_options.open(&task.saved_path).await {
        Ok(f) => f,
        Err(err) => {
            fail_task(task, database, format!("Download failed: {err}")).await;
            return;
        }
    };

    info!(
        "Downloading `{}` from offset {} ({})...",
        task.url,
        write_offset,
        if file_size == 0 {
            "unknown size".to_string()
        } else {
            format!("{}", HumanFmt::Size(file_size))
        }
    );

    let mut body = response.into_body();
    let mut downloaded = write_offset;
    let mut last_persisted = downloaded;

    loop {
        /* cooperative checks between chunks */
        let paused = {
            task.state.lock().expect("other users should not panic").status
                == DownloadStatus::Paused
        };
        if paused {
            if let Err(err) = database
                .update_status(&task.file_hash, DownloadStatus::Paused)
                .await
            {
                error!("Failed to persist download state:  {err}");
            }
            if let Err(err) = database
                .update_progress(&task.file_hash, i64::try_from(downloaded).unwrap_or(0))
                .await
            {
                error!("Failed to persist download progress:  {err}");
            }
            info!("Download of `{}` paused at {downloaded} bytes", task.url);

            tokio::select! {
                () = task.cancel.cancelled() => {
                    debug!("Download of `{}` cancelled while paused", task.url);
                    return;
                }
                () = task.resume.notified() => (),
            }

            {
                let mut st = task.state.lock().expect("other users should not panic");
                st.status = DownloadStatus::Downloading;
            }
            if let Err(err) = database
                .update_status(&task.file_hash, DownloadStatus::Downloading)
                .await
            {
                error!("Failed to persist download state:  {err}");
            }
            info!("Download of `{}` resumed", task.url);
            continue;
        }

        let next = tokio::select! {
            () = task.cancel.cancelled() => {
                debug!("Download of `{}` cancelled", task.url);
                return;
            }
            next = body.frame() => next,
        };

        let Some(next) = next else {
            break; /* EOF */
        };

        let frame = match next {
            Ok(f) => f,
            Err(err) => {
                fail_task(task, database, format!("Download failed: {err}")).await;
                return;
            }
        };

        let Ok(data) = frame.into_data() else {
            continue; /* trailers */
        };
        if data.is_empty() {
            continue;
        }

        if let Err(err) = file.write_all(&data).await {
            fail_task(task, database, format!("Download failed: {err}")).await;
            return;
        }

        downloaded += data.len() as u64;

        {
            let mut st = task.state.lock().expect("other users should not panic");
            st.downloaded = downloaded;
        }

        /* data is on disk, wake the streamers */
        let _ = progress_tx.send(downloaded);

        if downloaded / PROGRESS_PERSIST_INTERVAL > last_persisted / PROGRESS_PERSIST_INTERVAL {
            if let Err(err) = database
                .update_progress(&task.file_hash, i64::try_from(downloaded).unwrap_or(0))
                .await
            {
                error!("Failed to persist download progress:  {err}");
            }
            last_persisted = downloaded;
        }
    }

    {
        let mut st = task.state.lock().expect("other users should not panic");
        st.status = DownloadStatus::Complete;
        st.downloaded = downloaded;
    }
    if let Err(err) = database
        .mark_complete(&task.file_hash, i64::try_from(downloaded).unwrap_or(0))
        .await
    {
        error!("Failed to persist download completion:  {err}");
    }

    let elapsed = start.elapsed();
    info!(
        "Finished download of `{}` in {} (size={})",
        task.url,
        HumanFmt::Time(elapsed),
        HumanFmt::Size(downloaded)
    );

    /* dropping progress_tx here closes the fan-out exactly once */
}

async fn fail_task(task: &Task, database: &Database, message: String) {
    {
        let mut st = task.state.lock().expect("other users should not panic");
        st.status = DownloadStatus::Failed;
    }

    error!("Download error for {}:  {message}", task.url);

    if let Err(err) = database
        .update_status(&task.file_hash, DownloadStatus::Failed)
        .await
    {
        error!("Failed to persist download state:  {err}");
    }

    if let Err(err) = database
        .insert_log("error", &message, &task.url, &task.file_hash)
        .await
    {
        error!("Failed to record download failure:  {err}");
    }

    /* the caller returns next, dropping the watch sender and waking readers */
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_https_client;
    use crate::database::connect_memory;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    async fn test_scheduler() -> Scheduler {
        let database = connect_memory().await;
        let client = build_https_client(Duration::from_secs(2), Duration::from_secs(30))
            .expect("client should build");
        Scheduler::new(database, client)
    }

    /// Minimal canned-response origin; the handler gets the request head
    /// and returns the raw response bytes.
    async fn spawn_upstream<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
    where
        F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let conn_count = Arc::clone(&connections);
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                conn_count.fetch_add(1, Ordering::SeqCst);

                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        match sock.read(&mut byte).await {
                            Ok(n) if n > 0 => head.push(byte[0]),
                            _ => return,
                        }
                    }

                    let head = String::from_utf8_lossy(&head).into_owned();
                    let response = handler(&head);
                    let _ = sock.write_all(&response).await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        (addr, connections)
    }

    async fn insert_record(
        database: &Database,
        file_hash: &str,
        url: &str,
        saved_path: &std::path::Path,
    ) -> FileRecord {
        database
            .insert_file_if_absent(
                file_hash,
                url,
                "",
                "file.bin",
                &saved_path.to_string_lossy(),
            )
            .await
            .unwrap();
        database.get_file(file_hash).await.unwrap().unwrap()
    }

    async fn wait_terminal(task: &Arc<Task>) {
        let mut progress = task.subscribe();
        tokio::time::timeout(Duration::from_secs(10), async {
            while progress.changed().await.is_ok() {}
        })
        .await
        .expect("worker should reach a terminal state");
    }

    #[tokio::test]
    async fn worker_downloads_to_completion() {
        let payload = vec![b'A'; 64 * 1024];
        let payload_for_upstream = payload.clone();
        let (addr, _connections) = spawn_upstream(move |_head| {
            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: video/mp4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                payload_for_upstream.len()
            )
            .into_bytes();
            response.extend_from_slice(&payload_for_upstream);
            response
        })
        .await;

        let scheduler = test_scheduler().await;
        let dir = tempfile::tempdir().unwrap();
        let saved_path = dir.path().join("hash_dl");
        let url = format!("http://{addr}/video.mp4");
        let record = insert_record(&scheduler.database, "hash_dl", &url, &saved_path).await;

        let task = scheduler.start_or_resume(&record, &url, "", 10);
        wait_terminal(&task).await;

        assert_eq!(task.status(), DownloadStatus::Complete);

        let data = tokio::fs::read(&saved_path).await.unwrap();
        assert_eq!(data, payload);

        let record = scheduler.database.get_file("hash_dl").await.unwrap().unwrap();
        assert_eq!(record.download_status, DownloadStatus::Complete);
        assert_eq!(record.downloaded_bytes, 64 * 1024);
        assert_eq!(record.file_size, 64 * 1024);
        assert_eq!(record.content_type, "video/mp4");
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn worker_resumes_with_range_request() {
        let full = b"0123456789ABCDEF";
        let (addr, _connections) = spawn_upstream(move |head| {
            if !head.to_ascii_lowercase().contains("range: bytes=5-") {
                return b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_vec();
            }

            let tail = &full[5..];
            let mut response = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes 5-15/16\r\nConnection: close\r\n\r\n",
                tail.len()
            )
            .into_bytes();
            response.extend_from_slice(tail);
            response
        })
        .await;

        let scheduler = test_scheduler().await;
        let dir = tempfile::tempdir().unwrap();
        let saved_path = dir.path().join("hash_resume");
        tokio::fs::write(&saved_path, &full[..5]).await.unwrap();

        let url = format!("http://{addr}/file.bin");
        let record = insert_record(&scheduler.database, "hash_resume", &url, &saved_path).await;

        let task = scheduler.start_or_resume(&record, &url, "", 10);
        wait_terminal(&task).await;

        assert_eq!(task.status(), DownloadStatus::Complete);

        let data = tokio::fs::read(&saved_path).await.unwrap();
        assert_eq!(data, full);

        let record = scheduler
            .database
            .get_file("hash_resume")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.downloaded_bytes, 16);
        assert_eq!(record.file_size, 16);
    }

    #[tokio::test]
    async fn worker_records_upstream_failure_status() {
        let (addr, _connections) = spawn_upstream(|_head| {
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
        })
        .await;

        let scheduler = test_scheduler().await;
        let dir = tempfile::tempdir().unwrap();
        let saved_path = dir.path().join("hash_fail");
        let url = format!("http://{addr}/missing.bin");
        let record = insert_record(&scheduler.database, "hash_fail", &url, &saved_path).await;

        let task = scheduler.start_or_resume(&record, &url, "", 10);
        wait_terminal(&task).await;

        assert_eq!(task.status(), DownloadStatus::Failed);

        let record = scheduler.database.get_file("hash_fail").await.unwrap().unwrap();
        assert_eq!(record.download_status, DownloadStatus::Failed);

        let entry = scheduler
            .database
            .latest_error_log("hash_fail")
            .await
            .unwrap()
            .unwrap();
        assert!(entry.message.contains("unexpected status code: 404"));
    }

    #[tokio::test]
    async fn start_or_resume_is_idempotent() {
        let scheduler = test_scheduler().await;

        let task = scheduler.insert_for_test("hash1", DownloadStatus::Downloading, 10);

        let record = FileRecord {
            id: 1,
            file_hash: "hash1".to_string(),
            original_url: "http://127.0.0.1:1/x".to_string(),
            request_cookie: String::new(),
            filename: "x".to_string(),
            file_size: 0,
            saved_path: "/nonexistent".to_string(),
            content_type: String::new(),
            download_status: DownloadStatus::Downloading,
            downloaded_bytes: 0,
            created_at: 0,
            last_accessed_at: 0,
            completed_at: None,
        };

        let again = scheduler.start_or_resume(&record, &record.original_url, "", 50);

        assert!(Arc::ptr_eq(&task, &again));
        assert_eq!(again.state.lock().unwrap().priority, 50);
        assert_eq!(scheduler.tasks.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pause_below_only_hits_lower_priority_downloads() {
        let scheduler = test_scheduler().await;

        let low_a = scheduler.insert_for_test("low_a", DownloadStatus::Downloading, 10);
        let low_b = scheduler.insert_for_test("low_b", DownloadStatus::Downloading, 10);
        let high = scheduler.insert_for_test("high", DownloadStatus::Downloading, 100);
        let pending = scheduler.insert_for_test("pending", DownloadStatus::Pending, 5);

        scheduler.pause_below(100);

        assert_eq!(low_a.status(), DownloadStatus::Paused);
        assert_eq!(low_b.status(), DownloadStatus::Paused);
        assert_eq!(high.status(), DownloadStatus::Downloading);
        assert_eq!(pending.status(), DownloadStatus::Pending);

        assert_eq!(scheduler.active_count(), 1);
    }

    #[tokio::test]
    async fn failed_task_is_replaced() {
        let scheduler = test_scheduler().await;

        let failed = scheduler.insert_for_test("hash2", DownloadStatus::Failed, 10);

        let record = FileRecord {
            id: 1,
            file_hash: "hash2".to_string(),
            original_url: "http://127.0.0.1:1/y".to_string(),
            request_cookie: String::new(),
            filename: "y".to_string(),
            file_size: 0,
            saved_path: "/nonexistent".to_string(),
            content_type: String::new(),
            download_status: DownloadStatus::Failed,
            downloaded_bytes: 0,
            created_at: 0,
            last_accessed_at: 0,
            completed_at: None,
        };

        let fresh = scheduler.start_or_resume(&record, &record.original_url, "", 100);

        assert!(!Arc::ptr_eq(&failed, &fresh));
        assert!(failed.cancel.is_cancelled());
        assert_eq!(scheduler.tasks.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn forget_cancels_and_removes() {
        let scheduler = test_scheduler().await;

        let task = scheduler.insert_for_test("hash3", DownloadStatus::Complete, 10);
        scheduler.forget("hash3");

        assert!(task.cancel.is_cancelled());
        assert!(scheduler.tasks.read().unwrap().get("hash3").is_none());
    }
}
