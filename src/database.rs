use std::str::FromStr as _;
use std::time::Duration;

use log::{LevelFilter, debug, info, trace};
use sqlx::{
    ConnectOptions as _, Error, Executor as _, Pool, Sqlite, SqlitePool,
    sqlite::SqliteConnectOptions,
};

/// Download lifecycle of a cached file.
/// `Complete` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub(crate) enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Complete,
    Failed,
}

impl DownloadStatus {
    #[must_use]
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cached file, unique on `file_hash`.
#[derive(Clone, Debug, sqlx::FromRow)]
pub(crate) struct FileRecord {
    #[expect(unused)]
    pub(crate) id: i64,
    pub(crate) file_hash: String,
    pub(crate) original_url: String,
    pub(crate) request_cookie: String,
    pub(crate) filename: String,
    pub(crate) file_size: i64,
    pub(crate) saved_path: String,
    pub(crate) content_type: String,
    pub(crate) download_status: DownloadStatus,
    pub(crate) downloaded_bytes: i64,
    #[expect(unused)]
    pub(crate) created_at: i64,
    pub(crate) last_accessed_at: i64,
    pub(crate) completed_at: Option<i64>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub(crate) struct LogEntry {
    #[expect(unused)]
    pub(crate) id: i64,
    pub(crate) level: String,
    pub(crate) message: String,
    #[expect(unused)]
    pub(crate) url: String,
    #[expect(unused)]
    pub(crate) file_hash: String,
    #[expect(unused)]
    pub(crate) created_at: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct Database {
    conn: Pool<Sqlite>,
}

impl Database {
    pub(crate) async fn connect(
        path: &std::path::Path,
        slow_timeout: Duration,
    ) -> Result<Self, Error> {
        let url = format!("sqlite://{}", path.display());

        info!("Opening database `{url}`...");
        debug!("Using slow timeout of {slow_timeout:?}");

        Self::connect_url(&url, slow_timeout).await
    }

    async fn connect_url(url: &str, slow_timeout: Duration) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .log_statements(LevelFilter::Trace)
            .log_slow_statements(LevelFilter::Warn, slow_timeout);
        let conn = SqlitePool::connect_with(opts).await?;

        Ok(Self { conn })
    }

    pub(crate) async fn init_tables(&self) -> Result<(), Error> {
        trace!("Initializing database tables...");

        self.conn
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_hash TEXT NOT NULL UNIQUE,
                    original_url TEXT NOT NULL,
                    request_cookie TEXT NOT NULL DEFAULT '',
                    filename TEXT NOT NULL,
                    file_size INTEGER NOT NULL DEFAULT 0,
                    saved_path TEXT NOT NULL,
                    content_type TEXT NOT NULL DEFAULT '',
                    download_status TEXT NOT NULL DEFAULT 'pending',
                    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL DEFAULT (unixepoch(CURRENT_TIMESTAMP)),
                    last_accessed_at INTEGER NOT NULL DEFAULT (unixepoch(CURRENT_TIMESTAMP)),
                    completed_at INTEGER
                ) STRICT;
                ",
            )
            .await?;

        self.conn
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL,
                    url TEXT NOT NULL DEFAULT '',
                    file_hash TEXT NOT NULL DEFAULT '',
                    created_at INTEGER NOT NULL DEFAULT (unixepoch(CURRENT_TIMESTAMP))
                ) STRICT;
                ",
            )
            .await?;

        Ok(())
    }

    pub(crate) async fn get_file(&self, file_hash: &str) -> Result<Option<FileRecord>, Error> {
        sqlx::query_as::<_, FileRecord>(
            r"
            SELECT * FROM files WHERE file_hash = ?;
            ",
        )
        .bind(file_hash)
        .fetch_optional(&self.conn)
        .await
    }

    /// Inserts a fresh `pending` record unless one already exists.
    /// Uniqueness on `file_hash` resolves concurrent first-seen races;
    /// the loser simply re-reads the winner's row.
    pub(crate) async fn insert_file_if_absent(
        &self,
        file_hash: &str,
        original_url: &str,
        request_cookie: &str,
        filename: &str,
        saved_path: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
            INSERT INTO files
            (file_hash, original_url, request_cookie, filename, saved_path, download_status)
            VALUES
            (?, ?, ?, ?, ?, 'pending')
            ON CONFLICT (file_hash) DO NOTHING;
            ",
        )
        .bind(file_hash)
        .bind(original_url)
        .bind(request_cookie)
        .bind(filename)
        .bind(saved_path)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn touch_file(&self, file_hash: &str) -> Result<(), Error> {
        sqlx::query(
            r"
            UPDATE files
            SET last_accessed_at = unixepoch(CURRENT_TIMESTAMP)
            WHERE file_hash = ?;
            ",
        )
        .bind(file_hash)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn update_status(
        &self,
        file_hash: &str,
        status: DownloadStatus,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
            UPDATE files SET download_status = ? WHERE file_hash = ?;
            ",
        )
        .bind(status)
        .bind(file_hash)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    /// Persists size and content type once the first upstream response
    /// headers have been parsed. A zero size means still unknown.
    pub(crate) async fn update_download_metadata(
        &self,
        file_hash: &str,
        file_size: i64,
        content_type: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
            UPDATE files
            SET file_size = CASE WHEN ? > 0 THEN ? ELSE file_size END,
                content_type = ?
            WHERE file_hash = ?;
            ",
        )
        .bind(file_size)
        .bind(file_size)
        .bind(content_type)
        .bind(file_hash)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn update_progress(
        &self,
        file_hash: &str,
        downloaded_bytes: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
            UPDATE files SET downloaded_bytes = ? WHERE file_hash = ?;
            ",
        )
        .bind(downloaded_bytes)
        .bind(file_hash)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn mark_complete(
        &self,
        file_hash: &str,
        downloaded_bytes: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
            UPDATE files
            SET download_status = 'complete',
                downloaded_bytes = ?,
                completed_at = unixepoch(CURRENT_TIMESTAMP)
            WHERE file_hash = ?;
            ",
        )
        .bind(downloaded_bytes)
        .bind(file_hash)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn expired_complete_files(
        &self,
        cutoff_epoch: i64,
    ) -> Result<Vec<FileRecord>, Error> {
        sqlx::query_as::<_, FileRecord>(
            r"
            SELECT * FROM files
            WHERE download_status = 'complete' AND last_accessed_at < ?;
            ",
        )
        .bind(cutoff_epoch)
        .fetch_all(&self.conn)
        .await
    }

    pub(crate) async fn files_by_last_access(&self) -> Result<Vec<FileRecord>, Error> {
        sqlx::query_as::<_, FileRecord>(
            r"
            SELECT * FROM files ORDER BY last_accessed_at ASC;
            ",
        )
        .fetch_all(&self.conn)
        .await
    }

    pub(crate) async fn recent_files(&self, limit: i64) -> Result<Vec<FileRecord>, Error> {
        sqlx::query_as::<_, FileRecord>(
            r"
            SELECT * FROM files ORDER BY last_accessed_at DESC LIMIT ?;
            ",
        )
        .bind(limit)
        .fetch_all(&self.conn)
        .await
    }

    pub(crate) async fn status_counts(&self) -> Result<Vec<(String, i64)>, Error> {
        sqlx::query_as::<_, (String, i64)>(
            r"
            SELECT download_status, COUNT(*) FROM files GROUP BY download_status;
            ",
        )
        .fetch_all(&self.conn)
        .await
    }

    pub(crate) async fn delete_file(&self, file_hash: &str) -> Result<(), Error> {
        sqlx::query(
            r"
            DELETE FROM files WHERE file_hash = ?;
            ",
        )
        .bind(file_hash)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn insert_log(
        &self,
        level: &str,
        message: &str,
        url: &str,
        file_hash: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
            INSERT INTO logs (level, message, url, file_hash) VALUES (?, ?, ?, ?);
            ",
        )
        .bind(level)
        .bind(message)
        .bind(url)
        .bind(file_hash)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    /// Newest error entry for a hash; carries the verbatim upstream failure
    /// so later clients can be answered with the original status code.
    pub(crate) async fn latest_error_log(
        &self,
        file_hash: &str,
    ) -> Result<Option<LogEntry>, Error> {
        sqlx::query_as::<_, LogEntry>(
            r"
            SELECT * FROM logs
            WHERE file_hash = ? AND level = 'error'
            ORDER BY created_at DESC, id DESC
            LIMIT 1;
            ",
        )
        .bind(file_hash)
        .fetch_optional(&self.conn)
        .await
    }
}

#[cfg(test)]
impl Database {
    pub(crate) async fn set_last_accessed(&self, file_hash: &str, epoch: i64) {
        sqlx::query(
            r"
            UPDATE files SET last_accessed_at = ? WHERE file_hash = ?;
            ",
        )
        .bind(epoch)
        .bind(file_hash)
        .execute(&self.conn)
        .await
        .unwrap();
    }
}

/* A pooled `:memory:` database would open one independent database per
 * pooled connection; pin the pool to a single long-lived connection. */
#[cfg(test)]
pub(crate) async fn connect_memory() -> Database {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let conn = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .unwrap();

    let db = Database { conn };
    db.init_tables().await.unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_uniqueness() {
        let db = connect_memory().await;

        db.insert_file_if_absent("aa", "https://a.test/f", "", "f", "/tmp/aa")
            .await
            .unwrap();
        db.insert_file_if_absent("aa", "https://other.test/f", "", "f", "/tmp/aa")
            .await
            .unwrap();

        let record = db.get_file("aa").await.unwrap().unwrap();
        /* first insert wins */
        assert_eq!(record.original_url, "https://a.test/f");
        assert_eq!(record.download_status, DownloadStatus::Pending);
        assert_eq!(record.downloaded_bytes, 0);
        assert!(record.completed_at.is_none());
    }

    #[tokio::test]
    async fn completion_stamp() {
        let db = connect_memory().await;

        db.insert_file_if_absent("bb", "https://a.test/g", "", "g", "/tmp/bb")
            .await
            .unwrap();
        db.mark_complete("bb", 1234).await.unwrap();

        let record = db.get_file("bb").await.unwrap().unwrap();
        assert_eq!(record.download_status, DownloadStatus::Complete);
        assert_eq!(record.downloaded_bytes, 1234);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn latest_error_log_wins() {
        let db = connect_memory().await;

        db.insert_log("error", "Download failed: first", "u", "cc")
            .await
            .unwrap();
        db.insert_log("info", "noise", "u", "cc").await.unwrap();
        db.insert_log("error", "Download failed: second", "u", "cc")
            .await
            .unwrap();

        let entry = db.latest_error_log("cc").await.unwrap().unwrap();
        assert_eq!(entry.level, "error");
        assert_eq!(entry.message, "Download failed: second");

        assert!(db.latest_error_log("dd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_update_keeps_known_size() {
        let db = connect_memory().await;

        db.insert_file_if_absent("ee", "https://a.test/h", "", "h", "/tmp/ee")
            .await
            .unwrap();
        db.update_download_metadata("ee", 100, "video/mp4")
            .await
            .unwrap();
        /* unknown size must not clobber the recorded one */
        db.update_download_metadata("ee", 0, "video/mp4")
            .await
            .unwrap();

        let record = db.get_file("ee").await.unwrap().unwrap();
        assert_eq!(record.file_size, 100);
        assert_eq!(record.content_type, "video/mp4");
    }
}
