use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use log::{debug, error, info, warn};

use crate::config::DedupStrategy;
use crate::database::{Database, DownloadStatus, FileRecord};
use crate::fingerprint::compute_file_hash;
use crate::humanfmt::HumanFmt;

/// Owns the on-disk cache directory and the per-fingerprint records.
#[derive(Debug)]
pub(crate) struct CacheManager {
    database: Database,
    cache_dir: PathBuf,
    ttl: Duration,
}

impl CacheManager {
    pub(crate) fn new(database: Database, cache_dir: &Path, ttl: Duration) -> anyhow::Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create directory `{}`", cache_dir.display()))?;

        Ok(Self {
            database,
            cache_dir: cache_dir.to_path_buf(),
            ttl,
        })
    }

    #[must_use]
    pub(crate) fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the record for `(url, cookie)` under the given strategy,
    /// creating a `pending` one on first sight. Safe against concurrent
    /// first-seen of the same fingerprint: the store's uniqueness decides
    /// the winner and everyone re-reads that row.
    pub(crate) async fn get_or_create(
        &self,
        url: &str,
        cookie: &str,
        filename: &str,
        strategy: DedupStrategy,
    ) -> Result<FileRecord, sqlx::Error> {
        let file_hash = compute_file_hash(url, cookie, strategy);

        if let Some(record) = self.database.get_file(&file_hash).await? {
            self.database.touch_file(&file_hash).await?;
            return Ok(record);
        }

        let saved_path = self.cache_dir.join(&file_hash);
        self.database
            .insert_file_if_absent(
                &file_hash,
                url,
                cookie,
                filename,
                &saved_path.to_string_lossy(),
            )
            .await?;

        self.database
            .get_file(&file_hash)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Removes all complete records not accessed within the TTL, together
    /// with their on-disk data. Returns the removed hashes.
    pub(crate) async fn cleanup_expired(&self) -> Result<Vec<String>, sqlx::Error> {
        let cutoff = epoch_seconds(SystemTime::now() - self.ttl);

        let expired = self.database.expired_complete_files(cutoff).await?;
        let mut removed = Vec::with_capacity(expired.len());

        for record in expired {
            debug!(
                "Expiring cached file {} ({})",
                record.filename, record.file_hash
            );
            self.remove_record(&record).await?;
            removed.push(record.file_hash);
        }

        if !removed.is_empty() {
            info!("TTL cleanup removed {} cache entries", removed.len());
        }

        Ok(removed)
    }

    /// Evicts oldest-accessed complete entries until their total on-disk
    /// size fits `target_total_bytes`. Stalled `pending`/`failed` records
    /// older than one TTL are removed as well; `downloading` records are
    /// never touched.
    pub(crate) async fn lru_evict(
        &self,
        target_total_bytes: u64,
    ) -> Result<Vec<String>, sqlx::Error> {
        let records = self.database.files_by_last_access().await?;
        let stale_cutoff = epoch_seconds(SystemTime::now() - self.ttl);

        let mut total: u64 = 0;
        for record in &records {
            if record.download_status == DownloadStatus::Complete {
                total += file_size_on_disk(&record.saved_path).await;
            }
        }

        let mut removed = Vec::new();

        for record in records {
            match record.download_status {
                DownloadStatus::Complete => {
                    if total <= target_total_bytes {
                        continue;
                    }
                    let size = file_size_on_disk(&record.saved_path).await;
                    debug!(
                        "Evicting cached file {} ({}, {})",
                        record.filename,
                        record.file_hash,
                        HumanFmt::Size(size)
                    );
                    self.remove_record(&record).await?;
                    total = total.saturating_sub(size);
                    removed.push(record.file_hash);
                }
                DownloadStatus::Pending | DownloadStatus::Failed => {
                    if record.last_accessed_at < stale_cutoff {
                        debug!(
                            "Removing stalled {} record {} ({})",
                            record.download_status, record.filename, record.file_hash
                        );
                        self.remove_record(&record).await?;
                        removed.push(record.file_hash);
                    }
                }
                DownloadStatus::Downloading | DownloadStatus::Paused => (),
            }
        }

        if !removed.is_empty() {
            info!(
                "LRU eviction removed {} cache entries (total now {})",
                removed.len(),
                HumanFmt::Size(total)
            );
        }

        Ok(removed)
    }

    /// Sum of on-disk sizes of all complete entries.
    pub(crate) async fn total_complete_bytes(&self) -> Result<u64, sqlx::Error> {
        let records = self.database.files_by_last_access().await?;

        let mut total = 0;
        for record in &records {
            if record.download_status == DownloadStatus::Complete {
                total += file_size_on_disk(&record.saved_path).await;
            }
        }

        Ok(total)
    }

    async fn remove_record(&self, record: &FileRecord) -> Result<(), sqlx::Error> {
        match tokio::fs::remove_file(&record.saved_path).await {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => {
                error!(
                    "Failed to remove cached file `{}`:  {err}",
                    record.saved_path
                );
            }
        }

        self.database.delete_file(&record.file_hash).await
    }
}

async fn file_size_on_disk(path: &str) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(md) => md.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => {
            warn!("Failed to inspect cached file `{path}`:  {err}");
            0
        }
    }
}

fn epoch_seconds(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(dur) => i64::try_from(dur.as_secs()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_memory;

    async fn test_manager(ttl: Duration) -> (CacheManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = connect_memory().await;
        let manager = CacheManager::new(db, dir.path(), ttl).unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (manager, dir) = test_manager(Duration::from_secs(3600)).await;

        let first = manager
            .get_or_create("https://c.test/v.mp4", "", "v.mp4", DedupStrategy::FullUrl)
            .await
            .unwrap();
        let second = manager
            .get_or_create("https://c.test/v.mp4", "", "v.mp4", DedupStrategy::FullUrl)
            .await
            .unwrap();

        assert_eq!(first.file_hash, second.file_hash);
        assert_eq!(first.id, second.id);
        assert_eq!(first.download_status, DownloadStatus::Pending);
        assert_eq!(
            Path::new(&first.saved_path),
            dir.path().join(&first.file_hash)
        );
    }

    #[tokio::test]
    async fn concurrent_first_seen_yields_one_record() {
        let (manager, _dir) = test_manager(Duration::from_secs(3600)).await;

        let url = "https://c.test/race.bin";
        let (a, b) = tokio::join!(
            manager.get_or_create(url, "", "race.bin", DedupStrategy::FullUrl),
            manager.get_or_create(url, "", "race.bin", DedupStrategy::FullUrl),
        );

        assert_eq!(a.unwrap().id, b.unwrap().id);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_row_and_file() {
        let (manager, _dir) = test_manager(Duration::from_secs(60)).await;

        let record = manager
            .get_or_create("https://c.test/old.bin", "", "old.bin", DedupStrategy::FullUrl)
            .await
            .unwrap();
        tokio::fs::write(&record.saved_path, b"data").await.unwrap();
        manager
            .database
            .mark_complete(&record.file_hash, 4)
            .await
            .unwrap();
        manager
            .database
            .set_last_accessed(&record.file_hash, epoch_seconds(SystemTime::now()) - 3600)
            .await;

        let removed = manager.cleanup_expired().await.unwrap();

        assert_eq!(removed, vec![record.file_hash.clone()]);
        assert!(manager
            .database
            .get_file(&record.file_hash)
            .await
            .unwrap()
            .is_none());
        assert!(!Path::new(&record.saved_path).exists());
    }

    #[tokio::test]
    async fn lru_evicts_down_to_budget_oldest_first() {
        let (manager, _dir) = test_manager(Duration::from_secs(3600)).await;

        let now = epoch_seconds(SystemTime::now());
        let mut hashes = Vec::new();
        for (pos, name) in ["a.bin", "b.bin", "c.bin"].iter().enumerate() {
            let record = manager
                .get_or_create(
                    &format!("https://c.test/{name}"),
                    "",
                    name,
                    DedupStrategy::FullUrl,
                )
                .await
                .unwrap();
            tokio::fs::write(&record.saved_path, vec![0u8; 1000])
                .await
                .unwrap();
            manager
                .database
                .mark_complete(&record.file_hash, 1000)
                .await
                .unwrap();
            /* distinct last_accessed_at ordering, oldest first */
            manager
                .database
                .set_last_accessed(&record.file_hash, now - 100 + i64::try_from(pos).unwrap())
                .await;
            hashes.push(record.file_hash);
        }

        let removed = manager.lru_evict(2000).await.unwrap();
        assert_eq!(removed, vec![hashes[0].clone()]);

        assert!(manager.total_complete_bytes().await.unwrap() <= 2000);
        assert!(manager.database.get_file(&hashes[1]).await.unwrap().is_some());
        assert!(manager.database.get_file(&hashes[2]).await.unwrap().is_some());
    }
}
