//! Parallel download execution
//!
//! Runs one batch of candidates across the session pool. Work is split
//! upfront by round-robin so each worker owns a fixed bucket and exactly
//! one session; sessions are never shared between concurrent requests.
//! Every attempt outcome is written to the history store before the next
//! attempt starts, which is what makes a killed batch cheap to re-run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::entities::{
    Candidate, DownloadParams, DownloadStatus, NewDownload, ProgressCounts, SourceType,
    sanitize_error,
};
use crate::domain::events::{ItemOutcome, ProgressSink};
use crate::infrastructure::config::DownloaderConfig;
use crate::infrastructure::history_repository::HistoryRepository;
use crate::infrastructure::session_pool::{SessionPool, SessionSlot};

/// Final counters and artifacts of one engine run.
#[derive(Debug, Default)]
pub struct FetchSummary {
    pub counts: ProgressCounts,
    /// Paths of files written by this run, for downstream import.
    pub downloaded_files: Vec<PathBuf>,
}

/// A completed transfer, before it is recorded in history.
struct FetchedFile {
    path: PathBuf,
    size: u64,
    content_hash: String,
}

#[derive(Clone)]
pub struct FetchEngine {
    history: HistoryRepository,
    downloader: DownloaderConfig,
    download_dir: PathBuf,
}

impl FetchEngine {
    pub fn new(
        history: HistoryRepository,
        downloader: DownloaderConfig,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            history,
            downloader,
            download_dir,
        }
    }

    /// Process a candidate list against the session pool.
    ///
    /// Candidates already present in history are skipped up front and
    /// re-checked at download time. The run keeps going past individual
    /// failures; only cancellation stops it early. After every processed
    /// item `processed == downloaded + skipped + failed` holds on the
    /// emitted snapshot.
    pub async fn run(
        &self,
        pool: Arc<SessionPool>,
        source_type: SourceType,
        params: &DownloadParams,
        candidates: Vec<Candidate>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<FetchSummary> {
        let slots = pool.slots();
        if slots.is_empty() {
            anyhow::bail!("No healthy sessions available for download");
        }

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .context("Failed to create download directory")?;

        let mut counts = ProgressCounts {
            total_discovered: candidates.len() as u64,
            ..Default::default()
        };

        // Pre-scan against history so the progress totals are accurate
        // before the first byte is transferred.
        let mut work = Vec::new();
        for candidate in candidates {
            if self
                .history
                .is_downloaded(source_type, &candidate.filename, true)
                .await
            {
                counts.already_downloaded += 1;
                counts.processed += 1;
                counts.skipped += 1;
            } else {
                work.push(candidate);
            }
        }
        counts.to_download = work.len() as u64;
        info!(
            "Batch plan for {}: {} discovered, {} already present, {} to download",
            source_type, counts.total_discovered, counts.already_downloaded, counts.to_download
        );

        let shared_counts = Arc::new(Mutex::new(counts));
        let initial = *shared_counts.lock().await;
        progress.on_progress(initial).await;

        // Fixed upfront assignment: item i goes to worker i % N. Each
        // worker drains its own bucket with its own session.
        let mut buckets: Vec<Vec<Candidate>> = vec![Vec::new(); slots.len()];
        for (i, candidate) in work.into_iter().enumerate() {
            buckets[i % slots.len()].push(candidate);
        }

        let downloaded_files = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (slot, bucket) in slots.into_iter().zip(buckets) {
            if bucket.is_empty() {
                continue;
            }
            let engine = self.clone();
            let pool = Arc::clone(&pool);
            let params = params.clone();
            let shared_counts = Arc::clone(&shared_counts);
            let downloaded_files = Arc::clone(&downloaded_files);
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                engine
                    .run_worker(
                        pool,
                        slot,
                        source_type,
                        params,
                        bucket,
                        shared_counts,
                        downloaded_files,
                        progress,
                        cancel,
                    )
                    .await;
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                warn!("Download worker panicked: {}", err);
            }
        }

        let counts = *shared_counts.lock().await;
        let downloaded_files = std::mem::take(&mut *downloaded_files.lock().await);
        info!(
            "Batch finished for {}: {} downloaded, {} skipped, {} failed of {}",
            source_type, counts.downloaded, counts.skipped, counts.failed, counts.total_discovered
        );

        Ok(FetchSummary {
            counts,
            downloaded_files,
        })
    }

    async fn run_worker(
        &self,
        pool: Arc<SessionPool>,
        slot: Arc<Mutex<SessionSlot>>,
        source_type: SourceType,
        params: DownloadParams,
        bucket: Vec<Candidate>,
        shared_counts: Arc<Mutex<ProgressCounts>>,
        downloaded_files: Arc<Mutex<Vec<PathBuf>>>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) {
        let mut slot = slot.lock().await;
        debug!(
            "Worker {} starting with {} item(s)",
            slot.index,
            bucket.len()
        );

        for candidate in bucket {
            if cancel.is_cancelled() {
                info!("Worker {} stopping on cancellation", slot.index);
                break;
            }

            // Another run may have fetched this file since the pre-scan.
            let outcome = if self
                .history
                .is_downloaded(source_type, &candidate.filename, true)
                .await
            {
                debug!("Skipping {} (already in history)", candidate.filename);
                ItemOutcome::Skipped
            } else {
                match self
                    .download_with_retries(&pool, &mut slot, source_type, &params, &candidate, &cancel)
                    .await
                {
                    Some(path) => {
                        downloaded_files.lock().await.push(path);
                        ItemOutcome::Downloaded
                    }
                    None => ItemOutcome::Failed,
                }
            };

            let snapshot = {
                let mut counts = shared_counts.lock().await;
                counts.processed += 1;
                match outcome {
                    ItemOutcome::Downloaded => counts.downloaded += 1,
                    ItemOutcome::Skipped => counts.skipped += 1,
                    ItemOutcome::Failed => counts.failed += 1,
                }
                *counts
            };
            progress.on_progress(snapshot).await;

            if outcome == ItemOutcome::Downloaded {
                let delay =
                    std::time::Duration::from_millis(self.downloader.inter_download_delay_ms);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = cancel.cancelled() => {},
                }
            }
        }
    }

    /// Attempt one candidate up to `max_retries` times.
    ///
    /// Every failed attempt is recorded in history before the next one, so
    /// a file that exhausts its attempts ends with `retry_count` equal to
    /// the attempt count. Returns the final path on success, `None` once
    /// attempts are exhausted or the batch is cancelled.
    async fn download_with_retries(
        &self,
        pool: &SessionPool,
        slot: &mut SessionSlot,
        source_type: SourceType,
        params: &DownloadParams,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Option<PathBuf> {
        // Mark the file in-flight before the first byte moves. The row is
        // overwritten by the success or failure of each attempt; a crash
        // leaves it behind, and the disk check rejects it on the next run.
        let marker = self.new_download(params, candidate, None);
        if let Err(err) = self
            .history
            .record_download(source_type, &marker, DownloadStatus::Downloading)
            .await
        {
            warn!("Failed to mark {} in-flight: {}", candidate.filename, err);
        }

        for attempt in 1..=self.downloader.max_retries {
            if cancel.is_cancelled() {
                return None;
            }

            match self.attempt_download(slot, candidate).await {
                Ok(fetched) => {
                    slot.error_count = 0;
                    slot.total_downloads += 1;

                    let record = self.new_download(params, candidate, Some(&fetched));
                    if let Err(err) = self
                        .history
                        .record_download(source_type, &record, DownloadStatus::Success)
                        .await
                    {
                        warn!(
                            "Downloaded {} but failed to record it: {}",
                            candidate.filename, err
                        );
                    }
                    info!(
                        "Worker {} downloaded {} ({} bytes)",
                        slot.index, candidate.filename, fetched.size
                    );
                    return Some(fetched.path);
                }
                Err(err) => {
                    slot.error_count += 1;
                    let message =
                        sanitize_error(&format!("{err:#}"), std::slice::from_ref(&slot.credential));
                    warn!(
                        "Worker {} attempt {}/{} failed for {}: {}",
                        slot.index, attempt, self.downloader.max_retries, candidate.filename, message
                    );

                    let record = self.new_download(params, candidate, None);
                    if let Err(store_err) = self
                        .history
                        .record_failed_download(source_type, &record, &message)
                        .await
                    {
                        warn!(
                            "Failed to record attempt for {}: {}",
                            candidate.filename, store_err
                        );
                    }

                    if slot.error_count >= self.downloader.rotation_error_threshold {
                        if let Err(rotate_err) = pool.rotate(slot).await {
                            warn!(
                                "Worker {} rotation failed, keeping current session: {}",
                                slot.index,
                                sanitize_error(
                                    &format!("{rotate_err:#}"),
                                    std::slice::from_ref(&slot.credential)
                                )
                            );
                        }
                    }

                    if attempt < self.downloader.max_retries {
                        let delay = self.downloader.backoff_delay(attempt);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {},
                            _ = cancel.cancelled() => return None,
                        }
                    }
                }
            }
        }
        None
    }

    /// One transfer: stream the body to a `.part` file, validate, rename.
    ///
    /// The final filename only ever appears on disk complete; a crash
    /// mid-transfer leaves a `.part` file the next run overwrites.
    async fn attempt_download(
        &self,
        slot: &mut SessionSlot,
        candidate: &Candidate,
    ) -> Result<FetchedFile> {
        let response = slot.client.get(&candidate.url).await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            return Err(anyhow!("Portal rate limit hit (status {status})"));
        }
        if !status.is_success() {
            return Err(anyhow!("Download rejected with status {status}"));
        }

        let final_path = self.download_dir.join(&candidate.filename);
        let part_path = self.download_dir.join(format!("{}.part", candidate.filename));

        let mut file = tokio::fs::File::create(&part_path)
            .await
            .with_context(|| format!("Failed to create {}", part_path.display()))?;

        let mut hasher = blake3::Hasher::new();
        let mut size: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    cleanup_part(&part_path).await;
                    return Err(err).context("Transfer interrupted mid-stream");
                }
            };
            hasher.update(&chunk);
            size += chunk.len() as u64;
            if let Err(err) = file.write_all(&chunk).await {
                cleanup_part(&part_path).await;
                return Err(err).context("Failed to write downloaded chunk");
            }
        }
        if let Err(err) = file.flush().await {
            cleanup_part(&part_path).await;
            return Err(err).context("Failed to flush downloaded file");
        }
        drop(file);

        // Undersized payloads are the portal's HTML error pages served
        // with a 200 status.
        if size < self.downloader.min_file_size_bytes {
            cleanup_part(&part_path).await;
            return Err(anyhow!(
                "Payload too small ({size} bytes), portal likely returned an error page"
            ));
        }

        tokio::fs::rename(&part_path, &final_path)
            .await
            .with_context(|| format!("Failed to finalize {}", final_path.display()))?;

        Ok(FetchedFile {
            path: final_path,
            size,
            content_hash: hasher.finalize().to_hex().to_string(),
        })
    }

    fn new_download(
        &self,
        params: &DownloadParams,
        candidate: &Candidate,
        fetched: Option<&FetchedFile>,
    ) -> NewDownload {
        NewDownload {
            filename: candidate.filename.clone(),
            scheme: Some(params.scheme.clone()),
            fiscal_year: Some(params.fiscal_year),
            service_month: Some(params.service_month as i64),
            source_url: Some(candidate.url.clone()),
            file_size: fetched.map(|f| f.size as i64),
            file_path: fetched.map(|f| f.path.to_string_lossy().into_owned()),
            content_hash: fetched.map(|f| f.content_hash.clone()),
            ..Default::default()
        }
    }
}

async fn cleanup_part(part_path: &Path) {
    if let Err(err) = tokio::fs::remove_file(part_path).await {
        debug!("Could not remove {}: {}", part_path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use crate::domain::entities::Credential;
    use crate::domain::events::NullProgressSink;
    use crate::infrastructure::config::PortalConfig;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use crate::infrastructure::fingerprint::FingerprintPool;
    use crate::infrastructure::http_client::PortalClient;

    fn test_params() -> DownloadParams {
        DownloadParams {
            fiscal_year: 2568,
            service_month: 3,
            scheme: "UCS".to_string(),
            max_workers: 2,
            auto_import: false,
        }
    }

    fn fast_downloader() -> DownloaderConfig {
        DownloaderConfig {
            max_retries: 2,
            backoff_base_seconds: 0,
            backoff_max_seconds: 0,
            min_file_size_bytes: 100,
            rotation_error_threshold: 100,
            inter_download_delay_ms: 0,
            ..Default::default()
        }
    }

    fn test_credential() -> Credential {
        Credential {
            username: "worker".to_string(),
            secret: "not-used".to_string(),
            label: "test".to_string(),
            enabled: true,
        }
    }

    async fn test_setup(
        base_url: Option<String>,
        downloader: DownloaderConfig,
    ) -> (FetchEngine, Arc<SessionPool>, HistoryRepository, tempfile::TempDir) {
        let db = DatabaseConnection::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let history = HistoryRepository::new(db.pool().clone());

        let portal = Arc::new(PortalConfig {
            base_url: base_url.unwrap_or_else(|| "http://127.0.0.1:1".to_string()),
            request_timeout_seconds: 5,
            max_requests_per_second: 50,
            ..Default::default()
        });

        let dir = tempdir().unwrap();
        let engine = FetchEngine::new(
            history.clone(),
            downloader.clone(),
            dir.path().to_path_buf(),
        );

        let fingerprints = FingerprintPool::new();
        let client = PortalClient::new(
            fingerprints.shuffled().remove(0),
            Arc::clone(&portal),
        )
        .unwrap();

        let mut pool = SessionPool::new(fingerprints, portal, &downloader);
        pool.push_slot_for_test(SessionSlot {
            index: 0,
            client,
            credential: test_credential(),
            error_count: 0,
            total_downloads: 0,
        });

        (engine, Arc::new(pool), history, dir)
    }

    /// Minimal single-purpose HTTP server: answers every connection with
    /// the given status line and body, then closes.
    async fn spawn_http_server(status_line: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; 4096];
                    let _ = stream.read(&mut request).await;
                    let header = format!(
                        "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(header.as_bytes()).await;
                    let _ = stream.write_all(&body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn already_downloaded_candidates_are_skipped_without_network() {
        let (engine, pool, history, dir) = test_setup(None, fast_downloader()).await;

        // Seed history with a success record backed by a real file.
        let existing = dir.path().join("rep_old.xls");
        std::fs::write(&existing, vec![b'x'; 200]).unwrap();
        history
            .record_download(
                SourceType::Rep,
                &NewDownload {
                    filename: "rep_old.xls".to_string(),
                    file_path: Some(existing.to_string_lossy().into_owned()),
                    ..Default::default()
                },
                DownloadStatus::Success,
            )
            .await
            .unwrap();

        let summary = engine
            .run(
                pool,
                SourceType::Rep,
                &test_params(),
                vec![Candidate::new("http://127.0.0.1:1/never-hit", "rep_old.xls")],
                Arc::new(NullProgressSink),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.counts.total_discovered, 1);
        assert_eq!(summary.counts.already_downloaded, 1);
        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(summary.counts.to_download, 0);
        assert_eq!(summary.counts.processed, 1);
        assert!(summary.counts.is_complete());
        assert!(summary.downloaded_files.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_retries_and_records_each_attempt() {
        let (engine, pool, history, _dir) = test_setup(None, fast_downloader()).await;

        // Port 1 refuses connections; every attempt fails fast.
        let summary = engine
            .run(
                pool,
                SourceType::Rep,
                &test_params(),
                vec![Candidate::new("http://127.0.0.1:1/file", "rep_new.xls")],
                Arc::new(NullProgressSink),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.counts.downloaded, 0);
        assert_eq!(summary.counts.processed, 1);

        let record = history
            .get(SourceType::Rep, "rep_new.xls")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        // One history write per attempt: retry_count ends at max_retries.
        assert_eq!(record.retry_count, 2);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn successful_download_lands_on_disk_and_in_history() {
        let payload = vec![b'D'; 4096];
        let base = spawn_http_server("HTTP/1.1 200 OK", payload.clone()).await;
        let (engine, pool, history, dir) = test_setup(Some(base.clone()), fast_downloader()).await;

        let summary = engine
            .run(
                pool,
                SourceType::Stm,
                &test_params(),
                vec![Candidate::new(format!("{base}/download?filename=stm_1.xls"), "stm_1.xls")],
                Arc::new(NullProgressSink),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.counts.downloaded, 1);
        assert_eq!(summary.counts.failed, 0);
        assert_eq!(summary.downloaded_files.len(), 1);

        let final_path = dir.path().join("stm_1.xls");
        assert_eq!(std::fs::read(&final_path).unwrap(), payload);
        assert!(!dir.path().join("stm_1.xls.part").exists());

        let record = history
            .get(SourceType::Stm, "stm_1.xls")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DownloadStatus::Success);
        assert_eq!(record.file_size, Some(4096));
        assert_eq!(record.retry_count, 0);
        assert_eq!(
            record.content_hash.as_deref(),
            Some(blake3::hash(&payload).to_hex().as_str())
        );
    }

    #[tokio::test]
    async fn undersized_payload_is_rejected_as_error_page() {
        let base = spawn_http_server("HTTP/1.1 200 OK", b"<html>error</html>".to_vec()).await;
        let (engine, pool, history, dir) = test_setup(Some(base.clone()), fast_downloader()).await;

        let summary = engine
            .run(
                pool,
                SourceType::Rep,
                &test_params(),
                vec![Candidate::new(format!("{base}/download"), "tiny.xls")],
                Arc::new(NullProgressSink),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.counts.failed, 1);
        assert!(!dir.path().join("tiny.xls").exists());
        assert!(!dir.path().join("tiny.xls.part").exists());

        let record = history
            .get(SourceType::Rep, "tiny.xls")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert!(record.error_message.as_deref().unwrap().contains("too small"));
    }

    #[tokio::test]
    async fn rate_limit_status_is_reported_distinctly() {
        let base =
            spawn_http_server("HTTP/1.1 429 Too Many Requests", b"slow down".to_vec()).await;
        let (engine, pool, history, _dir) = test_setup(Some(base.clone()), fast_downloader()).await;

        let summary = engine
            .run(
                pool,
                SourceType::Rep,
                &test_params(),
                vec![Candidate::new(format!("{base}/download"), "limited.xls")],
                Arc::new(NullProgressSink),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.counts.failed, 1);
        let record = history
            .get(SourceType::Rep, "limited.xls")
            .await
            .unwrap()
            .unwrap();
        assert!(record.error_message.as_deref().unwrap().contains("rate limit"));
    }

    #[tokio::test]
    async fn cancellation_stops_remaining_items() {
        let (engine, pool, _history, _dir) = test_setup(None, fast_downloader()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = engine
            .run(
                pool,
                SourceType::Rep,
                &test_params(),
                vec![
                    Candidate::new("http://127.0.0.1:1/a", "a.xls"),
                    Candidate::new("http://127.0.0.1:1/b", "b.xls"),
                ],
                Arc::new(NullProgressSink),
                cancel,
            )
            .await
            .unwrap();

        // Nothing processed: the worker saw the flag before its first item.
        assert_eq!(summary.counts.processed, 0);
        assert_eq!(summary.counts.to_download, 2);
    }
}
