use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::config::PlayerConfig;
use crate::error::{CoreError, CoreResult};
use crate::ledger::Ledger;
use crate::locks::{LockTable, UrlLock};
use crate::naming::resolve_file_name;
use crate::net::{FetchRequest, NetClient, RemoteResponse};
use crate::record::DownloadRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed(PathBuf),
    /// Stop was requested; the ledger keeps the offset for a later resume.
    Stopped(PathBuf),
}

impl FetchOutcome {
    pub fn path(&self) -> &Path {
        match self {
            FetchOutcome::Completed(path) | FetchOutcome::Stopped(path) => path,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, FetchOutcome::Completed(_))
    }
}

/// Cooperative stop flag, observed by the read loop between chunks.
#[derive(Clone, Default)]
pub struct FetchStopper {
    flag: Arc<AtomicBool>,
}

impl FetchStopper {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Latest published copy of the record a fetch is writing.
///
/// The fetch loop replaces the whole `Arc` after every chunk, so readers on
/// other threads always see a consistent record.
#[derive(Clone, Default)]
pub struct ProgressSnapshot {
    current: Arc<RwLock<Option<Arc<DownloadRecord>>>>,
}

impl ProgressSnapshot {
    pub fn load(&self) -> Option<Arc<DownloadRecord>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    pub fn downloaded_size(&self) -> u64 {
        self.load().map(|record| record.downloaded_size).unwrap_or(0)
    }

    pub(crate) fn publish(&self, record: &DownloadRecord) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(Arc::new(record.clone()));
        }
    }
}

/// One resumable range download of `url` into a file under `save_folder`.
pub struct RangeFetcher {
    url: String,
    save_folder: PathBuf,
    file_name: Option<String>,
    resume_enabled: bool,
    config: PlayerConfig,
    ledger: Arc<dyn Ledger>,
    net: Arc<dyn NetClient>,
    locks: LockTable,
    stopper: FetchStopper,
    snapshot: ProgressSnapshot,
}

impl RangeFetcher {
    pub fn new(
        url: impl Into<String>,
        save_folder: impl Into<PathBuf>,
        ledger: Arc<dyn Ledger>,
        net: Arc<dyn NetClient>,
        locks: LockTable,
        config: PlayerConfig,
    ) -> Self {
        Self {
            url: url.into(),
            save_folder: save_folder.into(),
            file_name: None,
            resume_enabled: config.resume_enabled,
            config,
            ledger,
            net,
            locks,
            stopper: FetchStopper::default(),
            snapshot: ProgressSnapshot::default(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_resume(mut self, enabled: bool) -> Self {
        self.resume_enabled = enabled;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stopper(&self) -> FetchStopper {
        self.stopper.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Blocking; run it off the playback thread. `on_progress` receives
    /// `(downloaded, total)` once per written chunk.
    pub fn download<F>(&self, mut on_progress: F) -> CoreResult<FetchOutcome>
    where
        F: FnMut(u64, u64),
    {
        let lock = self.locks.acquire(&self.url)?;
        let result = self.run(&lock, &mut on_progress);
        if let Err(err) = &result {
            warn!(url = %self.url, error = %err, "fetch failed");
        }
        drop(lock);
        result.map_err(CoreError::into_transfer)
    }

    fn run(&self, _lock: &UrlLock, on_progress: &mut dyn FnMut(u64, u64)) -> CoreResult<FetchOutcome> {
        fs::create_dir_all(&self.save_folder).map_err(|err| CoreError::Io(err.to_string()))?;

        let existing = if self.resume_enabled {
            self.ledger.get_record(&self.url)?
        } else {
            None
        };

        let mut record = match existing {
            Some(record) if record.file_exists() => {
                if record.is_complete() {
                    info!(url = %self.url, "download already complete");
                    self.snapshot.publish(&record);
                    return self.finish(&record);
                }
                info!(
                    url = %self.url,
                    offset = record.downloaded_size,
                    total = record.total_size,
                    "resuming download"
                );
                record
            }
            Some(stale) => {
                warn!(url = %self.url, file = %stale.saved_file.display(), "cache file missing, starting over");
                self.ledger.delete(&self.url)?;
                self.create_record()?
            }
            None => self.create_record()?,
        };

        self.snapshot.publish(&record);
        if record.is_complete() {
            return self.finish(&record);
        }
        if self.stopper.is_stopped() {
            return Ok(FetchOutcome::Stopped(record.saved_file.clone()));
        }

        let req = FetchRequest::new(self.url.clone(), &self.config)
            .with_range(record.downloaded_size, record.total_size);
        let response = self.net.fetch(&req)?;
        check_range_status(&response, record.downloaded_size)?;

        self.stream_to_file(response, &mut record, on_progress)?;

        if record.is_complete() {
            return self.finish(&record);
        }
        if self.stopper.is_stopped() {
            info!(
                url = %self.url,
                offset = record.downloaded_size,
                total = record.total_size,
                "download stopped"
            );
            return Ok(FetchOutcome::Stopped(record.saved_file.clone()));
        }
        Err(CoreError::Transfer(format!(
            "stream ended at {} of {} bytes",
            record.downloaded_size, record.total_size
        )))
    }

    /// Metadata request, file pre-allocation and the initial ledger row.
    fn create_record(&self) -> CoreResult<DownloadRecord> {
        let req = FetchRequest::new(self.url.clone(), &self.config);
        let response = self.net.fetch(&req)?;
        if !response.is_ok() {
            return Err(CoreError::ServerResponse {
                status: response.status_code,
            });
        }
        let total_size = response.content_length.ok_or(CoreError::SizeUnknown)?;
        let file_name = resolve_file_name(
            self.file_name.as_deref(),
            &self.url,
            response.content_disposition.as_deref(),
            &self.config.default_suffix,
        );
        drop(response);

        let saved_file = self.save_folder.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&saved_file)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        file.set_len(total_size)
            .map_err(|err| CoreError::Io(err.to_string()))?;

        let mut record = DownloadRecord::new(self.url.clone(), total_size, saved_file);
        if self.resume_enabled {
            record.id = Some(self.ledger.save(&record)?);
        }
        debug!(url = %self.url, total = total_size, file = %record.saved_file.display(), "download record created");
        Ok(record)
    }

    fn stream_to_file(
        &self,
        mut response: RemoteResponse,
        record: &mut DownloadRecord,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> CoreResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&record.saved_file)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        file.seek(SeekFrom::Start(record.downloaded_size))
            .map_err(|err| CoreError::Io(err.to_string()))?;
        debug!(url = %self.url, offset = record.downloaded_size, "streaming to cache file");

        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        while !self.stopper.is_stopped() && !record.is_complete() {
            let read = match response.body.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(CoreError::Transfer(err.to_string())),
            };
            // bytes past the advertised size are dropped
            let writable = (read as u64).min(record.remaining()) as usize;
            file.write_all(&buffer[..writable])
                .map_err(|err| CoreError::Io(err.to_string()))?;
            record.downloaded_size += writable as u64;
            if self.resume_enabled {
                // the ledger never claims bytes that are not on disk yet
                file.sync_data()
                    .map_err(|err| CoreError::Io(err.to_string()))?;
                self.ledger.update(record)?;
            }
            self.snapshot.publish(record);
            trace!(url = %self.url, offset = record.downloaded_size, "chunk written");
            on_progress(record.downloaded_size, record.total_size);
        }

        file.sync_data()
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(())
    }

    fn finish(&self, record: &DownloadRecord) -> CoreResult<FetchOutcome> {
        // also clears a row left by an earlier resumable fetch
        self.ledger.delete(&self.url)?;
        self.ledger.save_history(&record.to_history())?;
        info!(url = %self.url, total = record.total_size, "download complete");
        Ok(FetchOutcome::Completed(record.saved_file.clone()))
    }
}

/// 206 is always accepted; 200 only from offset zero, where the full body
/// lines up with the file.
fn check_range_status(response: &RemoteResponse, offset: u64) -> CoreResult<()> {
    match response.status_code {
        206 => Ok(()),
        200 if offset == 0 => Ok(()),
        status => Err(CoreError::ServerResponse { status }),
    }
}

/// A fetch running on its own named thread.
pub struct FetchHandle {
    url: String,
    stopper: FetchStopper,
    snapshot: ProgressSnapshot,
    join: Option<JoinHandle<()>>,
}

impl FetchHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    pub fn is_finished(&self) -> bool {
        self.join
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Blocks until the fetch thread exits.
    pub fn join(mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

pub fn spawn_fetch<P, D>(fetcher: RangeFetcher, on_progress: P, on_done: D) -> CoreResult<FetchHandle>
where
    P: FnMut(u64, u64) + Send + 'static,
    D: FnOnce(CoreResult<FetchOutcome>) + Send + 'static,
{
    let url = fetcher.url.clone();
    let stopper = fetcher.stopper();
    let snapshot = fetcher.snapshot();
    let join = thread::Builder::new()
        .name("streamcache-fetch".to_string())
        .spawn(move || {
            let result = fetcher.download(on_progress);
            on_done(result);
        })
        .map_err(|err| CoreError::Io(err.to_string()))?;
    Ok(FetchHandle {
        url,
        stopper,
        snapshot,
        join: Some(join),
    })
}
