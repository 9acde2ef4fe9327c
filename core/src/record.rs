use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub type RecordId = i64;

/// Progress of one in-progress download, keyed by source url.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRecord {
    pub id: Option<RecordId>,
    pub url: String,
    pub downloaded_size: u64,
    pub total_size: u64,
    pub saved_file: PathBuf,
}

impl DownloadRecord {
    pub fn new(url: String, total_size: u64, saved_file: PathBuf) -> Self {
        Self {
            id: None,
            url,
            downloaded_size: 0,
            total_size,
            saved_file,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_size == self.total_size
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.downloaded_size)
    }

    pub fn file_exists(&self) -> bool {
        Path::new(&self.saved_file).is_file()
    }

    pub fn to_history(&self) -> HistoryRecord {
        HistoryRecord {
            id: None,
            url: self.url.clone(),
            total_size: self.total_size,
            saved_file: self.saved_file.clone(),
            finished_time: now_epoch(),
        }
    }
}

/// A completed download. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: Option<RecordId>,
    pub url: String,
    pub total_size: u64,
    pub saved_file: PathBuf,
    pub finished_time: u64,
}

impl HistoryRecord {
    pub fn file_exists(&self) -> bool {
        Path::new(&self.saved_file).is_file()
    }

    pub(crate) fn same_download(&self, other: &HistoryRecord) -> bool {
        self.url == other.url
            && self.total_size == other.total_size
            && self.saved_file == other.saved_file
    }
}

pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
