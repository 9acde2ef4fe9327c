pub mod cache_reader;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod locks;
pub mod naming;
pub mod net;
pub mod network;
pub mod record;


pub use crate::cache_reader::CacheReader;
pub use crate::config::PlayerConfig;
pub use crate::coordinator::{
    ErrorKind, MediaUri, PlayListener, PlaybackSession, PresentationSurface, SessionEvent,
    SessionState,
};
pub use crate::error::{CoreError, CoreResult};
pub use crate::fetcher::{spawn_fetch, FetchHandle, FetchOutcome, FetchStopper, RangeFetcher};
pub use crate::ledger::{Ledger, MemoryLedger};
#[cfg(feature = "sqlite")]
pub use crate::ledger::SqliteLedger;
pub use crate::locks::LockTable;
pub use crate::net::{FetchRequest, NetClient, RemoteResponse, ReqwestNetClient};
pub use crate::network::NetworkMonitor;
pub use crate::record::{DownloadRecord, HistoryRecord};
