//! Playback session that streams a remote media url while caching it.
//!
//! A session plays either the remote url or the local cache file. A
//! background fetch fills the cache and reports through [`SessionEvent`]s
//! queued to the thread that owns the session. All state changes happen on
//! that thread, inside [`PlaybackSession::pump`] / [`PlaybackSession::drain`]
//! or the direct callbacks (`on_surface_error`, `on_pause`, ...).
//!
//! Transitions:
//! `Resolving -> DirectPlay | CacheHandoff -> (Stalled <-> Recovering) -> Completed | Aborted`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PlayerConfig;
use crate::error::{CoreError, CoreResult};
use crate::fetcher::{spawn_fetch, FetchHandle, FetchOutcome, RangeFetcher};
use crate::ledger::Ledger;
use crate::locks::LockTable;
use crate::net::NetClient;
use crate::network::{NetworkMonitor, ObserverId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaUri {
    Remote(String),
    Local(PathBuf),
}

impl MediaUri {
    pub fn is_remote(&self) -> bool {
        matches!(self, MediaUri::Remote(_))
    }
}

impl fmt::Display for MediaUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaUri::Remote(url) => f.write_str(url),
            MediaUri::Local(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// The front end that renders media. Implemented by whatever widget the host uses.
pub trait PresentationSurface {
    fn play_video(&mut self, uri: &MediaUri, start_position_ms: u64);
    fn is_playing(&self) -> bool;
    fn current_position_ms(&self) -> u64;
    fn show_loading_progress(&mut self);
    fn hide_loading_progress(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Download,
    Playback,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Download => "download",
            ErrorKind::Playback => "playback",
        }
    }
}

pub trait PlayListener {
    fn on_completion(&mut self);
    fn on_error(&mut self, kind: ErrorKind, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    /// Rendering the remote url, or a fully cached file.
    DirectPlay,
    /// Rendering the partially downloaded cache file.
    CacheHandoff,
    Stalled,
    /// Cache source re-issued after a stall; waiting for the surface to play.
    Recovering,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Resolving => "resolving",
            SessionState::DirectPlay => "direct_play",
            SessionState::CacheHandoff => "cache_handoff",
            SessionState::Stalled => "stalled",
            SessionState::Recovering => "recovering",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Progress { downloaded: u64, total: u64 },
    FetchFinished(PathBuf),
    FetchStopped(PathBuf),
    DownloadFailed(String),
    SurfaceError { code: i32, extra: i32 },
    SurfaceCompletion,
    NetworkChanged(bool),
}

#[derive(Debug, Clone, Copy)]
struct Stall {
    position_ms: u64,
    download_start: u64,
}

pub struct PlaybackSession<S: PresentationSurface> {
    url: String,
    cache_folder: PathBuf,
    config: PlayerConfig,
    ledger: Arc<dyn Ledger>,
    net: Arc<dyn NetClient>,
    locks: LockTable,
    network: Option<NetworkMonitor>,
    observer: Option<ObserverId>,
    surface: S,
    listener: Option<Box<dyn PlayListener>>,
    state: SessionState,
    source: Option<MediaUri>,
    cache_file: Option<PathBuf>,
    cache_complete: bool,
    download_position: u64,
    total_size: u64,
    stall: Option<Stall>,
    paused_position_ms: Option<u64>,
    loading_visible: bool,
    fetch: Option<FetchHandle>,
    fetch_running: bool,
    destroyed: bool,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl<S: PresentationSurface> PlaybackSession<S> {
    pub fn new(
        url: impl Into<String>,
        cache_folder: impl Into<PathBuf>,
        surface: S,
        ledger: Arc<dyn Ledger>,
        net: Arc<dyn NetClient>,
        locks: LockTable,
        config: PlayerConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            url: url.into(),
            cache_folder: cache_folder.into(),
            config,
            ledger,
            net,
            locks,
            network: None,
            observer: None,
            surface,
            listener: None,
            state: SessionState::Resolving,
            source: None,
            cache_file: None,
            cache_complete: false,
            download_position: 0,
            total_size: 0,
            stall: None,
            paused_position_ms: None,
            loading_visible: false,
            fetch: None,
            fetch_running: false,
            destroyed: false,
            events_tx,
            events_rx,
        }
    }

    pub fn with_network_monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.network = Some(monitor);
        self
    }

    pub fn set_play_listener(&mut self, listener: Box<dyn PlayListener>) {
        self.listener = Some(listener);
    }

    /// For surface adapters that report from another thread.
    pub fn event_sender(&self) -> Sender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn render_source(&self) -> Option<&MediaUri> {
        self.source.as_ref()
    }

    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    pub fn download_position(&self) -> u64 {
        self.download_position
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_cache_complete(&self) -> bool {
        self.cache_complete
    }

    pub fn is_fetch_running(&self) -> bool {
        self.fetch_running
    }

    /// Bytes downloaded since the current stall began.
    pub fn cache_margin(&self) -> Option<u64> {
        self.stall
            .map(|stall| self.download_position.saturating_sub(stall.download_start))
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// Picks the initial source and, unless the url is fully cached, starts the fetch.
    pub fn start(&mut self) -> CoreResult<()> {
        if self.state != SessionState::Resolving || self.destroyed {
            return Err(CoreError::InvalidState(format!(
                "cannot start session in state {}",
                self.state
            )));
        }

        if let Some(history) = self.ledger.get_history(&self.url)? {
            if history.file_exists() {
                info!(url = %self.url, file = %history.saved_file.display(), "playing finished cache");
                self.cache_file = Some(history.saved_file.clone());
                self.cache_complete = true;
                self.total_size = history.total_size;
                self.download_position = history.total_size;
                self.play(MediaUri::Local(history.saved_file), 0);
                self.state = SessionState::DirectPlay;
                return Ok(());
            }
            warn!(url = %self.url, file = %history.saved_file.display(), "finished cache file missing");
            self.ledger.delete_history(&self.url)?;
        }

        self.observe_network();

        match self.ledger.get_record(&self.url)? {
            Some(record) if record.file_exists() => {
                info!(
                    url = %self.url,
                    offset = record.downloaded_size,
                    total = record.total_size,
                    "playing partial cache while resuming"
                );
                self.download_position = record.downloaded_size;
                self.total_size = record.total_size;
                self.cache_file = Some(record.saved_file.clone());
                self.play(MediaUri::Local(record.saved_file), 0);
                self.state = SessionState::CacheHandoff;
            }
            stale => {
                if let Some(record) = stale {
                    warn!(url = %self.url, file = %record.saved_file.display(), "discarding record without cache file");
                    self.ledger.delete(&self.url)?;
                }
                self.play(MediaUri::Remote(self.url.clone()), 0);
                self.state = SessionState::DirectPlay;
            }
        }

        self.start_fetch()
    }

    /// Handles at most one queued event, waiting up to `timeout` for it.
    pub fn pump(&mut self, timeout: Duration) -> bool {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Handles every event already queued.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0usize;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        if self.destroyed {
            return;
        }
        match event {
            SessionEvent::Progress { downloaded, total } => self.on_progress(downloaded, total),
            SessionEvent::FetchFinished(path) => self.on_fetch_finished(path),
            SessionEvent::FetchStopped(path) => {
                debug!(url = %self.url, file = %path.display(), "fetch stopped");
                self.fetch_running = false;
            }
            SessionEvent::DownloadFailed(message) => self.on_download_failed(&message),
            SessionEvent::SurfaceError { code, extra } => self.on_surface_error(code, extra),
            SessionEvent::SurfaceCompletion => self.on_surface_completion(),
            SessionEvent::NetworkChanged(connected) => self.on_network_changed(connected),
        }
    }

    /// The surface's error callback: treated as a stall until enough cache lands.
    pub fn on_surface_error(&mut self, code: i32, extra: i32) {
        if self.destroyed || self.state == SessionState::Stalled {
            return;
        }
        let local = self.source.as_ref().map(|uri| !uri.is_remote()).unwrap_or(false);
        if self.cache_complete && local {
            let message = format!("playback error code={} extra={}", code, extra);
            warn!(url = %self.url, code, extra, "playback error on complete cache");
            self.notify_error(ErrorKind::Playback, &message);
            return;
        }

        let position_ms = self
            .paused_position_ms
            .unwrap_or_else(|| self.surface.current_position_ms());
        self.stall = Some(Stall {
            position_ms,
            download_start: self.download_position,
        });
        self.state = SessionState::Stalled;
        self.show_loading();
        info!(
            url = %self.url,
            code,
            extra,
            position_ms,
            download_position = self.download_position,
            "playback stalled"
        );

        if self.cache_complete {
            self.recover();
        }
    }

    pub fn on_surface_completion(&mut self) {
        if self.destroyed {
            return;
        }
        info!(url = %self.url, "playback complete");
        self.stall = None;
        self.state = SessionState::Completed;
        self.hide_loading();
        if let Some(listener) = self.listener.as_mut() {
            listener.on_completion();
        }
    }

    /// Periodic check; hides the loading indicator once the surface plays.
    pub fn poll_playing(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        let playing = self.surface.is_playing();
        if playing {
            self.hide_loading();
            if self.state == SessionState::Recovering {
                self.state = SessionState::CacheHandoff;
            }
        }
        playing
    }

    pub fn on_pause(&mut self) {
        if self.destroyed {
            return;
        }
        self.paused_position_ms = Some(self.surface.current_position_ms());
    }

    pub fn on_resume(&mut self) {
        if self.destroyed {
            return;
        }
        let Some(position_ms) = self.paused_position_ms.take() else {
            return;
        };
        if matches!(
            self.state,
            SessionState::Stalled | SessionState::Completed | SessionState::Resolving
        ) {
            return;
        }
        if let Some(source) = self.source.clone() {
            self.play(source, position_ms);
        }
    }

    /// Stops the fetch without waiting for it; cache files stay on disk.
    pub fn on_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(fetch) = self.fetch.as_ref() {
            fetch.stop();
        }
        if let (Some(network), Some(id)) = (self.network.as_ref(), self.observer.take()) {
            network.unregister(id);
        }
        self.listener = None;
        debug!(url = %self.url, state = %self.state, "session destroyed");
    }

    fn on_progress(&mut self, downloaded: u64, total: u64) {
        self.download_position = downloaded;
        self.total_size = total;
        if self.cache_file.is_none() {
            self.cache_file = self
                .fetch
                .as_ref()
                .and_then(|fetch| fetch.snapshot().load())
                .map(|record| record.saved_file.clone());
        }

        if let Some(margin) = self.cache_margin() {
            if margin > self.config.cache_margin_bytes || downloaded >= total {
                self.recover();
            }
            return;
        }
        self.maybe_hand_off();
    }

    fn on_fetch_finished(&mut self, path: PathBuf) {
        info!(url = %self.url, file = %path.display(), "cache complete");
        self.fetch_running = false;
        self.cache_complete = true;
        self.cache_file = Some(path);
        self.download_position = self.total_size.max(self.download_position);
        if self.stall.is_some() {
            self.recover();
        } else {
            self.maybe_hand_off();
        }
    }

    fn on_download_failed(&mut self, message: &str) {
        warn!(url = %self.url, error = %message, "download failed");
        self.fetch_running = false;
        if self.state != SessionState::Completed {
            self.state = SessionState::Aborted;
        }
        self.notify_error(ErrorKind::Download, message);
    }

    fn on_network_changed(&mut self, connected: bool) {
        debug!(url = %self.url, connected, "network changed");
        if !connected
            || self.fetch_running
            || self.cache_complete
            || self.state == SessionState::Resolving
        {
            return;
        }
        info!(url = %self.url, offset = self.download_position, "network back, resuming fetch");
        if let Err(err) = self.start_fetch() {
            self.notify_error(ErrorKind::Download, &err.to_string());
            return;
        }
        if self.state == SessionState::Aborted {
            self.state = if self.stall.is_some() {
                SessionState::Stalled
            } else {
                match self.source {
                    Some(MediaUri::Local(_)) => SessionState::CacheHandoff,
                    _ => SessionState::DirectPlay,
                }
            };
        }
    }

    /// One-time switch from the remote url to the local cache, from position 0.
    fn maybe_hand_off(&mut self) {
        let remote = self.source.as_ref().map(MediaUri::is_remote).unwrap_or(false);
        if self.state != SessionState::DirectPlay || !remote {
            return;
        }
        let Some(cache_file) = self.cache_file.clone() else {
            return;
        };
        info!(url = %self.url, file = %cache_file.display(), "switching to local cache");
        self.play(MediaUri::Local(cache_file), 0);
        self.state = SessionState::CacheHandoff;
    }

    fn recover(&mut self) {
        let Some(stall) = self.stall else {
            return;
        };
        let Some(cache_file) = self.cache_file.clone() else {
            return;
        };
        info!(
            url = %self.url,
            position_ms = stall.position_ms,
            margin = self.download_position.saturating_sub(stall.download_start),
            "resuming from cache"
        );
        self.stall = None;
        self.paused_position_ms = None;
        self.play(MediaUri::Local(cache_file), stall.position_ms);
        self.state = SessionState::Recovering;
    }

    fn start_fetch(&mut self) -> CoreResult<()> {
        let fetcher = RangeFetcher::new(
            self.url.clone(),
            self.cache_folder.clone(),
            Arc::clone(&self.ledger),
            Arc::clone(&self.net),
            self.locks.clone(),
            self.config.clone(),
        );
        let progress_tx = self.events_tx.clone();
        let done_tx = self.events_tx.clone();
        let handle = spawn_fetch(
            fetcher,
            move |downloaded, total| {
                let _ = progress_tx.send(SessionEvent::Progress { downloaded, total });
            },
            move |result| {
                let event = match result {
                    Ok(FetchOutcome::Completed(path)) => SessionEvent::FetchFinished(path),
                    Ok(FetchOutcome::Stopped(path)) => SessionEvent::FetchStopped(path),
                    Err(err) => SessionEvent::DownloadFailed(err.to_string()),
                };
                let _ = done_tx.send(event);
            },
        )?;
        self.fetch = Some(handle);
        self.fetch_running = true;
        Ok(())
    }

    fn observe_network(&mut self) {
        if self.observer.is_some() {
            return;
        }
        if let Some(network) = self.network.as_ref() {
            let tx = self.events_tx.clone();
            self.observer = Some(network.register(move |connected| {
                let _ = tx.send(SessionEvent::NetworkChanged(connected));
            }));
        }
    }

    fn play(&mut self, uri: MediaUri, start_position_ms: u64) {
        debug!(url = %self.url, uri = %uri, start_position_ms, "play");
        if uri.is_remote() {
            self.show_loading();
        }
        self.surface.play_video(&uri, start_position_ms);
        self.source = Some(uri);
    }

    fn show_loading(&mut self) {
        if !self.loading_visible {
            self.loading_visible = true;
            self.surface.show_loading_progress();
        }
    }

    fn hide_loading(&mut self) {
        if self.loading_visible {
            self.loading_visible = false;
            self.surface.hide_loading_progress();
        }
    }

    fn notify_error(&mut self, kind: ErrorKind, message: &str) {
        if let Some(listener) = self.listener.as_mut() {
            listener.on_error(kind, message);
        }
    }
}

impl<S: PresentationSurface> Drop for PlaybackSession<S> {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
