use std::env;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use streamcache_core::{
    CacheReader, CoreError, CoreResult, ErrorKind, FetchOutcome, Ledger, LockTable, MediaUri,
    MemoryLedger, NetClient, PlayListener, PlaybackSession, PlayerConfig, PresentationSurface,
    RangeFetcher, ReqwestNetClient, SessionState, SqliteLedger,
};

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let config = PlayerConfig::default();
    let ledger = match build_ledger() {
        Ok(ledger) => ledger,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };
    let cache_dir = cache_dir(&config);

    match args[1].as_str() {
        "fetch" => {
            let Some(url) = args.get(2) else {
                print_usage();
                return;
            };
            let name = args.get(3).map(|value| value.to_string());
            run_fetch(&config, ledger, cache_dir, url, name);
        }
        "status" => {
            let Some(url) = args.get(2) else {
                print_usage();
                return;
            };
            if let Err(err) = print_status(ledger.as_ref(), url) {
                eprintln!("error: {}", err);
            }
        }
        "ledger" => match ledger.list_records() {
            Ok(records) => {
                for record in records {
                    println!(
                        "{}\t{}/{}\t{}\t{}",
                        percent(record.downloaded_size, record.total_size),
                        format_bytes(record.downloaded_size),
                        format_bytes(record.total_size),
                        record.url,
                        record.saved_file.display()
                    );
                }
            }
            Err(err) => eprintln!("error: {}", err),
        },
        "history" => match ledger.list_history() {
            Ok(rows) => {
                for row in rows {
                    println!(
                        "{}\t{}\t{}\t{}",
                        row.finished_time,
                        format_bytes(row.total_size),
                        row.url,
                        row.saved_file.display()
                    );
                }
            }
            Err(err) => eprintln!("error: {}", err),
        },
        "forget" => {
            let Some(url) = args.get(2) else {
                print_usage();
                return;
            };
            let result = ledger
                .delete(url)
                .and_then(|_| ledger.delete_history(url));
            match result {
                Ok(()) => println!("forgot {}", url),
                Err(err) => eprintln!("error: {}", err),
            }
        }
        "export" => {
            let (Some(url), Some(dest)) = (args.get(2), args.get(3)) else {
                print_usage();
                return;
            };
            match export_cache(ledger.as_ref(), url, dest) {
                Ok(bytes) => println!("exported {} to {}", format_bytes(bytes), dest),
                Err(err) => eprintln!("error: {}", err),
            }
        }
        "play" => {
            let Some(url) = args.get(2) else {
                print_usage();
                return;
            };
            run_play(&config, ledger, cache_dir, url);
        }
        _ => print_usage(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn build_ledger() -> CoreResult<Arc<dyn Ledger>> {
    match env::var("STREAMCACHE_DB") {
        Ok(path) => Ok(Arc::new(SqliteLedger::new(path)?)),
        Err(_) => Ok(Arc::new(MemoryLedger::default())),
    }
}

fn build_net(config: &PlayerConfig) -> CoreResult<Arc<dyn NetClient>> {
    Ok(Arc::new(ReqwestNetClient::new(config)?))
}

fn cache_dir(config: &PlayerConfig) -> PathBuf {
    if let Ok(dir) = env::var("STREAMCACHE_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    match env::var("HOME") {
        Ok(home) => PathBuf::from(home)
            .join(".cache")
            .join("streamcache")
            .join(&config.cache_dir_name),
        Err(_) => PathBuf::from("/tmp/streamcache").join(&config.cache_dir_name),
    }
}

fn run_fetch(
    config: &PlayerConfig,
    ledger: Arc<dyn Ledger>,
    cache_dir: PathBuf,
    url: &str,
    name: Option<String>,
) {
    let net = match build_net(config) {
        Ok(net) => net,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };
    let mut fetcher = RangeFetcher::new(url, cache_dir, ledger, net, LockTable::new(), config.clone());
    if let Some(name) = name {
        fetcher = fetcher.with_file_name(name);
    }

    let started = Instant::now();
    let mut last_print = Instant::now();
    let mut first = None;
    let result = fetcher.download(|downloaded, total| {
        let base = *first.get_or_insert(downloaded);
        if last_print.elapsed() < Duration::from_secs(1) && downloaded < total {
            return;
        }
        last_print = Instant::now();
        let secs = started.elapsed().as_secs_f64();
        let speed = if secs > 0.0 {
            (downloaded.saturating_sub(base) as f64 / secs) as u64
        } else {
            0
        };
        let eta = if speed > 0 {
            format_duration(total.saturating_sub(downloaded) / speed)
        } else {
            "--:--".to_string()
        };
        println!(
            "{} {}/{} ({}/s) eta {}",
            percent(downloaded, total),
            format_bytes(downloaded),
            format_bytes(total),
            format_bytes(speed),
            eta
        );
    });

    match result {
        Ok(FetchOutcome::Completed(path)) => println!("saved: {}", path.display()),
        Ok(FetchOutcome::Stopped(path)) => println!("stopped: {}", path.display()),
        Err(err) => {
            eprintln!("error: {}", err);
            if err.is_resumable() {
                eprintln!("run fetch again to resume");
            }
        }
    }
}

fn print_status(ledger: &dyn Ledger, url: &str) -> CoreResult<()> {
    let record = ledger.get_record(url)?;
    let history = ledger.get_history(url)?;
    let file_exists = match (&record, &history) {
        (Some(record), _) => record.file_exists(),
        (None, Some(history)) => history.file_exists(),
        (None, None) => false,
    };
    let value = json!({
        "url": url,
        "record": record,
        "history": history,
        "file_exists": file_exists,
    });
    let text = serde_json::to_string_pretty(&value).map_err(|err| CoreError::Io(err.to_string()))?;
    println!("{}", text);
    Ok(())
}

/// Copies the bytes of the cache file that are known to be valid.
fn export_cache(ledger: &dyn Ledger, url: &str, dest: &str) -> CoreResult<u64> {
    let opened = if let Some(history) = ledger.get_history(url)? {
        CacheReader::complete(&history.saved_file)
    } else if let Some(record) = ledger.get_record(url)? {
        CacheReader::upto(&record.saved_file, record.downloaded_size)
    } else {
        return Err(CoreError::NotFound(url.to_string()));
    };
    let mut reader = opened.map_err(|err| CoreError::Io(err.to_string()))?;

    let mut out = File::create(dest).map_err(|err| CoreError::Io(err.to_string()))?;
    io::copy(&mut reader, &mut out).map_err(|err| CoreError::Io(err.to_string()))
}

/// Logs surface calls; it reports playing as soon as a source is set.
#[derive(Default)]
struct HeadlessSurface {
    playing: bool,
    plays: usize,
}

impl PresentationSurface for HeadlessSurface {
    fn play_video(&mut self, uri: &MediaUri, start_position_ms: u64) {
        self.plays += 1;
        self.playing = true;
        info!(uri = %uri, start_position_ms, "surface: play");
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn current_position_ms(&self) -> u64 {
        0
    }

    fn show_loading_progress(&mut self) {
        info!("surface: loading shown");
    }

    fn hide_loading_progress(&mut self) {
        info!("surface: loading hidden");
    }
}

struct ConsoleListener;

impl PlayListener for ConsoleListener {
    fn on_completion(&mut self) {
        println!("playback complete");
    }

    fn on_error(&mut self, kind: ErrorKind, message: &str) {
        eprintln!("{} error: {}", kind.as_str(), message);
    }
}

fn run_play(config: &PlayerConfig, ledger: Arc<dyn Ledger>, cache_dir: PathBuf, url: &str) {
    let net = match build_net(config) {
        Ok(net) => net,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };
    let mut session = PlaybackSession::new(
        url,
        cache_dir,
        HeadlessSurface::default(),
        ledger,
        net,
        LockTable::new(),
        config.clone(),
    );
    session.set_play_listener(Box::new(ConsoleListener));
    if let Err(err) = session.start() {
        eprintln!("error: {}", err);
        return;
    }

    let interval = Duration::from_millis(config.playing_check_interval_ms);
    let mut last_print = Instant::now();
    loop {
        session.pump(interval);
        session.drain();
        session.poll_playing();
        if session.state() == SessionState::Aborted {
            break;
        }
        if session.is_cache_complete() && !session.is_fetch_running() {
            break;
        }
        if last_print.elapsed() >= Duration::from_secs(1) {
            last_print = Instant::now();
            println!(
                "[{}] {} {}/{}",
                session.state(),
                percent(session.download_position(), session.total_size()),
                format_bytes(session.download_position()),
                format_bytes(session.total_size())
            );
        }
    }

    match session.cache_file() {
        Some(path) => println!(
            "[{}] cache: {} ({} surface plays)",
            session.state(),
            path.display(),
            session.surface().plays
        ),
        None => println!("[{}] no cache file", session.state()),
    }
}

fn print_usage() {
    eprintln!(
        "Usage: streamcache <command> [args]\n\
Commands:\n\
  fetch <url> [name]     Download into the cache folder (resumes)\n\
  status <url>           Show ledger and history rows as JSON\n\
  ledger                 List in-progress downloads\n\
  history                List finished downloads\n\
  forget <url>           Drop ledger and history rows\n\
  export <url> <dest>    Copy the valid part of the cache file\n\
  play <url>             Run a headless playback session\n\
Environment:\n\
  STREAMCACHE_DB         SQLite ledger path (in-memory when unset)\n\
  STREAMCACHE_CACHE_DIR  Cache folder\n\
  RUST_LOG               Log filter (default info)"
    );
}

fn percent(downloaded: u64, total: u64) -> String {
    if total > 0 {
        format!("{:.1}%", (downloaded as f64 / total as f64) * 100.0)
    } else {
        "--".to_string()
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

fn format_duration(seconds: u64) -> String {
    let (hours, rest) = (seconds / 3600, seconds % 3600);
    match hours {
        0 => format!("{:02}:{:02}", rest / 60, rest % 60),
        _ => format!("{:02}:{:02}:{:02}", hours, rest / 60, rest % 60),
    }
}
