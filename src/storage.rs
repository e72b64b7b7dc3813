// =============================================================================
// Storage — atomic JSON persistence, data-directory layout, process lock
// =============================================================================
//
// Every critical write follows write-temp-in-same-directory -> fsync ->
// rename-over-existing, with the previous version promoted to `.bak` first.
// Readers therefore always observe either the old or the new version, never a
// partial write, and can fall back to the backup on parse failure.
// =============================================================================

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::market_data::Candle;
use crate::types::{Pair, StartupRecord, TradeRecord};

// ---------------------------------------------------------------------------
// Data-directory layout
// ---------------------------------------------------------------------------

/// Resolver for every file the engine persists.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory skeleton; idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join("performance"),
            self.root.join("cache"),
            self.root.join("trades"),
            self.root.join("historical"),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn portfolio(&self) -> PathBuf {
        self.root.join("portfolio.json")
    }

    pub fn snapshots(&self) -> PathBuf {
        self.root.join("performance").join("portfolio_snapshots.json")
    }

    pub fn performance_config(&self) -> PathBuf {
        self.root.join("performance").join("performance_config.json")
    }

    pub fn latest_decisions(&self) -> PathBuf {
        self.root.join("cache").join("latest_decisions.json")
    }

    pub fn startup_record(&self) -> PathBuf {
        self.root.join("cache").join("bot_startup.json")
    }

    pub fn trade_history(&self) -> PathBuf {
        self.root.join("trades").join("trade_history.json")
    }

    pub fn historical(&self, pair: &Pair, granularity_sec: u64, period: &str) -> PathBuf {
        self.root
            .join("historical")
            .join(format!("{pair}_{granularity_sec}_{period}.csv"))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("meridian.lock")
    }
}

// ---------------------------------------------------------------------------
// Atomic JSON primitives
// ---------------------------------------------------------------------------

/// Sibling `.bak` path for a persisted file.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Atomically serialise `value` to `path`.
///
/// Sequence: promote the current version to `.bak`, write a `.tmp` sibling,
/// fsync it, rename it over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content =
        serde_json::to_string_pretty(value).context("failed to serialise value to JSON")?;

    if path.exists() {
        let bak = backup_path(path);
        fs::copy(path, &bak)
            .with_context(|| format!("failed to promote backup {}", bak.display()))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync tmp file {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} over {}", tmp.display(), path.display()))?;

    debug!(path = %path.display(), bytes = content.len(), "atomic write complete");
    Ok(())
}

/// Read and parse one JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Read with a short retry loop: tolerates the missing-then-present window a
/// concurrent atomic writer can expose.
pub fn read_json_retry<T: DeserializeOwned>(path: &Path, attempts: u32) -> Result<T> {
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match read_json(path) {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

// ---------------------------------------------------------------------------
// Append-only logs and rings
// ---------------------------------------------------------------------------

/// Append one record to the trade history (`trades/trade_history.json`).
pub fn append_trade(path: &Path, record: &TradeRecord) -> Result<()> {
    let mut trades: Vec<TradeRecord> = if path.exists() {
        read_json(path).unwrap_or_else(|e| {
            warn!(error = %e, "trade history unreadable — starting a fresh log");
            Vec::new()
        })
    } else {
        Vec::new()
    };
    trades.push(record.clone());
    write_json_atomic(path, &trades)
}

/// Load the full trade history (empty when absent). The short retry covers
/// the rename window of a concurrent atomic writer.
pub fn load_trades(path: &Path) -> Vec<TradeRecord> {
    if path.exists() {
        read_json_retry(path, 3).unwrap_or_default()
    } else {
        Vec::new()
    }
}

/// Overwrite a bounded most-recent-first ring (dashboard caches).
pub fn write_ring<T: Serialize>(path: &Path, items: &[T], cap: usize) -> Result<()> {
    let start = items.len().saturating_sub(cap);
    write_json_atomic(path, &items[start..])
}

// ---------------------------------------------------------------------------
// Startup record
// ---------------------------------------------------------------------------

pub fn write_startup_record(path: &Path, record: &StartupRecord) -> Result<()> {
    write_json_atomic(path, record)
}

// ---------------------------------------------------------------------------
// Historical OHLCV archive (CSV)
// ---------------------------------------------------------------------------

/// Archive a candle window as columnar CSV. Best-effort; callers log and
/// continue on failure.
pub fn archive_candles(path: &Path, candles: &[Candle]) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut writer = csv::Writer::from_path(&tmp)
            .with_context(|| format!("failed to open archive {}", tmp.display()))?;
        writer
            .write_record(["time", "low", "high", "open", "close", "volume"])
            .context("failed to write archive header")?;
        for c in candles {
            writer
                .write_record([
                    c.time.to_string(),
                    c.low.to_string(),
                    c.high.to_string(),
                    c.open.to_string(),
                    c.close.to_string(),
                    c.volume.to_string(),
                ])
                .context("failed to write archive row")?;
        }
        writer.flush().context("failed to flush archive")?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename archive into {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Process lock
// ---------------------------------------------------------------------------

/// Single-process guarantee: a pid file whose holder is verified against a
/// live process. Stale locks (dead pid) are reclaimed; a live holder makes
/// startup fail with a distinct exit code.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    pid: u32,
}

impl ProcessLock {
    /// Try to acquire the lock for the current process.
    pub fn acquire(path: &Path) -> Result<Self, EngineError> {
        let own_pid = std::process::id();

        if let Ok(content) = fs::read_to_string(path) {
            if let Ok(holder) = content.trim().parse::<u32>() {
                if holder != own_pid && process_alive(holder) {
                    return Err(EngineError::LockContested { holder_pid: holder });
                }
                if holder != own_pid {
                    warn!(stale_pid = holder, "reclaiming stale process lock");
                }
            } else {
                warn!(path = %path.display(), "unparseable lock file — reclaiming");
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::LockUnavailable {
                path: path.display().to_string(),
                reason: format!("cannot create lock dir: {e}"),
            })?;
        }
        fs::write(path, own_pid.to_string()).map_err(|e| EngineError::LockUnavailable {
            path: path.display().to_string(),
            reason: format!("cannot write lock: {e}"),
        })?;

        info!(pid = own_pid, path = %path.display(), "process lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid: own_pid,
        })
    }

    /// Release explicitly (also runs on drop).
    pub fn release(&self) {
        if let Ok(content) = fs::read_to_string(&self.path) {
            if content.trim().parse::<u32>() == Ok(self.pid) {
                if fs::remove_file(&self.path).is_ok() {
                    info!(pid = self.pid, "process lock released");
                }
            }
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Liveness probe for a pid. On Linux this checks `/proc/<pid>`; elsewhere a
/// held lock is conservatively treated as live.
fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, TradeStatus};
    use serde::Deserialize;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("meridian-storage-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        value: u64,
    }

    #[test]
    fn atomic_write_roundtrip() {
        let dir = temp_dir();
        let path = dir.join("doc.json");
        let doc = Doc {
            name: "alpha".into(),
            value: 42,
        };

        write_json_atomic(&path, &doc).unwrap();
        let loaded: Doc = read_json(&path).unwrap();
        assert_eq!(loaded, doc);

        // No stray tmp file remains.
        assert!(!path.with_file_name("doc.json.tmp").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn second_write_promotes_backup() {
        let dir = temp_dir();
        let path = dir.join("doc.json");

        let first = Doc {
            name: "first".into(),
            value: 1,
        };
        let second = Doc {
            name: "second".into(),
            value: 2,
        };
        write_json_atomic(&path, &first).unwrap();
        write_json_atomic(&path, &second).unwrap();

        let bak: Doc = read_json(&backup_path(&path)).unwrap();
        assert_eq!(bak, first);
        let current: Doc = read_json(&path).unwrap();
        assert_eq!(current, second);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn read_retry_surfaces_missing_file() {
        let dir = temp_dir();
        let missing = dir.join("absent.json");
        assert!(read_json_retry::<Doc>(&missing, 2).is_err());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn trade_log_appends_in_order() {
        let dir = temp_dir();
        let path = dir.join("trade_history.json");

        for i in 0..3 {
            let record = TradeRecord {
                id: format!("t-{i}"),
                timestamp_utc: "2026-01-01T00:00:00Z".into(),
                pair: Pair::parse("BTC-EUR").unwrap(),
                side: Side::Buy,
                base_amount: 0.01,
                quote_amount: 100.0,
                price: 10_000.0,
                fees: 0.1,
                strategy: "combined".into(),
                confidence: 60.0,
                reasoning: "test".into(),
                order_id: format!("o-{i}"),
                status: TradeStatus::Simulated,
                pnl: None,
            };
            append_trade(&path, &record).unwrap();
        }

        let trades = load_trades(&path);
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].id, "t-0");
        assert_eq!(trades[2].id, "t-2");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ring_is_bounded() {
        let dir = temp_dir();
        let path = dir.join("ring.json");
        let items: Vec<u32> = (0..10).collect();
        write_ring(&path, &items, 4).unwrap();
        let loaded: Vec<u32> = read_json(&path).unwrap();
        assert_eq!(loaded, vec![6, 7, 8, 9]);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn archive_writes_csv() {
        let dir = temp_dir();
        let paths = DataPaths::new(&dir);
        paths.ensure_layout().unwrap();
        let pair = Pair::parse("BTC-EUR").unwrap();
        let target = paths.historical(&pair, 3600, "300");

        let candles = vec![
            Candle {
                time: 0,
                low: 1.0,
                high: 2.0,
                open: 1.5,
                close: 1.8,
                volume: 3.0,
            },
            Candle {
                time: 3600,
                low: 1.8,
                high: 2.2,
                open: 1.8,
                close: 2.0,
                volume: 4.0,
            },
        ];
        archive_candles(&target, &candles).unwrap();

        let content = fs::read_to_string(&target).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "time,low,high,open,close,volume");
        assert!(lines.next().unwrap().starts_with("0,"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn layout_paths_are_under_root() {
        let paths = DataPaths::new("/tmp/meridian-x");
        assert!(paths.portfolio().ends_with("portfolio.json"));
        assert!(paths
            .snapshots()
            .ends_with("performance/portfolio_snapshots.json"));
        assert!(paths.latest_decisions().ends_with("cache/latest_decisions.json"));
        assert!(paths.startup_record().ends_with("cache/bot_startup.json"));
        assert!(paths.trade_history().ends_with("trades/trade_history.json"));
    }

    #[test]
    fn lock_reclaims_stale_and_blocks_live() {
        let dir = temp_dir();
        let lock_path = dir.join("meridian.lock");

        // A pid that cannot be alive: pid_max on Linux caps well below this.
        fs::write(&lock_path, "4194304999").unwrap();
        let lock = ProcessLock::acquire(&lock_path).unwrap();

        // Our own pid now holds it; a second acquire from the same process
        // succeeds (same pid), but a different live pid would contest.
        drop(lock);
        assert!(!lock_path.exists(), "release removes the lock file");

        // A live holder (our own process id written by someone else) blocks.
        fs::write(&lock_path, "1").unwrap(); // pid 1 is always alive on Linux
        match ProcessLock::acquire(&lock_path) {
            Err(EngineError::LockContested { holder_pid }) => assert_eq!(holder_pid, 1),
            other => panic!("expected LockContested, got {other:?}"),
        }
        fs::remove_dir_all(&dir).ok();
    }
}
