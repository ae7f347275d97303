//! Background compaction scheduler.
//!
//! A periodic tick either applies size/fragmentation thresholds (full mode)
//! or gates on a wall-clock window and weekday set (circular mode). Settings
//! are hot-swappable through the holder; the scheduler is never on the
//! mutation or DDL critical path.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Compaction settings document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Seconds between checks.
    pub check_period: u64,
    /// `"full"` applies size/fragmentation thresholds; anything else is
    /// circular mode.
    pub compaction_mode: String,
    /// Minimum on-disk size before full-mode compaction, in bytes.
    pub min_size: u64,
    /// Minimum fragmentation percentage before full-mode compaction.
    pub min_frag: u64,
    /// `"HH:MM,HH:MM"` window for circular mode; `"00:00,00:00"` means any
    /// time.
    pub interval: String,
    /// English weekday names gating circular mode; circular compaction runs
    /// only on a listed day.
    pub days_of_week: Vec<String>,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            check_period: 1200,
            compaction_mode: "circular".to_string(),
            min_size: 500 << 20,
            min_frag: 30,
            interval: "00:00,00:00".to_string(),
            days_of_week: Vec::new(),
        }
    }
}

/// Hot-swappable settings holder: readers take a cheap snapshot, writers
/// replace the whole document.
pub struct ConfigHolder {
    inner: RwLock<Arc<CompactionSettings>>,
}

impl ConfigHolder {
    pub fn new(settings: CompactionSettings) -> Self {
        Self {
            inner: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn load(&self) -> Arc<CompactionSettings> {
        self.inner.read().unwrap().clone()
    }

    pub fn store(&self, settings: CompactionSettings) {
        *self.inner.write().unwrap() = Arc::new(settings);
    }
}

/// Storage statistics for one index instance.
#[derive(Clone, Debug)]
pub struct IndexStorageStats {
    pub inst_id: u64,
    pub bucket: String,
    pub name: String,
    pub disk_size: u64,
    pub data_size: u64,
}

impl IndexStorageStats {
    /// Fragmentation percentage; zero for an empty store.
    pub fn fragmentation(&self) -> f64 {
        if self.disk_size == 0 {
            return 0.0;
        }
        let wasted = self.disk_size.saturating_sub(self.data_size);
        wasted as f64 / self.disk_size as f64 * 100.0
    }
}

/// Supplies storage statistics for the instances under management.
#[async_trait]
pub trait StorageStatsSource: Send + Sync + 'static {
    async fn storage_stats(&self) -> Vec<IndexStorageStats>;
}

/// Receives compaction requests.
#[async_trait]
pub trait CompactionSink: Send + Sync + 'static {
    async fn compact(&self, inst_id: u64) -> anyhow::Result<()>;
}

/// Decide whether `stats` warrants a compaction under `settings` at `now`.
pub fn needs_compaction(
    stats: &IndexStorageStats,
    settings: &CompactionSettings,
    now: NaiveDateTime,
) -> bool {
    let mode = settings.compaction_mode.to_lowercase();
    tracing::info!(
        inst_id = stats.inst_id,
        bucket = %stats.bucket,
        name = %stats.name,
        frag = stats.fragmentation(),
        mode = %mode,
        "checking fragmentation"
    );

    if mode == "full" {
        return stats.disk_size > settings.min_size
            && stats.fragmentation() >= settings.min_frag as f64;
    }

    // Circular mode gates on the configured window and weekday set; a day
    // outside the set, or no configured days at all, never compacts.
    if !within_interval(&settings.interval, now) {
        tracing::info!(interval = %settings.interval, "compaction skipped: outside interval");
        return false;
    }
    let today = weekday_name(now.weekday());
    let mut has_days = false;
    for day in &settings.days_of_week {
        if day.trim().eq_ignore_ascii_case(today) {
            return true;
        }
        has_days = true;
    }
    if has_days {
        tracing::info!(days = ?settings.days_of_week, "compaction skipped: not a configured day");
    }
    false
}

fn within_interval(interval: &str, now: NaiveDateTime) -> bool {
    if interval == "00:00,00:00" {
        return true;
    }
    let Some((start, end)) = parse_interval(interval) else {
        // An unparseable window never blocks; matches treating it as unset.
        return true;
    };
    let minute = now.hour() * 60 + now.minute();
    minute >= start && minute <= end
}

/// Parse `"HH:MM,HH:MM"` into minutes-of-day bounds.
fn parse_interval(interval: &str) -> Option<(u32, u32)> {
    let (start, end) = interval.split_once(',')?;
    Some((parse_clock(start)?, parse_clock(end)?))
}

fn parse_clock(clock: &str) -> Option<u32> {
    let (hours, minutes) = clock.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    Some(hours * 60 + minutes)
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Spawn the scheduler task.
pub fn spawn(
    source: Arc<dyn StorageStatsSource>,
    sink: Arc<dyn CompactionSink>,
    holder: Arc<ConfigHolder>,
    mut kill: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let period = Duration::from_secs(holder.load().check_period.max(1));
            tokio::select! {
                _ = kill.changed() => return,
                _ = tokio::time::sleep(period) => {}
            }

            let settings = holder.load();
            let now = Local::now().naive_local();
            for stats in source.storage_stats().await {
                if !needs_compaction(&stats, &settings, now) {
                    continue;
                }
                tracing::info!(inst_id = stats.inst_id, "compacting index instance");
                match sink.compact(stats.inst_id).await {
                    Ok(()) => {
                        tracing::info!(inst_id = stats.inst_id, "finished compacting index instance");
                    }
                    Err(err) => {
                        tracing::error!(
                            inst_id = stats.inst_id,
                            error = ?err,
                            "compaction failed"
                        );
                    }
                }
            }
        }
    })
}
