use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

pub const DATA_DIR_ENV: &str = "MEMENTO_SYNC_DATA_DIR";
pub const DEBUG_ENV: &str = "MEMENTO_SYNC_DEBUG";

const DEFAULT_DATA_DIR: &str = "./memento-data";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Wall-clock cadence of the timer tick loop. Every tick adds one second
    /// of elapsed time regardless of this value.
    pub tick_interval_ms: u64,
    /// Upper bound for the widget handler's durable write.
    pub write_timeout_ms: u64,
    /// Running sessions whose last tick is older than this are paused on
    /// recovery instead of resumed.
    pub orphan_resume_threshold_secs: u64,
    /// Failed reconciliation attempts before an entry is dead-lettered.
    pub max_apply_attempts: u32,
    pub busy_timeout_ms: u64,
    pub log_level: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            write_timeout_ms: 2000,
            orphan_resume_threshold_secs: 10,
            max_apply_attempts: 5,
            busy_timeout_ms: 1500,
            log_level: "info".into(),
        }
    }
}

impl SyncSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn orphan_resume_threshold_ms(&self) -> i64 {
        i64::try_from(self.orphan_resume_threshold_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    /// A running session whose last tick is younger than this belongs to a
    /// live keeper on some surface.
    pub fn ownership_lease(&self) -> Duration {
        self.tick_interval().saturating_mul(3)
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<SyncSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring malformed settings at {}: {err}",
                    path.display()
                );
                SyncSettings::default()
            })
        } else {
            SyncSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> SyncSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: SyncSettings) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &SyncSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

pub fn data_dir_from_env() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
