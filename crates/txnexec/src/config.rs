//! Engine and session configuration.
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ExecError, Result};

/// How long to wait for a lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// How often a waiting transaction checks for deadlocks. Kept well below the
/// lock timeout so deadlocks surface before the timeout does.
pub const DEFAULT_DEADLOCK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed backoff between attempts of a statement that hit a concurrent
/// update.
pub const DEFAULT_CONCURRENT_UPDATE_BACKOFF: Duration = Duration::from_millis(100);

pub const DEFAULT_MEMORY_RESERVE_BYTES: usize = 1024 * 1024;

/// Configuration for an engine. Serialized durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    #[serde(with = "millis")]
    pub deadlock_check_interval: Duration,
    #[serde(with = "millis")]
    pub concurrent_update_backoff: Duration,
    /// Allow linking to remote replicas of tables that have no manager
    /// record.
    pub search_remote: bool,
    pub memory_reserve_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            deadlock_check_interval: DEFAULT_DEADLOCK_CHECK_INTERVAL,
            concurrent_update_backoff: DEFAULT_CONCURRENT_UPDATE_BACKOFF,
            search_remote: true,
            memory_reserve_bytes: DEFAULT_MEMORY_RESERVE_BYTES,
        }
    }
}

impl ExecConfig {
    /// Parse a config from json, filling in defaults for missing fields.
    pub fn from_json(s: &str) -> Result<ExecConfig> {
        let conf: ExecConfig = serde_json::from_str(s).map_err(|e| ExecError::InvalidSetting {
            name: "config".to_string(),
            reason: e.to_string(),
        })?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        LockTimeout::validate(self.lock_timeout)?;
        DeadlockCheckInterval::validate(self.deadlock_check_interval)?;
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Per-session settings, changeable with `Session::set_setting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub auto_commit: bool,
    pub lock_timeout: Duration,
    pub deadlock_check_interval: Duration,
}

impl SessionConfig {
    pub fn new(conf: &ExecConfig) -> Self {
        SessionConfig {
            auto_commit: true,
            lock_timeout: conf.lock_timeout,
            deadlock_check_interval: conf.deadlock_check_interval,
        }
    }

    pub fn set_from_str(&mut self, name: &str, value: &str) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name.to_lowercase().as_str())
            .ok_or_else(|| ExecError::UnknownSetting(name.to_string()))?;
        (func.set)(value, self)
    }

    pub fn get_as_string(&self, name: &str) -> Result<String> {
        let func = GET_SET_FUNCTIONS
            .get(name.to_lowercase().as_str())
            .ok_or_else(|| ExecError::UnknownSetting(name.to_string()))?;
        Ok((func.get)(self))
    }
}

struct SettingFunctions {
    set: fn(value: &str, conf: &mut SessionConfig) -> Result<()>,
    get: fn(conf: &SessionConfig) -> String,
}

impl SettingFunctions {
    const fn new<S: SessionSetting>() -> Self {
        SettingFunctions {
            set: S::set_from_str as _,
            get: S::get_as_string as _,
        }
    }
}

fn insert_setting<S: SessionSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<AutoCommit>(&mut map);
    insert_setting::<LockTimeout>(&mut map);
    insert_setting::<DeadlockCheckInterval>(&mut map);

    map
});

pub trait SessionSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, conf: &mut SessionConfig) -> Result<()>;
    fn get_as_string(conf: &SessionConfig) -> String;
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        _ => Err(ExecError::InvalidSetting {
            name: name.to_string(),
            reason: format!("expected a boolean, got '{value}'"),
        }),
    }
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ExecError::InvalidSetting {
            name: name.to_string(),
            reason: format!("expected milliseconds, got '{value}'"),
        })
}

pub struct AutoCommit;

impl SessionSetting for AutoCommit {
    const NAME: &'static str = "auto_commit";
    const DESCRIPTION: &'static str = "Commit after every statement";

    fn set_from_str(value: &str, conf: &mut SessionConfig) -> Result<()> {
        conf.auto_commit = parse_bool(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &SessionConfig) -> String {
        conf.auto_commit.to_string()
    }
}

const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub struct LockTimeout;

impl LockTimeout {
    pub fn validate(val: Duration) -> Result<()> {
        if val.is_zero() || val > MAX_LOCK_TIMEOUT {
            return Err(ExecError::InvalidSetting {
                name: Self::NAME.to_string(),
                reason: format!("must be between 1ms and {MAX_LOCK_TIMEOUT:?}"),
            });
        }
        Ok(())
    }
}

impl SessionSetting for LockTimeout {
    const NAME: &'static str = "lock_timeout";
    const DESCRIPTION: &'static str = "Milliseconds to wait for a table lock";

    fn set_from_str(value: &str, conf: &mut SessionConfig) -> Result<()> {
        let val = parse_millis(Self::NAME, value)?;
        Self::validate(val)?;
        conf.lock_timeout = val;
        Ok(())
    }

    fn get_as_string(conf: &SessionConfig) -> String {
        conf.lock_timeout.as_millis().to_string()
    }
}

pub struct DeadlockCheckInterval;

impl DeadlockCheckInterval {
    pub fn validate(val: Duration) -> Result<()> {
        if val.is_zero() {
            return Err(ExecError::InvalidSetting {
                name: Self::NAME.to_string(),
                reason: "must be at least 1ms".to_string(),
            });
        }
        Ok(())
    }
}

impl SessionSetting for DeadlockCheckInterval {
    const NAME: &'static str = "deadlock_check_interval";
    const DESCRIPTION: &'static str =
        "Milliseconds between lock attempts while checking for deadlocks";

    fn set_from_str(value: &str, conf: &mut SessionConfig) -> Result<()> {
        let val = parse_millis(Self::NAME, value)?;
        Self::validate(val)?;
        conf.deadlock_check_interval = val;
        Ok(())
    }

    fn get_as_string(conf: &SessionConfig) -> String {
        conf.deadlock_check_interval.as_millis().to_string()
    }
}
