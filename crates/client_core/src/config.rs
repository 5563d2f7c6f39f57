use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "planner.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub backend_url: String,
    pub cache_database_url: String,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub online_window_ms: u64,
    pub notice_ttl_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8443".into(),
            cache_database_url: "sqlite://./data/planner-cache.db".into(),
            poll_interval_ms: 3_000,
            heartbeat_interval_ms: 30_000,
            online_window_ms: 45_000,
            notice_ttl_ms: 6_000,
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn online_window(&self) -> Duration {
        Duration::from_millis(self.online_window_ms)
    }

    pub fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ttl_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    backend_url: Option<String>,
    cache_database_url: Option<String>,
    poll_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    online_window_ms: Option<u64>,
    notice_ttl_ms: Option<u64>,
}

/// Defaults, then `planner.toml` in the working directory, then environment.
pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |name| std::env::var(name).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(error) => {
                warn!(path = %path.display(), %error, "config: ignoring unreadable settings file")
            }
        }
    }

    if let Some(v) = lookup(&env, &["PLANNER_BACKEND_URL", "APP__BACKEND_URL"]) {
        settings.backend_url = v;
    }
    if let Some(v) = lookup(&env, &["PLANNER_CACHE_DATABASE_URL", "APP__CACHE_DATABASE_URL"]) {
        settings.cache_database_url = v;
    }
    apply_millis(
        &env,
        &["PLANNER_POLL_INTERVAL_MS", "APP__POLL_INTERVAL_MS"],
        &mut settings.poll_interval_ms,
    );
    apply_millis(
        &env,
        &["PLANNER_HEARTBEAT_INTERVAL_MS", "APP__HEARTBEAT_INTERVAL_MS"],
        &mut settings.heartbeat_interval_ms,
    );
    apply_millis(
        &env,
        &["PLANNER_ONLINE_WINDOW_MS", "APP__ONLINE_WINDOW_MS"],
        &mut settings.online_window_ms,
    );
    apply_millis(
        &env,
        &["PLANNER_NOTICE_TTL_MS", "APP__NOTICE_TTL_MS"],
        &mut settings.notice_ttl_ms,
    );

    settings
}

fn apply_file(settings: &mut SyncSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.backend_url {
        settings.backend_url = v;
    }
    if let Some(v) = file_cfg.cache_database_url {
        settings.cache_database_url = v;
    }
    set_millis("poll_interval_ms", file_cfg.poll_interval_ms, &mut settings.poll_interval_ms);
    set_millis(
        "heartbeat_interval_ms",
        file_cfg.heartbeat_interval_ms,
        &mut settings.heartbeat_interval_ms,
    );
    set_millis("online_window_ms", file_cfg.online_window_ms, &mut settings.online_window_ms);
    set_millis("notice_ttl_ms", file_cfg.notice_ttl_ms, &mut settings.notice_ttl_ms);
}

fn set_millis(name: &str, value: Option<u64>, target: &mut u64) {
    match value {
        Some(0) => warn!(name, "config: ignoring zero interval in settings file"),
        Some(v) => *target = v,
        None => {}
    }
}

/// Later names take precedence over earlier ones.
fn lookup(env: &impl Fn(&str) -> Option<String>, names: &[&str]) -> Option<String> {
    names.iter().rev().find_map(|name| env(name))
}

fn apply_millis(env: &impl Fn(&str) -> Option<String>, names: &[&str], target: &mut u64) {
    let Some(raw) = lookup(env, names) else {
        return;
    };
    match raw.trim().parse::<u64>() {
        Ok(parsed) if parsed > 0 => *target = parsed,
        _ => warn!(names = ?names, value = %raw, "config: ignoring invalid interval"),
    }
}
