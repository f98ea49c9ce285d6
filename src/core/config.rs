use std::env;
use std::path::PathBuf;

/// Runtime configuration, read once at startup from `TASKBEAT_*` environment
/// variables. Every knob has a default so a bare `taskbeat beat` works in a
/// fresh checkout.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing the task store.
    pub database_url: PathBuf,
    /// SQLite file backing the broker queue.
    pub broker_url: PathBuf,
    /// SQLite file backing the result store (defaults to the broker file).
    pub result_backend: PathBuf,
    /// Root directory scanned for plugin subdirectories.
    pub plugins_dir: PathBuf,
    /// Root directory for per-plugin dependency environments.
    pub plugin_envs_dir: PathBuf,
    /// Beat max loop interval in seconds.
    pub beat_interval_secs: u64,
    /// Timezone for cron evaluation.
    pub timezone: ScheduleTimezone,
    pub cdc_host: String,
    pub cdc_port: u16,
    pub cdc_destination: String,
    pub cdc_batch_size: usize,
    /// Declarative CDC consumer definitions.
    pub consumers_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTimezone {
    Utc,
    Local,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: PathBuf::from(env_or("TASKBEAT_DATABASE_URL", "taskbeat.db")),
            broker_url: PathBuf::from(env_or("TASKBEAT_BROKER_URL", "taskbeat-broker.db")),
            result_backend: PathBuf::from(
                env::var("TASKBEAT_RESULT_BACKEND")
                    .unwrap_or_else(|_| env_or("TASKBEAT_BROKER_URL", "taskbeat-broker.db")),
            ),
            plugins_dir: PathBuf::from(env_or("TASKBEAT_PLUGINS_DIR", "plugins")),
            plugin_envs_dir: PathBuf::from(env_or("TASKBEAT_PLUGIN_ENVS_DIR", "plugin_envs")),
            beat_interval_secs: env_parse("TASKBEAT_BEAT_INTERVAL", 5),
            timezone: match env_or("TASKBEAT_TIMEZONE", "utc").to_lowercase().as_str() {
                "local" => ScheduleTimezone::Local,
                _ => ScheduleTimezone::Utc,
            },
            cdc_host: env_or("TASKBEAT_CDC_HOST", "127.0.0.1"),
            cdc_port: env_parse("TASKBEAT_CDC_PORT", 11111),
            cdc_destination: env_or("TASKBEAT_CDC_DESTINATION", "example"),
            cdc_batch_size: env_parse("TASKBEAT_CDC_BATCH_SIZE", 100),
            consumers_file: PathBuf::from(env_or("TASKBEAT_CONSUMERS_FILE", "consumers.json")),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
