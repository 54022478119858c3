use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::Context;

/// Runtime settings, read from the environment (and `.env` when present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Upper bound on live sessions across all users.
    pub max_sessions: usize,
    /// Per-session outbound queue; pushes beyond it are dropped.
    pub session_queue: usize,
    /// How long the writer waits on one socket send before giving up.
    pub push_timeout_ms: u64,
    /// 0 disables the typing idle timeout.
    pub typing_idle_ms: u64,
    pub presence_buffer: usize,
    pub session_expiry_minutes: i64,
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://chat.db?mode=rwc".to_owned(),
            bind_address: "0.0.0.0:8080".to_owned(),
            max_sessions: 10_000,
            session_queue: 64,
            push_timeout_ms: 5_000,
            typing_idle_ms: 5_000,
            presence_buffer: 256,
            session_expiry_minutes: 60,
            json_logs: false,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: var("DATABASE_URL", defaults.database_url)?,
            bind_address: var("BIND_ADDRESS", defaults.bind_address)?,
            max_sessions: var("MAX_SESSIONS", defaults.max_sessions)?,
            session_queue: var("SESSION_QUEUE", defaults.session_queue)?.max(1),
            push_timeout_ms: var("PUSH_TIMEOUT_MS", defaults.push_timeout_ms)?,
            typing_idle_ms: var("TYPING_IDLE_MS", defaults.typing_idle_ms)?,
            presence_buffer: var("PRESENCE_BUFFER", defaults.presence_buffer)?.max(1),
            session_expiry_minutes: var("SESSION_EXPIRY_MINUTES", defaults.session_expiry_minutes)?,
            json_logs: var("JSON_LOGS", defaults.json_logs)?,
        })
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn typing_idle_timeout(&self) -> Option<Duration> {
        (self.typing_idle_ms > 0).then(|| Duration::from_millis(self.typing_idle_ms))
    }
}

fn var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match dotenv::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("invalid {name}={raw:?}")),
        Err(_) => Ok(default),
    }
}
