use geomipc::paths;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    /// `ENVIRONMENT`, development unless it says production.
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Environment::Development)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Where both hosts find the shared channel and how often they poll it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub name: String,
    pub shm_dir: PathBuf,
    pub poll_interval: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            name: paths::CHANNEL_NAME.to_string(),
            shm_dir: PathBuf::from(paths::DEFAULT_SHM_DIR),
            poll_interval: Duration::from_millis(paths::DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl ChannelSettings {
    /// `GEOMIPC_NAME`, `GEOMIPC_SHM_DIR` and `POLL_INTERVAL_MS`; unset,
    /// empty or unparsable values keep the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = env::var("GEOMIPC_NAME")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.name);

        let shm_dir = env::var("GEOMIPC_SHM_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.shm_dir);

        let poll_interval = env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        Self {
            name,
            shm_dir,
            poll_interval,
        }
    }
}
