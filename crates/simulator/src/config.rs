use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub use common::{ChannelSettings, Environment};
use geomipc::paths;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub environment: Environment,
    pub channel: ChannelSettings,
    /// Explicit hand-off directory; resolved next to the executable if unset.
    pub handoff_dir: Option<PathBuf>,
    pub processor_name: String,
    pub stale_after: Option<Duration>,
}

impl SimulatorConfig {
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_env();
        let channel = ChannelSettings::from_env();

        let handoff_dir = env::var("GEOMIPC_HANDOFF_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let processor_name = env::var("GEOM_PROCESSOR_NAME")
            .unwrap_or_else(|_| paths::GEOM_PROCESSOR_PROCESS.to_string());

        let stale_after = env::var("STALE_AFTER_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs);

        Ok(Self {
            environment,
            channel,
            handoff_dir,
            processor_name,
            stale_after,
        })
    }

    /// Command-line values win over the environment.
    pub fn with_stale_after_secs(mut self, secs: Option<u64>) -> Self {
        if let Some(secs) = secs {
            self.stale_after = Some(Duration::from_secs(secs));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for var in ["GEOMIPC_HANDOFF_DIR", "GEOM_PROCESSOR_NAME", "STALE_AFTER_SECS"] {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        let config = SimulatorConfig::from_env().unwrap();
        assert_eq!(config.handoff_dir, None);
        assert_eq!(config.processor_name, "geomprocessor");
        assert_eq!(config.stale_after, None);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear();
        unsafe {
            env::set_var("GEOMIPC_HANDOFF_DIR", "/srv/handoff");
            env::set_var("GEOM_PROCESSOR_NAME", "occtworker");
            env::set_var("STALE_AFTER_SECS", "90");
        }
        let config = SimulatorConfig::from_env().unwrap();
        clear();

        assert_eq!(config.handoff_dir, Some(PathBuf::from("/srv/handoff")));
        assert_eq!(config.processor_name, "occtworker");
        assert_eq!(config.stale_after, Some(Duration::from_secs(90)));
    }

    #[test]
    #[serial]
    fn test_cli_deadline_wins() {
        clear();
        unsafe { env::set_var("STALE_AFTER_SECS", "90") };
        let config = SimulatorConfig::from_env().unwrap();
        clear();

        assert_eq!(
            config.clone().with_stale_after_secs(Some(5)).stale_after,
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            config.with_stale_after_secs(None).stale_after,
            Some(Duration::from_secs(90))
        );
    }
}
