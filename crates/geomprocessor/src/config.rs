use anyhow::{Context, Result, bail};
use std::env;
use std::time::Duration;

pub use common::{ChannelSettings, Environment};

/// Which geometry engine handles requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineKind {
    Passthrough,
    /// External program; `{input}` and `{output}` are substituted per job.
    Command(String),
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub environment: Environment,
    pub channel: ChannelSettings,
    pub engine: EngineKind,
    /// Take over jobs a live processor has held this long.
    pub reclaim_after: Option<Duration>,
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_env();
        let channel = ChannelSettings::from_env();

        let engine = match env::var("GEOM_ENGINE")
            .unwrap_or_else(|_| "passthrough".to_string())
            .to_lowercase()
            .as_str()
        {
            "passthrough" => EngineKind::Passthrough,
            "command" => match env::var("GEOM_ENGINE_COMMAND") {
                Ok(template) if !template.trim().is_empty() => EngineKind::Command(template),
                _ => bail!("GEOM_ENGINE=command requires GEOM_ENGINE_COMMAND"),
            },
            other => bail!("Unknown GEOM_ENGINE '{other}' (expected passthrough or command)"),
        };

        let reclaim_after = match env::var("RECLAIM_AFTER_SECS") {
            Ok(secs) => {
                let secs: u64 = secs
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid RECLAIM_AFTER_SECS '{secs}'"))?;
                Some(Duration::from_secs(secs))
            }
            Err(_) => None,
        };

        Ok(Self {
            environment,
            channel,
            engine,
            reclaim_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for var in ["GEOM_ENGINE", "GEOM_ENGINE_COMMAND", "RECLAIM_AFTER_SECS"] {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_passthrough_by_default() {
        clear();
        let config = ProcessorConfig::from_env().unwrap();
        assert_eq!(config.engine, EngineKind::Passthrough);
        assert_eq!(config.reclaim_after, None);
    }

    #[test]
    #[serial]
    fn test_reclaim_deadline() {
        clear();
        unsafe { env::set_var("RECLAIM_AFTER_SECS", "600") };
        let config = ProcessorConfig::from_env().unwrap();
        assert_eq!(config.reclaim_after, Some(Duration::from_secs(600)));

        unsafe { env::set_var("RECLAIM_AFTER_SECS", "soon") };
        let err = ProcessorConfig::from_env().unwrap_err();
        clear();
        assert!(err.to_string().contains("RECLAIM_AFTER_SECS"));
    }

    #[test]
    #[serial]
    fn test_command_engine() {
        clear();
        unsafe {
            env::set_var("GEOM_ENGINE", "Command");
            env::set_var("GEOM_ENGINE_COMMAND", "cp {input} {output}");
        }
        let config = ProcessorConfig::from_env().unwrap();
        clear();

        assert_eq!(
            config.engine,
            EngineKind::Command("cp {input} {output}".to_string())
        );
    }

    #[test]
    #[serial]
    fn test_command_engine_needs_template() {
        clear();
        unsafe {
            env::set_var("GEOM_ENGINE", "command");
            env::set_var("GEOM_ENGINE_COMMAND", "   ");
        }
        let err = ProcessorConfig::from_env().unwrap_err();
        clear();
        assert!(err.to_string().contains("GEOM_ENGINE_COMMAND"));
    }

    #[test]
    #[serial]
    fn test_unknown_engine_is_rejected() {
        clear();
        unsafe { env::set_var("GEOM_ENGINE", "occt") };
        let err = ProcessorConfig::from_env().unwrap_err();
        clear();
        assert!(err.to_string().contains("occt"));
    }
}
