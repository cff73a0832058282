//! Engine configuration

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::KelError;

pub const DEFAULT_DRAIN_LIMIT: usize = 1024;
pub const DEFAULT_INGEST_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum escrow re-attempts per drain
    pub drain_limit: usize,
    /// Capacity of the async ingest channel
    pub ingest_queue_depth: usize,
    /// Directory for file-backed storage; in-memory when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_limit: DEFAULT_DRAIN_LIMIT,
            ingest_queue_depth: DEFAULT_INGEST_QUEUE_DEPTH,
            data_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, KelError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from a variable lookup, falling back to defaults for
    /// unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KelError> {
        let drain_limit =
            parse_var(&lookup, "KEL_DRAIN_LIMIT")?.unwrap_or(DEFAULT_DRAIN_LIMIT);
        if drain_limit == 0 {
            return Err(KelError::ConfigError(
                "KEL_DRAIN_LIMIT must be positive".to_string(),
            ));
        }

        let ingest_queue_depth =
            parse_var(&lookup, "KEL_INGEST_QUEUE_DEPTH")?.unwrap_or(DEFAULT_INGEST_QUEUE_DEPTH);
        if ingest_queue_depth == 0 {
            return Err(KelError::ConfigError(
                "KEL_INGEST_QUEUE_DEPTH must be positive".to_string(),
            ));
        }

        let data_dir = lookup("KEL_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            drain_limit,
            ingest_queue_depth,
            data_dir,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, KelError>
where
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| KelError::ConfigError(format!("Invalid {}: {}", name, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("KEL_DRAIN_LIMIT", "16"),
            ("KEL_INGEST_QUEUE_DEPTH", " 8 "),
            ("KEL_DATA_DIR", "/var/lib/kel"),
        ]))
        .unwrap();
        assert_eq!(config.drain_limit, 16);
        assert_eq!(config.ingest_queue_depth, 8);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/kel")));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("KEL_DRAIN_LIMIT", "many")])),
            Err(KelError::ConfigError(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("KEL_INGEST_QUEUE_DEPTH", "0")])),
            Err(KelError::ConfigError(_))
        ));
    }

    #[test]
    fn test_empty_data_dir_is_memory() {
        let config = EngineConfig::from_lookup(lookup(&[("KEL_DATA_DIR", "")])).unwrap();
        assert!(config.data_dir.is_none());
    }
}
