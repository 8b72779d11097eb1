use crate::error::{Result, ShaleError};
use serde::Deserialize;

/// Highest failure-domain id; domains are tracked in a 64-bit mask.
pub const MAX_FAILURE_DOMAIN: u8 = 63;

#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    /// How many distinct failure domains every object is written to.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub addr: String,
    #[serde(rename = "failure-domain", default)]
    pub failure_domain: u8,
}

fn default_replicas() -> usize {
    1
}

impl BalancerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SHALE"))
            .build()
            .map_err(|error| ShaleError::Config(error.to_string()))?;

        let config: BalancerConfig = settings
            .try_deserialize()
            .map_err(|error| ShaleError::Config(error.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(ShaleError::Config(
                "config must list at least one backend".to_string(),
            ));
        }
        if self.replicas == 0 {
            return Err(ShaleError::Config(
                "replicas must be at least 1".to_string(),
            ));
        }
        for backend in &self.backends {
            if backend.addr.is_empty() {
                return Err(ShaleError::Config(
                    "backend addr cannot be empty".to_string(),
                ));
            }
            if backend.failure_domain > MAX_FAILURE_DOMAIN {
                return Err(ShaleError::Config(format!(
                    "failure-domain {} out of range 0..={}",
                    backend.failure_domain, MAX_FAILURE_DOMAIN
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balancer.yaml");
        let yaml = "replicas: 2\n\
                    backends:\n\
                    - addr: node-a:6001\n\
                    - addr: node-b:6001\n\
                    \x20 failure-domain: 1\n\
                    - addr: node-c:6001\n\
                    \x20 failure-domain: 2\n";
        std::fs::write(&path, yaml).unwrap();

        let config = BalancerConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.replicas, 2);
        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.backends[0].failure_domain, 0);
        assert_eq!(config.backends[2].failure_domain, 2);
        assert_eq!(config.backends[1].addr, "node-b:6001");
    }

    #[test]
    fn replicas_default_to_one() {
        let config = BalancerConfig {
            replicas: default_replicas(),
            backends: vec![BackendConfig {
                addr: "node:6001".to_string(),
                failure_domain: 0,
            }],
        };
        assert_eq!(config.replicas, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_configs() {
        let empty = BalancerConfig {
            replicas: 1,
            backends: Vec::new(),
        };
        assert!(empty.validate().is_err());

        let bad_domain = BalancerConfig {
            replicas: 1,
            backends: vec![BackendConfig {
                addr: "node:6001".to_string(),
                failure_domain: 64,
            }],
        };
        assert!(bad_domain.validate().is_err());
    }
}
