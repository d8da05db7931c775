use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(PartialEq, Deserialize, Serialize, Debug, Clone)]
pub struct Port(u16);

#[derive(PartialEq, Deserialize, Serialize, Debug, Clone)]
pub struct Host(String);

#[derive(PartialEq, Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Host,
    pub port: Port,
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Host::default(),
            port: Port::default(),
            enabled: true,
        }
    }
}

impl Default for Port {
    fn default() -> Self {
        Port(DEFAULT_PORT)
    }
}

impl From<Port> for u16 {
    fn from(value: Port) -> Self {
        value.0
    }
}

impl From<u16> for Port {
    fn from(value: u16) -> Self {
        Port(value)
    }
}

impl Default for Host {
    fn default() -> Self {
        Host(String::from(DEFAULT_HOST))
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_defaults() {
        let config: ServerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.host.to_string(), DEFAULT_HOST);
        assert_eq!(u16::from(config.port), DEFAULT_PORT);
        assert!(config.enabled);

        let config: ServerConfig = serde_yaml::from_str("port: 4321\nenabled: false").unwrap();
        assert_eq!(u16::from(config.port), 4321);
        assert!(!config.enabled);
    }
}
