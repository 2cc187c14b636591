//! Configuration values consumed by the locator, resolver and responder.
//!
//! Parsing is left to the embedding application (the binary builds these from
//! command line flags); this module only owns the values, their defaults and
//! basic validation.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::core::Endpoints;

/// Default multicast group queries are sent to.
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

/// Default multicast port.
pub const DEFAULT_MULTICAST_PORT: u16 = 4061;

/// Default per-round timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

/// Default number of rebroadcasts after the first round.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default back-off window after a failed directory resolution.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(2000);

/// Where queries are broadcast and on which interfaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastConfig {
    /// Multicast group address.
    pub address: Ipv4Addr,
    /// Multicast group port.
    pub port: u16,
    /// Local interfaces to join the group on; one channel is opened per entry.
    pub interfaces: Vec<Ipv4Addr>,
}

impl MulticastConfig {
    pub fn group(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.address.is_multicast() {
            bail!("{} is not a multicast address", self.address);
        }
        if self.interfaces.is_empty() {
            bail!("at least one multicast interface is required");
        }
        Ok(())
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_MULTICAST_ADDR,
            port: DEFAULT_MULTICAST_PORT,
            interfaces: vec![Ipv4Addr::UNSPECIFIED],
        }
    }
}

/// Timing of adapter and entity queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Queries and replies from other domains are ignored.
    pub domain_id: String,
    /// How long a single broadcast round waits for an answer.
    pub timeout: Duration,
    /// How many times a round is rebroadcast before the query fails.
    pub retry_count: u32,
    /// Merge window for replica groups, as a multiple of the first reply's
    /// round-trip latency.
    pub latency_multiplier: u32,
}

impl LocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            bail!("query timeout must be greater than zero");
        }
        if self.latency_multiplier < 1 {
            bail!(
                "latency multiplier must be at least 1, got {}",
                self.latency_multiplier
            );
        }
        Ok(())
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            domain_id: String::new(),
            timeout: DEFAULT_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            latency_multiplier: 1,
        }
    }
}

/// Settings of the directory resolver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Only accept directory services with this instance name. `None`
    /// accepts the first instance that answers.
    pub instance_name: Option<String>,
    pub timeout: Duration,
    pub retry_count: u32,
    /// After a failed resolution, new attempts are suppressed for this long.
    pub retry_delay: Duration,
}

impl DirectoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            bail!("directory timeout must be greater than zero");
        }
        Ok(())
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            instance_name: None,
            timeout: DEFAULT_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Settings of a node that answers queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponderConfig {
    pub domain_id: String,
    /// Instance name advertised in directory replies.
    pub instance_name: String,
    /// Endpoints on which this node's directory RPC service is reachable.
    pub directory_endpoints: Endpoints,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            domain_id: String::new(),
            instance_name: "Locator".to_string(),
            directory_endpoints: Endpoints::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(MulticastConfig::default().validate().is_ok());
        assert!(LocatorConfig::default().validate().is_ok());
        assert!(DirectoryConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unicast_group_address() {
        let config = MulticastConfig {
            address: Ipv4Addr::new(10, 0, 0, 1),
            ..MulticastConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_latency_multiplier() {
        let config = LocatorConfig {
            latency_multiplier: 0,
            ..LocatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
