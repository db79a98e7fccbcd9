use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Length of the `chaddr` slot in the DHCP header.
pub const MAX_HARDWARE_ADDRESS_LEN: usize = 16;

/// The resolved IP configuration the peer should receive.
///
/// Produced upstream by address management and consumed once at startup.
/// Fields are optional where the upstream result may omit them; missing
/// required values are rejected when lease parameters are derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPlan {
    pub address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
}

/// A destination subnet and the next hop used to reach it.
///
/// `gateway: None` means the destination is directly reachable on the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpAddr,
    pub prefix_len: u8,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl Route {
    pub fn new(destination: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            destination: IpAddr::V4(destination),
            prefix_len,
            gateway: gateway.map(IpAddr::V4),
        }
    }
}

/// Link-layer address of the one peer this server answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HardwareAddress(Vec<u8>);

impl HardwareAddress {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<[u8; 6]> for HardwareAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for HardwareAddress {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let bytes = value
            .split([':', '-'])
            .map(|part| {
                if part.len() != 2 {
                    return Err(Error::InvalidConfig(format!(
                        "invalid hardware address {:?}",
                        value
                    )));
                }
                u8::from_str_radix(part, 16).map_err(|_| {
                    Error::InvalidConfig(format!("invalid hardware address {:?}", value))
                })
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self(bytes))
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Socket-level settings for the listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub server_port: u16,
    pub client_port: u16,
    /// Device to bind to; also where the server identifier is looked up
    /// when listening on the unspecified address.
    pub interface: Option<String>,
    /// Explicit server identifier, skipping address resolution.
    pub server_identifier: Option<Ipv4Addr>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            server_port: DHCP_SERVER_PORT,
            client_port: DHCP_CLIENT_PORT,
            interface: None,
            server_identifier: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub plan: AddressPlan,
    pub peer_hardware_address: HardwareAddress,
    #[serde(default)]
    pub lease_duration_seconds: Option<u32>,
    /// Replaces the plan's nameservers when set and non-empty.
    #[serde(default)]
    pub dns_servers: Option<Vec<Ipv4Addr>>,
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl ServerConfig {
    pub fn new(plan: AddressPlan, peer_hardware_address: HardwareAddress) -> Self {
        Self {
            plan,
            peer_hardware_address,
            lease_duration_seconds: None,
            dns_servers: None,
            listener: ListenerConfig::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_hardware_address.is_empty() {
            return Err(Error::InvalidConfig(
                "peer_hardware_address must not be empty".to_string(),
            ));
        }

        if self.peer_hardware_address.len() > MAX_HARDWARE_ADDRESS_LEN {
            return Err(Error::InvalidConfig(format!(
                "peer_hardware_address is {} bytes (maximum {})",
                self.peer_hardware_address.len(),
                MAX_HARDWARE_ADDRESS_LEN
            )));
        }

        if self.lease_duration_seconds == Some(0) {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
