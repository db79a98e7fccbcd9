//! Lease parameters and the single runtime lease.
//!
//! [`LeaseParameters`] is the fully resolved configuration handed to the
//! peer in every OFFER and ACK. It is derived once from the
//! [`AddressPlan`] and never varies per request.
//!
//! [`Lease`] is the one binding this server tracks. Its absence is the idle
//! state; there is no server-side expiry, renewal is client-driven.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AddressPlan, HardwareAddress, ServerConfig};
use crate::error::{Error, Result};
use crate::options::ClasslessRoute;

/// Lease duration handed out when the config does not override it (24 hours).
pub const DEFAULT_LEASE_SECONDS: u32 = 86400;

/// Resolver handed out when neither the plan nor the config names one.
pub const DEFAULT_NAMESERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Returns the netmask for a prefix length (0..=32).
pub fn prefix_to_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len => u32::MAX << (32 - u32::from(len.min(32))),
    }
}

/// Converts a contiguous netmask to its prefix length.
///
/// Returns `None` when the mask has holes (e.g. `255.0.255.0`).
pub fn mask_to_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    if bits.leading_ones() + bits.trailing_zeros() != 32 {
        return None;
    }
    Some(bits.leading_ones() as u8)
}

/// Everything the peer is told, fixed for the lifetime of the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseParameters {
    pub address: Ipv4Addr,
    pub network: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub prefix_len: u8,
    pub router: Option<Ipv4Addr>,
    pub server_identifier: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub routes: Vec<ClasslessRoute>,
    pub lease_seconds: u32,
    pub renewal_seconds: u32,
    pub rebinding_seconds: u32,
}

impl LeaseParameters {
    /// Derives parameters from a plan using the default lease duration and
    /// the plan's own nameservers.
    pub fn derive(plan: &AddressPlan) -> Result<Self> {
        Self::derive_with(plan, None, None)
    }

    /// Derives parameters from a server config, applying its overrides.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::derive_with(
            &config.plan,
            config.lease_duration_seconds,
            config.dns_servers.as_deref(),
        )
    }

    /// Derives parameters with an optional lease duration and DNS list.
    ///
    /// The server identifier is left unspecified until the listener
    /// resolves its address; see [`with_server_identifier`](Self::with_server_identifier).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlan`] if the address or netmask is missing,
    /// the netmask is not contiguous, a route is malformed, or the lease
    /// duration is zero.
    pub fn derive_with(
        plan: &AddressPlan,
        lease_seconds: Option<u32>,
        dns_override: Option<&[Ipv4Addr]>,
    ) -> Result<Self> {
        let address = plan
            .address
            .ok_or_else(|| Error::InvalidPlan("primary address is missing".to_string()))?;
        let subnet_mask = plan
            .netmask
            .ok_or_else(|| Error::InvalidPlan("netmask is missing".to_string()))?;
        let prefix_len = mask_to_prefix(subnet_mask).ok_or_else(|| {
            Error::InvalidPlan(format!("netmask {} is not contiguous", subnet_mask))
        })?;

        let mask = u32::from(subnet_mask);
        let network = u32::from(address) & mask;
        let broadcast = network | !mask;

        let routes = plan
            .routes
            .iter()
            .map(classless_route)
            .collect::<Result<Vec<_>>>()?;

        let dns_servers = match dns_override {
            Some(servers) if !servers.is_empty() => servers.to_vec(),
            _ if !plan.nameservers.is_empty() => plan.nameservers.clone(),
            _ => vec![DEFAULT_NAMESERVER],
        };

        let lease_seconds = lease_seconds.unwrap_or(DEFAULT_LEASE_SECONDS);
        if lease_seconds == 0 {
            return Err(Error::InvalidPlan(
                "lease duration must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            address,
            network: Ipv4Addr::from(network),
            broadcast: Ipv4Addr::from(broadcast),
            subnet_mask,
            prefix_len,
            router: plan.gateway,
            server_identifier: Ipv4Addr::UNSPECIFIED,
            dns_servers,
            routes,
            lease_seconds,
            renewal_seconds: renewal_time(lease_seconds),
            rebinding_seconds: rebinding_time(lease_seconds),
        })
    }

    pub fn with_server_identifier(mut self, server_identifier: Ipv4Addr) -> Self {
        self.server_identifier = server_identifier;
        self
    }
}

/// T1: half the lease.
pub fn renewal_time(lease_seconds: u32) -> u32 {
    (u64::from(lease_seconds) / 2) as u32
}

/// T2: three quarters of the lease.
pub fn rebinding_time(lease_seconds: u32) -> u32 {
    (u64::from(lease_seconds) * 3 / 4) as u32
}

fn classless_route(route: &crate::config::Route) -> Result<ClasslessRoute> {
    let IpAddr::V4(destination) = route.destination else {
        return Err(Error::InvalidPlan(format!(
            "route destination {} is not IPv4",
            route.destination
        )));
    };

    if route.prefix_len > 32 {
        return Err(Error::InvalidPlan(format!(
            "route {}/{} has a prefix longer than 32",
            destination, route.prefix_len
        )));
    }

    let gateway = match route.gateway {
        None => None,
        Some(IpAddr::V4(gateway)) => Some(gateway),
        Some(IpAddr::V6(gateway)) => {
            return Err(Error::InvalidPlan(format!(
                "route {}/{} has IPv6 gateway {}",
                destination, route.prefix_len, gateway
            )));
        }
    };

    Ok(ClasslessRoute::new(destination, route.prefix_len, gateway))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    Offered,
    Bound,
}

/// The single binding between the peer and its planned address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub hardware_address: HardwareAddress,
    pub address: Ipv4Addr,
    pub state: LeaseState,
    pub offered_at: DateTime<Utc>,
    /// Last time the binding was acknowledged, including renewals.
    pub bound_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn offered(hardware_address: HardwareAddress, address: Ipv4Addr) -> Self {
        Self {
            hardware_address,
            address,
            state: LeaseState::Offered,
            offered_at: Utc::now(),
            bound_at: None,
        }
    }

    pub fn bind(&mut self) {
        self.state = LeaseState::Bound;
        self.bound_at = Some(Utc::now());
    }

    pub fn is_bound(&self) -> bool {
        self.state == LeaseState::Bound
    }
}
