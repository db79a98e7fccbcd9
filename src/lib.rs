//! # onelease
//!
//! A DHCP server (RFC 2131, RFC 2132) that hands exactly one precomputed
//! lease to exactly one peer, typically a virtual machine on the far side of
//! a tap device.
//!
//! ## Features
//!
//! - DISCOVER/OFFER and REQUEST/ACK exchange, NAK for foreign addresses
//! - RELEASE, DECLINE and INFORM handling
//! - Classless static routes (RFC 3442, option 121)
//! - Lease timers derived from the lease duration (T1 = 50%, T2 = 75%)
//! - Graceful, idempotent shutdown from any thread
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//!
//! use onelease::{AddressPlan, DhcpServer, HardwareAddress, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> onelease::Result<()> {
//!     let plan = AddressPlan {
//!         address: Some(Ipv4Addr::new(10, 1, 90, 5)),
//!         netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
//!         gateway: Some(Ipv4Addr::new(10, 1, 90, 1)),
//!         ..Default::default()
//!     };
//!     let peer: HardwareAddress = "52:54:00:12:34:56".parse()?;
//!
//!     let server = Arc::new(DhcpServer::new(ServerConfig::new(plan, peer))?);
//!     server.setup_listener(Ipv4Addr::UNSPECIFIED).await?;
//!
//!     let serving = Arc::clone(&server);
//!     let handle = tokio::spawn(async move { serving.serve().await });
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.close();
//!     handle.await.ok();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`ServerConfig`] - Address plan, peer MAC, lease overrides, listener settings
//! - [`LeaseParameters`] - Everything handed to the peer, derived once at startup
//! - [`Session`] - The Idle/Offered/Bound state machine for the single lease
//! - [`DhcpServer`] - UDP listener driving the session
//! - [`DhcpPacket`] - DHCP packet parsing and encoding
//! - [`DhcpOption`] - DHCP option types per RFC 2132

pub mod config;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod server;
pub mod session;

pub use config::{AddressPlan, HardwareAddress, ListenerConfig, Route, ServerConfig};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseParameters, LeaseState};
pub use options::{ClasslessRoute, ClientOptions, DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use server::DhcpServer;
pub use session::{DiscardReason, Outcome, Session, SessionState};
