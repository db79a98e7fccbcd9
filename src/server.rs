use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ListenerConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseParameters};
use crate::options::MessageType;
use crate::packet::DhcpPacket;
use crate::session::{Outcome, Session};

const RECV_BUFFER_SIZE: usize = 1500;

/// A DHCP server for exactly one peer.
///
/// Lifecycle: [`new`](Self::new) validates the config and derives the lease
/// parameters, [`setup_listener`](Self::setup_listener) binds the socket,
/// [`serve`](Self::serve) runs until [`close`](Self::close) is called from
/// any task or thread.
pub struct DhcpServer {
    config: Arc<ServerConfig>,
    session: Mutex<Session>,
    socket: Mutex<Option<UdpSocket>>,
    shutdown: watch::Sender<bool>,
    discarded: AtomicU64,
}

impl DhcpServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let params = LeaseParameters::from_config(&config)?;

        info!(
            "Serving {}/{} to {} (router: {}, routes: {}, DNS: {:?})",
            params.address,
            params.prefix_len,
            config.peer_hardware_address,
            params
                .router
                .map_or_else(|| "none".to_string(), |router| router.to_string()),
            params.routes.len(),
            params.dns_servers
        );

        let session = Session::new(params, config.peer_hardware_address.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            session: Mutex::new(session),
            socket: Mutex::new(None),
            shutdown,
            discarded: AtomicU64::new(0),
        })
    }

    /// Binds the DHCP socket inside the current network namespace.
    ///
    /// Returns the bound local address. The server identifier handed to the
    /// peer is resolved here as well.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] when the socket cannot be created, configured
    /// or bound, or when no server identifier can be resolved.
    pub async fn setup_listener(&self, bind_address: Ipv4Addr) -> Result<SocketAddr> {
        let listener = &self.config.listener;
        let socket = create_socket(listener, bind_address)?;
        let local_addr = socket
            .local_addr()
            .map_err(|error| Error::Bind(format!("Failed to read local address: {}", error)))?;

        let server_identifier = resolve_server_identifier(listener, bind_address)?;
        self.session
            .lock()
            .await
            .set_server_identifier(server_identifier);

        let mut slot = self.socket.lock().await;
        if self.is_closed() {
            // close() could not reach the slot while it was locked here.
            info!("Server closed while binding, dropping listener on {}", local_addr);
            return Ok(local_addr);
        }
        *slot = Some(socket);

        info!(
            "DHCP listener bound to {} (server identifier {})",
            local_addr, server_identifier
        );

        Ok(local_addr)
    }

    /// Runs the receive loop until [`close`](Self::close) is called.
    ///
    /// Packets are handled one at a time in arrival order. Malformed or
    /// foreign packets are dropped and never end the loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotListening`] if no listener is set up, and
    /// [`Error::Io`] if receiving fails for a reason other than shutdown.
    pub async fn serve(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        // close() may have dropped the socket between the check above and
        // this take; that is still a clean shutdown.
        let Some(socket) = self.socket.lock().await.take() else {
            return if *shutdown.borrow() {
                Ok(())
            } else {
                Err(Error::NotListening)
            };
        };
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((size, source)) => self.handle_datagram(&socket, &buffer[..size], source).await,
                    Err(error) if is_transient(&error) => {
                        warn!("Transient error receiving packet: {}", error);
                    }
                    Err(error) => {
                        error!("Error receiving packet: {}", error);
                        return Err(error.into());
                    }
                },
            }
        }

        info!("DHCP server stopped");

        Ok(())
    }

    /// Stops the serve loop and drops the listener.
    ///
    /// Safe to call any number of times from any thread; never blocks.
    pub fn close(&self) {
        let was_closed = self.shutdown.send_replace(true);
        if was_closed {
            return;
        }

        info!("Closing DHCP listener");

        // A listener that was set up but never served is dropped here; a
        // serving loop owns its socket and drops it on return.
        if let Ok(mut socket) = self.socket.try_lock() {
            socket.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn lease(&self) -> Option<Lease> {
        self.session.lock().await.lease().cloned()
    }

    pub async fn parameters(&self) -> LeaseParameters {
        self.session.lock().await.parameters().clone()
    }

    /// Packets dropped without a reply: malformed, foreign, or unsupported.
    pub fn discarded_packets(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    async fn handle_datagram(&self, socket: &UdpSocket, data: &[u8], source: SocketAddr) {
        let packet = match DhcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(error) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping packet from {}: {}", source, error);
                return;
            }
        };

        if let Some(message_type) = packet.message_type() {
            debug!("{} from {} ({})", message_type, packet.format_mac(), source);
        }

        let outcome = self.session.lock().await.handle(&packet);

        match outcome {
            Outcome::Reply(reply) => {
                let destination = reply_destination(&packet, &reply, &self.config.listener);
                if let Err(error) = socket.send_to(&reply.encode(), destination).await {
                    warn!(
                        "Failed to send reply to {} at {}: {}",
                        packet.format_mac(),
                        destination,
                        error
                    );
                }
            }
            Outcome::NoReply => {}
            Outcome::Discard(reason) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Discarded packet from {} ({}): {}",
                    packet.format_mac(),
                    source,
                    reason
                );
            }
        }
    }
}

fn create_socket(listener: &ListenerConfig, bind_address: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Bind(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Bind(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Bind(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Bind(format!("Failed to set non-blocking: {}", error)))?;

    if let Some(interface) = &listener.interface {
        bind_to_device(&socket, interface)?;
    }

    let bind_addr = SocketAddrV4::new(bind_address, listener.server_port);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Bind(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Bind(format!("Failed to convert to tokio socket: {}", error)))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_to_device(socket: &Socket, interface: &str) -> Result<()> {
    socket.bind_device(Some(interface.as_bytes())).map_err(|error| {
        Error::Bind(format!(
            "Failed to set SO_BINDTODEVICE to {}: {}",
            interface, error
        ))
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_to_device(_socket: &Socket, interface: &str) -> Result<()> {
    warn!(
        "Binding to device {} is only supported on Linux and will be ignored",
        interface
    );
    Ok(())
}

/// Picks the address announced as server identifier (option 54).
///
/// An explicit setting wins, then a specific bind address, then the
/// address of the listening interface.
pub fn resolve_server_identifier(
    listener: &ListenerConfig,
    bind_address: Ipv4Addr,
) -> Result<Ipv4Addr> {
    if let Some(server_identifier) = listener.server_identifier {
        return Ok(server_identifier);
    }

    if !bind_address.is_unspecified() {
        return Ok(bind_address);
    }

    interface_address(listener.interface.as_deref())
}

#[cfg(unix)]
fn interface_address(interface: Option<&str>) -> Result<Ipv4Addr> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addresses = getifaddrs()
        .map_err(|error| Error::Bind(format!("Failed to list interface addresses: {}", error)))?;

    for entry in addresses {
        match interface {
            Some(name) if entry.interface_name != name => continue,
            None if entry.flags.contains(InterfaceFlags::IFF_LOOPBACK)
                || !entry.flags.contains(InterfaceFlags::IFF_UP) =>
            {
                continue;
            }
            _ => {}
        }

        if let Some(address) = entry.address.as_ref().and_then(|addr| addr.as_sockaddr_in()) {
            return Ok(address.ip());
        }
    }

    Err(Error::Bind(match interface {
        Some(name) => format!("Interface {} has no IPv4 address", name),
        None => "No non-loopback interface has an IPv4 address".to_string(),
    }))
}

#[cfg(not(unix))]
fn interface_address(_interface: Option<&str>) -> Result<Ipv4Addr> {
    Err(Error::Bind(
        "Cannot resolve the server identifier on this platform; set listener.server_identifier"
            .to_string(),
    ))
}

/// Where a reply goes, per RFC 2131 §4.1.
///
/// Relayed requests go back to the relay. NAKs are broadcast. A client that
/// already has an address (ciaddr) gets a unicast reply. Otherwise the
/// reply is broadcast, as the peer cannot receive unicast before it is
/// configured.
pub fn reply_destination(
    request: &DhcpPacket,
    reply: &DhcpPacket,
    listener: &ListenerConfig,
) -> SocketAddr {
    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        return SocketAddr::new(IpAddr::V4(request.giaddr), listener.server_port);
    }

    if reply.message_type() != Some(MessageType::Nak) && request.ciaddr != Ipv4Addr::UNSPECIFIED {
        return SocketAddr::new(IpAddr::V4(request.ciaddr), listener.client_port);
    }

    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), listener.client_port)
}

fn is_transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressPlan, DHCP_CLIENT_PORT, DHCP_SERVER_PORT, HardwareAddress};
    use std::time::Duration;

    const PEER: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn test_config() -> ServerConfig {
        let plan = AddressPlan {
            address: Some(Ipv4Addr::LOCALHOST),
            netmask: Some(Ipv4Addr::new(255, 0, 0, 0)),
            ..Default::default()
        };
        let mut config = ServerConfig::new(plan, HardwareAddress::from(PEER));
        config.listener.server_port = 0;
        config
    }

    fn packet(message_type: MessageType) -> DhcpPacket {
        DhcpPacket::new_request(message_type, &PEER.into(), 1)
    }

    fn reply_to(request: &DhcpPacket, message_type: MessageType) -> DhcpPacket {
        DhcpPacket::create_reply(
            request,
            message_type,
            Ipv4Addr::new(10, 1, 90, 5),
            Ipv4Addr::new(169, 254, 254, 2),
            vec![],
        )
    }

    #[test]
    fn test_constants() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(DHCP_CLIENT_PORT, 68);
        assert_eq!(RECV_BUFFER_SIZE, 1500);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let mut config = test_config();
        config.plan.netmask = None;
        assert!(matches!(DhcpServer::new(config), Err(Error::InvalidPlan(_))));

        let mut config = test_config();
        config.peer_hardware_address = HardwareAddress::new(Vec::<u8>::new());
        assert!(matches!(
            DhcpServer::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reply_destination_offer_is_broadcast() {
        let listener = ListenerConfig::default();
        let discover = packet(MessageType::Discover);
        let offer = reply_to(&discover, MessageType::Offer);
        assert_eq!(
            reply_destination(&discover, &offer, &listener),
            "255.255.255.255:68".parse().unwrap()
        );
    }

    #[test]
    fn test_reply_destination_renewal_is_unicast() {
        let listener = ListenerConfig::default();
        let mut request = packet(MessageType::Request);
        request.ciaddr = Ipv4Addr::new(10, 1, 90, 5);
        let ack = reply_to(&request, MessageType::Ack);
        assert_eq!(
            reply_destination(&request, &ack, &listener),
            "10.1.90.5:68".parse().unwrap()
        );

        let nak = reply_to(&request, MessageType::Nak);
        assert_eq!(
            reply_destination(&request, &nak, &listener),
            "255.255.255.255:68".parse().unwrap()
        );
    }

    #[test]
    fn test_reply_destination_relay() {
        let listener = ListenerConfig::default();
        let mut request = packet(MessageType::Discover);
        request.giaddr = Ipv4Addr::new(10, 0, 0, 1);
        let offer = reply_to(&request, MessageType::Offer);
        assert_eq!(
            reply_destination(&request, &offer, &listener),
            "10.0.0.1:67".parse().unwrap()
        );
    }

    #[test]
    fn test_resolve_server_identifier_precedence() {
        let explicit = ListenerConfig {
            server_identifier: Some(Ipv4Addr::new(169, 254, 254, 2)),
            ..Default::default()
        };
        assert_eq!(
            resolve_server_identifier(&explicit, Ipv4Addr::new(10, 0, 0, 1)).unwrap(),
            Ipv4Addr::new(169, 254, 254, 2)
        );

        assert_eq!(
            resolve_server_identifier(&ListenerConfig::default(), Ipv4Addr::new(10, 0, 0, 1))
                .unwrap(),
            Ipv4Addr::new(10, 0, 0, 1)
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolve_server_identifier_from_interface() {
        let listener = ListenerConfig {
            interface: Some("lo".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_server_identifier(&listener, Ipv4Addr::UNSPECIFIED).unwrap(),
            Ipv4Addr::LOCALHOST
        );

        let missing = ListenerConfig {
            interface: Some("onelease-none0".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_server_identifier(&missing, Ipv4Addr::UNSPECIFIED),
            Err(Error::Bind(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_listener_sets_server_identifier() {
        let server = DhcpServer::new(test_config()).unwrap();
        let local = server.setup_listener(Ipv4Addr::LOCALHOST).await.unwrap();

        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(local.port(), 0);
        assert_eq!(
            server.parameters().await.server_identifier,
            Ipv4Addr::LOCALHOST
        );
    }

    #[tokio::test]
    async fn test_bind_to_foreign_address_fails() {
        let server = DhcpServer::new(test_config()).unwrap();
        // TEST-NET-1 is never assigned to a local interface.
        let result = server.setup_listener(Ipv4Addr::new(192, 0, 2, 1)).await;
        assert!(matches!(result, Err(Error::Bind(_))));
        assert!(matches!(server.serve().await, Err(Error::NotListening)));
    }

    #[tokio::test]
    async fn test_serve_without_listener() {
        let server = DhcpServer::new(test_config()).unwrap();
        assert!(matches!(server.serve().await, Err(Error::NotListening)));
    }

    #[tokio::test]
    async fn test_close_before_serve() {
        let server = DhcpServer::new(test_config()).unwrap();
        server.setup_listener(Ipv4Addr::LOCALHOST).await.unwrap();

        server.close();
        server.close();
        assert!(server.is_closed());

        let result = tokio::time::timeout(Duration::from_secs(1), server.serve()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_close_while_serve_waits_for_socket() {
        let server = Arc::new(DhcpServer::new(test_config()).unwrap());
        server.setup_listener(Ipv4Addr::LOCALHOST).await.unwrap();

        // Hold the slot so serve passes its shutdown check and then blocks.
        let mut slot = server.socket.lock().await;
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.close();
        slot.take();
        drop(slot);

        let result = tokio::time::timeout(Duration::from_secs(1), serving).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_close_during_setup_drops_socket() {
        let server = Arc::new(DhcpServer::new(test_config()).unwrap());

        let slot = server.socket.lock().await;
        let setup = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.setup_listener(Ipv4Addr::LOCALHOST).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.close();
        drop(slot);

        let result = tokio::time::timeout(Duration::from_secs(1), setup).await;
        assert!(matches!(result, Ok(Ok(Ok(_)))));
        assert!(server.socket.lock().await.is_none());

        let result = tokio::time::timeout(Duration::from_secs(1), server.serve()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_counted() {
        let server = DhcpServer::new(test_config()).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source: SocketAddr = "127.0.0.1:68".parse().unwrap();

        server.handle_datagram(&socket, &[1, 2, 3], source).await;
        assert_eq!(server.discarded_packets(), 1);

        let foreign = DhcpPacket::new_request(
            MessageType::Discover,
            &[0xde, 0xad, 0xbe, 0xef, 0, 1].into(),
            9,
        );
        server
            .handle_datagram(&socket, &foreign.encode(), source)
            .await;
        assert_eq!(server.discarded_packets(), 2);
        assert!(server.lease().await.is_none());
    }
}
