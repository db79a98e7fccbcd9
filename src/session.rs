//! The single-peer DHCP state machine.
//!
//! A [`Session`] holds the lease parameters and at most one [`Lease`]. It
//! answers only the configured peer; everything else is discarded without
//! a reply. States move `Idle -> Offered -> Bound`, with RELEASE and
//! DECLINE returning to `Idle`.

use std::fmt;
use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::config::HardwareAddress;
use crate::lease::{Lease, LeaseParameters, LeaseState};
use crate::options::{MessageType, inform_options, lease_options, nak_options};
use crate::packet::{BOOTREQUEST, DhcpPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offered,
    Bound,
}

/// Why a packet produced no reply and no state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    NotRequest,
    ForeignPeer,
    NoMessageType,
    OtherServer(Ipv4Addr),
    Unsupported(MessageType),
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRequest => write!(f, "not a BOOTREQUEST"),
            Self::ForeignPeer => write!(f, "hardware address is not the authorized peer"),
            Self::NoMessageType => write!(f, "no DHCP message type"),
            Self::OtherServer(server) => write!(f, "addressed to server {}", server),
            Self::Unsupported(message_type) => write!(f, "unsupported {} message", message_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this packet back to the client.
    Reply(DhcpPacket),
    /// Handled, but the protocol calls for no reply (RELEASE, DECLINE).
    NoReply,
    Discard(DiscardReason),
}

pub struct Session {
    params: LeaseParameters,
    peer: HardwareAddress,
    lease: Option<Lease>,
}

impl Session {
    pub fn new(params: LeaseParameters, peer: HardwareAddress) -> Self {
        Self {
            params,
            peer,
            lease: None,
        }
    }

    pub fn parameters(&self) -> &LeaseParameters {
        &self.params
    }

    pub fn set_server_identifier(&mut self, server_identifier: Ipv4Addr) {
        self.params.server_identifier = server_identifier;
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn state(&self) -> SessionState {
        match self.lease.as_ref().map(|lease| lease.state) {
            None => SessionState::Idle,
            Some(LeaseState::Offered) => SessionState::Offered,
            Some(LeaseState::Bound) => SessionState::Bound,
        }
    }

    /// Runs one inbound packet through the state machine.
    pub fn handle(&mut self, packet: &DhcpPacket) -> Outcome {
        if packet.op != BOOTREQUEST {
            return Outcome::Discard(DiscardReason::NotRequest);
        }

        if packet.chaddr_bytes() != self.peer.as_bytes() {
            return Outcome::Discard(DiscardReason::ForeignPeer);
        }

        let Some(message_type) = packet.message_type() else {
            return Outcome::Discard(DiscardReason::NoMessageType);
        };

        match message_type {
            MessageType::Discover => self.handle_discover(packet),
            MessageType::Request => self.handle_request(packet),
            MessageType::Release => self.handle_release(),
            MessageType::Decline => self.handle_decline(packet),
            MessageType::Inform => self.handle_inform(packet),
            other => Outcome::Discard(DiscardReason::Unsupported(other)),
        }
    }

    fn handle_discover(&mut self, packet: &DhcpPacket) -> Outcome {
        let offer = DhcpPacket::create_reply(
            packet,
            MessageType::Offer,
            self.params.address,
            self.params.server_identifier,
            lease_options(&self.params),
        );

        self.lease = Some(Lease::offered(self.peer.clone(), self.params.address));

        info!("OFFER {} to {}", self.params.address, self.peer);

        Outcome::Reply(offer)
    }

    fn handle_request(&mut self, packet: &DhcpPacket) -> Outcome {
        let client = packet.client_options();

        if let Some(server_id) = client.server_identifier
            && server_id != self.params.server_identifier
        {
            return Outcome::Discard(DiscardReason::OtherServer(server_id));
        }

        let requested_ip = client.requested_ip.or(if packet.ciaddr != Ipv4Addr::UNSPECIFIED {
            Some(packet.ciaddr)
        } else {
            None
        });

        if requested_ip != Some(self.params.address) {
            let reason = match requested_ip {
                Some(ip) => format!("{} is not the address planned for this client", ip),
                None => "no address in REQUEST".to_string(),
            };
            warn!("NAK to {}: {}", self.peer, reason);

            return Outcome::Reply(DhcpPacket::create_reply(
                packet,
                MessageType::Nak,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                nak_options(&self.params, &reason),
            ));
        }

        let ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            self.params.address,
            self.params.server_identifier,
            lease_options(&self.params),
        );

        let renewal = self.state() == SessionState::Bound;
        self.lease
            .get_or_insert_with(|| Lease::offered(self.peer.clone(), self.params.address))
            .bind();

        info!(
            "ACK {} to {} (lease: {} seconds{})",
            self.params.address,
            self.peer,
            self.params.lease_seconds,
            if renewal { ", renewal" } else { "" }
        );

        Outcome::Reply(ack)
    }

    fn handle_release(&mut self) -> Outcome {
        if self.lease.take().is_some() {
            info!("RELEASE from {} for {}", self.peer, self.params.address);
        }
        Outcome::NoReply
    }

    fn handle_decline(&mut self, packet: &DhcpPacket) -> Outcome {
        let declined = packet
            .client_options()
            .requested_ip
            .unwrap_or(self.params.address);
        self.lease = None;

        warn!(
            "DECLINE from {} for {} - address appears to be in use on the link",
            self.peer, declined
        );

        Outcome::NoReply
    }

    fn handle_inform(&self, packet: &DhcpPacket) -> Outcome {
        let ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.params.server_identifier,
            inform_options(&self.params),
        );

        info!("INFORM response to {}", self.peer);

        Outcome::Reply(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressPlan, Route};
    use crate::options::{DhcpOption, lease_options};
    use crate::packet::BOOTREPLY;

    const PEER: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
    const STRANGER: [u8; 6] = [0x52, 0x54, 0x00, 0x65, 0x43, 0x21];
    const SERVER_ID: Ipv4Addr = Ipv4Addr::new(169, 254, 254, 2);
    const PLANNED: Ipv4Addr = Ipv4Addr::new(10, 1, 90, 5);

    fn test_session() -> Session {
        let plan = AddressPlan {
            address: Some(PLANNED),
            netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: Some(Ipv4Addr::new(10, 1, 90, 1)),
            routes: vec![Route::new(
                Ipv4Addr::new(10, 10, 42, 0),
                24,
                Some(Ipv4Addr::new(10, 1, 90, 90)),
            )],
            nameservers: vec![],
        };
        let params = LeaseParameters::derive(&plan)
            .unwrap()
            .with_server_identifier(SERVER_ID);
        Session::new(params, PEER.into())
    }

    fn request_from(mac: [u8; 6], message_type: MessageType) -> DhcpPacket {
        DhcpPacket::new_request(message_type, &mac.into(), 0x1234)
    }

    fn request_for(address: Ipv4Addr) -> DhcpPacket {
        let mut packet = request_from(PEER, MessageType::Request);
        packet.options.push(DhcpOption::RequestedIpAddress(address));
        packet.options.push(DhcpOption::ServerIdentifier(SERVER_ID));
        packet
    }

    fn expect_reply(outcome: Outcome) -> DhcpPacket {
        match outcome {
            Outcome::Reply(packet) => packet,
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    #[test]
    fn test_discover_offers_planned_address() {
        let mut session = test_session();
        let offer = expect_reply(session.handle(&request_from(PEER, MessageType::Discover)));

        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, 0x1234);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, PLANNED);
        assert_eq!(offer.siaddr, SERVER_ID);
        assert_eq!(offer.options[1..], lease_options(session.parameters())[..]);
        assert_eq!(session.state(), SessionState::Offered);
    }

    #[test]
    fn test_foreign_peer_is_discarded() {
        let mut session = test_session();

        for message_type in [MessageType::Discover, MessageType::Request] {
            let outcome = session.handle(&request_from(STRANGER, message_type));
            assert_eq!(outcome, Outcome::Discard(DiscardReason::ForeignPeer));
            assert_eq!(session.state(), SessionState::Idle);
        }

        expect_reply(session.handle(&request_for(PLANNED)));
        assert_eq!(session.state(), SessionState::Bound);

        let mut foreign = request_for(PLANNED);
        foreign.chaddr[5] ^= 0xff;
        assert_eq!(
            session.handle(&foreign),
            Outcome::Discard(DiscardReason::ForeignPeer)
        );
        assert_eq!(session.state(), SessionState::Bound);
    }

    #[test]
    fn test_request_binds_lease() {
        let mut session = test_session();
        expect_reply(session.handle(&request_from(PEER, MessageType::Discover)));

        let ack = expect_reply(session.handle(&request_for(PLANNED)));
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, PLANNED);
        assert_eq!(session.state(), SessionState::Bound);

        let lease = session.lease().unwrap();
        assert_eq!(lease.address, PLANNED);
        assert_eq!(lease.hardware_address.as_bytes(), &PEER);
    }

    #[test]
    fn test_renewal_is_idempotent() {
        let mut session = test_session();
        let first = expect_reply(session.handle(&request_for(PLANNED)));

        let mut renew = request_from(PEER, MessageType::Request);
        renew.ciaddr = PLANNED;
        for _ in 0..3 {
            let again = expect_reply(session.handle(&renew));
            assert_eq!(again.message_type(), Some(MessageType::Ack));
            assert_eq!(again.yiaddr, first.yiaddr);
            assert_eq!(again.options, first.options);
            assert_eq!(session.state(), SessionState::Bound);
        }
    }

    #[test]
    fn test_request_for_other_address_is_nak() {
        let mut session = test_session();
        expect_reply(session.handle(&request_from(PEER, MessageType::Discover)));

        let nak = expect_reply(session.handle(&request_for(Ipv4Addr::new(10, 1, 90, 6))));
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(nak.options.contains(&DhcpOption::ServerIdentifier(SERVER_ID)));
        assert!(!nak.options.iter().any(|opt| matches!(opt, DhcpOption::LeaseTime(_))));
        assert_eq!(session.state(), SessionState::Offered);

        let mut by_ciaddr = request_from(PEER, MessageType::Request);
        by_ciaddr.ciaddr = Ipv4Addr::new(192, 168, 0, 10);
        let nak = expect_reply(session.handle(&by_ciaddr));
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
    }

    #[test]
    fn test_request_without_address_is_nak() {
        let mut session = test_session();
        let nak = expect_reply(session.handle(&request_from(PEER, MessageType::Request)));
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_request_option_takes_precedence_over_ciaddr() {
        let mut session = test_session();
        let mut packet = request_for(PLANNED);
        packet.ciaddr = Ipv4Addr::new(10, 1, 90, 77);
        let ack = expect_reply(session.handle(&packet));
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
    }

    #[test]
    fn test_request_for_other_server_is_discarded() {
        let mut session = test_session();
        expect_reply(session.handle(&request_from(PEER, MessageType::Discover)));

        let other = Ipv4Addr::new(10, 1, 90, 250);
        let mut packet = request_from(PEER, MessageType::Request);
        packet.options.push(DhcpOption::RequestedIpAddress(PLANNED));
        packet.options.push(DhcpOption::ServerIdentifier(other));

        assert_eq!(
            session.handle(&packet),
            Outcome::Discard(DiscardReason::OtherServer(other))
        );
        assert_eq!(session.state(), SessionState::Offered);
    }

    #[test]
    fn test_release_returns_to_idle() {
        let mut session = test_session();
        expect_reply(session.handle(&request_for(PLANNED)));

        let mut release = request_from(PEER, MessageType::Release);
        release.ciaddr = PLANNED;
        assert_eq!(session.handle(&release), Outcome::NoReply);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.lease().is_none());
    }

    #[test]
    fn test_decline_returns_to_idle() {
        let mut session = test_session();
        expect_reply(session.handle(&request_for(PLANNED)));

        let mut decline = request_from(PEER, MessageType::Decline);
        decline.options.push(DhcpOption::RequestedIpAddress(PLANNED));
        assert_eq!(session.handle(&decline), Outcome::NoReply);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_inform_gets_configuration_only() {
        let mut session = test_session();
        let mut inform = request_from(PEER, MessageType::Inform);
        inform.ciaddr = PLANNED;

        let ack = expect_reply(session.handle(&inform));
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(!ack.options.iter().any(|opt| matches!(opt, DhcpOption::LeaseTime(_))));
        assert!(ack.options.contains(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0))));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_unsupported_and_non_dhcp_packets() {
        let mut session = test_session();

        for message_type in [MessageType::Offer, MessageType::Ack, MessageType::Nak] {
            assert_eq!(
                session.handle(&request_from(PEER, message_type)),
                Outcome::Discard(DiscardReason::Unsupported(message_type))
            );
        }

        let mut bootp = request_from(PEER, MessageType::Discover);
        bootp.options.clear();
        assert_eq!(
            session.handle(&bootp),
            Outcome::Discard(DiscardReason::NoMessageType)
        );

        let mut reply = request_from(PEER, MessageType::Discover);
        reply.op = BOOTREPLY;
        assert_eq!(
            session.handle(&reply),
            Outcome::Discard(DiscardReason::NotRequest)
        );

        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_replies_carry_identical_parameters() {
        let mut session = test_session();
        let offer = expect_reply(session.handle(&request_from(PEER, MessageType::Discover)));
        let ack = expect_reply(session.handle(&request_for(PLANNED)));
        assert_eq!(offer.options[1..], ack.options[1..]);
    }
}
