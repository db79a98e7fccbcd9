//! Option codec (RFC 2132, RFC 3442).
//!
//! Options follow the fixed header as `code, length, data` triples. Pad (0)
//! is a lone filler byte and End (255) closes the block. Codes this server
//! does not interpret survive parsing as [`DhcpOption::Unknown`].
//!
//! # Classless static routes
//!
//! Option 121 packs each route as a prefix length byte, then only the
//! significant octets of the destination (`ceil(prefix / 8)` of them), then
//! all four octets of the router:
//!
//! ```text
//! 10.10.42.0/24 via 10.1.90.90   =>  18 0a 0a 2a 0a 01 5a 5a
//! 169.254.1.1/32 on-link         =>  20 a9 fe 01 01 00 00 00 00
//! 0.0.0.0/0 via 10.0.0.1         =>  00 0a 00 00 01
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lease::{LeaseParameters, prefix_to_mask};

/// 255 bytes of payload hold at most 63 IPv4 addresses.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

const MAX_OPTION_DATA: usize = 255;

/// Option codes this server reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    /// Error text sent with NAK.
    Message = 56,
    /// T1.
    RenewalTime = 58,
    /// T2.
    RebindingTime = 59,
    ClientIdentifier = 61,
    ClasslessStaticRoute = 121,
    End = 255,
}

impl OptionCode {
    const ALL: [OptionCode; 16] = [
        Self::Pad,
        Self::SubnetMask,
        Self::Router,
        Self::DnsServer,
        Self::BroadcastAddress,
        Self::RequestedIpAddress,
        Self::LeaseTime,
        Self::MessageType,
        Self::ServerIdentifier,
        Self::ParameterRequestList,
        Self::Message,
        Self::RenewalTime,
        Self::RebindingTime,
        Self::ClientIdentifier,
        Self::ClasslessStaticRoute,
        Self::End,
    ];
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|code| *code as u8 == value)
            .ok_or(value)
    }
}

/// Value of option 53.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    const ALL: [MessageType; 8] = [
        Self::Discover,
        Self::Offer,
        Self::Request,
        Self::Decline,
        Self::Ack,
        Self::Nak,
        Self::Release,
        Self::Inform,
    ];

    /// Upper-case name as it appears in RFC 2131 and in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|message_type| *message_type as u8 == value)
            .ok_or(value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One destination/router pair of the classless static route option.
///
/// The destination is always stored masked to its prefix length, and a
/// route without a next hop carries `0.0.0.0` as its router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClasslessRoute {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

impl ClasslessRoute {
    pub fn new(destination: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>) -> Self {
        let prefix_len = prefix_len.min(32);
        Self {
            destination: Ipv4Addr::from(u32::from(destination) & prefix_to_mask(prefix_len)),
            prefix_len,
            gateway: gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Number of destination octets carried on the wire.
    pub fn significant_octets(&self) -> usize {
        (self.prefix_len as usize).div_ceil(8)
    }

    /// Size of this route's encoded block.
    pub fn encoded_len(&self) -> usize {
        1 + self.significant_octets() + 4
    }

    fn encode_into(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.prefix_len);
        buffer.extend_from_slice(&self.destination.octets()[..self.significant_octets()]);
        buffer.extend_from_slice(&self.gateway.octets());
    }
}

/// Formats as `destination/prefix gateway`, the way dhcpcd reports routes.
impl fmt::Display for ClasslessRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.destination, self.prefix_len, self.gateway)
    }
}

/// Encodes routes in order, stopping before a route that would overflow
/// the 255 byte option payload.
pub fn encode_classless_routes(routes: &[ClasslessRoute]) -> Vec<u8> {
    let mut data = Vec::new();
    for route in routes {
        if data.len() + route.encoded_len() > MAX_OPTION_DATA {
            break;
        }
        route.encode_into(&mut data);
    }
    data
}

/// Decodes the payload of option 121.
///
/// # Errors
///
/// Returns [`Error::MalformedOptions`] if a prefix length exceeds 32 or a
/// route block is truncated.
pub fn decode_classless_routes(data: &[u8]) -> Result<Vec<ClasslessRoute>> {
    let mut routes = Vec::new();
    let mut index = 0;

    while index < data.len() {
        let prefix_len = data[index];
        if prefix_len > 32 {
            return Err(Error::MalformedOptions(format!(
                "classless route prefix length {} exceeds 32",
                prefix_len
            )));
        }

        let octets = (prefix_len as usize).div_ceil(8);
        let end = index + 1 + octets + 4;
        if end > data.len() {
            return Err(Error::MalformedOptions(
                "classless route truncated".to_string(),
            ));
        }

        let mut destination = [0u8; 4];
        destination[..octets].copy_from_slice(&data[index + 1..index + 1 + octets]);
        let gateway = &data[index + 1 + octets..end];

        routes.push(ClasslessRoute::new(
            Ipv4Addr::from(destination),
            prefix_len,
            Some(Ipv4Addr::new(gateway[0], gateway[1], gateway[2], gateway[3])),
        ));
        index = end;
    }

    Ok(routes)
}

/// One decoded option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// The first entry is the default route.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    RenewalTime(u32),
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    ClasslessStaticRoute(Vec<ClasslessRoute>),
    /// Code and payload of anything not listed above.
    Unknown(u8, Vec<u8>),
}

fn four_octets(data: &[u8], name: &str) -> Result<[u8; 4]> {
    <[u8; 4]>::try_from(data).map_err(|_| {
        Error::MalformedOptions(format!("{} length is {}, expected 4", name, data.len()))
    })
}

fn parse_address(data: &[u8], name: &str) -> Result<Ipv4Addr> {
    four_octets(data, name).map(Ipv4Addr::from)
}

fn parse_seconds(data: &[u8], name: &str) -> Result<u32> {
    four_octets(data, name).map(u32::from_be_bytes)
}

fn parse_address_list(data: &[u8], name: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::MalformedOptions(format!(
            "{} length {} is not a non-zero multiple of 4",
            name,
            data.len()
        )));
    }
    data.chunks_exact(4)
        .map(|chunk| parse_address(chunk, name))
        .collect()
}

fn parse_message_type(data: &[u8]) -> Result<MessageType> {
    let [value] = data else {
        return Err(Error::MalformedOptions(format!(
            "message type length is {}, expected 1",
            data.len()
        )));
    };
    MessageType::try_from(*value)
        .map_err(|value| Error::MalformedOptions(format!("unknown message type {}", value)))
}

impl DhcpOption {
    /// Wire code of this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::Message(_) => OptionCode::Message as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::ClasslessStaticRoute(_) => OptionCode::ClasslessStaticRoute as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Decodes one option payload.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedOptions`] when the payload length does not fit the
    /// option, or for Pad and End, which carry no payload.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let Ok(known) = OptionCode::try_from(code) else {
            return Ok(Self::Unknown(code, data.to_vec()));
        };

        let option = match known {
            OptionCode::SubnetMask => Self::SubnetMask(parse_address(data, "subnet mask")?),
            OptionCode::Router => Self::Router(parse_address_list(data, "router")?),
            OptionCode::DnsServer => Self::DnsServer(parse_address_list(data, "DNS server")?),
            OptionCode::BroadcastAddress => {
                Self::BroadcastAddress(parse_address(data, "broadcast address")?)
            }
            OptionCode::RequestedIpAddress => {
                Self::RequestedIpAddress(parse_address(data, "requested address")?)
            }
            OptionCode::ServerIdentifier => {
                Self::ServerIdentifier(parse_address(data, "server identifier")?)
            }
            OptionCode::LeaseTime => Self::LeaseTime(parse_seconds(data, "lease time")?),
            OptionCode::RenewalTime => Self::RenewalTime(parse_seconds(data, "renewal time")?),
            OptionCode::RebindingTime => {
                Self::RebindingTime(parse_seconds(data, "rebinding time")?)
            }
            OptionCode::MessageType => Self::MessageType(parse_message_type(data)?),
            OptionCode::ParameterRequestList => Self::ParameterRequestList(data.to_vec()),
            OptionCode::Message => Self::Message(String::from_utf8_lossy(data).into_owned()),
            OptionCode::ClientIdentifier if data.is_empty() => {
                return Err(Error::MalformedOptions(
                    "client identifier is empty".to_string(),
                ));
            }
            OptionCode::ClientIdentifier => Self::ClientIdentifier(data.to_vec()),
            OptionCode::ClasslessStaticRoute => {
                Self::ClasslessStaticRoute(decode_classless_routes(data)?)
            }
            OptionCode::Pad | OptionCode::End => {
                return Err(Error::MalformedOptions(format!(
                    "option {} has no payload",
                    code
                )));
            }
        };

        Ok(option)
    }

    /// Code, length and payload. Payloads are capped at 255 bytes, and
    /// address lists at 63 whole addresses.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let len = payload.len().min(MAX_OPTION_DATA);

        let mut encoded = Vec::with_capacity(2 + len);
        encoded.push(self.option_code());
        encoded.push(len as u8);
        encoded.extend_from_slice(&payload[..len]);
        encoded
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(address)
            | Self::BroadcastAddress(address)
            | Self::RequestedIpAddress(address)
            | Self::ServerIdentifier(address) => address.octets().to_vec(),
            Self::Router(addresses) | Self::DnsServer(addresses) => addresses
                .iter()
                .take(MAX_ADDRESSES_PER_OPTION)
                .flat_map(Ipv4Addr::octets)
                .collect(),
            Self::LeaseTime(seconds) | Self::RenewalTime(seconds) | Self::RebindingTime(seconds) => {
                seconds.to_be_bytes().to_vec()
            }
            Self::MessageType(message_type) => vec![*message_type as u8],
            Self::Message(text) => text.as_bytes().to_vec(),
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unknown(_, data) => data.clone(),
            Self::ClasslessStaticRoute(routes) => encode_classless_routes(routes),
        }
    }
}

/// Options that may legitimately appear only once in a client message.
const SINGLE_VALUED: [OptionCode; 4] = [
    OptionCode::MessageType,
    OptionCode::RequestedIpAddress,
    OptionCode::ServerIdentifier,
    OptionCode::ClientIdentifier,
];

/// Parses a raw option block (the bytes after the magic cookie).
///
/// Pad bytes are skipped and parsing stops at the End marker.
///
/// # Errors
///
/// Returns [`Error::MalformedOptions`] if a length byte is missing, option
/// data runs past the block, an option has an invalid length, or a
/// single-valued option is repeated.
pub fn parse_option_block(data: &[u8]) -> Result<Vec<DhcpOption>> {
    let mut options: Vec<DhcpOption> = Vec::new();
    let mut rest = data;

    loop {
        match rest {
            [] => break,
            [code, ..] if *code == OptionCode::End as u8 => break,
            [code, tail @ ..] if *code == OptionCode::Pad as u8 => rest = tail,
            [_] => {
                return Err(Error::MalformedOptions("option length missing".to_string()));
            }
            [code, len, tail @ ..] => {
                let (code, len) = (*code, *len as usize);
                if len > tail.len() {
                    return Err(Error::MalformedOptions(format!(
                        "option {} needs {} bytes, {} left",
                        code,
                        len,
                        tail.len()
                    )));
                }

                let single = SINGLE_VALUED.iter().any(|single| *single as u8 == code);
                if single && options.iter().any(|option| option.option_code() == code) {
                    return Err(Error::MalformedOptions(format!("option {} repeated", code)));
                }

                let (payload, remainder) = tail.split_at(len);
                options.push(DhcpOption::parse(code, payload)?);
                rest = remainder;
            }
        }
    }

    Ok(options)
}

/// The parts of a client message the session acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub message_type: Option<MessageType>,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_identifier: Option<Ipv4Addr>,
    pub client_identifier: Option<Vec<u8>>,
    pub parameter_request_list: Option<Vec<u8>>,
}

impl ClientOptions {
    /// Decodes a raw option block.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(Self::from_options(&parse_option_block(data)?))
    }

    pub fn from_options(options: &[DhcpOption]) -> Self {
        let mut client = Self::default();
        for option in options {
            match option {
                DhcpOption::MessageType(t) => client.message_type = Some(*t),
                DhcpOption::RequestedIpAddress(ip) => client.requested_ip = Some(*ip),
                DhcpOption::ServerIdentifier(ip) => client.server_identifier = Some(*ip),
                DhcpOption::ClientIdentifier(id) => client.client_identifier = Some(id.clone()),
                DhcpOption::ParameterRequestList(params) => {
                    client.parameter_request_list = Some(params.clone())
                }
                _ => {}
            }
        }
        client
    }
}

/// Options for OFFER and ACK, excluding the message type.
///
/// Always the full parameter set; the client's parameter request list does
/// not filter it.
pub fn lease_options(params: &LeaseParameters) -> Vec<DhcpOption> {
    let mut options = vec![
        DhcpOption::ServerIdentifier(params.server_identifier),
        DhcpOption::LeaseTime(params.lease_seconds),
        DhcpOption::RenewalTime(params.renewal_seconds),
        DhcpOption::RebindingTime(params.rebinding_seconds),
    ];
    push_network_options(params, &mut options);
    options
}

/// Options for the ACK answering an INFORM: configuration without timers.
pub fn inform_options(params: &LeaseParameters) -> Vec<DhcpOption> {
    let mut options = vec![DhcpOption::ServerIdentifier(params.server_identifier)];
    push_network_options(params, &mut options);
    options
}

pub fn nak_options(params: &LeaseParameters, reason: &str) -> Vec<DhcpOption> {
    vec![
        DhcpOption::ServerIdentifier(params.server_identifier),
        DhcpOption::Message(reason.to_string()),
    ]
}

fn push_network_options(params: &LeaseParameters, options: &mut Vec<DhcpOption>) {
    options.push(DhcpOption::SubnetMask(params.subnet_mask));
    options.push(DhcpOption::BroadcastAddress(params.broadcast));

    if let Some(router) = params.router {
        options.push(DhcpOption::Router(vec![router]));
    }

    if !params.dns_servers.is_empty() {
        options.push(DhcpOption::DnsServer(params.dns_servers.clone()));
    }

    if !params.routes.is_empty() {
        options.push(DhcpOption::ClasslessStaticRoute(params.routes.clone()));
    }
}
