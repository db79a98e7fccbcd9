//! BOOTP/DHCP message layout (RFC 2131 §2).
//!
//! Every message is a fixed 236 byte BOOTP header, the magic cookie
//! `99.130.83.99`, then a TLV option block closed by End (255):
//!
//! ```text
//! offset  size  field
//!      0     1  op       1 = BOOTREQUEST, 2 = BOOTREPLY
//!      1     1  htype    1 = Ethernet
//!      2     1  hlen     6 for Ethernet
//!      3     1  hops
//!      4     4  xid
//!      8     2  secs
//!     10     2  flags    bit 15 = broadcast
//!     12     4  ciaddr
//!     16     4  yiaddr
//!     20     4  siaddr
//!     24     4  giaddr
//!     28    16  chaddr
//!     44    64  sname
//!    108   128  file
//!    236     4  magic cookie
//!    240     -  options
//! ```
//!
//! `sname` and `file` are carried through untouched; option overload is
//! not interpreted.

use std::net::Ipv4Addr;

use crate::config::{HardwareAddress, MAX_HARDWARE_ADDRESS_LEN};
use crate::error::{Error, Result};
use crate::options::{ClientOptions, DhcpOption, MessageType, OptionCode, parse_option_block};

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const BOOTP_HEADER_SIZE: usize = 236;

/// BOOTP header plus magic cookie; anything shorter is not DHCP.
pub const DHCP_FIXED_HEADER_SIZE: usize = BOOTP_HEADER_SIZE + DHCP_MAGIC_COOKIE.len();

/// Smallest message a BOOTP relay agent is required to accept.
pub const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Minimum datagram every IPv4 host must accept (RFC 791).
const DHCP_ENCODE_CAPACITY: usize = 576;

const MAX_HOPS: u8 = 16;

pub const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Sequential reader over a buffer already known to hold the fixed header.
struct HeaderReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn u8(&mut self) -> u8 {
        let [value] = self.array::<1>();
        value
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.array())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.array())
    }

    fn ipv4(&mut self) -> Ipv4Addr {
        Ipv4Addr::from(self.array::<4>())
    }
}

/// A DHCP message, either a client request or a server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction id chosen by the client and echoed in replies.
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Address the client already holds (renewing, rebinding, INFORM).
    pub ciaddr: Ipv4Addr,
    /// Address handed to the client.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent, if the request came through one.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] when the datagram is shorter than the fixed
    /// header, the magic cookie is wrong, the hop count is above 16, or an
    /// Ethernet header does not carry a 6 byte hardware address.
    /// [`Error::MalformedOptions`] when the option block is inconsistent.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        let mut header = HeaderReader::new(data);
        let packet = Self {
            op: header.u8(),
            htype: header.u8(),
            hlen: header.u8(),
            hops: header.u8(),
            xid: header.u32(),
            secs: header.u16(),
            flags: header.u16(),
            ciaddr: header.ipv4(),
            yiaddr: header.ipv4(),
            siaddr: header.ipv4(),
            giaddr: header.ipv4(),
            chaddr: header.array(),
            sname: header.array(),
            file: header.array(),
            options: Vec::new(),
        };

        if header.array::<4>() != DHCP_MAGIC_COOKIE {
            return Err(Error::MalformedPacket("Invalid magic cookie".to_string()));
        }

        packet.check_header()?;

        Ok(Self {
            options: parse_option_block(&data[DHCP_FIXED_HEADER_SIZE..])?,
            ..packet
        })
    }

    fn check_header(&self) -> Result<()> {
        if self.hops > MAX_HOPS {
            return Err(Error::MalformedPacket(format!(
                "Hop count {} exceeds maximum {}",
                self.hops, MAX_HOPS
            )));
        }

        if self.htype == HTYPE_ETHERNET && self.hlen != HLEN_ETHERNET {
            return Err(Error::MalformedPacket(format!(
                "Ethernet hardware address length is {}, expected {}",
                self.hlen, HLEN_ETHERNET
            )));
        }

        Ok(())
    }

    /// Serializes the message, End terminated and zero padded to
    /// [`DHCP_MIN_PACKET_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        buffer.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        buffer.extend_from_slice(&self.xid.to_be_bytes());
        for word in [self.secs, self.flags] {
            buffer.extend_from_slice(&word.to_be_bytes());
        }
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            buffer.extend_from_slice(&address.octets());
        }
        buffer.extend_from_slice(&self.chaddr);
        buffer.extend_from_slice(&self.sname);
        buffer.extend_from_slice(&self.file);
        buffer.extend_from_slice(&DHCP_MAGIC_COOKIE);

        buffer.extend(self.options.iter().flat_map(DhcpOption::encode));
        buffer.push(OptionCode::End as u8);

        let padded_len = buffer.len().max(DHCP_MIN_PACKET_SIZE);
        buffer.resize(padded_len, 0);
        buffer
    }

    /// Option 53, absent on plain BOOTP.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::from_options(&self.options)
    }

    /// The first `hlen` bytes of `chaddr`, clamped to the 16 byte slot.
    pub fn chaddr_bytes(&self) -> &[u8] {
        let len = (self.hlen as usize).min(MAX_HARDWARE_ADDRESS_LEN);
        &self.chaddr[..len]
    }

    pub fn hardware_address(&self) -> HardwareAddress {
        HardwareAddress::new(self.chaddr_bytes())
    }

    pub fn format_mac(&self) -> String {
        self.hardware_address().to_string()
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// A client message carrying nothing but its message type.
    ///
    /// Hardware addresses longer than the `chaddr` slot are truncated.
    pub fn new_request(
        message_type: MessageType,
        hardware_address: &HardwareAddress,
        xid: u32,
    ) -> Self {
        let bytes = hardware_address.as_bytes();
        let len = bytes.len().min(MAX_HARDWARE_ADDRESS_LEN);
        let mut chaddr = [0u8; MAX_HARDWARE_ADDRESS_LEN];
        chaddr[..len].copy_from_slice(&bytes[..len]);

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: len as u8,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::MessageType(message_type)],
        }
    }

    /// Builds the server's answer to `request`.
    ///
    /// `xid`, `flags`, `giaddr` and the hardware address fields are echoed
    /// from the request; `message_type` becomes the first option, followed
    /// by `options` in the given order.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let options = std::iter::once(DhcpOption::MessageType(message_type))
            .chain(options)
            .collect();

        Self {
            op: BOOTREPLY,
            hops: 0,
            secs: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
            ..request.clone()
        }
    }
}
