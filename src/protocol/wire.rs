//! RBCP wire format: header packing, parsing and reply validation.
//!
//! Every RBCP packet starts with the same 8-byte header:
//!
//! | offset | field        | notes                                   |
//! |--------|--------------|-----------------------------------------|
//! | 0      | version/type | always 0xFF                             |
//! | 1      | command      | see [`CommandCode`]                     |
//! | 2      | packet id    | echoed by the device, modulo 256        |
//! | 3      | length       | payload length, 0-255                   |
//! | 4..8   | address      | big-endian register address             |
//!
//! The command byte is a bit field: bit 6 distinguishes read from write,
//! bit 3 distinguishes replies from requests, and bit 0 is the bus error
//! flag a device sets when the requested range misses its register map.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

use crate::error::{Error, Result};

/// Size of the RBCP header in bytes.
pub const HEADER_LEN: usize = 8;
/// Version/type byte carried by every RBCP packet.
pub const VER_TYPE: u8 = 0xFF;
/// Maximum payload length of a single request or reply.
pub const MAX_PAYLOAD: usize = 255;
/// Default UDP port of the RBCP face of a device.
pub const DEFAULT_UDP_PORT: u16 = 4660;

/// Command byte values defined by the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    /// Read request, client to device.
    ReadRequest = 0xC0,
    /// Write request, client to device.
    WriteRequest = 0x80,
    /// Successful read reply carrying the requested bytes.
    ReadReply = 0xC8,
    /// Successful write reply echoing the written bytes.
    WriteReply = 0x88,
    /// Read reply with the bus error flag set.
    ReadReplyBusError = 0xC9,
    /// Write reply with the bus error flag set.
    WriteReplyBusError = 0x89,
}

impl CommandCode {
    /// Returns true when the bus error flag (bit 0) is set.
    pub fn is_bus_error(self) -> bool {
        self as u8 & 0x01 != 0
    }

    /// Returns true for reply codes (bit 3 set).
    pub fn is_reply(self) -> bool {
        self as u8 & 0x08 != 0
    }

    /// Returns true for read codes (bit 6 set).
    pub fn is_read(self) -> bool {
        self as u8 & 0x40 != 0
    }

    /// Maps a raw command byte back to a known code, if any.
    pub fn from_byte(value: u8) -> Option<CommandCode> {
        CommandCode::from_u8(value)
    }
}

/// The 8-byte RBCP header.
///
/// `version` is kept as a field so a parsed header mirrors the wire exactly;
/// the constructors always set it to [`VER_TYPE`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Version/type byte, 0xFF on every valid packet.
    pub version: u8,
    /// Raw command byte.
    pub command: u8,
    /// Packet id stamped by the client and echoed by the device.
    pub packet_id: u8,
    /// Payload length in bytes.
    pub length: u8,
    /// Register address of the access.
    pub address: u32,
}

impl Header {
    /// Builds a validated request header.
    ///
    /// Fails with [`Error::InvalidArgument`] when `length` exceeds 255 or
    /// when `address + length` leaves the 32-bit register address space.
    pub fn request(command: CommandCode, packet_id: u8, address: u32, length: usize) -> Result<Header> {
        if length > MAX_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "RBCP read/write length must be between 0 and {MAX_PAYLOAD}, got {length}"
            )));
        }
        if address as u64 + length as u64 > u32::MAX as u64 {
            return Err(Error::InvalidArgument(format!(
                "register range {address:#010X}+{length} leaves the address space"
            )));
        }
        Ok(Header {
            version: VER_TYPE,
            command: command as u8,
            packet_id,
            length: length as u8,
            address,
        })
    }

    /// Builds a reply header for the server side. Replies echo the id,
    /// address and length of the request, so no range validation applies.
    pub fn reply(command: CommandCode, packet_id: u8, address: u32, length: u8) -> Header {
        Header { version: VER_TYPE, command: command as u8, packet_id, length, address }
    }

    /// Serializes the header to a writer in wire order.
    pub fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u8(self.version)?;
        dest.write_u8(self.command)?;
        dest.write_u8(self.packet_id)?;
        dest.write_u8(self.length)?;
        dest.write_u32::<BigEndian>(self.address)
    }

    /// Deserializes a header from a reader in wire order.
    pub fn deserialize<R: Read>(src: &mut R) -> std::io::Result<Header> {
        Ok(Header {
            version: src.read_u8()?,
            command: src.read_u8()?,
            packet_id: src.read_u8()?,
            length: src.read_u8()?,
            address: src.read_u32::<BigEndian>()?,
        })
    }

    /// Returns the header as its 8 wire bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        [
            self.version,
            self.command,
            self.packet_id,
            self.length,
            (self.address >> 24) as u8,
            (self.address >> 16) as u8,
            (self.address >> 8) as u8,
            self.address as u8,
        ]
    }

    /// Parses the leading 8 bytes of a packet.
    ///
    /// Fails with [`Error::Protocol`] when the packet is shorter than a
    /// header. No field validation happens here; servers drop bad versions
    /// silently while clients treat them as protocol errors, so both decide
    /// for themselves.
    pub fn parse(packet: &[u8]) -> Result<Header> {
        if packet.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "RBCP header too short ({}/{})",
                packet.len(),
                HEADER_LEN
            )));
        }
        let mut src = &packet[..HEADER_LEN];
        Ok(Header::deserialize(&mut src)?)
    }
}

/// Validates a reply datagram against the id of the outstanding request and
/// returns its payload.
///
/// Checks, in order: the packet is at least a header long, the version byte
/// is [`VER_TYPE`], the bus error flag is clear, and the echoed packet id
/// matches `expected_id`. A set bus error flag surfaces as
/// [`Error::BusError`]; every other violation is [`Error::Protocol`].
pub fn validate_reply(packet: &[u8], expected_id: u8) -> Result<&[u8]> {
    let header = Header::parse(packet)?;
    if header.version != VER_TYPE {
        return Err(Error::Protocol("RBCP header version mismatch".to_string()));
    }
    if header.command & 0x01 != 0 {
        return Err(Error::BusError);
    }
    if header.packet_id != expected_id {
        return Err(Error::Protocol(format!(
            "RBCP packet id mismatch (expected {}, got {})",
            expected_id, header.packet_id
        )));
    }
    Ok(&packet[HEADER_LEN..])
}
