//! The crate-wide error type.
//!
//! Register access and DAQ failures fall into a small number of distinct
//! classes that callers routinely need to tell apart: a malformed request
//! rejected before any I/O, a malformed or mismatched reply, a device-side
//! bus error, a missing device, and an access outside every register region.
//! Everything else surfaces as plain I/O.

use thiserror::Error;

/// Errors produced by the RBCP client and server and by register bank access.
#[derive(Debug, Error)]
pub enum Error {
    /// A request parameter was rejected before any I/O took place.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A reply was malformed: short header, wrong version byte, or a packet
    /// id that does not match the outstanding request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reply carried the bus error flag. Check the device address and
    /// length of the read or write.
    #[error("RBCP bus error: check device address and length for read/write")]
    BusError,

    /// No reply arrived within the configured window. Check the device IP
    /// address and UDP port.
    #[error("RBCP timeout: check device IP and UDP port")]
    Timeout,

    /// A register access missed every region of the bank.
    #[error("register access out of range: {address:#010X} {length} bytes")]
    OutOfRange {
        /// First byte address of the failed access.
        address: u32,
        /// Length of the failed access in bytes.
        length: usize,
    },

    /// Socket or filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
