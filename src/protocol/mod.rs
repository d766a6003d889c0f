//! RBCP (Remote Bus Control Protocol) implementation.
//!
//! RBCP is the UDP register access face of the device family handled by this
//! crate: a fixed 8-byte header (version byte, command byte, packet id,
//! length, big-endian address) followed by up to 255 payload bytes, one
//! request per reply, matched by packet id.
//!
//! The module provides:
//!
//! 1. The wire codec: header packing, parsing and reply validation
//! 2. A UDP client issuing single-in-flight reads and writes with timeout
//!    and packet-id rollover
//! 3. A sparse virtual register bank with per-byte access hooks, file-based
//!    initialization and region merging
//! 4. A UDP server answering RBCP requests against such a bank, including
//!    the bus error reply path

mod client;
mod registers;
mod server;
pub mod wire;

pub use client::RbcpClient;
pub use registers::{ReadHook, Region, RegisterBank, WriteHook};
pub use server::RbcpServer;
