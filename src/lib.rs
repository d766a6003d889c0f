//! rbcp-daq - a toolkit for network-attached measurement and FPGA devices
//!
//! Devices in this family expose two network faces: a small UDP register
//! access protocol (RBCP, Remote Bus Control Protocol) and a continuous TCP
//! stream of fixed-size acquisition records. This library provides both ends
//! of each face, so it can drive real hardware and also stand in for the
//! hardware during development.
//!
//! ## Main Components
//!
//! - `protocol`: The RBCP wire codec, a UDP client for register reads and
//!   writes, a sparse virtual register bank with per-byte access hooks, and a
//!   UDP server that answers RBCP requests against such a bank.
//!
//! - `session`: A line-delimited TCP session framework. A listener accepts
//!   connections and runs one session task per client; the framing and
//!   dispatch policy is supplied by a [`handler::SessionHandler`]
//!   implementation.
//!
//! - `command`: A command dispatcher on top of the session framework with a
//!   declarative command catalog, embedded help, built-in commands
//!   (`help`, `state`, `stat`, `pwd`, `ls`, `close`, `exit`) and a prompt
//!   cycle, plus a small prompt-matching command client.
//!
//! - `emulator`: A process-wide device emulator composing the RBCP server, a
//!   command server with register manipulation commands, and a push server
//!   that streams fabricated records to connected clients.
//!
//! - `daq`: A TCP data-acquisition client that delivers record-aligned
//!   buffers to a [`daq::DaqHandler`], live throughput statistics, and an
//!   optional raw-data spool worker writing rolling files through a bounded
//!   queue.
//!
//! - `state`: The monotonic lifecycle state primitive shared by every
//!   long-lived worker in this crate.
//!
//! ## Usage
//!
//! To emulate a device, build an [`emulator::DeviceEmulator`] and call
//! `run_loop`. To acquire data from a device, implement [`daq::DaqHandler`]
//! (or use [`daq::DaqRecorder`]) and drive it with a [`daq::DaqClient`]. To
//! poke registers, use [`protocol::RbcpClient`].

pub mod command;
pub mod daq;
pub mod emulator;
mod error;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod state;

pub use error::{Error, Result};
