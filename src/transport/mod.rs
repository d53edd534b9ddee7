//! Transport Module
//!
//! The two wire channels of the mesh:
//!
//! - **Reliable channel** (TCP, default 8888): length-prefixed
//!   request/response frames with correlation ids, used for the join
//!   handshake, metadata exchange and block transfers.
//! - **Unreliable channel** (UDP, default 8889): periodic heartbeat
//!   datagrams feeding the failure detector. Loss is tolerated.
//!
//! Framing survives partial reads and never buffers more than one block.

pub mod frame;
pub mod messages;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests;
