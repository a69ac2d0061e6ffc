//! Packet-preserving byte stream adapters.
//!
//! The relays that carry traffic through the toxic chain are written against
//! a stream-shaped contract: read a chunk, write a chunk. UDP traffic has to
//! fit that contract without losing its framing, so this crate provides:
//! - `ReadChunk` / `WriteChunk`, the two capabilities a relay needs
//! - `packet_pipe`, an in-memory pipe where one read returns exactly one write
//! - `datagram_halves`, a connected UDP socket split into framed halves
//! - `ChunkWriter`, a writer that issues one underlying write per chunk
//!
//! ## Framing
//!
//! ```text
//! datagram ──► PacketWriter ──► PacketReader ──► relay ──► ChunkWriter ──► send()
//!  (1 recv)      (1 message)      (1 read)                  (1 write)     (1 datagram)
//! ```
//!
//! Nothing in the chain coalesces or splits a packet as long as every buffer
//! is at least `MAX_DATAGRAM_SIZE` bytes.

mod chunk;
mod datagram;
mod error;
mod pipe;

pub use chunk::{ChunkWriter, ReadChunk, WriteChunk};
pub use datagram::{datagram_halves, is_unreachable_report, DatagramReader, DatagramWriter};
pub use error::StreamError;
pub use pipe::{packet_pipe, PacketReader, PacketWriter, DEFAULT_PIPE_DEPTH};

/// Largest payload relayed as a single packet (64 KiB).
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;
