//! Full duplex RFC 6455 websocket connection engine.
//!
//! The engine owns a single bidirectional byte transport and multiplexes
//! framed messages, control traffic and liveness monitoring over it. It does
//! not perform the HTTP upgrade handshake or establish TCP/TLS transports;
//! it wraps an already-open stream and exposes a streaming read/write
//! surface to higher layers.

pub mod buffer;
pub mod transport;
mod util;
pub mod ws;
