//! The `transport` module is responsible for network communication with
//! broker nodes.
//!
//! It defines the envelope exchanged on the wire, the delimiter framing used
//! to carve envelopes out of a byte stream, the endpoint list format, and
//! the `Transport` abstraction that opens streams (TCP in production, an
//! in-memory duplex in tests).

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod message;
pub mod tcp;

pub use codec::{DELIMITER, DelimiterCodec};
pub use connection::{Connection, InboundFrames};
pub use endpoint::Endpoint;
pub use message::{Envelope, MethodType, RespCode, new_trace_id};
pub use tcp::{BoxedStream, ByteStream, TcpTransport, Transport};
