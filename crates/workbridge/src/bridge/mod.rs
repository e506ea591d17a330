//! Wire layer for controller-worker communication.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (Call, Response, Ping, Pong) and failures
//! - **codec**: Length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **channel**: Duplex envelope channels (in-memory pair, byte streams, named hub)

pub mod channel;
pub mod codec;
pub mod protocol;
