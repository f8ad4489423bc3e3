//! Tunnel control protocol definitions
//!
//! This crate defines the wire envelopes, the newline-delimited JSON framing,
//! and the version-specific protocol engines used by the tunnel client.

pub mod codec;
pub mod engine;
pub mod messages;

pub use codec::{
    encode_envelope, FrameError, FrameReader, FrameWriter, DEFAULT_READ_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, MAX_MESSAGE_SIZE,
};
pub use engine::{
    engine_for, EngineError, Feature, ProtocolContext, ProtocolEngine, ProtocolVersion,
    V1Engine, V2Engine,
};
pub use messages::*;
