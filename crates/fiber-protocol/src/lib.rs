//! Fiber Protocol - Wire protocol for the Fiber process graph
//!
//! This crate provides:
//! - `frame` - footer-terminated and close-terminated message framing
//! - `message` - typed requests, handshakes and response envelopes
//! - `endpoint` - named Unix socket listeners and dialers
//!
//! Every connection carries UTF-8 JSON. Persistent connections terminate
//! each message with [`FIBER_FOOTER`]; one-shot connections may instead
//! rely on the writer closing the stream.

pub mod endpoint;
pub mod frame;
pub mod message;

pub use endpoint::{Dialer, EndpointDir, EndpointError, Listener};
pub use frame::{
    decode, encode, encode_raw, FrameDecoder, FrameError, FrameReader, Framing, FIBER_FOOTER,
    MAX_FRAME_SIZE,
};
pub use message::{
    ContactType, ControlCommand, Envelope, FrontDoorRequest, HandlerCall, HandlerContact,
    MetaMethod, ProtocolError, RequestType, ServiceCall, ServiceReply, SessionCommand,
    SurrogateContact,
};
