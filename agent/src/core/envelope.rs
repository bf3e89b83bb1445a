//! Wire schema for session frames.
//!
//! Every binary frame exchanged with the orchestration service is one
//! [`Envelope`]. Keepalive text frames (`PING`/`PONG`) live outside this schema,
//! see [`crate::core::frame`].

use prost::Message;

/// One message on the wire: a client-chosen uid plus exactly one payload.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub uid: u32,
    #[prost(oneof = "envelope::Payload", tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub payload: Option<envelope::Payload>,
}

pub mod envelope {
    use super::{CallDone, DoCall, Empty, OpenSession, Progress, ResetProgress};

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        OpenSession(OpenSession),
        #[prost(message, tag = "3")]
        ResetProgress(ResetProgress),
        #[prost(message, tag = "4")]
        CallDone(CallDone),
        #[prost(message, tag = "5")]
        Err400(Empty),
        #[prost(message, tag = "6")]
        Err401(Empty),
        #[prost(message, tag = "7")]
        Err403(Empty),
        #[prost(message, tag = "8")]
        Err500(Empty),
        #[prost(message, tag = "9")]
        DoReset(Empty),
        #[prost(message, tag = "10")]
        DoCall(DoCall),
        #[prost(message, tag = "11")]
        Progress(Progress),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

/// Subset of the agent configuration the service needs to plan a session.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct SessionConfig {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(string, tag = "2")]
    pub port: String,
    #[prost(string, tag = "3")]
    pub spec_path: String,
    #[prost(uint32, tag = "4")]
    pub start_commands: u32,
    #[prost(uint32, tag = "5")]
    pub reset_commands: u32,
    #[prost(uint32, tag = "6")]
    pub stop_commands: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct OpenSession {
    #[prost(message, optional, tag = "1")]
    pub config: Option<SessionConfig>,
    #[prost(bytes = "vec", tag = "2")]
    pub spec: Vec<u8>,
    #[prost(string, tag = "3")]
    pub agent: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResetProgress {
    #[prost(uint64, tag = "1")]
    pub us: u64,
    #[prost(string, optional, tag = "2")]
    pub failure: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub url: String,
    #[prost(string, repeated, tag = "3")]
    pub headers: Vec<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, repeated, tag = "2")]
    pub headers: Vec<String>,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DoCall {
    #[prost(message, optional, tag = "1")]
    pub request: Option<Request>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CallDone {
    #[prost(uint64, tag = "1")]
    pub us: u64,
    #[prost(message, optional, tag = "2")]
    pub request: Option<Request>,
    #[prost(oneof = "call_done::Outcome", tags = "3, 4")]
    pub outcome: Option<call_done::Outcome>,
}

pub mod call_done {
    use super::Response;

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "3")]
        Response(Response),
        #[prost(string, tag = "4")]
        Failure(String),
    }
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Lane {
    #[prost(uint32, tag = "1")]
    pub t: u32,
    #[prost(uint32, tag = "2")]
    pub r: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Progress {
    #[prost(uint32, tag = "1")]
    pub tests_run: u32,
    #[prost(uint32, tag = "2")]
    pub requests_run: u32,
    #[prost(bool, tag = "3")]
    pub success: bool,
    #[prost(bool, tag = "4")]
    pub failure: bool,
    #[prost(message, optional, tag = "5")]
    pub shrinking_from: Option<Lane>,
}

/// Serialize an envelope to its binary frame representation.
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_to_vec()
}

/// Parse a binary frame into an envelope.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, prost::DecodeError> {
    Envelope::decode(frame)
}
