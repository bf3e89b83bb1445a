//! Typed actions exchanged with the orchestration service.
//!
//! [`Report`]s flow agent → server, [`Directive`]s flow server → agent. The
//! conversion functions here are the only place wire payloads are mapped to
//! domain variants, so adding a directive means extending [`Directive`] and the
//! dispatch in `step` together.

use crate::core::envelope::{self, Envelope, SessionConfig, call_done, envelope::Payload};
use crate::core::error::{ServerRejection, SessionError};

/// Fuzz-session progress position: tests run and requests run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lane {
    pub tests_run: u32,
    pub requests_run: u32,
}

/// A captured HTTP request. Headers are `"Name: value"` strings in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedResponse {
    pub code: u16,
    pub headers: Vec<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Response(RecordedResponse),
    /// Transport-level failure of the replayed call (refused, DNS, timeout).
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReport {
    pub elapsed_micros: u64,
    pub request: RecordedRequest,
    pub outcome: CallOutcome,
}

impl CallReport {
    pub fn failed(&self) -> bool {
        matches!(self.outcome, CallOutcome::Failure(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub elapsed_micros: u64,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSession {
    pub config: SessionConfig,
    pub spec: Vec<u8>,
    pub agent: String,
}

/// Server status push. At most one of `success`/`failure` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub lane: Lane,
    pub success: bool,
    pub failure: bool,
    pub shrinking_from: Option<Lane>,
}

impl Progress {
    /// A terminal progress ends the session.
    pub fn is_terminal(&self) -> bool {
        self.success || self.failure
    }
}

/// Agent → server action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    OpenSession(OpenSession),
    ResetDone(ResetReport),
    CallDone(CallReport),
}

impl Report {
    pub fn kind(&self) -> &'static str {
        match self {
            Report::OpenSession(_) => "open_session",
            Report::ResetDone(_) => "reset_done",
            Report::CallDone(_) => "call_done",
        }
    }

    pub fn into_envelope(self, uid: u32) -> Envelope {
        let payload = match self {
            Report::OpenSession(open) => Payload::OpenSession(envelope::OpenSession {
                config: Some(open.config),
                spec: open.spec,
                agent: open.agent,
            }),
            Report::ResetDone(reset) => Payload::ResetProgress(envelope::ResetProgress {
                us: reset.elapsed_micros,
                failure: reset.failure,
            }),
            Report::CallDone(call) => {
                let outcome = match call.outcome {
                    CallOutcome::Response(rep) => call_done::Outcome::Response(envelope::Response {
                        code: u32::from(rep.code),
                        headers: rep.headers,
                        body: rep.body,
                    }),
                    CallOutcome::Failure(reason) => call_done::Outcome::Failure(reason),
                };
                Payload::CallDone(envelope::CallDone {
                    us: call.elapsed_micros,
                    request: Some(request_to_wire(call.request)),
                    outcome: Some(outcome),
                })
            }
        };
        Envelope {
            uid,
            payload: Some(payload),
        }
    }
}

/// Server → agent action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Reset,
    Call(RecordedRequest),
    Progress(Progress),
}

impl Directive {
    pub fn kind(&self) -> &'static str {
        match self {
            Directive::Reset => "do_reset",
            Directive::Call(_) => "do_call",
            Directive::Progress(_) => "progress",
        }
    }
}

/// Map a received envelope to a directive.
///
/// Server errors become [`SessionError::Rejected`]; outbound-only or missing
/// payloads and contradictory progress flags are protocol errors.
pub fn directive_from_envelope(envelope: Envelope) -> Result<Directive, SessionError> {
    let Some(payload) = envelope.payload else {
        return Err(SessionError::Protocol(format!(
            "envelope {} carries no payload",
            envelope.uid
        )));
    };
    match payload {
        Payload::Err400(_) => Err(SessionError::Rejected(ServerRejection::BadRequest)),
        Payload::Err401(_) => Err(SessionError::Rejected(ServerRejection::Unauthorized)),
        Payload::Err403(_) => Err(SessionError::Rejected(ServerRejection::Forbidden)),
        Payload::Err500(_) => Err(SessionError::Rejected(ServerRejection::Internal)),
        Payload::DoReset(_) => Ok(Directive::Reset),
        Payload::DoCall(call) => {
            let request = call.request.ok_or_else(|| {
                SessionError::Protocol("do_call without a request".to_string())
            })?;
            Ok(Directive::Call(request_from_wire(request)))
        }
        Payload::Progress(progress) => {
            if progress.success && progress.failure {
                return Err(SessionError::Protocol(
                    "progress is both success and failure".to_string(),
                ));
            }
            Ok(Directive::Progress(Progress {
                lane: Lane {
                    tests_run: progress.tests_run,
                    requests_run: progress.requests_run,
                },
                success: progress.success,
                failure: progress.failure,
                shrinking_from: progress.shrinking_from.map(|lane| Lane {
                    tests_run: lane.t,
                    requests_run: lane.r,
                }),
            }))
        }
        Payload::OpenSession(_) | Payload::ResetProgress(_) | Payload::CallDone(_) => Err(
            SessionError::Protocol(format!("unexpected agent-side message {}", envelope.uid)),
        ),
    }
}

fn request_from_wire(request: envelope::Request) -> RecordedRequest {
    RecordedRequest {
        method: request.method,
        url: request.url,
        headers: request.headers,
        body: request.body,
    }
}

fn request_to_wire(request: RecordedRequest) -> envelope::Request {
    envelope::Request {
        method: request.method,
        url: request.url,
        headers: request.headers,
        body: request.body,
    }
}
