//! Session bootstrap.
//!
//! Opening a session dials the service with the agent identity and auth token,
//! waits for the first keepalive probe to be answered, then sends
//! `OpenSession` carrying the configuration summary and the compiled API
//! description. The service answers with the first directive.

use std::io::Write;

use tracing::{info, instrument};

use crate::core::action::{Directive, OpenSession, Report};
use crate::core::error::SessionError;
use crate::core::session::SessionState;
use crate::io::http::AGENT_IDENTITY;
use crate::io::transport::{Transport, TransportConfig};
use crate::step::show_progress;

/// Header carrying the service credential on the websocket upgrade.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Where and how to reach the orchestration service.
#[derive(Debug, Clone)]
pub struct Dial {
    pub endpoint: String,
    pub auth_token: String,
    pub transport: TransportConfig,
}

/// Dial, complete the keepalive handshake and open the session.
///
/// Returns the live transport and the directive answering `OpenSession`.
#[instrument(skip_all, fields(endpoint = %dial.endpoint))]
pub async fn open_session<W: Write>(
    dial: &Dial,
    open: OpenSession,
    state: &mut SessionState,
    out: &mut W,
) -> Result<(Transport, Directive), SessionError> {
    let headers = [
        ("User-Agent", AGENT_IDENTITY.to_string()),
        (AUTH_HEADER, dial.auth_token.clone()),
    ];
    let mut transport = Transport::open(&dial.endpoint, &headers, dial.transport).await?;
    transport.wait_for_server().await?;
    info!(spec_bytes = open.spec.len(), "opening session");

    let first = transport
        .call(Report::OpenSession(open), |progress| {
            show_progress(state, out, progress);
        })
        .await?;
    Ok((transport, first))
}
