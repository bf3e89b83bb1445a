//! Persistent websocket connection to the orchestration service.
//!
//! After [`Transport::open`] two tasks own the socket:
//!
//! - the **reader** classifies every inbound frame: `PING` goes to the
//!   keepalive queue, anything else to the inbound payload queue, and a read
//!   failure is pushed as a [`TransportError`] before the reader stops;
//! - the **manager** owns writes: outbound payloads as binary frames, `PONG`
//!   replies (the first one completes the handshake), an escalation text frame
//!   before closing, and a done signal. When nothing happens for the idle
//!   budget the connection is considered dead.
//!
//! The main flow talks to both only through capacity-1 queues and drives one
//! request/reply exchange at a time with [`Transport::call`].

use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, instrument, warn};

use crate::core::action::{Directive, Progress, Report, directive_from_envelope};
use crate::core::envelope::{decode_envelope, encode_envelope};
use crate::core::error::{SessionError, TransportError};
use crate::core::frame::{FrameKind, PONG, classify_frame};

/// Default budget for idle connections, unanswered calls and the first ping.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(15);

const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection timing contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Manager gives up when no queue fires for this long.
    pub idle_timeout: Duration,
    /// `call` gives up when no reply arrives for this long.
    pub reply_timeout: Duration,
    /// Bootstrap gives up when the first `PING` does not arrive in time.
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: SERVER_TIMEOUT,
            reply_timeout: SERVER_TIMEOUT,
            handshake_timeout: SERVER_TIMEOUT,
        }
    }
}

/// Handle held by the main flow.
pub struct Transport {
    next_uid: u32,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    errors: mpsc::Receiver<TransportError>,
    escalate: mpsc::Sender<String>,
    done: mpsc::Sender<()>,
    handshake: Option<oneshot::Receiver<()>>,
    manager: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
    config: TransportConfig,
    dead: bool,
}

enum Wait<T> {
    Ready(T),
    Failed(Option<TransportError>),
    TimedOut,
}

impl Transport {
    /// Dial `endpoint` with extra request headers and start reader and manager.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn open(
        endpoint: &str,
        headers: &[(&'static str, String)],
        config: TransportConfig,
    ) -> Result<Self, SessionError> {
        let dial = |err: String| SessionError::Transport(TransportError::Dial(err));
        let mut request = endpoint
            .into_client_request()
            .map_err(|err| dial(err.to_string()))?;
        for (name, value) in headers {
            let value = HeaderValue::from_str(value)
                .map_err(|err| dial(format!("header {name}: {err}")))?;
            request.headers_mut().insert(*name, value);
        }

        info!("connecting");
        let (socket, _response) = connect_async(request)
            .await
            .map_err(|err| dial(err.to_string()))?;
        let (sink, stream) = socket.split();

        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let (keepalive_tx, keepalive_rx) = mpsc::channel(1);
        let (escalate_tx, escalate_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let reader = tokio::spawn(read_frames(
            stream,
            keepalive_tx,
            inbound_tx,
            errors_tx.clone(),
        ));
        let manager = tokio::spawn(manage_writes(
            sink,
            Queues {
                outbound: outbound_rx,
                keepalive: keepalive_rx,
                escalate: escalate_rx,
                done: done_rx,
            },
            errors_tx,
            handshake_tx,
            config.idle_timeout,
        ));

        Ok(Self {
            next_uid: 0,
            outbound: outbound_tx,
            inbound: inbound_rx,
            errors: errors_rx,
            escalate: escalate_tx,
            done: done_tx,
            handshake: Some(handshake_rx),
            manager: Some(manager),
            reader,
            config,
            dead: false,
        })
    }

    /// Wait until the first keepalive probe has been answered.
    ///
    /// A server that never pings is unreachable for our purposes.
    pub async fn wait_for_server(&mut self) -> Result<(), SessionError> {
        let Some(handshake) = self.handshake.take() else {
            return Ok(());
        };
        let budget = self.config.handshake_timeout;
        let waited = tokio::select! {
            biased;
            answered = handshake => match answered {
                Ok(()) => Wait::Ready(()),
                Err(_) => Wait::Failed(None),
            },
            err = self.errors.recv() => Wait::Failed(err),
            () = tokio::time::sleep(budget) => Wait::TimedOut,
        };
        match waited {
            Wait::Ready(()) => {
                debug!("handshake complete");
                Ok(())
            }
            Wait::Failed(err) => {
                let err = self.pending_error(err);
                Err(self.fail(err))
            }
            Wait::TimedOut => Err(self.fail(TransportError::NoServer(budget))),
        }
    }

    /// Send `report` and wait for the directive that answers it.
    ///
    /// Non-terminal progress pushes are handed to `on_progress` and the wait
    /// continues without sending anything. Exactly one call may be outstanding.
    #[instrument(skip_all, fields(kind = report.kind()))]
    pub async fn call<F>(
        &mut self,
        report: Report,
        mut on_progress: F,
    ) -> Result<Directive, SessionError>
    where
        F: FnMut(&Progress),
    {
        if self.dead {
            return Err(SessionError::Transport(TransportError::Dead));
        }
        self.next_uid = self.next_uid.wrapping_add(1);
        let uid = self.next_uid;
        let frame = encode_envelope(&report.into_envelope(uid));
        debug!(uid, bytes = frame.len(), "sending");
        if self.outbound.send(frame).await.is_err() {
            let err = self.pending_error(None);
            return Err(self.fail(err));
        }

        loop {
            let started = Instant::now();
            let budget = self.config.reply_timeout;
            let waited = tokio::select! {
                biased;
                frame = self.inbound.recv() => match frame {
                    Some(frame) => Wait::Ready(frame),
                    None => Wait::Failed(Some(TransportError::Closed)),
                },
                err = self.errors.recv() => Wait::Failed(err),
                () = tokio::time::sleep(budget) => Wait::TimedOut,
            };
            let frame = match waited {
                Wait::Ready(frame) => frame,
                Wait::Failed(err) => {
                    let err = self.pending_error(err);
                    return Err(self.fail(err));
                }
                Wait::TimedOut => {
                    warn!(uid, "no reply within budget");
                    return Err(self.fail(TransportError::ReplyTimeout(budget)));
                }
            };
            debug!(
                uid,
                bytes = frame.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "received"
            );

            let envelope = decode_envelope(&frame).map_err(|err| {
                self.dead = true;
                SessionError::Protocol(format!("undecodable frame: {err}"))
            })?;
            match directive_from_envelope(envelope) {
                Ok(Directive::Progress(progress)) if !progress.is_terminal() => {
                    on_progress(&progress);
                }
                Ok(directive) => return Ok(directive),
                Err(err) => {
                    if matches!(err, SessionError::Protocol(_)) {
                        self.dead = true;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Best-effort: tell the server why the session is aborting, then close.
    ///
    /// The manager stops on its own after writing the reason, so no done
    /// signal is sent while the escalation is pending.
    pub async fn escalate(&mut self, reason: String) {
        warn!(reason = %reason, "escalating error to server");
        if self.escalate.try_send(reason).is_err() {
            debug!("manager already gone, escalation dropped");
        } else if let Some(manager) = self.manager.take()
            && tokio::time::timeout(CLOSE_GRACE, manager).await.is_err()
        {
            warn!("escalation not written in time");
        }
        self.close().await;
    }

    /// Stop the manager (which closes the socket) and the reader.
    pub async fn close(&mut self) {
        let _ = self.done.try_send(());
        if let Some(manager) = self.manager.take()
            && tokio::time::timeout(CLOSE_GRACE, manager).await.is_err()
        {
            warn!("manager did not stop in time");
        }
        self.reader.abort();
        self.dead = true;
    }

    /// Whether a previous failure ended the connection.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// The most specific cause available: the observed one, else whatever a
    /// worker queued before stopping.
    fn pending_error(&mut self, observed: Option<TransportError>) -> TransportError {
        observed
            .or_else(|| self.errors.try_recv().ok())
            .unwrap_or(TransportError::Dead)
    }

    fn fail(&mut self, err: TransportError) -> SessionError {
        error!(err = %err, "transport failed");
        self.dead = true;
        SessionError::Transport(err)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(manager) = &self.manager {
            manager.abort();
        }
    }
}

async fn read_frames(
    mut stream: SplitStream<WsStream>,
    keepalive: mpsc::Sender<()>,
    inbound: mpsc::Sender<Vec<u8>>,
    errors: mpsc::Sender<TransportError>,
) {
    loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!("server closed the connection");
                let _ = errors.try_send(TransportError::Closed);
                return;
            }
            Some(Err(err)) => {
                warn!(err = %err, "read failed");
                let _ = errors.try_send(TransportError::Read(err.to_string()));
                return;
            }
        };
        let routed = match classify_frame(&frame) {
            FrameKind::Keepalive => keepalive.send(()).await.is_ok(),
            FrameKind::Payload => {
                debug!(bytes = frame.len(), "payload frame");
                inbound.send(frame).await.is_ok()
            }
        };
        if !routed {
            debug!("frame consumer gone, reader ending");
            return;
        }
    }
}

struct Queues {
    outbound: mpsc::Receiver<Vec<u8>>,
    keepalive: mpsc::Receiver<()>,
    escalate: mpsc::Receiver<String>,
    done: mpsc::Receiver<()>,
}

async fn manage_writes(
    mut sink: SplitSink<WsStream, Message>,
    mut queues: Queues,
    errors: mpsc::Sender<TransportError>,
    handshake: oneshot::Sender<()>,
    idle: Duration,
) {
    let mut handshake = Some(handshake);
    loop {
        tokio::select! {
            biased;
            Some(reason) = queues.escalate.recv() => {
                if let Err(err) = sink.send(Message::Text(reason)).await {
                    warn!(err = %err, "escalation write failed");
                }
                break;
            }
            Some(data) = queues.outbound.recv() => {
                if let Err(err) = sink.send(Message::Binary(data)).await {
                    let _ = errors.try_send(TransportError::Write(err.to_string()));
                    break;
                }
            }
            Some(()) = queues.keepalive.recv() => {
                if let Err(err) = sink.send(Message::Text(PONG.to_string())).await {
                    let _ = errors.try_send(TransportError::Write(err.to_string()));
                    break;
                }
                if let Some(answered) = handshake.take() {
                    let _ = answered.send(());
                }
            }
            _ = queues.done.recv() => break,
            () = tokio::time::sleep(idle) => {
                error!(idle_secs = idle.as_secs(), "no server activity, connection is dead");
                let _ = errors.try_send(TransportError::Idle(idle));
                break;
            }
        }
    }
    debug!("manager ending");
    if let Err(err) = sink.close().await {
        debug!(err = %err, "close failed");
    }
}
