//! Fake orchestration service and system under test for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::io::{Read, Write};
use std::net::TcpListener as StdListener;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle as ThreadHandle;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

use fuzz_agent::core::action::OpenSession;
use fuzz_agent::core::envelope::{
    self, Envelope, SessionConfig, decode_envelope, encode_envelope, envelope::Payload,
};
use fuzz_agent::io::http::AGENT_IDENTITY;

pub type Socket = WebSocketStream<TcpStream>;

/// A one-connection websocket server running `script` against the agent.
pub struct FakeService<T> {
    pub endpoint: String,
    headers: Arc<Mutex<Option<HeaderMap>>>,
    task: JoinHandle<T>,
}

impl<T> FakeService<T> {
    pub async fn start<F, Fut>(script: F) -> Self
    where
        F: FnOnce(Socket) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let headers = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&headers);
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let capture = move |req: &Request, rep: Response| -> Result<Response, ErrorResponse> {
                *seen.lock().expect("headers lock") = Some(req.headers().clone());
                Ok(rep)
            };
            let ws = accept_hdr_async(stream, capture)
                .await
                .expect("websocket handshake");
            script(ws).await
        });
        Self {
            endpoint: format!("ws://{addr}/1/fuzz"),
            headers,
            task,
        }
    }

    /// Upgrade request headers the agent sent.
    pub fn headers(&self) -> HeaderMap {
        self.headers
            .lock()
            .expect("headers lock")
            .clone()
            .expect("agent connected")
    }

    pub async fn finish(self) -> T {
        self.task.await.expect("service task")
    }
}

pub async fn ping(ws: &mut Socket) {
    ws.send(Message::Text("PING".to_string()))
        .await
        .expect("send ping");
}

pub async fn expect_pong(ws: &mut Socket) {
    match ws.next().await {
        Some(Ok(Message::Text(text))) if text == "PONG" => {}
        other => panic!("expected PONG, got {other:?}"),
    }
}

/// Probe the agent the way the service does before it accepts a session.
pub async fn handshake(ws: &mut Socket) {
    ping(ws).await;
    expect_pong(ws).await;
}

pub async fn send(ws: &mut Socket, uid: u32, payload: Payload) {
    let frame = encode_envelope(&Envelope {
        uid,
        payload: Some(payload),
    });
    ws.send(Message::Binary(frame)).await.expect("send envelope");
}

/// Next report from the agent, skipping keepalive answers.
pub async fn recv(ws: &mut Socket) -> Envelope {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return decode_envelope(&data).expect("decode"),
            Some(Ok(Message::Text(text))) if text == "PONG" => continue,
            other => panic!("expected a report, got {other:?}"),
        }
    }
}

/// First non-keepalive message after the agent stopped reporting.
pub async fn recv_end(ws: &mut Socket) -> Option<Message> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) if text == "PONG" => continue,
            Some(Ok(message)) => return Some(message),
            Some(Err(_)) | None => return None,
        }
    }
}

pub fn progress(tests_run: u32, requests_run: u32) -> envelope::Progress {
    envelope::Progress {
        tests_run,
        requests_run,
        ..envelope::Progress::default()
    }
}

pub fn shrinking(progress: envelope::Progress, t: u32, r: u32) -> envelope::Progress {
    envelope::Progress {
        shrinking_from: Some(envelope::Lane { t, r }),
        ..progress
    }
}

pub fn succeeded(progress: envelope::Progress) -> envelope::Progress {
    envelope::Progress {
        success: true,
        ..progress
    }
}

pub fn do_call(url: &str) -> Payload {
    Payload::DoCall(envelope::DoCall {
        request: Some(envelope::Request {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: vec!["Accept: */*".to_string()],
            body: None,
        }),
    })
}

pub fn open_session() -> OpenSession {
    OpenSession {
        config: SessionConfig {
            host: "127.0.0.1".to_string(),
            port: "3000".to_string(),
            spec_path: "openapi.json".to_string(),
            ..SessionConfig::default()
        },
        spec: br#"{"openapi":"3.0.3","paths":{}}"#.to_vec(),
        agent: AGENT_IDENTITY.to_string(),
    }
}

/// System under test answering `connections` requests with `200 OK`.
///
/// Joins to the request heads it received.
pub fn http_ok(connections: usize) -> (u16, ThreadHandle<Vec<String>>) {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind http");
    let port = listener.local_addr().expect("addr").port();
    let handle = std::thread::spawn(move || {
        let mut heads = Vec::with_capacity(connections);
        for _ in 0..connections {
            let (mut stream, _) = listener.accept().expect("accept http");
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).expect("read http");
            heads.push(String::from_utf8_lossy(&buf[..n]).to_string());
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi")
                .expect("write http");
        }
        heads
    });
    (port, handle)
}
