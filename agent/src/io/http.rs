//! HTTP replay of recorded calls against the system under test.

use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use reqwest::header::{HOST, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};
use tracing::{debug, instrument, warn};

use crate::core::action::{CallOutcome, CallReport, RecordedRequest, RecordedResponse};
use crate::core::session::RuntimeConfig;

/// User-Agent value the service uses to ask for the agent's own identity.
pub const PASSTHROUGH_USER_AGENT: &str = "fuzz-agent-passthrough/1";

/// Identity sent as `User-Agent` when dialing and when replaying pass-through calls.
pub const AGENT_IDENTITY: &str = concat!("fuzz-agent/", env!("CARGO_PKG_VERSION"));

/// Abstraction over call replay backends.
#[allow(async_fn_in_trait)]
pub trait CallRunner {
    /// Replay `request` against `runtime`. Network failures are part of the
    /// report; `Err` is reserved for requests that cannot be built at all.
    async fn replay(
        &self,
        request: &RecordedRequest,
        runtime: &RuntimeConfig,
    ) -> Result<CallReport>;
}

/// A recorded request retargeted at the system under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCall {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Option<Vec<u8>>,
}

/// Retarget a recorded request: URL authority and `Host` become
/// `final_host:final_port`, the pass-through user agent becomes ours. Path,
/// query and the remaining headers are kept as recorded.
pub fn prepare_call(request: &RecordedRequest, runtime: &RuntimeConfig) -> Result<PreparedCall> {
    let method = Method::from_bytes(request.method.as_bytes())
        .with_context(|| format!("invalid method '{}'", request.method))?;
    let mut url =
        Url::parse(&request.url).with_context(|| format!("invalid url '{}'", request.url))?;
    url.set_host(Some(&runtime.final_host))
        .with_context(|| format!("invalid host '{}'", runtime.final_host))?;
    url.set_port(Some(runtime.final_port))
        .map_err(|()| anyhow!("url '{}' cannot carry a port", request.url))?;

    let mut headers = Vec::with_capacity(request.headers.len() + 1);
    for line in &request.headers {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line '{line}'"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid header name in '{line}'"))?;
        let value = value.trim();
        if name == HOST {
            continue;
        }
        let value = if name == USER_AGENT && value == PASSTHROUGH_USER_AGENT {
            HeaderValue::from_static(AGENT_IDENTITY)
        } else {
            HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value in '{line}'"))?
        };
        headers.push((name, value));
    }
    headers.push((
        HOST,
        HeaderValue::from_str(&runtime.authority()).context("invalid host header")?,
    ));

    Ok(PreparedCall {
        method,
        url,
        headers,
        body: request.body.clone(),
    })
}

/// Call runner backed by one `reqwest` client per session.
#[derive(Debug, Clone)]
pub struct HttpCalls {
    client: reqwest::Client,
}

impl HttpCalls {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

impl CallRunner for HttpCalls {
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    async fn replay(
        &self,
        request: &RecordedRequest,
        runtime: &RuntimeConfig,
    ) -> Result<CallReport> {
        let call = prepare_call(request, runtime)?;
        let mut headers = HeaderMap::with_capacity(call.headers.len());
        for (name, value) in call.headers {
            headers.append(name, value);
        }
        let mut builder = self
            .client
            .request(call.method, call.url.clone())
            .headers(headers);
        if let Some(body) = call.body {
            builder = builder.body(body);
        }

        let sent = RecordedRequest {
            url: call.url.to_string(),
            ..request.clone()
        };
        let start = Instant::now();
        let outcome = match builder.send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        format!("{}: {}", name.as_str(), String::from_utf8_lossy(value.as_bytes()))
                    })
                    .collect();
                match response.bytes().await {
                    Ok(body) => CallOutcome::Response(RecordedResponse {
                        code,
                        headers,
                        body: body.to_vec(),
                    }),
                    Err(err) => CallOutcome::Failure(error_chain(&err)),
                }
            }
            Err(err) => CallOutcome::Failure(error_chain(&err)),
        };
        let elapsed_micros = u64::try_from(start.elapsed().as_micros())
            .unwrap_or(u64::MAX)
            .max(1);

        match &outcome {
            CallOutcome::Response(rep) => debug!(code = rep.code, elapsed_micros, "call done"),
            CallOutcome::Failure(reason) => warn!(reason = %reason, elapsed_micros, "call failed"),
        }
        Ok(CallReport {
            elapsed_micros,
            request: sent,
            outcome,
        })
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn runtime(host: &str, port: u16) -> RuntimeConfig {
        RuntimeConfig {
            final_host: host.to_string(),
            final_port: port,
        }
    }

    fn request(url: &str, headers: &[&str]) -> RecordedRequest {
        RecordedRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            body: None,
        }
    }

    #[test]
    fn rewrites_authority_and_host_header() {
        let call = prepare_call(
            &request(
                "http://old.example:1/items/3?sort=asc&x=1",
                &["Host: old.example:1", "Accept: application/json"],
            ),
            &runtime("h", 9),
        )
        .expect("prepare");
        assert_eq!(call.url.host_str(), Some("h"));
        assert_eq!(call.url.port(), Some(9));
        assert_eq!(call.url.path(), "/items/3");
        assert_eq!(call.url.query(), Some("sort=asc&x=1"));

        let hosts: Vec<_> = call.headers.iter().filter(|(n, _)| *n == HOST).collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].1, "h:9");
        assert!(call.headers.iter().any(|(n, v)| n == "accept" && v == "application/json"));
    }

    #[test]
    fn keeps_the_recorded_scheme() {
        let call = prepare_call(&request("https://old.example:1/p?q", &[]), &runtime("h", 9))
            .expect("prepare");
        assert_eq!(call.url.as_str(), "https://h:9/p?q");
        let host = call.headers.iter().find(|(n, _)| *n == HOST).expect("host");
        assert_eq!(host.1, "h:9");
    }

    #[test]
    fn replaces_passthrough_user_agent_only() {
        let call = prepare_call(
            &request(
                "http://x/",
                &["User-Agent: fuzz-agent-passthrough/1", "X-Trace: fuzz-agent-passthrough/1"],
            ),
            &runtime("h", 9),
        )
        .expect("prepare");
        let ua = call
            .headers
            .iter()
            .find(|(n, _)| *n == USER_AGENT)
            .expect("user agent");
        assert_eq!(ua.1, AGENT_IDENTITY);
        assert!(call.headers.iter().any(|(n, v)| n == "x-trace" && v == PASSTHROUGH_USER_AGENT));
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(prepare_call(&request("http://x/", &["no-colon"]), &runtime("h", 9)).is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_a_reported_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let calls = HttpCalls::new().expect("client");
        let report = calls
            .replay(&request("http://old.example/", &[]), &runtime("127.0.0.1", port))
            .await
            .expect("replay");
        assert!(report.failed());
        assert!(report.elapsed_micros > 0);
    }

    #[tokio::test]
    async fn captures_status_headers_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).expect("read");
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(
                    b"HTTP/1.1 201 Created\r\nX-Seen: yes\r\n\
                      Content-Length: 2\r\nConnection: close\r\n\r\nok",
                )
                .expect("write");
            head
        });

        let calls = HttpCalls::new().expect("client");
        let report = calls
            .replay(&request("http://x/things?id=1", &[]), &runtime("127.0.0.1", port))
            .await
            .expect("replay");
        let head = server.join().expect("server");
        assert!(head.starts_with("GET /things?id=1 HTTP/1.1"), "{head}");
        assert!(head.to_ascii_lowercase().contains(&format!("host: 127.0.0.1:{port}")));

        let CallOutcome::Response(rep) = report.outcome else {
            panic!("expected response, got {:?}", report.outcome);
        };
        assert_eq!(rep.code, 201);
        assert!(rep.headers.contains(&"x-seen: yes".to_string()));
        assert_eq!(rep.body, b"ok");
    }
}
