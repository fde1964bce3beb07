use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::info;

use crate::app::error::{AppError, Result, TransportKind};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// Per-call overrides. `None` falls back to the client defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub connect_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub debug: Option<bool>,
}

impl RequestOptions {
    pub fn with_read_timeout(timeout: Duration) -> Self {
        Self {
            read_timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Deadline for one exchange once connected: upload plus wait for the response.
    /// reqwest has one request deadline, so both overrides share it and the larger wins.
    fn exchange_timeout(&self) -> Duration {
        match (self.send_timeout, self.read_timeout) {
            (Some(send), Some(read)) => send.max(read),
            (None, Some(read)) => read,
            (Some(send), None) => send,
            (None, None) => DEFAULT_HTTP_TIMEOUT,
        }
    }
}

/// POST seam between a session and the on-device server.
pub trait Transport: Send {
    fn post(&mut self, path: &str, body: &Value, options: &RequestOptions) -> Result<Vec<u8>>;
}

struct Connection {
    client: Client,
    connect_timeout: Duration,
}

/// Blocking JSON-over-HTTP client. The pooled connection is dropped after any failure
/// and rebuilt on the next call.
pub struct HttpClient {
    base_url: String,
    debug: bool,
    connection: Option<Connection>,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>, debug: bool) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            debug,
            connection: None,
        }
    }

    /// `http://127.0.0.1:<port>/` unless an endpoint override is configured.
    pub fn for_port(port: u16, endpoint: Option<&str>, debug: bool) -> Self {
        match endpoint {
            Some(endpoint) => Self::new(endpoint, debug),
            None => Self::new(format!("http://127.0.0.1:{port}/"), debug),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn reset(&mut self) {
        self.connection = None;
    }

    fn client(&mut self, connect_timeout: Duration) -> Result<Client> {
        if let Some(connection) = &self.connection {
            if connection.connect_timeout == connect_timeout {
                return Ok(connection.client.clone());
            }
        }
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| AppError::transport(TransportKind::Other, err.to_string()))?;
        self.connection = Some(Connection {
            client: client.clone(),
            connect_timeout,
        });
        Ok(client)
    }

    pub fn call(&mut self, path: &str, body: &Value, options: &RequestOptions) -> Result<Vec<u8>> {
        let result = self.exchange(path, body, options);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn exchange(&mut self, path: &str, body: &Value, options: &RequestOptions) -> Result<Vec<u8>> {
        let debug = options.debug.unwrap_or(self.debug);
        let url = self.url_for(path);
        let payload = serde_json::to_vec(body)?;
        if debug {
            info!(url = %url, body = %body, "http request");
        }

        let client = self.client(options.connect_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT))?;
        let response = client
            .post(&url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .timeout(options.exchange_timeout())
            .body(payload)
            .send()
            .map_err(|err| classify(&url, err))?;

        let status = response.status();
        if status == StatusCode::BAD_GATEWAY {
            return Err(AppError::Protocol {
                message: format!("{url} answered 502 Bad Gateway, treating as connection refused"),
                retryable: true,
            });
        }
        let bytes = response.bytes().map_err(|err| classify(&url, err))?;
        if debug {
            info!(
                url = %url,
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&bytes),
                "http response"
            );
        }
        Ok(bytes.to_vec())
    }
}

impl Transport for HttpClient {
    fn post(&mut self, path: &str, body: &Value, options: &RequestOptions) -> Result<Vec<u8>> {
        self.call(path, body, options)
    }
}

fn classify(url: &str, err: reqwest::Error) -> AppError {
    AppError::transport(transport_kind(&err), format!("{url}: {err}"))
}

fn transport_kind(err: &reqwest::Error) -> TransportKind {
    if err.is_timeout() {
        return TransportKind::Timeout;
    }
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::ConnectionRefused => TransportKind::Refused,
                io::ErrorKind::ConnectionReset => TransportKind::Reset,
                io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
                    TransportKind::Aborted
                }
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportKind::Timeout,
                io::ErrorKind::UnexpectedEof => TransportKind::EndOfStream,
                _ => TransportKind::Other,
            };
        }
        source = inner.source();
    }
    if err.is_connect() {
        TransportKind::Refused
    } else if err.is_body() || err.is_decode() || err.is_request() {
        TransportKind::EndOfStream
    } else {
        TransportKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serves one canned response per entry, returning each raw request.
    fn serve(responses: Vec<String>) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (stream, _) = listener.accept().expect("accept");
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut head = String::new();
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).expect("line");
                    if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = value.trim().parse().expect("length");
                    }
                    head.push_str(&line);
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                }
                let mut body = vec![0u8; content_length];
                reader.read_exact(&mut body).expect("body");
                head.push_str(&String::from_utf8_lossy(&body));
                requests.push(head);
                let mut stream = stream;
                stream.write_all(response.as_bytes()).expect("write");
            }
            requests
        });
        (port, handle)
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn joins_paths_onto_base_url() {
        let client = HttpClient::for_port(34777, None, false);
        assert_eq!(client.url_for("/ping"), "http://127.0.0.1:34777/ping");
        assert_eq!(client.url_for("map"), "http://127.0.0.1:34777/map");

        let overridden = HttpClient::for_port(34777, Some("http://10.0.0.2:7102"), false);
        assert_eq!(overridden.url_for("/ready"), "http://10.0.0.2:7102/ready");
    }

    #[test]
    fn posts_json_with_content_type_and_returns_body() {
        let (port, server) = serve(vec![http_response("200 OK", r#"{"success":true}"#)]);
        let mut client = HttpClient::for_port(port, None, true);
        let body = client
            .call("/", &json!({"command": "version", "arguments": []}), &RequestOptions::default())
            .expect("call");
        assert_eq!(body, br#"{"success":true}"#);

        let requests = server.join().expect("server");
        let request = requests[0].to_ascii_lowercase();
        assert!(request.starts_with("post / http/1.1"));
        assert!(request.contains("content-type: application/json;charset=utf-8"));
        assert!(requests[0].contains(r#""command":"version""#));
    }

    #[test]
    fn bad_gateway_is_retryable_and_drops_connection() {
        let (port, server) = serve(vec![http_response("502 Bad Gateway", "")]);
        let mut client = HttpClient::for_port(port, None, false);
        let err = client
            .call("/ready", &json!({}), &RequestOptions::default())
            .unwrap_err();
        assert!(matches!(err, AppError::Protocol { retryable: true, .. }));
        assert!(err.is_connection_failure());
        assert!(client.connection.is_none());
        server.join().expect("server");
    }

    #[test]
    fn refused_connection_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let mut client = HttpClient::for_port(port, None, false);
        let err = client
            .call(
                "/ping",
                &json!({}),
                &RequestOptions {
                    connect_timeout: Some(Duration::from_secs(2)),
                    ..RequestOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "ERR_TRANSPORT");
        assert!(client.connection.is_none());
    }

    #[test]
    fn exchange_timeout_honours_both_overrides() {
        let options = RequestOptions::with_read_timeout(Duration::from_secs(1));
        assert_eq!(options.exchange_timeout(), Duration::from_secs(1));
        let slow_upload = RequestOptions {
            send_timeout: Some(Duration::from_secs(30)),
            read_timeout: Some(Duration::from_secs(1)),
            ..RequestOptions::default()
        };
        assert_eq!(slow_upload.exchange_timeout(), Duration::from_secs(30));
        let slow_reply = RequestOptions {
            send_timeout: Some(Duration::from_secs(2)),
            read_timeout: Some(Duration::from_secs(20)),
            ..RequestOptions::default()
        };
        assert_eq!(slow_reply.exchange_timeout(), Duration::from_secs(20));
        let send_only = RequestOptions {
            send_timeout: Some(Duration::from_secs(4)),
            ..RequestOptions::default()
        };
        assert_eq!(send_only.exchange_timeout(), Duration::from_secs(4));
        assert_eq!(RequestOptions::default().exchange_timeout(), DEFAULT_HTTP_TIMEOUT);
    }
}
