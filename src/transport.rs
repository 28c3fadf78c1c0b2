//! Serialized HTTP transport.
//!
//! Every request goes through one gate, so at most one request is in flight
//! per [`Transport`]. Each attempt races a deadline timer and the session's
//! shutdown token; a connection dropped before the response head is retried
//! with exponential backoff up to [`RetryPolicy::max_attempts`].

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, log, warn};
use rand::Rng;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{Method, Url};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::jar::SessionJar;

/// Milliseconds since the Unix epoch, used as a cache-buster.
pub(crate) fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Timestamp followed by a random fraction, as the web client sends it.
pub(crate) fn nonce() -> String {
    let r: f64 = rand::thread_rng().r#gen::<f64>() * 1_000_000.0;
    format!("{}{r}", timestamp_ms())
}

/// A file part plus plain fields for a multipart upload.
#[derive(Debug, Clone)]
pub struct Upload {
    pub field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub fields: Vec<(String, String)>,
}

impl Upload {
    fn to_form(&self) -> Result<reqwest::multipart::Form> {
        let part = reqwest::multipart::Part::bytes(self.bytes.clone())
            .file_name(self.file_name.clone())
            .mime_str("application/octet-stream")?;
        let mut form = reqwest::multipart::Form::new().part(self.field.clone(), part);
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        Ok(form)
    }
}

#[derive(Debug, Clone)]
enum Body {
    Empty,
    Form(String),
    Multipart(Upload),
}

/// One request, rebuilt for every attempt.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    body: Body,
    cookies: Vec<(String, String)>,
}

impl Request {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: Body::Empty,
            cookies: Vec::new(),
        }
    }

    /// POST with an `application/x-www-form-urlencoded` body.
    #[must_use]
    pub fn post_form(url: impl Into<String>, form: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            body: Body::Form(form.into()),
            cookies: Vec::new(),
        }
    }

    #[must_use]
    pub fn multipart(url: impl Into<String>, upload: Upload) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            body: Body::Multipart(upload),
            cookies: Vec::new(),
        }
    }

    /// Adds a cookie for this request only, on top of the jar.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }
}

/// HTTP client with a persistent cookie jar and a single-flight gate.
#[derive(Debug)]
pub struct Transport {
    client: reqwest::Client,
    jar: Arc<SessionJar>,
    gate: Mutex<()>,
    timeout: Duration,
    retry: RetryPolicy,
    max_body_bytes: usize,
    log_level: log::Level,
    shutdown: CancellationToken,
}

impl Transport {
    /// Builds a transport from the client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let jar = Arc::new(SessionJar::new());
        let client = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .deflate(true)
            .connect_timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            jar,
            gate: Mutex::new(()),
            timeout: config.timeout,
            retry: config.retry.clone(),
            max_body_bytes: config.max_body_bytes,
            log_level: config.request_log_level,
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub const fn jar(&self) -> &Arc<SessionJar> {
        &self.jar
    }

    /// Token that aborts every in-flight and future request when cancelled.
    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// GET `url` and return the decoded body.
    ///
    /// # Errors
    ///
    /// See [`Transport::execute`].
    pub async fn get(&self, url: &str) -> Result<Bytes> {
        self.execute(&Request::get(url)).await
    }

    /// POST a form-encoded body to `url`.
    ///
    /// # Errors
    ///
    /// See [`Transport::execute`].
    pub async fn post_form(&self, url: &str, form: String) -> Result<Bytes> {
        self.execute(&Request::post_form(url, form)).await
    }

    /// Runs `request` through the gate, retrying dropped connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the deadline elapses,
    /// [`Error::Cancelled`] on shutdown, [`Error::ConnectionClosed`] once
    /// retries are exhausted, [`Error::Status`] for 4xx/5xx answers, and
    /// [`Error::TruncatedBody`] or [`Error::BodyTooLarge`] for bad bodies.
    pub async fn execute(&self, request: &Request) -> Result<Bytes> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.initial_delay;
        let mut attempt = 1;
        loop {
            let result = {
                let _gate = self.gate.lock().await;
                self.attempt(request).await
            };
            match result {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "{} {}: connection closed, retrying in {delay:?} ({attempt}/{max_attempts})",
                        request.method, request.url
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = self.retry.next_delay(delay);
                    attempt += 1;
                }
                Err(Error::ConnectionClosed { .. }) => {
                    return Err(Error::ConnectionClosed { attempts: attempt });
                }
                other => return other,
            }
        }
    }

    async fn attempt(&self, request: &Request) -> Result<Bytes> {
        log!(self.log_level, "==> {} {}", request.method, request.url);
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(self.timeout) => {
                debug!("request to {} cancelled after {:?}", request.url, self.timeout);
                Err(Error::Timeout(self.timeout))
            }
            result = self.send(request) => result,
        }
    }

    async fn send(&self, request: &Request) -> Result<Bytes> {
        let url = Url::parse(&request.url)
            .map_err(|e| Error::Unexpected(format!("bad url {}: {e}", request.url)))?;
        let mut builder = self.client.request(request.method.clone(), url.clone());
        if !request.cookies.is_empty()
            && let Some(header) = self.jar.header_for(&url, &request.cookies)
        {
            builder = builder.header(COOKIE, header);
        }
        builder = match &request.body {
            Body::Empty => builder,
            Body::Form(form) => builder
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(form.clone()),
            Body::Multipart(upload) => builder.multipart(upload.to_form()?),
        };

        let mut response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status();
        log!(self.log_level, "<== {status} {}", request.url);
        if status.as_u16() / 100 > 3 {
            return Err(Error::Status(status.to_string()));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(classify_body_error)? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(Error::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

fn classify_send_error(e: reqwest::Error) -> Error {
    if is_eof(&e) {
        Error::ConnectionClosed { attempts: 1 }
    } else {
        Error::Http(e)
    }
}

fn classify_body_error(e: reqwest::Error) -> Error {
    if is_eof(&e) {
        Error::TruncatedBody
    } else {
        Error::Http(e)
    }
}

/// Walks the source chain looking for a peer-closed connection.
fn is_eof(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            )
        {
            return true;
        }
        let msg = e.to_string();
        if msg.contains("connection closed before message completed")
            || msg.contains("end of file before message length reached")
            || msg.contains("unexpected end of file")
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(timeout: Duration) -> Transport {
        let config = ClientConfig::default()
            .with_timeout(timeout)
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(3)
                    .with_initial_delay(Duration::from_millis(10)),
            );
        Transport::new(&config).unwrap()
    }

    /// Serves raw HTTP: the first `drops` connections are closed after the
    /// request is read, later ones get `reply`.
    async fn flaky_server(drops: u32, reply: &'static str) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                if n >= drops {
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.flush().await;
                }
            }
        });
        (format!("http://{addr}/"), seen)
    }

    #[tokio::test]
    async fn get_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("world"))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(Duration::from_secs(2));
        let body = t.get(&format!("{}/hello", server.uri())).await.unwrap();
        assert_eq!(&body[..], b"world");
    }

    #[tokio::test]
    async fn post_form_sends_urlencoded_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("a=1&b=2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(Duration::from_secs(2));
        let body = t
            .post_form(&format!("{}/form", server.uri()), "a=1&b=2".to_string())
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let t = transport(Duration::from_secs(2));
        let err = t.get(&server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::Status(ref s) if s.contains("404")), "{err}");
    }

    #[tokio::test]
    async fn redirect_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let t = transport(Duration::from_secs(2));
        assert!(t.get(&server.uri()).await.is_ok());
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
            .mount(&server)
            .await;

        let t = transport(Duration::from_millis(100));
        let err = t.get(&server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let t = Arc::new(transport(Duration::from_secs(10)));
        let token = t.shutdown_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let err = t.get(&server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err}");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let config = ClientConfig::default().with_max_body_bytes(1024);
        let t = Transport::new(&config).unwrap();
        let err = t.get(&server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::BodyTooLarge { limit: 1024 }), "{err}");
    }

    #[tokio::test]
    async fn per_request_cookies_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("cookie", "pagenum=100"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(Duration::from_secs(2));
        let req = Request::get(server.uri()).with_cookie("pagenum", "100");
        assert!(t.execute(&req).await.is_ok());
    }

    #[tokio::test]
    async fn response_cookies_land_in_jar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "userid=42; Path=/"))
            .mount(&server)
            .await;

        let t = transport(Duration::from_secs(2));
        t.get(&server.uri()).await.unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        assert_eq!(t.jar().get(&url, "userid").as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn requests_are_serialized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)))
            .mount(&server)
            .await;

        let t = transport(Duration::from_secs(2));
        let uri = server.uri();
        let start = Instant::now();
        let (a, b) = tokio::join!(t.get(&uri), t.get(&uri));
        assert!(a.is_ok() && b.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn dropped_connection_is_retried() {
        let (uri, seen) =
            flaky_server(2, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let t = transport(Duration::from_secs(2));
        let body = t.get(&uri).await.unwrap();
        assert_eq!(&body[..], b"ok");
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (uri, seen) = flaky_server(u32::MAX, "").await;
        let t = transport(Duration::from_secs(2));
        let err = t.get(&uri).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { attempts: 3 }), "{err}");
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn short_body_is_truncated_not_retried() {
        let (uri, seen) = flaky_server(
            0,
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort",
        )
        .await;
        let t = transport(Duration::from_secs(2));
        let err = t.get(&uri).await.unwrap_err();
        assert!(matches!(err, Error::TruncatedBody), "{err}");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nonce_starts_with_timestamp() {
        let before = timestamp_ms().to_string();
        let n = nonce();
        assert!(n.len() > before.len());
        assert!(n.chars().next().unwrap().is_ascii_digit());
    }
}
