use crate::config::EngineConfig;
use crate::endpoints::HttpMethod;
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

/// One request/response exchange with the remote service. Paths are relative
/// to the configured base url.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError>;
}

pub struct HttpTransport {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Self::with_client(client, &config.base_url, config.token.clone())
    }

    pub fn with_client(
        client: Client,
        base_url: &str,
        token: Option<String>,
    ) -> Result<Self, TransportError> {
        let trimmed = base_url.trim();
        let normalized = if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        };
        let base =
            Url::parse(&normalized).map_err(|_| TransportError::InvalidUrl(trimmed.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl(trimmed.to_string()));
        }
        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|_| TransportError::InvalidUrl(path.to_string()))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let url = self.url_for(path)?;
        let mut request = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status_to_error(status));
        }
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| TransportError::Decode(err.to_string()))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    if err.is_decode() {
        return TransportError::Decode(err.to_string());
    }
    TransportError::Network(err.to_string())
}

fn map_status_to_error(status: StatusCode) -> TransportError {
    TransportError::Status(status.as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone)]
    struct Step {
        method: &'static str,
        path: &'static str,
        expect_bearer: Option<&'static str>,
        status: u16,
        body: Option<String>,
        delay: Option<Duration>,
    }

    impl Step {
        fn ok(method: &'static str, path: &'static str, body: Value) -> Self {
            Self {
                method,
                path,
                expect_bearer: None,
                status: 200,
                body: Some(body.to_string()),
                delay: None,
            }
        }
    }

    struct MockServer {
        addr: String,
        hits: Arc<AtomicUsize>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    impl MockServer {
        fn start(steps: Vec<Step>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
            let hits = Arc::new(AtomicUsize::new(0));
            let bodies = Arc::new(Mutex::new(Vec::new()));
            let hits_thread = hits.clone();
            let bodies_thread = bodies.clone();
            let steps = Arc::new(Mutex::new(steps));

            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { continue };
                    hits_thread.fetch_add(1, Ordering::SeqCst);
                    let (method, path, headers, body) = read_request(&mut stream);

                    let (step, done) = {
                        let mut guard = steps.lock().unwrap();
                        if guard.is_empty() {
                            break;
                        }
                        let step = guard.remove(0);
                        (step, guard.is_empty())
                    };

                    assert_eq!(method, step.method);
                    assert_eq!(path, step.path);
                    if let Some(expected) = step.expect_bearer {
                        let got = headers.get("authorization").cloned().unwrap_or_default();
                        assert_eq!(got, format!("Bearer {expected}"));
                    }
                    bodies_thread.lock().unwrap().push(body);
                    if let Some(delay) = step.delay {
                        std::thread::sleep(delay);
                    }
                    respond(&mut stream, step.status, step.body.as_deref());

                    if done {
                        break;
                    }
                }
            });

            MockServer {
                addr,
                hits,
                bodies,
            }
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        fn transport(&self, token: Option<&str>) -> HttpTransport {
            let config = EngineConfig {
                base_url: format!("http://{}", self.addr),
                token: token.map(str::to_string),
                http_timeout: Duration::from_millis(500),
                ..EngineConfig::default()
            };
            HttpTransport::new(&config).unwrap()
        }
    }

    fn read_request(stream: &mut TcpStream) -> (String, String, HashMap<String, String>, String) {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let mut header_end = None;
        let mut content_length = 0usize;
        loop {
            if let Some(end) = header_end {
                if buf.len() >= end + content_length {
                    break;
                }
            }
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&tmp[..n]);
                    if header_end.is_none() {
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            header_end = Some(pos + 4);
                            let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                            content_length = head
                                .lines()
                                .find_map(|line| line.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse().ok())
                                .unwrap_or(0);
                        }
                    }
                    if buf.len() > 64 * 1024 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let raw = String::from_utf8_lossy(&buf).to_string();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
        let mut lines = head.split("\r\n");
        let mut first = lines.next().unwrap_or_default().split_whitespace();
        let method = first.next().unwrap_or_default().to_string();
        let path = first.next().unwrap_or_default().to_string();
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((k, v)) = line.split_once(':') {
                headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
            }
        }
        (method, path, headers, body.to_string())
    }

    fn respond(stream: &mut TcpStream, status: u16, body: Option<&str>) {
        let body = body.unwrap_or("");
        let mut resp = String::new();
        resp.push_str(&format!("HTTP/1.1 {status} OK\r\n"));
        resp.push_str("Connection: close\r\n");
        resp.push_str("Content-Type: application/json\r\n");
        resp.push_str(&format!("Content-Length: {}\r\n", body.len()));
        resp.push_str("\r\n");
        resp.push_str(body);
        let _ = stream.write_all(resp.as_bytes());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn post_sends_json_and_bearer_token() {
        let mut step = Step::ok("POST", "/docker/image/pull", json!({ "pull_id": "p1" }));
        step.expect_bearer = Some("secret");
        let server = MockServer::start(vec![step]);
        let transport = server.transport(Some("secret"));

        let body = json!({ "image": "alpine:latest" });
        let value = transport
            .send(HttpMethod::Post, "docker/image/pull", Some(&body))
            .await
            .unwrap();
        assert_eq!(value["pull_id"], "p1");
        assert_eq!(server.hits(), 1);
        let sent: Value = serde_json::from_str(&server.bodies.lock().unwrap()[0]).unwrap();
        assert_eq!(sent, body);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start(vec![Step {
            status: 404,
            body: None,
            ..Step::ok("GET", "/docker/build/nope", Value::Null)
        }]);
        let transport = server.transport(None);
        let err = transport
            .send(HttpMethod::Get, "/docker/build/nope", None)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Status(404));
        assert_eq!(err.code(), "bad-status");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_body_is_null_and_garbage_is_decode_error() {
        let server = MockServer::start(vec![
            Step {
                body: None,
                ..Step::ok("POST", "/container/web/start", Value::Null)
            },
            Step {
                body: Some("<html>".to_string()),
                ..Step::ok("GET", "/docker/images", Value::Null)
            },
        ]);
        let transport = server.transport(None);
        let value = transport
            .send(HttpMethod::Post, "container/web/start", None)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        let err = transport
            .send(HttpMethod::Get, "docker/images", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "decode");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn slow_response_maps_to_timeout() {
        let server = MockServer::start(vec![Step {
            delay: Some(Duration::from_millis(1_500)),
            ..Step::ok("GET", "/docker/pull/p1", json!({ "status": "pulling" }))
        }]);
        let transport = server.transport(None);
        let err = transport
            .send(HttpMethod::Get, "docker/pull/p1", None)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }

    #[test]
    fn base_url_must_be_http() {
        let client = Client::new();
        assert!(HttpTransport::with_client(client.clone(), "ftp://host", None).is_err());
        assert!(HttpTransport::with_client(client.clone(), "not a url", None).is_err());
        let transport =
            HttpTransport::with_client(client, "http://host:8000/api", None).unwrap();
        assert_eq!(transport.base_url().as_str(), "http://host:8000/api/");
        assert_eq!(
            transport.url_for("/docker/images").unwrap().as_str(),
            "http://host:8000/api/docker/images"
        );
    }
}
