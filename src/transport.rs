use std::fs::{File, OpenOptions};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::{debug, warn};

use crate::error::TerraError;

/// Moves remote bytes into a local file. Implementations append to `dest`
/// starting at byte `resume_from` and return the file's length afterwards.
pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path, resume_from: u64) -> Result<u64, TerraError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn fetch(&self, url: &str, dest: &Path, resume_from: u64) -> Result<u64, TerraError> {
        (**self).fetch(url, dest, resume_from)
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub retries: usize,
    pub backoff: Duration,
    pub timeout: Duration,
    pub credentials: Option<Credentials>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(300),
            credentials: None,
        }
    }
}

pub struct HttpTransport {
    client: Client,
    options: TransportOptions,
}

impl HttpTransport {
    pub fn new(options: TransportOptions) -> Result<Self, TerraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("terra-dm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| TerraError::Transfer(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .build()
            .map_err(|err| TerraError::Transfer(err.to_string()))?;
        Ok(Self { client, options })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, TerraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let mut request = make_req();
            if let Some(creds) = &self.options.credentials {
                request = request.basic_auth(&creds.username, Some(&creds.password));
            }
            match request.send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.options.retries && is_retryable_status(status) {
                        warn!(status, attempt, "retryable status from server");
                        self.pause(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.options.retries && is_retryable_error(&err) {
                        warn!(error = %err, attempt, "transfer attempt failed; retrying");
                        self.pause(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(TerraError::Transfer(err.to_string()));
                }
            }
        }
    }

    fn pause(&self, attempt: usize) {
        thread::sleep(self.options.backoff * (attempt as u32 + 1));
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, dest: &Path, resume_from: u64) -> Result<u64, TerraError> {
        let mut response = self.send_with_retries(|| {
            let request = self.client.get(url);
            if resume_from > 0 {
                request.header(RANGE, format!("bytes={resume_from}-"))
            } else {
                request
            }
        })?;

        let status = response.status();
        let mut file = match write_mode(status) {
            Some(WriteMode::Append) => {
                debug!(url, resume_from, "resuming transfer");
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(dest)
                    .map_err(|err| TerraError::Filesystem(format!("{}: {err}", dest.display())))?
            }
            Some(WriteMode::Complete) => return file_len(dest),
            Some(WriteMode::Truncate) => {
                if resume_from > 0 {
                    debug!(url, resume_from, "server ignored range; restarting transfer");
                }
                File::create(dest)
                    .map_err(|err| TerraError::Filesystem(format!("{}: {err}", dest.display())))?
            }
            None => {
                let message = response
                    .text()
                    .unwrap_or_else(|_| "download request failed".to_string());
                return Err(TerraError::ProviderStatus {
                    status: status.as_u16(),
                    message,
                });
            }
        };
        std::io::copy(&mut response, &mut file)
            .map_err(|err| TerraError::Transfer(format!("{url}: {err}")))?;
        file.sync_all()
            .map_err(|err| TerraError::Filesystem(format!("{}: {err}", dest.display())))?;
        file_len(dest)
    }
}

/// How a response body lands in the part file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// 206: the body continues from the requested offset.
    Append,
    /// Any other 2xx: the server sent the whole file.
    Truncate,
    /// 416: nothing left past the offset.
    Complete,
}

fn write_mode(status: StatusCode) -> Option<WriteMode> {
    match status {
        StatusCode::PARTIAL_CONTENT => Some(WriteMode::Append),
        StatusCode::RANGE_NOT_SATISFIABLE => Some(WriteMode::Complete),
        status if status.is_success() => Some(WriteMode::Truncate),
        _ => None,
    }
}

fn file_len(path: &Path) -> Result<u64, TerraError> {
    std::fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| TerraError::Filesystem(format!("{}: {err}", path.display())))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(206));
    }

    #[test]
    fn status_decides_how_the_part_file_is_written() {
        assert_eq!(write_mode(StatusCode::PARTIAL_CONTENT), Some(WriteMode::Append));
        assert_eq!(write_mode(StatusCode::OK), Some(WriteMode::Truncate));
        assert_eq!(write_mode(StatusCode::RANGE_NOT_SATISFIABLE), Some(WriteMode::Complete));
        assert_eq!(write_mode(StatusCode::NOT_FOUND), None);
        assert_eq!(write_mode(StatusCode::FOUND), None);
    }

    /// Answers a single request with a canned reply and hands back the
    /// request head it received.
    fn serve_once(status_line: &'static str, body: &'static [u8]) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/scene.h5", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = stream.read(&mut buf).unwrap();
                if read == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..read]);
            }
            let reply = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(reply.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
            String::from_utf8_lossy(&head).to_ascii_lowercase()
        });
        (url, handle)
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(TransportOptions {
            retries: 0,
            timeout: Duration::from_secs(10),
            ..TransportOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn partial_content_is_appended_after_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("scene.h5.part");
        std::fs::write(&part, b"hello").unwrap();

        let (url, server) = serve_once("206 Partial Content", b" world");
        assert_eq!(transport().fetch(&url, &part, 5).unwrap(), 11);
        assert!(server.join().unwrap().contains("range: bytes=5-"));
        assert_eq!(std::fs::read(&part).unwrap(), b"hello world");
    }

    #[test]
    fn full_reply_to_a_range_request_replaces_the_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("scene.h5.part");
        std::fs::write(&part, b"hello").unwrap();

        let (url, server) = serve_once("200 OK", b"hello world");
        assert_eq!(transport().fetch(&url, &part, 5).unwrap(), 11);
        server.join().unwrap();
        assert_eq!(std::fs::read(&part).unwrap(), b"hello world");
    }

    #[test]
    fn fresh_fetch_sends_no_range() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("scene.h5.part");

        let (url, server) = serve_once("200 OK", b"hello world");
        assert_eq!(transport().fetch(&url, &part, 0).unwrap(), 11);
        assert!(!server.join().unwrap().contains("range:"));
        assert_eq!(std::fs::read(&part).unwrap(), b"hello world");
    }

    #[test]
    fn unsatisfiable_range_leaves_the_part_file_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("scene.h5.part");
        std::fs::write(&part, b"hello world").unwrap();

        let (url, server) = serve_once("416 Range Not Satisfiable", b"");
        assert_eq!(transport().fetch(&url, &part, 11).unwrap(), 11);
        server.join().unwrap();
        assert_eq!(std::fs::read(&part).unwrap(), b"hello world");
    }

    #[test]
    fn error_status_keeps_partial_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("scene.h5.part");
        std::fs::write(&part, b"hello").unwrap();

        let (url, server) = serve_once("404 Not Found", b"no such granule");
        assert_matches!(
            transport().fetch(&url, &part, 5),
            Err(TerraError::ProviderStatus { status: 404, message }) if message == "no such granule"
        );
        server.join().unwrap();
        assert_eq!(std::fs::read(&part).unwrap(), b"hello");
    }
}
