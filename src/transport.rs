use std::error::Error;
use std::io::{self, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER,
    USER_AGENT,
};
use thiserror::Error;
use tracing::debug;

use crate::domain::Dataset;
use crate::error::IngestError;

const BROWSER_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

pub const DIAGNOSTIC_SAMPLE_BYTES: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("read timeout")]
    ReadTimeout,
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("no data for {0:?} while streaming")]
    Stalled(Duration),
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Other(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: String,
    pub url: String,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub chunk_size: usize,
    pub stall: Duration,
    pub total: Duration,
}

/// The two HTTP shapes the download form needs. Implemented over reqwest in
/// production and by scripted fakes in tests.
pub trait FormTransport: Send + Sync {
    fn get(&self, url: &str, read_timeout: Duration) -> Result<HttpReply, TransportError>;

    fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
        read_timeout: Duration,
    ) -> Result<HttpReply, TransportError>;

    /// `read_timeout` bounds the wait for the first byte only. After that the
    /// body may take up to `stream.total`, failing with
    /// [`TransportError::Stalled`] when no bytes arrive within `stream.stall`.
    fn post_form_streamed(
        &self,
        url: &str,
        form: &[(String, String)],
        read_timeout: Duration,
        stream: StreamOptions,
    ) -> Result<HttpReply, TransportError>;
}

pub fn is_archive_content_type(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    lowered.contains("zip") || lowered.contains("application/octet-stream")
}

#[derive(Clone)]
pub struct HttpFormTransport {
    client: Client,
}

impl HttpFormTransport {
    pub fn new(dataset: Dataset, connect_timeout: Duration) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(REFERER, HeaderValue::from_static(dataset.form_url()));
        headers.insert(ORIGIN, HeaderValue::from_static(dataset.form_origin()));
        // keep-alive reuse makes the form server drop connections mid-response
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .no_proxy()
            .cookie_store(true)
            .build()
            .map_err(|err| IngestError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    fn buffered(response: Response) -> Result<HttpReply, TransportError> {
        let status = response.status().as_u16();
        let content_type = content_type_of(&response);
        let url = response.url().to_string();
        let body = response.bytes().map_err(classify)?.to_vec();
        debug!(status, url = %url, bytes = body.len(), "response read");
        Ok(HttpReply {
            status,
            content_type,
            url,
            body,
        })
    }
}

impl FormTransport for HttpFormTransport {
    fn get(&self, url: &str, read_timeout: Duration) -> Result<HttpReply, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(read_timeout)
            .send()
            .map_err(classify)?;
        Self::buffered(response)
    }

    fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
        read_timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .timeout(read_timeout)
            .send()
            .map_err(classify)?;
        Self::buffered(response)
    }

    fn post_form_streamed(
        &self,
        url: &str,
        form: &[(String, String)],
        read_timeout: Duration,
        stream: StreamOptions,
    ) -> Result<HttpReply, TransportError> {
        let started = Instant::now();
        let request = self.client.post(url).form(form).timeout(stream.total);
        let response = send_within(request, read_timeout)?;
        let status = response.status().as_u16();
        let content_type = content_type_of(&response);
        let url = response.url().to_string();

        if !response.status().is_success() || !is_archive_content_type(&content_type) {
            let mut sample = Vec::new();
            // best effort; the status or content type is the failure being reported
            let _ = response
                .take(DIAGNOSTIC_SAMPLE_BYTES)
                .read_to_end(&mut sample);
            return Ok(HttpReply {
                status,
                content_type,
                url,
                body: sample,
            });
        }

        let first_byte = read_timeout.saturating_sub(started.elapsed());
        let body =
            read_with_stall_watchdog(response, stream.chunk_size, first_byte, stream.stall)?;
        Ok(HttpReply {
            status,
            content_type,
            url,
            body,
        })
    }
}

/// Sends on a helper thread and gives up with a read timeout when the
/// response head does not arrive within `limit`.
fn send_within(request: RequestBuilder, limit: Duration) -> Result<Response, TransportError> {
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("form-send".to_string())
        .spawn(move || {
            let _ = tx.send(request.send());
        })
        .map_err(|err| TransportError::Other(err.to_string()))?;
    match rx.recv_timeout(limit) {
        Ok(result) => result.map_err(classify),
        Err(RecvTimeoutError::Timeout) => Err(TransportError::ReadTimeout),
        Err(RecvTimeoutError::Disconnected) => {
            Err(TransportError::Other("request thread exited".to_string()))
        }
    }
}

/// Reads `reader` to the end on a helper thread. The first chunk must arrive
/// within `first_byte`, every later one within `stall`. The whole body is
/// returned as one buffer.
pub fn read_with_stall_watchdog<R>(
    reader: R,
    chunk_size: usize,
    first_byte: Duration,
    stall: Duration,
) -> Result<Vec<u8>, TransportError>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<io::Result<Vec<u8>>>(8);
    let chunk_size = chunk_size.max(1);
    thread::Builder::new()
        .name("form-stream".to_string())
        .spawn(move || {
            let mut reader = reader;
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        })
        .map_err(|err| TransportError::Other(err.to_string()))?;

    let mut body = Vec::new();
    let mut received_any = false;
    loop {
        let wait = if received_any { stall } else { first_byte };
        match rx.recv_timeout(wait) {
            Ok(Ok(chunk)) => {
                received_any = true;
                body.extend_from_slice(&chunk);
            }
            Ok(Err(err)) => return Err(classify_io(&err)),
            Err(RecvTimeoutError::Timeout) if received_any => {
                return Err(TransportError::Stalled(stall));
            }
            Err(RecvTimeoutError::Timeout) => return Err(TransportError::ReadTimeout),
            Err(RecvTimeoutError::Disconnected) => return Ok(body),
        }
    }
}

fn content_type_of(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub(crate) fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || chain_has_timeout(&err) {
        if err.is_connect() {
            TransportError::ConnectTimeout
        } else {
            TransportError::ReadTimeout
        }
    } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        TransportError::ConnectionReset(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

// Body reads through `Read` surface reqwest errors wrapped in `io::Error`.
fn classify_io(err: &io::Error) -> TransportError {
    if chain_has_timeout(err) {
        return TransportError::ReadTimeout;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => TransportError::ReadTimeout,
        _ => TransportError::ConnectionReset(err.to_string()),
    }
}

// `io::Error::source` skips the wrapped error, so custom io errors are
// unwrapped with `get_ref` before following the chain.
fn chain_has_timeout(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(cause) = current {
        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>()
            && reqwest_err.is_timeout()
        {
            return true;
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
            if let Some(inner) = io_err.get_ref() {
                current = Some(inner as &(dyn Error + 'static));
                continue;
            }
        }
        if cause.to_string().to_ascii_lowercase().contains("timed out") {
            return true;
        }
        current = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    // Yields each chunk after its own delay.
    struct SlowReader {
        chunks: Vec<(Duration, Vec<u8>)>,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let (delay, chunk) = self.chunks.remove(0);
            thread::sleep(delay);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn watchdog_collects_all_chunks() {
        let reader = SlowReader {
            chunks: vec![(ms(5), b"PK".to_vec()), (ms(5), b"\x03\x04".to_vec())],
        };
        let body = read_with_stall_watchdog(reader, 16, ms(2000), ms(2000)).unwrap();
        assert_eq!(body, b"PK\x03\x04");
    }

    #[test]
    fn watchdog_reports_stall_after_first_chunk() {
        let reader = SlowReader {
            chunks: vec![(ms(5), b"PK".to_vec()), (ms(500), b"\x03\x04".to_vec())],
        };
        let err = read_with_stall_watchdog(reader, 16, ms(2000), ms(50)).unwrap_err();
        assert_eq!(err, TransportError::Stalled(ms(50)));
        assert!(err.is_transient());
    }

    #[test]
    fn watchdog_waits_first_byte_window_then_times_out() {
        let reader = SlowReader {
            chunks: vec![(ms(500), b"PK".to_vec())],
        };
        let err = read_with_stall_watchdog(reader, 16, ms(50), ms(5000)).unwrap_err();
        assert_eq!(err, TransportError::ReadTimeout);
    }

    #[test]
    fn wrapped_timeouts_classify_as_read_timeout() {
        let wrapped = io::Error::other(io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(classify_io(&wrapped), TransportError::ReadTimeout);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_matches::assert_matches!(classify_io(&reset), TransportError::ConnectionReset(_));
    }

    // Reads one request (head plus `Content-Length` body) off the socket.
    fn drain_request(stream: &mut TcpStream) {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            received.extend_from_slice(&buf[..n]);
            let Some(head_end) = received.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&received[..head_end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if received.len() >= head_end + 4 + length {
                return;
            }
        }
    }

    // Serves one zip response: the head at once, then `body` one byte at a
    // time after `first_delay`, with `pace` between bytes.
    fn trickle_server(body: Vec<u8>, first_delay: Duration, pace: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            drain_request(&mut stream);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/zip\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            if stream.write_all(head.as_bytes()).is_err() {
                return;
            }
            let _ = stream.flush();
            thread::sleep(first_delay);
            for byte in body {
                if stream.write_all(&[byte]).is_err() || stream.flush().is_err() {
                    return;
                }
                thread::sleep(pace);
            }
        });
        format!("http://{addr}/download")
    }

    fn transport() -> HttpFormTransport {
        HttpFormTransport::new(Dataset::Db1bMarket, Duration::from_secs(2)).unwrap()
    }

    fn form() -> Vec<(String, String)> {
        vec![("year".to_string(), "2001".to_string())]
    }

    #[test]
    fn streamed_body_may_outlast_read_timeout_while_bytes_flow() {
        let body = vec![b'Z'; 30];
        let url = trickle_server(body.clone(), ms(0), ms(60));
        let stream = StreamOptions {
            chunk_size: 64,
            stall: ms(1000),
            total: Duration::from_secs(30),
        };

        let started = Instant::now();
        let reply = transport()
            .post_form_streamed(&url, &form(), ms(1000), stream)
            .unwrap();

        assert!(started.elapsed() > ms(1000));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, body);
    }

    #[test]
    fn streamed_first_byte_is_bounded_by_read_timeout() {
        let url = trickle_server(vec![b'Z'; 4], ms(3000), ms(0));
        let stream = StreamOptions {
            chunk_size: 64,
            stall: ms(10_000),
            total: Duration::from_secs(30),
        };

        let err = transport()
            .post_form_streamed(&url, &form(), ms(500), stream)
            .unwrap_err();

        assert_eq!(err, TransportError::ReadTimeout);
    }

    #[test]
    fn buffered_body_timeout_is_a_read_timeout() {
        let url = trickle_server(vec![b'Z'; 4], ms(3000), ms(0));

        let err = transport().post_form(&url, &form(), ms(500)).unwrap_err();

        assert_eq!(err, TransportError::ReadTimeout);
    }

    #[test]
    fn archive_content_types() {
        assert!(is_archive_content_type("application/x-zip-compressed"));
        assert!(is_archive_content_type("Application/Octet-Stream"));
        assert!(!is_archive_content_type("text/html; charset=utf-8"));
    }
}
