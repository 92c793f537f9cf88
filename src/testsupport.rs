//! Minimal HTTP file server for downloader tests
//!
//! Serves one payload over raw TCP with just enough HTTP/1.1 to exercise
//! the transport paths: HEAD, GET, Range requests (206 with
//! Content-Range), range-ignoring servers (200 to everything), fixed
//! error statuses, and fail-the-first-N flakiness.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

enum Behavior {
    /// Serve the payload; optionally honor Range
    Serve { payload: Vec<u8>, ranges: bool },
    /// Answer every request with this status and no body
    Status(u16),
}

struct Counters {
    requests: AtomicUsize,
    ranged: AtomicUsize,
    bytes_served: AtomicUsize,
    /// Data requests left to fail before behaving
    fail_remaining: AtomicUsize,
    fail_status: u16,
}

pub struct ByteServer {
    addr: SocketAddr,
    counters: Arc<Counters>,
}

impl ByteServer {
    pub async fn spawn(payload: Vec<u8>, ranges: bool) -> Self {
        Self::spawn_inner(Behavior::Serve { payload, ranges }, 0, 500).await
    }

    pub async fn spawn_with_status(status: u16) -> Self {
        Self::spawn_inner(Behavior::Status(status), 0, 500).await
    }

    /// Fail the first `fail_n` GETs with `fail_status`, then serve normally
    pub async fn spawn_flaky(payload: Vec<u8>, fail_n: usize, fail_status: u16) -> Self {
        Self::spawn_inner(
            Behavior::Serve {
                payload,
                ranges: true,
            },
            fail_n,
            fail_status,
        )
        .await
    }

    async fn spawn_inner(behavior: Behavior, fail_n: usize, fail_status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Arc::new(Counters {
            requests: AtomicUsize::new(0),
            ranged: AtomicUsize::new(0),
            bytes_served: AtomicUsize::new(0),
            fail_remaining: AtomicUsize::new(fail_n),
            fail_status,
        });
        let behavior = Arc::new(behavior);

        let loop_counters = counters.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let behavior = behavior.clone();
                let counters = loop_counters.clone();
                tokio::spawn(async move {
                    let _ = handle(stream, &behavior, &counters).await;
                });
            }
        });

        Self { addr, counters }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn request_count(&self) -> usize {
        self.counters.requests.load(Ordering::SeqCst)
    }

    pub fn ranged_requests(&self) -> usize {
        self.counters.ranged.load(Ordering::SeqCst)
    }

    pub fn bytes_served(&self) -> usize {
        self.counters.bytes_served.load(Ordering::SeqCst)
    }
}

async fn handle(
    mut stream: tokio::net::TcpStream,
    behavior: &Behavior,
    counters: &Counters,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    // requests here have no body; read until the blank line
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Ok(());
        }
        buf.push(byte[0]);
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    }
    let head = String::from_utf8_lossy(&buf);
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let method = request_line.split(' ').next().unwrap_or_default().to_string();
    let range = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("range") {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .next();

    counters.requests.fetch_add(1, Ordering::SeqCst);

    match behavior {
        Behavior::Status(status) => {
            write_status(&mut stream, *status).await?;
        }
        Behavior::Serve { payload, ranges } => {
            if method == "HEAD" {
                let accept = if *ranges {
                    "Accept-Ranges: bytes\r\n"
                } else {
                    ""
                };
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
                    payload.len(),
                    accept
                );
                stream.write_all(head.as_bytes()).await?;
                return Ok(());
            }

            // flakiness applies to data requests only
            if counters
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                write_status(&mut stream, counters.fail_status).await?;
                return Ok(());
            }

            match range.filter(|_| *ranges).and_then(|r| parse_range(&r, payload.len())) {
                Some((from, to)) => {
                    counters.ranged.fetch_add(1, Ordering::SeqCst);
                    let body = &payload[from..=to];
                    let head = format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {from}-{to}/{}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                        body.len(),
                        payload.len()
                    );
                    stream.write_all(head.as_bytes()).await?;
                    stream.write_all(body).await?;
                    counters.bytes_served.fetch_add(body.len(), Ordering::SeqCst);
                }
                None => {
                    let accept = if *ranges {
                        "Accept-Ranges: bytes\r\n"
                    } else {
                        ""
                    };
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
                        payload.len(),
                        accept
                    );
                    stream.write_all(head.as_bytes()).await?;
                    stream.write_all(payload).await?;
                    counters
                        .bytes_served
                        .fetch_add(payload.len(), Ordering::SeqCst);
                }
            }
        }
    }
    stream.flush().await?;
    Ok(())
}

async fn write_status(stream: &mut tokio::net::TcpStream, status: u16) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await
}

/// Parse "bytes=a-b" / "bytes=a-" into inclusive indexes
fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (from, to) = spec.split_once('-')?;
    let from: usize = from.parse().ok()?;
    let to: usize = if to.is_empty() {
        len.checked_sub(1)?
    } else {
        to.parse().ok()?
    };
    if from > to || to >= len {
        return None;
    }
    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=900-1100", 1000), None);
        assert_eq!(parse_range("items=0-1", 1000), None);
    }

    #[tokio::test]
    async fn test_serves_full_and_ranged() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let server = ByteServer::spawn(payload.clone(), true).await;
        let client = reqwest::Client::new();

        let full = client
            .get(server.url("/f"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&full[..], &payload[..]);

        let part = client
            .get(server.url("/f"))
            .header("Range", "bytes=10-19")
            .send()
            .await
            .unwrap();
        assert_eq!(part.status().as_u16(), 206);
        assert_eq!(&part.bytes().await.unwrap()[..], &payload[10..20]);
        assert_eq!(server.ranged_requests(), 1);
    }

    #[tokio::test]
    async fn test_range_ignoring_server_returns_200() {
        let payload = vec![1u8; 100];
        let server = ByteServer::spawn(payload, false).await;
        let client = reqwest::Client::new();
        let response = client
            .get(server.url("/f"))
            .header("Range", "bytes=0-9")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.bytes().await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_flaky_fails_then_serves() {
        let server = ByteServer::spawn_flaky(vec![2u8; 10], 1, 503).await;
        let client = reqwest::Client::new();
        let first = client.get(server.url("/f")).send().await.unwrap();
        assert_eq!(first.status().as_u16(), 503);
        let second = client.get(server.url("/f")).send().await.unwrap();
        assert_eq!(second.status().as_u16(), 200);
    }
}
