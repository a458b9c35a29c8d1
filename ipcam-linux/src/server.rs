//! Embedded HTTP listener: accept connections, parse the request head and hand
//! bridge requests to the peer they address.

use std::sync::Arc;

use ipcam_core::Central;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::bridge;

/// Largest request head accepted.
const MAX_HEAD: usize = 65536;

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const METHOD_NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nAllow: GET\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Parsed request line and headers.
#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    headers: Vec<(String, Vec<u8>)>,
}

/// Accept connections and serve each on its own task.
pub async fn serve(listener: TcpListener, central: Arc<Central>) -> std::io::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        let central = central.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, central).await {
                tracing::debug!(client = %addr, error = %e, "Connection ended with error");
            }
        });
    }
}

fn parse_request(buf: &[u8]) -> Option<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(buf).ok()?;
    if !status.is_complete() {
        return None;
    }
    Some(RequestHead {
        method: req.method?.to_string(),
        path: req.path?.to_string(),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    })
}

/// Read until the end of the request head. `None` if the client closed first.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(Some(buf));
        }
        if buf.len() > MAX_HEAD {
            return Ok(Some(buf));
        }
    }
}

async fn handle_client(mut stream: TcpStream, central: Arc<Central>) -> std::io::Result<()> {
    let Some(buf) = read_head(&mut stream).await? else {
        return Ok(());
    };
    let Some(head) = parse_request(&buf) else {
        stream.write_all(BAD_REQUEST).await?;
        return Ok(());
    };
    let Some((peer_id, action)) = bridge::route(&head.path) else {
        tracing::debug!(path = %head.path, "No handler for path");
        stream.write_all(NOT_FOUND).await?;
        return Ok(());
    };
    if !head.method.eq_ignore_ascii_case("GET") {
        stream.write_all(METHOD_NOT_ALLOWED).await?;
        return Ok(());
    }
    let peer = match central.peer(peer_id) {
        Some(p) if p.hooks_attached() && p.is_alive() => p,
        _ => {
            tracing::debug!(peer_id, "Bridge request for unknown or detached peer");
            stream.write_all(NOT_FOUND).await?;
            return Ok(());
        }
    };
    bridge::handle(&mut stream, peer, action, &head.headers).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::{camera, central, read_head as read_reply_head};
    use std::time::{Duration, Instant};

    async fn start(central: Arc<Central>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, central));
        port
    }

    async fn request(port: u16, raw: &str) -> String {
        let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        s.write_all(raw.as_bytes()).await.unwrap();
        read_reply_head(&mut s).await
    }

    #[test]
    fn parses_head() {
        let head = parse_request(b"GET /ipcam/1/motion HTTP/1.1\r\nHost: hub\r\nAccept: */*\r\n\r\n").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/ipcam/1/motion");
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers[1], ("Accept".to_string(), b"*/*".to_vec()));
        assert!(parse_request(b"GET /ipcam/1/motion HTTP/1.1\r\nHost: hub\r\n").is_none());
    }

    #[tokio::test]
    async fn motion_webhook_end_to_end() {
        let central = central();
        let peer = camera(&central, &[]);
        let port = start(central.clone()).await;
        let reply = request(
            port,
            &format!("GET /ipcam/{}/motion HTTP/1.1\r\nHost: hub\r\n\r\n", peer.id()),
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !peer.motion_active() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(peer.motion_active());
    }

    #[tokio::test]
    async fn unknown_paths_and_peers() {
        let central = central();
        let peer = camera(&central, &[]);
        let port = start(central.clone()).await;
        assert!(request(port, "GET /nothing HTTP/1.1\r\n\r\n").await.starts_with("HTTP/1.1 404"));
        assert!(request(port, "GET /ipcam/999/motion HTTP/1.1\r\n\r\n")
            .await
            .starts_with("HTTP/1.1 404"));
        let post = format!("POST /ipcam/{}/motion HTTP/1.1\r\nContent-Length: 0\r\n\r\n", peer.id());
        assert!(request(port, &post).await.starts_with("HTTP/1.1 405"));

        peer.detach_hooks();
        let get = format!("GET /ipcam/{}/motion HTTP/1.1\r\n\r\n", peer.id());
        assert!(request(port, &get).await.starts_with("HTTP/1.1 404"));
        assert!(!peer.motion_active());
    }
}
