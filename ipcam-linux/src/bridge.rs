//! Media proxy bridge: stream and snapshot relays to the camera's own HTTP endpoints,
//! the motion webhook, and outbound custom-URL triggers.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ipcam_core::protocol::BRIDGE_NAMESPACE;
use ipcam_core::{OutboundRequest, Peer};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Connect timeout and per-read timeout towards the camera.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a relay waiting on the camera re-checks that its peer is still alive.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

const USER_AGENT: &str = concat!("ipcam-linux/", env!("CARGO_PKG_VERSION"));

const MOTION_ACK: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n";
const NOT_CONFIGURED: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Inbound headers the relay re-synthesizes instead of forwarding.
const RESYNTHESIZED: [&str; 3] = ["user-agent", "host", "connection"];

/// Endpoint below `/ipcam/{peer_id}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Stream,
    Snapshot,
    Motion,
}

/// Map `/ipcam/{peer_id}/{stream.mjpeg|snapshot.jpg|motion}` to a peer id and action.
/// The query string is ignored.
pub fn route(path: &str) -> Option<(u64, Action)> {
    let path = path.split('?').next()?;
    let mut parts = path.strip_prefix('/')?.split('/');
    if parts.next()? != BRIDGE_NAMESPACE {
        return None;
    }
    let peer_id = parts.next()?.parse::<u64>().ok()?;
    let action = match parts.next()? {
        "stream.mjpeg" => Action::Stream,
        "snapshot.jpg" => Action::Snapshot,
        "motion" => Action::Motion,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((peer_id, action))
}

/// Serve one bridge request. `headers` are the inbound request headers.
pub async fn handle<W>(client: &mut W, peer: Arc<Peer>, action: Action, headers: &[(String, Vec<u8>)])
where
    W: AsyncWrite + Unpin,
{
    match action {
        Action::Stream => stream(client, &peer, headers).await,
        Action::Snapshot => snapshot(client, &peer).await,
        Action::Motion => motion(client, peer).await,
    }
}

async fn http_client(ca_file: &str, verify_certificate: bool) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(UPSTREAM_TIMEOUT)
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(!verify_certificate);
    if !ca_file.is_empty() {
        let pem = tokio::fs::read(ca_file)
            .await
            .with_context(|| format!("reading CA file {}", ca_file))?;
        let cert = reqwest::Certificate::from_pem(&pem).context("parsing CA file")?;
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder.build()?)
}

/// Status line and headers of an upstream response, minus hop-by-hop headers.
fn response_head(resp: &reqwest::Response, skip: &[&str], extra: &[(&str, String)]) -> Vec<u8> {
    let status = resp.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in resp.headers() {
        if skip.contains(&name.as_str()) {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    for (name, value) in extra {
        head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Outcome of one wait on the camera.
enum Upstream<T> {
    Ready(T),
    TimedOut,
    /// The peer is deleting, disposing or the hub is shutting down.
    Gone,
}

/// Await `fut` for at most [`UPSTREAM_TIMEOUT`], giving up early once `peer` stops being alive.
async fn while_alive<F: Future>(peer: &Peer, fut: F) -> Upstream<F::Output> {
    let gone = async {
        while peer.is_alive() {
            tokio::time::sleep(LIVENESS_POLL).await;
        }
    };
    tokio::select! {
        r = tokio::time::timeout(UPSTREAM_TIMEOUT, fut) => match r {
            Ok(v) => Upstream::Ready(v),
            Err(_) => Upstream::TimedOut,
        },
        _ = gone => Upstream::Gone,
    }
}

fn log_client_error(peer_id: u64, e: &io::Error) {
    match e.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            tracing::info!(peer_id, "Client closed the stream")
        }
        _ => tracing::error!(peer_id, error = %e, "Writing to client failed"),
    }
}

/// Relay the camera stream until the peer goes away or either side closes.
/// Liveness is checked before each relayed chunk and while waiting on the camera.
pub async fn stream<W>(client: &mut W, peer: &Peer, headers: &[(String, Vec<u8>)])
where
    W: AsyncWrite + Unpin,
{
    let peer_id = peer.id();
    let http = peer.http_config();
    if !http.stream.is_configured() {
        tracing::warn!(peer_id, "Stream requested but STREAM_URL is not configured");
        let _ = client.write_all(NOT_CONFIGURED).await;
        return;
    }
    let http_client = match http_client(&http.ca_file, http.verify_certificate).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(peer_id, error = %e, "Could not create HTTP client");
            return;
        }
    };
    let mut request = http_client.get(http.stream.to_url());
    for (name, value) in headers {
        if RESYNTHESIZED.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        request = request.header(name.as_str(), value.clone());
    }
    let mut resp = match while_alive(peer, request.send()).await {
        Upstream::Ready(Ok(r)) => r,
        Upstream::Ready(Err(e)) if e.is_timeout() => {
            tracing::warn!(peer_id, error = %e, "Stream upstream timed out");
            return;
        }
        Upstream::Ready(Err(e)) => {
            tracing::error!(peer_id, error = %e, "Stream upstream request failed");
            return;
        }
        Upstream::TimedOut => {
            tracing::warn!(peer_id, "Stream upstream sent no response");
            return;
        }
        Upstream::Gone => {
            tracing::info!(peer_id, "Peer going away, abandoning stream request");
            return;
        }
    };
    let head = response_head(&resp, &["transfer-encoding", "connection"], &[("Connection", "close".into())]);
    if let Err(e) = client.write_all(&head).await {
        log_client_error(peer_id, &e);
        return;
    }
    tracing::debug!(peer_id, status = resp.status().as_u16(), "Relaying stream");
    loop {
        if !peer.is_alive() {
            tracing::info!(peer_id, "Peer going away, stopping stream relay");
            break;
        }
        match while_alive(peer, resp.chunk()).await {
            Upstream::TimedOut => {
                tracing::warn!(peer_id, "Stream upstream read timed out");
                break;
            }
            Upstream::Gone => {
                tracing::info!(peer_id, "Peer going away, stopping stream relay");
                break;
            }
            Upstream::Ready(Ok(None)) => {
                tracing::info!(peer_id, "Stream upstream closed");
                break;
            }
            Upstream::Ready(Err(e)) if e.is_timeout() => {
                tracing::warn!(peer_id, error = %e, "Stream upstream timed out");
                break;
            }
            Upstream::Ready(Err(e)) => {
                tracing::error!(peer_id, error = %e, "Stream upstream failed");
                break;
            }
            Upstream::Ready(Ok(Some(bytes))) => {
                if let Err(e) = client.write_all(&bytes).await {
                    log_client_error(peer_id, &e);
                    break;
                }
            }
        }
    }
}

/// One-shot relay of the camera snapshot. Failures end the request without a body.
pub async fn snapshot<W>(client: &mut W, peer: &Peer)
where
    W: AsyncWrite + Unpin,
{
    let peer_id = peer.id();
    let http = peer.http_config();
    if !http.snapshot.is_configured() {
        tracing::warn!(peer_id, "Snapshot requested but SNAPSHOT_URL is not configured");
        let _ = client.write_all(NOT_CONFIGURED).await;
        return;
    }
    let result = async {
        let http_client = http_client(&http.ca_file, http.verify_certificate).await?;
        let resp = http_client
            .get(http.snapshot.to_url())
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await?;
        let head_resp = response_head(
            &resp,
            &["transfer-encoding", "connection", "content-length"],
            &[],
        );
        let body = resp.bytes().await?;
        anyhow::Ok((head_resp, body))
    }
    .await;
    let (head, body) = match result {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(peer_id, error = %e, "Snapshot request failed");
            return;
        }
    };
    // response_head already terminated the header block; splice in the framing headers
    let mut out = head[..head.len() - 2].to_vec();
    out.extend_from_slice(format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    if let Err(e) = client.write_all(&out).await {
        log_client_error(peer_id, &e);
    }
}

/// Acknowledge the webhook and close, then record the motion.
pub async fn motion<W>(client: &mut W, peer: Arc<Peer>)
where
    W: AsyncWrite + Unpin,
{
    let peer_id = peer.id();
    if let Err(e) = client.write_all(MOTION_ACK).await {
        tracing::debug!(peer_id, error = %e, "Could not acknowledge motion webhook");
    }
    let _ = client.shutdown().await;
    match tokio::task::spawn_blocking(move || peer.trigger_motion()).await {
        Ok(Ok(())) => tracing::debug!(peer_id, "Motion triggered"),
        Ok(Err(e)) => tracing::error!(peer_id, error = %e, "Could not record motion"),
        Err(e) => tracing::error!(peer_id, error = %e, "Motion task failed"),
    }
}

/// Perform one outbound GET with the peer's TLS settings. Returns the HTTP status.
pub async fn perform(request: &OutboundRequest) -> anyhow::Result<u16> {
    let http_client = http_client(&request.ca_file, request.verify_certificate).await?;
    let resp = http_client
        .get(request.url.to_url())
        .timeout(UPSTREAM_TIMEOUT)
        .send()
        .await?;
    Ok(resp.status().as_u16())
}

/// Fire and forget: each request runs on its own task and only logs its outcome.
pub fn spawn_outbound(requests: Vec<OutboundRequest>) {
    for request in requests {
        tokio::spawn(async move {
            match perform(&request).await {
                Ok(status) => tracing::info!(peer_id = request.peer_id, status, "Custom URL called"),
                Err(e) => tracing::error!(peer_id = request.peer_id, error = %e, "Custom URL failed"),
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ipcam_core::catalog::GENERIC_IPCAM_TYPE;
    use ipcam_core::peer::{CONFIG_CHANNEL, SNAPSHOT_URL, STREAM_URL};
    use ipcam_core::{
        Catalog, Central, Context, LogSink, MemoryStorage, ParamsetKind, Settings, UrlInfo, Value,
    };
    use std::collections::BTreeMap;
    use tokio::io::{AsyncRead, AsyncReadExt};
    use tokio::net::{TcpListener, TcpStream};

    pub(crate) fn central() -> Arc<Central> {
        let ctx = Context::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(Catalog::builtin().unwrap()),
            Arc::new(LogSink),
            Settings::default(),
        );
        Arc::new(Central::new(Arc::new(ctx), 0, "VIC0000001"))
    }

    pub(crate) fn camera(central: &Central, config: &[(&str, String)]) -> Arc<Peer> {
        let id = central.create_device(GENERIC_IPCAM_TYPE, "CAM0000001").unwrap();
        let peer = central.peer(id).unwrap();
        let values: BTreeMap<String, Value> = config
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(v.as_str())))
            .collect();
        peer.put_paramset(CONFIG_CHANNEL, ParamsetKind::Config, &values).unwrap();
        peer
    }

    pub(crate) async fn read_head<R: AsyncRead + Unpin>(s: &mut R) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            if s.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            buf.push(byte[0]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn routes() {
        assert_eq!(route("/ipcam/7/stream.mjpeg"), Some((7, Action::Stream)));
        assert_eq!(route("/ipcam/7/snapshot.jpg?t=1"), Some((7, Action::Snapshot)));
        assert_eq!(route("/ipcam/12/motion"), Some((12, Action::Motion)));
        assert_eq!(route("/ipcam/x/motion"), None);
        assert_eq!(route("/other/7/motion"), None);
        assert_eq!(route("/ipcam/7/motion/extra"), None);
        assert_eq!(route("/ipcam/7"), None);
    }

    #[tokio::test]
    async fn motion_acknowledges_then_sets_value() {
        let central = central();
        let peer = camera(&central, &[]);
        let (mut ours, mut theirs) = tokio::io::duplex(1024);
        motion(&mut ours, peer.clone()).await;
        drop(ours);
        let mut reply = Vec::new();
        theirs.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, MOTION_ACK);
        assert!(peer.motion_active());
    }

    #[tokio::test]
    async fn unconfigured_stream_is_refused() {
        let central = central();
        let peer = camera(&central, &[]);
        let (mut ours, mut theirs) = tokio::io::duplex(1024);
        stream(&mut ours, &peer, &[]).await;
        drop(ours);
        let mut reply = String::new();
        theirs.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 503"));
    }

    #[tokio::test]
    async fn snapshot_relays_image() {
        let (listener, port) = local_listener().await;
        let upstream = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let head = read_head(&mut s).await;
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG")
                .await
                .unwrap();
            head
        });
        let central = central();
        let peer = camera(
            &central,
            &[(SNAPSHOT_URL, format!("http://127.0.0.1:{}/snap.jpg", port))],
        );
        let (mut ours, mut theirs) = tokio::io::duplex(64 * 1024);
        snapshot(&mut ours, &peer).await;
        drop(ours);
        let mut reply = Vec::new();
        theirs.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8_lossy(&reply).to_string();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.to_ascii_lowercase().contains("content-type: image/jpeg"));
        assert!(reply.contains("Content-Length: 4\r\n"));
        assert!(reply.ends_with("\r\n\r\nJPEG"));
        assert!(upstream.await.unwrap().starts_with("GET /snap.jpg HTTP/1.1"));
    }

    #[tokio::test]
    async fn snapshot_failure_sends_nothing() {
        // bound then dropped, so nothing listens there
        let (listener, port) = local_listener().await;
        drop(listener);
        let central = central();
        let peer = camera(
            &central,
            &[(SNAPSHOT_URL, format!("http://127.0.0.1:{}/snap.jpg", port))],
        );
        let (mut ours, mut theirs) = tokio::io::duplex(1024);
        snapshot(&mut ours, &peer).await;
        drop(ours);
        let mut reply = Vec::new();
        theirs.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn stream_relay_stops_when_peer_deleted() {
        let (listener, port) = local_listener().await;
        let upstream = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let head = read_head(&mut s).await;
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\n\r\n")
                .await
                .unwrap();
            // never closes on its own
            while s.write_all(b"--frame\r\n").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            head
        });
        let central = central();
        let peer = camera(
            &central,
            &[(STREAM_URL, format!("http://127.0.0.1:{}/video", port))],
        );

        let (mut ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let relay_peer = peer.clone();
        let relay = tokio::spawn(async move {
            let headers = vec![
                ("Accept".to_string(), b"*/*".to_vec()),
                ("User-Agent".to_string(), b"curl/8".to_vec()),
                ("Host".to_string(), b"hub.lan".to_vec()),
            ];
            stream(&mut ours, &relay_peer, &headers).await;
        });

        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while seen.windows(7).filter(|w| *w == b"--frame").count() < 2 {
            let n = theirs.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&seen).to_string();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));

        peer.set_deleting();
        tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay did not stop")
            .unwrap();

        let head = upstream.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /video http/1.1"));
        assert!(head.contains("accept: */*"));
        assert!(head.contains("user-agent: ipcam-linux/"));
        assert!(!head.contains("curl"));
        assert!(head.contains(&format!("host: 127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn stream_request_abandoned_when_camera_silent_and_peer_deleted() {
        let (listener, port) = local_listener().await;
        let upstream = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            read_head(&mut s).await;
            // accept the request but never answer it
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(s);
        });
        let central = central();
        let peer = camera(
            &central,
            &[(STREAM_URL, format!("http://127.0.0.1:{}/video", port))],
        );

        let held = Arc::strong_count(&peer);
        let (mut ours, mut theirs) = tokio::io::duplex(1024);
        let relay_peer = peer.clone();
        let relay = tokio::spawn(async move {
            stream(&mut ours, &relay_peer, &[]).await;
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!relay.is_finished());

        peer.set_deleting();
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay did not stop")
            .unwrap();
        // nothing was relayed and the relay released its peer
        let mut reply = Vec::new();
        theirs.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        assert_eq!(Arc::strong_count(&peer), held);
        upstream.abort();
    }

    #[tokio::test]
    async fn outbound_request_hits_custom_url() {
        let (listener, port) = local_listener().await;
        let upstream = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let head = read_head(&mut s).await;
            s.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            head
        });
        let request = OutboundRequest {
            peer_id: 1,
            url: UrlInfo::parse(&format!("http://127.0.0.1:{}/trigger?x=1", port)),
            ca_file: String::new(),
            verify_certificate: true,
        };
        assert_eq!(perform(&request).await.unwrap(), 204);
        assert!(upstream.await.unwrap().starts_with("GET /trigger?x=1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn spawned_outbound_runs_in_background() {
        let (listener, port) = local_listener().await;
        let request = OutboundRequest {
            peer_id: 1,
            url: UrlInfo::parse(&format!("http://127.0.0.1:{}/fire", port)),
            ca_file: String::new(),
            verify_certificate: false,
        };
        spawn_outbound(vec![request]);
        let (mut s, _): (TcpStream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let head = read_head(&mut s).await;
        assert!(head.starts_with("GET /fire HTTP/1.1"));
        s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn missing_ca_file_is_an_error() {
        let request = OutboundRequest {
            peer_id: 1,
            url: UrlInfo::parse("https://127.0.0.1:1/"),
            ca_file: "/nonexistent/ca.pem".into(),
            verify_certificate: true,
        };
        assert!(perform(&request).await.is_err());
    }
}
