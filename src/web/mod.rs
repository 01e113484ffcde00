//! Per-camera MJPEG-over-HTTP server
//!
//! Every request path answers with an endless `multipart/x-mixed-replace`
//! body, so a browser can simply point an `<img>` at `http://host:port/`.

pub mod auth;

pub use auth::Credentials;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::streaming::{FrameChannel, FrameSubscription};

/// Multipart boundary between frames
pub const BOUNDARY: &str = "frame";

/// `Content-Type` of every stream response
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
struct StreamState {
    camera: Arc<str>,
    channel: FrameChannel,
    token: CancellationToken,
}

/// A bound, not yet serving, stream listener for one camera
pub struct MjpegServer {
    camera: String,
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    token: CancellationToken,
}

impl MjpegServer {
    /// Binds `bind_ip:port` and prepares the router.
    ///
    /// Responses stream from `channel` until `token` is cancelled, which also
    /// shuts the listener down once `serve` is running.
    pub async fn bind(
        camera: &str,
        bind_ip: &str,
        port: u16,
        channel: FrameChannel,
        token: CancellationToken,
        credentials: Option<Credentials>,
    ) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", bind_ip, port);
        let bind_err = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind((bind_ip, port)).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let state = StreamState {
            camera: Arc::from(camera),
            channel,
            token: token.clone(),
        };

        let mut router = Router::new().fallback(stream_handler).with_state(state);
        if let Some(credentials) = credentials {
            router = router.layer(middleware::from_fn_with_state(
                Arc::new(credentials),
                auth::require_basic,
            ));
        }
        let router = router.layer(TraceLayer::new_for_http());

        Ok(Self {
            camera: camera.to_string(),
            listener,
            local_addr,
            router,
            token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until the token is cancelled.
    ///
    /// Once cancelled the listener closes and every open connection is asked
    /// to finish. Connections still open after `shutdown_grace` (a viewer
    /// that stopped reading, say) are aborted, so this always returns within
    /// the grace period.
    pub async fn serve(self, shutdown_grace: Duration) {
        let MjpegServer {
            camera,
            listener,
            local_addr,
            router,
            token,
        } = self;
        info!(camera = %camera, addr = %local_addr, "MJPEG server listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(stream, peer, router.clone(), token.clone()));
                    }
                    Err(e) => {
                        debug!(camera = %camera, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        if !connections.is_empty() {
            debug!(camera = %camera, open = connections.len(), "Waiting for open connections");
            let drained = timeout(shutdown_grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    camera = %camera,
                    open = connections.len(),
                    grace_ms = shutdown_grace.as_millis() as u64,
                    "Connections still open after grace, aborting"
                );
                connections.abort_all();
                while connections.join_next().await.is_some() {}
            }
        }

        info!(camera = %camera, "MJPEG server stopped");
    }
}

/// Serves one HTTP/1.1 connection, finishing it gracefully on cancel
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    token: CancellationToken,
) {
    let service = TowerToHyperService::new(router);
    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let mut shutting_down = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
                break;
            }
            _ = token.cancelled(), if !shutting_down => {
                shutting_down = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn stream_handler(State(state): State<StreamState>) -> Response {
    let viewer = Viewer::new(&state);
    let body = Body::from_stream(part_stream(viewer));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        body,
    )
        .into_response()
}

/// One connected client; dropped when the response body is dropped
struct Viewer {
    camera: Arc<str>,
    subscription: FrameSubscription,
    token: CancellationToken,
}

impl Viewer {
    fn new(state: &StreamState) -> Self {
        debug!(camera = %state.camera, "Viewer connected");
        Self {
            camera: Arc::clone(&state.camera),
            subscription: state.channel.subscribe(),
            token: state.token.clone(),
        }
    }

    async fn next_frame(&mut self) -> Option<Bytes> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            frame = self.subscription.recv() => frame,
        }
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        debug!(camera = %self.camera, "Viewer disconnected");
    }
}

fn part_stream(viewer: Viewer) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(viewer, |mut viewer| async move {
        match viewer.next_frame().await {
            Some(frame) => Some((Ok(encode_part(&frame)), viewer)),
            None => None,
        }
    })
}

/// Wraps one JPEG in its multipart headers
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );

    let mut part = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{FanOut, OverflowPolicy};
    use assert_matches::assert_matches;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpSocket;
    use tokio::time::{sleep, timeout, Instant};

    const JPEG: &[u8] = b"\xFF\xD8jpeg-body\xFF\xD9";

    type ServeHandle = tokio::task::JoinHandle<()>;

    const GRACE: Duration = Duration::from_millis(300);

    async fn start(
        credentials: Option<Credentials>,
    ) -> (FrameChannel, CancellationToken, SocketAddr, ServeHandle) {
        let channel = FrameChannel::new(8, OverflowPolicy::DropNewest, FanOut::Shared);
        let token = CancellationToken::new();
        let server = MjpegServer::bind("cam0", "127.0.0.1", 0, channel.clone(), token.clone(), credentials)
            .await
            .unwrap();
        let addr = server.local_addr();
        let handle = tokio::spawn(server.serve(GRACE));
        (channel, token, addr, handle)
    }

    async fn read_until_frame(response: &mut reqwest::Response) -> Vec<u8> {
        let mut received = Vec::new();
        while !received.windows(4).any(|w| w == b"\xFF\xD9\r\n") {
            match response.chunk().await.unwrap() {
                Some(chunk) => received.extend_from_slice(&chunk),
                None => break,
            }
        }
        received
    }

    #[test]
    fn test_encode_part_layout() {
        let part = encode_part(JPEG);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 13\r\n\r\n".to_vec();
        expected.extend_from_slice(JPEG);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_streams_multipart_on_any_path() {
        let (channel, token, addr, handle) = start(None).await;
        channel.publish(Bytes::from_static(JPEG));

        let mut response = reqwest::get(format!("http://{}/any/path", addr)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            STREAM_CONTENT_TYPE
        );
        assert_eq!(
            response.headers()[reqwest::header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );

        let received = timeout(Duration::from_secs(2), read_until_frame(&mut response))
            .await
            .unwrap();
        assert_eq!(received, encode_part(JPEG).to_vec());

        token.cancel();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_ends_open_streams_and_refuses_connections() {
        let (_channel, token, addr, handle) = start(None).await;

        let mut response = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        token.cancel();

        let end = timeout(Duration::from_secs(2), response.chunk()).await.unwrap();
        assert_matches!(end, Ok(None));
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert!(reqwest::get(format!("http://{}/", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_ends_stream() {
        let (channel, token, addr, _handle) = start(None).await;
        channel.publish(Bytes::from_static(JPEG));
        channel.close();

        let response = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        let body = timeout(Duration::from_secs(2), response.bytes()).await.unwrap().unwrap();
        assert_eq!(body, encode_part(JPEG));
        token.cancel();
    }

    #[tokio::test]
    async fn test_basic_auth_required_when_configured() {
        let credentials = Credentials::new("admin", "secret");
        let (channel, token, addr, _handle) = start(Some(credentials.clone())).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/", addr);

        let denied = client.get(&url).send().await.unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(
            denied.headers()[reqwest::header::WWW_AUTHENTICATE],
            "Basic realm=\"Restricted\""
        );

        let wrong = client.get(&url).basic_auth("admin", Some("nope")).send().await.unwrap();
        assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

        channel.publish(Bytes::from_static(JPEG));
        let mut allowed = client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, credentials.header_value())
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), reqwest::StatusCode::OK);
        let received = timeout(Duration::from_secs(2), read_until_frame(&mut allowed))
            .await
            .unwrap();
        assert!(received.starts_with(b"--frame\r\n"));

        token.cancel();
    }

    #[tokio::test]
    async fn test_stalled_viewer_is_dropped_after_grace() {
        let (channel, token, addr, handle) = start(None).await;

        // A client with a tiny receive window that never reads
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let mut client = socket.connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: camera\r\n\r\n").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while channel.stats().subscribers == 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(channel.stats().subscribers, 1);

        // Enough data to fill both socket buffers
        let big = Bytes::from(vec![0xAB; 1 << 20]);
        for _ in 0..32 {
            channel.publish(big.clone());
            sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        token.cancel();
        timeout(GRACE + Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(started.elapsed() < GRACE + Duration::from_secs(1));
        assert_eq!(channel.stats().subscribers, 0);
        drop(client);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let (_channel, token, addr, _handle) = start(None).await;

        let channel = FrameChannel::new(1, OverflowPolicy::DropNewest, FanOut::Shared);
        let result = MjpegServer::bind("cam1", "127.0.0.1", addr.port(), channel, CancellationToken::new(), None).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
        token.cancel();
    }
}
