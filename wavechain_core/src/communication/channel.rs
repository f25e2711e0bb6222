/// Envelope transport between chain nodes
///
/// A node server holds at most one inbound connection at a time. A second
/// connection is answered with a "try later" error and closed immediately.
/// Listeners that only collect signals can lift the limit.
/// The client side opens a short-lived connection per request: one envelope
/// out, exactly one response back.
use crate::communication::framing::{read_frame, write_frame};
use crate::config::PeerAddress;
use crate::error::{WaveError, WaveResult};
use crate::message::{Envelope, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Default bound on a full client round trip
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Message returned to a connection refused because the slot is taken
pub const BUSY_MESSAGE: &str = "busy, try later";

/// How long a rejected connection is read from before it is closed
const REJECT_DRAIN: Duration = Duration::from_millis(200);

/// Pause between attempts while a peer answers busy
const ADMISSION_RETRY: Duration = Duration::from_millis(10);

/// Dispatch target for parsed inbound envelopes
pub trait EnvelopeHandler: Send + Sync + 'static {
    fn handle(
        &self,
        envelope: Envelope,
        peer: SocketAddr,
    ) -> impl Future<Output = Response> + Send;
}

/// JSON envelope server, single-slot unless the limit is lifted
pub struct MessageChannel<H> {
    name: String,
    listener: TcpListener,
    handler: Arc<H>,
    slot: Option<Arc<Semaphore>>,
}

impl<H: EnvelopeHandler> MessageChannel<H> {
    /// Bind the listening socket; port 0 picks a free port
    pub async fn bind(name: impl Into<String>, addr: &str, handler: H) -> WaveResult<Self> {
        let name = name.into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WaveError::connectivity(addr, format!("bind failed: {}", e)))?;

        info!("[{}] listening on {}", name, listener.local_addr()?);

        Ok(Self {
            name,
            listener,
            handler: Arc::new(handler),
            slot: Some(Arc::new(Semaphore::new(1))),
        })
    }

    /// Serve every connection concurrently instead of turning extras away
    pub fn without_connection_limit(mut self) -> Self {
        self.slot = None;
        self
    }

    pub fn local_addr(&self) -> WaveResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped or aborted.
    ///
    /// Connection tasks live in a `JoinSet` owned by this future, so aborting
    /// the server also closes every open connection.
    pub async fn serve(self) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(&mut connections, stream, addr),
                    Err(e) => error!("[{}] failed to accept connection: {}", self.name, e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    fn admit(&self, connections: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        let name = self.name.clone();
        let permit = match &self.slot {
            None => None,
            Some(slot) => match slot.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    connections.spawn(reject_connection(name, stream, addr));
                    return;
                }
            },
        };
        let handler = self.handler.clone();
        connections.spawn(serve_connection(name, stream, addr, handler, permit));
    }

    /// Run the accept loop on its own task
    pub fn spawn(self) -> WaveResult<ServerHandle> {
        let local_addr = self.local_addr()?;
        let task = tokio::spawn(self.serve());
        Ok(ServerHandle { local_addr, task })
    }
}

/// Running server; the listener and its open connections close when the
/// handle is shut down or dropped
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reject_connection(name: String, mut stream: TcpStream, addr: SocketAddr) {
    warn!("[{}] rejecting {}: another connection is active", name, addr);
    let busy = Response::error(BUSY_MESSAGE).with_node(name.as_str());
    if let Ok(text) = busy.to_json() {
        if let Err(e) = write_frame(&mut stream, &text).await {
            debug!("[{}] could not notify {}: {}", name, addr, e);
        }
    }
    // Consume whatever the client already sent so the close is not a reset
    let _ = tokio::time::timeout(REJECT_DRAIN, async {
        while let Ok(Some(_)) = read_frame(&mut stream).await {}
    })
    .await;
}

async fn serve_connection<H: EnvelopeHandler>(
    name: String,
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<H>,
    _permit: Option<OwnedSemaphorePermit>,
) {
    info!("[{}] connection from {}", name, addr);
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let text = match read_frame(&mut reader).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                info!("[{}] {} disconnected", name, addr);
                break;
            }
            Err(WaveError::Protocol(message)) => {
                // Frame boundaries are lost after a bad header, so close after replying
                warn!("[{}] protocol error from {}: {}", name, addr, message);
                if let Ok(reply) = Response::error(message).to_json() {
                    let _ = write_frame(&mut writer, &reply).await;
                }
                break;
            }
            Err(e) => {
                warn!("[{}] read from {} failed: {}", name, addr, e);
                break;
            }
        };

        debug!("[{}] frame from {}: {} bytes", name, addr, text.len());

        let response = match Envelope::from_json(&text) {
            Ok(envelope) => handler.handle(envelope, addr).await,
            Err(e) => {
                warn!("[{}] {}", name, e);
                Response::from(&e)
            }
        };

        let reply = match response.to_json() {
            Ok(reply) => reply,
            Err(e) => {
                error!("[{}] could not encode response: {}", name, e);
                break;
            }
        };
        if let Err(e) = write_frame(&mut writer, &reply).await {
            warn!("[{}] write to {} failed: {}", name, addr, e);
            break;
        }
    }
}

/// Send one envelope on a fresh connection and wait for its single response
pub async fn send_to(
    peer: &PeerAddress,
    envelope: &Envelope,
    io_timeout: Duration,
) -> WaveResult<Response> {
    let text = envelope.to_json()?;
    match tokio::time::timeout(io_timeout, exchange(peer, &text)).await {
        Ok(result) => result,
        Err(_) => Err(WaveError::connectivity(
            peer,
            format!("no response within {:?}", io_timeout),
        )),
    }
}

/// Like [`send_to`], but a busy answer is retried until `io_timeout` runs out.
///
/// Only the busy reply is retried; connect failures and every other
/// response are returned as they are.
pub async fn send_admitted(
    peer: &PeerAddress,
    envelope: &Envelope,
    io_timeout: Duration,
) -> WaveResult<Response> {
    let started = tokio::time::Instant::now();
    loop {
        let remaining = io_timeout.saturating_sub(started.elapsed());
        let response = send_to(peer, envelope, remaining).await?;
        if response.message != BUSY_MESSAGE || response.is_success() {
            return Ok(response);
        }
        if io_timeout.saturating_sub(started.elapsed()) <= ADMISSION_RETRY {
            return Err(WaveError::connectivity(
                peer,
                format!("still busy after {:?}", io_timeout),
            ));
        }
        debug!("{} is busy, retrying", peer);
        tokio::time::sleep(ADMISSION_RETRY).await;
    }
}

async fn exchange(peer: &PeerAddress, text: &str) -> WaveResult<Response> {
    let mut stream = TcpStream::connect(peer.socket_addr())
        .await
        .map_err(|e| WaveError::connectivity(peer, format!("connect failed: {}", e)))?;

    write_frame(&mut stream, text)
        .await
        .map_err(|e| WaveError::connectivity(peer, format!("send failed: {}", e)))?;
    // Half-close so the server frees its slot as soon as it has replied
    if let Err(e) = stream.shutdown().await {
        debug!("Half-close towards {} failed: {}", peer, e);
    }

    let reply = read_frame(&mut stream)
        .await
        .map_err(|e| WaveError::connectivity(peer, format!("receive failed: {}", e)))?
        .ok_or_else(|| WaveError::connectivity(peer, "connection closed before response"))?;

    debug!("Response from {}: {}", peer, reply);
    Response::from_json(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    struct Echo;

    impl EnvelopeHandler for Echo {
        async fn handle(&self, envelope: Envelope, _peer: SocketAddr) -> Response {
            Response::success(envelope.kind())
        }
    }

    fn peer_of(handle: &ServerHandle) -> PeerAddress {
        PeerAddress::new("test", "127.0.0.1", handle.local_addr().port())
    }

    #[tokio::test]
    async fn test_request_response() {
        let server = MessageChannel::bind("echo", "127.0.0.1:0", Echo)
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let response = send_to(&peer_of(&server), &Envelope::ack(), DEFAULT_IO_TIMEOUT)
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.message, "ack");
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_connection_open() {
        let server = MessageChannel::bind("echo", "127.0.0.1:0", Echo)
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut stream, "{oops").await.unwrap();
        let reply = Response::from_json(&read_frame(&mut stream).await.unwrap().unwrap()).unwrap();
        assert!(!reply.is_success());
        assert!(reply.message.contains("Invalid JSON format"));

        write_frame(&mut stream, r#"{"type":"shout"}"#).await.unwrap();
        let reply = Response::from_json(&read_frame(&mut stream).await.unwrap().unwrap()).unwrap();
        assert!(reply.message.contains("Unknown message type: shout"));

        // Same connection still serves valid envelopes
        let ack = Envelope::new(Payload::Ack).to_json().unwrap();
        write_frame(&mut stream, &ack).await.unwrap();
        let reply = Response::from_json(&read_frame(&mut stream).await.unwrap().unwrap()).unwrap();
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_send_to_without_listener_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = PeerAddress::new("ghost", "127.0.0.1", port);
        let err = send_to(&peer, &Envelope::ack(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, WaveError::Connectivity { .. }));
    }

    #[tokio::test]
    async fn test_send_to_times_out_on_silent_peer() {
        // Accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _guard = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let peer = PeerAddress::new("mute", "127.0.0.1", port);
        let err = send_to(&peer, &Envelope::ack(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no response"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let server = MessageChannel::bind("echo", "127.0.0.1:0", Echo)
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let ack = Envelope::ack().to_json().unwrap();
        write_frame(&mut stream, &ack).await.unwrap();
        assert!(read_frame(&mut stream).await.unwrap().is_some());

        server.shutdown();
        let closed = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut stream))
            .await
            .expect("connection still open after shutdown");
        assert!(!matches!(closed, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_unlimited_listener_serves_concurrent_connections() {
        let server = MessageChannel::bind("signals", "127.0.0.1:0", Echo)
            .await
            .unwrap()
            .without_connection_limit()
            .spawn()
            .unwrap();

        let _held = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = send_to(&peer_of(&server), &Envelope::ack(), DEFAULT_IO_TIMEOUT)
            .await
            .unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_send_admitted_waits_for_the_slot() {
        let server = MessageChannel::bind("echo", "127.0.0.1:0", Echo)
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let held = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(held);
        });

        let response = send_admitted(&peer_of(&server), &Envelope::ack(), DEFAULT_IO_TIMEOUT)
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.message, "ack");
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_admitted_gives_up_at_deadline() {
        let server = MessageChannel::bind("echo", "127.0.0.1:0", Echo)
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let _held = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = send_admitted(&peer_of(&server), &Envelope::ack(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, WaveError::Connectivity { .. }));
    }
}
