use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::FrameReader;
use crate::config::{Config, ReusePolicy};
use crate::connection::Connection;
use crate::frame::{self, FrameScanner};
use crate::pool::{self, Pool, PooledConnection};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("failed to acquire a backend connection: {0}")]
    Acquire(#[source] pool::Error),
    #[error("invalid client input: {0}")]
    Protocol(#[source] frame::Error),
    #[error("client connection failed: {0}")]
    Client(#[source] io::Error),
    #[error("backend connection failed: {0}")]
    Backend(#[source] io::Error),
    #[error("failed to reset backend connection: {0}")]
    Reset(String),
}

/// Pairs one client connection with one leased backend connection for the client's lifetime.
///
/// Client input is forwarded frame by frame, so the backend only ever sees whole frames. Backend
/// output is copied to the client byte for byte as it arrives.
pub struct ProxySession<S = TcpStream> {
    pool: Pool,
    client: Connection<S>,
}

impl<S> ProxySession<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(pool: Pool, client: Connection<S>) -> ProxySession<S> {
        ProxySession { pool, client }
    }

    pub async fn run(self) -> Result<(), Error> {
        let ProxySession { pool, mut client } = self;

        let mut backend = match pool.acquire().await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("no backend connection for client: {}", e);
                if let Err(e) = client.shutdown().await {
                    debug!("error closing client connection: {}", e);
                }
                return Err(Error::Acquire(e));
            }
        };
        debug!(backend_id = backend.id(), "paired client with backend connection");

        let config = pool.config();
        let (upstream, downstream, in_sync) = forward(&mut client, &mut backend, config).await;
        if !in_sync {
            debug!("backend replies still outstanding, connection will not be reused");
        }

        if let Err(e) = client.shutdown().await {
            debug!("error closing client connection: {}", e);
        }

        let (reusable, result) = settle(upstream, downstream, in_sync);

        if reusable {
            match reset_backend(&mut backend, config).await {
                Ok(()) => {
                    if let Err(e) = pool.release(backend) {
                        debug!("backend connection not returned to the pool: {}", e);
                    }
                }
                Err(e) => {
                    warn!("{}", e);
                    if let Err(e) = pool.remove(backend).await {
                        debug!("backend connection already gone: {}", e);
                    }
                }
            }
        } else if let Err(e) = pool.remove(backend).await {
            debug!("backend connection already gone: {}", e);
        }

        info!(reused = reusable, "session closed");
        result
    }
}

/// How one copy direction ended.
#[derive(Debug)]
enum Ended {
    /// The client closed its side of the connection.
    ClientClosed,
    /// The other direction ended first.
    Cancelled,
    /// The pool closed and revoked the lease.
    PoolClosed,
    Client(Error),
    Backend(Error),
}

// State shared by the two copy directions of a session.
struct Link {
    cancel: CancellationToken,
    pool_closed: CancellationToken,
    // Frames forwarded to the backend, and complete reply frames relayed back.
    requests: AtomicU64,
    replies: AtomicU64,
    // Cleared once the reply stream can no longer be split into frames.
    tracking: AtomicBool,
    request_sent: Notify,
    read_deadline: Duration,
    write_deadline: Duration,
}

impl Link {
    fn new(config: &Config, pool_closed: CancellationToken) -> Link {
        Link {
            cancel: CancellationToken::new(),
            pool_closed,
            requests: AtomicU64::new(0),
            replies: AtomicU64::new(0),
            tracking: AtomicBool::new(true),
            request_sent: Notify::new(),
            read_deadline: config.read_deadline,
            write_deadline: config.write_deadline,
        }
    }

    fn awaiting_reply(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
            && self.requests.load(Ordering::SeqCst) > self.replies.load(Ordering::SeqCst)
    }

    /// Every forwarded request got exactly one complete reply.
    fn in_sync(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
            && self.requests.load(Ordering::SeqCst) == self.replies.load(Ordering::SeqCst)
    }

    /// Counts the reply frames completed by a chunk of backend output.
    fn track_replies(&self, scanner: &mut FrameScanner, mut data: &[u8]) {
        if !self.tracking.load(Ordering::SeqCst) {
            return;
        }

        while !data.is_empty() {
            match scanner.scan(data) {
                Ok(Some(n)) => {
                    self.replies.fetch_add(1, Ordering::SeqCst);
                    data = &data[n..];
                }
                Ok(None) => return,
                Err(e) => {
                    debug!("lost track of backend replies: {}", e);
                    self.tracking.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}

async fn forward<S>(
    client: &mut Connection<S>,
    backend: &mut PooledConnection,
    config: &Config,
) -> (Ended, Ended, bool)
where
    S: AsyncRead + AsyncWrite,
{
    let link = Link::new(config, backend.closed().clone());
    let mut replies = FrameScanner::new(config.max_frame_depth);

    let (mut backend_reader, mut backend_writer) = tokio::io::split(backend.stream());
    let Connection { reader, writer, .. } = client;

    let upstream = async {
        let ended = client_to_backend(reader, &mut backend_writer, &link).await;
        link.cancel.cancel();
        ended
    };
    let downstream = async {
        let ended = backend_to_client(&mut backend_reader, writer, &mut replies, &link).await;
        link.cancel.cancel();
        // A reply cut short leaves the connection mid-frame.
        if !replies.is_idle() {
            link.tracking.store(false, Ordering::SeqCst);
        }
        ended
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    (upstream, downstream, link.in_sync())
}

async fn client_to_backend<R, W>(reader: &mut FrameReader<R>, backend: &mut W, link: &Link) -> Ended
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = link.cancel.cancelled() => return Ended::Cancelled,
            _ = link.pool_closed.cancelled() => return Ended::PoolClosed,
            frame = reader.read_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            // A frame cut short was never forwarded, so the backend is still aligned.
            Ok(None) | Err(frame::Error::UnexpectedEof) => return Ended::ClientClosed,
            Err(frame::Error::Io(e)) => return Ended::Client(Error::Client(e)),
            Err(e) => return Ended::Client(Error::Protocol(e)),
        };

        trace!(len = frame.len(), "forwarding frame to backend");

        // Counted before writing so a fast reply is never seen before its request.
        link.requests.fetch_add(1, Ordering::SeqCst);
        let write = with_deadline(link.write_deadline, async {
            backend.write_all(&frame).await?;
            backend.flush().await
        });
        let written = tokio::select! {
            _ = link.pool_closed.cancelled() => return Ended::PoolClosed,
            written = write => written,
        };
        if let Err(e) = written {
            return Ended::Backend(Error::Backend(e));
        }
        link.request_sent.notify_one();
    }
}

async fn backend_to_client<R, W>(
    backend: &mut R,
    client: &mut W,
    replies: &mut FrameScanner,
    link: &Link,
) -> Ended
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        // Only bound the read while a reply is due; a quiet client may keep the backend quiet.
        let awaiting = link.awaiting_reply();
        let deadline = match awaiting {
            true => link.read_deadline,
            false => Duration::ZERO,
        };

        let read = tokio::select! {
            _ = link.cancel.cancelled() => return Ended::Cancelled,
            _ = link.pool_closed.cancelled() => return Ended::PoolClosed,
            _ = link.request_sent.notified(), if !awaiting => continue,
            read = with_deadline(deadline, backend.read(&mut buf)) => read,
        };

        let n = match read {
            Ok(0) => {
                return Ended::Backend(Error::Backend(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backend closed the connection",
                )))
            }
            Ok(n) => n,
            Err(e) => return Ended::Backend(Error::Backend(e)),
        };
        link.track_replies(replies, &buf[..n]);

        let write = async {
            client.write_all(&buf[..n]).await?;
            client.flush().await
        };
        let written = tokio::select! {
            _ = link.cancel.cancelled() => return Ended::Cancelled,
            _ = link.pool_closed.cancelled() => return Ended::PoolClosed,
            written = write => written,
        };
        if let Err(e) = written {
            return Ended::Client(Error::Client(e));
        }
    }
}

/// Decides the fate of the backend connection. It is reusable only if every request was answered
/// in full and neither the backend failed nor the pool revoked it. Backend failures take
/// precedence when reporting the session's error.
fn settle(upstream: Ended, downstream: Ended, in_sync: bool) -> (bool, Result<(), Error>) {
    let mut reusable = in_sync;
    let mut result = Ok(());

    for ended in [upstream, downstream] {
        match ended {
            Ended::Backend(e) => {
                reusable = false;
                result = Err(e);
            }
            Ended::PoolClosed => reusable = false,
            Ended::Client(e) => {
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Ended::ClientClosed | Ended::Cancelled => {}
        }
    }

    (reusable, result)
}

/// Applies the reuse policy to a connection about to be released.
async fn reset_backend(backend: &mut PooledConnection, config: &Config) -> Result<(), Error> {
    let commands = match &config.reuse_policy {
        ReusePolicy::Shared => return Ok(()),
        ReusePolicy::Reset(commands) => commands,
    };

    let stream = backend.stream();
    for command in commands {
        with_deadline(config.write_deadline, stream.write_all(command))
            .await
            .map_err(Error::Backend)?;
    }
    with_deadline(config.write_deadline, stream.flush())
        .await
        .map_err(Error::Backend)?;

    let mut replies = FrameReader::with_codec(&mut *stream, config.codec());
    for _ in commands {
        let reply = with_deadline(config.read_deadline, replies.read_frame())
            .await
            .map_err(|e| Error::Reset(e.to_string()))?;

        match reply {
            Some(reply) if frame::is_error(&reply) => {
                return Err(Error::Reset(format!(
                    "backend rejected reset command: {}",
                    String::from_utf8_lossy(&reply).trim_end()
                )))
            }
            Some(_) => {}
            None => return Err(Error::Reset("backend closed the connection".into())),
        }
    }

    if !replies.buffered().is_empty() {
        return Err(Error::Reset(
            "unexpected bytes left on the connection".into(),
        ));
    }

    Ok(())
}

/// Bounds `fut` by `deadline`; a zero deadline waits forever.
async fn with_deadline<T, E, F>(deadline: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    if deadline.is_zero() {
        return fut.await;
    }

    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded").into()),
    }
}
