use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time;

use rustdis_proxy::config::{Config, ReusePolicy};
use rustdis_proxy::connection::Connection;
use rustdis_proxy::dial::{BackendStream, Dialer};
use rustdis_proxy::pool::{self, Pool, PoolStats};
use rustdis_proxy::session::{Error, ProxySession};

const SET: &[u8] = b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$8\r\nmy value\r\n";
const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

struct Harness {
    pool: Pool,
    backends: UnboundedReceiver<DuplexStream>,
}

impl Harness {
    /// A pool over in-memory backends, warmed up with a single connection.
    async fn new(mut config: Config) -> Harness {
        let (tx, backends) = mpsc::unbounded_channel();
        let dialer = Dialer::new(move || {
            let (near, far) = tokio::io::duplex(64 * 1024);
            let _ = tx.send(far);
            async move { Ok(Box::new(near) as BackendStream) }
        });

        config.initial_pool_size = 1;
        let pool = Pool::connect(config, dialer).await.unwrap();

        Harness { pool, backends }
    }

    /// Starts a session for a new client. Returns the client's end of the connection.
    fn start_session(&self) -> (DuplexStream, JoinHandle<Result<(), Error>>) {
        let (client, proxy_side) = tokio::io::duplex(64 * 1024);
        let address = "127.0.0.1:50000".parse().unwrap();
        let conn = Connection::new(proxy_side, address);

        let session = tokio::spawn(ProxySession::new(self.pool.clone(), conn).run());

        (client, session)
    }
}

fn config() -> Config {
    let mut config = Config::new("backend:6379");
    config.max_pool_size = 1;
    config.read_deadline = Duration::from_secs(2);
    config.pool_timeout = Some(Duration::ZERO);
    config
}

async fn read_exactly(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

async fn assert_closed(stream: &mut DuplexStream) {
    let mut buf = [0u8; 1];
    let n = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_forwards_frames_verbatim_and_relays_replies() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    client.write_all(SET).await.unwrap();
    assert_eq!(read_exactly(&mut backend, SET.len()).await, SET);

    backend.write_all(b"+OK\r\n").await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

    drop(client);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pipelined_frames_keep_their_order() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    let pipeline = [PING, SET, PING].concat();
    client.write_all(&pipeline).await.unwrap();
    assert_eq!(read_exactly(&mut backend, pipeline.len()).await, pipeline);

    // The reply stream is relayed as is, however the backend chunks it.
    backend.write_all(b"+PONG\r\n+O").await.unwrap();
    backend.write_all(b"K\r\n+PONG\r\n").await.unwrap();
    assert_eq!(
        read_exactly(&mut client, 19).await,
        b"+PONG\r\n+OK\r\n+PONG\r\n"
    );

    drop(client);
    session.await.unwrap().unwrap();
    assert_eq!(harness.pool.stats().idle, 1);
}

#[tokio::test]
async fn test_client_disconnect_releases_backend_for_reuse() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();

    let (mut client, session) = harness.start_session();
    client.write_all(PING).await.unwrap();
    read_exactly(&mut backend, PING.len()).await;
    backend.write_all(b"+PONG\r\n").await.unwrap();
    read_exactly(&mut client, 7).await;

    drop(client);
    session.await.unwrap().unwrap();

    assert_eq!(
        harness.pool.stats(),
        PoolStats {
            idle: 1,
            leased: 0,
            total: 1
        }
    );

    // The next client is served by the same backend connection.
    let (mut client, session) = harness.start_session();
    client.write_all(SET).await.unwrap();
    assert_eq!(read_exactly(&mut backend, SET.len()).await, SET);
    assert!(harness.backends.try_recv().is_err());

    drop(client);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unanswered_request_is_never_replayed_to_next_client() {
    let mut harness = Harness::new(config()).await;
    let mut first_backend = harness.backends.recv().await.unwrap();

    // The first client leaves before its reply arrives.
    let (mut client, session) = harness.start_session();
    client.write_all(PING).await.unwrap();
    read_exactly(&mut first_backend, PING.len()).await;
    drop(client);
    session.await.unwrap().unwrap();

    assert_eq!(harness.pool.total(), 0);
    let _ = first_backend.write_all(b"+PONG\r\n").await;
    assert_closed(&mut first_backend).await;

    // The next client gets a fresh backend connection and only its own reply.
    let (mut client, session) = harness.start_session();
    let get = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
    client.write_all(get).await.unwrap();

    let mut second_backend = harness.backends.recv().await.unwrap();
    assert_eq!(read_exactly(&mut second_backend, get.len()).await, get);
    second_backend.write_all(b"$-1\r\n").await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"$-1\r\n");

    drop(client);
    session.await.unwrap().unwrap();
    assert_eq!(harness.pool.stats().idle, 1);
}

#[tokio::test]
async fn test_partially_relayed_reply_removes_backend() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    client.write_all(PING).await.unwrap();
    read_exactly(&mut backend, PING.len()).await;
    backend.write_all(b"$10\r\nhello").await.unwrap();
    assert_eq!(read_exactly(&mut client, 10).await, b"$10\r\nhello");

    drop(client);
    session.await.unwrap().unwrap();
    assert_eq!(harness.pool.total(), 0);
}

#[tokio::test]
async fn test_reply_split_across_writes_is_tracked() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    client.write_all(PING).await.unwrap();
    read_exactly(&mut backend, PING.len()).await;
    backend.write_all(b"*2\r\n$3\r\nfo").await.unwrap();
    assert_eq!(read_exactly(&mut client, 10).await, b"*2\r\n$3\r\nfo");
    backend.write_all(b"o\r\n:7\r\n").await.unwrap();
    assert_eq!(read_exactly(&mut client, 7).await, b"o\r\n:7\r\n");

    drop(client);
    session.await.unwrap().unwrap();
    assert_eq!(harness.pool.stats().idle, 1);
}

#[tokio::test]
async fn test_backend_disconnect_removes_backend() {
    let mut harness = Harness::new(config()).await;
    let backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    drop(backend);

    assert_closed(&mut client).await;
    let err = session.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert_eq!(harness.pool.total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    client.write_all(PING).await.unwrap();
    read_exactly(&mut backend, PING.len()).await;

    let err = session.await.unwrap().unwrap_err();
    match err {
        Error::Backend(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
        e => panic!("unexpected error: {}", e),
    }
    assert_eq!(harness.pool.total(), 0);
    assert_closed(&mut client).await;
}

#[tokio::test(start_paused = true)]
async fn test_quiet_client_is_not_timed_out() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    time::sleep(Duration::from_secs(60)).await;

    client.write_all(PING).await.unwrap();
    read_exactly(&mut backend, PING.len()).await;
    backend.write_all(b"+PONG\r\n").await.unwrap();
    assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");

    drop(client);
    session.await.unwrap().unwrap();
    assert_eq!(harness.pool.stats().idle, 1);
}

#[tokio::test]
async fn test_invalid_client_input_ends_session() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    client.write_all(b"GET key\r\n").await.unwrap();

    assert_closed(&mut client).await;
    let err = session.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    // Nothing reached the backend, so it stays in the pool.
    assert_eq!(harness.pool.stats().idle, 1);
    let mut buf = [0u8; 16];
    assert!(
        time::timeout(Duration::from_millis(50), backend.read(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_client_is_closed_when_no_backend_is_available() {
    let harness = Harness::new(config()).await;
    let _held = harness.pool.try_acquire().await.unwrap();

    let (mut client, session) = harness.start_session();

    assert_closed(&mut client).await;
    let err = session.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Acquire(pool::Error::PoolExhausted)));
}

#[tokio::test]
async fn test_pool_close_interrupts_session() {
    let mut harness = Harness::new(config()).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (mut client, session) = harness.start_session();

    client.write_all(PING).await.unwrap();
    read_exactly(&mut backend, PING.len()).await;

    harness.pool.close().await.unwrap();

    assert_closed(&mut client).await;
    session.await.unwrap().unwrap();
    assert_closed(&mut backend).await;
    assert_eq!(harness.pool.total(), 0);
}

#[tokio::test]
async fn test_reset_commands_run_before_release() {
    let mut config = config();
    config.reuse_policy = ReusePolicy::reset(["SELECT 0"]);
    let mut harness = Harness::new(config).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (client, session) = harness.start_session();

    drop(client);

    let select = b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n";
    assert_eq!(read_exactly(&mut backend, select.len()).await, select);
    backend.write_all(b"+OK\r\n").await.unwrap();

    session.await.unwrap().unwrap();
    assert_eq!(harness.pool.stats().idle, 1);
}

#[tokio::test]
async fn test_rejected_reset_removes_backend() {
    let mut config = config();
    config.reuse_policy = ReusePolicy::reset(["SELECT 0"]);
    let mut harness = Harness::new(config).await;
    let mut backend = harness.backends.recv().await.unwrap();
    let (client, session) = harness.start_session();

    drop(client);

    read_exactly(&mut backend, 23).await;
    backend
        .write_all(b"-ERR DB index is out of range\r\n")
        .await
        .unwrap();

    session.await.unwrap().unwrap();
    assert_eq!(harness.pool.total(), 0);
    assert_closed(&mut backend).await;
}
