use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::connection::Connection;
use crate::dial::Dialer;
use crate::pool::Pool;
use crate::session::ProxySession;
use crate::Error;

pub const DEFAULT_PORT: u16 = 6380;

/// Where the proxy listens and how it reaches the backend.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub pool: Config,
}

impl ServerConfig {
    pub fn new(pool: Config) -> ServerConfig {
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            pool,
        }
    }
}

pub async fn run(config: ServerConfig) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let listener = TcpListener::bind((config.bind, config.port)).await?;

    let dialer = Dialer::from_config(&config.pool);
    let pool = Pool::connect(config.pool, dialer).await?;

    info!(
        "Proxy listening on {}, forwarding to {}",
        listener.local_addr()?,
        pool.config().address
    );

    serve(listener, pool).await
}

/// Accepts clients forever, running one proxy session per connection.
pub async fn serve(listener: TcpListener, pool: Pool) -> Result<(), Error> {
    loop {
        let (socket, client_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let pool = pool.clone();
        info!("Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client_address, pool).await {
                error!("Session ended with error: {}", e);
            }
        });
    }
}

#[instrument(
    name = "session",
    skip(stream, pool),
    fields(session_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    pool: Pool,
) -> Result<(), Error> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let conn = Connection::with_codec(stream, client_address, pool.config().codec());

    tracing::Span::current()
        .record("session_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    ProxySession::new(pool, conn).run().await?;

    Ok(())
}
