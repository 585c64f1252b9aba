use futures::future::BoxFuture;
use futures::FutureExt;
use rustls::pki_types::ServerName;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::Config;

/// Anything the pool can hold as a backend connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A backend connection, plain TCP or wrapped in TLS.
pub type BackendStream = Box<dyn AsyncStream>;

pub type DialFuture = BoxFuture<'static, io::Result<BackendStream>>;

/// Client side TLS parameters applied by [`Dialer::tcp`] after the TCP handshake.
#[derive(Clone)]
pub struct TlsSettings {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsSettings {
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: &str) -> io::Result<TlsSettings> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        Ok(TlsSettings {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Produces new backend connections for the pool.
#[derive(Clone)]
pub struct Dialer {
    dial: Arc<dyn Fn() -> DialFuture + Send + Sync>,
}

impl Dialer {
    pub fn new<F, Fut>(dial: F) -> Dialer
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BackendStream>> + Send + 'static,
    {
        Dialer {
            dial: Arc::new(move || dial().boxed()),
        }
    }

    /// Dials `address` over TCP, performing the TLS handshake when `tls` is set. The whole dial,
    /// handshake included, must finish within `dial_timeout` (zero disables the limit).
    pub fn tcp(address: impl Into<String>, dial_timeout: Duration, tls: Option<TlsSettings>) -> Dialer {
        let address = address.into();

        Dialer::new(move || {
            let connect = connect(address.clone(), tls.clone());
            async move {
                if dial_timeout.is_zero() {
                    return connect.await;
                }
                timeout(dial_timeout, connect).await.map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "timed out dialing backend")
                })?
            }
        })
    }

    pub fn from_config(config: &Config) -> Dialer {
        Dialer::tcp(
            config.address.clone(),
            config.dial_timeout,
            config.tls.clone(),
        )
    }

    pub fn dial(&self) -> DialFuture {
        (self.dial)()
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer").finish_non_exhaustive()
    }
}

async fn connect(address: String, tls: Option<TlsSettings>) -> io::Result<BackendStream> {
    let stream = TcpStream::connect(&address).await?;
    stream.set_nodelay(true)?;

    match tls {
        Some(tls) => {
            let stream = tls.connector.connect(tls.server_name, stream).await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let dialer = Dialer::tcp(address.to_string(), Duration::from_secs(1), None);
        let mut stream = dialer.dial().await.unwrap();

        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn tcp_dialer_reports_refused_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::tcp(address.to_string(), Duration::from_secs(1), None);

        assert!(dialer.dial().await.is_err());
    }

    #[test]
    fn tls_settings_reject_invalid_server_names() {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
        let config = Arc::new(config);

        let err = TlsSettings::new(config.clone(), "not a hostname").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let tls = TlsSettings::new(config, "redis.internal").unwrap();
        assert_eq!(tls.server_name().to_str(), "redis.internal");
    }
}
