use bytes::Bytes;
use std::time::Duration;

use crate::codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::dial::TlsSettings;
use crate::frame::{self, DEFAULT_MAX_DEPTH};
use crate::pool::Error;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INITIAL_POOL_SIZE: usize = 1;
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(3 * 60);

/// What happens to a backend connection's server side state before it is handed to another
/// client.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReusePolicy {
    /// Release connections as they are. Every client is assumed to leave the backend in the same
    /// state (database, authentication, no open transaction).
    #[default]
    Shared,
    /// Send each of these command frames and require a non-error reply to every one of them
    /// before the connection goes back to the idle set.
    Reset(Vec<Bytes>),
}

impl ReusePolicy {
    /// Builds a [`ReusePolicy::Reset`] from whitespace separated commands, e.g. `"SELECT 0"`.
    pub fn reset<I, S>(commands: I) -> ReusePolicy
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let frames = commands
            .into_iter()
            .map(|command| {
                let args: Vec<&str> = command.as_ref().split_whitespace().collect();
                frame::encode_command(&args[..])
            })
            .collect();

        ReusePolicy::Reset(frames)
    }
}

/// Backend and pool settings. Zero durations disable the corresponding deadline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend `host:port`.
    pub address: String,
    pub dial_timeout: Duration,
    /// Connections dialed eagerly by [`crate::pool::Pool::warm_up`].
    pub initial_pool_size: usize,
    /// Hard cap on open backend connections, idle and leased together.
    pub max_pool_size: usize,
    /// Idle connections unused for longer than this are closed by the reaper.
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    /// Bound on a single backend read while a reply is outstanding.
    pub read_deadline: Duration,
    /// Bound on a single backend write.
    pub write_deadline: Duration,
    /// How long `acquire` waits for a free connection. Defaults to `read_deadline + 1s`.
    pub pool_timeout: Option<Duration>,
    pub tls: Option<TlsSettings>,
    pub reuse_policy: ReusePolicy,
    pub max_frame_size: usize,
    pub max_frame_depth: usize,
}

impl Config {
    pub fn new(address: impl Into<String>) -> Config {
        Config {
            address: address.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            initial_pool_size: DEFAULT_INITIAL_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            read_deadline: DEFAULT_READ_DEADLINE,
            write_deadline: DEFAULT_WRITE_DEADLINE,
            pool_timeout: None,
            tls: None,
            reuse_policy: ReusePolicy::Shared,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_frame_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.pool_timeout
            .unwrap_or(self.read_deadline + Duration::from_secs(1))
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_size, self.max_frame_depth)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.address.is_empty() {
            return Err(Error::InvalidConfig("backend address is required".into()));
        }
        if self.max_pool_size == 0 {
            return Err(Error::InvalidConfig(
                "max pool size must be at least 1".into(),
            ));
        }
        if self.initial_pool_size > self.max_pool_size {
            return Err(Error::InvalidConfig(format!(
                "initial pool size {} exceeds max pool size {}",
                self.initial_pool_size, self.max_pool_size
            )));
        }
        if self.idle_check_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "idle check interval must be greater than zero".into(),
            ));
        }
        if self.max_frame_size == 0 || self.max_frame_depth == 0 {
            return Err(Error::InvalidConfig(
                "frame size and depth limits must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("127.0.0.1:6379");

        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.initial_pool_size, 1);
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.idle_check_interval, Duration::from_secs(3));
        assert_eq!(config.read_deadline, Duration::from_secs(10));
        assert_eq!(config.write_deadline, Duration::from_secs(180));
        assert_eq!(config.wait_timeout(), Duration::from_secs(11));
        assert_eq!(config.reuse_policy, ReusePolicy::Shared);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_pool_timeout_wins() {
        let mut config = Config::new("127.0.0.1:6379");
        config.pool_timeout = Some(Duration::ZERO);

        assert_eq!(config.wait_timeout(), Duration::ZERO);
    }

    #[test]
    fn invalid_configs() {
        let mut config = Config::new("");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.address = "127.0.0.1:6379".into();
        config.max_pool_size = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.max_pool_size = 2;
        config.initial_pool_size = 3;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.initial_pool_size = 2;
        config.idle_check_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn reset_policy_encodes_commands() {
        let policy = ReusePolicy::reset(["SELECT 0", "UNWATCH"]);

        assert_eq!(
            policy,
            ReusePolicy::Reset(vec![
                Bytes::from_static(b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n"),
                Bytes::from_static(b"*1\r\n$7\r\nUNWATCH\r\n"),
            ])
        );
    }
}
