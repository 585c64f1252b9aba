use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

use rustdis_proxy::config::{self, Config, ReusePolicy};
use rustdis_proxy::server::{self, ServerConfig, DEFAULT_PORT};
use rustdis_proxy::Error;

#[derive(Parser, Debug)]
#[command(about = "A transparent proxy in front of a Redis server")]
struct Args {
    /// The port to listen on
    #[arg(short, long, env = "PROXY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// The address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// The backend Redis server, as host:port
    #[arg(short, long, env = "PROXY_BACKEND", default_value = "127.0.0.1:6379")]
    backend: String,

    /// Seconds allowed to establish a backend connection
    #[arg(long, default_value_t = config::DEFAULT_DIAL_TIMEOUT.as_secs())]
    dial_timeout: u64,

    /// Seconds a backend may take to answer a forwarded request (0 disables)
    #[arg(long, default_value_t = config::DEFAULT_READ_DEADLINE.as_secs())]
    read_deadline: u64,

    /// Seconds a single backend write may take (0 disables)
    #[arg(long, default_value_t = config::DEFAULT_WRITE_DEADLINE.as_secs())]
    write_deadline: u64,

    /// Backend connections opened at startup
    #[arg(long, default_value_t = config::DEFAULT_INITIAL_POOL_SIZE)]
    initial_pool_size: usize,

    /// Maximum number of backend connections
    #[arg(long, default_value_t = config::DEFAULT_MAX_POOL_SIZE)]
    max_pool_size: usize,

    /// Seconds after which an unused backend connection is closed (0 disables)
    #[arg(long, default_value_t = config::DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout: u64,

    /// Seconds between idle connection sweeps
    #[arg(long, default_value_t = config::DEFAULT_IDLE_CHECK_INTERVAL.as_secs())]
    idle_check_interval: u64,

    /// Seconds a client waits for a backend connection when the pool is full [default: read
    /// deadline + 1]
    #[arg(long)]
    pool_timeout: Option<u64>,

    /// Command sent to a backend connection before it is reused, e.g. "SELECT 0" (repeatable)
    #[arg(long = "reset-command", value_name = "COMMAND")]
    reset_commands: Vec<String>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let mut pool = Config::new(args.backend);
        pool.dial_timeout = Duration::from_secs(args.dial_timeout);
        pool.read_deadline = Duration::from_secs(args.read_deadline);
        pool.write_deadline = Duration::from_secs(args.write_deadline);
        pool.initial_pool_size = args.initial_pool_size;
        pool.max_pool_size = args.max_pool_size;
        pool.idle_timeout = Duration::from_secs(args.idle_timeout);
        pool.idle_check_interval = Duration::from_secs(args.idle_check_interval);
        pool.pool_timeout = args.pool_timeout.map(Duration::from_secs);
        if !args.reset_commands.is_empty() {
            pool.reuse_policy = ReusePolicy::reset(&args.reset_commands);
        }

        ServerConfig {
            bind: args.bind,
            port: args.port,
            pool,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    server::run(args.into()).await
}
