use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use grpc_pool::PoolConfig;
use std::net::SocketAddr;

/// Runtime configuration for the `grpc-pool-probe` binary.
///
/// Pool settings map one-to-one onto [`PoolConfig`]; the remaining flags
/// shape the load the probe generates. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is honored).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "grpc-pool-probe",
    version,
    about = "Exercises a gRPC connection pool against a health endpoint"
)]
pub struct CliArgs {
    /// Address of the gRPC server, with or without an `http://` scheme.
    ///
    /// Environment variable: `POOL_TARGET`
    #[arg(long, env = "POOL_TARGET", default_value_t = String::from("127.0.0.1:50051"))]
    pub target: String,

    /// Hard cap on open connections.
    ///
    /// Environment variable: `POOL_MAX_CONNS`
    #[arg(long, env = "POOL_MAX_CONNS", default_value_t = 30)]
    pub max_conns: i32,

    /// Number of idle connections the reaper keeps open.
    ///
    /// Environment variable: `POOL_MAX_IDLE_CONNS`
    #[arg(long, env = "POOL_MAX_IDLE_CONNS", default_value_t = 10)]
    pub max_idle_conns: i32,

    /// Concurrent callers multiplexed over one connection.
    ///
    /// Environment variable: `POOL_MAX_REFS`
    #[arg(long, env = "POOL_MAX_REFS", default_value_t = 10)]
    pub max_refs: i32,

    /// Growth aggressiveness. A new connection is dialed once references
    /// reach `max_refs * open / new_conn_rate`.
    ///
    /// Environment variable: `POOL_NEW_CONN_RATE`
    #[arg(long, env = "POOL_NEW_CONN_RATE", default_value_t = 2)]
    pub new_conn_rate: i32,

    /// Reaper period in milliseconds.
    ///
    /// Environment variable: `POOL_CHECK_PERIOD_MS`
    #[arg(long, env = "POOL_CHECK_PERIOD_MS", default_value_t = 10_000)]
    pub check_period_ms: u64,

    /// How long a surplus connection must stay idle before it is closed, in
    /// milliseconds.
    ///
    /// Environment variable: `POOL_CLOSE_WAIT_MS`
    #[arg(long, env = "POOL_CLOSE_WAIT_MS", default_value_t = 20_000)]
    pub close_wait_ms: u64,

    /// Dial deadline in milliseconds.
    ///
    /// Environment variable: `POOL_DIAL_TIMEOUT_MS`
    #[arg(long, env = "POOL_DIAL_TIMEOUT_MS", default_value_t = 5_000)]
    pub dial_timeout_ms: u64,

    /// Wait for the transport handshake when dialing instead of connecting
    /// lazily on first use.
    ///
    /// Environment variable: `POOL_DIAL_BLOCK`
    #[arg(long, env = "POOL_DIAL_BLOCK", default_value_t = false)]
    pub dial_block: bool,

    /// Log the pool state every second.
    ///
    /// Environment variable: `POOL_DEBUG`
    #[arg(long, env = "POOL_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Upper bound on waiting for outstanding references at exit, in
    /// milliseconds.
    ///
    /// Environment variable: `POOL_SHUTDOWN_TIMEOUT_MS`
    #[arg(long, env = "POOL_SHUTDOWN_TIMEOUT_MS", default_value_t = 30_000)]
    pub shutdown_timeout_ms: u64,

    /// Health checks issued concurrently in each round.
    ///
    /// Environment variable: `PROBE_CONCURRENCY`
    #[arg(long, env = "PROBE_CONCURRENCY", default_value_t = 16)]
    pub concurrency: usize,

    /// Number of rounds to run. `0` runs until interrupted.
    ///
    /// Environment variable: `PROBE_ROUNDS`
    #[arg(long, env = "PROBE_ROUNDS", default_value_t = 10)]
    pub rounds: u64,

    /// Pause between rounds in milliseconds.
    ///
    /// Environment variable: `PROBE_ROUND_INTERVAL_MS`
    #[arg(long, env = "PROBE_ROUND_INTERVAL_MS", default_value_t = 1_000)]
    pub round_interval_ms: u64,

    /// How long a caller waits for a ready connection, in milliseconds.
    ///
    /// Environment variable: `PROBE_ACQUIRE_TIMEOUT_MS`
    #[arg(long, env = "PROBE_ACQUIRE_TIMEOUT_MS", default_value_t = 100)]
    pub acquire_timeout_ms: u64,

    /// Deadline for each health check, in milliseconds.
    ///
    /// Environment variable: `PROBE_CALL_TIMEOUT_MS`
    #[arg(long, env = "PROBE_CALL_TIMEOUT_MS", default_value_t = 1_000)]
    pub call_timeout_ms: u64,

    /// Host an in-process health server on the target address.
    #[arg(short, long, default_value_t = false)]
    pub serve: bool,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub pool: PoolConfig,
    pub concurrency: usize,
    /// `None` runs until interrupted.
    pub rounds: Option<u64>,
    pub round_interval: Duration,
    pub acquire_timeout: Duration,
    pub call_timeout: Duration,
    /// Listen address of the in-process server, if one was requested.
    pub serve_addr: Option<SocketAddr>,
}

impl TryFrom<CliArgs> for ProbeConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.target.trim().is_empty() {
            bail!("POOL_TARGET must not be empty");
        }
        if args.max_conns <= 0 {
            bail!("POOL_MAX_CONNS must be greater than 0");
        }
        if args.max_idle_conns > args.max_conns {
            bail!(
                "POOL_MAX_IDLE_CONNS ({}) exceeds POOL_MAX_CONNS ({})",
                args.max_idle_conns,
                args.max_conns
            );
        }
        if args.concurrency == 0 {
            bail!("PROBE_CONCURRENCY must be greater than 0");
        }
        if args.acquire_timeout_ms == 0 {
            bail!("PROBE_ACQUIRE_TIMEOUT_MS must be greater than 0");
        }

        let serve_addr = if args.serve {
            Some(listen_addr(&args.target)?)
        } else {
            None
        };

        let pool = PoolConfig {
            max_conns: args.max_conns,
            max_idle_conns: args.max_idle_conns,
            max_refs: args.max_refs,
            new_conn_rate: args.new_conn_rate,
            check_period: Duration::from_millis(args.check_period_ms),
            close_wait: Duration::from_millis(args.close_wait_ms),
            dial_timeout: Duration::from_millis(args.dial_timeout_ms),
            dial_block: args.dial_block,
            debug: args.debug,
            shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
            ..PoolConfig::new(args.target)
        }
        .normalize()?;

        Ok(Self {
            pool,
            concurrency: args.concurrency,
            rounds: (args.rounds > 0).then_some(args.rounds),
            round_interval: Duration::from_millis(args.round_interval_ms),
            acquire_timeout: Duration::from_millis(args.acquire_timeout_ms),
            call_timeout: Duration::from_millis(args.call_timeout_ms),
            serve_addr,
        })
    }
}

/// Socket address to bind for `target`, ignoring any scheme.
fn listen_addr(target: &str) -> anyhow::Result<SocketAddr> {
    let authority = target
        .trim()
        .split_once("://")
        .map_or(target.trim(), |(_, rest)| rest)
        .trim_end_matches('/');
    authority
        .parse()
        .with_context(|| format!("--serve needs an ip:port target, got `{target}`"))
}
