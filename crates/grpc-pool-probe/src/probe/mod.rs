pub mod config;
pub mod telemetry;

use config::ProbeConfig;
use core::time::Duration;
use grpc_pool::{Channel, Error, Pool, TonicDialer};
use std::net::SocketAddr;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tonic::{Request, transport::Server};
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};

/// Tally of one or more rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub ok: u64,
    pub failed: u64,
    pub acquire_timeouts: u64,
}

impl RoundSummary {
    fn merge(&mut self, other: Self) {
        self.ok += other.ok;
        self.failed += other.failed;
        self.acquire_timeouts += other.acquire_timeouts;
    }
}

/// Serves the standard health service on `addr` until `shutdown` fires.
pub async fn serve_health(addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    // The reporter starts with the overall ("") service marked serving.
    let (_health_reporter, health_service) = tonic_health::server::health_reporter();

    tracing::info!("Serving health checks on {addr}");
    Server::builder()
        .add_service(health_service)
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await?;

    tracing::info!("Health server shut down");
    Ok(())
}

/// Runs rounds of concurrent health checks until the configured count is
/// reached or `shutdown` fires.
pub async fn run_rounds(
    pool: &Pool<TonicDialer>,
    config: &ProbeConfig,
    shutdown: &CancellationToken,
) -> RoundSummary {
    let mut total = RoundSummary::default();
    let mut ticker = interval(config.round_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut round = 0u64;
    while config.rounds.is_none_or(|rounds| round < rounds) {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        round += 1;

        let summary = run_round(pool, config).await;
        tracing::info!(
            round,
            ok = summary.ok,
            failed = summary.failed,
            acquire_timeouts = summary.acquire_timeouts,
            "Round finished"
        );
        total.merge(summary);
    }
    total
}

async fn run_round(pool: &Pool<TonicDialer>, config: &ProbeConfig) -> RoundSummary {
    let results = futures::future::join_all(
        (0..config.concurrency)
            .map(|_| check_once(pool, config.acquire_timeout, config.call_timeout)),
    )
    .await;

    let mut summary = RoundSummary::default();
    for result in results {
        match result {
            Ok(()) => summary.ok += 1,
            Err(CheckError::Pool(Error::WaitReadyTimeout { .. })) => summary.acquire_timeouts += 1,
            Err(_e) => {
                tracing::debug!("Health check failed: {_e}");
                summary.failed += 1;
            }
        }
    }
    summary
}

#[derive(Debug)]
enum CheckError {
    Pool(Error),
    Call(tonic::Status),
    NotServing(ServingStatus),
}

impl core::fmt::Display for CheckError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Pool(e) => write!(f, "pool: {e}"),
            Self::Call(status) => write!(f, "call: {status}"),
            Self::NotServing(status) => write!(f, "server reported {}", status.as_str_name()),
        }
    }
}

/// One acquire, `Check`, release cycle. The guard returns the reference on
/// every exit path.
async fn check_once(
    pool: &Pool<TonicDialer>,
    acquire_timeout: Duration,
    call_timeout: Duration,
) -> Result<(), CheckError> {
    let started = Instant::now();
    telemetry::increment_calls();

    let result = async {
        let conn = pool.acquire(acquire_timeout).await.map_err(|e| {
            if matches!(e, Error::WaitReadyTimeout { .. }) {
                telemetry::increment_acquire_timeouts();
            }
            CheckError::Pool(e)
        })?;
        let channel: Channel = conn.handle().map_err(CheckError::Pool)?;

        let mut request = Request::new(HealthCheckRequest {
            service: String::new(),
        });
        request.set_timeout(call_timeout);

        let response = HealthClient::new(channel)
            .check(request)
            .await
            .map_err(CheckError::Call)?
            .into_inner();
        match response.status() {
            ServingStatus::Serving => Ok(()),
            status => Err(CheckError::NotServing(status)),
        }
    }
    .await;

    if result.is_err() {
        telemetry::increment_call_errors();
    }
    telemetry::record_call_duration(started.elapsed().as_secs_f64() * 1000.0);
    result
}
