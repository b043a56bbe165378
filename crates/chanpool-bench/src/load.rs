//! Concurrent health-check load driven through a [`ConnectionPool`].
//!
//! Each caller task owns a generated [`HealthClient`] built on a clone of the
//! pool, so every call is routed to the next connection in rotation. Callers
//! draw request tickets from a shared counter until the total is reached or
//! the run is cancelled.

use chanpool::{ConnectionPool, PooledChannel};
use core::time::Duration;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tonic_health::pb::{HealthCheckRequest, health_client::HealthClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Completed calls per second.
    pub fn throughput(&self) -> f64 {
        self.total() as f64 / self.elapsed.as_secs_f64()
    }
}

/// Issues `requests` health checks from `concurrency` callers.
///
/// Failed calls are counted, not fatal. Stops early once `cancel` fires.
pub async fn run_load(
    pool: &ConnectionPool<PooledChannel>,
    requests: usize,
    concurrency: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<LoadReport> {
    let tickets = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let callers = (0..concurrency).map(|caller| {
        let mut client = HealthClient::new(pool.clone());
        let tickets = Arc::clone(&tickets);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let (mut succeeded, mut failed) = (0_usize, 0_usize);
            while !cancel.is_cancelled() && tickets.fetch_add(1, Ordering::Relaxed) < requests {
                let request = HealthCheckRequest {
                    service: String::new(),
                };
                match client.check(request).await {
                    Ok(_) => succeeded += 1,
                    Err(status) => {
                        tracing::debug!("Caller {caller} call failed: {status}");
                        failed += 1;
                    }
                }
            }
            (succeeded, failed)
        })
    });

    let mut report = LoadReport {
        succeeded: 0,
        failed: 0,
        elapsed: Duration::ZERO,
    };
    for joined in futures::future::join_all(callers).await {
        let (succeeded, failed) = joined?;
        report.succeeded += succeeded;
        report.failed += failed;
    }
    report.elapsed = start.elapsed();

    Ok(report)
}
