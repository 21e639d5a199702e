//! "Poll until failure or match" primitive.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DeployError;

/// Repeatedly invokes a producer until it fails or its value satisfies a
/// stop condition.
///
/// This is deliberately not a retry helper: a failing producer ends the poll
/// immediately and its error is returned as-is. Waiting between attempts is
/// unbounded unless the caller goes through [`Poller::poll_within`].
#[derive(Debug, Clone)]
pub struct Poller {
    period: Duration,
    cancellation: Option<CancellationToken>,
}

impl Poller {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            cancellation: None,
        }
    }

    /// Wake up early from the inter-poll delay when `token` is cancelled.
    ///
    /// The token never interrupts a producer call in flight. The stop
    /// condition is expected to check the token and end the poll on the
    /// following tick.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn poll<T, E, F, Fut, S>(&self, mut producer: F, stop: S) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        S: Fn(&T) -> bool,
    {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let value = producer().await?;

            if stop(&value) {
                return Ok(value);
            }

            tracing::trace!(attempt, period = ?self.period, "Poll condition not met, waiting");
            self.pause().await;
        }
    }

    /// Same as [`Poller::poll`], bounded by `limit`.
    ///
    /// Running out of time is a definite failure reported as
    /// [`DeployError::PollTimeout`].
    pub async fn poll_within<T, E, F, Fut, S>(
        &self,
        limit: Duration,
        what: &str,
        producer: F,
        stop: S,
    ) -> Result<T, DeployError>
    where
        E: Into<DeployError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        S: Fn(&T) -> bool,
    {
        match tokio::time::timeout(limit, self.poll(producer, stop)).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                tracing::warn!(what, limit = ?limit, "Polling timed out");
                Err(DeployError::PollTimeout {
                    what: what.to_string(),
                    seconds: limit.as_secs(),
                })
            }
        }
    }

    async fn pause(&self) {
        match &self.cancellation {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(self.period) => {}
                    _ = token.cancelled() => {}
                }
            }
            None => tokio::time::sleep(self.period).await,
        }
    }
}
