//! Startup readiness gate.
//!
//! ComfyUI is started as a separate process with an unknown cold-start
//! time. [`wait_until_ready`] probes `GET /` at a fixed interval until it
//! answers 200 or the attempt budget is spent. No backoff is applied.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;

/// Tunable parameters for the readiness probe.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Maximum number of probes before giving up.
    pub max_attempts: u32,
    /// Pause between consecutive probes.
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 500,
            interval: Duration::from_millis(50),
        }
    }
}

/// Poll the backend until it is ready.
///
/// Returns `true` once a probe succeeds, `false` when attempts are
/// exhausted or `cancel` is triggered.
pub async fn wait_until_ready(
    api: &ComfyUIApi,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> bool {
    tracing::info!(
        url = %api.api_url(),
        max_attempts = config.max_attempts,
        interval_ms = config.interval.as_millis() as u64,
        "Waiting for ComfyUI to become ready",
    );

    for attempt in 1..=config.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Readiness wait cancelled");
                return false;
            }
            result = api.ping() => {
                match result {
                    Ok(true) => {
                        tracing::info!(attempt, "ComfyUI is ready");
                        return true;
                    }
                    Ok(false) => tracing::trace!(attempt, "ComfyUI answered but is not ready"),
                    Err(e) => tracing::trace!(attempt, error = %e, "ComfyUI not reachable yet"),
                }
            }
        }

        if attempt < config.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(config.interval) => {}
            }
        }
    }

    tracing::error!(
        attempts = config.max_attempts,
        "ComfyUI did not become ready",
    );
    false
}
