//! Consumer supervision: reconnect with exponential backoff and jitter
//!
//! Connection loss and transport failures are recovered here, outside the
//! bus client. Topology and configuration errors are fatal.

use event_bus::{BusConfig, DeliveryHandler, Error as BusError, EventConsumer, QueueBinding};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ReconnectConfig;
use crate::Result;

/// Delay schedule between reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
}

impl Backoff {
    /// Schedule from config
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt.min(32) as i32);
        let capped = base.min(self.config.max_delay_ms as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Keep a consumer for `binding` running until `cancel` fires.
///
/// Returns `Ok(())` on cancellation and an error only for failures a
/// reconnect cannot fix.
pub async fn run_consumer<H: DeliveryHandler>(
    bus: BusConfig,
    binding: QueueBinding,
    handler: Arc<H>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let backoff = Backoff::new(reconnect);
    let mut attempt: u32 = 0;

    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            connected = EventConsumer::connect(&bus, binding.clone()) => connected,
        };

        let failure = match connected {
            Ok(consumer) => {
                attempt = 0;
                match consumer.consume(&cancel, Arc::clone(&handler)).await {
                    Ok(()) => {
                        info!(queue = %binding.queue, "Consumer stopped");
                        return Ok(());
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        if !is_recoverable(&failure) {
            error!(queue = %binding.queue, error = %failure, "Consumer failed permanently");
            return Err(failure.into());
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        warn!(
            queue = %binding.queue,
            error = %failure,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Consumer disconnected, reconnecting"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn is_recoverable(error: &BusError) -> bool {
    matches!(
        error,
        BusError::Connection(_) | BusError::ConsumeTransport(_) | BusError::Acknowledge(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter_factor: f64) -> Backoff {
        Backoff::new(ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_factor,
        })
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = backoff(0.0);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = backoff(0.1);
        for _ in 0..100 {
            let delay = backoff.delay(2).as_millis();
            assert!((360..=440).contains(&delay), "delay {delay}ms out of range");
        }
    }

    #[test]
    fn test_only_transport_failures_are_recoverable() {
        assert!(is_recoverable(&BusError::Connection("refused".into())));
        assert!(is_recoverable(&BusError::ConsumeTransport("closed".into())));
        assert!(!is_recoverable(&BusError::Declaration("bad stream".into())));
        assert!(!is_recoverable(&BusError::Config("max_deliver".into())));
    }

    #[tokio::test]
    async fn test_cancelled_before_connect_returns_ok() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        struct Never;
        #[async_trait::async_trait]
        impl DeliveryHandler for Never {
            async fn handle(&self, _: event_bus::InboundMessage) -> event_bus::Disposition {
                event_bus::Disposition::Ack
            }
        }

        let result = run_consumer(
            BusConfig {
                url: "nats://127.0.0.1:1".to_string(),
                ..BusConfig::default()
            },
            QueueBinding::new("q", "transfer.*", 1).unwrap(),
            Arc::new(Never),
            ReconnectConfig::default(),
            cancel,
        )
        .await;
        assert!(result.is_ok());
    }
}
