//! Retry Collector: consumes `orchestration.retry`, decides whether a
//! nacked message gets reinjected into `orchestration` after a backoff
//! delay or discarded into `orchestration.failed`. Grounded on
//! `original_source/ats/kyaraben/worker/retry.py`.

use crate::config::RetryConfig;
use crate::errors::BrokerResult;

/// What the collector should do with a message it just received on the
/// retry queue.
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    /// Republish to the main exchange after `delay_ms`.
    Reinject { delay_ms: u64 },
    /// Past `fail_timeout` since first enqueue; drop into the dead queue.
    Discard,
}

pub struct RetryCollector {
    config: RetryConfig,
}

impl RetryCollector {
    pub fn new(config: RetryConfig) -> Self {
        RetryCollector { config }
    }

    /// `age_secs` is wall-clock time since the message's original
    /// `timestamp` property, preserved unchanged across every republish
    /// (message_id/timestamp/content_type/delivery_mode/headers all carry
    /// forward, matching the original's `channel.basic_publish` call).
    pub fn decide(&self, age_secs: u64, retries: u32) -> RetryDecision {
        if age_secs >= self.config.fail_timeout {
            return RetryDecision::Discard;
        }
        let delay_secs = self.backoff_secs(retries);
        RetryDecision::Reinject { delay_ms: delay_secs * 1000 }
    }

    /// `delay = min(delay_max, delay_min * 1.5^retries)`, grounded on
    /// `original_source/worker/retry.py::next_delay`.
    fn backoff_secs(&self, retries: u32) -> u64 {
        let scaled = (self.config.delay_min as f64) * 1.5f64.powi(retries as i32);
        scaled.min(self.config.delay_max as f64).round() as u64
    }

    /// Reinjects `delivery` carrying its identity forward (`message_id`,
    /// original `timestamp`, `retries + 1`) so the next cycle's
    /// `age_secs`/backoff calculation sees true history instead of a reset
    /// clock and counter.
    pub async fn publish_retry<B: crate::broker::TaskBroker>(
        &self,
        broker: &B,
        delivery: &crate::broker::Delivery,
        decision: &RetryDecision,
    ) -> BrokerResult<()> {
        match decision {
            RetryDecision::Reinject { delay_ms } => {
                broker
                    .publish_retry(
                        &delivery.task,
                        *delay_ms,
                        &delivery.message_id,
                        delivery.timestamp,
                        delivery.retries + 1,
                    )
                    .await
            }
            RetryDecision::Discard => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig { delay_min: 1, delay_max: 30, fail_timeout: 86_400 }
    }

    #[test]
    fn first_retry_uses_delay_min() {
        let collector = RetryCollector::new(config());
        assert_eq!(collector.backoff_secs(0), 1);
    }

    #[test]
    fn backoff_grows_and_caps_at_delay_max() {
        let collector = RetryCollector::new(config());
        assert_eq!(collector.backoff_secs(1), 2);
        assert_eq!(collector.backoff_secs(10), 30);
    }

    #[test]
    fn past_fail_timeout_discards_regardless_of_retries() {
        let collector = RetryCollector::new(config());
        let decision = collector.decide(86_401, 0);
        assert_eq!(decision, RetryDecision::Discard);
    }

    #[test]
    fn within_fail_timeout_reinjects_with_scaled_delay() {
        let collector = RetryCollector::new(config());
        let decision = collector.decide(10, 2);
        assert_eq!(decision, RetryDecision::Reinject { delay_ms: 2_000 });
    }
}
