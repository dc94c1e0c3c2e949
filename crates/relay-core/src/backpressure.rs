//! Per-endpoint mailbox-depth admission check.

use relay_types::RejectReason;

use crate::config::BackpressureConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureCheck {
    pub ratio: f64,
    /// Set when `ratio >= pressure_warning_at`; the caller emits a
    /// best-effort `relay.system.backpressure.{hash}` signal in response.
    pub warn: bool,
}

/// `current_size` is `SqliteIndex.count_new_by_endpoint(hash)`; rejected at
/// or past `max_mailbox_size`.
pub fn check(config: &BackpressureConfig, current_size: u64) -> Result<BackpressureCheck, RejectReason> {
    if current_size >= config.max_mailbox_size {
        return Err(RejectReason::Backpressure);
    }
    let ratio = current_size as f64 / config.max_mailbox_size as f64;
    Ok(BackpressureCheck {
        ratio,
        warn: ratio >= config.pressure_warning_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_at_exactly_max_mailbox_size() {
        let config = BackpressureConfig {
            max_mailbox_size: 10,
            pressure_warning_at: 0.8,
        };
        assert_eq!(check(&config, 10), Err(RejectReason::Backpressure));
        assert!(check(&config, 9).is_ok());
    }

    #[test]
    fn warns_past_threshold_ratio() {
        let config = BackpressureConfig {
            max_mailbox_size: 10,
            pressure_warning_at: 0.8,
        };
        let result = check(&config, 8).unwrap();
        assert!(result.warn);
        let result = check(&config, 7).unwrap();
        assert!(!result.warn);
    }
}
