//! Configuration validation.

use super::Config;

/// Reject configurations that cannot work at runtime.
pub fn validate(config: &Config) -> anyhow::Result<()> {
    if config.consumer.fetch_timeout_secs == 0 {
        anyhow::bail!("consumer.fetch_timeout_secs must be at least 1");
    }
    if config.consumer.watchdog_tick_ms == 0 {
        anyhow::bail!("consumer.watchdog_tick_ms must be at least 1");
    }
    if config.lock.ttl_ms < 10 {
        anyhow::bail!(
            "lock.ttl_ms of {} is below the minimum of 10; a lock this short \
             expires before its acquisition round trips settle",
            config.lock.ttl_ms
        );
    }
    if config.consumer.watchdog_tick_ms > config.lock.ttl_ms {
        anyhow::bail!(
            "consumer.watchdog_tick_ms ({}) exceeds lock.ttl_ms ({}); the \
             watchdog would wake too rarely to matter",
            config.consumer.watchdog_tick_ms,
            config.lock.ttl_ms
        );
    }
    match config.logging.rotation.to_lowercase().as_str() {
        "daily" | "hourly" | "never" => {}
        other => anyhow::bail!("logging.rotation '{other}' is not one of: daily, hourly, never"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn zero_fetch_timeout_rejected() {
        let mut config = Config::default();
        config.consumer.fetch_timeout_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn tiny_lock_ttl_rejected() {
        let mut config = Config::default();
        config.lock.ttl_ms = 5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_rotation_rejected() {
        let mut config = Config::default();
        config.logging.rotation = "weekly".to_string();
        assert!(validate(&config).is_err());
    }
}
