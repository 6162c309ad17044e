use crate::aggregator::Column;
use crate::config::types::{Config, DataConfig, MonitorConfig, ScrapingConfig, TargetEntry};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scraping_config(&config.scraping)?;
    validate_data_config(&config.data)?;
    validate_monitor_config(&config.monitor)?;
    validate_targets(&config.targets)?;

    if config.checkpoint.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "checkpoint database-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates session and fetch settings
fn validate_scraping_config(config: &ScrapingConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_sessions < 1 || config.max_concurrent_sessions > 100 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_sessions must be between 1 and 100, got {}",
            config.max_concurrent_sessions
        )));
    }

    if config.max_retries < 1 {
        return Err(ConfigError::Validation(format!(
            "max_retries must be >= 1, got {}",
            config.max_retries
        )));
    }

    if config.scrape_delay_min_ms > config.scrape_delay_max_ms {
        return Err(ConfigError::Validation(format!(
            "scrape_delay_min_ms ({}) must not exceed scrape_delay_max_ms ({})",
            config.scrape_delay_min_ms, config.scrape_delay_max_ms
        )));
    }

    if config.max_pages_per_target < 1 {
        return Err(ConfigError::Validation(format!(
            "max_pages_per_target must be >= 1, got {}",
            config.max_pages_per_target
        )));
    }

    if config.session_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "session_timeout_secs must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be >= 1".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates sink and report settings
fn validate_data_config(config: &DataConfig) -> Result<(), ConfigError> {
    if config.output_path.is_empty() {
        return Err(ConfigError::Validation(
            "output_path cannot be empty".to_string(),
        ));
    }

    if config.report_path.is_empty() {
        return Err(ConfigError::Validation(
            "report_path cannot be empty".to_string(),
        ));
    }

    if config.buffer_size < 1 {
        return Err(ConfigError::Validation(format!(
            "buffer_size must be >= 1, got {}",
            config.buffer_size
        )));
    }

    if let Some(columns) = &config.columns {
        if columns.is_empty() {
            return Err(ConfigError::Validation(
                "columns must list at least one column when set".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for name in columns {
            if Column::from_name(name).is_none() {
                return Err(ConfigError::Validation(format!(
                    "Unknown column '{}'",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Column '{}' listed more than once",
                    name
                )));
            }
        }
    }

    Ok(())
}

fn validate_monitor_config(config: &MonitorConfig) -> Result<(), ConfigError> {
    if config.interval_ms < 1 {
        return Err(ConfigError::Validation(
            "monitor interval_ms must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates target entries
fn validate_targets(targets: &[TargetEntry]) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::Validation(
            "At least one [[target]] entry is required".to_string(),
        ));
    }

    let mut keys = HashSet::new();
    for entry in targets {
        if entry.key.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Target key cannot be empty".to_string(),
            ));
        }

        if !keys.insert(entry.key.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate target key '{}'",
                entry.key
            )));
        }

        let url = Url::parse(&entry.url).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid URL for target '{}': {}", entry.key, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "Target URL '{}' must use http or https",
                entry.url
            )));
        }
    }

    Ok(())
}
