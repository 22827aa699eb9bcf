//! Gateway configuration from environment variables.

use crate::error::ConfigError;
use crate::transport::{SubscriptionOptions, MAX_LOCK_RENEWAL};
use std::env;
use std::time::Duration;

/// Placeholder replaced with the OS user name.
pub const USERNAME_PLACEHOLDER: &str = "%USERNAME%";

/// Placeholder replaced with the machine name.
pub const COMPUTERNAME_PLACEHOLDER: &str = "%COMPUTERNAME%";

/// Configuration for one gateway instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Broker namespace.
    pub namespace: String,

    /// Topic name; may contain placeholders.
    pub topic: String,

    /// Subscription name; may contain placeholders.
    pub subscription: String,

    /// Tenant served by this instance, if any. Used as the subscription's
    /// tenant filter and by the producer façades.
    pub tenant_id: Option<String>,

    /// Messages dispatched in parallel.
    pub max_concurrent_calls: usize,

    /// Wait between tearing down and recreating a failed subscription.
    pub reconnect_cooldown: Duration,

    /// Auth failures tolerated before the producer recreates its sender.
    pub auth_retry_budget: i64,

    /// Silence window for repeated transport error logs.
    pub error_log_window: Duration,

    /// Distinct error keys remembered by the log limiter.
    pub error_log_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            namespace: "local".to_string(),
            topic: "requests".to_string(),
            subscription: "processor".to_string(),
            tenant_id: None,
            max_concurrent_calls: crate::DEFAULT_MAX_CONCURRENT_CALLS,
            reconnect_cooldown: Duration::from_secs(crate::DEFAULT_RECONNECT_COOLDOWN_SECS),
            auth_retry_budget: crate::DEFAULT_AUTH_RETRY_BUDGET,
            error_log_window: Duration::from_secs(crate::DEFAULT_ERROR_LOG_WINDOW_SECS),
            error_log_capacity: crate::DEFAULT_ERROR_LOG_CAPACITY,
        }
    }
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUS_NAMESPACE`: Broker namespace (default: local)
    /// - `BUS_TOPIC`: Topic name template (default: requests)
    /// - `BUS_SUBSCRIPTION`: Subscription name template (default: processor)
    /// - `BUS_TENANT_ID`: Tenant served by this instance (default: none)
    /// - `BUS_MAX_CONCURRENT_CALLS`: Parallel dispatches (default: 16)
    /// - `BUS_RECONNECT_COOLDOWN_SECS`: Reconnect cool-down (default: 20)
    /// - `BUS_AUTH_RETRY_BUDGET`: Producer auth retry budget (default: 50)
    /// - `BUS_ERROR_LOG_WINDOW_SECS`: Error log window (default: 60)
    /// - `BUS_ERROR_LOG_CAPACITY`: Error log keys remembered (default: 10)
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidValue` for unparsable numbers,
    /// `ConfigError::Empty` for empty names.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            namespace: env::var("BUS_NAMESPACE").unwrap_or(defaults.namespace),
            topic: env::var("BUS_TOPIC").unwrap_or(defaults.topic),
            subscription: env::var("BUS_SUBSCRIPTION").unwrap_or(defaults.subscription),
            tenant_id: env::var("BUS_TENANT_ID").ok().filter(|t| !t.is_empty()),
            max_concurrent_calls: parse_var("BUS_MAX_CONCURRENT_CALLS")?
                .unwrap_or(defaults.max_concurrent_calls),
            reconnect_cooldown: parse_var("BUS_RECONNECT_COOLDOWN_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_cooldown),
            auth_retry_budget: parse_var("BUS_AUTH_RETRY_BUDGET")?
                .unwrap_or(defaults.auth_retry_budget),
            error_log_window: parse_var("BUS_ERROR_LOG_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.error_log_window),
            error_log_capacity: parse_var("BUS_ERROR_LOG_CAPACITY")?
                .unwrap_or(defaults.error_log_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check names are present and limits usable.
    ///
    /// # Errors
    ///
    /// `ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::Empty("BUS_TOPIC"));
        }
        if self.subscription.is_empty() {
            return Err(ConfigError::Empty("BUS_SUBSCRIPTION"));
        }
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::InvalidValue {
                name: "BUS_MAX_CONCURRENT_CALLS",
                value: "0".to_string(),
            });
        }
        if self.auth_retry_budget < 0 {
            return Err(ConfigError::InvalidValue {
                name: "BUS_AUTH_RETRY_BUDGET",
                value: self.auth_retry_budget.to_string(),
            });
        }
        Ok(())
    }

    /// Topic name with placeholders substituted from the OS.
    #[must_use]
    pub fn resolved_topic(&self) -> String {
        expand_template(&self.topic, &os_username(), &os_computername())
    }

    /// Subscription name with placeholders substituted from the OS.
    #[must_use]
    pub fn resolved_subscription(&self) -> String {
        expand_template(&self.subscription, &os_username(), &os_computername())
    }

    /// Subscription options derived from this configuration.
    #[must_use]
    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            max_concurrent_calls: self.max_concurrent_calls,
            max_auto_lock_renewal: MAX_LOCK_RENEWAL,
            tenant_filter: self.tenant_id.clone(),
        }
    }
}

/// Substitute `%USERNAME%` and `%COMPUTERNAME%` in `template`.
#[must_use]
pub fn expand_template(template: &str, username: &str, computername: &str) -> String {
    template
        .replace(USERNAME_PLACEHOLDER, username)
        .replace(COMPUTERNAME_PLACEHOLDER, computername)
}

fn os_username() -> String {
    env::var("USERNAME")
        .or_else(|_| env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn os_computername() -> String {
    env::var("COMPUTERNAME")
        .or_else(|_| env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}
