//! API configuration.

use std::collections::HashSet;
use std::time::Duration;

use reel_models::parse_size;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Environment (development/production)
    pub environment: String,
    /// Serve Prometheus metrics at /metrics
    pub metrics_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            environment: "development".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8000),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| split_list(&s))
                .unwrap_or_else(|_| vec!["*".to_string()]),
            environment: std::env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }
}

/// Admission-control configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Sliding window shared by the general and strict limiters
    pub rate_limit_window: Duration,
    pub rate_limit_max: u64,
    /// Limit for sensitive endpoints, applied on top of the general one
    pub strict_rate_limit_max: u64,
    /// Parsed from a human-readable size string such as `10kb`
    pub max_body_bytes: u64,
    pub admin_api_key: Option<String>,
    pub beta_access_enabled: bool,
    pub beta_access_codes: HashSet<String>,
    pub free_requests_per_hour: u32,
    pub premium_requests_per_hour: u32,
    pub premium_user_ids: HashSet<String>,
    /// Controls the API-key gate when no key is configured
    pub production: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit_window: Duration::from_secs(15 * 60),
            rate_limit_max: 100,
            strict_rate_limit_max: 5,
            max_body_bytes: parse_size("10kb"),
            admin_api_key: None,
            beta_access_enabled: false,
            beta_access_codes: HashSet::new(),
            free_requests_per_hour: 20,
            premium_requests_per_hour: 200,
            premium_user_ids: HashSet::new(),
            production: false,
        }
    }
}

impl AdmissionConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rate_limit_window: std::env::var("RATE_LIMIT_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max: std::env::var("RATE_LIMIT_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_max),
            strict_rate_limit_max: std::env::var("STRICT_RATE_LIMIT_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.strict_rate_limit_max),
            max_body_bytes: std::env::var("MAX_BODY_SIZE")
                .map(|s| parse_size(&s))
                .unwrap_or(defaults.max_body_bytes),
            admin_api_key: std::env::var("ADMIN_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            beta_access_enabled: std::env::var("BETA_ACCESS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            beta_access_codes: std::env::var("BETA_ACCESS_CODES")
                .map(|s| split_list(&s).into_iter().collect())
                .unwrap_or_default(),
            free_requests_per_hour: std::env::var("USER_RATE_LIMIT_FREE_PER_HOUR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.free_requests_per_hour),
            premium_requests_per_hour: std::env::var("USER_RATE_LIMIT_PREMIUM_PER_HOUR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.premium_requests_per_hour),
            premium_user_ids: std::env::var("PREMIUM_USER_IDS")
                .map(|s| split_list(&s).into_iter().collect())
                .unwrap_or_default(),
            production: std::env::var("ENVIRONMENT")
                .map(|e| e.to_lowercase() == "production")
                .unwrap_or(false),
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "RATE_LIMIT_WINDOW_SECS",
        "RATE_LIMIT_MAX",
        "STRICT_RATE_LIMIT_MAX",
        "MAX_BODY_SIZE",
        "ADMIN_API_KEY",
        "BETA_ACCESS_ENABLED",
        "BETA_ACCESS_CODES",
        "PREMIUM_USER_IDS",
        "ENVIRONMENT",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_admission_defaults() {
        clear();
        let config = AdmissionConfig::from_env();
        assert_eq!(config.rate_limit_window, Duration::from_secs(900));
        assert_eq!(config.rate_limit_max, 100);
        assert_eq!(config.strict_rate_limit_max, 5);
        assert_eq!(config.max_body_bytes, 10 * 1024);
        assert!(config.admin_api_key.is_none());
        assert!(!config.beta_access_enabled);
        assert!(!config.production);
    }

    #[test]
    #[serial]
    fn test_admission_from_env() {
        clear();
        std::env::set_var("RATE_LIMIT_MAX", "7");
        std::env::set_var("MAX_BODY_SIZE", "2mb");
        std::env::set_var("ADMIN_API_KEY", "  ");
        std::env::set_var("BETA_ACCESS_CODES", "alpha, beta,,");
        std::env::set_var("ENVIRONMENT", "Production");

        let config = AdmissionConfig::from_env();
        assert_eq!(config.rate_limit_max, 7);
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
        assert!(config.admin_api_key.is_none());
        assert_eq!(config.beta_access_codes.len(), 2);
        assert!(config.beta_access_codes.contains("beta"));
        assert!(config.production);
        clear();
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_fall_back() {
        clear();
        std::env::set_var("RATE_LIMIT_WINDOW_SECS", "soon");
        std::env::set_var("STRICT_RATE_LIMIT_MAX", "-1");
        let config = AdmissionConfig::from_env();
        assert_eq!(config.rate_limit_window, Duration::from_secs(900));
        assert_eq!(config.strict_rate_limit_max, 5);
        clear();
    }

    #[test]
    fn test_is_production() {
        let config = ApiConfig {
            environment: "PRODUCTION".to_string(),
            ..Default::default()
        };
        assert!(config.is_production());
        assert!(!ApiConfig::default().is_production());
    }
}
