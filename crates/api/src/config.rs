//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Authentication
    pub jwt_secret: String,

    // Operator surface
    pub admin_retry_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Operator surface
            admin_retry_secret: env::var("RETRY_SECRET").ok(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup_minimal_config() {
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        env::remove_var("RETRY_SECRET");
    }

    #[test]
    #[serial]
    fn test_missing_jwt_secret_rejected() {
        setup_minimal_config();
        env::remove_var("JWT_SECRET");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("JWT_SECRET"))));
    }

    #[test]
    #[serial]
    fn test_short_jwt_secret_rejected() {
        setup_minimal_config();
        env::set_var("JWT_SECRET", "too-short");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::WeakSecret(_))));
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        setup_minimal_config();
        env::remove_var("BIND_ADDRESS");
        env::remove_var("PUBLIC_URL");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.public_url, "http://localhost:3000");
        assert!(config.admin_retry_secret.is_none());
    }
}
