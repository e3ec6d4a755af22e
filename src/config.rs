use dotenvy::dotenv;
use std::env;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub db_host:          String,
    pub db_port:          u16,
    pub db_name:          String,
    pub db_user:          String,
    pub db_password:      String,

    // Backend
    pub backend_host:     String,
    pub backend_port:     u16,

    // Session
    pub session_days:     i64,

    // School rules
    pub slot_generation_days: i64,
    pub invitation_days:      i64,
    pub lesson_minutes:       i64,

    // Seeded admin account
    pub admin_username:   String,
    pub admin_password:   String,

    // App
    pub app_env:          String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        fn require(key: &str) -> Result<String, ConfigError> {
            env::var(key).map_err(|_| ConfigError::MissingVar(key.to_string()))
        }

        fn parse_port(key: &str) -> Result<u16, ConfigError> {
            let raw = require(key)?;
            raw.parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw))
        }

        /// Optional positive day/minute count; a present but malformed value is an error.
        fn parse_positive(key: &str, default: i64) -> Result<i64, ConfigError> {
            match env::var(key) {
                Err(_) => Ok(default),
                Ok(raw) => match raw.parse::<i64>() {
                    Ok(v) if v > 0 => Ok(v),
                    _ => Err(ConfigError::InvalidValue(key.to_string(), raw)),
                },
            }
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        // Outside development the admin password must be provided explicitly.
        let admin_password = if app_env == "development" {
            env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".into())
        } else {
            require("ADMIN_PASSWORD")?
        };

        Ok(Self {
            db_host:      require("DB_HOST").unwrap_or_else(|_| "db".into()),
            db_port:      parse_port("DB_PORT").unwrap_or(3306),
            db_name:      require("DB_NAME")?,
            db_user:      require("DB_USER")?,
            db_password:  require("DB_PASSWORD")?,

            backend_host: env::var("BACKEND_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            backend_port: parse_port("BACKEND_PORT").unwrap_or(8080),

            session_days: parse_positive("SESSION_DAYS", 30)?,

            slot_generation_days: parse_positive("SLOT_GENERATION_DAYS", 60)?,
            invitation_days:      parse_positive("INVITATION_DAYS", 14)?,
            lesson_minutes:       parse_positive("LESSON_MINUTES", 40)?,

            admin_username: env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".into()),
            admin_password,

            app_env,
        })
    }

    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }

    /// Defaults used by tests that never touch the environment.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            db_host:      "localhost".into(),
            db_port:      3306,
            db_name:      "musicschool_test".into(),
            db_user:      "test".into(),
            db_password:  "test".into(),
            backend_host: "127.0.0.1".into(),
            backend_port: 0,
            session_days: 30,
            slot_generation_days: 60,
            invitation_days:      14,
            lesson_minutes:       40,
            admin_username: "admin".into(),
            admin_password: "admin".into(),
            app_env:      "development".into(),
        }
    }
}
