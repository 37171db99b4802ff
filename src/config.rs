use anyhow::{anyhow, Context, Result};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::payments::providers::client::MAX_PROVIDER_RETRIES;
use crate::payments::providers::{ChapaConfig, PaystackConfig, StripeConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub log_format: LogFormat,
    /// Empty means permissive CORS, which is only allowed outside production
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("LOG_FORMAT must be 'pretty' or 'json', got {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

impl FromStr for LedgerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(LedgerBackend::Postgres),
            "memory" => Ok(LedgerBackend::Memory),
            other => Err(anyhow!(
                "LEDGER_BACKEND must be 'postgres' or 'memory', got {}",
                other
            )),
        }
    }
}

impl fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerBackend::Postgres => f.write_str("postgres"),
            LedgerBackend::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub credit_max_attempts: u32,
    pub credit_retry_backoff: Duration,
}

/// Credentials for each gateway; `None` means the gateway is disabled
#[derive(Debug, Clone, Default)]
pub struct ProvidersConfig {
    pub paystack: Option<PaystackConfig>,
    pub stripe: Option<StripeConfig>,
    pub chapa: Option<ChapaConfig>,
}

impl ProvidersConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            paystack: if is_set("PAYSTACK_SECRET_KEY") {
                Some(PaystackConfig::from_env()?)
            } else {
                None
            },
            stripe: if is_set("STRIPE_SECRET_KEY") {
                Some(StripeConfig::from_env()?)
            } else {
                None
            },
            chapa: if is_set("CHAPA_SECRET_KEY") {
                Some(ChapaConfig::from_env()?)
            } else {
                None
            },
        })
    }

    pub fn enabled_count(&self) -> usize {
        [
            self.paystack.is_some(),
            self.stripe.is_some(),
            self.chapa.is_some(),
        ]
        .into_iter()
        .filter(|enabled| *enabled)
        .count()
    }
}

fn is_set(key: &str) -> bool {
    env::var(key).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} must be a valid number, got {}", key, raw)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .context("PORT not set")?
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_format: env::var("LOG_FORMAT").unwrap_or_default().parse()?,
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let ledger = LedgerConfig {
            backend: env::var("LEDGER_BACKEND")
                .unwrap_or_else(|_| "postgres".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL").ok(),
            max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 20)?,
            credit_max_attempts: parse_or("CREDIT_MAX_ATTEMPTS", 5)?,
            credit_retry_backoff: Duration::from_millis(parse_or("CREDIT_RETRY_BACKOFF_MS", 25)?),
        };

        let providers = ProvidersConfig::from_env()?;

        let config = Config {
            server,
            ledger,
            providers,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.server.environment == "production"
    }

    pub fn validate(&self) -> Result<()> {
        // Validate port range
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        // Validate environment
        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        match self.ledger.backend {
            LedgerBackend::Postgres => {
                if self
                    .ledger
                    .database_url
                    .as_deref()
                    .map_or(true, |url| url.trim().is_empty())
                {
                    return Err(anyhow!("DATABASE_URL is required for the postgres ledger"));
                }
                if self.ledger.max_connections == 0 {
                    return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
                }
            }
            LedgerBackend::Memory if self.is_production() => {
                return Err(anyhow!(
                    "LEDGER_BACKEND=memory is not durable and cannot be used in production"
                ));
            }
            LedgerBackend::Memory => {}
        }

        if self.ledger.credit_max_attempts == 0 {
            return Err(anyhow!("CREDIT_MAX_ATTEMPTS must be greater than 0"));
        }

        if self.is_production() && self.server.cors_allowed_origins.is_empty() {
            return Err(anyhow!("CORS_ALLOWED_ORIGINS must be set in production"));
        }

        let retries = [
            ("PAYSTACK_MAX_RETRIES", self.providers.paystack.as_ref().map(|p| p.max_retries)),
            ("STRIPE_MAX_RETRIES", self.providers.stripe.as_ref().map(|p| p.max_retries)),
            ("CHAPA_MAX_RETRIES", self.providers.chapa.as_ref().map(|p| p.max_retries)),
        ];
        for (key, value) in retries {
            if let Some(value) = value.filter(|v| *v > MAX_PROVIDER_RETRIES) {
                return Err(anyhow!(
                    "{} must be at most {}, got {}",
                    key,
                    MAX_PROVIDER_RETRIES,
                    value
                ));
            }
        }

        if self.providers.enabled_count() == 0 {
            return Err(anyhow!(
                "No payment provider configured: set at least one of PAYSTACK_SECRET_KEY, STRIPE_SECRET_KEY, CHAPA_SECRET_KEY"
            ));
        }

        Ok(())
    }
}
