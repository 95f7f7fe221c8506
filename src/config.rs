use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub port: u16,
    pub log_level: String,
    pub redis_url: Option<String>,
    // Payment provider configuration
    pub paystack_secret_key: String,
    pub paystack_base_url: String,
    pub gateway_timeout_secs: u64,
    // Escrow policy
    pub platform_fee_bps: u32,
    pub auto_release_grace_hours: i64,
    pub auto_release_interval_secs: u64,
    pub auto_release_batch_size: i64,
    // Outbox relay
    pub outbox_interval_secs: u64,
    pub outbox_batch_size: i64,
    pub outbox_max_attempts: i32,
    pub push_broker_url: Option<String>,
}

impl Config {
    pub fn init() -> Config {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let jwt_secret = std::env::var("JWT_SECRET_KEY").expect("JWT_SECRET_KEY must be set");

        let paystack_secret_key = std::env::var("PAYSTACK_SECRET_KEY")
            .unwrap_or_else(|_| "test_secret_key".to_string());
        let paystack_base_url = std::env::var("PAYSTACK_BASE_URL")
            .unwrap_or_else(|_| "https://api.paystack.co".to_string());

        Config {
            database_url,
            jwt_secret,
            port: env_or("PORT", 8000),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string()),
            redis_url: non_empty_env("REDIS_URL"),
            paystack_secret_key,
            paystack_base_url,
            gateway_timeout_secs: env_or("GATEWAY_TIMEOUT_SECS", 15),
            platform_fee_bps: fee_bps_or("PLATFORM_FEE_BPS", 500),
            auto_release_grace_hours: env_or("AUTO_RELEASE_GRACE_HOURS", 168),
            auto_release_interval_secs: env_or("AUTO_RELEASE_INTERVAL_SECS", 3600),
            auto_release_batch_size: env_or("AUTO_RELEASE_BATCH_SIZE", 100),
            outbox_interval_secs: env_or("OUTBOX_INTERVAL_SECS", 30),
            outbox_batch_size: env_or("OUTBOX_BATCH_SIZE", 50),
            outbox_max_attempts: env_or("OUTBOX_MAX_ATTEMPTS", 10),
            push_broker_url: non_empty_env("PUSH_BROKER_URL"),
        }
    }

    pub fn auto_release_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.auto_release_grace_hours)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_or<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

const MAX_FEE_BPS: u32 = 10_000;

/// Basis points of the milestone amount; anything over 100% is rejected.
fn fee_bps_or(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(raw) => bounded_bps(key, &raw, default),
        Err(_) => default,
    }
}

fn bounded_bps(key: &str, raw: &str, default: u32) -> u32 {
    let value = parse_or(key, raw, default);
    if value > MAX_FEE_BPS {
        tracing::warn!("{} of {} exceeds {} basis points, using default {}", key, value, MAX_FEE_BPS, default);
        return default;
    }
    value
}

fn parse_or<T: FromStr + std::fmt::Display>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("Invalid value {:?} for {}, using default {}", raw, key, default);
            default
        }
    }
}
