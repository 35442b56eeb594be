//! Configuration surface (spec §6). Mirrors the teacher's
//! `models::Config::from_env()` shape: `dotenv` load, then
//! `env::var(KEY).ok().and_then(parse).unwrap_or(default)` per field.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cleanup_worker::OnReducePolicy;
use crate::model::Timeframe;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_or_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

fn env_or_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub timeframes: Vec<Timeframe>,
    pub bar_ring_size: usize,
    pub persistence_high_water: usize,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub queue_size: usize,
    pub slow_threshold_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub db_path: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub query_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub error_rate_window: usize,
    pub error_rate_threshold: f64,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub crash_loop_threshold: u32,
    pub crash_loop_window: Duration,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub on_reduce_policy: OnReducePolicy,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub tick_url: String,
    pub position_url: String,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub base_url: String,
    pub api_key: String,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub aggregator: AggregatorSettings,
    pub hub: HubSettings,
    pub persistence: PersistenceSettings,
    pub breaker: BreakerSettings,
    pub supervisor: SupervisorSettings,
    pub cleanup: CleanupSettings,
    pub feed: FeedSettings,
    pub broker: BrokerSettings,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
}

impl Config {
    /// Loads `.env` (if present) then reads every field from the
    /// environment with the default named in spec §6, exactly the way
    /// the teacher's own config loader does it.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let timeframes = env::var("TIMEFRAMES")
            .ok()
            .map(|v| v.split(',').filter_map(|s| Timeframe::from_str(s.trim()).ok()).collect::<Vec<_>>())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(Timeframe::default_set);

        let on_reduce_policy = match env_or_string("CLEANUP_ON_REDUCE_POLICY", "cancel_all").as_str() {
            "modify_to_new_quantity" => OnReducePolicy::ModifyToNewQuantity,
            _ => OnReducePolicy::CancelAll,
        };

        Self {
            bind_addr: env_or_string("SERVER_BIND_ADDR", "0.0.0.0:8080"),
            aggregator: AggregatorSettings {
                timeframes,
                bar_ring_size: env_or("BAR_RING_SIZE", 240usize),
                persistence_high_water: env_or("PERSISTENCE_HIGH_WATER", 10_000usize),
            },
            hub: HubSettings {
                queue_size: env_or("HUB_QUEUE_SIZE", 500usize),
                slow_threshold_ratio: env_or("HUB_SLOW_THRESHOLD_RATIO", 0.9f64),
            },
            persistence: PersistenceSettings {
                db_path: env_or_string("PERSISTENCE_DB_PATH", "fno_core.db"),
                min_connections: env_or("PERSISTENCE_MIN_CONNECTIONS", 1u32),
                max_connections: env_or("PERSISTENCE_MAX_CONNECTIONS", 16u32),
                acquire_timeout: env_or_secs("PERSISTENCE_ACQUIRE_TIMEOUT_SECS", 5),
                query_timeout: env_or_secs("PERSISTENCE_QUERY_TIMEOUT_SECS", 60),
            },
            breaker: BreakerSettings {
                failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", 5u32),
                error_rate_window: env_or("BREAKER_ERROR_RATE_WINDOW", 20usize),
                error_rate_threshold: env_or("BREAKER_ERROR_RATE_THRESHOLD", 0.5f64),
                cooldown: env_or_secs("BREAKER_COOLDOWN_SECS", 60),
            },
            supervisor: SupervisorSettings {
                min_backoff: env_or_secs("SUPERVISOR_MIN_BACKOFF_SECS", 30),
                max_backoff: env_or_secs("SUPERVISOR_MAX_BACKOFF_SECS", 300),
                crash_loop_threshold: env_or("SUPERVISOR_CRASH_LOOP_THRESHOLD", 5u32),
                crash_loop_window: env_or_secs("SUPERVISOR_CRASH_LOOP_WINDOW_SECS", 600),
                drain_timeout: env_or_secs("SUPERVISOR_DRAIN_TIMEOUT_SECS", 30),
            },
            cleanup: CleanupSettings { on_reduce_policy },
            feed: FeedSettings {
                tick_url: env_or_string("FEED_TICK_URL", "wss://upstream.example/ticks"),
                position_url: env_or_string("FEED_POSITION_URL", "wss://upstream.example/positions"),
            },
            broker: BrokerSettings {
                base_url: env_or_string("BROKER_BASE_URL", "https://broker.example"),
                api_key: env_or_string("BROKER_API_KEY", ""),
                call_timeout: env_or_secs("BROKER_CALL_TIMEOUT_SECS", 10),
            },
            auth: AuthSettings { jwt_secret: env_or_string("AUTH_JWT_SECRET", "dev-secret-change-me") },
            rate_limit: RateLimitSettings {
                window: env_or_secs("RATE_LIMIT_WINDOW_SECS", 60),
                max_requests: env_or("RATE_LIMIT_MAX_REQUESTS", 100u32),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_section_6() {
        // Ensure no stray env vars from the test harness leak in.
        let c = Config {
            bind_addr: "0.0.0.0:8080".into(),
            aggregator: AggregatorSettings {
                timeframes: Timeframe::default_set(),
                bar_ring_size: 240,
                persistence_high_water: 10_000,
            },
            hub: HubSettings { queue_size: 500, slow_threshold_ratio: 0.9 },
            persistence: PersistenceSettings {
                db_path: "fno_core.db".into(),
                min_connections: 1,
                max_connections: 16,
                acquire_timeout: Duration::from_secs(5),
                query_timeout: Duration::from_secs(60),
            },
            breaker: BreakerSettings {
                failure_threshold: 5,
                error_rate_window: 20,
                error_rate_threshold: 0.5,
                cooldown: Duration::from_secs(60),
            },
            supervisor: SupervisorSettings {
                min_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(300),
                crash_loop_threshold: 5,
                crash_loop_window: Duration::from_secs(600),
                drain_timeout: Duration::from_secs(30),
            },
            cleanup: CleanupSettings { on_reduce_policy: OnReducePolicy::CancelAll },
            feed: FeedSettings {
                tick_url: "wss://upstream.example/ticks".into(),
                position_url: "wss://upstream.example/positions".into(),
            },
            broker: BrokerSettings {
                base_url: "https://broker.example".into(),
                api_key: String::new(),
                call_timeout: Duration::from_secs(10),
            },
            auth: AuthSettings { jwt_secret: "dev-secret-change-me".into() },
            rate_limit: RateLimitSettings { window: Duration::from_secs(60), max_requests: 100 },
        };
        assert_eq!(c.aggregator.bar_ring_size, 240);
        assert_eq!(c.hub.queue_size, 500);
    }
}
