//! Environment-based configuration

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker identity; generated with a random suffix when `SFU_ID` is
    /// unset.
    pub worker_id: String,
    pub log_level: String,
    pub log_format: String,
    /// Legacy direct signaling endpoint. Logged for operators, never
    /// dialed: replies travel over the broker's reply topics.
    pub signaling_url: Option<String>,
    pub redis_cluster_nodes: Vec<String>,
    pub kafka_brokers: Vec<String>,
    pub stun_servers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub redis_connect_attempts: u32,
    pub redis_connect_delay: Duration,
    pub kafka_connect_attempts: u32,
    pub kafka_connect_delay: Duration,
    pub register_attempts: u32,
    pub register_delay: Duration,
    pub max_participants: usize,
}

const WORKER_ID_PREFIX: &str = "sfu-";

impl Config {
    pub fn from_env() -> Self {
        Self {
            worker_id: env::var("SFU_ID")
                .unwrap_or_else(|_| format!("{WORKER_ID_PREFIX}{}", nanoid::nanoid!(8))),
            log_level: env::var("SFU_LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            log_format: env::var("SFU_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            signaling_url: env::var("SIGNALING_SERVER_URL").ok(),
            redis_cluster_nodes: env_list(
                "REDIS_CLUSTER_NODES",
                "localhost:7000,localhost:7001,localhost:7002",
            ),
            kafka_brokers: env_list("KAFKA_BROKERS", "kafka1:9092,kafka2:9093,kafka3:9094"),
            stun_servers: env_list("STUN_SERVERS", "stun:stun.l.google.com:19302"),
            heartbeat_interval: Duration::from_secs(5),
            redis_connect_attempts: 5,
            redis_connect_delay: Duration::from_secs(2),
            kafka_connect_attempts: 5,
            kafka_connect_delay: Duration::from_secs(2),
            register_attempts: 3,
            register_delay: Duration::from_secs(1),
            max_participants: 10,
        }
    }
}

fn env_list(key: &str, fallback: &str) -> Vec<String> {
    let value = env::var(key).unwrap_or_else(|_| fallback.to_string());
    split_list(&value)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_comma_lists() {
        assert_eq!(
            split_list("kafka1:9092, kafka2:9093 ,kafka3:9094"),
            vec!["kafka1:9092", "kafka2:9093", "kafka3:9094"]
        );
    }

    #[test]
    fn drops_empty_entries() {
        assert_eq!(split_list("a,,b,"), vec!["a", "b"]);
        assert!(split_list("").is_empty());
    }
}
