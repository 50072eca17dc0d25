use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub ingestion: IngestionConfig,
    pub detection: DetectionConfig,
    pub prediction: PredictionConfig,
    pub severity_weights: SeverityWeights,
    pub rate_limits: RateLimitConfig,
    pub executor: ExecutorConfig,
    pub hub: HubConfig,
    pub ai: AiConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: String,
    pub position_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub max_clock_skew_secs: i64,
    pub enqueue_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub alert_window_secs: u64,
    pub safety_buffer_secs: u64,
    pub junction_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    pub horizon_secs: u64,
    pub travel_time_floor_speed_kmh: f32,
    pub travel_time_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityWeights {
    pub time: f64,
    pub priority: f64,
    pub passengers: f64,
    pub network: f64,
    pub safety: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub critical_per_minute: u32,
    pub standard_per_minute: u32,
    pub manual_detection_per_minute: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub pool_size: usize,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub shards: usize,
    pub max_client_backlog: usize,
    pub hard_client_backlog: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    pub default_strategy: Option<String>,
    pub inline_timeout_ms: u64,
    pub background_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                cors_enabled: true,
            },
            store: StoreConfig {
                path: "data/engine-store".to_string(),
                position_retention_days: 30,
            },
            ingestion: IngestionConfig {
                queue_capacity: 1024,
                worker_count: 4,
                max_clock_skew_secs: 5,
                enqueue_wait_ms: 100,
            },
            detection: DetectionConfig {
                interval_secs: 30,
                timeout_secs: 10,
                alert_window_secs: 300,
                safety_buffer_secs: 120,
                junction_window_secs: 120,
            },
            prediction: PredictionConfig {
                horizon_secs: 3600,
                travel_time_floor_speed_kmh: 10.0,
                travel_time_margin: 1.2,
            },
            severity_weights: SeverityWeights {
                time: 3.0,
                priority: 2.0,
                passengers: 2.5,
                network: 1.5,
                safety: 1.0,
            },
            rate_limits: RateLimitConfig {
                critical_per_minute: 10,
                standard_per_minute: 30,
                manual_detection_per_minute: 5,
                window_secs: 60,
            },
            executor: ExecutorConfig {
                pool_size: 8,
                max_retries: 3,
                backoff_base_secs: 1,
            },
            hub: HubConfig {
                shards: 8,
                max_client_backlog: 256,
                hard_client_backlog: 1024,
            },
            ai: AiConfig {
                enabled: false,
                default_strategy: None,
                inline_timeout_ms: 2_000,
                background_timeout_ms: 30_000,
            },
            security: SecurityConfig {
                jwt_secret: "change-me-before-production-use-0000".to_string(),
                jwt_expiry_hours: 12,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// Load defaults, then apply environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = EngineConfig::default();

        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            config.server.port = port.parse()?;
        }
        if let Ok(path) = std::env::var("STORE_PATH") {
            config.store.path = path;
        }
        if let Ok(interval) = std::env::var("DETECTION_INTERVAL_SECS") {
            config.detection.interval_secs = interval.parse()?;
        }
        if let Ok(horizon) = std::env::var("PREDICTION_HORIZON_SECS") {
            config.prediction.horizon_secs = horizon.parse()?;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.security.jwt_secret = secret;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port cannot be 0"));
        }
        if self.security.jwt_secret.len() < 32 {
            return Err(anyhow::anyhow!("JWT secret must be at least 32 characters"));
        }
        if self.detection.interval_secs == 0 {
            return Err(anyhow::anyhow!("detection interval must be greater than 0"));
        }
        if self.detection.timeout_secs >= self.detection.interval_secs {
            return Err(anyhow::anyhow!(
                "detection timeout must be shorter than the detection interval"
            ));
        }
        if self.prediction.travel_time_floor_speed_kmh <= 0.0 {
            return Err(anyhow::anyhow!("travel time floor speed must be positive"));
        }
        if self.prediction.travel_time_margin < 1.0 {
            return Err(anyhow::anyhow!("travel time margin must be >= 1.0"));
        }
        if self.hub.shards == 0 || self.executor.pool_size == 0 || self.ingestion.worker_count == 0 {
            return Err(anyhow::anyhow!("worker pool sizes must be greater than 0"));
        }
        if self.hub.hard_client_backlog < self.hub.max_client_backlog {
            return Err(anyhow::anyhow!(
                "hard client backlog must be at least the soft backlog"
            ));
        }
        let w = &self.severity_weights;
        if w.time < 0.0 || w.priority < 0.0 || w.passengers < 0.0 || w.network < 0.0 || w.safety < 0.0 {
            return Err(anyhow::anyhow!("severity weights must be non-negative"));
        }
        Ok(())
    }

    pub fn server_bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
