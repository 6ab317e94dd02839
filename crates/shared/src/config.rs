//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::InfraError;
use crate::kafka::topics;
use crate::observability::ObservabilityConfig;
use crate::retry::RetryPolicy;

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    /// librdkafka 内部投递超时，超时后 send 返回 MessageTimedOut
    pub message_timeout_ms: u64,
    /// 本地发送队列已满时的排队等待上限
    pub send_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "dispatch.order.created.consumer".to_string(),
            auto_offset_reset: "earliest".to_string(),
            message_timeout_ms: 5000,
            send_timeout_ms: 5000,
        }
    }
}

impl KafkaConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Topic 配置
///
/// 入站、出站与死信 topic 均可由外部覆盖，默认值集中在 `kafka::topics`。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub order_created: String,
    pub order_dispatched: String,
    pub dispatch_tracking: String,
    pub dead_letter: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            order_created: topics::ORDER_CREATED.to_string(),
            order_dispatched: topics::ORDER_DISPATCHED.to_string(),
            dispatch_tracking: topics::DISPATCH_TRACKING.to_string(),
            dead_letter: topics::DEAD_LETTER.to_string(),
        }
    }
}

/// 库存服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StockServiceConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for StockServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9001/api/stock".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl StockServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 重新投递配置
///
/// 控制可重试失败时的退避节奏和次数上限，超过上限的消息进入死信 topic。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RedeliveryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub kafka: KafkaConfig,
    pub topics: TopicsConfig,
    pub stock_service: StockServiceConfig,
    pub redelivery: RedeliveryConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（仅注入进程环境变量，不存在时忽略）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（DISPATCH_ 前缀，双下划线分隔层级，如 DISPATCH_KAFKA__BROKERS -> kafka.brokers）
    pub fn load(service_name: &str) -> Result<Self, InfraError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("DISPATCH_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("DISPATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.observability.service_name = config.service_name.clone();

        Ok(config)
    }
}
