//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 每个变体都自带"是否可重试"的判定，供上层错误分类直接复用。

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum InfraError {
    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(#[from] KafkaError),

    // ==================== 序列化错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("无效的消息负载: {0}")]
    InvalidPayload(String),

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

impl InfraError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有 Kafka 投递类错误可能是瞬时的；序列化、负载和配置错误重放后结果不变。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kafka(err) => is_transient_kafka_error(err),
            _ => false,
        }
    }
}

/// 判断 Kafka 错误是否为瞬时故障
///
/// 生产端错误默认视为瞬时（超时、队列满、broker 不可达），
/// 但消息过大、消息非法、鉴权失败这类错误无论重试多少次都会失败。
fn is_transient_kafka_error(err: &KafkaError) -> bool {
    match err {
        KafkaError::MessageProduction(code) => !matches!(
            code,
            RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::InvalidMessageSize
                | RDKafkaErrorCode::InvalidMessage
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
        ),
        KafkaError::Canceled | KafkaError::Flush(_) | KafkaError::Seek(_) => true,
        _ => false,
    }
}
