//! 派发服务错误类型
//!
//! 派发流程中的每一种失败最终只归入两类：可重试与不可重试。
//! 分类决定消费端的处理方式，原始错误作为 source 完整保留，便于日志与死信排查。

use dispatch_shared::error::InfraError;

/// 可在线程间传递的原始错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 派发处理错误
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// 瞬时故障（库存服务 5xx、连接失败、发送超时等），同一条消息稍后重新投递可能成功
    #[error("可重试错误")]
    Retryable(#[source] BoxError),

    /// 重试无意义的失败（负载格式错误、库存服务 4xx、应答无法识别等）
    #[error("不可重试错误")]
    NotRetryable(#[source] BoxError),
}

impl DispatchError {
    pub fn retryable(cause: impl Into<BoxError>) -> Self {
        Self::Retryable(cause.into())
    }

    pub fn not_retryable(cause: impl Into<BoxError>) -> Self {
        Self::NotRetryable(cause.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// 分类名称，用于日志字段
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "RETRYABLE",
            Self::NotRetryable(_) => "NOT_RETRYABLE",
        }
    }

    /// 原始错误
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match self {
            Self::Retryable(cause) | Self::NotRetryable(cause) => cause.as_ref(),
        }
    }

    /// 分类与原始错误合并为一行，写入死信消息
    pub fn describe(&self) -> String {
        format!("{self}: {}", self.cause())
    }
}

/// 基础设施错误按其自身的可重试判定归类
impl From<InfraError> for DispatchError {
    fn from(err: InfraError) -> Self {
        if err.is_retryable() {
            Self::Retryable(Box::new(err))
        } else {
            Self::NotRetryable(Box::new(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = DispatchError::retryable("库存服务返回 503");
        assert_eq!(err.to_string(), "可重试错误");
        assert_eq!(err.cause().to_string(), "库存服务返回 503");

        let err = DispatchError::not_retryable(String::from("应答无法识别"));
        assert_eq!(err.to_string(), "不可重试错误");
        assert_eq!(err.cause().to_string(), "应答无法识别");
    }

    #[test]
    fn test_describe_includes_cause_once() {
        let err = DispatchError::retryable("库存服务返回 503");
        assert_eq!(err.describe(), "可重试错误: 库存服务返回 503");

        let err = DispatchError::from(InfraError::InvalidPayload("缺少 item 字段".to_string()));
        assert_eq!(err.describe(), "不可重试错误: 无效的消息负载: 缺少 item 字段");
        assert_eq!(err.describe().matches("缺少 item 字段").count(), 1);
    }

    #[test]
    fn test_kind_and_classification() {
        let err = DispatchError::retryable("timeout");
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "RETRYABLE");

        let err = DispatchError::not_retryable("bad request");
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "NOT_RETRYABLE");
    }

    #[test]
    fn test_source_preserves_original_cause() {
        let err = DispatchError::from(InfraError::InvalidPayload("缺少 item 字段".to_string()));

        let source = err.source().expect("should carry a source");
        assert_eq!(source.to_string(), "无效的消息负载: 缺少 item 字段");

        let infra = err
            .cause()
            .downcast_ref::<InfraError>()
            .expect("cause should be InfraError");
        assert_eq!(infra.code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn test_from_infra_error_keeps_retryability() {
        let timed_out = InfraError::Kafka(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageTimedOut,
        ));
        assert!(DispatchError::from(timed_out).is_retryable());

        let too_large = InfraError::Kafka(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        ));
        assert!(!DispatchError::from(too_large).is_retryable());

        let payload = InfraError::InvalidPayload("x".to_string());
        assert!(!DispatchError::from(payload).is_retryable());
    }
}
