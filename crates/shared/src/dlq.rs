//! 死信队列
//!
//! 不可重试或重新投递次数耗尽的入站消息会被确认并转存到死信 topic，
//! 附带失败原因与原始坐标，便于人工排查或离线回放。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::InfraError;
use crate::kafka::{ConsumerMessage, KafkaProducer};

// ---------------------------------------------------------------------------
// DeadLetterMessage：死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装原始消息，附加失败原因、投递次数等元数据。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 key，缺失时使用 topic-partition@offset
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    /// 原始负载（按 UTF-8 有损解码）
    pub payload: String,
    /// 失败原因
    pub error: String,
    /// 失败分类：RETRIES_EXHAUSTED / NOT_RETRYABLE
    pub reason: String,
    /// 进入死信前的投递次数
    pub delivery_attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    /// 由入站消息构造死信信封
    pub fn from_message(
        msg: &ConsumerMessage,
        error: impl Into<String>,
        reason: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: msg.key.clone().unwrap_or_else(|| msg.coordinates()),
            source_topic: msg.topic.clone(),
            source_partition: msg.partition,
            source_offset: msg.offset,
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            error: error.into(),
            reason: reason.into(),
            delivery_attempts: msg.delivery_attempt,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DlqProducer：将失败消息发送到死信队列
// ---------------------------------------------------------------------------

/// DLQ 生产者
///
/// 消费端放弃一条消息时调用此组件写入死信 topic，而非直接丢弃。
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    topic: String,
    source_service: String,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, topic: &str, source_service: &str) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
            source_service: source_service.to_string(),
        }
    }

    /// 将失败消息发送到死信队列
    pub async fn send_to_dlq(
        &self,
        msg: &ConsumerMessage,
        error: &str,
        reason: &str,
    ) -> Result<(), InfraError> {
        let dlq_msg = DeadLetterMessage::from_message(msg, error, reason, &self.source_service);

        self.producer
            .send_json(&self.topic, &dlq_msg.message_id, &dlq_msg)
            .await?;

        warn!(
            message_id = %dlq_msg.message_id,
            source_topic = %dlq_msg.source_topic,
            source_partition = dlq_msg.source_partition,
            source_offset = dlq_msg.source_offset,
            reason,
            error,
            "消息已发送到死信队列"
        );

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(key: Option<&str>) -> ConsumerMessage {
        ConsumerMessage {
            topic: "order.created".to_string(),
            partition: 2,
            offset: 17,
            key: key.map(String::from),
            payload: br#"{"orderId":"not-a-uuid"}"#.to_vec(),
            delivery_attempt: 4,
        }
    }

    #[test]
    fn test_dead_letter_message_from_message() {
        let msg = DeadLetterMessage::from_message(
            &make_message(Some("order-key-1")),
            "库存服务 503",
            "RETRIES_EXHAUSTED",
            "dispatch-service",
        );

        assert_eq!(msg.message_id, "order-key-1");
        assert_eq!(msg.source_topic, "order.created");
        assert_eq!(msg.source_partition, 2);
        assert_eq!(msg.source_offset, 17);
        assert_eq!(msg.payload, r#"{"orderId":"not-a-uuid"}"#);
        assert_eq!(msg.error, "库存服务 503");
        assert_eq!(msg.reason, "RETRIES_EXHAUSTED");
        assert_eq!(msg.delivery_attempts, 4);
        assert_eq!(msg.source_service, "dispatch-service");
    }

    #[test]
    fn test_dead_letter_message_without_key_uses_coordinates() {
        let msg = DeadLetterMessage::from_message(
            &make_message(None),
            "反序列化失败",
            "NOT_RETRYABLE",
            "dispatch-service",
        );
        assert_eq!(msg.message_id, "order.created-2@17");
    }

    #[test]
    fn test_dead_letter_serialization() {
        let msg = DeadLetterMessage::from_message(
            &make_message(Some("k")),
            "err",
            "NOT_RETRYABLE",
            "dispatch-service",
        );

        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("messageId"));
        assert!(json.contains("sourceTopic"));
        assert!(json.contains("sourcePartition"));
        assert!(json.contains("sourceOffset"));
        assert!(json.contains("deliveryAttempts"));
        assert!(json.contains("failedAt"));
        assert!(json.contains("sourceService"));

        let deserialized: DeadLetterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.message_id, "k");
        assert_eq!(deserialized.reason, "NOT_RETRYABLE");
    }
}
