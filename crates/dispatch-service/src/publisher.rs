//! 出站消息发布
//!
//! EventPublisher 抽象"发送并等待确认"，派发流程依赖它保证三条消息的先后顺序：
//! 只有上一条得到 broker 确认后才会发送下一条。

use std::sync::Arc;

use async_trait::async_trait;
use dispatch_shared::error::InfraError;
use dispatch_shared::events::{MESSAGE_TYPE_HEADER, OutboundMessage};
use dispatch_shared::kafka::KafkaProducer;
use dispatch_shared::observability::metrics;
use tracing::{debug, error};

use crate::error::DispatchError;

/// broker 对一条消息的确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    pub partition: i32,
    pub offset: i64,
}

/// 出站消息发布接口
///
/// 两个方法都在 broker 确认后才返回，失败按可重试/不可重试归类。
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 发布到 topic，由 key 决定分区
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError>;

    /// 发布到 topic 的指定分区
    async fn publish_to_partition(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError>;
}

/// 一条待发送的出站记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundRecord<'a> {
    pub topic: &'a str,
    pub key: &'a str,
    /// 为 None 时由 key 决定分区
    pub partition: Option<i32>,
    pub payload: &'a [u8],
    pub headers: &'a [(&'a str, &'a str)],
}

/// 底层发送通道，返回 broker 确认后的 (partition, offset)
#[async_trait]
pub trait RecordSender: Send + Sync {
    async fn send_record(&self, record: OutboundRecord<'_>) -> Result<(i32, i64), InfraError>;
}

#[async_trait]
impl RecordSender for KafkaProducer {
    async fn send_record(&self, record: OutboundRecord<'_>) -> Result<(i32, i64), InfraError> {
        self.send_with(
            record.topic,
            record.key,
            record.partition,
            record.payload,
            record.headers,
        )
        .await
    }
}

/// 基于 Kafka 的发布实现
///
/// 负载为消息自身的 JSON，类型名写入 `message-type` header。
#[derive(Clone)]
pub struct KafkaEventPublisher {
    sender: Arc<dyn RecordSender>,
}

impl KafkaEventPublisher {
    pub fn new(producer: KafkaProducer) -> Self {
        Self::with_sender(Arc::new(producer))
    }

    pub fn with_sender(sender: Arc<dyn RecordSender>) -> Self {
        Self { sender }
    }

    async fn send(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError> {
        let message_type = message.message_type();
        let payload = message.to_json()?;

        let (partition, offset) = self
            .sender
            .send_record(OutboundRecord {
                topic,
                key,
                partition,
                payload: &payload,
                headers: &[(MESSAGE_TYPE_HEADER, message_type)],
            })
            .await
            .map_err(|e| {
                error!(
                    topic,
                    key,
                    message_type,
                    order_id = %message.order_id(),
                    error = %e,
                    "出站消息发送失败"
                );
                DispatchError::from(e)
            })?;

        metrics::record_message_published(topic, message_type);

        debug!(topic, key, message_type, partition, offset, "出站消息已确认");

        Ok(Acknowledgment { partition, offset })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError> {
        self.send(topic, None, key, message).await
    }

    async fn publish_to_partition(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError> {
        self.send(topic, Some(partition), key, message).await
    }
}
