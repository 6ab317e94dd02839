//! 测试工具模块
//!
//! 提供派发流程各协作方的内存实现，单元测试与 tests/ 下的集成测试共用，
//! 无需真实的 Kafka 与库存服务即可驱动完整的处理链路。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dispatch_shared::error::InfraError;
use dispatch_shared::events::{OrderCreated, OutboundMessage};
use dispatch_shared::kafka::ConsumerMessage;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::consumer::DeadLetterSink;
use crate::error::DispatchError;
use crate::publisher::{Acknowledgment, EventPublisher};
use crate::stock_client::AvailabilityOracle;

/// 构造错误的工厂，DispatchError 不可 Clone，每次失败时重新生成
pub type ErrorFactory = Arc<dyn Fn() -> DispatchError + Send + Sync>;

/// 构造一条入站 OrderCreated 消息
pub fn order_created_message(
    order: &OrderCreated,
    key: Option<&str>,
    partition: i32,
    offset: i64,
    delivery_attempt: u32,
) -> ConsumerMessage {
    ConsumerMessage {
        topic: "order.created".to_string(),
        partition,
        offset,
        key: key.map(String::from),
        payload: serde_json::to_vec(order).unwrap_or_default(),
        delivery_attempt,
    }
}

/// 构造负载为任意字节的入站消息
pub fn raw_message(payload: &[u8], key: Option<&str>, delivery_attempt: u32) -> ConsumerMessage {
    ConsumerMessage {
        topic: "order.created".to_string(),
        partition: 0,
        offset: 0,
        key: key.map(String::from),
        payload: payload.to_vec(),
        delivery_attempt,
    }
}

// ==================== 发布端 ====================

/// 一次发布调用
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: String,
    /// 调用方指定的分区，未指定时为 None
    pub partition: Option<i32>,
    pub message: OutboundMessage,
}

/// 记录所有发布调用的内存发布器
///
/// 可按消息类型注入失败，`attempts` 含失败的调用，`published` 只含已确认的调用。
#[derive(Default)]
pub struct RecordingPublisher {
    attempts: RwLock<Vec<PublishedRecord>>,
    published: RwLock<Vec<PublishedRecord>>,
    failures: RwLock<HashMap<&'static str, ErrorFactory>>,
    next_offset: AtomicI64,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定类型的消息发送时返回 `make_error` 生成的错误
    pub async fn fail_on(
        &self,
        message_type: &'static str,
        make_error: impl Fn() -> DispatchError + Send + Sync + 'static,
    ) {
        self.failures
            .write()
            .await
            .insert(message_type, Arc::new(make_error));
    }

    /// 清除所有注入的失败，模拟故障恢复
    pub async fn recover(&self) {
        self.failures.write().await.clear();
    }

    pub async fn attempts(&self) -> Vec<PublishedRecord> {
        self.attempts.read().await.clone()
    }

    pub async fn published(&self) -> Vec<PublishedRecord> {
        self.published.read().await.clone()
    }

    async fn record(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError> {
        let record = PublishedRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            partition,
            message: message.clone(),
        };
        self.attempts.write().await.push(record.clone());

        if let Some(make_error) = self.failures.read().await.get(message.message_type()) {
            return Err(make_error());
        }

        self.published.write().await.push(record);

        Ok(Acknowledgment {
            partition: partition.unwrap_or(0),
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError> {
        self.record(topic, None, key, message).await
    }

    async fn publish_to_partition(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        message: &OutboundMessage,
    ) -> Result<Acknowledgment, DispatchError> {
        self.record(topic, Some(partition), key, message).await
    }
}

// ==================== 库存服务 ====================

/// 固定应答的库存服务
pub struct StaticOracle {
    answer: Result<String, ErrorFactory>,
    queried: RwLock<Vec<String>>,
}

impl StaticOracle {
    /// 每次查询都返回给定的应答文本
    pub fn answering(body: &str) -> Self {
        Self {
            answer: Ok(body.to_string()),
            queried: RwLock::new(Vec::new()),
        }
    }

    /// 每次查询都返回 `make_error` 生成的错误
    pub fn failing(make_error: impl Fn() -> DispatchError + Send + Sync + 'static) -> Self {
        Self {
            answer: Err(Arc::new(make_error)),
            queried: RwLock::new(Vec::new()),
        }
    }

    /// 被查询过的商品，按调用顺序
    pub async fn queried(&self) -> Vec<String> {
        self.queried.read().await.clone()
    }
}

#[async_trait]
impl AvailabilityOracle for StaticOracle {
    async fn check_availability(&self, item: &str) -> Result<String, DispatchError> {
        self.queried.write().await.push(item.to_string());

        match &self.answer {
            Ok(body) => Ok(body.clone()),
            Err(make_error) => Err(make_error()),
        }
    }
}

// ==================== 死信 ====================

/// 写入死信的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub message_id: String,
    pub offset: i64,
    pub delivery_attempt: u32,
    pub error: String,
    pub reason: String,
}

/// 记录死信调用的内存实现
#[derive(Default)]
pub struct RecordingDeadLetterSink {
    records: RwLock<Vec<DeadLetterRecord>>,
    unavailable: bool,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次写入都失败的死信通道
    pub fn unavailable() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            unavailable: true,
        }
    }

    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn dead_letter(
        &self,
        msg: &ConsumerMessage,
        error: &DispatchError,
        reason: &str,
    ) -> Result<(), InfraError> {
        if self.unavailable {
            return Err(InfraError::Internal("死信 topic 不可用".to_string()));
        }

        self.records.write().await.push(DeadLetterRecord {
            message_id: msg.key.clone().unwrap_or_else(|| msg.coordinates()),
            offset: msg.offset,
            delivery_attempt: msg.delivery_attempt,
            error: error.describe(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// 随机订单
pub fn random_order(item: &str) -> OrderCreated {
    OrderCreated::new(Uuid::new_v4(), item)
}
