//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射、offset 提交与优雅关闭语义，避免各服务重复编写样板代码。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::Offset;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::InfraError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 默认 topic 名称，可通过 `TopicsConfig` 覆盖
pub mod topics {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_DISPATCHED: &str = "order.dispatched";
    pub const DISPATCH_TRACKING: &str = "dispatch.tracking";
    pub const DEAD_LETTER: &str = "order.created.dlt";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    /// 第几次投递（首次为 1），回退 offset 重新投递时递增
    pub delivery_attempt: u32,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>, delivery_attempt: u32) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            delivery_attempt,
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, InfraError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| InfraError::InvalidPayload(format!("负载反序列化失败: {e}")))
    }

    /// 消息在 topic 内的唯一坐标，用于日志与死信消息 ID
    pub fn coordinates(&self) -> String {
        format!("{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `acks=all` 保证 send 返回时消息已被 ISR 全部确认；
    /// `message.timeout.ms` 之后仍未确认则以 MessageTimedOut 失败返回。
    pub fn new(config: &KafkaConfig) -> Result<Self, InfraError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .create()?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            send_timeout: config.send_timeout(),
        })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), InfraError> {
        self.send_with(topic, key, None, payload, &[]).await
    }

    /// 发送消息，可选指定分区并附加 header
    ///
    /// 返回 broker 确认后的 (partition, offset)。
    pub async fn send_with(
        &self,
        topic: &str,
        key: &str,
        partition: Option<i32>,
        payload: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<(i32, i64), InfraError> {
        let mut owned_headers = OwnedHeaders::new();
        for &(name, value) in headers {
            owned_headers = owned_headers.insert(Header {
                key: name,
                value: Some(value),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(owned_headers);
        let record = match partition {
            Some(p) => record.partition(p),
            None => record,
        };

        // rdkafka 0.39+ 返回 Delivery 结构体而非元组
        let delivery = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| InfraError::Kafka(e))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), InfraError> {
        let payload = serde_json::to_vec(value)?;

        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// Disposition：单条消息的处理结论
// ---------------------------------------------------------------------------

/// handler 对单条消息给出的处理结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 确认消息：存储 offset，随下一次自动提交生效
    Commit,
    /// 不确认消息：等待 backoff 后回退到该 offset 重新投递
    Redeliver { backoff: Duration },
}

/// 记录每个分区上正在重新投递的消息及其投递次数
///
/// 同一分区同一时刻至多有一条消息处于重新投递中（回退 offset 后其后的消息不会先被处理），
/// 因此按 (topic, partition) 记一条即可。
#[derive(Debug, Default)]
pub struct DeliveryAttempts {
    pending: HashMap<(String, i32), (i64, u32)>,
}

impl DeliveryAttempts {
    /// 收到一条消息时调用，返回这是它的第几次投递
    pub fn begin(&mut self, topic: &str, partition: i32, offset: i64) -> u32 {
        match self.pending.get(&(topic.to_string(), partition)) {
            Some((pending_offset, attempts)) if *pending_offset == offset => attempts + 1,
            _ => 1,
        }
    }

    /// 消息将被重新投递，记下本次的投递次数
    pub fn schedule_redelivery(&mut self, topic: &str, partition: i32, offset: i64, attempt: u32) {
        self.pending
            .insert((topic.to_string(), partition), (offset, attempt));
    }

    /// 消息已确认，清除该分区的重新投递记录
    pub fn settle(&mut self, topic: &str, partition: i32) {
        self.pending.remove(&(topic.to_string(), partition));
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义。
/// offset 只在 handler 明确确认后才存储（`enable.auto.offset.store=false`），
/// 保证至少一次投递。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组。
    /// 同组实例分摊分区，不同组各自收到全量消息。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, InfraError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), InfraError> {
        self.consumer.subscribe(topics)?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - 收到消息时调用 handler，按其返回的 `Disposition` 存储 offset 或回退重新投递。
    /// - 关闭信号变为 `true` 时退出循环，正在执行的 handler 会先自然完成。
    /// - 回退 offset 失败时返回错误，未确认的消息在重启后从已提交位置重新投递。
    pub async fn start<F, Fut>(
        self,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) -> Result<(), InfraError>
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Disposition>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        let mut attempts = DeliveryAttempts::default();

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let msg = match msg_result {
                        Ok(borrowed_msg) => {
                            let attempt = attempts.begin(
                                borrowed_msg.topic(),
                                borrowed_msg.partition(),
                                borrowed_msg.offset(),
                            );
                            ConsumerMessage::from_borrowed(&borrowed_msg, attempt)
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        delivery_attempt = msg.delivery_attempt,
                        "收到 Kafka 消息"
                    );

                    let (topic, partition, offset, attempt) =
                        (msg.topic.clone(), msg.partition, msg.offset, msg.delivery_attempt);

                    let disposition = handler(msg).await;

                    if let Disposition::Redeliver { backoff } = disposition {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                    }

                    if let Err(e) = apply_disposition(
                        &self.consumer,
                        &mut attempts,
                        &topic,
                        partition,
                        offset,
                        attempt,
                        disposition,
                    ) {
                        error!(
                            error = %e,
                            topic = %topic,
                            partition,
                            offset,
                            "回退 offset 失败，停止消费，重启后从已提交的 offset 继续"
                        );
                        return Err(e);
                    }

                    // 退避期间收到的关闭信号已被上面的 select 消费，需在此处检查
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// offset 处置
// ---------------------------------------------------------------------------

/// 回退 offset 的最大尝试次数
const SEEK_ATTEMPTS: u32 = 3;

/// 消费端对单个分区 offset 的两种操作
pub trait OffsetControl {
    /// 存储下一条待消费消息的 offset，随自动提交生效
    fn store_next(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), KafkaError>;

    /// 将分区的读取位置回退到指定 offset
    fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError>;
}

impl OffsetControl for StreamConsumer {
    fn store_next(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), KafkaError> {
        self.store_offset(topic, partition, next_offset)
    }

    fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError> {
        self.seek(topic, partition, Offset::Offset(offset), Duration::from_secs(5))
    }
}

/// 按 handler 的结论处置一条消息的 offset
///
/// - `Commit`：存储 offset + 1。存储失败只会导致重复投递，记录日志后继续。
/// - `Redeliver`：回退到该 offset。多次尝试仍失败时返回错误，调用方必须停止消费该分区，
///   否则后续消息的确认会越过这条未确认的消息。
pub fn apply_disposition(
    offsets: &impl OffsetControl,
    attempts: &mut DeliveryAttempts,
    topic: &str,
    partition: i32,
    offset: i64,
    attempt: u32,
    disposition: Disposition,
) -> Result<(), InfraError> {
    match disposition {
        Disposition::Commit => {
            attempts.settle(topic, partition);
            if let Err(e) = offsets.store_next(topic, partition, offset + 1) {
                error!(
                    error = %e,
                    topic,
                    partition,
                    offset,
                    "存储 offset 失败，消息可能被重复投递"
                );
            }
            Ok(())
        }
        Disposition::Redeliver { .. } => {
            attempts.schedule_redelivery(topic, partition, offset, attempt);

            let mut last_error = None;
            for seek_attempt in 1..=SEEK_ATTEMPTS {
                match offsets.rewind(topic, partition, offset) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(error = %e, topic, partition, offset, seek_attempt, "回退 offset 失败");
                        last_error = Some(e);
                    }
                }
            }

            Err(InfraError::Kafka(last_error.unwrap_or_else(|| {
                KafkaError::Seek("回退 offset 失败".to_string())
            })))
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
