//! Kafka 消费者与失败处理
//!
//! 将 order.created 上的消息解码为 OrderCreated 并交给 DispatchService，
//! 再根据处理结果决定消息的去向：
//! - 成功（含不可发货）-> 确认
//! - 可重试失败且未超过次数上限 -> 退避后回退 offset 重新投递
//! - 不可重试失败或重新投递次数耗尽 -> 写入死信 topic 后确认

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dispatch_shared::config::AppConfig;
use dispatch_shared::dlq::DlqProducer;
use dispatch_shared::error::InfraError;
use dispatch_shared::events::OrderCreated;
use dispatch_shared::kafka::{ConsumerMessage, Disposition, KafkaConsumer};
use dispatch_shared::observability::metrics;
use dispatch_shared::retry::RetryPolicy;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::processor::{DispatchOutcome, DispatchService};

/// 死信原因：错误本身不可重试
pub const REASON_NOT_RETRYABLE: &str = "NOT_RETRYABLE";
/// 死信原因：可重试错误但重新投递次数已用完
pub const REASON_RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";

// ---------------------------------------------------------------------------
// 重试决策
// ---------------------------------------------------------------------------

/// 对一次处理结果的决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Acknowledge,
    Redeliver { backoff: Duration },
    DeadLetter { reason: &'static str },
}

/// 根据处理结果、当前投递次数与退避策略做出决策
///
/// `delivery_attempt` 从 1 开始，已失败的重新投递次数为 `delivery_attempt - 1`。
pub fn decide(
    result: &Result<DispatchOutcome, DispatchError>,
    delivery_attempt: u32,
    policy: &RetryPolicy,
) -> RetryDecision {
    match result {
        Ok(_) => RetryDecision::Acknowledge,
        Err(err) if err.is_retryable() => {
            let redelivered = delivery_attempt.saturating_sub(1);
            if policy.should_retry(redelivered) {
                RetryDecision::Redeliver {
                    backoff: policy.delay_for_attempt(redelivered),
                }
            } else {
                RetryDecision::DeadLetter {
                    reason: REASON_RETRIES_EXHAUSTED,
                }
            }
        }
        Err(_) => RetryDecision::DeadLetter {
            reason: REASON_NOT_RETRYABLE,
        },
    }
}

// ---------------------------------------------------------------------------
// 死信通道抽象
// ---------------------------------------------------------------------------

/// 死信写入接口，生产环境由 DlqProducer 实现
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(
        &self,
        msg: &ConsumerMessage,
        error: &DispatchError,
        reason: &str,
    ) -> Result<(), InfraError>;
}

#[async_trait]
impl DeadLetterSink for DlqProducer {
    async fn dead_letter(
        &self,
        msg: &ConsumerMessage,
        error: &DispatchError,
        reason: &str,
    ) -> Result<(), InfraError> {
        self.send_to_dlq(msg, &error.describe(), reason).await
    }
}

// ---------------------------------------------------------------------------
// OrderCreatedHandler
// ---------------------------------------------------------------------------

/// 单条入站消息的处理器
///
/// 与 Kafka 消费循环解耦，测试中直接以 ConsumerMessage 驱动。
pub struct OrderCreatedHandler {
    service: DispatchService,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
}

impl OrderCreatedHandler {
    pub fn new(
        service: DispatchService,
        dead_letters: Arc<dyn DeadLetterSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            dead_letters,
            policy,
        }
    }

    /// 处理一条消息并给出 offset 的处置方式
    pub async fn handle(&self, msg: ConsumerMessage) -> Disposition {
        metrics::record_order_received();
        let start = Instant::now();

        let result = self.dispatch(&msg).await;
        let decision = decide(&result, msg.delivery_attempt, &self.policy);

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(e) if e.is_retryable() => "retryable_error",
            Err(_) => "not_retryable_error",
        };
        metrics::record_dispatch_outcome(outcome, start.elapsed().as_secs_f64());

        match (decision, result) {
            (RetryDecision::Acknowledge, _) => Disposition::Commit,
            (RetryDecision::Redeliver { backoff }, Err(e)) => {
                warn!(
                    coordinates = %msg.coordinates(),
                    delivery_attempt = msg.delivery_attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    kind = e.kind(),
                    cause = %e.cause(),
                    "派发遇到可重试错误，稍后重新投递"
                );
                metrics::record_redelivery();
                Disposition::Redeliver { backoff }
            }
            (RetryDecision::DeadLetter { reason }, Err(e)) => {
                self.dead_letter(&msg, &e, reason).await;
                Disposition::Commit
            }
            // decide 只在处理失败时返回 Redeliver/DeadLetter
            (_, Ok(_)) => Disposition::Commit,
        }
    }

    /// 解码并执行派发，处理过程中的 panic 视为不可重试错误
    async fn dispatch(&self, msg: &ConsumerMessage) -> Result<DispatchOutcome, DispatchError> {
        let order: OrderCreated = msg.deserialize_payload()?;

        let key = msg
            .key
            .clone()
            .unwrap_or_else(|| order.order_id.to_string());

        info!(
            order_id = %order.order_id,
            item = %order.item,
            key = %key,
            partition = msg.partition,
            offset = msg.offset,
            delivery_attempt = msg.delivery_attempt,
            "收到订单创建事件"
        );

        AssertUnwindSafe(self.service.process(Some(msg.partition), &key, &order))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(DispatchError::not_retryable(format!(
                    "派发处理发生 panic: {}",
                    panic_message(panic.as_ref())
                )))
            })
    }

    async fn dead_letter(&self, msg: &ConsumerMessage, err: &DispatchError, reason: &'static str) {
        error!(
            coordinates = %msg.coordinates(),
            key = msg.key.as_deref().unwrap_or_default(),
            delivery_attempt = msg.delivery_attempt,
            reason,
            kind = err.kind(),
            cause = %err.cause(),
            "派发失败，消息转入死信队列"
        );
        metrics::record_dead_letter(reason);

        if let Err(e) = self.dead_letters.dead_letter(msg, err, reason).await {
            error!(
                coordinates = %msg.coordinates(),
                error = %e,
                "写入死信队列失败，消息仍将被确认"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// OrderDispatchConsumer
// ---------------------------------------------------------------------------

/// 订单创建事件消费者
///
/// 组合 KafkaConsumer（消息拉取与 offset 管理）与 OrderCreatedHandler（业务处理）。
pub struct OrderDispatchConsumer {
    consumer: KafkaConsumer,
    handler: OrderCreatedHandler,
    topic: String,
}

impl OrderDispatchConsumer {
    pub fn new(config: &AppConfig, handler: OrderCreatedHandler) -> Result<Self, InfraError> {
        let consumer = KafkaConsumer::new(&config.kafka, None)?;
        Ok(Self {
            consumer,
            handler,
            topic: config.topics.order_created.clone(),
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), InfraError> {
        self.consumer.subscribe(&[self.topic.as_str()])?;

        info!(topic = %self.topic, "订单派发消费者已启动");

        let handler = self.handler;

        self.consumer
            .start(shutdown, |msg| {
                let handler = &handler;
                async move { handler.handle(msg).await }
            })
            .await?;

        info!("订单派发消费者已停止");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
