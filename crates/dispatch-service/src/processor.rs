//! 订单派发处理器
//!
//! 对单个 OrderCreated 事件执行完整的派发流程：
//! 1. 查询库存可用性，不可发货则直接结束
//! 2. 发送 DispatchPreparing 到追踪 topic
//! 3. 发送 OrderDispatched 到结果 topic（与入站消息同分区）
//! 4. 发送 DispatchCompleted 到追踪 topic
//!
//! 每一步在上一步得到 broker 确认后才开始，任何一步失败都会立即中止后续步骤，
//! 错误原样返回给消费端决定重新投递或转入死信。
//! 重新投递时已成功的前序步骤会再次执行，下游追踪消费者需按 orderId 幂等处理。

use std::fmt;
use std::sync::Arc;

use dispatch_shared::config::TopicsConfig;
use dispatch_shared::events::{
    DispatchCompleted, DispatchPreparing, OrderCreated, OrderDispatched, OutboundMessage,
};
use dispatch_shared::kafka::topics;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::publisher::EventPublisher;
use crate::stock_client::{AvailabilityOracle, parse_availability};

/// 进程实例标识
///
/// 启动时生成一次，写入每条 OrderDispatched 的 processedBy 字段，
/// 用于区分多个派发实例的产出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessingIdentity(Uuid);

impl ProcessingIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ProcessingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 派发流程写出的两个 topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTopics {
    pub dispatch_tracking: String,
    pub order_dispatched: String,
}

impl Default for DispatchTopics {
    fn default() -> Self {
        Self {
            dispatch_tracking: topics::DISPATCH_TRACKING.to_string(),
            order_dispatched: topics::ORDER_DISPATCHED.to_string(),
        }
    }
}

impl From<&TopicsConfig> for DispatchTopics {
    fn from(config: &TopicsConfig) -> Self {
        Self {
            dispatch_tracking: config.dispatch_tracking.clone(),
            order_dispatched: config.order_dispatched.clone(),
        }
    }
}

/// 单个订单的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 三条消息均已确认
    Dispatched,
    /// 库存不可发货，未写出任何消息
    Unavailable,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Unavailable => "unavailable",
        }
    }
}

/// 派发编排器
///
/// 只持有 trait object，消费端与测试可以注入任意实现。
pub struct DispatchService {
    oracle: Arc<dyn AvailabilityOracle>,
    publisher: Arc<dyn EventPublisher>,
    topics: DispatchTopics,
    identity: ProcessingIdentity,
}

impl DispatchService {
    pub fn new(
        oracle: Arc<dyn AvailabilityOracle>,
        publisher: Arc<dyn EventPublisher>,
        topics: DispatchTopics,
        identity: ProcessingIdentity,
    ) -> Self {
        Self {
            oracle,
            publisher,
            topics,
            identity,
        }
    }

    pub fn identity(&self) -> ProcessingIdentity {
        self.identity
    }

    /// 处理一个 OrderCreated 事件
    ///
    /// `partition` 为入站消息所在分区，OrderDispatched 固定写入同号分区；
    /// 为 None 时交由 key 决定分区。`key` 作为三条出站消息的 key。
    pub async fn process(
        &self,
        partition: Option<i32>,
        key: &str,
        order: &OrderCreated,
    ) -> Result<DispatchOutcome, DispatchError> {
        let answer = self.oracle.check_availability(&order.item).await?;

        if !parse_availability(&answer)? {
            info!(
                order_id = %order.order_id,
                item = %order.item,
                "商品不可发货，跳过派发"
            );
            return Ok(DispatchOutcome::Unavailable);
        }

        let preparing = OutboundMessage::from(DispatchPreparing {
            order_id: order.order_id,
        });
        self.publisher
            .publish(&self.topics.dispatch_tracking, key, &preparing)
            .await?;
        debug!(order_id = %order.order_id, "DispatchPreparing 已确认");

        let dispatched = OutboundMessage::from(OrderDispatched::from_order(
            order,
            self.identity.as_uuid(),
        ));
        match partition {
            Some(p) => {
                self.publisher
                    .publish_to_partition(&self.topics.order_dispatched, p, key, &dispatched)
                    .await?
            }
            None => {
                self.publisher
                    .publish(&self.topics.order_dispatched, key, &dispatched)
                    .await?
            }
        };
        debug!(order_id = %order.order_id, "OrderDispatched 已确认");

        let completed = OutboundMessage::from(DispatchCompleted::today(order.order_id));
        self.publisher
            .publish(&self.topics.dispatch_tracking, key, &completed)
            .await?;

        info!(
            order_id = %order.order_id,
            item = %order.item,
            key,
            processed_by = %self.identity,
            "订单派发完成"
        );

        Ok(DispatchOutcome::Dispatched)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
