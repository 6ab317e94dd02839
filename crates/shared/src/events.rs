//! 订单派发链路的消息模型
//!
//! 定义入站的 OrderCreated 事件以及派发后写出的三类出站消息。
//! 字段统一使用 camelCase 序列化，与上游订单系统的 JSON 格式保持一致。

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InfraError;

/// 出站消息携带的类型 header 名称
///
/// tracking topic 上同时存在 DispatchPreparing 与 DispatchCompleted 两种记录，
/// 下游通过该 header 区分，无需解析负载。
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

// ---------------------------------------------------------------------------
// 入站事件
// ---------------------------------------------------------------------------

/// 订单已创建事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub item: String,
}

impl OrderCreated {
    pub fn new(order_id: Uuid, item: impl Into<String>) -> Self {
        Self {
            order_id,
            item: item.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// 出站消息
// ---------------------------------------------------------------------------

/// 派发准备中的追踪记录，仅携带关联 ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPreparing {
    pub order_id: Uuid,
}

/// 订单派发结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDispatched {
    pub order_id: Uuid,
    pub item: String,
    pub notes: String,
    /// 处理该订单的进程实例标识
    pub processed_by: Uuid,
}

impl OrderDispatched {
    /// 由入站订单构造派发结果
    pub fn from_order(order: &OrderCreated, processed_by: Uuid) -> Self {
        Self {
            order_id: order.order_id,
            item: format!("{} - dispatched", order.item),
            notes: format!("Dispatched: {}", order.item),
            processed_by,
        }
    }
}

/// 派发完成的追踪记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCompleted {
    pub order_id: Uuid,
    /// ISO 日历日期（YYYY-MM-DD）
    pub dispatched_date: String,
}

impl DispatchCompleted {
    pub fn on_date(order_id: Uuid, date: NaiveDate) -> Self {
        Self {
            order_id,
            dispatched_date: date.to_string(),
        }
    }

    /// 以本地时区的当天日期构造
    pub fn today(order_id: Uuid) -> Self {
        Self::on_date(order_id, Local::now().date_naive())
    }
}

/// 派发流程写出的消息
///
/// 序列化时不带外层标签，负载即各消息自身的 JSON；类型通过 header 传递。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Preparing(DispatchPreparing),
    Dispatched(OrderDispatched),
    Completed(DispatchCompleted),
}

impl OutboundMessage {
    /// 写入 `message-type` header 的类型名
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Preparing(_) => "DispatchPreparing",
            Self::Dispatched(_) => "OrderDispatched",
            Self::Completed(_) => "DispatchCompleted",
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            Self::Preparing(m) => m.order_id,
            Self::Dispatched(m) => m.order_id,
            Self::Completed(m) => m.order_id,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, InfraError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl From<DispatchPreparing> for OutboundMessage {
    fn from(m: DispatchPreparing) -> Self {
        Self::Preparing(m)
    }
}

impl From<OrderDispatched> for OutboundMessage {
    fn from(m: OrderDispatched) -> Self {
        Self::Dispatched(m)
    }
}

impl From<DispatchCompleted> for OutboundMessage {
    fn from(m: DispatchCompleted) -> Self {
        Self::Completed(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_created_deserialize_camel_case() {
        let json = r#"{"orderId":"b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24","item":"Red"}"#;
        let event: OrderCreated = serde_json::from_str(json).unwrap();

        assert_eq!(
            event.order_id.to_string(),
            "b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24"
        );
        assert_eq!(event.item, "Red");
    }

    #[test]
    fn test_order_created_rejects_missing_item() {
        let json = r#"{"orderId":"b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24"}"#;
        assert!(serde_json::from_str::<OrderCreated>(json).is_err());
    }

    #[test]
    fn test_order_dispatched_from_order() {
        let order_id = Uuid::parse_str("b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24").unwrap();
        let instance = Uuid::new_v4();
        let dispatched = OrderDispatched::from_order(&OrderCreated::new(order_id, "Red"), instance);

        assert_eq!(dispatched.order_id, order_id);
        assert_eq!(dispatched.item, "Red - dispatched");
        assert_eq!(dispatched.notes, "Dispatched: Red");
        assert_eq!(dispatched.processed_by, instance);
    }

    #[test]
    fn test_dispatch_completed_date_format() {
        let order_id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2025, 10, 7).unwrap();
        let completed = DispatchCompleted::on_date(order_id, date);
        assert_eq!(completed.dispatched_date, "2025-10-07");
    }

    #[test]
    fn test_outbound_message_serializes_untagged() {
        let order_id = Uuid::parse_str("b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24").unwrap();
        let msg = OutboundMessage::from(DispatchPreparing { order_id });

        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"orderId": "b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24"})
        );
        assert_eq!(msg.message_type(), "DispatchPreparing");
        assert_eq!(msg.order_id(), order_id);
    }

    #[test]
    fn test_outbound_message_dispatched_fields() {
        let order_id = Uuid::new_v4();
        let instance = Uuid::new_v4();
        let msg = OutboundMessage::from(OrderDispatched::from_order(
            &OrderCreated::new(order_id, "Blue"),
            instance,
        ));

        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["item"], "Blue - dispatched");
        assert_eq!(json["notes"], "Dispatched: Blue");
        assert_eq!(json["processedBy"], instance.to_string());
        assert_eq!(msg.message_type(), "OrderDispatched");
    }
}
