//! 订单派发服务
//!
//! 消费 Kafka 中的订单创建事件，向库存服务确认可发货后，
//! 按 准备中 -> 派发结果 -> 已完成 的固定顺序写出追踪与结果消息。
//! 失败被划分为可重试与不可重试两类，由消费端决定重新投递还是转入死信队列。

pub mod consumer;
pub mod error;
pub mod processor;
pub mod publisher;
pub mod stock_client;
pub mod test_utils;
