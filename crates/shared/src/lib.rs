//! 共享库
//!
//! 包含订单派发链路共用的配置、错误处理、消息模型、Kafka、死信队列与可观测性等基础设施代码。

pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod retry;
