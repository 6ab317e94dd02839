//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时（如单元测试）所有记录函数均为空操作。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册派发链路指标的描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("orders_received_total", "Total number of inbound order events");
    metrics::describe_counter!(
        "dispatch_outcomes_total",
        "Dispatch outcomes by result (dispatched, unavailable, retryable_error, not_retryable_error)"
    );
    metrics::describe_histogram!(
        "dispatch_duration_seconds",
        "Time spent processing one inbound order in seconds"
    );
    metrics::describe_counter!(
        "messages_published_total",
        "Total number of acknowledged outbound messages"
    );
    metrics::describe_counter!(
        "redeliveries_total",
        "Total number of inbound records scheduled for redelivery"
    );
    metrics::describe_counter!(
        "dead_letters_total",
        "Total number of inbound records routed to the dead-letter topic"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录收到一条入站订单
#[inline]
pub fn record_order_received() {
    metrics::counter!("orders_received_total").increment(1);
}

/// 记录一次派发的结果与耗时
#[inline]
pub fn record_dispatch_outcome(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("dispatch_outcomes_total", "outcome" => outcome).increment(1);
    metrics::histogram!("dispatch_duration_seconds", "outcome" => outcome).record(duration_secs);
}

/// 记录一条已被 broker 确认的出站消息
#[inline]
pub fn record_message_published(topic: &str, message_type: &'static str) {
    metrics::counter!(
        "messages_published_total",
        "topic" => topic.to_string(),
        "message_type" => message_type
    )
    .increment(1);
}

/// 记录一次重新投递
#[inline]
pub fn record_redelivery() {
    metrics::counter!("redeliveries_total").increment(1);
}

/// 记录一条进入死信队列的消息
#[inline]
pub fn record_dead_letter(reason: &'static str) {
    metrics::counter!("dead_letters_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_order_received();
        record_dispatch_outcome("dispatched", 0.01);
        record_message_published("order.dispatched", "OrderDispatched");
        record_redelivery();
        record_dead_letter("NOT_RETRYABLE");
    }
}
