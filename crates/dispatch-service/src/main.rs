//! 订单派发服务
//!
//! 消费 order.created，确认库存后写出派发追踪与派发结果消息。

use std::sync::Arc;

use anyhow::Result;
use dispatch_service::consumer::{OrderCreatedHandler, OrderDispatchConsumer};
use dispatch_service::processor::{DispatchService, DispatchTopics, ProcessingIdentity};
use dispatch_service::publisher::KafkaEventPublisher;
use dispatch_service::stock_client::StockServiceClient;
use dispatch_shared::config::AppConfig;
use dispatch_shared::dlq::DlqProducer;
use dispatch_shared::kafka::KafkaProducer;
use dispatch_shared::observability;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "dispatch-service";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..AppConfig::default()
        }
    });

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    // 进程级标识，整个生命周期内不变
    let identity = ProcessingIdentity::generate();

    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        stock_service = %config.stock_service.base_url,
        processed_by = %identity,
        "Starting dispatch-service..."
    );

    let producer = KafkaProducer::new(&config.kafka)?;
    let publisher = Arc::new(KafkaEventPublisher::new(producer.clone()));
    let oracle = Arc::new(StockServiceClient::new(&config.stock_service)?);

    let service = DispatchService::new(
        oracle,
        publisher,
        DispatchTopics::from(&config.topics),
        identity,
    );

    let dlq = Arc::new(DlqProducer::new(
        producer,
        &config.topics.dead_letter,
        &config.service_name,
    ));
    let handler = OrderCreatedHandler::new(service, dlq, config.redelivery.to_policy());
    let consumer = OrderDispatchConsumer::new(&config, handler)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    consumer.run(shutdown_rx).await?;

    info!("dispatch-service stopped");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
