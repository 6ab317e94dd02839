//! 库存服务客户端
//!
//! 通过 AvailabilityOracle trait 抽象库存可用性查询，便于测试时注入 mock 实现。
//! HTTP 实现负责把传输层与状态码失败归入可重试/不可重试两类。

use async_trait::async_trait;
use dispatch_shared::config::StockServiceConfig;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// Trait 抽象
// ---------------------------------------------------------------------------

/// 库存可用性查询接口
///
/// 返回库存服务的原始应答文本，由调用方通过 [`parse_availability`] 解读。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AvailabilityOracle: Send + Sync {
    async fn check_availability(&self, item: &str) -> Result<String, DispatchError>;
}

/// 解读库存服务应答
///
/// 去除首尾空白后不区分大小写匹配 `true`/`false`，其余内容一律视为不可重试错误，
/// 同样的应答重放多少次都不会变成合法值。
pub fn parse_availability(body: &str) -> Result<bool, DispatchError> {
    let normalized = body.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DispatchError::not_retryable(format!(
            "无法识别的库存应答: {:?}",
            body
        ))),
    }
}

// ---------------------------------------------------------------------------
// HTTP 客户端实现
// ---------------------------------------------------------------------------

/// 基于 reqwest 的库存服务客户端
///
/// 请求形如 `GET {base_url}?item={item}`，整个请求受配置的超时约束。
#[derive(Clone)]
pub struct StockServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl StockServiceClient {
    pub fn new(config: &StockServiceConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(DispatchError::not_retryable)?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl AvailabilityOracle for StockServiceClient {
    async fn check_availability(&self, item: &str) -> Result<String, DispatchError> {
        debug!(item, url = %self.base_url, "查询库存可用性");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("item", item)])
            .send()
            .await
            .map_err(|e| {
                warn!(item, error = %e, "库存服务请求失败");
                classify_transport_error(e)
            })?;

        let status = response.status();

        if status.is_server_error() {
            warn!(item, status = status.as_u16(), "库存服务返回服务端错误");
            return Err(DispatchError::retryable(format!("库存服务返回 {status}")));
        }

        if status != StatusCode::OK {
            warn!(item, status = status.as_u16(), "库存服务返回非预期状态码");
            return Err(DispatchError::not_retryable(format!(
                "库存服务返回 {status}"
            )));
        }

        response.text().await.map_err(classify_transport_error)
    }
}

/// 超时与连接失败属于瞬时故障，其余传输错误（URL 非法、重定向循环、解码失败）重试无意义
fn classify_transport_error(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() || err.is_connect() {
        DispatchError::retryable(err)
    } else {
        DispatchError::not_retryable(err)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, timeout_ms: u64) -> StockServiceClient {
        StockServiceClient::new(&StockServiceConfig {
            base_url: format!("{}/api/stock", server.uri()),
            timeout_ms,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_availability() {
        assert!(parse_availability("true").unwrap());
        assert!(!parse_availability("false").unwrap());
        assert!(parse_availability("  TRUE\n").unwrap());
        assert!(!parse_availability("False").unwrap());
    }

    #[test]
    fn test_parse_availability_rejects_unknown_body() {
        for body in ["", "yes", "1", "available", "truee"] {
            let err = parse_availability(body).unwrap_err();
            assert!(!err.is_retryable(), "body {body:?} should not be retryable");
        }
    }

    #[tokio::test]
    async fn test_check_availability_returns_body() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/stock"))
            .and(query_param("item", "Red"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let body = client_for(&server, 1000)
            .check_availability("Red")
            .await
            .unwrap();
        assert_eq!(body, "true");
    }

    #[tokio::test]
    async fn test_item_is_url_encoded() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(query_param("item", "Blue & Green"))
            .respond_with(ResponseTemplate::new(200).set_body_string("false"))
            .expect(1)
            .mount(&server)
            .await;

        let body = client_for(&server, 1000)
            .check_availability("Blue & Green")
            .await
            .unwrap();
        assert_eq!(body, "false");
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .mount(&server)
            .await;

        let err = client_for(&server, 1000)
            .check_availability("Red")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retryable() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let err = client_for(&server, 1000)
            .check_availability("Red")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("true")
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, 50)
            .check_availability("Red")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let client = StockServiceClient::new(&StockServiceConfig {
            base_url: "http://127.0.0.1:1/api/stock".to_string(),
            timeout_ms: 1000,
        })
        .unwrap();

        let err = client.check_availability("Red").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
