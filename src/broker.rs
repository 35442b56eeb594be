//! Broker adapter (spec §4.F, §6). A small `reqwest`-based HTTP client
//! for the two calls the cleanup worker needs: cancel and modify. Client
//! construction (timeouts, pooling, bearer header) mirrors the teacher's
//! `scrapers::dome_rest::DomeRestClient`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::CoreError;
use crate::model::OrderReference;

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn cancel_order(&self, order: &OrderReference) -> Result<(), CoreError>;
    /// Modifies a protective order down to `new_quantity` contracts
    /// (spec §4.F REDUCED+modify: "modify them to the smaller new
    /// quantity"), not a price field.
    async fn modify_order(&self, order: &OrderReference, new_quantity: i64) -> Result<(), CoreError>;
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    broker_order_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ModifyRequest<'a> {
    broker_order_id: &'a str,
    quantity: i64,
}

#[derive(Debug, Deserialize)]
struct BrokerAck {
    #[allow(dead_code)]
    status: String,
}

pub struct HttpBrokerAdapter {
    client: Client,
    base_url: String,
}

impl HttpBrokerAdapter {
    pub fn new(base_url: String, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {api_key}").parse()?,
                );
                headers
            })
            .build()?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Maps transport failures to [`CoreError`] variants the circuit
    /// breaker and caller can act on: a well-formed 4xx response is a
    /// client fault, anything else (including timeouts/connects) is
    /// treated as transient so bounded retry can recover it.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(), CoreError> {
        let resp = req.send().await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?;

        if resp.status().is_success() {
            let _ = resp.json::<BrokerAck>().await;
            return Ok(());
        }

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(CoreError::InvalidInput(format!("broker rejected request ({status}): {text}")));
        }
        warn!(%status, %text, "broker returned server error");
        Err(CoreError::TransientUpstream(format!("{status}: {text}")))
    }
}

#[async_trait]
impl BrokerAdapter for HttpBrokerAdapter {
    async fn cancel_order(&self, order: &OrderReference) -> Result<(), CoreError> {
        let body = CancelRequest { broker_order_id: &order.broker_order_id };
        self.send(self.client.post(self.url("/orders/cancel")).json(&body)).await
    }

    async fn modify_order(&self, order: &OrderReference, new_quantity: i64) -> Result<(), CoreError> {
        let body = ModifyRequest { broker_order_id: &order.broker_order_id, quantity: new_quantity };
        self.send(self.client.post(self.url("/orders/modify")).json(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentKey;

    fn order() -> OrderReference {
        OrderReference {
            account_id: "A1".into(),
            broker_order_id: "B1".into(),
            instrument_key: InstrumentKey::Equity { symbol: "TEST".into() },
            purpose: crate::model::OrderPurpose::StopLoss,
            linked_position_key: "A1:TEST".into(),
        }
    }

    #[test]
    fn adapter_constructs_with_bearer_header() {
        let adapter = HttpBrokerAdapter::new("https://broker.example".into(), "secret", Duration::from_secs(5));
        assert!(adapter.is_ok());
    }

    #[test]
    fn url_joins_base_and_path() {
        let adapter =
            HttpBrokerAdapter::new("https://broker.example".into(), "secret", Duration::from_secs(5)).unwrap();
        assert_eq!(adapter.url("/orders/cancel"), "https://broker.example/orders/cancel");
        let _ = order();
    }
}
