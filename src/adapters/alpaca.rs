//! Alpaca-style REST broker client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::broker::{
    parse_orders, parse_positions, BrokerAck, BrokerClient, BrokerOrder, BrokerResult,
    OrderLookup, OrderStatusFilter, PositionListing, RawBrokerOrder, RawBrokerPosition,
    SubmitOrder,
};
use crate::config::BrokerConfig;
use crate::domain::OrderStatus;
use crate::error::{BrokerError, Result, TallyError};

/// Map a non-success HTTP status into the broker error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> BrokerError {
    let message = format!("{}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BrokerError::Connection(message)
    } else if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
        BrokerError::Validation(message)
    } else {
        BrokerError::Rejection(message)
    }
}

#[derive(Clone)]
pub struct AlpacaClient {
    http: Client,
    base_url: String,
}

impl AlpacaClient {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let key_id = config
            .key_id
            .as_deref()
            .ok_or_else(|| TallyError::Validation("broker.key_id is required".to_string()))?;
        let secret = config
            .secret_key
            .as_deref()
            .ok_or_else(|| TallyError::Validation("broker.secret_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            HeaderValue::from_str(key_id)
                .map_err(|e| TallyError::Validation(format!("invalid broker key id: {e}")))?,
        );
        let mut secret = HeaderValue::from_str(secret)
            .map_err(|e| TallyError::Validation(format!("invalid broker secret: {e}")))?;
        secret.set_sensitive(true);
        headers.insert("APCA-API-SECRET-KEY", secret);

        let http = Client::builder()
            .user_agent("tally/0.1")
            .default_headers(headers)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| TallyError::Internal(format!("failed to build broker HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> BrokerResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    #[instrument(skip(self))]
    async fn get_orders(
        &self,
        status: OrderStatusFilter,
        limit: usize,
        after: Option<DateTime<Utc>>,
    ) -> BrokerResult<Vec<BrokerOrder>> {
        let mut query = vec![
            ("status", status.as_str().to_string()),
            ("limit", limit.to_string()),
            ("direction", "asc".to_string()),
            ("nested", "false".to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_rfc3339_opts(SecondsFormat::Micros, true)));
        }

        let response = self
            .http
            .get(self.url("/v2/orders"))
            .query(&query)
            .send()
            .await?;
        let raw: Vec<RawBrokerOrder> = Self::check(response).await?.json().await?;
        debug!(count = raw.len(), "fetched broker orders");
        Ok(parse_orders(raw))
    }

    #[instrument(skip(self))]
    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<OrderLookup> {
        let response = self
            .http
            .get(self.url("/v2/orders:by_client_order_id"))
            .query(&[("client_order_id", client_order_id)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(OrderLookup::NotFound);
        }
        let raw: RawBrokerOrder = Self::check(response).await?.json().await?;
        Ok(OrderLookup::from_raw(raw))
    }

    #[instrument(skip(self))]
    async fn get_all_positions(&self) -> BrokerResult<PositionListing> {
        let response = self.http.get(self.url("/v2/positions")).send().await?;
        let raw: Vec<RawBrokerPosition> = Self::check(response).await?.json().await?;
        let listing = parse_positions(raw);
        debug!(
            count = listing.positions.len(),
            unreadable = listing.unreadable_count(),
            "fetched broker positions"
        );
        Ok(listing)
    }

    #[instrument(skip(self, order), fields(symbol = %order.symbol, qty = order.qty))]
    async fn submit_order(
        &self,
        order: &SubmitOrder,
        client_order_id: &str,
    ) -> BrokerResult<BrokerAck> {
        let mut body = json!({
            "symbol": order.symbol,
            "qty": order.qty.to_string(),
            "side": order.side.as_str(),
            "type": order.order_type.as_str(),
            "time_in_force": order.time_in_force.as_str(),
            "client_order_id": client_order_id,
        });
        if let Some(limit) = order.limit_price {
            body["limit_price"] = Value::String(limit.to_string());
        }
        if let Some(stop) = order.stop_price {
            body["stop_price"] = Value::String(stop.to_string());
        }

        let response = self
            .http
            .post(self.url("/v2/orders"))
            .json(&body)
            .send()
            .await?;
        let value: Value = Self::check(response).await?.json().await?;

        let broker_order_id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidResponse("order ack without id".to_string()))?
            .to_string();
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .and_then(OrderStatus::parse_known);

        Ok(BrokerAck {
            broker_order_id,
            status,
        })
    }
}
