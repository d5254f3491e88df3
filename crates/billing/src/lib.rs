//! Somnia billing gateway client for Rust
//!
//! This crate covers the two billing endpoints: creating a checkout
//! session against the hosted billing function, and processing the payment
//! provider's webhook events.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod webhook;

pub use webhook::{sign_payload, verify_signature, WebhookHandler, WebhookResponse};

/// エラー型
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("caller is not authenticated")]
    Unauthenticated,

    #[error("checkout resource not found: {0}")]
    NotFound(String),

    #[error("billing misconfiguration: {0}")]
    Internal(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// チェックアウトセッション作成時のオプション
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckoutParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_url: Option<String>,
}

/// 作成されたチェックアウトセッションへのリダイレクト情報
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRedirect {
    pub session_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// 決済ゲートウェイクライアント
pub struct BillingClient {
    base_url: String,
    api_key: String,
    http_client: Client,
}

impl BillingClient {
    /// 新しい決済クライアントを作成
    pub fn new(base_url: &str, api_key: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            http_client,
        }
    }

    /// チェックアウトセッションを作成
    ///
    /// 認証済みの呼び出しであること。失敗は `Unauthenticated` /
    /// `NotFound` / `Internal` のいずれかに分類される。
    pub async fn create_checkout_session(
        &self,
        access_token: &str,
        params: Option<CheckoutParams>,
    ) -> Result<CheckoutRedirect, BillingError> {
        let url = format!("{}/functions/v1/create-checkout-session", self.base_url);

        let mut request = self
            .http_client
            .post(&url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", access_token));

        if let Some(params) = params {
            request = request.json(&params);
        }

        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            let redirect = response.json::<CheckoutRedirect>().await?;
            return Ok(redirect);
        }

        let message = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 => BillingError::Unauthenticated,
            404 => BillingError::NotFound(message),
            _ => BillingError::Internal(message),
        })
    }
}
