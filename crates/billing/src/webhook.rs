//! Payment-provider webhook processing.
//!
//! The provider signs each delivery with a shared secret; anything that
//! fails verification is rejected before the payload is even parsed. The
//! only write this module ever performs is flipping a profile's plan to
//! `pro` on a completed checkout.

use hmac::{Hmac, Mac};
use http::StatusCode;
use log::{info, warn};
use serde::Deserialize;
use sha2::Sha256;
use somnia_rust_store::{Plan, ProfileStore};
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Webhook 処理の結果
///
/// HTTP 層にそのまま返せるステータスと本文。リトライはプロバイダ側の
/// 責務なので、ここでは行わない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub body: String,
}

impl WebhookResponse {
    fn new(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
struct WebhookEventData {
    object: CheckoutObject,
}

#[derive(Debug, Deserialize)]
struct CheckoutObject {
    #[serde(default)]
    client_reference_id: Option<String>,
}

/// Webhook ハンドラ
pub struct WebhookHandler {
    signing_secret: String,
    profiles: Arc<dyn ProfileStore>,
}

impl WebhookHandler {
    /// 新しいハンドラを作成
    pub fn new(signing_secret: &str, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            signing_secret: signing_secret.to_string(),
            profiles,
        }
    }

    /// 受信した Webhook 配信を処理
    ///
    /// 署名不正・相関 id 欠落は 400、プロファイル更新失敗は 500、
    /// それ以外（未知イベント含む）は 200 を返す。
    pub async fn handle(&self, payload: &str, signature_header: &str) -> WebhookResponse {
        if let Err(reason) = verify_signature(payload, signature_header, &self.signing_secret) {
            warn!("webhook signature rejected: {}", reason);
            return WebhookResponse::new(StatusCode::BAD_REQUEST, "invalid signature");
        }

        let event: WebhookEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("webhook payload did not parse: {}", e);
                return WebhookResponse::new(StatusCode::BAD_REQUEST, "malformed event payload");
            }
        };

        if event.event_type != "checkout.session.completed" {
            // Acknowledge everything else so the provider stops retrying.
            return WebhookResponse::new(StatusCode::OK, "ignored");
        }

        let user_id = match event.data.object.client_reference_id {
            Some(user_id) => user_id,
            None => {
                warn!("checkout completed without a client_reference_id");
                return WebhookResponse::new(
                    StatusCode::BAD_REQUEST,
                    "missing client_reference_id",
                );
            }
        };

        match self.profiles.set_plan(&user_id, Plan::Pro).await {
            Ok(()) => {
                info!("checkout completed; upgraded {} to pro", user_id);
                WebhookResponse::new(StatusCode::OK, "ok")
            }
            Err(e) => {
                warn!("failed to upgrade {} after checkout: {}", user_id, e);
                WebhookResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to update profile",
                )
            }
        }
    }
}

/// 配信署名を検証
///
/// ヘッダは `t=<unix>,v1=<hex hmac-sha256>` 形式で、署名対象は
/// `"{t}.{payload}"`。
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
) -> Result<(), String> {
    let mut timestamp = None;
    let mut signature = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }

    let (timestamp, signature) = match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => (timestamp, signature),
        _ => return Err("missing t or v1 component".to_string()),
    };

    let digest = hex::decode(signature).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid signing secret".to_string())?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());

    mac.verify_slice(&digest)
        .map_err(|_| "signature mismatch".to_string())
}

/// ペイロードに署名してヘッダ値を作る
///
/// テストや送信側シミュレーションで使う。
pub fn sign_payload(payload: &str, timestamp: u64, secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let digest = mac.finalize().into_bytes();
    format!("t={},v1={}", timestamp, hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let header = sign_payload(payload, 1754400000, "whsec_test");

        assert!(verify_signature(payload, &header, "whsec_test").is_ok());
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let header = sign_payload(payload, 1754400000, "whsec_test");

        assert!(verify_signature(payload, &header, "whsec_other").is_err());
    }

    #[test]
    fn test_signature_rejects_tampered_payload() {
        let header = sign_payload("original", 1754400000, "whsec_test");

        assert!(verify_signature("tampered", &header, "whsec_test").is_err());
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        assert!(verify_signature("payload", "not-a-signature", "whsec_test").is_err());
        assert!(verify_signature("payload", "t=123", "whsec_test").is_err());
        assert!(verify_signature("payload", "t=123,v1=zzzz", "whsec_test").is_err());
    }
}
