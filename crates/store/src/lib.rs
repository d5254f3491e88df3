//! Somnia document store client for Rust
//!
//! This crate provides access to the hosted document database backing
//! Somnia: per-user profile documents and the per-user dream journal.
//!
//! # Features
//!
//! - Typed records (`UserProfile`, `Dream`) with required/optional fields
//!   spelled out
//! - Store contracts as traits (`ProfileStore`, `DreamStore`) so callers can
//!   inject test doubles
//! - An HTTP implementation over the document REST API
//! - An in-memory implementation for tests and offline use

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

mod memory;

pub use memory::MemoryStore;

/// エラー型
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("API error: {message} (Status: {status})")]
    ApiError {
        message: String,
        status: reqwest::StatusCode,
    },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("record not found")]
    NotFound,
}

/// 契約プラン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

/// ユーザープロファイル
///
/// アイデンティティ id ごとに必ず一件。初回認証時に存在しなければ
/// セッション側が遅延作成する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub plan: Plan,
    #[serde(default)]
    pub trial_end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub billing_customer_id: Option<String>,
}

impl UserProfile {
    /// free プランの新規プロファイルを作成
    pub fn free(id: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            email: email.to_string(),
            plan: Plan::Free,
            trial_end_date: None,
            billing_customer_id: None,
        }
    }
}

/// チャット発話者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// 夢エントリに紐づくチャット発言
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// 夢エントリ
///
/// 所有者のプロファイルに厳密に属する（ユーザー間共有はない）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dream {
    pub id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub chat_history: Option<Vec<ChatMessage>>,
}

impl Dream {
    /// 新しい夢エントリを作成
    pub fn new(user_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            content: content.to_string(),
            chat_history: None,
        }
    }
}

/// 夢エントリへの部分更新
///
/// 指定したフィールドだけを既存レコードへマージする。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DreamPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<Vec<ChatMessage>>,
}

impl DreamPatch {
    /// パッチを既存レコードへ適用
    pub fn apply(&self, dream: &mut Dream) {
        if let Some(content) = &self.content {
            dream.content = content.clone();
        }
        if let Some(chat_history) = &self.chat_history {
            dream.chat_history = Some(chat_history.clone());
        }
    }
}

/// プロファイルストアの契約
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// id でプロファイルを取得（存在しなければ None）
    async fn get_by_id(&self, id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// プロファイルを upsert
    async fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError>;

    /// プラン一項目だけを更新
    ///
    /// 決済 Webhook が行う唯一の書き込み。レコードが無ければ `NotFound`。
    async fn set_plan(&self, id: &str, plan: Plan) -> Result<(), StoreError>;
}

/// 夢ストアの契約
#[async_trait::async_trait]
pub trait DreamStore: Send + Sync {
    /// ユーザーと id で夢エントリを取得
    async fn get_by_id(&self, user_id: &str, dream_id: &str)
        -> Result<Option<Dream>, StoreError>;

    /// 夢エントリを upsert
    async fn upsert(&self, dream: &Dream) -> Result<(), StoreError>;

    /// ユーザーの夢エントリを新しい順で取得
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Dream>, StoreError>;

    /// 既存レコードへの部分更新
    ///
    /// レコードが存在しない場合は `NotFound` で失敗する。
    async fn update_partial(
        &self,
        user_id: &str,
        dream_id: &str,
        patch: DreamPatch,
    ) -> Result<(), StoreError>;

    /// ユーザーの全エントリを一括置換
    ///
    /// 呼び出し側から見て原子的: 置換後の読み取りは新しい一式か
    /// 置換前の一式のどちらかで、混在は観測されない。
    async fn replace_all(&self, user_id: &str, dreams: &[Dream]) -> Result<(), StoreError>;
}

/// ソート方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// ドキュメント REST API への単発リクエストビルダー
pub struct DocumentRequest {
    base_url: String,
    collection: String,
    http_client: Client,
    headers: HeaderMap,
    query_params: HashMap<String, String>,
}

impl DocumentRequest {
    /// コレクションに対する新しいリクエストを作成
    pub fn new(base_url: &str, api_key: &str, collection: &str, http_client: Client) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("apikey", value);
        }
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        Self {
            base_url: base_url.to_string(),
            collection: collection.to_string(),
            http_client,
            headers,
            query_params: HashMap::new(),
        }
    }

    /// 認証トークンを設定
    pub fn with_auth(mut self, token: &str) -> Result<Self, StoreError> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            StoreError::InvalidParameters("Invalid authorization token".to_string())
        })?;
        self.headers.insert("Authorization", value);
        Ok(self)
    }

    /// 等価フィルター
    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.query_params
            .insert(column.to_string(), format!("eq.{}", value));
        self
    }

    /// ソート順を指定
    pub fn order(mut self, column: &str, order: SortOrder) -> Self {
        let order_str = match order {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        self.query_params
            .insert("order".to_string(), format!("{}.{}", column, order_str));
        self
    }

    /// 取得件数を制限
    pub fn limit(mut self, count: i32) -> Self {
        self.query_params
            .insert("limit".to_string(), count.to_string());
        self
    }

    /// データを取得
    pub async fn execute<T: for<'de> Deserialize<'de>>(&self) -> Result<Vec<T>, StoreError> {
        let url = self.build_url()?;

        let response = self
            .http_client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(response, status).await);
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    /// データを upsert（キー重複時はマージ）
    pub async fn upsert<T: Serialize>(&self, values: &T) -> Result<Value, StoreError> {
        let url = self.build_url()?;

        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("resolution=merge-duplicates,return=representation"),
        );

        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .json(values)
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(response, status).await);
        }

        Self::parse_body(response).await
    }

    /// フィルターに一致するレコードを部分更新
    ///
    /// 返り値は更新後レコードの配列。一致なしなら空配列が返る。
    pub async fn patch<T: Serialize>(&self, values: &T) -> Result<Value, StoreError> {
        let url = self.build_url()?;

        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("return=representation"),
        );

        let response = self
            .http_client
            .patch(&url)
            .headers(headers)
            .json(values)
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(response, status).await);
        }

        Self::parse_body(response).await
    }

    /// フィルターに一致するレコードを削除
    pub async fn delete(&self) -> Result<Value, StoreError> {
        let url = self.build_url()?;

        let response = self
            .http_client
            .delete(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(response, status).await);
        }

        Self::parse_body(response).await
    }

    /// サーバー側関数を呼び出す (POST)
    ///
    /// 複数レコードにまたがる書き込みはサーバー側トランザクションに
    /// 委ねるため、ここを通る。
    pub async fn call_rpc(
        base_url: &str,
        api_key: &str,
        function_name: &str,
        params: &Value,
        http_client: &Client,
    ) -> Result<Value, StoreError> {
        let url = format!("{}/rest/v1/rpc/{}", base_url, function_name);

        let response = http_client
            .post(&url)
            .header("apikey", api_key)
            .header("Content-Type", "application/json")
            .json(params)
            .send()
            .await
            .map_err(StoreError::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(response, status).await);
        }

        Self::parse_body(response).await
    }

    // URLを構築
    fn build_url(&self) -> Result<String, StoreError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, self.collection))?;

        for (key, value) in &self.query_params {
            url.query_pairs_mut().append_pair(key, value);
        }

        Ok(url.to_string())
    }

    async fn api_error(response: reqwest::Response, status: reqwest::StatusCode) -> StoreError {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        StoreError::ApiError { message, status }
    }

    // Empty bodies (204, some 201s) parse as Null rather than failing.
    async fn parse_body(response: reqwest::Response) -> Result<Value, StoreError> {
        let body_text = response.text().await.map_err(|e| {
            StoreError::DeserializationError(format!("Failed to read response body: {}", e))
        })?;

        if body_text.trim().is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str::<Value>(&body_text)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))
        }
    }
}

fn returned_rows(value: &Value) -> usize {
    value.as_array().map(|rows| rows.len()).unwrap_or(0)
}

/// プロファイルコレクションの HTTP クライアント
pub struct ProfileClient {
    base_url: String,
    api_key: String,
    http_client: Client,
}

impl ProfileClient {
    /// 新しいプロファイルクライアントを作成
    pub fn new(base_url: &str, api_key: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            http_client,
        }
    }

    fn collection(&self) -> DocumentRequest {
        DocumentRequest::new(
            &self.base_url,
            &self.api_key,
            "profiles",
            self.http_client.clone(),
        )
    }
}

#[async_trait::async_trait]
impl ProfileStore for ProfileClient {
    async fn get_by_id(&self, id: &str) -> Result<Option<UserProfile>, StoreError> {
        let rows: Vec<UserProfile> = self.collection().eq("id", id).limit(1).execute().await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.collection().upsert(profile).await.map(|_| ())
    }

    async fn set_plan(&self, id: &str, plan: Plan) -> Result<(), StoreError> {
        let updated = self
            .collection()
            .eq("id", id)
            .patch(&serde_json::json!({ "plan": plan }))
            .await?;

        if returned_rows(&updated) == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// 夢コレクションの HTTP クライアント
pub struct DreamClient {
    base_url: String,
    api_key: String,
    http_client: Client,
}

impl DreamClient {
    /// 新しい夢ストアクライアントを作成
    pub fn new(base_url: &str, api_key: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            http_client,
        }
    }

    fn collection(&self) -> DocumentRequest {
        DocumentRequest::new(
            &self.base_url,
            &self.api_key,
            "dreams",
            self.http_client.clone(),
        )
    }
}

#[async_trait::async_trait]
impl DreamStore for DreamClient {
    async fn get_by_id(
        &self,
        user_id: &str,
        dream_id: &str,
    ) -> Result<Option<Dream>, StoreError> {
        let rows: Vec<Dream> = self
            .collection()
            .eq("user_id", user_id)
            .eq("id", dream_id)
            .limit(1)
            .execute()
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert(&self, dream: &Dream) -> Result<(), StoreError> {
        self.collection().upsert(dream).await.map(|_| ())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Dream>, StoreError> {
        self.collection()
            .eq("user_id", user_id)
            .order("timestamp", SortOrder::Descending)
            .execute()
            .await
    }

    async fn update_partial(
        &self,
        user_id: &str,
        dream_id: &str,
        patch: DreamPatch,
    ) -> Result<(), StoreError> {
        let updated = self
            .collection()
            .eq("user_id", user_id)
            .eq("id", dream_id)
            .patch(&patch)
            .await?;

        if returned_rows(&updated) == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn replace_all(&self, user_id: &str, dreams: &[Dream]) -> Result<(), StoreError> {
        // Single request; the replace_dreams function swaps the user's rows
        // inside one server-side transaction.
        let params = serde_json::json!({
            "user_id": user_id,
            "dreams": dreams,
        });
        DocumentRequest::call_rpc(
            &self.base_url,
            &self.api_key,
            "replace_dreams",
            &params,
            &self.http_client,
        )
        .await
        .map(|_| ())
    }
}
