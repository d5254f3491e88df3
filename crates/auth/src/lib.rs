//! Somnia Auth client for Rust
//!
//! This crate wraps the hosted identity service used by Somnia,
//! including sign up, sign in, session management, and identity-change
//! notifications.

use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// プロバイダが返す既知のエラーコード
///
/// 固定の語彙以外のコードは `Other` として不透明に扱う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorCode {
    CredentialNotFound,
    WrongCredential,
    EmailInUse,
    WeakPassword,
    Other(String),
}

impl AuthErrorCode {
    /// ワイヤ上のコード文字列から変換
    pub fn from_wire(code: &str) -> Self {
        match code {
            "credential-not-found" => Self::CredentialNotFound,
            "wrong-credential" => Self::WrongCredential,
            "email-in-use" => Self::EmailInUse,
            "weak-password" => Self::WeakPassword,
            other => Self::Other(other.to_string()),
        }
    }

    /// ワイヤ上のコード文字列に変換
    pub fn as_str(&self) -> &str {
        match self {
            Self::CredentialNotFound => "credential-not-found",
            Self::WrongCredential => "wrong-credential",
            Self::EmailInUse => "email-in-use",
            Self::WeakPassword => "weak-password",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Provider error ({code}): {message}")]
    Provider { code: AuthErrorCode, message: String },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing session")]
    MissingSession,
}

impl AuthError {
    /// プロバイダ由来のエラーコードを取得（それ以外は None）
    pub fn code(&self) -> Option<&AuthErrorCode> {
        match self {
            Self::Provider { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// 外部発行の認証レコード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
}

/// セッション情報
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
    #[serde(rename = "user")]
    pub identity: Identity,
}

/// クライアントオプション
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub auto_refresh_token: bool,
    pub persist_session: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            auto_refresh_token: true,
            persist_session: true,
        }
    }
}

/// アイデンティティ変更通知のコールバック
pub type IdentityCallback = Box<dyn Fn(Option<Identity>) + Send + Sync>;

type WatcherMap = Arc<RwLock<HashMap<Uuid, IdentityCallback>>>;

/// アクティブなアイデンティティ監視を表す
///
/// Drop した時点で監視は解除される。登録レジストリ自体はクライアント側で
/// 共有されているため、個々の監視の解除が他の監視に影響することはない。
pub struct IdentityWatch {
    id: Uuid,
    watchers: WatcherMap,
}

impl Drop for IdentityWatch {
    fn drop(&mut self) {
        if let Ok(mut watchers) = self.watchers.write() {
            watchers.remove(&self.id);
        }
    }
}

/// 監視コールバックの共有レジストリ
///
/// クライアント境界で一つだけ持ち、全監視で共有する。テストダブルの
/// `IdentitySource` 実装もこれを使い回せる。
#[derive(Clone, Default)]
pub struct IdentityWatchers {
    inner: WatcherMap,
}

impl IdentityWatchers {
    /// 空のレジストリを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// コールバックを登録し、解除ハンドルを返す
    pub fn register(&self, callback: IdentityCallback) -> IdentityWatch {
        let id = Uuid::new_v4();
        self.inner.write().unwrap().insert(id, callback);
        IdentityWatch {
            id,
            watchers: self.inner.clone(),
        }
    }

    /// 登録済みの全コールバックへ通知
    pub fn notify(&self, identity: Option<Identity>) {
        let watchers = self.inner.read().unwrap();
        debug!(
            "notifying {} identity watchers (signed_in: {})",
            watchers.len(),
            identity.is_some()
        );
        for callback in watchers.values() {
            callback(identity.clone());
        }
    }
}

/// アイデンティティ変更の購読ができるもの
///
/// `AuthClient` が実装する。テストダブルを注入できるよう、セッション側は
/// この境界だけに依存する。
pub trait IdentitySource: Send + Sync {
    /// 現在の認証済みアイデンティティ（未認証なら None）
    fn current_identity(&self) -> Option<Identity>;

    /// アイデンティティ変更の通知を受け取る
    ///
    /// 配信はプロバイダの通知順で、変更ごとに高々一回。
    fn on_change(&self, callback: IdentityCallback) -> IdentityWatch;
}

// Error body shape shared by the provider's auth endpoints.
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    code: Option<String>,
    message: Option<String>,
    #[serde(rename = "error_description")]
    description: Option<String>,
}

/// Auth クライアント
pub struct AuthClient {
    url: String,
    key: String,
    http_client: Client,
    options: AuthOptions,
    current_session: Arc<RwLock<Option<AuthSession>>>,
    watchers: IdentityWatchers,
}

impl AuthClient {
    /// 新しい Auth クライアントを作成
    pub fn new(url: &str, key: &str, http_client: Client, options: AuthOptions) -> Self {
        Self {
            url: url.to_string(),
            key: key.to_string(),
            http_client,
            options,
            current_session: Arc::new(RwLock::new(None)),
            watchers: IdentityWatchers::new(),
        }
    }

    /// ユーザー登録
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let url = format!("{}/auth/v1/signup", self.url);

        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let session: AuthSession = response.json().await?;

        self.store_session(&session);
        self.notify(Some(session.identity.clone()));

        Ok(session)
    }

    /// メール・パスワードでログイン
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, AuthError> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.url);

        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let session: AuthSession = response.json().await?;

        self.store_session(&session);
        self.notify(Some(session.identity.clone()));

        Ok(session)
    }

    /// 現在のセッションを取得
    pub fn get_session(&self) -> Option<AuthSession> {
        let read_guard = self.current_session.read().unwrap();
        read_guard.clone()
    }

    /// 現在の認証済みアイデンティティを取得
    pub fn current_identity(&self) -> Option<Identity> {
        let read_guard = self.current_session.read().unwrap();
        read_guard.as_ref().map(|session| session.identity.clone())
    }

    /// セッションをリフレッシュ
    ///
    /// アイデンティティ自体は変わらないため、監視側への通知は行わない。
    pub async fn refresh_session(&self) -> Result<AuthSession, AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;

        let url = format!("{}/auth/v1/token?grant_type=refresh_token", self.url);

        let payload = serde_json::json!({
            "refresh_token": session.refresh_token,
        });

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let new_session: AuthSession = response.json().await?;

        self.store_session(&new_session);

        Ok(new_session)
    }

    /// サインアウト
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;

        let url = format!("{}/auth/v1/logout", self.url);

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        // セッションをクリア
        {
            let mut write_guard = self.current_session.write().unwrap();
            *write_guard = None;
        }

        self.notify(None);

        Ok(())
    }

    /// アイデンティティ変更の監視を登録
    ///
    /// 登録済みコールバックはサインアップ・サインイン成功時に
    /// `Some(Identity)`、サインアウト成功時に `None` を受け取る。
    /// 失敗した呼び出しは何も通知しない。
    pub fn on_change(&self, callback: IdentityCallback) -> IdentityWatch {
        self.watchers.register(callback)
    }

    // セッションを保存
    fn store_session(&self, session: &AuthSession) {
        if self.options.persist_session {
            let mut write_guard = self.current_session.write().unwrap();
            *write_guard = Some(session.clone());
        }
    }

    fn notify(&self, identity: Option<Identity>) {
        self.watchers.notify(identity);
    }

    async fn error_from_response(response: reqwest::Response) -> AuthError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();

        match serde_json::from_str::<ProviderErrorBody>(&error_text) {
            Ok(body) => {
                let code = body
                    .code
                    .map(|code| AuthErrorCode::from_wire(&code))
                    .unwrap_or_else(|| AuthErrorCode::Other(status.as_str().to_string()));
                let message = body
                    .message
                    .or(body.description)
                    .unwrap_or_else(|| error_text.clone());
                AuthError::Provider { code, message }
            }
            Err(_) => AuthError::ApiError(error_text),
        }
    }
}

impl IdentitySource for AuthClient {
    fn current_identity(&self) -> Option<Identity> {
        AuthClient::current_identity(self)
    }

    fn on_change(&self, callback: IdentityCallback) -> IdentityWatch {
        AuthClient::on_change(self, callback)
    }
}
