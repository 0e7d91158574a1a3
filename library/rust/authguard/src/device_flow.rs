//! Device Authorization Grant フロー（RFC 8628）のクライアント実装。
//!
//! セッションは `Initiated → CodeIssued → {Completed | Denied | Expired | TransportError}` と遷移する。
//! ポーリング間隔はセッションごとに保持し、複数のフロー間で共有しない。

use crate::config::DeviceFlowConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

const DEFAULT_INTERVAL_SECS: u64 = 5;
const DEFAULT_SLOW_DOWN_INCREMENT_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// DeviceCodeResponse はデバイス認可リクエストのレスポンス。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    #[serde(default, alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    /// 省略時は 0。ポーリング時にクライアントの既定間隔へ置き換える。
    #[serde(default)]
    pub interval: u64,
}

/// TokenResult はトークンエンドポイントのレスポンス。
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResult {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |t: &Option<String>| t.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("TokenResult")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &redact(&self.refresh_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("id_token", &redact(&self.id_token))
            .field("scope", &self.scope)
            .finish()
    }
}

/// DeviceFlowState はデバイスフローセッションの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlowState {
    Initiated,
    CodeIssued,
    Completed,
    Denied,
    Expired,
    TransportError,
    Cancelled,
}

impl DeviceFlowState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initiated | Self::CodeIssued)
    }
}

/// OAuthErrorCode はトークンエンドポイントが返す `error` の値。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthErrorCode {
    AuthorizationPending,
    SlowDown,
    ExpiredToken,
    AccessDenied,
    Other(String),
}

impl OAuthErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ExpiredToken => "expired_token",
            Self::AccessDenied => "access_denied",
            Self::Other(code) => code,
        }
    }

    /// `authorization_pending` と `slow_down` 以外はポーリングを終了する。
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AuthorizationPending | Self::SlowDown)
    }
}

impl From<&str> for OAuthErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "authorization_pending" => Self::AuthorizationPending,
            "slow_down" => Self::SlowDown,
            "expired_token" => Self::ExpiredToken,
            "access_denied" => Self::AccessDenied,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DeviceFlowError は Device Authorization Grant フローのエラー。
#[derive(thiserror::Error, Debug)]
pub enum DeviceFlowError {
    #[error("device flow error: {code}")]
    OAuth {
        code: OAuthErrorCode,
        description: Option<String>,
    },

    /// ネットワーク障害・想定外のステータス・解析不能なレスポンス。
    #[error("device flow transport error: {0}")]
    Transport(String),

    #[error("device flow cancelled")]
    Cancelled,
}

impl DeviceFlowError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::OAuth { code, .. } => code.as_str(),
            Self::Transport(_) => "transport_error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Self::OAuth { description, .. } => description.as_deref(),
            Self::Transport(detail) => Some(detail),
            Self::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::OAuth { code, .. } => code.is_terminal(),
            Self::Transport(_) | Self::Cancelled => true,
        }
    }

    /// このエラーで終了したセッションの状態。
    pub fn terminal_state(&self) -> DeviceFlowState {
        match self {
            Self::OAuth { code, .. } => match code {
                OAuthErrorCode::AuthorizationPending | OAuthErrorCode::SlowDown => {
                    DeviceFlowState::CodeIssued
                }
                OAuthErrorCode::ExpiredToken => DeviceFlowState::Expired,
                OAuthErrorCode::AccessDenied | OAuthErrorCode::Other(_) => DeviceFlowState::Denied,
            },
            Self::Transport(_) => DeviceFlowState::TransportError,
            Self::Cancelled => DeviceFlowState::Cancelled,
        }
    }

    fn expired() -> Self {
        Self::OAuth {
            code: OAuthErrorCode::ExpiredToken,
            description: Some("device code expired before authorization completed".into()),
        }
    }
}

/// OAuth2 エラーレスポンス。
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// 非 2xx レスポンスを分類する。OAuth2 エラー本文を解析できなければ Transport とする。
fn oauth_error(endpoint: &str, status: u16, body: &str) -> DeviceFlowError {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(resp) => DeviceFlowError::OAuth {
            code: OAuthErrorCode::from(resp.error.as_str()),
            description: resp.error_description,
        },
        Err(_) => DeviceFlowError::Transport(format!("{endpoint} returned status {status}")),
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// HTTP クライアントの抽象化（テスト用にモック可能）。
#[async_trait::async_trait]
pub trait DeviceFlowHttpClient: Send + Sync {
    async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<(u16, String), DeviceFlowError>;
}

/// reqwest ベースのデフォルト HTTP クライアント。
pub struct DefaultDeviceFlowHttpClient {
    client: reqwest::Client,
}

impl DefaultDeviceFlowHttpClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "HTTP クライアントの構築に失敗したためデフォルト設定を使用します");
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait::async_trait]
impl DeviceFlowHttpClient for DefaultDeviceFlowHttpClient {
    async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<(u16, String), DeviceFlowError> {
        let resp = self
            .client
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|e| DeviceFlowError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| DeviceFlowError::Transport(e.to_string()))?;
        Ok((status, body))
    }
}

/// DeviceAuthClient は Device Authorization Grant フロー（RFC 8628）のクライアント。
pub struct DeviceAuthClient {
    device_endpoint: String,
    token_endpoint: String,
    /// `login` が使用するクライアント ID とスコープ。
    client_id: Option<String>,
    scope: Option<String>,
    client_secret: Option<SecretString>,
    default_interval_secs: u64,
    slow_down_increment_secs: u64,
    http_client: Box<dyn DeviceFlowHttpClient>,
}

impl DeviceAuthClient {
    /// 新しい DeviceAuthClient を生成する。
    pub fn new(device_endpoint: &str, token_endpoint: &str) -> Self {
        Self::with_http_client(
            device_endpoint,
            token_endpoint,
            Box::new(DefaultDeviceFlowHttpClient::new(DEFAULT_REQUEST_TIMEOUT)),
        )
    }

    /// 設定から DeviceAuthClient を生成する。
    pub fn from_config(config: &DeviceFlowConfig) -> Self {
        let http_client = Box::new(DefaultDeviceFlowHttpClient::new(Duration::from_secs(
            config.request_timeout_secs,
        )));
        let mut client =
            Self::with_http_client(&config.device_endpoint, &config.token_endpoint, http_client)
                .with_client(&config.client_id, config.scope.as_deref())
                .with_default_interval(config.default_interval_secs)
                .with_slow_down_increment(config.slow_down_increment_secs);
        client.client_secret = config.client_secret.clone();
        client
    }

    /// カスタム HTTP クライアントを使う DeviceAuthClient を生成する（テスト用）。
    pub fn with_http_client(
        device_endpoint: &str,
        token_endpoint: &str,
        http_client: Box<dyn DeviceFlowHttpClient>,
    ) -> Self {
        Self {
            device_endpoint: device_endpoint.to_string(),
            token_endpoint: token_endpoint.to_string(),
            client_id: None,
            scope: None,
            client_secret: None,
            default_interval_secs: DEFAULT_INTERVAL_SECS,
            slow_down_increment_secs: DEFAULT_SLOW_DOWN_INCREMENT_SECS,
            http_client,
        }
    }

    /// `login` で使うクライアント ID とスコープを設定する。
    pub fn with_client(mut self, client_id: &str, scope: Option<&str>) -> Self {
        self.client_id = Some(client_id.to_string());
        self.scope = scope.map(str::to_string);
        self
    }

    /// コンフィデンシャルクライアントとしてリクエストに client_secret を付与する。
    pub fn with_client_secret(mut self, secret: SecretString) -> Self {
        self.client_secret = Some(secret);
        self
    }

    /// サーバーが interval を返さない場合の間隔（秒）。
    pub fn with_default_interval(mut self, secs: u64) -> Self {
        self.default_interval_secs = secs.max(1);
        self
    }

    /// slow_down 受信時に間隔へ加算する秒数。
    pub fn with_slow_down_increment(mut self, secs: u64) -> Self {
        self.slow_down_increment_secs = secs;
        self
    }

    /// デバイス認可リクエストを送信し、デバイスコード情報を返す。
    pub async fn request_device_code(
        &self,
        client_id: &str,
        scope: Option<&str>,
    ) -> Result<DeviceCodeResponse, DeviceFlowError> {
        let mut params = vec![("client_id", client_id)];
        if let Some(s) = scope {
            params.push(("scope", s));
        }
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.expose_secret()));
        }

        let (status, body) = self
            .http_client
            .post_form(&self.device_endpoint, &params)
            .await?;

        if !is_success(status) {
            let err = oauth_error("device authorization endpoint", status, &body);
            warn!(
                error_code = err.error_code(),
                "デバイス認可リクエストが拒否されました"
            );
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| {
            DeviceFlowError::Transport(format!("invalid device authorization response: {e}"))
        })
    }

    /// device_code を使ってトークンエンドポイントをポーリングする。
    ///
    /// `interval_override` が `None` または 0 の場合は既定の間隔を使用する。
    /// 待機とリクエストはいずれも `cancel` によって中断できる。
    pub async fn poll_token(
        &self,
        client_id: &str,
        device_code: &str,
        interval_override: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<TokenResult, DeviceFlowError> {
        self.poll_until(client_id, device_code, interval_override, None, cancel)
            .await
    }

    async fn poll_until(
        &self,
        client_id: &str,
        device_code: &str,
        interval_override: Option<u64>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<TokenResult, DeviceFlowError> {
        let mut interval = Duration::from_secs(
            interval_override
                .filter(|&secs| secs > 0)
                .unwrap_or(self.default_interval_secs),
        );

        let mut params = vec![
            ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ("device_code", device_code),
            ("client_id", client_id),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.expose_secret()));
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(attempt, interval_secs = interval.as_secs(), "トークンエンドポイントをポーリングします");

            let (status, body) = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DeviceFlowError::Cancelled),
                resp = self.http_client.post_form(&self.token_endpoint, &params) => resp?,
            };

            if is_success(status) {
                return serde_json::from_str(&body).map_err(|e| {
                    DeviceFlowError::Transport(format!("invalid token response: {e}"))
                });
            }

            match oauth_error("token endpoint", status, &body) {
                DeviceFlowError::OAuth {
                    code: OAuthErrorCode::AuthorizationPending,
                    ..
                } => {}
                DeviceFlowError::OAuth {
                    code: OAuthErrorCode::SlowDown,
                    ..
                } => {
                    interval += Duration::from_secs(self.slow_down_increment_secs);
                    info!(
                        interval_secs = interval.as_secs(),
                        "slow_down を受信したためポーリング間隔を延長します"
                    );
                }
                err => {
                    warn!(
                        error_code = err.error_code(),
                        state = ?err.terminal_state(),
                        "デバイスフローが完了せずに終了しました"
                    );
                    return Err(err);
                }
            }

            let wake = Instant::now() + interval;
            let wake = deadline.map_or(wake, |d| wake.min(d));
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DeviceFlowError::Cancelled),
                () = tokio::time::sleep_until(wake) => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    state = ?DeviceFlowState::Expired,
                    "デバイスコードの有効期限が切れました"
                );
                return Err(DeviceFlowError::expired());
            }
        }
    }

    /// Device Authorization Grant フロー全体を実行する統合メソッド。
    /// on_code_issued コールバックでユーザーにデバイスコード情報を一度だけ通知する。
    pub async fn device_flow<F>(
        &self,
        client_id: &str,
        scope: Option<&str>,
        on_code_issued: F,
        cancel: &CancellationToken,
    ) -> Result<TokenResult, DeviceFlowError>
    where
        F: FnOnce(&DeviceCodeResponse),
    {
        debug!(state = ?DeviceFlowState::Initiated, client_id, "デバイスフローを開始します");

        let device_resp = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DeviceFlowError::Cancelled),
            resp = self.request_device_code(client_id, scope) => resp?,
        };
        on_code_issued(&device_resp);
        debug!(
            state = ?DeviceFlowState::CodeIssued,
            expires_in = device_resp.expires_in,
            interval = device_resp.interval,
            "デバイスコードを取得しました"
        );

        let deadline = (device_resp.expires_in > 0)
            .then(|| Instant::now() + Duration::from_secs(device_resp.expires_in));

        let token = self
            .poll_until(
                client_id,
                &device_resp.device_code,
                Some(device_resp.interval),
                deadline,
                cancel,
            )
            .await?;

        info!(state = ?DeviceFlowState::Completed, client_id, "デバイスフローが完了しました");
        Ok(token)
    }

    /// 設定済みのクライアント ID とスコープで `device_flow` を実行する。
    pub async fn login<F>(
        &self,
        on_code_issued: F,
        cancel: &CancellationToken,
    ) -> Result<TokenResult, DeviceFlowError>
    where
        F: FnOnce(&DeviceCodeResponse),
    {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or_else(|| DeviceFlowError::OAuth {
                code: OAuthErrorCode::Other("invalid_client".into()),
                description: Some("client_id is not configured".into()),
            })?;
        self.device_flow(client_id, self.scope.as_deref(), on_code_issued, cancel)
            .await
    }
}
