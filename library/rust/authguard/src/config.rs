//! 認証ライブラリの設定構造体。
//!
//! サービス設定 YAML の `auth` セクションから serde でデシリアライズする。

use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

fn default_cache_ttl_secs() -> u64 {
    600
}

/// TTL 経過後、JWKS 取得失敗時に stale キャッシュを使い続けてよい上限（デフォルト: 1 時間）。
fn default_max_stale_secs() -> u64 {
    3600
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_kid_miss_refresh_secs() -> u64 {
    30
}

/// RFC 8628 が定めるポーリング間隔の既定値（5 秒）。
fn default_interval_secs() -> u64 {
    5
}

fn default_slow_down_increment_secs() -> u64 {
    5
}

/// AuthConfig はライブラリ全体の設定。
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwks: JwksConfig,
    #[serde(default)]
    pub device_flow: Option<DeviceFlowConfig>,
}

/// JwksConfig は JWKS 検証器の設定。
#[derive(Debug, Clone, Deserialize)]
pub struct JwksConfig {
    /// 例: `https://auth.k1s0.internal.example.com/realms/k1s0/protocol/openid-connect/certs`
    pub jwks_url: String,
    pub issuer: String,
    pub audience: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_stale_secs")]
    pub max_stale_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// exp 検証時に許容する時計ずれ（秒）。
    #[serde(default)]
    pub leeway_secs: u64,
    /// 未知の kid を受け取った際の強制再取得の最小間隔（秒）。
    #[serde(default = "default_kid_miss_refresh_secs")]
    pub kid_miss_refresh_secs: u64,
}

impl JwksConfig {
    /// 最小限の設定で JwksConfig を生成する。その他はデフォルト値が使用される。
    pub fn new(jwks_url: &str, issuer: &str, audience: &str) -> Self {
        Self {
            jwks_url: jwks_url.to_string(),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_stale_secs: default_max_stale_secs(),
            fetch_timeout_secs: default_timeout_secs(),
            leeway_secs: 0,
            kid_miss_refresh_secs: default_kid_miss_refresh_secs(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn max_stale(&self) -> Duration {
        Duration::from_secs(self.max_stale_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn kid_miss_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.kid_miss_refresh_secs)
    }
}

/// DeviceFlowConfig は Device Authorization Grant クライアントの設定。
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceFlowConfig {
    pub device_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    /// コンフィデンシャルクライアントの場合のみ設定する（Vault から取得）。
    #[serde(default)]
    pub client_secret: Option<SecretString>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    #[serde(default = "default_slow_down_increment_secs")]
    pub slow_down_increment_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl DeviceFlowConfig {
    pub fn new(device_endpoint: &str, token_endpoint: &str, client_id: &str) -> Self {
        Self {
            device_endpoint: device_endpoint.to_string(),
            token_endpoint: token_endpoint.to_string(),
            client_id: client_id.to_string(),
            client_secret: None,
            scope: None,
            default_interval_secs: default_interval_secs(),
            slow_down_increment_secs: default_slow_down_increment_secs(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl AuthConfig {
    /// YAML 文字列から設定を読み込み、バリデーションする。
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: AuthConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// YAML ファイルから設定を読み込む。
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    /// 設定値のバリデーション。
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_http_url("jwks.jwks_url", &self.jwks.jwks_url)?;
        if self.jwks.issuer.is_empty() {
            return Err(ConfigError::Validation("jwks.issuer is required".into()));
        }
        if self.jwks.audience.is_empty() {
            return Err(ConfigError::Validation("jwks.audience is required".into()));
        }
        if self.jwks.cache_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "jwks.cache_ttl_secs must be > 0".into(),
            ));
        }

        if let Some(df) = &self.device_flow {
            require_http_url("device_flow.device_endpoint", &df.device_endpoint)?;
            require_http_url("device_flow.token_endpoint", &df.token_endpoint)?;
            if df.client_id.is_empty() {
                return Err(ConfigError::Validation(
                    "device_flow.client_id is required".into(),
                ));
            }
            if df.default_interval_secs == 0 {
                return Err(ConfigError::Validation(
                    "device_flow.default_interval_secs must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

fn require_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{field} must be an http(s) URL"
        )))
    }
}
