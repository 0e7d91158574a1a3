//! JWKS 検証器: HTTP で公開鍵を取得しキャッシュ、JWT トークンを検証する。
//!
//! 検証は 2 段階で行う。
//! 1. jsonwebtoken による署名・iss・aud・exp の検証と汎用 Claim バッグへのデコード
//! 2. `claims::extract_claims` による型付き `Claims` への射影

use crate::claims::{extract_claims, now_unix, Claims, RawClaims};
use crate::config::JwksConfig;
use crate::error::{AuthError, JwksFetchError};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// JWKS 取得に失敗した後、再取得を試みるまでの待機時間。
const FAILED_REFRESH_BACKOFF: Duration = Duration::from_secs(5);

/// JwksFetcher は JWKS エンドポイントからの鍵取得を抽象化するトレイト。
#[async_trait::async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch_keys(&self, jwks_url: &str) -> Result<JwkSet, JwksFetchError>;
}

/// HttpJwksFetcher は reqwest 経由で JWKS を取得するデフォルト実装。
pub struct HttpJwksFetcher {
    http_client: reqwest::Client,
}

impl HttpJwksFetcher {
    pub fn new(timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "HTTP クライアントの構築に失敗したためデフォルト設定を使用します");
                reqwest::Client::new()
            });
        Self { http_client }
    }
}

#[async_trait::async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch_keys(&self, jwks_url: &str) -> Result<JwkSet, JwksFetchError> {
        let resp = self
            .http_client
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| JwksFetchError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(JwksFetchError::Status(resp.status().as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| JwksFetchError::Http(e.to_string()))?;
        parse_jwk_set(&body)
    }
}

#[derive(Deserialize)]
struct RawJwkSet {
    keys: Vec<serde_json::Value>,
}

/// JWK Set の JSON を解析する。
///
/// 未対応の鍵（暗号化用途や未知のアルゴリズム）は 1 件ずつ読み飛ばし、
/// セット全体を失敗させない。
pub fn parse_jwk_set(body: &[u8]) -> Result<JwkSet, JwksFetchError> {
    let raw: RawJwkSet =
        serde_json::from_slice(body).map_err(|e| JwksFetchError::Parse(e.to_string()))?;

    let keys = raw
        .keys
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Jwk>(value) {
            Ok(jwk) => Some(jwk),
            Err(e) => {
                debug!(error = %e, "未対応の JWK を読み飛ばします");
                None
            }
        })
        .filter(|jwk| !matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)))
        .collect();

    Ok(JwkSet { keys })
}

/// ヘッダーの alg が鍵種別と整合するかを判定する。共通鍵（oct）は常に拒否する。
fn key_accepts(jwk: &Jwk, alg: Algorithm) -> bool {
    let family_ok = match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => matches!(
            alg,
            Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512
        ),
        AlgorithmParameters::EllipticCurve(_) => {
            matches!(alg, Algorithm::ES256 | Algorithm::ES384)
        }
        AlgorithmParameters::OctetKeyPair(_) => alg == Algorithm::EdDSA,
        _ => false,
    };

    // JWK 側で alg が宣言されていればそれに一致すること。
    let declared_ok = jwk
        .common
        .key_algorithm
        .as_ref()
        .map_or(true, |ka| signing_algorithm(ka) == Some(alg));

    family_ok && declared_ok
}

/// JWK の `alg` を署名アルゴリズムに対応付ける。暗号化用のアルゴリズムは None。
fn signing_algorithm(key_algorithm: &KeyAlgorithm) -> Option<Algorithm> {
    match key_algorithm {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        KeyAlgorithm::RSA1_5 | KeyAlgorithm::RSA_OAEP | KeyAlgorithm::RSA_OAEP_256 => None,
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
        ErrorKind::InvalidAudience => AuthError::AudienceMismatch,
        ErrorKind::MissingRequiredClaim(claim) => {
            AuthError::MalformedClaims(format!("{claim} is missing"))
        }
        _ => AuthError::InvalidToken(err.to_string()),
    }
}

/// 取得済みの鍵セット。
struct JwksCache {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
    /// invalidate_cache() 後は TTL 内でも再取得する。
    invalidated: bool,
}

/// 検証器ごとのキャッシュと再取得の記録。取得失敗時の状態もここに残す。
#[derive(Default)]
struct JwksState {
    cache: Option<JwksCache>,
    /// 直近の取得失敗後、この時刻までは再取得しない。
    retry_after: Option<Instant>,
    /// 未知の kid による直近の再取得の試行時刻（成否を問わない）。
    last_kid_refresh: Option<Instant>,
}

impl JwksState {
    fn in_backoff(&self, now: Instant) -> bool {
        self.retry_after.is_some_and(|t| now < t)
    }
}

/// JwksVerifier は JWKS エンドポイントから公開鍵を取得し、JWT トークンを検証する。
///
/// キャッシュはインスタンスごとに保持するため、発行者・テナントごとに
/// 複数の検証器を同一プロセスで併用できる。
pub struct JwksVerifier {
    jwks_url: String,
    issuer: String,
    audience: String,
    cache_ttl: Duration,
    max_stale: Duration,
    leeway_secs: u64,
    kid_miss_refresh_interval: Duration,
    state: RwLock<JwksState>,
    /// 再取得を 1 本に直列化するためのガード。
    refresh_lock: Mutex<()>,
    fetcher: Arc<dyn JwksFetcher>,
}

impl JwksVerifier {
    /// 新しい JwksVerifier を生成する。その他の設定はデフォルト値が使用される。
    pub fn new(jwks_url: &str, issuer: &str, audience: &str, cache_ttl: Duration) -> Self {
        let mut config = JwksConfig::new(jwks_url, issuer, audience);
        config.cache_ttl_secs = cache_ttl.as_secs();
        Self::from_config(&config)
    }

    /// 設定から JwksVerifier を生成する。
    pub fn from_config(config: &JwksConfig) -> Self {
        let fetcher = Arc::new(HttpJwksFetcher::new(config.fetch_timeout()));
        Self::with_fetcher(config, fetcher)
    }

    /// カスタムフェッチャーを使う JwksVerifier を生成する。
    pub fn with_fetcher(config: &JwksConfig, fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self {
            jwks_url: config.jwks_url.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            cache_ttl: config.cache_ttl(),
            max_stale: config.max_stale(),
            leeway_secs: config.leeway_secs,
            kid_miss_refresh_interval: config.kid_miss_refresh_interval(),
            state: RwLock::new(JwksState::default()),
            refresh_lock: Mutex::new(()),
            fetcher,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// JWT トークン文字列を検証し、Claims を返す。
    pub async fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::InvalidToken("missing kid in header".into()))?;

        let mut keys = self.current_keys().await?;
        if keys.find(kid).is_none() {
            keys = self.refresh_for_unknown_kid().await?;
        }
        let jwk = keys
            .find(kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown kid: {kid}")))?;

        if !key_accepts(jwk, header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} is not allowed for kid {kid}",
                header.alg
            )));
        }

        let key = DecodingKey::from_jwk(jwk).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = self.leeway_secs;

        let data = decode::<RawClaims>(token, &key, &validation).map_err(map_jwt_error)?;
        let claims = extract_claims(&data.claims)?;

        if claims.is_expired_at(now_unix().saturating_sub(self.leeway_secs)) {
            return Err(AuthError::TokenExpired);
        }

        Ok(claims)
    }

    /// キャッシュを無効化する。鍵ローテーション時に使用。
    ///
    /// 鍵自体は保持し、次回の取得に失敗した場合の stale フォールバックに使う。
    pub async fn invalidate_cache(&self) {
        let mut state = self.state.write().await;
        if let Some(c) = state.cache.as_mut() {
            c.invalidated = true;
        }
        state.retry_after = None;
    }

    /// 即座に JWKS を再取得する。起動時のウォームアップ等に使用。
    pub async fn refresh(&self) -> Result<(), AuthError> {
        self.invalidate_cache().await;
        self.current_keys().await.map(|_| ())
    }

    /// ネットワークに出ずにキャッシュから鍵を返せるかを判定する。
    ///
    /// 取得失敗後のバックオフ中は、無効化済みや TTL 切れでも stale の上限内なら再取得しない。
    fn cached_keys(&self, state: &JwksState, now: Instant) -> Option<Arc<JwkSet>> {
        let cache = state.cache.as_ref()?;
        let usable = if state.in_backoff(now) {
            self.within_stale_bound(cache, now)
        } else {
            !cache.invalidated && now.duration_since(cache.fetched_at) < self.cache_ttl
        };
        usable.then(|| cache.keys.clone())
    }

    fn within_stale_bound(&self, cache: &JwksCache, now: Instant) -> bool {
        now.duration_since(cache.fetched_at) < self.cache_ttl + self.max_stale
    }

    fn backoff_error(&self) -> AuthError {
        AuthError::JwksUnavailable(format!(
            "JWKS fetch from {} failed recently; retrying after backoff",
            self.jwks_url
        ))
    }

    /// キャッシュから鍵を取得する。TTL を超えている場合は再取得する。
    async fn current_keys(&self) -> Result<Arc<JwkSet>, AuthError> {
        // Read lock でキャッシュを確認
        let stale = {
            let state = self.state.read().await;
            let now = Instant::now();
            if let Some(keys) = self.cached_keys(&state, now) {
                return Ok(keys);
            }
            if state.cache.is_none() && state.in_backoff(now) {
                return Err(self.backoff_error());
            }
            state
                .cache
                .as_ref()
                .filter(|c| self.within_stale_bound(c, now))
                .map(|c| c.keys.clone())
        };

        // 他の呼び出しが再取得中なら、利用可能な stale キャッシュでネットワーク待ちをせずに検証する
        let _guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(keys) = stale {
                    debug!(jwks_url = %self.jwks_url, "JWKS 再取得中のためキャッシュ済みの鍵を使用します");
                    return Ok(keys);
                }
                self.refresh_lock.lock().await
            }
        };

        // ダブルチェック: 待機中に別の呼び出しが再取得を完了（または失敗）しているかもしれない
        {
            let state = self.state.read().await;
            let now = Instant::now();
            if let Some(keys) = self.cached_keys(&state, now) {
                return Ok(keys);
            }
            if state.cache.is_none() && state.in_backoff(now) {
                return Err(self.backoff_error());
            }
        }

        self.fetch_and_store().await
    }

    /// 未知の kid を受け取った場合に強制再取得する。
    ///
    /// 直近の取得・試行から `kid_miss_refresh_interval` 以内、または取得失敗後のバックオフ中は
    /// 現在のキャッシュを返す。
    async fn refresh_for_unknown_kid(&self) -> Result<Arc<JwkSet>, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        {
            let mut state = self.state.write().await;
            let now = Instant::now();
            let recent = |at: Instant| now.duration_since(at) < self.kid_miss_refresh_interval;
            let skip = state.in_backoff(now)
                || state.last_kid_refresh.is_some_and(recent)
                || state.cache.as_ref().is_some_and(|c| recent(c.fetched_at));
            if skip {
                return match state.cache.as_ref() {
                    Some(c) => Ok(c.keys.clone()),
                    None => Err(self.backoff_error()),
                };
            }
            state.last_kid_refresh = Some(now);
        }
        debug!(jwks_url = %self.jwks_url, "未知の kid を受け取ったため JWKS を再取得します");
        self.fetch_and_store().await
    }

    /// JWKS を取得してキャッシュを更新する。呼び出し側で refresh_lock を保持していること。
    async fn fetch_and_store(&self) -> Result<Arc<JwkSet>, AuthError> {
        match self.fetcher.fetch_keys(&self.jwks_url).await {
            Ok(set) => {
                let keys = Arc::new(set);
                info!(
                    jwks_url = %self.jwks_url,
                    key_count = keys.keys.len(),
                    "JWKS キャッシュを更新しました"
                );
                let mut state = self.state.write().await;
                state.cache = Some(JwksCache {
                    keys: keys.clone(),
                    fetched_at: Instant::now(),
                    invalidated: false,
                });
                state.retry_after = None;
                Ok(keys)
            }
            Err(e) => {
                let mut state = self.state.write().await;
                let now = Instant::now();
                state.retry_after = Some(now + FAILED_REFRESH_BACKOFF);
                match state.cache.as_ref() {
                    Some(c) if self.within_stale_bound(c, now) => {
                        warn!(
                            jwks_url = %self.jwks_url,
                            error = %e,
                            stale_for_secs = now.duration_since(c.fetched_at).as_secs(),
                            "JWKS の取得に失敗したため stale キャッシュを使用します"
                        );
                        Ok(c.keys.clone())
                    }
                    _ => {
                        error!(
                            jwks_url = %self.jwks_url,
                            error = %e,
                            "JWKS の取得に失敗し、利用可能なキャッシュがありません"
                        );
                        Err(AuthError::JwksUnavailable(e.to_string()))
                    }
                }
            }
        }
    }
}
