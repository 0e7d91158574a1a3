//! 認証・認可エラー定義。

/// AuthError は認証（401）・認可（403）のエラーを表す。
///
/// 内部の診断文字列（`InvalidToken` 等の引数）はログ専用であり、
/// HTTP / gRPC の境界を越えるメッセージには含めない。
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingToken,

    #[error("invalid Authorization header format")]
    InvalidAuthHeader,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("malformed claims: {0}")]
    MalformedClaims(String),

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("audience mismatch")]
    AudienceMismatch,

    /// JWKS が取得できず、利用可能なキャッシュも存在しない。
    #[error("JWKS unavailable: {0}")]
    JwksUnavailable(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("tier access denied")]
    TierAccessDenied,
}

impl AuthError {
    /// 認証エラー（401 / UNAUTHENTICATED）かを返す。
    pub fn is_authentication(&self) -> bool {
        !self.is_authorization()
    }

    /// 認可エラー（403 / PERMISSION_DENIED）かを返す。
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::TierAccessDenied)
    }

    /// 境界で返す安定したエラーコード。
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken | Self::InvalidAuthHeader => "SYS_AUTH_UNAUTHENTICATED",
            Self::TokenExpired => "SYS_AUTH_TOKEN_EXPIRED",
            Self::InvalidToken(_)
            | Self::MalformedClaims(_)
            | Self::IssuerMismatch
            | Self::AudienceMismatch => "SYS_AUTH_INVALID_TOKEN",
            Self::JwksUnavailable(_) => "SYS_AUTH_JWKS_UNAVAILABLE",
            Self::PermissionDenied => "SYS_AUTH_FORBIDDEN",
            Self::TierAccessDenied => "SYS_AUTH_TIER_FORBIDDEN",
        }
    }
}

/// JwksFetchError は JWKS エンドポイントからの取得失敗を表す。
///
/// 検証器内で stale キャッシュにより回復されるか、`AuthError::JwksUnavailable` に昇格する。
#[derive(thiserror::Error, Debug)]
pub enum JwksFetchError {
    #[error("JWKS request failed: {0}")]
    Http(String),

    #[error("JWKS endpoint returned status {0}")]
    Status(u16),

    #[error("failed to parse JWKS: {0}")]
    Parse(String),
}
