//! axum 用の認証ミドルウェア。
//!
//! `auth_middleware` で Bearer トークンを検証して Claims をリクエストエクステンションに格納し、
//! その内側に `require_role` 等のガードを重ねて認可を行う。
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/orders", get(list_orders))
//!     .layer(axum::middleware::from_fn(require_permission("order-service", "read")))
//!     .layer(axum::middleware::from_fn_with_state(state, auth_middleware));
//! ```

use crate::claims::Claims;
use crate::error::AuthError;
use crate::rbac;
use crate::verifier::JwksVerifier;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// ガードミドルウェアの戻り値型。
type GuardFuture = Pin<Box<dyn Future<Output = Result<Response, AuthErrorResponse>> + Send>>;

/// AuthState はミドルウェアが使用する共有状態。
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<JwksVerifier>,
}

impl AuthState {
    pub fn new(verifier: Arc<JwksVerifier>) -> Self {
        Self { verifier }
    }
}

/// auth_middleware は JWT 認証ミドルウェア。
/// Authorization ヘッダーから Bearer トークンを取得し、JWKS 検証を行う。
/// 検証成功時は Claims をリクエストエクステンションに格納する。
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthErrorResponse> {
    let token = extract_bearer_token(req.headers()).map_err(reject)?;
    let claims = state.verifier.verify_token(&token).await.map_err(reject)?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

fn reject(err: AuthError) -> AuthErrorResponse {
    debug!(code = err.code(), error = %err, "HTTP リクエストを拒否しました");
    AuthErrorResponse::from(err)
}

/// Claims を取り出して `check` を適用するガードを組み立てる。
fn guard<F>(check: F) -> impl Fn(Request, Next) -> GuardFuture + Clone
where
    F: Fn(&Claims) -> Result<(), AuthError> + Clone + Send + Sync + 'static,
{
    move |req: Request, next: Next| {
        let check = check.clone();
        Box::pin(async move {
            let claims = req
                .extensions()
                .get::<Claims>()
                .ok_or_else(AuthErrorResponse::unauthenticated)?;

            check(claims).map_err(reject)?;

            Ok(next.run(req).await)
        })
    }
}

/// require_role は指定ロールを必須とするミドルウェアファクトリ。
/// auth_middleware の後に使用すること。
pub fn require_role(role: impl Into<Arc<str>>) -> impl Fn(Request, Next) -> GuardFuture + Clone {
    let role: Arc<str> = role.into();
    guard(move |claims| {
        if rbac::has_role(claims, &role) {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied)
        }
    })
}

/// require_permission は指定リソース・アクションの権限を必須とするミドルウェアファクトリ。
/// auth_middleware の後に使用すること。
pub fn require_permission(
    resource: impl Into<Arc<str>>,
    action: impl Into<Arc<str>>,
) -> impl Fn(Request, Next) -> GuardFuture + Clone {
    let resource: Arc<str> = resource.into();
    let action: Arc<str> = action.into();
    guard(move |claims| {
        if rbac::has_permission(claims, &resource, &action) {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied)
        }
    })
}

/// require_tier_access は指定 Tier へのアクセスを必須とするミドルウェアファクトリ。
/// auth_middleware の後に使用すること。
pub fn require_tier_access(
    tier: impl Into<Arc<str>>,
) -> impl Fn(Request, Next) -> GuardFuture + Clone {
    let tier: Arc<str> = tier.into();
    guard(move |claims| {
        if rbac::has_tier_access(claims, &tier) {
            Ok(())
        } else {
            Err(AuthError::TierAccessDenied)
        }
    })
}

/// リクエストエクステンションから Claims を取得する。
pub fn get_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}

/// AuthClaims はハンドラー引数で Claims を受け取るためのエクストラクター。
/// Claims が存在しない（auth_middleware を通っていない）場合は 401 を返す。
#[derive(Debug, Clone)]
pub struct AuthClaims(pub Claims);

impl<S> FromRequestParts<S> for AuthClaims
where
    S: Send + Sync,
{
    type Rejection = AuthErrorResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .map(AuthClaims)
            .ok_or_else(AuthErrorResponse::unauthenticated)
    }
}

/// Bearer トークンを Authorization ヘッダーから取得する。
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthHeader)?;

    parse_bearer(value).map(str::to_string)
}

/// `Bearer <token>` 形式の値からトークン部分を取り出す。スキームは大文字小文字を区別しない。
pub(crate) fn parse_bearer(value: &str) -> Result<&str, AuthError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AuthError::MissingToken);
    }

    let (scheme, token) = value
        .split_once(char::is_whitespace)
        .unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }

    Ok(token)
}

/// AuthErrorResponse は認証エラーの HTTP レスポンス。
#[derive(Debug)]
pub struct AuthErrorResponse {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: &'static str,
}

impl From<AuthError> for AuthErrorResponse {
    fn from(err: AuthError) -> Self {
        let code = err.code();
        let (status, message) = match err {
            AuthError::MissingToken | AuthError::InvalidAuthHeader => {
                (StatusCode::UNAUTHORIZED, "認証が必要です")
            }
            AuthError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "トークンの有効期限が切れています",
            ),
            AuthError::InvalidToken(_)
            | AuthError::MalformedClaims(_)
            | AuthError::IssuerMismatch
            | AuthError::AudienceMismatch => (StatusCode::UNAUTHORIZED, "トークンが無効です"),
            AuthError::JwksUnavailable(_) => (
                StatusCode::UNAUTHORIZED,
                "認証サービスへの接続に失敗しました",
            ),
            AuthError::PermissionDenied => (
                StatusCode::FORBIDDEN,
                "この操作を実行する権限がありません",
            ),
            AuthError::TierAccessDenied => (
                StatusCode::FORBIDDEN,
                "このTierへのアクセス権がありません",
            ),
        };
        Self {
            status,
            code,
            message,
        }
    }
}

impl AuthErrorResponse {
    fn unauthenticated() -> Self {
        Self::from(AuthError::MissingToken)
    }
}

impl IntoResponse for AuthErrorResponse {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code,
            "message": self.message,
        }));

        if self.status == StatusCode::UNAUTHORIZED {
            (self.status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (self.status, body).into_response()
        }
    }
}
