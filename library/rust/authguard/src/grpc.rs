//! tonic 用の認証インターセプター。
//!
//! `authorization` メタデータから Bearer トークンを取得し、HTTP ミドルウェアと同じ規則で検証する。
//! 失敗理由によらず `UNAUTHENTICATED` を返し、検証の詳細はステータスメッセージに含めない。
//!
//! 利用方法は 2 通り:
//! - `GrpcAuthLayer` を tonic サーバーに積み、全 RPC をトランスポート層で認証する
//! - ハンドラー内で `GrpcAuthInterceptor::unary` / `streaming` を呼び、呼び出し単位で認証する

use crate::claims::Claims;
use crate::error::AuthError;
use crate::middleware::{extract_bearer_token, parse_bearer};
use crate::rbac;
use crate::verifier::JwksVerifier;
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::metadata::MetadataMap;
use tonic::{Request, Status};
use tower::{Layer, Service};
use tracing::debug;

fn unauthenticated() -> Status {
    Status::unauthenticated("認証が必要です")
}

fn permission_denied() -> Status {
    Status::permission_denied("この操作を実行する権限がありません")
}

fn to_status(err: AuthError) -> Status {
    debug!(code = err.code(), error = %err, "gRPC リクエストを拒否しました");
    if err.is_authorization() {
        permission_denied()
    } else {
        unauthenticated()
    }
}

fn bearer_from_metadata(metadata: &MetadataMap) -> Result<&str, AuthError> {
    let value = metadata
        .get("authorization")
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthHeader)?;
    parse_bearer(value)
}

/// GrpcAuthInterceptor は RPC 呼び出し単位で認証を行う。
#[derive(Clone)]
pub struct GrpcAuthInterceptor {
    verifier: Arc<JwksVerifier>,
}

impl GrpcAuthInterceptor {
    pub fn new(verifier: Arc<JwksVerifier>) -> Self {
        Self { verifier }
    }

    /// メタデータの Bearer トークンを検証し、Claims を返す。
    pub async fn authenticate(&self, metadata: &MetadataMap) -> Result<Claims, Status> {
        let token = bearer_from_metadata(metadata).map_err(to_status)?;
        self.verifier.verify_token(token).await.map_err(to_status)
    }

    /// Unary RPC を認証してからハンドラーを呼び出す。
    ///
    /// 認証に失敗した場合はハンドラーを呼び出さない。成功時は Claims をリクエストエクステンションに格納する。
    pub async fn unary<T, R, F, Fut>(&self, mut request: Request<T>, handler: F) -> Result<R, Status>
    where
        F: FnOnce(Request<T>) -> Fut,
        Fut: Future<Output = Result<R, Status>>,
    {
        let claims = self.authenticate(request.metadata()).await?;
        request.extensions_mut().insert(claims);
        handler(request).await
    }

    /// ストリーミング RPC を認証してからハンドラーを呼び出す。
    ///
    /// ハンドラーには元のストリームを `AuthenticatedStream` で包んだリクエストが渡される。
    pub async fn streaming<S, R, F, Fut>(&self, request: Request<S>, handler: F) -> Result<R, Status>
    where
        F: FnOnce(Request<AuthenticatedStream<S>>) -> Fut,
        Fut: Future<Output = Result<R, Status>>,
    {
        let claims = self.authenticate(request.metadata()).await?;
        let mut request = request.map(|inner| AuthenticatedStream::new(inner, claims.clone()));
        request.extensions_mut().insert(claims);
        handler(request).await
    }
}

pin_project! {
    /// AuthenticatedStream は検証済み Claims を保持するストリームのデコレーター。
    ///
    /// `claims()` 以外の操作はすべて元のストリームに委譲する。
    pub struct AuthenticatedStream<S> {
        #[pin]
        inner: S,
        claims: Claims,
    }
}

impl<S> AuthenticatedStream<S> {
    pub fn new(inner: S, claims: Claims) -> Self {
        Self { inner, claims }
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Stream> Stream for AuthenticatedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// GrpcAuthLayer は全 RPC を認証する tower レイヤー。
///
/// ```ignore
/// Server::builder()
///     .layer(GrpcAuthLayer::new(verifier))
///     .add_service(OrderServiceServer::new(svc))
/// ```
#[derive(Clone)]
pub struct GrpcAuthLayer {
    verifier: Arc<JwksVerifier>,
}

impl GrpcAuthLayer {
    pub fn new(verifier: Arc<JwksVerifier>) -> Self {
        Self { verifier }
    }
}

impl<S> Layer<S> for GrpcAuthLayer {
    type Service = GrpcAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcAuthService {
            inner,
            verifier: self.verifier.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GrpcAuthService<S> {
    inner: S,
    verifier: Arc<JwksVerifier>,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for GrpcAuthService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<BoxBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // poll_ready 済みのインスタンスを future に渡す
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let verifier = self.verifier.clone();

        Box::pin(async move {
            let token = extract_bearer_token(req.headers());
            let result = match token {
                Ok(token) => verifier.verify_token(&token).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(claims) => {
                    req.extensions_mut().insert(claims);
                    inner.call(req).await
                }
                Err(e) => Ok(to_status(e).into_http()),
            }
        })
    }
}

/// リクエストエクステンションから Claims を取得する。存在しない場合は `UNAUTHENTICATED`。
pub fn claims_from_request<T>(request: &Request<T>) -> Result<&Claims, Status> {
    request
        .extensions()
        .get::<Claims>()
        .ok_or_else(unauthenticated)
}

/// 指定レルムロールを必須とする。満たさない場合は `PERMISSION_DENIED`。
pub fn require_role<T>(request: &Request<T>, role: &str) -> Result<(), Status> {
    let claims = claims_from_request(request)?;
    if rbac::has_role(claims, role) {
        Ok(())
    } else {
        Err(to_status(AuthError::PermissionDenied))
    }
}

/// 指定リソース・アクションの権限を必須とする。
pub fn require_permission<T>(request: &Request<T>, resource: &str, action: &str) -> Result<(), Status> {
    let claims = claims_from_request(request)?;
    if rbac::has_permission(claims, resource, action) {
        Ok(())
    } else {
        Err(to_status(AuthError::PermissionDenied))
    }
}

/// 指定 Tier へのアクセスを必須とする。
pub fn require_tier_access<T>(request: &Request<T>, tier: &str) -> Result<(), Status> {
    let claims = claims_from_request(request)?;
    if rbac::has_tier_access(claims, tier) {
        Ok(())
    } else {
        Err(to_status(AuthError::TierAccessDenied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwksConfig;
    use crate::error::JwksFetchError;
    use crate::verifier::JwksFetcher;
    use jsonwebtoken::jwk::JwkSet;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_stream::StreamExt;
    use tonic::Code;

    /// 呼び出し回数だけを数え、常に失敗するフェッチャー。
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl JwksFetcher for CountingFetcher {
        async fn fetch_keys(&self, _jwks_url: &str) -> Result<JwkSet, JwksFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(JwksFetchError::Status(503))
        }
    }

    fn make_interceptor() -> (GrpcAuthInterceptor, Arc<CountingFetcher>) {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let config = JwksConfig::new(
            "https://auth.example.com/certs",
            "https://auth.example.com/realms/k1s0",
            "k1s0-api",
        );
        let verifier = Arc::new(JwksVerifier::with_fetcher(&config, fetcher.clone()));
        (GrpcAuthInterceptor::new(verifier), fetcher)
    }

    fn request_with_auth(value: &str) -> Request<()> {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("authorization", value.parse().unwrap());
        request
    }

    fn request_with_claims(claims: Claims) -> Request<()> {
        let mut request = Request::new(());
        request.extensions_mut().insert(claims);
        request
    }

    #[tokio::test]
    async fn test_unary_without_metadata_never_calls_handler() {
        let (interceptor, fetcher) = make_interceptor();
        let called = AtomicBool::new(false);

        let result = interceptor
            .unary(Request::new(()), |_req| async {
                called.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unary_wrong_scheme_is_unauthenticated() {
        let (interceptor, _) = make_interceptor();

        let status = interceptor
            .unary(request_with_auth("Basic dXNlcjpwYXNz"), |_req| async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unauthenticated);
        assert_eq!(status.message(), "認証が必要です");
    }

    #[tokio::test]
    async fn test_invalid_token_message_is_generic() {
        let (interceptor, _) = make_interceptor();

        let status = interceptor
            .authenticate(request_with_auth("Bearer not-a-jwt").metadata())
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unauthenticated);
        assert_eq!(status.message(), "認証が必要です");
    }

    #[tokio::test]
    async fn test_streaming_without_metadata_never_calls_handler() {
        let (interceptor, _) = make_interceptor();
        let called = AtomicBool::new(false);

        let result = interceptor
            .streaming(Request::new(tokio_stream::iter(vec![1, 2, 3])), |_req| async {
                called.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().code(), Code::Unauthenticated);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_authenticated_stream_forwards_items() {
        let claims = Claims {
            sub: "user-1".into(),
            ..Claims::default()
        };
        let stream = AuthenticatedStream::new(tokio_stream::iter(vec![1, 2, 3]), claims);

        assert_eq!(stream.claims().sub, "user-1");
        assert_eq!(stream.size_hint(), (3, Some(3)));

        let items: Vec<i32> = stream.collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn test_claims_from_request_missing() {
        let status = claims_from_request(&Request::new(())).unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
    }

    #[test]
    fn test_guards() {
        let claims = Claims {
            sub: "user-1".into(),
            realm_roles: HashSet::from(["user".to_string()]),
            tier_access: ["system".to_string()].into_iter().collect(),
            ..Claims::default()
        };
        let request = request_with_claims(claims);

        assert!(require_role(&request, "user").is_ok());
        assert_eq!(
            require_role(&request, "admin").unwrap_err().code(),
            Code::PermissionDenied
        );
        assert_eq!(
            require_permission(&request, "order-service", "read")
                .unwrap_err()
                .code(),
            Code::PermissionDenied
        );
        assert!(require_tier_access(&request, "SYSTEM").is_ok());
        assert_eq!(
            require_tier_access(&request, "business").unwrap_err().code(),
            Code::PermissionDenied
        );

        // Claims なしは認可ではなく認証エラー
        assert_eq!(
            require_role(&Request::new(()), "user").unwrap_err().code(),
            Code::Unauthenticated
        );
    }
}
