//! k1s0-authguard: サーバー用 JWT JWKS 検証 + RBAC + Device Authorization Grant ライブラリ
//!
//! JWKS エンドポイントから公開鍵を取得し、JWT の署名検証を行う。
//! Keycloak が発行する JWT Claims に準拠した認証・認可チェックを、
//! axum ミドルウェアと tonic インターセプターの両方で提供する。
//!
//! # 使い方
//!
//! ```ignore
//! use k1s0_authguard::{AuthConfig, JwksVerifier};
//! use std::sync::Arc;
//!
//! let config = AuthConfig::load("config/auth.yaml")?;
//! let verifier = Arc::new(JwksVerifier::from_config(&config.jwks));
//!
//! let claims = verifier.verify_token("eyJ...").await?;
//! if k1s0_authguard::has_permission(&claims, "order-service", "read") {
//!     // ...
//! }
//! ```

pub mod claims;
pub mod config;
pub mod device_flow;
pub mod error;
pub mod grpc;
pub mod middleware;
pub mod rbac;
pub mod verifier;

pub use claims::{extract_claims, Claims, RawClaims};
pub use config::{AuthConfig, ConfigError, DeviceFlowConfig, JwksConfig};
pub use device_flow::{
    DeviceAuthClient, DeviceCodeResponse, DeviceFlowError, DeviceFlowHttpClient, DeviceFlowState,
    OAuthErrorCode, TokenResult,
};
pub use error::{AuthError, JwksFetchError};
pub use grpc::{AuthenticatedStream, GrpcAuthInterceptor, GrpcAuthLayer};
pub use middleware::{auth_middleware, AuthClaims, AuthErrorResponse, AuthState};
pub use rbac::{
    has_any_role, has_permission, has_resource_role, has_role, has_scope, has_tier_access,
};
pub use verifier::{HttpJwksFetcher, JwksFetcher, JwksVerifier};
