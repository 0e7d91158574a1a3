//! 統合テスト共通: RS256 トークンの発行と固定 JWKS を返すフェッチャー。

#![allow(dead_code)]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use k1s0_authguard::{JwksConfig, JwksFetchError, JwksFetcher, JwksVerifier};
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ISSUER: &str = "https://auth.k1s0.internal.example.com/realms/k1s0";
pub const AUDIENCE: &str = "k1s0-api";
pub const KID: &str = "integration-key-1";

fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
}

struct StaticFetcher {
    keys: JwkSet,
}

#[async_trait::async_trait]
impl JwksFetcher for StaticFetcher {
    async fn fetch_keys(&self, _jwks_url: &str) -> Result<JwkSet, JwksFetchError> {
        Ok(self.keys.clone())
    }
}

pub fn verifier() -> Arc<JwksVerifier> {
    let public_key = signing_key().to_public_key();
    let jwk: Jwk = serde_json::from_value(json!({
        "kty": "RSA",
        "kid": KID,
        "use": "sig",
        "alg": "RS256",
        "n": URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        "e": URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    }))
    .unwrap();

    let config = JwksConfig::new(
        "https://auth.k1s0.internal.example.com/realms/k1s0/protocol/openid-connect/certs",
        ISSUER,
        AUDIENCE,
    );
    let fetcher = Arc::new(StaticFetcher {
        keys: JwkSet { keys: vec![jwk] },
    });
    Arc::new(JwksVerifier::with_fetcher(&config, fetcher))
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// 指定のレルムロール・リソースロール・Tier を持つトークンを発行する。
pub fn token(realm_roles: &[&str], resource_access: Value, tier_access: &[&str]) -> String {
    let now = now();
    sign(&json!({
        "sub": "user-uuid-1234",
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": now + 900,
        "iat": now,
        "preferred_username": "taro.yamada",
        "realm_access": { "roles": realm_roles },
        "resource_access": resource_access,
        "tier_access": tier_access,
    }))
}

pub fn expired_token() -> String {
    let now = now();
    sign(&json!({
        "sub": "user-uuid-1234",
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": now - 3600,
        "iat": now - 7200,
    }))
}

fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.into());
    let pem = signing_key()
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .unwrap();
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}
