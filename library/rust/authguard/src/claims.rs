//! JWT Claims の型付き射影（認証認可設計.md 準拠）。
//!
//! 署名・iss・aud・exp の検証は verifier が行う。このモジュールは検証済みの
//! Claim バッグ（JSON オブジェクト）を `Claims` に変換するだけなので、鍵なしで単体テストできる。

use crate::error::AuthError;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// RawClaims は JOSE ライブラリがデコードした汎用の Claim バッグ。
pub type RawClaims = Map<String, Value>;

/// Claims は JWT トークンの Claims 構造体。
///
/// リクエスト毎に生成され、永続化されない。
/// 任意項目は欠落・型不一致の場合に空の値へ縮退する。
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Claims {
    /// ユーザーの一意識別子（UUID）
    pub sub: String,

    /// トークン発行者
    pub iss: String,

    /// 対象オーディエンス（配列の場合は先頭要素）
    pub aud: Option<String>,

    /// 有効期限（Unix タイムスタンプ）
    pub exp: u64,

    /// 発行時刻（Unix タイムスタンプ）
    pub iat: Option<u64>,

    pub jti: Option<String>,

    pub typ: Option<String>,

    /// Authorized party
    pub azp: Option<String>,

    /// スペース区切りのスコープ
    pub scope: Option<String>,

    pub preferred_username: Option<String>,

    pub email: Option<String>,

    /// realm_access.roles
    pub realm_roles: HashSet<String>,

    /// resource_access.<resource>.roles
    pub resource_access: HashMap<String, HashSet<String>>,

    /// アクセス可能な Tier の一覧
    pub tier_access: BTreeSet<String>,
}

/// 検証済みの Claim バッグを `Claims` に変換する。
///
/// `sub`・`iss`・`exp` が欠落または型不一致の場合のみ `AuthError::MalformedClaims` を返す。
pub fn extract_claims(raw: &RawClaims) -> Result<Claims, AuthError> {
    let sub = required_str(raw, "sub")?;
    let iss = required_str(raw, "iss")?;
    let exp = raw
        .get("exp")
        .and_then(numeric_date)
        .ok_or_else(|| AuthError::MalformedClaims("exp is missing or not a number".into()))?;

    let realm_roles = raw
        .get("realm_access")
        .and_then(|ra| ra.get("roles"))
        .map(string_set)
        .unwrap_or_default();

    let resource_access = raw
        .get("resource_access")
        .and_then(Value::as_object)
        .map(|resources| {
            resources
                .iter()
                .map(|(name, access)| {
                    let roles = access.get("roles").map(string_set).unwrap_or_default();
                    (name.clone(), roles)
                })
                .collect()
        })
        .unwrap_or_default();

    let tier_access = raw
        .get("tier_access")
        .and_then(Value::as_array)
        .map(|tiers| {
            tiers
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Claims {
        sub,
        iss,
        aud: raw.get("aud").and_then(first_audience),
        exp,
        iat: raw.get("iat").and_then(numeric_date),
        jti: optional_str(raw, "jti"),
        typ: optional_str(raw, "typ"),
        azp: optional_str(raw, "azp"),
        scope: optional_str(raw, "scope"),
        preferred_username: optional_str(raw, "preferred_username"),
        email: optional_str(raw, "email"),
        realm_roles,
        resource_access,
        tier_access,
    })
}

fn required_str(raw: &RawClaims, name: &str) -> Result<String, AuthError> {
    raw.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AuthError::MalformedClaims(format!("{name} is missing or not a string")))
}

fn optional_str(raw: &RawClaims, name: &str) -> Option<String> {
    raw.get(name).and_then(Value::as_str).map(str::to_string)
}

/// NumericDate は整数が基本だが、小数秒を付ける発行者もあるため切り捨てて受け付ける。
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn numeric_date(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u64)
    })
}

/// aud は文字列または文字列配列のどちらでも届く。
fn first_audience(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(values) => values.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn string_set(value: &Value) -> HashSet<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Claims {
    /// 現在時刻で有効期限切れかを判定する。
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_unix())
    }

    /// 指定した Unix 時刻で有効期限切れかを判定する。
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.exp <= now
    }

    /// scope をスペースで分割して返す。
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.as_deref().unwrap_or_default().split_whitespace()
    }

    /// 指定リソースのロール集合を返す。存在しない場合は None。
    pub fn resource_roles(&self, resource: &str) -> Option<&HashSet<String>> {
        self.resource_access.get(resource)
    }
}

// Debug / Display は sub・iss・aud・username・email のみを出力する。
impl fmt::Display for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Claims{{sub={}, iss={}, aud={:?}, username={:?}, email={:?}}}",
            self.sub, self.iss, self.aud, self.preferred_username, self.email,
        )
    }
}

impl fmt::Debug for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawClaims {
        match value {
            Value::Object(map) => map,
            _ => panic!("test claims must be an object"),
        }
    }

    #[test]
    fn test_extract_full_keycloak_payload() {
        let claims = extract_claims(&raw(json!({
            "sub": "user-uuid-1234",
            "iss": "https://auth.example.com/realms/k1s0",
            "aud": ["k1s0-api", "account"],
            "exp": 9_999_999_999u64,
            "iat": 1_000_000_000u64,
            "jti": "token-uuid-5678",
            "typ": "Bearer",
            "azp": "react-spa",
            "scope": "openid profile email",
            "preferred_username": "taro.yamada",
            "email": "taro.yamada@example.com",
            "realm_access": {"roles": ["user", "order_manager"]},
            "resource_access": {"order-service": {"roles": ["read", "write"]}},
            "tier_access": ["system", "business"]
        })))
        .unwrap();

        assert_eq!(claims.sub, "user-uuid-1234");
        assert_eq!(claims.aud.as_deref(), Some("k1s0-api"));
        assert_eq!(claims.iat, Some(1_000_000_000));
        assert!(claims.realm_roles.contains("order_manager"));
        assert!(claims.resource_roles("order-service").unwrap().contains("write"));
        assert_eq!(claims.tier_access.len(), 2);
        assert_eq!(claims.scopes().collect::<Vec<_>>(), ["openid", "profile", "email"]);
    }

    #[test]
    fn test_scalar_audience() {
        let claims = extract_claims(&raw(json!({
            "sub": "u", "iss": "i", "exp": 10, "aud": "k1s0-api"
        })))
        .unwrap();
        assert_eq!(claims.aud.as_deref(), Some("k1s0-api"));
    }

    #[test]
    fn test_optional_fields_default_to_empty() {
        let claims = extract_claims(&raw(json!({
            "sub": "u",
            "iss": "i",
            "exp": 10,
            "realm_access": "not-an-object",
            "resource_access": {"svc": {"roles": "read"}},
            "tier_access": [1, "system"],
            "email": 42
        })))
        .unwrap();

        assert!(claims.aud.is_none());
        assert!(claims.email.is_none());
        assert!(claims.realm_roles.is_empty());
        assert!(claims.resource_roles("svc").unwrap().is_empty());
        assert!(claims.resource_roles("other").is_none());
        assert_eq!(claims.tier_access.iter().collect::<Vec<_>>(), ["system"]);
        assert_eq!(claims.scopes().count(), 0);
    }

    #[test]
    fn test_missing_mandatory_fields() {
        for payload in [
            json!({"iss": "i", "exp": 10}),
            json!({"sub": "u", "exp": 10}),
            json!({"sub": "u", "iss": "i"}),
            json!({"sub": 1, "iss": "i", "exp": 10}),
            json!({"sub": "u", "iss": "i", "exp": "tomorrow"}),
        ] {
            let result = extract_claims(&raw(payload));
            assert!(matches!(result, Err(AuthError::MalformedClaims(_))));
        }
    }

    #[test]
    fn test_fractional_exp_is_truncated() {
        let claims = extract_claims(&raw(json!({"sub": "u", "iss": "i", "exp": 100.9}))).unwrap();
        assert_eq!(claims.exp, 100);
    }

    #[test]
    fn test_is_expired_at() {
        let claims = Claims {
            exp: 1_000,
            ..Claims::default()
        };
        assert!(!claims.is_expired_at(999));
        assert!(claims.is_expired_at(1_000));
        assert!(claims.is_expired_at(2_000));
    }

    #[test]
    fn test_debug_only_prints_identity() {
        let claims = Claims {
            sub: "user-1".into(),
            iss: "https://auth.example.com/realms/k1s0".into(),
            aud: Some("k1s0-api".into()),
            jti: Some("secret-jti".into()),
            scope: Some("openid".into()),
            preferred_username: Some("taro".into()),
            email: Some("taro@example.com".into()),
            ..Claims::default()
        };

        let s = format!("{claims:?}");
        assert!(s.contains("user-1"));
        assert!(s.contains("taro@example.com"));
        assert!(!s.contains("secret-jti"));
        assert_eq!(s, claims.to_string());
    }
}
