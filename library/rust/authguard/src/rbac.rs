//! RBAC ヘルパー: ロール・パーミッション・Tier アクセスの判定。
//!
//! いずれも I/O を伴わない純粋関数。

use crate::claims::Claims;

/// 全リソースの全操作を許可するレルムロール。
pub const SYS_ADMIN_ROLE: &str = "sys_admin";
/// レルムロールとしては全権限、リソースロールとしてはそのリソースの全操作を許可する。
pub const ADMIN_ROLE: &str = "admin";

/// Claims に指定のレルムロールが含まれるかを判定する。
pub fn has_role(claims: &Claims, role: &str) -> bool {
    claims.realm_roles.contains(role)
}

/// Claims に指定レルムロールのいずれかが含まれるかを判定する。
pub fn has_any_role(claims: &Claims, roles: &[&str]) -> bool {
    roles.iter().any(|role| has_role(claims, role))
}

/// Claims に指定のリソースロールが含まれるかを判定する。
pub fn has_resource_role(claims: &Claims, resource: &str, role: &str) -> bool {
    claims
        .resource_roles(resource)
        .is_some_and(|roles| roles.contains(role))
}

/// Claims に指定の権限があるかを判定する。
///
/// 判定順序（セキュリティポリシーのため変更しないこと）:
/// 1. レルムロール `sys_admin`
/// 2. レルムロール `admin`
/// 3. リソースロールが `action` または `admin` に一致
pub fn has_permission(claims: &Claims, resource: &str, action: &str) -> bool {
    if has_role(claims, SYS_ADMIN_ROLE) {
        return true;
    }

    if has_role(claims, ADMIN_ROLE) {
        return true;
    }

    // リソース admin は read/write/delete 等すべての操作を許可する
    has_resource_role(claims, resource, action) || has_resource_role(claims, resource, ADMIN_ROLE)
}

/// Claims で指定 Tier へのアクセスが許可されているかを判定する。大文字小文字は区別しない。
pub fn has_tier_access(claims: &Claims, tier: &str) -> bool {
    claims
        .tier_access
        .iter()
        .any(|t| t.eq_ignore_ascii_case(tier))
}

/// Claims の scope に指定スコープが含まれるかを判定する。
pub fn has_scope(claims: &Claims, scope: &str) -> bool {
    claims.scopes().any(|s| s == scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn make_claims(
        realm_roles: &[&str],
        resource_access: &[(&str, &[&str])],
        tier_access: &[&str],
    ) -> Claims {
        let to_set =
            |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<HashSet<_>>();

        Claims {
            sub: "user-1".into(),
            iss: "https://auth.example.com/realms/k1s0".into(),
            aud: Some("k1s0-api".into()),
            exp: 9_999_999_999,
            preferred_username: Some("taro".into()),
            scope: Some("openid profile".into()),
            realm_roles: to_set(realm_roles),
            resource_access: resource_access
                .iter()
                .map(|(resource, roles)| (resource.to_string(), to_set(*roles)))
                .collect::<HashMap<_, _>>(),
            tier_access: tier_access.iter().map(|s| s.to_string()).collect(),
            ..Claims::default()
        }
    }

    #[test]
    fn test_has_role() {
        let claims = make_claims(&["user", "order_manager"], &[], &[]);

        assert!(has_role(&claims, "user"));
        assert!(has_role(&claims, "order_manager"));
        assert!(!has_role(&claims, "admin"));
        assert!(!has_role(&claims, "sys_admin"));
        assert!(has_any_role(&claims, &["auditor", "order_manager"]));
        assert!(!has_any_role(&claims, &["auditor"]));
    }

    #[test]
    fn test_has_resource_role() {
        let claims = make_claims(&["user"], &[("order-service", &["read", "write"][..])], &[]);

        assert!(has_resource_role(&claims, "order-service", "read"));
        assert!(has_resource_role(&claims, "order-service", "write"));
        assert!(!has_resource_role(&claims, "order-service", "delete"));
        assert!(!has_resource_role(&claims, "user-service", "read"));
    }

    #[test]
    fn test_has_permission_basic() {
        let claims = make_claims(&["user"], &[("order-service", &["read", "write"][..])], &[]);

        assert!(has_permission(&claims, "order-service", "read"));
        assert!(has_permission(&claims, "order-service", "write"));
        assert!(!has_permission(&claims, "order-service", "delete"));
        assert!(!has_permission(&claims, "user-service", "read"));
    }

    #[test]
    fn test_has_permission_sys_admin() {
        let claims = make_claims(&["sys_admin"], &[], &[]);

        for action in ["read", "write", "delete", "anything"] {
            assert!(has_permission(&claims, "any-resource", action));
        }
    }

    #[test]
    fn test_has_permission_realm_admin() {
        let claims = make_claims(&["admin"], &[("order-service", &["read"][..])], &[]);
        assert!(has_permission(&claims, "order-service", "delete"));
        assert!(has_permission(&claims, "unrelated-service", "write"));
    }

    #[test]
    fn test_has_permission_resource_admin() {
        let claims = make_claims(&["user"], &[("order-service", &["admin"][..])], &[]);

        assert!(has_permission(&claims, "order-service", "read"));
        assert!(has_permission(&claims, "order-service", "write"));
        assert!(has_permission(&claims, "order-service", "delete"));
        // リソース admin は他リソースに波及しない
        assert!(!has_permission(&claims, "user-service", "read"));
    }

    #[test]
    fn test_has_permission_no_roles() {
        let claims = make_claims(&[], &[], &[]);
        assert!(!has_permission(&claims, "unrelated-service", "read"));
    }

    #[test]
    fn test_has_tier_access() {
        let claims = make_claims(&[], &[], &["system", "business"]);

        assert!(has_tier_access(&claims, "system"));
        assert!(has_tier_access(&claims, "business"));
        assert!(has_tier_access(&claims, "System")); // case insensitive
        assert!(!has_tier_access(&claims, "service"));
    }

    #[test]
    fn test_has_tier_access_empty() {
        let claims = Claims::default();
        assert!(!has_tier_access(&claims, "system"));
        assert!(!has_tier_access(&claims, ""));
    }

    #[test]
    fn test_has_scope() {
        let claims = make_claims(&[], &[], &[]);
        assert!(has_scope(&claims, "profile"));
        assert!(!has_scope(&claims, "email"));
        assert!(!has_scope(&Claims::default(), "openid"));
    }
}
