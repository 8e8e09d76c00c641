//! Permission Resolver (C2): pure scope queries over an already-verified
//! claim set. Holds no state of its own — every call takes `&Claims`.

use aloft_types::{constants, Claims};

const READ_SCOPE: &str = "read:api";
const WRITE_SCOPE: &str = "write:api";
const ADMIN_SCOPE: &str = "admin:api";
const TENANT_ADMIN_SCOPE: &str = "tenant:admin";

/// Normalizes a raw scope string as ingested from a token: lowercases the
/// `access:{uuid}` suffix, leaving every other scope untouched.
pub fn normalize_scope(scope: &str) -> String {
    match scope.strip_prefix(constants::ACCESS_SCOPE_PREFIX) {
        Some(suffix) => format!("{}{}", constants::ACCESS_SCOPE_PREFIX, suffix.to_ascii_lowercase()),
        None => scope.to_string(),
    }
}

fn has_scope(claims: &Claims, scope: &str) -> bool {
    claims.scopes.iter().any(|s| normalize_scope(s) == scope)
}

pub fn can_read(claims: &Claims) -> bool {
    has_scope(claims, READ_SCOPE) || can_admin(claims)
}

pub fn can_write(claims: &Claims) -> bool {
    has_scope(claims, WRITE_SCOPE) || can_admin(claims)
}

pub fn can_admin(claims: &Claims) -> bool {
    has_scope(claims, ADMIN_SCOPE)
}

pub fn can_manage_tenant(claims: &Claims) -> bool {
    has_scope(claims, TENANT_ADMIN_SCOPE) || can_admin(claims)
}

/// True if `claims` holds `admin:api` or `access:{uuid}` (`uuid` lowercased
/// before comparison, matching the normalization applied on ingest).
pub fn can_access_channel(claims: &Claims, uuid: &str) -> bool {
    if can_admin(claims) {
        return true;
    }
    let scope = format!("{}{}", constants::ACCESS_SCOPE_PREFIX, uuid.to_ascii_lowercase());
    has_scope(claims, &scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims_with(scopes: Vec<&str>) -> Claims {
        Claims {
            sub: "pilot-1".into(),
            scopes: scopes.into_iter().map(str::to_string).collect(),
            display: Default::default(),
        }
    }

    #[test]
    fn normalize_scope_lowercases_only_access_suffix() {
        assert_eq!(
            normalize_scope("access:AA11BB22-CC33-4444-A555-FF6677889900"),
            "access:aa11bb22-cc33-4444-a555-ff6677889900"
        );
        assert_eq!(normalize_scope("READ:API"), "READ:API");
    }

    #[test]
    fn admin_implies_read_write_and_tenant_admin() {
        let claims = claims_with(vec!["admin:api"]);
        assert!(can_read(&claims));
        assert!(can_write(&claims));
        assert!(can_admin(&claims));
        assert!(can_manage_tenant(&claims));
    }

    #[test]
    fn can_access_channel_true_for_admin_or_matching_access_scope() {
        let admin = claims_with(vec!["admin:api"]);
        assert!(can_access_channel(&admin, "8879f616-d468-4793-afcd-d66f0cea4651"));

        let scoped = claims_with(vec!["access:8879f616-d468-4793-afcd-d66f0cea4651"]);
        assert!(can_access_channel(&scoped, "8879F616-D468-4793-AFCD-D66F0CEA4651"));

        let unscoped = claims_with(vec!["read:api"]);
        assert!(!can_access_channel(&unscoped, "8879f616-d468-4793-afcd-d66f0cea4651"));
    }

    #[test]
    fn read_write_false_without_matching_scope() {
        let claims = claims_with(vec!["access:8879f616-d468-4793-afcd-d66f0cea4651"]);
        assert!(!can_read(&claims));
        assert!(!can_write(&claims));
    }
}
