//! Identity Extraction
//!
//! Resolves `(tenant_id, user_id)` for a request from ordered sources:
//!
//! 1. Bearer-token claims (`tenant_id`/`tenantId`, then
//!    `user_id`/`userId`/`sub`)
//! 2. An API-key header of the form `tenant.user.secret`
//! 3. Explicit `X-Tenant-ID` / `X-User-ID` headers
//! 4. An IP-derived anonymous identity
//!
//! Bearer tokens are *verified* when a shared secret is configured;
//! otherwise they are decoded without signature validation and treated as
//! advisory: good enough to pick a rate-limit identity, never good enough
//! for authorisation. A token that fails verification falls back to the
//! advisory decode rather than being dropped, so a key rotation does not
//! turn authenticated traffic into anonymous traffic.

use axum::http::HeaderMap;
use gatehouse_core::{normalize_path, RequestIdentity, DEFAULT_USER};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

/// The identity-bearing claims Gatehouse reads from a bearer token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    #[serde(default, alias = "tenantId")]
    pub tenant_id: Option<String>,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

impl TokenClaims {
    fn user(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.sub.as_deref())
    }
}

/// Outcome of parsing a bearer token.
#[derive(Debug, Clone)]
pub enum BearerToken {
    /// Signature checked against the configured secret.
    Verified(TokenClaims),
    /// Decoded without verification; identity hints only.
    Decoded(TokenClaims),
}

impl BearerToken {
    pub fn claims(&self) -> &TokenClaims {
        match self {
            BearerToken::Verified(claims) | BearerToken::Decoded(claims) => claims,
        }
    }
}

/// Stateless extractor configured once at startup.
#[derive(Clone, Default)]
pub struct IdentityExtractor {
    jwt_secret: Option<String>,
}

impl IdentityExtractor {
    pub fn new(jwt_secret: Option<String>) -> Self {
        Self { jwt_secret }
    }

    /// Resolve the identity for a request, or `None` when no source yields
    /// a usable tenant (the middleware then skips the rate-limit check).
    pub fn extract(
        &self,
        headers: &HeaderMap,
        path: &str,
        client_ip: Option<&str>,
    ) -> Option<RequestIdentity> {
        let endpoint = normalize_path(path);
        if endpoint.is_empty() {
            return None;
        }

        if let Some(token) = bearer_token(headers) {
            if let Some(parsed) = self.parse_bearer(token) {
                let claims = parsed.claims();
                if let Some(tenant) = non_empty(claims.tenant_id.as_deref()) {
                    let user = non_empty(claims.user()).unwrap_or(DEFAULT_USER);
                    return Some(RequestIdentity::new(tenant, user, endpoint));
                }
            }
        }

        if let Some(api_key) = header_str(headers, "x-api-key") {
            let mut segments = api_key.split('.');
            if let (Some(tenant), Some(user)) = (segments.next(), segments.next()) {
                if !tenant.is_empty() && !user.is_empty() {
                    return Some(RequestIdentity::new(tenant, user, endpoint));
                }
            }
        }

        if let Some(tenant) = non_empty(header_str(headers, "x-tenant-id")) {
            let user = non_empty(header_str(headers, "x-user-id")).unwrap_or(DEFAULT_USER);
            return Some(RequestIdentity::new(tenant, user, endpoint));
        }

        client_ip.map(|ip| RequestIdentity::anonymous(ip, endpoint))
    }

    /// Parse a bearer token: verified when a secret is configured and the
    /// signature holds, advisory decode otherwise.
    pub fn parse_bearer(&self, token: &str) -> Option<BearerToken> {
        if let Some(secret) = &self.jwt_secret {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_aud = false;
            validation.required_spec_claims.clear();

            match decode::<TokenClaims>(
                token,
                &DecodingKey::from_secret(secret.as_bytes()),
                &validation,
            ) {
                Ok(data) => return Some(BearerToken::Verified(data.claims)),
                Err(e) => {
                    debug!(error = %e, "bearer verification failed; decoding unverified");
                }
            }
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()
            .map(|data| BearerToken::Decoded(data.claims))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?
        .strip_prefix("Bearer ")
        .or_else(|| header_str(headers, "authorization")?.strip_prefix("bearer "))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "unit-test-shared-secret-0123456789ab";

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn verified_token_wins() {
        let extractor = IdentityExtractor::new(Some(SECRET.to_string()));
        let token = sign(json!({"tenant_id": "acme", "user_id": "alice"}), SECRET);
        let headers = headers(&[
            ("authorization", &format!("Bearer {token}")),
            ("x-tenant-id", "ignored"),
        ]);

        let identity = extractor
            .extract(&headers, "/api/search?q=1", Some("1.2.3.4"))
            .unwrap();
        assert_eq!(identity.tenant_id, "acme");
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.endpoint, "/api/search");

        match extractor.parse_bearer(&token).unwrap() {
            BearerToken::Verified(_) => {}
            BearerToken::Decoded(_) => panic!("expected verified"),
        }
    }

    #[test]
    fn bad_signature_degrades_to_decoded() {
        let extractor = IdentityExtractor::new(Some(SECRET.to_string()));
        let token = sign(
            json!({"tenantId": "acme", "sub": "alice"}),
            "a-different-secret-another-32-bytes!",
        );

        match extractor.parse_bearer(&token).unwrap() {
            BearerToken::Decoded(claims) => {
                assert_eq!(claims.tenant_id.as_deref(), Some("acme"));
                assert_eq!(claims.user(), Some("alice"));
            }
            BearerToken::Verified(_) => panic!("signature should not verify"),
        }
    }

    #[test]
    fn no_secret_means_advisory_decode() {
        let extractor = IdentityExtractor::new(None);
        let token = sign(json!({"tenant_id": "acme"}), "whatever-key-this-does-not-matter");

        let identity = extractor
            .extract(
                &headers(&[("authorization", &format!("Bearer {token}"))]),
                "/v1/items/",
                None,
            )
            .unwrap();
        assert_eq!(identity.tenant_id, "acme");
        assert_eq!(identity.user_id, DEFAULT_USER);
        assert_eq!(identity.endpoint, "/v1/items");
    }

    #[test]
    fn api_key_source() {
        let extractor = IdentityExtractor::default();
        let identity = extractor
            .extract(
                &headers(&[("x-api-key", "acme.alice.s3cr3t")]),
                "/api/x",
                None,
            )
            .unwrap();
        assert_eq!(identity.tenant_id, "acme");
        assert_eq!(identity.user_id, "alice");
    }

    #[test]
    fn explicit_headers_source() {
        let extractor = IdentityExtractor::default();
        let identity = extractor
            .extract(
                &headers(&[("x-tenant-id", "acme"), ("x-user-id", "bob")]),
                "/api/x",
                None,
            )
            .unwrap();
        assert_eq!(identity.tenant_id, "acme");
        assert_eq!(identity.user_id, "bob");

        let identity = extractor
            .extract(&headers(&[("x-tenant-id", "acme")]), "/api/x", None)
            .unwrap();
        assert_eq!(identity.user_id, DEFAULT_USER);
    }

    #[test]
    fn ip_fallback_and_none() {
        let extractor = IdentityExtractor::default();

        let identity = extractor
            .extract(&HeaderMap::new(), "/api/x", Some("203.0.113.7"))
            .unwrap();
        assert_eq!(identity.tenant_id, "anonymous");
        assert_eq!(identity.user_id, "ip_203_0_113_7");

        assert!(extractor.extract(&HeaderMap::new(), "/api/x", None).is_none());
    }

    #[test]
    fn empty_tenant_header_falls_through() {
        let extractor = IdentityExtractor::default();
        let identity = extractor
            .extract(
                &headers(&[("x-tenant-id", "  ")]),
                "/api/x",
                Some("10.0.0.1"),
            )
            .unwrap();
        assert_eq!(identity.tenant_id, "anonymous");
    }
}
