//! Request middleware: rate limiting and security headers.
//!
//! Every request is routed to a rate-limit scope (or none) and checked
//! against the per-`scope:client_ip` window. Every response leaves with
//! the defensive header set attached, 429 rejections included.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::handlers::AppState;
use crate::rate_limit::{policy_for, RatePolicy};

const X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATE_LIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");
const X_RATE_LIMIT_SCOPE: HeaderName = HeaderName::from_static("x-ratelimit-scope");
const PERMISSIONS_POLICY: HeaderName = HeaderName::from_static("permissions-policy");
const CROSS_ORIGIN_RESOURCE_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-resource-policy");

/// Resolves the client address used as the rate-limit partition key.
///
/// Precedence: first `x-forwarded-for` entry, then `x-real-ip`, then the
/// transport peer address. The value is never validated; a malformed
/// header just produces its own bucket. Known weakness: without a trusted
/// reverse proxy stripping these headers, clients can pick their own
/// bucket by setting them directly.
pub fn client_ip(headers: &HeaderMap, fallback: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(leftmost) = forwarded.split(',').next() {
            let leftmost = leftmost.trim();
            if !leftmost.is_empty() {
                return leftmost.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    fallback
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Attaches the defensive header set without overriding anything a
/// handler already set. HSTS is only meaningful over TLS, so it is gated
/// on the request having arrived via HTTPS.
pub fn apply_security_headers(headers: &mut HeaderMap, is_https: bool, csp: &str) {
    insert_if_absent(
        headers,
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    insert_if_absent(
        headers,
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    insert_if_absent(
        headers,
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    insert_if_absent(
        headers,
        PERMISSIONS_POLICY,
        HeaderValue::from_static("camera=(self), microphone=(), geolocation=()"),
    );
    if let Ok(csp_value) = HeaderValue::from_str(csp) {
        insert_if_absent(headers, header::CONTENT_SECURITY_POLICY, csp_value);
    }
    insert_if_absent(
        headers,
        CROSS_ORIGIN_RESOURCE_POLICY,
        HeaderValue::from_static("same-origin"),
    );

    if is_https {
        insert_if_absent(
            headers,
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
}

fn insert_if_absent(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    if !headers.contains_key(&name) {
        headers.insert(name, value);
    }
}

fn attach_rate_limit_headers(headers: &mut HeaderMap, policy: &RatePolicy, remaining: u32) {
    headers.insert(X_RATE_LIMIT_LIMIT, HeaderValue::from(policy.max_requests));
    headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATE_LIMIT_WINDOW, HeaderValue::from(policy.window_seconds));
    headers.insert(
        X_RATE_LIMIT_SCOPE,
        HeaderValue::from_static(policy.name),
    );
}

fn request_is_https(req: &Request) -> bool {
    if req.uri().scheme_str() == Some("https") {
        return true;
    }
    // Behind a TLS-terminating proxy only the forwarded proto survives.
    req.headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|proto| proto.split(',').next().unwrap_or("").trim() == "https")
        .unwrap_or(false)
}

/// Combined rate-limit + security-header middleware, applied to every
/// route including the static fallback.
pub async fn security_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let scope = policy_for(req.uri().path());
    let is_https = request_is_https(&req);
    let csp = state.config.csp.clone();

    let mut metered = None;
    if let Some(scope) = scope {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let ip = client_ip(req.headers(), peer);
        let key = format!("{}:{}", scope.as_str(), ip);
        let check = state.limiter.check(&key, scope);
        let policy = state.limiter.policy(scope).clone();

        if !check.allowed {
            tracing::warn!(
                scope = scope.as_str(),
                client_ip = %ip,
                retry_after = check.retry_after_secs,
                "rate limit exceeded"
            );
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "detail": "Too many requests. Please retry shortly." })),
            )
                .into_response();
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(check.retry_after_secs),
            );
            attach_rate_limit_headers(response.headers_mut(), &policy, 0);
            apply_security_headers(response.headers_mut(), is_https, &csp);
            return response;
        }

        metered = Some((policy, check.remaining));
    }

    let mut response = next.run(req).await;
    apply_security_headers(response.headers_mut(), is_https, &csp);
    if let Some((policy, remaining)) = metered {
        attach_rate_limit_headers(response.headers_mut(), &policy, remaining);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CSP;

    fn addr(ip: [u8; 4]) -> Option<SocketAddr> {
        Some(SocketAddr::from((ip, 4242)))
    }

    #[test]
    fn forwarded_for_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(client_ip(&headers, addr([9, 9, 9, 9])), "1.2.3.4");
    }

    #[test]
    fn real_ip_is_second_choice() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static(" 5.6.7.8 "));
        assert_eq!(client_ip(&headers, addr([9, 9, 9, 9])), "5.6.7.8");
    }

    #[test]
    fn empty_forwarded_entries_fall_through() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("   "));
        assert_eq!(client_ip(&headers, addr([9, 9, 9, 9])), "9.9.9.9");
    }

    #[test]
    fn peer_address_is_the_fallback() {
        assert_eq!(client_ip(&HeaderMap::new(), addr([9, 9, 9, 9])), "9.9.9.9");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn malformed_header_values_are_opaque_keys() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("not-an-address"),
        );
        assert_eq!(client_ip(&headers, None), "not-an-address");
    }

    #[test]
    fn security_headers_do_not_override_existing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
        apply_security_headers(&mut headers, false, DEFAULT_CSP);

        assert_eq!(headers[&header::X_FRAME_OPTIONS], "SAMEORIGIN");
        assert_eq!(headers[&header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[&header::REFERRER_POLICY], "no-referrer");
        assert!(headers.contains_key(&header::CONTENT_SECURITY_POLICY));
        assert!(!headers.contains_key(&header::STRICT_TRANSPORT_SECURITY));
    }

    #[test]
    fn hsts_only_over_https() {
        let mut headers = HeaderMap::new();
        apply_security_headers(&mut headers, true, DEFAULT_CSP);
        assert_eq!(
            headers[&header::STRICT_TRANSPORT_SECURITY],
            "max-age=31536000; includeSubDomains"
        );
    }

    #[test]
    fn rate_limit_headers_are_attached() {
        let mut headers = HeaderMap::new();
        let policy = RatePolicy::new("auth", 20, 60);
        attach_rate_limit_headers(&mut headers, &policy, 7);

        assert_eq!(headers[&X_RATE_LIMIT_LIMIT], "20");
        assert_eq!(headers[&X_RATE_LIMIT_REMAINING], "7");
        assert_eq!(headers[&X_RATE_LIMIT_WINDOW], "60");
        assert_eq!(headers[&X_RATE_LIMIT_SCOPE], "auth");
    }
}
