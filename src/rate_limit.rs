//! Sliding-window rate limiting.
//!
//! Every metered request is recorded as a timestamp in a per-key window;
//! a request is rejected when the trailing window already holds the policy
//! ceiling. Counters live in process memory only and reset on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Named request budget: at most `max_requests` events per trailing
/// `window_seconds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    pub name: &'static str,
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RatePolicy {
    /// A policy with `max_requests = 0` would reject everything, so the
    /// ceiling is floored at 1.
    pub fn new(name: &'static str, max_requests: u32, window_seconds: u64) -> Self {
        Self {
            name,
            max_requests: max_requests.max(1),
            window_seconds: window_seconds.max(1),
        }
    }
}

/// Rate-limit scope a request path falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Auth,
    Analyze,
    Admin,
    Api,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Analyze => "analyze",
            Self::Admin => "admin",
            Self::Api => "api",
        }
    }
}

/// Maps a request path to its rate-limit scope.
///
/// Returns `None` for unmetered paths: anything outside the API prefix
/// (static assets) and the health check. Exact auth matches and the
/// analyze/admin prefixes are tested before the generic API fallback, so
/// ordering here is significant.
pub fn policy_for(path: &str) -> Option<Scope> {
    if !path.starts_with("/api/") {
        return None;
    }
    if path == "/api/health" {
        return None;
    }
    if path == "/api/auth/register" || path == "/api/auth/session" {
        return Some(Scope::Auth);
    }
    if path.starts_with("/api/analyze/") {
        return Some(Scope::Analyze);
    }
    if path.starts_with("/api/admin/") {
        return Some(Scope::Admin);
    }
    Some(Scope::Api)
}

/// One policy per scope, loaded once at startup.
#[derive(Debug, Clone)]
pub struct RatePolicyTable {
    pub auth: RatePolicy,
    pub analyze: RatePolicy,
    pub admin: RatePolicy,
    pub api: RatePolicy,
}

impl RatePolicyTable {
    /// Reads the policy table from the environment. A missing or
    /// unparsable value falls back to its default and out-of-range values
    /// are clamped; a config typo must never take the service down.
    pub fn from_env() -> Self {
        let window = read_int_env("RATE_LIMIT_WINDOW_SECONDS", 60, 1, 3600);
        Self {
            auth: RatePolicy::new(
                "auth",
                read_int_env("RATE_LIMIT_AUTH_PER_WINDOW", 20, 1, 500) as u32,
                window,
            ),
            analyze: RatePolicy::new(
                "analyze",
                read_int_env("RATE_LIMIT_ANALYZE_PER_WINDOW", 12, 1, 500) as u32,
                window,
            ),
            admin: RatePolicy::new(
                "admin",
                read_int_env("RATE_LIMIT_ADMIN_PER_WINDOW", 90, 1, 2000) as u32,
                window,
            ),
            api: RatePolicy::new(
                "api",
                read_int_env("RATE_LIMIT_API_PER_WINDOW", 240, 1, 5000) as u32,
                window,
            ),
        }
    }

    pub fn get(&self, scope: Scope) -> &RatePolicy {
        match scope {
            Scope::Auth => &self.auth,
            Scope::Analyze => &self.analyze,
            Scope::Admin => &self.admin,
            Scope::Api => &self.api,
        }
    }
}

/// Outcome of a single rate check. A rejection is a normal terminal
/// result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub allowed: bool,
    pub retry_after_secs: u64,
    pub remaining: u32,
}

/// In-memory sliding-window limiter keyed by `scope:client_ip`.
///
/// A single mutex guards the whole key map; eviction, decision and append
/// happen as one critical section so concurrent requests on the same key
/// cannot observe inconsistent counts. Windows are created lazily and
/// bounded by the number of distinct keys seen.
pub struct RateLimiter {
    policies: RatePolicyTable,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(policies: RatePolicyTable) -> Self {
        Self {
            policies,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self, scope: Scope) -> &RatePolicy {
        self.policies.get(scope)
    }

    /// Checks and records one request for `key` under `scope`'s policy.
    pub fn check(&self, key: &str, scope: Scope) -> RateCheck {
        self.check_at(key, scope, Instant::now())
    }

    // Monotonic `now` is passed in so tests can advance the clock.
    fn check_at(&self, key: &str, scope: Scope, now: Instant) -> RateCheck {
        let policy = self.policies.get(scope);
        let window = Duration::from_secs(policy.window_seconds);

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = windows.entry(key.to_string()).or_default();

        if let Some(cutoff) = now.checked_sub(window) {
            while bucket.front().is_some_and(|&t| t <= cutoff) {
                bucket.pop_front();
            }
        }

        if bucket.len() >= policy.max_requests as usize {
            let oldest = bucket
                .front()
                .copied()
                .unwrap_or(now);
            let elapsed = now.saturating_duration_since(oldest);
            let retry_after = window
                .saturating_sub(elapsed)
                .as_secs_f64()
                .ceil() as u64;
            return RateCheck {
                allowed: false,
                retry_after_secs: retry_after.max(1),
                remaining: 0,
            };
        }

        bucket.push_back(now);
        let remaining = policy.max_requests.saturating_sub(bucket.len() as u32);
        RateCheck {
            allowed: true,
            retry_after_secs: 0,
            remaining,
        }
    }
}

/// Clamped integer env reader. Missing or unparsable values fall back to
/// the default; out-of-range values are pinned to the nearest bound.
fn read_int_env(name: &str, default: u64, min: u64, max: u64) -> u64 {
    clamp_raw(std::env::var(name).ok().as_deref(), default, min, max)
}

fn clamp_raw(raw: Option<&str>, default: u64, min: u64, max: u64) -> u64 {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<i64>() {
        Ok(value) if value < min as i64 => min,
        Ok(value) if value as u64 > max => max,
        Ok(value) => value as u64,
        Err(_) => default,
    }
}
