//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::access_code::DEFAULT_PEPPER;

/// Content-Security-Policy applied when no override is configured.
pub const DEFAULT_CSP: &str = "default-src 'self'; \
img-src 'self' data: blob: https:; \
connect-src 'self' https://api.perplexity.ai https://openrouter.ai; \
style-src 'self' 'unsafe-inline' https://fonts.googleapis.com; \
font-src 'self' data: https://fonts.gstatic.com; \
script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
base-uri 'self'; \
form-action 'self'; \
frame-ancestors 'none'";

const DEFAULT_DB_PATH: &str = "data/app.db";

const DEFAULT_PERPLEXITY_MODEL: &str = "sonar-pro";
const DEFAULT_PERPLEXITY_API_URL: &str = "https://api.perplexity.ai/chat/completions";
const DEFAULT_OPENROUTER_MODEL: &str = "meta-llama/llama-3.2-11b-vision-instruct:free";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// SQLite database file; parent directories are created on startup
    pub db_path: PathBuf,
    /// Exact-match admin credential; admin endpoints reject everything
    /// while unset
    pub admin_code: Option<String>,
    /// Server-side secret mixed into access-code hashes
    pub code_pepper: String,
    /// Content-Security-Policy sent on every response
    pub csp: String,
    /// Optional directory with the built frontend; enables SPA serving
    pub static_dir: Option<PathBuf>,
    pub perplexity_api_key: Option<String>,
    pub perplexity_model: String,
    pub perplexity_api_url: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_api_url: String,
    pub openrouter_app_url: Option<String>,
    pub openrouter_app_name: Option<String>,
}

impl Config {
    /// Loads configuration from the environment. Never fails: a malformed
    /// value degrades to its default with a warning rather than refusing
    /// to start.
    pub fn from_env() -> Self {
        let bind_addr = match env_nonempty("BIND_ADDR") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "unparsable BIND_ADDR, using default");
                default_bind_addr()
            }),
            None => default_bind_addr(),
        };

        let code_pepper =
            env_nonempty("CODE_PEPPER").unwrap_or_else(|| DEFAULT_PEPPER.to_string());
        if code_pepper == DEFAULT_PEPPER {
            tracing::warn!("CODE_PEPPER is unset; using the insecure development pepper");
        }

        let static_dir = env_nonempty("FRONTEND_STATIC_DIR")
            .map(PathBuf::from)
            .filter(|dir| {
                let exists = dir.is_dir();
                if !exists {
                    tracing::warn!(
                        dir = %dir.display(),
                        "FRONTEND_STATIC_DIR does not exist, static serving disabled"
                    );
                }
                exists
            });

        Self {
            bind_addr,
            db_path: env_nonempty("APP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            admin_code: env_nonempty("ADMIN_CODE"),
            code_pepper,
            csp: env_nonempty("SECURITY_CONTENT_SECURITY_POLICY")
                .unwrap_or_else(|| DEFAULT_CSP.to_string()),
            static_dir,
            perplexity_api_key: env_nonempty("PERPLEXITY_API_KEY"),
            perplexity_model: env_nonempty("PERPLEXITY_MODEL")
                .unwrap_or_else(|| DEFAULT_PERPLEXITY_MODEL.to_string()),
            perplexity_api_url: env_nonempty("PERPLEXITY_API_URL")
                .unwrap_or_else(|| DEFAULT_PERPLEXITY_API_URL.to_string()),
            openrouter_api_key: env_nonempty("OPENROUTER_API_KEY"),
            openrouter_model: env_nonempty("OPENROUTER_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENROUTER_MODEL.to_string()),
            openrouter_api_url: OPENROUTER_API_URL.to_string(),
            openrouter_app_url: env_nonempty("OPENROUTER_APP_URL"),
            openrouter_app_name: env_nonempty("OPENROUTER_APP_NAME"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            admin_code: None,
            code_pepper: DEFAULT_PEPPER.to_string(),
            csp: DEFAULT_CSP.to_string(),
            static_dir: None,
            perplexity_api_key: None,
            perplexity_model: DEFAULT_PERPLEXITY_MODEL.to_string(),
            perplexity_api_url: DEFAULT_PERPLEXITY_API_URL.to_string(),
            openrouter_api_key: None,
            openrouter_model: DEFAULT_OPENROUTER_MODEL.to_string(),
            openrouter_api_url: OPENROUTER_API_URL.to_string(),
            openrouter_app_url: None,
            openrouter_app_name: None,
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
