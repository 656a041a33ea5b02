//! Router assembly and server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{any, get, post, put};
use axum::Router;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db;
use crate::handlers::{self, AppState};
use crate::middleware::security_middleware;
use crate::rate_limit::{RateLimiter, RatePolicyTable};

/// Builds the full application router around `state`. Exposed separately
/// from [`Server`] so tests can drive the router directly.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/api/auth/register", post(handlers::register))
        .route("/api/auth/session", post(handlers::session))
        .route("/api/profile", get(handlers::profile))
        .route(
            "/api/meals",
            get(handlers::list_meals),
        )
        .route(
            "/api/meals/:entry_id",
            axum::routing::delete(handlers::delete_meal),
        )
        .route("/api/summary", get(handlers::summary))
        .route("/api/goals", get(handlers::get_goals).put(handlers::put_goals))
        .route("/api/analyze/photo", post(handlers::analyze_photo))
        .route("/api/analyze/manual", post(handlers::analyze_manual))
        .route("/api/admin/overview", get(handlers::admin_overview))
        .route("/api/admin/users", get(handlers::admin_users))
        .route(
            "/api/admin/users/:user_id/reset-code",
            post(handlers::admin_reset_code),
        )
        .route(
            "/api/admin/users/:user_id",
            axum::routing::delete(handlers::admin_delete_user),
        )
        .route("/api/health", get(handlers::health))
        .route("/api/*rest", any(handlers::api_fallback))
        .with_state(state.clone());

    // Single-page frontend: unmatched non-API paths serve static assets,
    // unknown ones rewrite to index.html.
    let router = match &state.config.static_dir {
        Some(dir) => router.fallback_service(
            ServeDir::new(dir).not_found_service(ServeFile::new(dir.join("index.html"))),
        ),
        None => router,
    };

    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(from_fn_with_state(state, security_middleware)),
    )
}

pub struct Server {
    state: AppState,
    router: Router,
}

impl Server {
    /// Connects storage, loads rate policies and assembles the router.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config.db_path).await?;
        let limiter = RateLimiter::new(RatePolicyTable::from_env());
        let state = AppState {
            pool,
            limiter: Arc::new(limiter),
            config: Arc::new(config),
        };
        let router = build_router(state.clone());
        Ok(Self { state, router })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.state.config.bind_addr;
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!(%addr, "meallog server listening");
        if self.state.config.admin_code.is_none() {
            tracing::info!("ADMIN_CODE unset; admin endpoints disabled");
        }

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, shutting down");
        },
    }
}
