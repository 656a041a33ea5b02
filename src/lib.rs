pub mod access_code;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod meals;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod rate_limit;
pub mod server;
pub mod users;

pub use config::Config;
pub use error::{ApiError, Result};
pub use handlers::AppState;
pub use server::{build_router, Server};
