pub mod auth;
pub mod config;
pub mod error;
pub mod providers;
pub mod registry;
pub mod schema;
pub mod server;

pub use auth::AuthKeys;
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use registry::ModelRegistry;
pub use server::{build_router, AppState};
