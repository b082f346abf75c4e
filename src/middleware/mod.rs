pub mod auth;
pub mod cors;

pub use auth::require_admin;
pub use cors::create_cors_layer;
