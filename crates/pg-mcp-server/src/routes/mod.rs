//! Route handlers, one module per resource.

pub mod error;
pub mod health;
pub mod query;
pub mod resources;

pub use error::ApiError;
pub use health::health_handler;
pub use query::{query_handler, refresh_schema_handler};
pub use resources::{list_databases_handler, schema_resource_handler};
