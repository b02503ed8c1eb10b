//! HTTP middleware layers.

pub mod cors;
pub mod trace;

pub use cors::cors_layer;
pub use trace::trace_layer;
