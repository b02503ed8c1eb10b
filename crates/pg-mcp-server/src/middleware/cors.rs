//! CORS layer. This stub has no session/origin model of its own (§1
//! Non-goals: user authentication is out of scope), so it permits any
//! origin rather than guessing at a production allow-list.

use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS: any origin, any method, any header.
#[must_use]
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_layer_constructs() {
        let _layer = cors_layer();
    }
}
