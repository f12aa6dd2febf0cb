//! API module for the Kinship server
//!
//! Routes are grouped into member queries and mutations, proposals, admin
//! operations and the health check. Admin routes sit behind [`require_admin_key`].

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub mod admin;
pub mod errors;
pub mod family;
pub mod health;

use crate::error::ServerError;
use crate::server::KinshipServer;
use errors::ApiError;

/// Header carrying the admin key
pub const ADMIN_KEY_HEADER: &str = "x-api-key";

/// Build the router for API endpoints
pub fn build_router(server: Arc<KinshipServer>) -> Router {
    let admin = Router::new()
        .route("/v1/admin/evict/:user", post(admin::evict_handler))
        .route("/v1/admin/groups/:group/recache/:user", post(admin::recache_handler))
        .route("/v1/admin/groups/:group/force/union", post(admin::force_union_handler))
        .route("/v1/admin/groups/:group/force/adopt", post(admin::force_adopt_handler))
        .route("/v1/admin/groups/:group/force/emancipate", post(admin::force_emancipate_handler))
        .route("/v1/admin/groups/:group/force/divorce", post(admin::force_divorce_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&server), require_admin_key));

    Router::new()
        // Queries
        .route("/v1/groups/:group/members/:user", get(family::get_member_handler))
        .route("/v1/groups/:group/members/:user/relation/:other", get(family::relation_handler))
        .route("/v1/groups/:group/members/:user/span", get(family::span_handler))
        .route("/v1/groups/:group/members/:user/root", get(family::root_handler))
        .route("/v1/groups/:group/members/:user/size", get(family::family_size_handler))

        // Direct mutations
        .route("/v1/groups/:group/members/:user/divorce", post(family::divorce_handler))
        .route("/v1/groups/:group/members/:user/disown/:child", post(family::disown_handler))
        .route("/v1/groups/:group/members/:user/emancipate", post(family::emancipate_handler))

        // Proposals
        .route("/v1/groups/:group/proposals", post(family::propose_handler))
        .route("/v1/proposals/:user", get(family::lookup_proposal_handler))
        .route("/v1/proposals/:user/respond", post(family::respond_handler))
        .route("/v1/proposals/:user/cancel", post(family::cancel_handler))

        // Health check
        .route("/health", get(health::health_check))

        .merge(admin)
        .with_state(server)
}

/// Reject admin requests without the configured key
pub async fn require_admin_key(
    State(server): State<Arc<KinshipServer>>,
    request: Request,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if server.validate_admin_key(key) {
        return next.run(request).await;
    }

    ApiError::from(ServerError::Unauthorized(
        "Invalid or missing admin API key".to_string(),
    ))
    .into_response()
}
