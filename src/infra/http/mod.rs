//! HTTP surface: feed reads, write paths, cache control and the live stream.

mod auth;
mod handlers;
mod live;
mod middleware;

pub use auth::{AuthenticatedUser, USER_ID_HEADER};
pub use middleware::{RequestContext, log_responses, set_request_context, trusted_user_header};

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use sqlx::Error as SqlxError;

use crate::application::error::ErrorReport;
use crate::application::{feed::FeedService, friends::FriendService, posts::PostService};
use crate::feed::LiveUpdateMultiplexer;
use crate::infra::db::PostgresRepositories;

/// Shared handler state.
#[derive(Clone)]
pub struct HttpState {
    pub feed: Arc<FeedService>,
    pub posts: Arc<PostService>,
    pub friends: Arc<FriendService>,
    pub live: LiveUpdateMultiplexer,
    /// Absent when storage is in memory.
    pub db: Option<Arc<PostgresRepositories>>,
}

/// Routes expect an [`AuthenticatedUser`] extension. [`trusted_user_header`]
/// installs one from `x-user-id`; deployments behind a different
/// authenticating proxy can swap that layer.
pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/post/feed", get(handlers::get_feed))
        .route("/post/feed/posted", get(live::live_feed))
        .route("/cache/invalidate", put(handlers::invalidate_cache))
        .route("/post/create", post(handlers::create_post))
        .route("/post/update", put(handlers::update_post))
        .route("/post/delete/{id}", put(handlers::delete_post))
        .route("/post/get/{id}", get(handlers::get_post))
        .route("/friend/set/{id}", put(handlers::add_friend))
        .route("/friend/delete/{id}", put(handlers::delete_friend))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(trusted_user_header))
        .layer(axum_middleware::from_fn(set_request_context))
}

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
