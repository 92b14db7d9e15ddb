use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kinfeed_api_types::{
    CreatePostRequest, CreatePostResponse, FeedQuery, Post, PostId, UpdatePostRequest, UserId,
};

use crate::application::error::{AppError, HttpError};

use super::{AuthenticatedUser, HttpState, db_health_response};

pub async fn get_feed(
    State(state): State<HttpState>,
    user: AuthenticatedUser,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<Post>>, HttpError> {
    let posts = state
        .feed
        .get_user_feed(user.id(), query.limit, query.offset)
        .await?;
    Ok(Json(posts))
}

pub async fn invalidate_cache(
    State(state): State<HttpState>,
    _user: AuthenticatedUser,
) -> Result<StatusCode, HttpError> {
    state.feed.invalidate_all().await?;
    Ok(StatusCode::OK)
}

pub async fn create_post(
    State(state): State<HttpState>,
    user: AuthenticatedUser,
    Json(request): Json<CreatePostRequest>,
) -> Result<Json<CreatePostResponse>, AppError> {
    let post = state.posts.create(user.id(), request.text).await?;
    Ok(Json(CreatePostResponse { id: post.id }))
}

pub async fn update_post(
    State(state): State<HttpState>,
    user: AuthenticatedUser,
    Json(request): Json<UpdatePostRequest>,
) -> Result<StatusCode, AppError> {
    state
        .posts
        .update(user.id(), request.id, request.text)
        .await?;
    Ok(StatusCode::OK)
}

pub async fn delete_post(
    State(state): State<HttpState>,
    user: AuthenticatedUser,
    Path(id): Path<PostId>,
) -> Result<StatusCode, AppError> {
    state.posts.delete(user.id(), id).await?;
    Ok(StatusCode::OK)
}

pub async fn get_post(
    State(state): State<HttpState>,
    user: AuthenticatedUser,
    Path(id): Path<PostId>,
) -> Result<Json<Post>, AppError> {
    let post = state.posts.get(user.id(), id).await?;
    Ok(Json(post))
}

pub async fn add_friend(
    State(state): State<HttpState>,
    user: AuthenticatedUser,
    Path(friend): Path<UserId>,
) -> Result<StatusCode, AppError> {
    state.friends.add(user.id(), friend).await?;
    Ok(StatusCode::OK)
}

pub async fn delete_friend(
    State(state): State<HttpState>,
    user: AuthenticatedUser,
    Path(friend): Path<UserId>,
) -> Result<StatusCode, AppError> {
    state.friends.delete(user.id(), friend).await?;
    Ok(StatusCode::OK)
}

pub async fn health(State(state): State<HttpState>) -> Response {
    match state.db.as_ref() {
        Some(db) => db_health_response(db.health_check().await),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
