mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use kinfeed::infra::http::{HttpState, USER_ID_HEADER, build_router};
use kinfeed_api_types::{CreatePostResponse, Post, UserId};
use tower::ServiceExt;

use common::{Harness, MAX_FEED_LEN};

fn router(harness: &Harness) -> Router {
    build_router(HttpState {
        feed: harness.feed_service.clone(),
        posts: harness.posts.clone(),
        friends: harness.friends.clone(),
        live: harness.live.clone(),
        db: None,
    })
}

fn request(method: &str, uri: &str, user: Option<UserId>, body: Option<String>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user.to_string());
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn anonymous_requests_are_rejected() {
    let harness = Harness::new();
    let response = router(&harness)
        .oneshot(request("GET", "/post/feed", None, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router(&harness)
        .oneshot(request("PUT", "/cache/invalidate", None, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_user_header_is_unauthenticated() {
    let harness = Harness::new();
    let request = Request::builder()
        .uri("/post/feed")
        .header(USER_ID_HEADER, "not-a-uuid")
        .body(Body::empty())
        .expect("request");

    let response = router(&harness).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn created_post_can_be_read_back() {
    let harness = Harness::new();
    let author = UserId::new();

    let response = router(&harness)
        .oneshot(request(
            "POST",
            "/post/create",
            Some(author),
            Some(r#"{"text":"  hello  "}"#.to_string()),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let created: CreatePostResponse =
        serde_json::from_slice(&body_bytes(response).await).expect("create response");

    let response = router(&harness)
        .oneshot(request(
            "GET",
            &format!("/post/get/{}", created.id),
            Some(author),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let post: Post = serde_json::from_slice(&body_bytes(response).await).expect("post");
    assert_eq!(post.text, "hello");
    assert_eq!(post.author_user_id, author);
}

#[tokio::test]
async fn empty_post_is_a_bad_request() {
    let harness = Harness::new();
    let response = router(&harness)
        .oneshot(request(
            "POST",
            "/post/create",
            Some(UserId::new()),
            Some(r#"{"text":"   "}"#.to_string()),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn feed_window_past_limit_is_a_bad_request() {
    let harness = Harness::new();
    let uri = format!("/post/feed?limit=10&offset={}", MAX_FEED_LEN - 5);
    let response = router(&harness)
        .oneshot(request("GET", &uri, Some(UserId::new()), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn feed_lists_friend_posts() {
    let harness = Harness::new();
    let (user, friend) = (UserId::new(), UserId::new());

    let response = router(&harness)
        .oneshot(request(
            "PUT",
            &format!("/friend/set/{friend}"),
            Some(user),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let post = harness
        .posts
        .create(friend, "from a friend".to_string())
        .await
        .expect("create post");

    let response = router(&harness)
        .oneshot(request("GET", "/post/feed", Some(user), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let feed: Vec<Post> = serde_json::from_slice(&body_bytes(response).await).expect("feed");
    assert_eq!(feed, vec![post]);
}

#[tokio::test]
async fn befriending_yourself_is_rejected() {
    let harness = Harness::new();
    let user = UserId::new();
    let response = router(&harness)
        .oneshot(request("PUT", &format!("/friend/set/{user}"), Some(user), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_unknown_post_is_not_found() {
    let harness = Harness::new();
    let response = router(&harness)
        .oneshot(request(
            "PUT",
            &format!("/post/delete/{}", uuid::Uuid::new_v4()),
            Some(UserId::new()),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalidate_and_health() {
    let harness = Harness::new();
    let response = router(&harness)
        .oneshot(request("PUT", "/cache/invalidate", Some(UserId::new()), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router(&harness)
        .oneshot(request("GET", "/health", None, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
