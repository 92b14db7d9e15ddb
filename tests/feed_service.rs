mod common;

use std::time::Duration as StdDuration;

use kinfeed::application::feed::FeedServiceError;
use kinfeed::application::repos::{FriendsRepo, PostsRepo};
use kinfeed::cache::{CacheConfig, CacheError, LockProvider};
use kinfeed_api_types::{Post, PostId, UserId};
use time::{Duration, OffsetDateTime};

use common::{Harness, MAX_FEED_LEN, cache_config, within};

async fn seed_posts(harness: &Harness, author: UserId, count: usize) -> Vec<Post> {
    let base = OffsetDateTime::now_utc();
    let mut posts = Vec::new();
    for n in 0..count {
        let at = base + Duration::seconds(n as i64);
        let post = Post {
            id: PostId::new(),
            author_user_id: author,
            text: format!("post {n}"),
            created_at: at,
            updated_at: at,
        };
        posts.push(harness.repos.create_post(post).await.expect("create post"));
    }
    posts.reverse();
    posts
}

#[tokio::test]
async fn window_past_max_length_is_rejected() {
    let harness = Harness::new();
    let user = UserId::new();

    let err = harness
        .feed_service
        .get_user_feed(user, 10, MAX_FEED_LEN - 5)
        .await
        .expect_err("window exceeds the cached feed");

    assert!(matches!(
        err,
        FeedServiceError::InvalidRange {
            offset,
            limit: 10,
            max: MAX_FEED_LEN,
        } if offset == MAX_FEED_LEN - 5
    ));
}

#[tokio::test]
async fn short_feed_returns_what_exists() {
    let harness = Harness::new();
    let (user, friend) = (UserId::new(), UserId::new());
    harness.repos.add_friend(user, friend).await.expect("befriend");
    let posts = seed_posts(&harness, friend, 3).await;

    let feed = harness
        .feed_service
        .get_user_feed(user, 10, 0)
        .await
        .expect("feed");
    assert_eq!(feed, posts);

    let tail = harness
        .feed_service
        .get_user_feed(user, 10, 2)
        .await
        .expect("feed tail");
    assert_eq!(tail, posts[2..].to_vec());
}

#[tokio::test]
async fn cached_feed_is_truncated_to_max_length() {
    let harness = Harness::new();
    let (user, friend) = (UserId::new(), UserId::new());
    harness.repos.add_friend(user, friend).await.expect("befriend");
    let posts = seed_posts(&harness, friend, MAX_FEED_LEN + 5).await;

    let feed = harness
        .feed_service
        .get_user_feed(user, MAX_FEED_LEN, 0)
        .await
        .expect("feed");
    assert_eq!(feed.len(), MAX_FEED_LEN);
    assert_eq!(feed[0], posts[0]);
}

#[tokio::test]
async fn invalidate_all_reaches_the_updater_and_drops_stale_feeds() {
    let harness = Harness::new();
    let (user, friend) = (UserId::new(), UserId::new());
    harness.repos.add_friend(user, friend).await.expect("befriend");
    let _updater = harness.start_updater().await;

    let primed = harness
        .feed_service
        .get_user_feed(user, 10, 0)
        .await
        .expect("prime feed");
    assert!(primed.is_empty());

    // Written straight to storage, so no event refreshes the cached feed.
    let posts = seed_posts(&harness, friend, 1).await;
    let stale = harness
        .feed_service
        .get_user_feed(user, 10, 0)
        .await
        .expect("cached feed");
    assert!(stale.is_empty());

    harness
        .feed_service
        .invalidate_all()
        .await
        .expect("invalidate");

    let fresh = within(async {
        loop {
            let feed = harness
                .feed_service
                .get_user_feed(user, 10, 0)
                .await
                .expect("feed");
            if !feed.is_empty() {
                break feed;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(fresh, posts);

    harness.shutdown.cancel();
}

#[tokio::test]
async fn feed_read_fails_while_the_key_is_locked_elsewhere() {
    let harness = Harness::with_cache_config(CacheConfig {
        lock_retries: 2,
        ..cache_config()
    });
    let user = UserId::new();

    let held = harness
        .feed_backend
        .try_lock(&format!("feed:{user}-lock"), "other-node", StdDuration::from_secs(30))
        .await
        .expect("take lock");
    assert!(held);

    let err = harness
        .feed_service
        .get_user_feed(user, 10, 0)
        .await
        .expect_err("lock is never released");
    assert!(matches!(
        err,
        FeedServiceError::Cache(CacheError::LockTimeout { attempts: 2, .. })
    ));
    assert_eq!(harness.feed_repo.loads(), 0);
}
