//! Process-local repositories for single-node runs and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use kinfeed_api_types::{Post, PostId, UserId};
use time::OffsetDateTime;

use crate::application::repos::{FeedRepo, FriendsRepo, PostsRepo, RepoError};
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "infra::memory";

#[derive(Default)]
struct State {
    posts: HashMap<PostId, Post>,
    /// (user, friend): `user` sees `friend`'s posts.
    friends: BTreeSet<(UserId, UserId)>,
}

#[derive(Default)]
pub struct InMemoryRepositories {
    state: RwLock<State>,
}

impl InMemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedRepo for InMemoryRepositories {
    async fn load_feed_for_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "load_feed_for_user");
        let mut posts: Vec<Post> = state
            .posts
            .values()
            .filter(|post| state.friends.contains(&(user, post.author_user_id)))
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl FriendsRepo for InMemoryRepositories {
    async fn load_followers_of(&self, user: UserId) -> Result<Vec<UserId>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "load_followers_of");
        Ok(state
            .friends
            .iter()
            .filter(|(_, friend)| *friend == user)
            .map(|(follower, _)| *follower)
            .collect())
    }

    async fn add_friend(&self, user: UserId, friend: UserId) -> Result<(), RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "add_friend");
        if !state.friends.insert((user, friend)) {
            return Err(RepoError::Duplicate {
                constraint: "friends_pkey".to_string(),
            });
        }
        Ok(())
    }

    async fn delete_friend(&self, user: UserId, friend: UserId) -> Result<(), RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "delete_friend");
        if !state.friends.remove(&(user, friend)) {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl PostsRepo for InMemoryRepositories {
    async fn create_post(&self, post: Post) -> Result<Post, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "create_post");
        if state.posts.contains_key(&post.id) {
            return Err(RepoError::Duplicate {
                constraint: "posts_pkey".to_string(),
            });
        }
        state.posts.insert(post.id, post.clone());
        Ok(post)
    }

    async fn update_post(
        &self,
        author: UserId,
        id: PostId,
        text: String,
        updated_at: OffsetDateTime,
    ) -> Result<Post, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "update_post");
        let post = state
            .posts
            .get_mut(&id)
            .filter(|post| post.author_user_id == author)
            .ok_or(RepoError::NotFound)?;
        post.text = text;
        post.updated_at = updated_at;
        Ok(post.clone())
    }

    async fn delete_post(&self, author: UserId, id: PostId) -> Result<(), RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "delete_post");
        let owned = state
            .posts
            .get(&id)
            .is_some_and(|post| post.author_user_id == author);
        if !owned {
            return Err(RepoError::NotFound);
        }
        state.posts.remove(&id);
        Ok(())
    }

    async fn find_post(&self, author: UserId, id: PostId) -> Result<Option<Post>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "find_post");
        Ok(state
            .posts
            .get(&id)
            .filter(|post| post.author_user_id == author)
            .cloned())
    }
}
