use async_trait::async_trait;
use kinfeed_api_types::{Post, PostId, UserId};
use time::OffsetDateTime;

use crate::application::repos::{FeedRepo, PostsRepo, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct PostRow {
    id: PostId,
    content: String,
    user_id: UserId,
    create_time: OffsetDateTime,
    update_time: OffsetDateTime,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.id,
            author_user_id: row.user_id,
            text: row.content,
            created_at: row.create_time,
            updated_at: row.update_time,
        }
    }
}

fn to_i64(value: usize, field: &str) -> Result<i64, RepoError> {
    i64::try_from(value).map_err(|_| RepoError::InvalidInput {
        message: format!("{field} out of range"),
    })
}

#[async_trait]
impl FeedRepo for PostgresRepositories {
    async fn load_feed_for_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError> {
        let rows = sqlx::query_as::<_, PostRow>(
            "SELECT p.id, p.content, p.user_id, p.create_time, p.update_time \
             FROM friends f \
             JOIN posts p ON f.friend_id = p.user_id \
             WHERE f.user_id = $1 \
             ORDER BY p.create_time DESC \
             LIMIT $2 OFFSET $3",
        )
        .bind(user)
        .bind(to_i64(limit, "limit")?)
        .bind(to_i64(offset, "offset")?)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(Post::from).collect())
    }
}

#[async_trait]
impl PostsRepo for PostgresRepositories {
    async fn create_post(&self, post: Post) -> Result<Post, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            "INSERT INTO posts (id, content, user_id, create_time, update_time) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, content, user_id, create_time, update_time",
        )
        .bind(post.id)
        .bind(post.text)
        .bind(post.author_user_id)
        .bind(post.created_at)
        .bind(post.updated_at)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn update_post(
        &self,
        author: UserId,
        id: PostId,
        text: String,
        updated_at: OffsetDateTime,
    ) -> Result<Post, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            "UPDATE posts SET content = $3, update_time = $4 \
             WHERE id = $1 AND user_id = $2 \
             RETURNING id, content, user_id, create_time, update_time",
        )
        .bind(id)
        .bind(author)
        .bind(text)
        .bind(updated_at)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(Post::from).ok_or(RepoError::NotFound)
    }

    async fn delete_post(&self, author: UserId, id: PostId) -> Result<(), RepoError> {
        let result = sqlx::query("DELETE FROM posts WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(author)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn find_post(&self, author: UserId, id: PostId) -> Result<Option<Post>, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            "SELECT id, content, user_id, create_time, update_time \
             FROM posts WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(author)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Post::from))
    }
}
