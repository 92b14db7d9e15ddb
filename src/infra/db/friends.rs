use async_trait::async_trait;
use kinfeed_api_types::UserId;

use crate::application::repos::{FriendsRepo, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl FriendsRepo for PostgresRepositories {
    async fn load_followers_of(&self, user: UserId) -> Result<Vec<UserId>, RepoError> {
        sqlx::query_scalar::<_, UserId>("SELECT user_id FROM friends WHERE friend_id = $1")
            .bind(user)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn add_friend(&self, user: UserId, friend: UserId) -> Result<(), RepoError> {
        sqlx::query("INSERT INTO friends (user_id, friend_id) VALUES ($1, $2)")
            .bind(user)
            .bind(friend)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_friend(&self, user: UserId, friend: UserId) -> Result<(), RepoError> {
        let result = sqlx::query("DELETE FROM friends WHERE user_id = $1 AND friend_id = $2")
            .bind(user)
            .bind(friend)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
