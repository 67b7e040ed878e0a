use async_trait::async_trait;

use super::SqliteStore;
use crate::models::BucketRecord;
use crate::store::{BucketStore, StoreError};

#[async_trait]
impl BucketStore for SqliteStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<BucketRecord>, StoreError> {
        let bucket = sqlx::query_as::<_, BucketRecord>(
            "SELECT id, user_id, main, created_at FROM buckets WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(bucket)
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<BucketRecord>, StoreError> {
        let buckets = sqlx::query_as::<_, BucketRecord>(
            "SELECT id, user_id, main, created_at FROM buckets WHERE user_id = ? ORDER BY created_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(buckets)
    }

    async fn save(&self, bucket: &BucketRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO buckets (id, user_id, main, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, main = excluded.main",
        )
        .bind(&bucket.id)
        .bind(&bucket.user_id)
        .bind(bucket.main)
        .bind(bucket.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Removes only the record. Orphaned remote storage is reclaimed by a separate sweep.
    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers;

    #[tokio::test]
    async fn test_save_and_find_bucket() {
        let repo = test_helpers::test_repository().await;
        let bucket = BucketRecord::new("b-1", "alice", true);
        repo.save(&bucket).await.unwrap();

        let found = repo.find_by_id("b-1").await.unwrap().unwrap();
        assert_eq!(found, bucket);
        assert!(repo.find_by_id("b-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_user_filters_owner() {
        let repo = test_helpers::test_repository().await;
        repo.save(&BucketRecord::new("b-1", "alice", false))
            .await
            .unwrap();
        repo.save(&BucketRecord::new("b-2", "alice", true))
            .await
            .unwrap();
        repo.save(&BucketRecord::new("b-3", "bob", false))
            .await
            .unwrap();

        let mut ids: Vec<_> = repo
            .find_by_user("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["b-1", "b-2"]);
    }

    #[tokio::test]
    async fn test_remove_bucket() {
        let repo = test_helpers::test_repository().await;
        repo.save(&BucketRecord::new("b-1", "alice", false))
            .await
            .unwrap();
        repo.remove("b-1").await.unwrap();
        assert!(repo.find_by_id("b-1").await.unwrap().is_none());
        // Removing again is not an error
        repo.remove("b-1").await.unwrap();
    }
}
