//! The writable store of materialized aggregates: item similarities,
//! segment popularity and user profiles.

use crate::error::Result;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::{QueryBuilder, Row};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait DerivedStore: Send + Sync {
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>>;

    /// `updated_at` of the stored profiles among `users`.
    async fn profile_watermarks(&self, users: &[Uuid]) -> Result<HashMap<Uuid, DateTime<Utc>>>;

    /// Similarity rows touching any of `items`, best first.
    async fn similar_items(&self, items: &[Uuid], limit: usize) -> Result<Vec<ItemSimilarity>>;

    /// Item ids of one popularity segment, best first.
    async fn popular_items(&self, query: &PopularQuery) -> Result<Vec<Uuid>>;

    async fn delete_all_similarities(&self) -> Result<u64>;

    async fn delete_similarities_touching(&self, items: &[Uuid]) -> Result<u64>;

    async fn insert_similarities(&self, rows: &[ItemSimilarity]) -> Result<u64>;

    async fn delete_popular_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn delete_all_popular(&self) -> Result<u64>;

    /// Insert-or-ignore on (geo, gender, age, category, item).
    async fn insert_popular_items(&self, rows: &[PopularItem]) -> Result<u64>;

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()>;

    async fn delete_all_profiles(&self) -> Result<u64>;
}

pub struct PgDerivedStore {
    pool: PgPool,
}

impl PgDerivedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Derived store schema is up to date");
        Ok(())
    }
}

fn distribution(row: &PgRow, column: &str) -> Result<Distribution> {
    let raw: serde_json::Value = row.try_get(column)?;
    Ok(serde_json::from_value(raw)?)
}

fn profile_from_row(row: &PgRow) -> Result<UserProfile> {
    let interaction_count: i32 = row.try_get("interaction_count")?;
    Ok(UserProfile {
        user_id: row.try_get("user_id")?,
        category_preferences: distribution(row, "category_preferences")?,
        platform_preferences: distribution(row, "platform_preferences")?,
        target_age_preferences: distribution(row, "target_age_preferences")?,
        relationship_preferences: distribution(row, "relationship_preferences")?,
        gender_target_preferences: distribution(row, "gender_target_preferences")?,
        avg_price: row.try_get("avg_price")?,
        price_min: row.try_get("price_min")?,
        price_max: row.try_get("price_max")?,
        interaction_count: interaction_count.max(0) as u32,
        last_interaction_at: row.try_get("last_interaction_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn similarity_from_row(row: &PgRow) -> Result<ItemSimilarity> {
    let co: i32 = row.try_get("co_occurrence_count")?;
    let likes_a: i32 = row.try_get("total_likes_a")?;
    let likes_b: i32 = row.try_get("total_likes_b")?;
    Ok(ItemSimilarity {
        item_a: row.try_get("item_a")?,
        item_b: row.try_get("item_b")?,
        score: row.try_get("score")?,
        co_occurrence_count: co.max(0) as u32,
        total_likes_a: likes_a.max(0) as u32,
        total_likes_b: likes_b.max(0) as u32,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl DerivedStore for PgDerivedStore {
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT * FROM user_profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    async fn profile_watermarks(&self, users: &[Uuid]) -> Result<HashMap<Uuid, DateTime<Utc>>> {
        let rows = sqlx::query("SELECT user_id, updated_at FROM user_profiles WHERE user_id = ANY($1)")
            .bind(users.to_vec())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("user_id")?, row.try_get("updated_at")?)))
            .collect()
    }

    async fn similar_items(&self, items: &[Uuid], limit: usize) -> Result<Vec<ItemSimilarity>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT * FROM item_similarities \
             WHERE item_a = ANY($1) OR item_b = ANY($1) \
             ORDER BY score DESC, item_a, item_b LIMIT $2",
        )
        .bind(items.to_vec())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(similarity_from_row).collect()
    }

    async fn popular_items(&self, query: &PopularQuery) -> Result<Vec<Uuid>> {
        // Open axes can match several rows of one item, so rank by its best score.
        let rows = sqlx::query(
            "SELECT item_id, MAX(popularity_score) AS score FROM popular_items \
             WHERE geo_id = $1 \
               AND ($2::text IS NULL OR gender = $2) \
               AND ($3::text IS NULL OR age_group = $3) \
               AND ($4::text IS NULL OR category = $4 OR category = 'any') \
             GROUP BY item_id ORDER BY score DESC, item_id LIMIT $5",
        )
        .bind(query.geo_id)
        .bind(query.gender.as_deref())
        .bind(query.age_group.as_deref())
        .bind(query.category.as_deref())
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| Ok(row.try_get("item_id")?)).collect()
    }

    async fn delete_all_similarities(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM item_similarities").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_similarities_touching(&self, items: &[Uuid]) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM item_similarities WHERE item_a = ANY($1) OR item_b = ANY($1)")
            .bind(items.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_similarities(&self, rows: &[ItemSimilarity]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO item_similarities \
             (item_a, item_b, score, co_occurrence_count, total_likes_a, total_likes_b, updated_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.item_a)
                .push_bind(row.item_b)
                .push_bind(row.score)
                .push_bind(row.co_occurrence_count as i32)
                .push_bind(row.total_likes_a as i32)
                .push_bind(row.total_likes_b as i32)
                .push_bind(row.updated_at);
        });
        builder.push(
            " ON CONFLICT (item_a, item_b) DO UPDATE SET \
             score = EXCLUDED.score, co_occurrence_count = EXCLUDED.co_occurrence_count, \
             total_likes_a = EXCLUDED.total_likes_a, total_likes_b = EXCLUDED.total_likes_b, \
             updated_at = EXCLUDED.updated_at",
        );

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_popular_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM popular_items WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_popular(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM popular_items").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_popular_items(&self, rows: &[PopularItem]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO popular_items \
             (geo_id, gender, age_group, category, item_id, popularity_score, updated_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.segment.geo_id)
                .push_bind(row.segment.gender.clone())
                .push_bind(row.segment.age_group.clone())
                .push_bind(row.segment.category.clone())
                .push_bind(row.item_id)
                .push_bind(row.popularity_score)
                .push_bind(row.updated_at);
        });
        builder.push(" ON CONFLICT (geo_id, gender, age_group, category, item_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_profiles \
             (user_id, category_preferences, platform_preferences, target_age_preferences, \
              relationship_preferences, gender_target_preferences, avg_price, price_min, price_max, \
              interaction_count, last_interaction_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (user_id) DO UPDATE SET \
              category_preferences = EXCLUDED.category_preferences, \
              platform_preferences = EXCLUDED.platform_preferences, \
              target_age_preferences = EXCLUDED.target_age_preferences, \
              relationship_preferences = EXCLUDED.relationship_preferences, \
              gender_target_preferences = EXCLUDED.gender_target_preferences, \
              avg_price = EXCLUDED.avg_price, price_min = EXCLUDED.price_min, \
              price_max = EXCLUDED.price_max, interaction_count = EXCLUDED.interaction_count, \
              last_interaction_at = EXCLUDED.last_interaction_at, updated_at = EXCLUDED.updated_at",
        )
        .bind(profile.user_id)
        .bind(serde_json::to_value(&profile.category_preferences)?)
        .bind(serde_json::to_value(&profile.platform_preferences)?)
        .bind(serde_json::to_value(&profile.target_age_preferences)?)
        .bind(serde_json::to_value(&profile.relationship_preferences)?)
        .bind(serde_json::to_value(&profile.gender_target_preferences)?)
        .bind(profile.avg_price)
        .bind(profile.price_min)
        .bind(profile.price_max)
        .bind(profile.interaction_count as i32)
        .bind(profile.last_interaction_at)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_all_profiles(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_profiles").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
