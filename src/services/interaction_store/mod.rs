//! Read-only access to the transactional store: likes, clicks and the live
//! item catalog. This system never writes to it.

use crate::error::Result;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[async_trait]
pub trait InteractionStore: Send + Sync {
    async fn liked_item_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>>;

    /// Likes newer than `since`, or all of them.
    async fn likes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Interaction>>;

    async fn clicks(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Interaction>>;

    /// In-stock, unowned items across all geos.
    async fn eligible_items(&self) -> Result<Vec<Item>>;

    /// Users with likes newer than `since`, each with their latest like time.
    async fn recent_likers(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>>;

    /// The user's likes joined with the liked items, newest first.
    async fn like_history(&self, user_id: Uuid, limit: usize) -> Result<Vec<LikedItem>>;

    /// Eligible items in `geo_id` not in `exclude`, newest first.
    async fn candidate_items(
        &self,
        geo_id: GeoId,
        exclude: &HashSet<Uuid>,
        limit: usize,
    ) -> Result<Vec<Item>>;

    /// Keeps the candidates that are live in `geo_id` and pass `filters`, in
    /// candidate order.
    async fn filter_items(&self, candidates: &[Uuid], geo_id: GeoId, filters: &Filters) -> Result<Vec<Uuid>>;
}

const ITEM_COLUMNS: &str = "hp.id, hp.geo_id, hp.categories, hp.price::float8 AS price, \
     hp.platform, hp.status, hp.user_id AS owner_id, hp.created_at";

const ELIGIBLE: &str = "hp.status = 'in_stock' AND hp.user_id IS NULL";

fn item_from_row(row: &PgRow) -> Result<Item> {
    let categories: Option<serde_json::Value> = row.try_get("categories")?;
    let status: Option<String> = row.try_get("status")?;
    Ok(Item {
        item_id: row.try_get("id")?,
        geo_id: row.try_get("geo_id")?,
        facets: categories.as_ref().map(Facets::from_json).unwrap_or_default(),
        price: row.try_get("price")?,
        platform: row.try_get::<Option<String>, _>("platform")?.filter(|p| !p.is_empty()),
        stock_status: StockStatus::from_raw(status.as_deref().unwrap_or_default()),
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn interaction_from_row(row: &PgRow, kind: InteractionKind) -> Result<Interaction> {
    Ok(Interaction {
        user_id: row.try_get("user_id")?,
        item_id: row.try_get("item_id")?,
        kind,
        timestamp: row.try_get("created_at")?,
    })
}

pub struct PgInteractionStore {
    pool: PgPool,
}

impl PgInteractionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn interactions(
        &self,
        table: &str,
        kind: InteractionKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Interaction>> {
        let sql = format!(
            "SELECT user_id, handpicked_present_id AS item_id, created_at FROM {} \
             WHERE ($1::timestamptz IS NULL OR created_at > $1)",
            table
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(|row| interaction_from_row(row, kind)).collect()
    }
}

#[async_trait]
impl InteractionStore for PgInteractionStore {
    async fn liked_item_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT handpicked_present_id AS item_id FROM handpicked_likes WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| Ok(row.try_get("item_id")?)).collect()
    }

    async fn likes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Interaction>> {
        self.interactions("handpicked_likes", InteractionKind::Like, since).await
    }

    async fn clicks(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Interaction>> {
        self.interactions("handpicked_present_clicks", InteractionKind::Click, since).await
    }

    async fn eligible_items(&self) -> Result<Vec<Item>> {
        let sql = format!("SELECT {} FROM handpicked_presents hp WHERE {}", ITEM_COLUMNS, ELIGIBLE);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn recent_likers(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT user_id, MAX(created_at) AS latest_like FROM handpicked_likes \
             WHERE ($1::timestamptz IS NULL OR created_at > $1) \
             GROUP BY user_id ORDER BY latest_like DESC LIMIT $2",
        )
        .bind(since)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("user_id")?, row.try_get("latest_like")?)))
            .collect()
    }

    async fn like_history(&self, user_id: Uuid, limit: usize) -> Result<Vec<LikedItem>> {
        let sql = format!(
            "SELECT {}, hl.created_at AS liked_at FROM handpicked_likes hl \
             JOIN handpicked_presents hp ON hl.handpicked_present_id = hp.id \
             WHERE hl.user_id = $1 ORDER BY hl.created_at DESC LIMIT $2",
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Ok(LikedItem { item: item_from_row(row)?, liked_at: row.try_get("liked_at")? }))
            .collect()
    }

    async fn candidate_items(
        &self,
        geo_id: GeoId,
        exclude: &HashSet<Uuid>,
        limit: usize,
    ) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM handpicked_presents hp \
             WHERE hp.geo_id = $1 AND {} AND NOT (hp.id = ANY($2)) \
             ORDER BY hp.created_at DESC LIMIT $3",
            ITEM_COLUMNS, ELIGIBLE
        );
        let exclude: Vec<Uuid> = exclude.iter().copied().collect();
        let rows = sqlx::query(&sql)
            .bind(geo_id)
            .bind(exclude)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn filter_items(&self, candidates: &[Uuid], geo_id: GeoId, filters: &Filters) -> Result<Vec<Uuid>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Facet payloads may be string-encoded, so facet, price and platform
        // checks run on the parsed items rather than in SQL.
        let sql = format!(
            "SELECT {} FROM handpicked_presents hp WHERE hp.id = ANY($1) AND hp.geo_id = $2 AND {}",
            ITEM_COLUMNS, ELIGIBLE
        );
        let rows = sqlx::query(&sql)
            .bind(candidates.to_vec())
            .bind(geo_id)
            .fetch_all(&self.pool)
            .await?;

        let mut live = HashMap::with_capacity(rows.len());
        for row in &rows {
            let item = item_from_row(row)?;
            live.insert(item.item_id, item);
        }

        Ok(candidates
            .iter()
            .filter(|id| live.get(id).is_some_and(|item| item.matches(geo_id, filters)))
            .copied()
            .collect())
    }
}
