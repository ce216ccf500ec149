use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

pub type GeoId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Click,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub kind: InteractionKind,
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    pub fn like(user_id: Uuid, item_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self { user_id, item_id, kind: InteractionKind::Like, timestamp }
    }

    pub fn click(user_id: Uuid, item_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self { user_id, item_id, kind: InteractionKind::Click, timestamp }
    }
}

/// Known facet names of the catalog's semi-structured `categories` payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FacetKind {
    Category,
    Gender,
    Age,
    SuitableFor,
    AcquaintanceLevel,
    Other(String),
}

impl FacetKind {
    /// `unknown` is a placeholder facet in the catalog and never carries signal.
    pub fn parse(key: &str) -> Option<Self> {
        let kind = match key.trim() {
            "" | "unknown" => return None,
            "category" => Self::Category,
            "gender" => Self::Gender,
            "age" => Self::Age,
            "suitable_for" => Self::SuitableFor,
            "acquaintance_level" => Self::AcquaintanceLevel,
            other => Self::Other(other.to_string()),
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Category => "category",
            Self::Gender => "gender",
            Self::Age => "age",
            Self::SuitableFor => "suitable_for",
            Self::AcquaintanceLevel => "acquaintance_level",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for FacetKind {
    fn from(key: String) -> Self {
        Self::parse(&key).unwrap_or(Self::Other(key))
    }
}

impl From<FacetKind> for String {
    fn from(kind: FacetKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for FacetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed item facets. Built once at the store boundary; nothing downstream
/// looks at the raw payload again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facets(BTreeMap<FacetKind, String>);

impl Facets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a JSON object, a JSON string holding an encoded object, or null.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => {
                let mut facets = Self::new();
                for (key, raw) in map {
                    let Some(kind) = FacetKind::parse(key) else { continue };
                    let text = match raw {
                        serde_json::Value::String(s) => s.trim().to_string(),
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        _ => continue,
                    };
                    if !text.is_empty() {
                        facets.0.insert(kind, text);
                    }
                }
                facets
            }
            serde_json::Value::String(encoded) => serde_json::from_str::<serde_json::Value>(encoded)
                .map(|decoded| match decoded {
                    serde_json::Value::Object(_) => Self::from_json(&decoded),
                    _ => Self::new(),
                })
                .unwrap_or_default(),
            _ => Self::new(),
        }
    }

    pub fn with(mut self, kind: FacetKind, value: impl Into<String>) -> Self {
        self.0.insert(kind, value.into());
        self
    }

    pub fn get(&self, kind: &FacetKind) -> Option<&str> {
        self.0.get(kind).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FacetKind, &str)> {
        self.0.iter().map(|(k, v)| (k, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockStatus {
    InStock,
    OutOfStock,
    Other(String),
}

impl StockStatus {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "in_stock" => Self::InStock,
            "out_of_stock" => Self::OutOfStock,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: Uuid,
    pub geo_id: GeoId,
    pub facets: Facets,
    pub price: Option<f64>,
    pub platform: Option<String>,
    pub stock_status: StockStatus,
    /// Set for private items, which never appear in recommendations.
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn is_eligible(&self) -> bool {
        self.stock_status == StockStatus::InStock && self.owner_id.is_none()
    }

    pub fn matches(&self, geo_id: GeoId, filters: &Filters) -> bool {
        if !self.is_eligible() || self.geo_id != geo_id {
            return false;
        }
        if let Some(from) = filters.price_from {
            if !self.price.is_some_and(|p| p >= from) {
                return false;
            }
        }
        if let Some(to) = filters.price_to {
            if !self.price.is_some_and(|p| p <= to) {
                return false;
            }
        }
        if let Some(ref platform) = filters.platform {
            if self.platform.as_deref() != Some(platform.as_str()) {
                return false;
            }
        }
        filters
            .facets
            .iter()
            .all(|(kind, value)| self.facets.get(kind) == Some(value.as_str()))
    }
}

/// One entry of a user's like history, joined with the liked item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikedItem {
    pub item: Item,
    pub liked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSimilarity {
    pub item_a: Uuid,
    pub item_b: Uuid,
    pub score: f64,
    pub co_occurrence_count: u32,
    pub total_likes_a: u32,
    pub total_likes_b: u32,
    pub updated_at: DateTime<Utc>,
}

impl ItemSimilarity {
    /// Storage order for an unordered pair: smaller id first.
    pub fn canonical(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn touches(&self, item: Uuid) -> bool {
        self.item_a == item || self.item_b == item
    }
}

/// A (geo, gender, age, category) popularity bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
    pub geo_id: GeoId,
    pub gender: String,
    pub age_group: String,
    pub category: String,
}

impl Segment {
    pub const ANY: &'static str = "any";

    pub fn generic(geo_id: GeoId) -> Self {
        Self {
            geo_id,
            gender: Self::ANY.to_string(),
            age_group: Self::ANY.to_string(),
            category: Self::ANY.to_string(),
        }
    }

    /// The item's own segment, with "any" standing in for missing facets.
    pub fn for_item(item: &Item) -> Self {
        let facet = |kind: FacetKind| item.facets.get(&kind).unwrap_or(Self::ANY).to_string();
        Self {
            geo_id: item.geo_id,
            gender: facet(FacetKind::Gender),
            age_group: facet(FacetKind::Age),
            category: facet(FacetKind::Category),
        }
    }

    pub fn is_generic(&self) -> bool {
        self.gender == Self::ANY && self.age_group == Self::ANY && self.category == Self::ANY
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularItem {
    pub segment: Segment,
    pub item_id: Uuid,
    pub popularity_score: f64,
    pub updated_at: DateTime<Utc>,
}

/// A probability distribution over observed keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distribution(BTreeMap<String, f64>);

impl Distribution {
    pub fn from_counts(counts: &HashMap<String, u32>) -> Self {
        let total: u32 = counts.values().sum();
        if total == 0 {
            return Self::default();
        }
        Self(
            counts
                .iter()
                .map(|(key, count)| (key.clone(), *count as f64 / total as f64))
                .collect(),
        )
    }

    pub fn from_map(map: BTreeMap<String, f64>) -> Self {
        Self(map)
    }

    pub fn probability(&self, key: &str) -> f64 {
        self.0.get(key).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub category_preferences: Distribution,
    pub platform_preferences: Distribution,
    pub target_age_preferences: Distribution,
    pub relationship_preferences: Distribution,
    pub gender_target_preferences: Distribution,
    pub avg_price: Option<f64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub interaction_count: u32,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn distributions(&self) -> [&Distribution; 5] {
        [
            &self.category_preferences,
            &self.platform_preferences,
            &self.target_age_preferences,
            &self.relationship_preferences,
            &self.gender_target_preferences,
        ]
    }
}

/// Demographic hints the transport layer may have seen for a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demographics {
    pub gender: Option<String>,
    pub age: Option<String>,
}

impl Demographics {
    pub fn is_empty(&self) -> bool {
        self.gender.is_none() && self.age.is_none()
    }
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: default_page(), page_size: default_page_size() }
    }
}

impl Pagination {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }

    /// Number of ranked candidates needed to fill this page completely.
    pub fn end(&self) -> usize {
        self.offset().saturating_add(self.page_size)
    }
}

/// Live-inventory filters. Facet filters are kept sorted so equal filter sets
/// compare (and hash into cache keys) equally regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    pub price_from: Option<f64>,
    pub price_to: Option<f64>,
    pub platform: Option<String>,
    #[serde(default)]
    pub facets: BTreeMap<FacetKind, String>,
}

impl Filters {
    pub fn with_facet(mut self, kind: FacetKind, value: impl Into<String>) -> Self {
        self.facets.insert(kind, value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopularItemsRequest {
    pub geo_id: GeoId,
    pub user_id: Option<Uuid>,
    pub gender: Option<String>,
    pub age: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub pagination: Pagination,
}

impl PopularItemsRequest {
    pub fn new(geo_id: GeoId) -> Self {
        Self {
            geo_id,
            user_id: None,
            gender: None,
            age: None,
            category: None,
            filters: Filters::default(),
            pagination: Pagination::default(),
        }
    }

    pub fn demographics(&self) -> Demographics {
        Demographics { gender: self.gender.clone(), age: self.age.clone() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizedRequest {
    pub user_id: Uuid,
    pub geo_id: GeoId,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_previous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub items: Vec<Uuid>,
    pub pagination: PageInfo,
    pub algorithm_used: String,
    pub cache_hit: bool,
    pub computation_time_ms: f64,
}

/// How loosely the popularity lookup had to match the requested demographics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopularityTier {
    Exact,
    Gender,
    Age,
    Generic,
}

impl PopularityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Gender => "gender",
            Self::Age => "age",
            Self::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Collaborative,
    ContentBased,
    /// Popular-items API.
    Popular(PopularityTier),
    /// Personalized API with nothing better to offer.
    PopularFallback(PopularityTier),
}

impl Algorithm {
    pub fn label(&self) -> String {
        match self {
            Self::Collaborative => "collaborative".to_string(),
            Self::ContentBased => "content_based".to_string(),
            Self::Popular(tier) => format!("popular:{}", tier.as_str()),
            Self::PopularFallback(tier) => format!("popular_fallback:{}", tier.as_str()),
        }
    }
}

/// One popularity lookup. A `None` axis is left open. A requested gender or
/// age must match exactly; a requested category also admits uncategorized
/// ("any") rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopularQuery {
    pub geo_id: GeoId,
    pub gender: Option<String>,
    pub age_group: Option<String>,
    pub category: Option<String>,
    pub limit: usize,
}

impl PopularQuery {
    pub fn admits(&self, segment: &Segment) -> bool {
        segment.geo_id == self.geo_id
            && self.gender.as_ref().map_or(true, |g| *g == segment.gender)
            && self.age_group.as_ref().map_or(true, |a| *a == segment.age_group)
            && self
                .category
                .as_ref()
                .map_or(true, |c| *c == segment.category || segment.category == Segment::ANY)
    }
}
