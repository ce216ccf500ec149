use async_trait::async_trait;
use chrono::{Duration, Utc};
use giftrec::algorithms::PopularityMode;
use giftrec::services::builders::{run_full_sync, ProfileMode, SimilarityMode};
use giftrec::services::cache::{CacheBackend, MemoryCache};
use giftrec::services::derived_store::DerivedStore;
use giftrec::services::memory::{MemoryDerivedStore, MemoryInteractionStore};
use giftrec::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const GEO: GeoId = 213;

fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn item(n: u128, facets: Facets) -> Item {
    Item {
        item_id: id(n),
        geo_id: GEO,
        facets,
        price: Some(1000.0),
        platform: Some("ozon".to_string()),
        stock_status: StockStatus::InStock,
        owner_id: None,
        created_at: Utc::now() - Duration::days(10),
    }
}

fn books() -> Facets {
    Facets::new().with(FacetKind::Category, "books")
}

fn profile(user_id: Uuid, interaction_count: u32) -> UserProfile {
    let mut categories = BTreeMap::new();
    categories.insert("books".to_string(), 1.0);
    UserProfile {
        user_id,
        category_preferences: Distribution::from_map(categories),
        platform_preferences: Distribution::default(),
        target_age_preferences: Distribution::default(),
        relationship_preferences: Distribution::default(),
        gender_target_preferences: Distribution::default(),
        avg_price: Some(1000.0),
        price_min: Some(1000.0),
        price_max: Some(1000.0),
        interaction_count,
        last_interaction_at: Some(Utc::now()),
        updated_at: Utc::now(),
    }
}

fn generic_row(n: u128, score: f64) -> PopularItem {
    PopularItem {
        segment: Segment::generic(GEO),
        item_id: id(n),
        popularity_score: score,
        updated_at: Utc::now(),
    }
}

fn similarity(a: u128, b: u128, score: f64) -> ItemSimilarity {
    let (item_a, item_b) = ItemSimilarity::canonical(id(a), id(b));
    ItemSimilarity {
        item_a,
        item_b,
        score,
        co_occurrence_count: 3,
        total_likes_a: 4,
        total_likes_b: 4,
        updated_at: Utc::now(),
    }
}

struct Fixture {
    interactions: Arc<MemoryInteractionStore>,
    derived: Arc<MemoryDerivedStore>,
    cache: Arc<MemoryCache>,
    state: AppState,
}

fn fixture() -> Fixture {
    fixture_with_cache(Arc::new(MemoryCache::new()))
}

fn fixture_with_cache(cache: Arc<MemoryCache>) -> Fixture {
    let interactions = Arc::new(MemoryInteractionStore::new());
    let derived = Arc::new(MemoryDerivedStore::new());
    let state = AppState::from_stores(Config::default(), interactions.clone(), derived.clone(), cache.clone());
    Fixture { interactions, derived, cache, state }
}

/// A cache backend whose every call fails, as when Redis is unreachable.
struct UnreachableCache;

impl UnreachableCache {
    fn error() -> RecError {
        RecError::Cache(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")))
    }
}

#[async_trait]
impl CacheBackend for UnreachableCache {
    async fn get(&self, _key: &str) -> giftrec::Result<Option<String>> {
        Err(Self::error())
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: std::time::Duration) -> giftrec::Result<()> {
        Err(Self::error())
    }

    async fn flush_all(&self) -> giftrec::Result<()> {
        Err(Self::error())
    }
}

#[tokio::test]
async fn test_similarity_builder_stores_canonical_pairs() {
    let f = fixture();
    let yesterday = Utc::now() - Duration::days(1);
    for n in [10, 20, 30] {
        f.interactions.add_item(item(n, books()));
    }
    for user in 1..=3 {
        f.interactions.add_like(id(user), id(20), yesterday);
        f.interactions.add_like(id(user), id(10), yesterday);
    }
    f.interactions.add_like(id(4), id(10), yesterday);
    f.interactions.add_like(id(4), id(30), yesterday);

    let summary = assert_ok!(f.state.similarity_builder().build(SimilarityMode::Full).await);
    assert_eq!(summary.written, 1);

    let rows = f.derived.similarity_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].item_a, rows[0].item_b), (id(10), id(20)));
    assert_eq!(rows[0].co_occurrence_count, 3);
    assert!((rows[0].score - 0.75).abs() < 1e-9);

    // Looking the pair up from either side yields the same single row.
    let from_a = f.derived.similar_items(&[id(10)], 10).await.unwrap();
    let from_b = f.derived.similar_items(&[id(20)], 10).await.unwrap();
    assert_eq!(from_a, from_b);
}

#[tokio::test]
async fn test_incremental_similarity_keeps_untouched_pairs() {
    let f = fixture();
    let yesterday = Utc::now() - Duration::days(1);
    for user in 1..=2 {
        f.interactions.add_like(id(user), id(10), yesterday);
        f.interactions.add_like(id(user), id(20), yesterday);
    }
    f.derived
        .insert_similarities(&[similarity(70, 80, 0.9), similarity(10, 90, 0.2)])
        .await
        .unwrap();

    assert_ok!(f.state.similarity_builder().build(SimilarityMode::Incremental).await);

    let pairs: HashSet<(Uuid, Uuid)> = f.derived.similarity_rows().iter().map(|r| (r.item_a, r.item_b)).collect();
    let expected: HashSet<(Uuid, Uuid)> = [(id(10), id(20)), (id(70), id(80))].into_iter().collect();
    assert_eq!(pairs, expected);
}

#[tokio::test]
async fn test_profile_distributions_sum_to_one() {
    let f = fixture();
    let user = id(1);
    let now = Utc::now();
    f.interactions.add_item(item(10, books().with(FacetKind::Gender, "f").with(FacetKind::Age, "25-34")));
    f.interactions.add_item(item(11, Facets::new().with(FacetKind::Category, "tech").with(FacetKind::SuitableFor, "friend")));
    let mut cheap = item(12, books().with(FacetKind::Gender, "m"));
    cheap.price = Some(200.0);
    cheap.platform = Some("wb".to_string());
    f.interactions.add_item(cheap);
    for (n, days) in [(10, 1), (11, 2), (12, 3)] {
        f.interactions.add_like(user, id(n), now - Duration::days(days));
    }

    let summary = assert_ok!(f.state.profile_builder().build(ProfileMode::Incremental).await);
    assert_eq!(summary.written, 1);

    let stored = f.derived.profile(user).await.unwrap().unwrap();
    for dist in stored.distributions() {
        assert!((dist.total() - 1.0).abs() < 1e-9);
    }
    assert_eq!(stored.interaction_count, 3);
    assert_eq!(stored.price_min, Some(200.0));
    assert_eq!(stored.price_max, Some(1000.0));

    // Nothing new since the profile was written.
    let again = assert_ok!(f.state.profile_builder().build(ProfileMode::Incremental).await);
    assert_eq!(again.written, 0);
}

#[tokio::test]
async fn test_popularity_falls_back_to_generic_tier() {
    let f = fixture();
    let user = id(1);
    for n in 10..15 {
        f.interactions.add_item(item(n, books()));
    }
    let rows: Vec<PopularItem> = (10..15).map(|n| generic_row(n, 100.0 - n as f64)).collect();
    f.derived.insert_popular_items(&rows).await.unwrap();

    // A popular request carrying demographics leaves hints for the user.
    let mut popular = PopularItemsRequest::new(GEO);
    popular.user_id = Some(user);
    popular.gender = Some("f".to_string());
    popular.age = Some("25-34".to_string());
    let response = assert_ok!(f.state.serving.popular_items(popular).await);
    assert_eq!(response.algorithm_used, "popular:generic");
    assert_eq!(response.items.len(), 5);

    let hints = f.state.cache.demographics(user).await;
    assert_eq!(hints.gender.as_deref(), Some("f"));
    assert_eq!(hints.age.as_deref(), Some("25-34"));

    let request = PersonalizedRequest {
        user_id: user,
        geo_id: GEO,
        filters: Filters::default(),
        pagination: Pagination::new(1, 20),
    };
    let response = assert_ok!(f.state.serving.personalized_items(request).await);
    assert_eq!(response.algorithm_used, "popular_fallback:generic");
    assert_eq!(response.items, (10..15).map(id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_popularity_prefers_tightest_segment() {
    let f = fixture();
    for n in 10..13 {
        f.interactions.add_item(item(n, books()));
    }
    let exact = PopularItem {
        segment: Segment {
            geo_id: GEO,
            gender: "f".to_string(),
            age_group: "25-34".to_string(),
            category: "books".to_string(),
        },
        ..generic_row(12, 1.0)
    };
    f.derived.insert_popular_items(&[generic_row(10, 9.0), generic_row(11, 8.0), exact]).await.unwrap();

    let mut request = PopularItemsRequest::new(GEO);
    request.gender = Some("f".to_string());
    request.age = Some("25-34".to_string());
    let response = assert_ok!(f.state.serving.popular_items(request).await);
    assert_eq!(response.algorithm_used, "popular:exact");
    assert_eq!(response.items, vec![id(12)]);
}

/// Two books for women and one tech gift for men, scored by the popularity builder.
async fn built_popularity() -> Fixture {
    let f = fixture();
    let yesterday = Utc::now() - Duration::days(1);
    f.interactions.add_item(item(1, books().with(FacetKind::Gender, "f").with(FacetKind::Age, "25-34")));
    f.interactions.add_item(item(2, books().with(FacetKind::Gender, "f")));
    f.interactions.add_item(item(3, Facets::new().with(FacetKind::Category, "tech").with(FacetKind::Gender, "m")));
    for user in 100..110 {
        f.interactions.add_like(id(user), id(1), yesterday);
    }
    f.interactions.add_click(id(200), id(2), yesterday);
    f.interactions.add_like(id(201), id(3), yesterday);
    f.interactions.add_like(id(202), id(3), yesterday);

    assert_ok!(f.state.popularity_builder().build(PopularityMode::Decayed).await);
    f
}

#[tokio::test]
async fn test_gender_tier_leaves_age_open() {
    let f = built_popularity().await;

    let mut request = PopularItemsRequest::new(GEO);
    request.gender = Some("f".to_string());
    let response = assert_ok!(f.state.serving.popular_items(request).await);

    assert_eq!(response.algorithm_used, "popular:gender");
    assert_eq!(response.items, vec![id(1), id(2)]);
}

#[tokio::test]
async fn test_category_request_finds_items_with_demographic_facets() {
    let f = built_popularity().await;

    let mut request = PopularItemsRequest::new(GEO);
    request.category = Some("books".to_string());
    let response = assert_ok!(f.state.serving.popular_items(request).await);

    assert_eq!(response.algorithm_used, "popular:generic");
    assert_eq!(response.items, vec![id(1), id(2)]);

    // Uncategorized items stay eligible for any category.
    f.interactions.add_item(item(4, Facets::new()));
    f.interactions.add_like(id(300), id(4), Utc::now() - Duration::days(1));
    assert_ok!(f.state.popularity_builder().build(PopularityMode::FullSync).await);

    let mut request = PopularItemsRequest::new(GEO);
    request.category = Some("books".to_string());
    request.age = Some("25-34".to_string());
    let response = assert_ok!(f.state.serving.popular_items(request).await);
    assert_eq!(response.algorithm_used, "popular:age");
    assert_eq!(response.items, vec![id(1)]);

    let mut request = PopularItemsRequest::new(GEO);
    request.category = Some("books".to_string());
    request.pagination = Pagination::new(1, 10);
    let response = assert_ok!(f.state.serving.popular_items(request).await);
    let items: HashSet<Uuid> = response.items.into_iter().collect();
    let expected: HashSet<Uuid> = [id(1), id(2), id(4)].into_iter().collect();
    assert_eq!(items, expected);
}

#[tokio::test]
async fn test_collaborative_tops_up_with_popular_items() {
    let f = fixture();
    let user = id(1);
    let now = Utc::now();

    for n in [1001, 1002, 1003, 2001, 2002, 3001, 3002, 3003, 3004] {
        f.interactions.add_item(item(n, books()));
    }
    for liked in [1001, 1002, 1003] {
        f.interactions.add_like(user, id(liked), now - Duration::days(2));
    }
    f.derived.upsert_profile(&profile(user, 3)).await.unwrap();
    f.derived
        .insert_similarities(&[similarity(1001, 2001, 0.5), similarity(1002, 2002, 0.4)])
        .await
        .unwrap();

    // Popular rows include a liked item and a collaborative pick; both must be skipped.
    let popular = vec![
        generic_row(1001, 100.0),
        generic_row(2001, 90.0),
        generic_row(3001, 80.0),
        generic_row(3002, 70.0),
        generic_row(3003, 60.0),
        generic_row(3004, 50.0),
    ];
    f.derived.insert_popular_items(&popular).await.unwrap();

    let request = PersonalizedRequest {
        user_id: user,
        geo_id: GEO,
        filters: Filters::default(),
        pagination: Pagination::new(1, 5),
    };
    let response = assert_ok!(f.state.serving.personalized_items(request).await);

    assert_eq!(response.algorithm_used, "collaborative");
    assert_eq!(response.items, vec![id(2001), id(2002), id(3001), id(3002), id(3003)]);
    let unique: HashSet<&Uuid> = response.items.iter().collect();
    assert_eq!(unique.len(), response.items.len());
}

#[tokio::test]
async fn test_collaborative_without_neighbors_downgrades_to_content() {
    let f = fixture();
    let user = id(1);
    for n in [1001, 1002, 1003, 4001] {
        f.interactions.add_item(item(n, books()));
    }
    for liked in [1001, 1002, 1003] {
        f.interactions.add_like(user, id(liked), Utc::now() - Duration::days(2));
    }
    f.derived.upsert_profile(&profile(user, 3)).await.unwrap();

    let request = PersonalizedRequest {
        user_id: user,
        geo_id: GEO,
        filters: Filters::default(),
        pagination: Pagination::default(),
    };
    let response = assert_ok!(f.state.serving.personalized_items(request).await);
    assert_eq!(response.algorithm_used, "content_based");
    assert_eq!(response.items, vec![id(4001)]);
}

#[tokio::test]
async fn test_light_user_gets_content_without_private_or_sold_out_items() {
    let f = fixture();
    let user = id(1);
    f.interactions.add_item(item(1001, books()));
    f.interactions.add_item(item(4001, books()));
    let mut private = item(4002, books());
    private.owner_id = Some(id(77));
    f.interactions.add_item(private);
    let mut sold_out = item(4003, books());
    sold_out.stock_status = StockStatus::OutOfStock;
    f.interactions.add_item(sold_out);
    let mut elsewhere = item(4004, books());
    elsewhere.geo_id = GEO + 1;
    f.interactions.add_item(elsewhere);

    f.interactions.add_like(user, id(1001), Utc::now());
    f.derived.upsert_profile(&profile(user, 1)).await.unwrap();

    let request = PersonalizedRequest {
        user_id: user,
        geo_id: GEO,
        filters: Filters::default(),
        pagination: Pagination::default(),
    };
    let response = assert_ok!(f.state.serving.personalized_items(request).await);
    assert_eq!(response.algorithm_used, "content_based");
    assert_eq!(response.items, vec![id(4001)]);
}

#[tokio::test]
async fn test_popularity_builder_is_idempotent() {
    let f = fixture();
    let now = Utc::now();
    f.interactions.add_item(item(10, books().with(FacetKind::Gender, "f")));
    f.interactions.add_item(item(11, Facets::new()));
    f.interactions.add_item(item(12, books().with(FacetKind::Age, "18-24")));
    f.interactions.add_like(id(1), id(10), now - Duration::days(3));
    f.interactions.add_like(id(2), id(10), now - Duration::days(40));
    f.interactions.add_click(id(3), id(11), now - Duration::days(10));
    f.interactions.add_click(id(3), id(12), now - Duration::days(200));

    let snapshot = |rows: Vec<PopularItem>| -> Vec<(Segment, Uuid, f64)> {
        rows.into_iter().map(|r| (r.segment, r.item_id, r.popularity_score)).collect()
    };

    for mode in [PopularityMode::Decayed, PopularityMode::FullSync] {
        let builder = f.state.popularity_builder();
        assert_ok!(builder.build(mode).await);
        let first = snapshot(f.derived.popular_rows());
        assert_ok!(builder.build(mode).await);
        let second = snapshot(f.derived.popular_rows());

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    // Item 12's only click is outside the decay window, so only the full sync scores it.
    let rows = f.derived.popular_rows();
    assert!(rows.iter().any(|r| r.item_id == id(12)));
}

#[tokio::test]
async fn test_pagination_boundaries() {
    let f = fixture();
    let rows: Vec<PopularItem> = (1..=100u128)
        .map(|n| {
            f.interactions.add_item(item(n, books()));
            generic_row(n, 1000.0 - n as f64)
        })
        .collect();
    f.derived.insert_popular_items(&rows).await.unwrap();

    let mut request = PopularItemsRequest::new(GEO);
    request.pagination = Pagination::new(5, 20);
    let response = assert_ok!(f.state.serving.popular_items(request.clone()).await);
    assert_eq!(response.items, (81..=100u128).map(id).collect::<Vec<_>>());
    assert_eq!(response.pagination.total_count, 100);
    assert_eq!(response.pagination.total_pages, 5);
    assert!(!response.pagination.has_next);
    assert!(response.pagination.has_previous);

    request.pagination = Pagination::new(6, 20);
    let response = assert_ok!(f.state.serving.popular_items(request).await);
    assert!(response.items.is_empty());
    assert_eq!(response.pagination.total_count, 100);
    assert!(!response.pagination.has_next);
}

#[tokio::test]
async fn test_filters_apply_before_pagination() {
    let f = fixture();
    let mut rows = Vec::new();
    for n in 1..=30u128 {
        let mut it = item(n, books());
        it.price = Some(n as f64 * 100.0);
        f.interactions.add_item(it);
        rows.push(generic_row(n, 100.0 - n as f64));
    }
    f.derived.insert_popular_items(&rows).await.unwrap();

    let mut request = PopularItemsRequest::new(GEO);
    request.filters = Filters { price_to: Some(1000.0), ..Filters::default() };
    request.pagination = Pagination::new(1, 4);
    let response = assert_ok!(f.state.serving.popular_items(request).await);

    assert_eq!(response.pagination.total_count, 10);
    assert_eq!(response.pagination.total_pages, 3);
    assert_eq!(response.items, (1..=4u128).map(id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_equal_filters_hit_the_same_cache_entry() {
    let f = fixture();
    f.interactions.add_item(item(10, books().with(FacetKind::Gender, "f")));
    f.derived.insert_popular_items(&[generic_row(10, 5.0)]).await.unwrap();

    let request = |filters: Filters| PersonalizedRequest {
        user_id: id(1),
        geo_id: GEO,
        filters,
        pagination: Pagination::default(),
    };
    let first = Filters::default()
        .with_facet(FacetKind::Category, "books")
        .with_facet(FacetKind::Gender, "f");
    let second = Filters::default()
        .with_facet(FacetKind::Gender, "f")
        .with_facet(FacetKind::Category, "books");

    let miss = assert_ok!(f.state.serving.personalized_items(request(first)).await);
    let hit = assert_ok!(f.state.serving.personalized_items(request(second)).await);

    assert!(!miss.cache_hit);
    assert!(hit.cache_hit);
    assert_eq!(miss.items, hit.items);
    assert_eq!(miss.algorithm_used, hit.algorithm_used);
}

#[tokio::test]
async fn test_cache_failure_degrades_to_computation() {
    let interactions = Arc::new(MemoryInteractionStore::new());
    let derived = Arc::new(MemoryDerivedStore::new());
    let state = AppState::from_stores(Config::default(), interactions.clone(), derived.clone(), Arc::new(UnreachableCache));

    interactions.add_item(item(10, books()));
    derived.insert_popular_items(&[generic_row(10, 5.0)]).await.unwrap();

    let mut request = PopularItemsRequest::new(GEO);
    request.user_id = Some(id(1));
    request.gender = Some("m".to_string());

    for _ in 0..2 {
        let response = assert_ok!(state.serving.popular_items(request.clone()).await);
        assert!(!response.cache_hit);
        assert_eq!(response.items, vec![id(10)]);
    }

    let stats = state.serving.get_serving_stats();
    assert_eq!(stats.get("cache_misses"), Some(&2));
    assert_eq!(stats.get("cache_hits"), None);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let f = fixture();
    let mut request = PopularItemsRequest::new(GEO);
    request.pagination = Pagination::new(1, 500);

    let err = assert_err!(f.state.serving.popular_items(request).await);
    assert!(matches!(err, RecError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_huge_page_numbers_are_rejected() {
    let f = fixture();
    f.interactions.add_item(item(10, books()));
    f.derived.insert_popular_items(&[generic_row(10, 5.0)]).await.unwrap();

    let mut popular = PopularItemsRequest::new(GEO);
    popular.pagination = Pagination::new(usize::MAX / 10, 100);
    let err = assert_err!(f.state.serving.popular_items(popular).await);
    assert!(matches!(err, RecError::InvalidRequest(_)));

    let personalized = PersonalizedRequest {
        user_id: id(1),
        geo_id: GEO,
        filters: Filters::default(),
        pagination: Pagination::new(usize::MAX, 20),
    };
    let err = assert_err!(f.state.serving.personalized_items(personalized).await);
    assert!(matches!(err, RecError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_full_sync_rebuilds_everything_and_flushes_cache() {
    let f = fixture();
    let now = Utc::now();
    for n in [10, 20, 30] {
        f.interactions.add_item(item(n, books().with(FacetKind::Gender, "f")));
    }
    for user in 1..=3 {
        f.interactions.add_like(id(user), id(10), now - Duration::days(400));
        f.interactions.add_like(id(user), id(20), now - Duration::days(400));
    }
    f.interactions.add_click(id(4), id(30), now);

    // Leftovers from an earlier generation.
    f.derived.insert_popular_items(&[generic_row(99, 1.0)]).await.unwrap();
    f.derived.upsert_profile(&profile(id(99), 5)).await.unwrap();
    f.cache.set_ex("v3:popular:stale", "{}", std::time::Duration::from_secs(60)).await.unwrap();

    let report = assert_ok!(
        run_full_sync(
            f.derived.as_ref(),
            &f.state.similarity_builder(),
            &f.state.popularity_builder(),
            &f.state.profile_builder(),
            &f.state.cache,
        )
        .await
    );

    assert_eq!(report.similarities.written, 1);
    assert_eq!(report.profiles.written, 3);
    assert_eq!(f.derived.profile_count(), 3);
    assert!(f.derived.profile(id(99)).await.unwrap().is_none());

    let popular: HashSet<Uuid> = f.derived.popular_rows().iter().map(|r| r.item_id).collect();
    let expected: HashSet<Uuid> = [id(10), id(20), id(30)].into_iter().collect();
    assert_eq!(popular, expected);
    assert!(f.cache.is_empty());
}
