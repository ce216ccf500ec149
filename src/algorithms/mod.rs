//! Pure scoring logic shared by the offline builders and the online recommender.
//! Nothing in here touches a store.

pub mod collaborative;
pub mod content;
pub mod popularity;
pub mod profile;
pub mod similarity;

pub use popularity::PopularityMode;
pub use similarity::SimilarityThresholds;
