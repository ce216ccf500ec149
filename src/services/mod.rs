pub mod builders;
pub mod cache;
pub mod derived_store;
pub mod interaction_store;
pub mod memory;
pub mod recommendation;
pub mod scheduler;
pub mod serving;
