//! Feature store facade tying the registry, the stores, the writer and the jobs together.

mod feature_store_impl;
mod response_builder;

pub use feature_store_impl::{FeatureStore, ResolvedFeature};
pub use response_builder::{FeatureNames, FeatureResults, FeatureStatus, OnlineFeaturesResponse};
