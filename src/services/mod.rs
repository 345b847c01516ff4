pub mod cache;
pub mod hybrid;
pub mod learning;
pub mod metrics;
pub mod profile;
pub mod recommendation;
pub mod scoring;
pub mod store;
pub mod training;
