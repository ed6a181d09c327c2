pub mod config;
pub mod directory;
pub mod dispatch;
pub mod driver_pool;
pub mod engine;
pub mod error;
pub mod events;
pub mod looking_pool;
pub mod notify;
pub mod peer_match;
pub mod presence;
pub mod spatial;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
