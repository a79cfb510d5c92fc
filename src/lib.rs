pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod rulepack;
pub mod server;
pub mod storage;
pub mod store;
pub mod validation;
