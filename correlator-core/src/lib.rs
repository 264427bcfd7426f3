pub mod alerts;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod notify;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod writer;
