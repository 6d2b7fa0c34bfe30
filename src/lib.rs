pub mod classify;
pub mod config;
pub mod dedup;
pub mod fetch;
pub mod forecast;
pub mod harness;
pub mod model;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod upsert;
