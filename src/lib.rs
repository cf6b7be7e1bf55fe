pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod http;
pub mod job;
pub mod pipeline;
pub mod processor;
pub mod recovery;
pub mod registry;
pub mod spillover;
pub mod spool;
