pub mod classify;
pub mod config;
pub mod events;
pub mod fetcher;
pub mod humanize;
pub mod model;
pub mod observability;
pub mod parser;
pub mod queue;
pub mod resolver;
pub mod service;
pub mod store;
pub mod worker;
