//! Tonguefish - a static feed aggregator

pub mod cache;
pub mod config;
pub mod content;
pub mod digest;
pub mod document;
pub mod entry;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod group;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod retrieval;
