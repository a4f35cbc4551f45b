pub mod backoff;
pub mod blocklist;
pub mod config;
pub mod download;
pub mod errors;
pub mod evictor;
pub mod index;
pub mod metadata;
pub mod models;
pub mod overrides;
pub mod resolver;
pub mod selector;
pub mod token;
pub mod upstream;
pub mod web;
