pub mod archive;
pub mod clock;
pub mod config;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod form;
pub mod manifest;
pub mod object_store;
pub mod output;
pub mod processor;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transform;
pub mod transport;
