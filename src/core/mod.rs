//! Core library modules for linkferry
//!
//! This module contains the implementation of the resolver, the transfer
//! engine and the job queue.

pub mod config;
pub mod destination;
pub mod downloader;
pub mod error;
pub mod job;
pub mod partial;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod resolver;
pub mod source;
pub mod stream;
pub mod ticket;
pub mod transfer;
pub mod uploader;

// Re-export main types for internal use
pub use downloader::Downloader;
pub use resolver::Resolver;
pub use uploader::Uploader;
