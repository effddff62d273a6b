pub mod cli;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embed;
pub mod error;
pub mod facedb;
pub mod fingerprint;
pub mod hamming;
pub mod index;
mod metrics;
pub mod ratelimit;
pub mod server;

pub use config::Opts;
pub use error::{Error, Result};
pub use facedb::FaceDB;
