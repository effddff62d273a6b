mod add;
mod crawl;
mod proxies;
mod repair;
mod search;
pub mod server;

use std::sync::Arc;

pub use add::*;
pub use crawl::*;
use indicatif::ProgressStyle;
pub use proxies::*;
pub use repair::*;
pub use search::*;
pub use server::*;

use crate::FaceDB;
use crate::config::{FingerprintOptions, IndexOptions, Opts};
use crate::embed::RemoteEmbedder;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// 使用远程向量化服务打开人脸库
async fn open_facedb(
    opts: &Opts,
    index: &IndexOptions,
    fingerprint: &FingerprintOptions,
) -> anyhow::Result<FaceDB> {
    let embedder = RemoteEmbedder::new(
        &index.embed_url,
        index.dim,
        &index.model_version,
        index.embed_timeout(),
    )?;
    Ok(FaceDB::open(&opts.conf_dir, index, fingerprint, Arc::new(embedder)).await?)
}

fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
