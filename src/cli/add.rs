use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use futures::{StreamExt, stream};
use indicatif::ProgressBar;
use log::{error, info};
use regex::Regex;
use walkdir::WalkDir;

use super::{SubCommandExtend, open_facedb, pb_style};
use crate::config::{FingerprintOptions, IndexOptions, Opts};
use crate::facedb::IngestOutcome;

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub fingerprint: FingerprintOptions,
    /// 图片所在目录
    pub path: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp")]
    pub suffix: String,
    /// 同时处理的图片数量，默认为 CPU 核数
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let re_suf = Regex::new(&format!("(?i)^({})$", self.suffix.replace(',', "|")))?;
        let db = open_facedb(opts, &self.index, &self.fingerprint).await?;

        let entries = scan_directory(&self.path, &re_suf);
        info!("扫描完成，共 {} 张图片", entries.len());

        let pb = ProgressBar::new(entries.len() as u64).with_style(pb_style());
        let concurrency = self.concurrency.unwrap_or_else(num_cpus::get).max(1);
        let (mut indexed, mut duplicates, mut rejected) = (0, 0, 0);

        let mut results = stream::iter(entries)
            .map(|path| {
                let db = &db;
                async move {
                    let data = tokio::fs::read(&path).await?;
                    let source_uri = path.to_string_lossy().into_owned();
                    let outcome = db.ingest(&data, &source_uri).await?;
                    anyhow::Ok((source_uri, outcome))
                }
            })
            .buffer_unordered(concurrency);

        while let Some(result) = results.next().await {
            match result {
                Ok((path, IngestOutcome::Indexed { .. })) => {
                    indexed += 1;
                    pb.set_message(path);
                }
                Ok((path, IngestOutcome::Duplicate { .. })) => {
                    duplicates += 1;
                    pb.set_message(format!("跳过图片: {}", path));
                }
                Ok((path, IngestOutcome::Rejected { stage, reason })) => {
                    rejected += 1;
                    pb.println(format!("[{}] {}: {}", stage.as_str(), path, reason));
                }
                Err(e) => {
                    error!("添加图片失败: {e}");
                    return Err(e);
                }
            }
            pb.inc(1);
        }

        drop(results);
        db.index().persist().await?;
        pb.finish_with_message("图片添加完成");
        info!("新增 {}，重复 {}，拒绝 {}", indexed, duplicates, rejected);

        Ok(())
    }
}

fn scan_directory(path: &Path, re_suf: &Regex) -> Vec<PathBuf> {
    info!("开始扫描目录: {}", path.display());
    let mut entries = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| re_suf.is_match(&ext.to_string_lossy()))
        })
        .collect::<Vec<_>>();
    entries.sort();
    entries
}
