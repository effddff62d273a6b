use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use super::{OutputFormat, SubCommandExtend, open_facedb};
use crate::config::{FingerprintOptions, IndexOptions, Opts};
use crate::facedb::SearchHit;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub fingerprint: FingerprintOptions,
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 显示的结果数量
    #[arg(short = 'k', long, value_name = "COUNT", default_value_t = 10)]
    pub top_k: usize,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let data = tokio::fs::read(&self.image).await?;
        let db = open_facedb(opts, &self.index, &self.fingerprint).await?;
        let result = db.query(&data, self.top_k).await?;
        print_result(&result, self.output_format)
    }
}

fn print_result(result: &[SearchHit], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for hit in result {
                let mark = if hit.corroborated { "*" } else { " " };
                println!(
                    "{:.2}{}\t{}\t{}",
                    hit.similarity_score,
                    mark,
                    hit.discovered_at.format("%Y-%m-%d"),
                    hit.source_uri
                );
            }
        }
    }
    Ok(())
}
