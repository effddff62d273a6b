use anyhow::Result;
use clap::Parser;
use log::info;

use super::SubCommandExtend;
use crate::config::Opts;
use crate::db::init_db;
use crate::index::{FaceIndex, Metric};

#[derive(Parser, Debug, Clone)]
pub struct RepairCommand {
    /// 向量维度
    #[arg(long, value_name = "N", default_value_t = 512)]
    pub dim: usize,
    /// 距离度量
    #[arg(long, value_enum, default_value_t = Metric::Cosine)]
    pub metric: Metric,
}

impl SubCommandExtend for RepairCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        std::fs::create_dir_all(opts.conf_dir.path())?;
        let db = init_db(opts.conf_dir.database()).await?;
        let report = FaceIndex::repair(&db, opts.conf_dir.vectors(), self.dim, self.metric).await?;
        info!("修复完成: {:?}", report);
        println!("{}", serde_json::to_string(&report)?);
        Ok(())
    }
}
