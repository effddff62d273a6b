use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use super::SubCommandExtend;
use crate::config::Opts;
use crate::crawl::ProxyManager;

#[derive(Parser, Debug, Clone)]
pub struct ProxiesCommand {
    /// 代理列表文件
    pub file: PathBuf,
}

impl SubCommandExtend for ProxiesCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let proxies = ProxyManager::load(&self.file, 3, Duration::from_secs(300))?;
        println!("{}", serde_json::to_string_pretty(&proxies.snapshot())?);
        Ok(())
    }
}
