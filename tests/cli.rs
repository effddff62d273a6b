use std::fs;
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use rstest::*;

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

#[fixture]
fn conf_dir() -> TempDir {
    TempDir::new().unwrap()
}

#[rstest]
#[case::add("add")]
#[case::search("search")]
#[case::crawl("crawl")]
#[case::server("server")]
#[case::repair("repair")]
#[case::proxies("proxies")]
fn subcommand_help(#[case] subcmd: &str) -> Result<()> {
    cargo_run!("faceseek", subcmd, "--help").success();
    Ok(())
}

#[rstest]
fn repair_empty_index(conf_dir: TempDir) -> Result<()> {
    cargo_run!("faceseek", "-c", conf_dir.path(), "repair", "--dim", "4")
        .success()
        .stdout(predicate::str::contains("\"orphan_vectors\":0"));
    assert!(conf_dir.path().join("faceseek.db").exists());
    assert!(conf_dir.path().join("vectors.bin").exists());

    // 向量文件头记录了维度，之后不能以其他维度打开
    cargo_run!("faceseek", "-c", conf_dir.path(), "repair", "--dim", "8").failure();
    Ok(())
}

#[rstest]
fn proxies_snapshot(conf_dir: TempDir) -> Result<()> {
    let file = conf_dir.path().join("proxies.txt");
    fs::write(&file, "# 机房 A\nhttp://10.0.0.1:3128\n\nsocks5://10.0.0.2:1080\n")?;

    cargo_run!("faceseek", "proxies", &file)
        .success()
        .stdout(predicate::str::contains("http://10.0.0.1:3128"))
        .stdout(predicate::str::contains("socks5://10.0.0.2:1080"))
        .stdout(predicate::str::contains("healthy"))
        .stdout(predicate::str::contains("机房").not());
    Ok(())
}

#[rstest]
fn crawl_requires_proxies(conf_dir: TempDir) -> Result<()> {
    let profiles = conf_dir.path().join("profiles.txt");
    let proxies = conf_dir.path().join("proxies.txt");
    fs::write(&profiles, "instagram alice\n")?;
    fs::write(&proxies, "# 空列表\n")?;

    cargo_run!("faceseek", "-c", conf_dir.path(), "crawl", &profiles).failure();
    cargo_run!("faceseek", "-c", conf_dir.path(), "crawl", "--proxies", &proxies, &profiles)
        .failure()
        .stderr(predicate::str::contains("代理列表为空"));
    Ok(())
}

#[rstest]
fn search_missing_image(conf_dir: TempDir) -> Result<()> {
    let missing = conf_dir.path().join("missing.png");
    cargo_run!("faceseek", "-c", conf_dir.path(), "search", &missing).failure();
    Ok(())
}
