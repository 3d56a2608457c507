//! 嵌套交叉验证实验: 从临床表格 (及可选的影像清单) 出发, 运行完整的建模流程.

mod result;
mod runner;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// 影像组学嵌套交叉验证.
#[derive(Parser, Debug)]
#[command(name = "nested-cv", version, about, long_about = None)]
pub struct Cli {
    /// 运行配置 (JSON).
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 输入目录. 缺省时读取 `$RADBERRY_INPUT_DIR` 或 `$HOME/radiomics/input`.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 结果目录. 缺省时读取 `$RADBERRY_RESULTS_DIR` 或 `$HOME/radiomics/results`.
    #[arg(short, long)]
    results: Option<PathBuf>,

    /// 覆盖配置中的种子.
    #[arg(long)]
    seed: Option<u64>,

    /// 顺序运行外层折.
    #[arg(long)]
    sequential: bool,

    /// 输出调试日志.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    utils::init_logger(cli.verbose);

    match runner::run(&cli) {
        Ok(r) => {
            r.analyze();
            if r.is_partial() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
