//! 对 `rad-berry::pipeline` 的更一层封装. 提供运行目录与配置的加载器.

use rad_berry::pipeline::{ConfigError, RunConfig, RunPaths};
use std::env;
use std::path::{Path, PathBuf};

/// `$HOME/radiomics/<segments>`. 无法确定家目录时返回 `None`.
fn home_dir_with<const N: usize>(segments: [&str; N]) -> Option<PathBuf> {
    let mut p = dirs::home_dir()?;
    p.push("radiomics");
    p.extend(segments);
    Some(p)
}

/// 获取输入目录 (临床表格, 影像与掩膜).
///
/// 1. 若环境变量 `$RADBERRY_INPUT_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/radiomics/input`.
pub fn input_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("RADBERRY_INPUT_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => home_dir_with(["input"]),
    }
}

/// 获取结果目录.
///
/// 1. 若环境变量 `$RADBERRY_RESULTS_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/radiomics/results`.
pub fn results_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("RADBERRY_RESULTS_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => home_dir_with(["results"]),
    }
}

/// 组合运行目录. 显式给出的目录优先, 其次是环境变量和家目录.
pub fn run_paths(input: Option<PathBuf>, results: Option<PathBuf>) -> Option<RunPaths> {
    let input = input.or_else(input_dir_from_env_or_home)?;
    let results = results.or_else(results_dir_from_env_or_home)?;
    Some(RunPaths::new(input, results))
}

/// 读取运行配置. 若 `path` 是相对路径且在当前目录下不存在, 则在 `input_dir` 下查找.
pub fn load_config<P: AsRef<Path>>(path: P, input_dir: &Path) -> Result<RunConfig, ConfigError> {
    let path = path.as_ref();
    if path.is_relative() && !path.exists() {
        RunConfig::load(input_dir.join(path))
    } else {
        RunConfig::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_paths_explicit() {
        let p = run_paths(Some("in".into()), Some("out".into())).unwrap();
        assert_eq!(p.input_dir, PathBuf::from("in"));
        assert_eq!(p.results_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_home_dir_with() {
        if let Some(p) = home_dir_with(["input"]) {
            assert!(p.ends_with("radiomics/input"));
        }
    }
}
