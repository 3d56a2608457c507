//! 结果目录的写出.
//!
//! ```text
//! results/
//!     config.json            运行配置
//!     features.csv / .npz    特征表
//!     splits.json            划分方案
//!     fold_{k}/              每个成功的外层折
//!         selected_features.json
//!         search_<model>.json
//!         evaluation_<model>.json
//!         model_<model>.bin.gz
//!     optimal_params/<model>.json
//!     predictions.csv
//!     report.json
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use super::fold::FoldResult;
use super::search::Candidate;
use super::PipelineError;
use crate::dataset::{join_line, Dataset};
use crate::model::PersistError;
use crate::split::{Partition, SplitPlan};

/// 写为格式化的 JSON.
pub(crate) fn write_json<T: Serialize + ?Sized, P: AsRef<Path>>(path: P, value: &T) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, value)?;
    w.flush()
}

/// 删除目录; 目录不存在不算错误.
pub(crate) fn discard(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        r => r,
    }
}

/// 将一个折的产物写入临时目录 `dir`.
pub(crate) fn write_fold(dir: &Path, result: &FoldResult, save_models: bool) -> Result<(), PersistError> {
    discard(dir)?;
    fs::create_dir_all(dir)?;
    write_json(dir.join("selected_features.json"), &result.selected)?;
    for m in &result.models {
        let name = m.evaluation.model.as_str();
        write_json(dir.join(format!("search_{name}.json")), &m.search)?;
        write_json(dir.join(format!("evaluation_{name}.json")), &m.evaluation)?;
        if save_models {
            m.model.save(dir.join(format!("model_{name}.bin.gz")))?;
        }
    }
    Ok(())
}

/// 将临时目录重命名为最终目录, 覆盖旧的结果.
pub(crate) fn commit(partial: &Path, dir: &Path) -> io::Result<()> {
    discard(dir)?;
    fs::rename(partial, dir)
}

/// 每个模型在各折选出的超参数, 写为 `optimal_params/<model>.json`.
pub(crate) fn write_optimal_params(dir: &Path, folds: &[&FoldResult]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut by_model: BTreeMap<&str, BTreeMap<usize, Candidate>> = BTreeMap::new();
    for f in folds {
        for m in &f.models {
            by_model.entry(m.evaluation.model.as_str()).or_default().insert(
                f.fold,
                Candidate {
                    spec: m.search.best.clone(),
                    score: m.search.score,
                },
            );
        }
    }
    for (model, params) in by_model {
        write_json(dir.join(format!("{model}.json")), &params)?;
    }
    Ok(())
}

/// 预测表: 每个成功折的训练与测试行各一行, 每个模型两列 (预测值与连续输出).
pub(crate) fn write_predictions(
    path: &Path,
    dataset: &Dataset,
    plan: &SplitPlan,
    folds: &[&FoldResult],
) -> Result<(), PipelineError> {
    let mut w = BufWriter::new(File::create(path)?);
    let mut header = vec!["ID".to_owned(), "label".to_owned(), "fold".to_owned(), "test".to_owned()];
    if let Some(first) = folds.first() {
        for m in &first.models {
            header.push(format!("{}_pred", m.evaluation.model));
            header.push(format!("{}_pred_proba", m.evaluation.model));
        }
    }
    writeln!(w, "{}", join_line(&header))?;

    for f in folds {
        let Some(fp) = plan.folds.iter().find(|p| p.outer.fold == f.fold) else {
            continue;
        };
        for part in [Partition::Train, Partition::Test] {
            let rows = dataset.subset(&fp.outer.indices(dataset, part));
            let mut columns = Vec::with_capacity(f.models.len() * 2);
            for m in &f.models {
                columns.push(m.model.predict(&rows)?);
                columns.push(m.model.predict_score(&rows)?);
            }
            let test = if part == Partition::Test { "1" } else { "0" };
            for (i, row) in rows.rows().enumerate() {
                let mut cells = vec![
                    row.case_id.to_owned(),
                    row.label.to_string(),
                    f.fold.to_string(),
                    test.to_owned(),
                ];
                cells.extend(columns.iter().map(|c| c[i].to_string()));
                writeln!(w, "{}", join_line(&cells))?;
            }
        }
    }
    w.flush()?;
    Ok(())
}
