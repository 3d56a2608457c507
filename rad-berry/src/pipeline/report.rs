//! 运行报告.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::fold::{FoldOutcome, FoldStage};
use crate::dataset::{Dataset, DroppedCase, Task};
use crate::eval::{aggregate, AggregateReport, BootstrapConfig, MetricValue};
use crate::model::{FoldState, ModelSpec};

/// 一个外层折的状态.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoldStatus {
    /// 折下标.
    pub fold: usize,
    /// 终态. 取消的折保持 `untrained`.
    pub state: FoldState,
    /// 失败阶段.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<FoldStage>,
    /// 错误描述.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 外层训练部分上选出的特征.
    #[serde(default)]
    pub selected_features: Vec<String>,
}

/// 一个模型在一个折上的结果摘要.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelFoldReport {
    /// 折下标.
    pub fold: usize,
    /// 选中的超参数.
    pub best_params: ModelSpec,
    /// 内层得分.
    pub inner_score: Option<f64>,
    /// 测试部分指标.
    pub metrics: BTreeMap<String, MetricValue>,
}

/// 一个模型的报告.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    /// 汇总指标.
    pub aggregate: AggregateReport,
    /// 逐折明细.
    pub folds: Vec<ModelFoldReport>,
}

/// 运行报告, 写为 `report.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// 运行种子.
    pub seed: u64,
    /// 外层划分策略名.
    pub split_type: String,
    /// 任务类型.
    pub task: Task,
    /// 数据集案例数.
    pub n_cases: usize,
    /// 被丢弃的案例.
    pub dropped: Vec<DroppedCase>,
    /// 每个外层折的状态.
    pub folds: Vec<FoldStatus>,
    /// 模型名 -> 报告.
    pub models: BTreeMap<String, ModelReport>,
}

impl RunReport {
    /// 由各折结局生成报告. 汇总只使用成功的折.
    pub(crate) fn new(
        dataset: &Dataset,
        split_type: &str,
        seed: u64,
        outcomes: &[FoldOutcome],
        bootstrap: &BootstrapConfig,
    ) -> Self {
        let folds = outcomes
            .iter()
            .map(|o| match o {
                FoldOutcome::Completed(r) => FoldStatus {
                    fold: r.fold,
                    state: FoldState::Evaluated,
                    stage: None,
                    error: None,
                    selected_features: r.selected.names().to_vec(),
                },
                FoldOutcome::Failed(f) => FoldStatus {
                    fold: f.fold,
                    state: FoldState::Failed,
                    stage: Some(f.stage),
                    error: Some(f.error.to_string()),
                    selected_features: Vec::new(),
                },
                FoldOutcome::Cancelled(k) => FoldStatus {
                    fold: *k,
                    state: FoldState::Untrained,
                    stage: None,
                    error: None,
                    selected_features: Vec::new(),
                },
            })
            .collect();

        let mut per_model: BTreeMap<String, (Vec<_>, Vec<ModelFoldReport>)> = BTreeMap::new();
        for o in outcomes {
            let FoldOutcome::Completed(r) = o else { continue };
            for m in &r.models {
                let (results, reports) = per_model.entry(m.evaluation.model.clone()).or_default();
                results.push(m.evaluation.clone());
                reports.push(ModelFoldReport {
                    fold: r.fold,
                    best_params: m.search.best.clone(),
                    inner_score: m.search.score,
                    metrics: m.evaluation.metrics.clone(),
                });
            }
        }
        let models = per_model
            .into_iter()
            .map(|(name, (results, folds))| {
                let aggregate = aggregate(&name, dataset.task(), &results, bootstrap, seed);
                (name, ModelReport { aggregate, folds })
            })
            .collect();

        Self {
            seed,
            split_type: split_type.to_owned(),
            task: dataset.task(),
            n_cases: dataset.len(),
            dropped: dataset.drop_log().entries().to_vec(),
            folds,
            models,
        }
    }

    /// 成功的折.
    pub fn completed_folds(&self) -> Vec<usize> {
        self.folds
            .iter()
            .filter(|f| f.state == FoldState::Evaluated)
            .map(|f| f.fold)
            .collect()
    }

    /// 失败的折.
    pub fn failed_folds(&self) -> Vec<&FoldStatus> {
        self.folds.iter().filter(|f| f.state == FoldState::Failed).collect()
    }

    /// 是否只有部分折成功?
    pub fn is_partial(&self) -> bool {
        self.folds.iter().any(|f| f.state != FoldState::Evaluated)
    }

    /// 写为 JSON 文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        super::persist::write_json(path, self)
    }

    /// 读取 JSON 文件.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// 将报告以可读形式写进 `w` 中.
    pub fn describe_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        const S4: &str = "    ";

        #[inline]
        fn f64_to_display(f: Option<f64>) -> String {
            match f {
                Some(f) => format!("{f:.4}"),
                None => "/".to_string(),
            }
        }

        writeln!(
            w,
            "Run (seed {}, {}): {} case(s), {} dropped",
            self.seed,
            self.split_type,
            self.n_cases,
            self.dropped.len()
        )?;
        for d in &self.dropped {
            writeln!(w, "{S4}dropped `{}`: {}", d.case_id, d.reason)?;
        }
        writeln!(
            w,
            "{S4}{} of {} fold(s) completed",
            self.completed_folds().len(),
            self.folds.len()
        )?;
        for f in self.folds.iter().filter(|f| f.state != FoldState::Evaluated) {
            match &f.error {
                Some(e) => writeln!(w, "{S4}fold {} failed: {e}", f.fold)?,
                None => writeln!(w, "{S4}fold {} did not finish", f.fold)?,
            }
        }
        for (name, m) in &self.models {
            writeln!(w, "Model `{name}` over fold(s) {:?}:", m.aggregate.folds)?;
            for (metric, s) in &m.aggregate.per_fold {
                let pooled = m.aggregate.pooled.get(metric).cloned().unwrap_or_default();
                writeln!(
                    w,
                    "{S4}{metric}: {} ± {} (pooled {} [{}, {}])",
                    f64_to_display(s.mean),
                    f64_to_display(s.std),
                    f64_to_display(pooled.value),
                    f64_to_display(pooled.ci_lower),
                    f64_to_display(pooled.ci_upper),
                )?;
            }
        }
        Ok(())
    }
}
