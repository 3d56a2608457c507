//! 模型评估与结果汇总.
//!
//! 每个外层折在其测试行上得到一个 [`EvaluationResult`]; 全部成功的折再汇总为
//! [`AggregateReport`]: 指标的折间均值与标准差, 以及合并全部测试预测后的指标.
//! 置信区间用自助法: 以运行种子派生的随机源有放回地重抽评估行, 取百分位区间.

use std::collections::BTreeMap;

use ndarray::{Array1, ArrayView1};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_BOOTSTRAP, DEFAULT_CONFIDENCE};
use crate::dataset::Task;
use crate::extract::first_order::percentile;
use crate::model::{TrainError, TrainedModel};
use crate::rng::{stage_rng, Stage};
use crate::select::EvalRows;

pub mod metrics;

pub use metrics::{compute, metric_names, primary_metric};

fn default_resamples() -> u32 {
    DEFAULT_BOOTSTRAP
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

/// 自助法设置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// 重抽次数. 0 表示不计算置信区间.
    #[serde(default = "default_resamples")]
    pub n_resamples: u32,
    /// 置信水平, `(0, 1)`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_resamples: DEFAULT_BOOTSTRAP,
            confidence: DEFAULT_CONFIDENCE,
        }
    }
}

/// 一个指标的点估计及置信区间. 无定义的值为 `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// 点估计.
    pub value: Option<f64>,
    /// 置信区间下界.
    pub ci_lower: Option<f64>,
    /// 置信区间上界.
    pub ci_upper: Option<f64>,
}

#[inline]
fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// 一个评估行的预测.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// 案例标识.
    pub case_id: String,
    /// 真实标签.
    pub label: f64,
    /// 模型连续输出.
    pub score: f64,
    /// 预测值 (分类为 0/1).
    pub predicted: f64,
}

/// 一个折的评估结果.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// 外层折下标.
    pub fold: usize,
    /// 模型名.
    pub model: String,
    /// 任务类型.
    pub task: Task,
    /// 评估行数.
    pub n_cases: usize,
    /// 指标.
    pub metrics: BTreeMap<String, MetricValue>,
    /// 逐行预测, 按案例标识排列.
    pub predictions: Vec<Prediction>,
}

/// 指标及其自助法置信区间.
///
/// 每次重抽得到的无定义值 (如重抽样本只有一类时的 AUC) 不参与区间计算.
pub fn metrics_with_ci(
    task: Task,
    y: ArrayView1<f64>,
    score: ArrayView1<f64>,
    bootstrap: &BootstrapConfig,
    rng: &mut ChaCha8Rng,
) -> BTreeMap<String, MetricValue> {
    let point = compute(task, y, score);
    let n = y.len();
    let mut samples: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    if n > 0 {
        for _ in 0..bootstrap.n_resamples {
            let idx: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let ys: Array1<f64> = idx.iter().map(|i| y[*i]).collect();
            let ss: Array1<f64> = idx.iter().map(|i| score[*i]).collect();
            for (name, v) in compute(task, ys.view(), ss.view()) {
                if v.is_finite() {
                    samples.entry(name).or_default().push(v);
                }
            }
        }
    }

    let alpha = (1.0 - bootstrap.confidence) / 2.0;
    point
        .into_iter()
        .map(|(name, v)| {
            let (lo, hi) = match samples.get_mut(name) {
                Some(s) if !s.is_empty() => {
                    s.sort_by(f64::total_cmp);
                    (Some(percentile(s, alpha)), Some(percentile(s, 1.0 - alpha)))
                }
                _ => (None, None),
            };
            (
                name.to_owned(),
                MetricValue {
                    value: finite(v),
                    ci_lower: lo,
                    ci_upper: hi,
                },
            )
        })
        .collect()
}

/// 在评估行上评估模型. 自助法随机源由 `seed` 和折下标派生.
pub fn evaluate(
    model: &TrainedModel,
    rows: &EvalRows,
    bootstrap: &BootstrapConfig,
    seed: u64,
) -> Result<EvaluationResult, TrainError> {
    let data = rows.dataset();
    let score = model.predict_score(data)?;
    let predicted = model.predict(data)?;
    let y = data.labels();
    let mut rng = stage_rng(seed, Stage::Bootstrap, &[model.fold() as u64]);
    let metrics = metrics_with_ci(data.task(), y.view(), score.view(), bootstrap, &mut rng);

    let predictions = data
        .rows()
        .zip(score.iter().zip(&predicted))
        .map(|(r, (s, p))| Prediction {
            case_id: r.case_id.to_owned(),
            label: r.label,
            score: *s,
            predicted: *p,
        })
        .collect();
    Ok(EvaluationResult {
        fold: model.fold(),
        model: model.spec().name().to_owned(),
        task: data.task(),
        n_cases: data.len(),
        metrics,
        predictions,
    })
}

/// 指标的折间统计.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FoldSummary {
    /// 均值.
    pub mean: Option<f64>,
    /// 样本标准差 (少于两个折时为 `None`).
    pub std: Option<f64>,
    /// 最小值.
    pub min: Option<f64>,
    /// 最大值.
    pub max: Option<f64>,
    /// 参与统计的折数.
    pub n_folds: usize,
}

impl FoldSummary {
    fn of(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self::default();
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let std = (n > 1).then(|| {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        });
        Self {
            mean: Some(mean),
            std,
            min: values.iter().copied().reduce(f64::min),
            max: values.iter().copied().reduce(f64::max),
            n_folds: n,
        }
    }
}

/// 一个模型在全部成功折上的汇总.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    /// 模型名.
    pub model: String,
    /// 参与汇总的折.
    pub folds: Vec<usize>,
    /// 指标的折间统计.
    pub per_fold: BTreeMap<String, FoldSummary>,
    /// 合并全部折的测试预测后计算的指标与置信区间.
    pub pooled: BTreeMap<String, MetricValue>,
}

/// 汇总同一模型的各折结果. 合并指标的自助法随机源由 `seed` 派生.
pub fn aggregate(
    model: &str,
    task: Task,
    results: &[EvaluationResult],
    bootstrap: &BootstrapConfig,
    seed: u64,
) -> AggregateReport {
    let per_fold = metric_names(task)
        .iter()
        .map(|name| {
            let values: Vec<f64> = results
                .iter()
                .filter_map(|r| r.metrics.get(*name).and_then(|m| m.value))
                .collect();
            (name.to_string(), FoldSummary::of(&values))
        })
        .collect();

    let all = results.iter().flat_map(|r| &r.predictions);
    let y: Array1<f64> = all.clone().map(|p| p.label).collect();
    let score: Array1<f64> = all.map(|p| p.score).collect();
    let mut rng = stage_rng(seed, Stage::Bootstrap, &[u64::MAX]);
    let pooled = if y.is_empty() {
        BTreeMap::new()
    } else {
        metrics_with_ci(task, y.view(), score.view(), bootstrap, &mut rng)
    };

    AggregateReport {
        model: model.to_owned(),
        folds: results.iter().map(|r| r.fold).collect(),
        per_fold,
        pooled,
    }
}
