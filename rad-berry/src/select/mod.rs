//! 特征选择.
//!
//! [`select`] 只读取 [`TrainRows`], 是训练与评估之间的泄漏边界.
//! 各方法先为每一列打分, 再用大顶堆取分数最高的若干列;
//! 分数相同时原始列序靠前者优先, 非有限分数视为最低.

use binary_heap_plus::BinaryHeap;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use ordered_float::OrderedFloat;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{Dataset, Task};
use crate::model::forest::{ForestParams, RandomForest};
use crate::model::linear::lasso;
use crate::model::scale::{Scaling, Standardizer};
use crate::model::Model;

mod rows;

pub use rows::{EvalRows, TrainRows};

/// 特征选择错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectError {
    /// 没有训练行.
    #[error("no training rows to select features from")]
    EmptyTrain,

    /// 数据集没有特征列.
    #[error("dataset has no feature columns")]
    NoFeatures,

    /// 目标特征数为 0.
    #[error("target feature count must be at least 1")]
    ZeroTarget,

    /// 方法参数非法.
    #[error("invalid selection parameter: {0}")]
    InvalidParameter(String),

    /// 数据集中不存在所选特征.
    #[error("selected feature `{0}` is not present in the dataset")]
    UnknownFeature(String),
}

fn default_threshold() -> f64 {
    0.9
}

fn default_alpha() -> f64 {
    0.01
}

fn default_trees() -> usize {
    100
}

/// 特征选择方法.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionMethod {
    /// 单因素 F 检验排序. 分类为方差分析 F 值, 回归为相关系数换算的 F 值.
    #[default]
    Anova,
    /// 按与标签的相关性排序, 并剔除与已选特征相关系数绝对值超过 `threshold` 的特征.
    /// 剩余特征不足时结果少于目标数.
    Correlation {
        /// 冗余阈值, `(0, 1]`.
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    /// 标准化后的 L1 回归, 按系数绝对值排序.
    Lasso {
        /// 正则强度.
        #[serde(default = "default_alpha")]
        alpha: f64,
    },
    /// 随机森林的不纯度重要性.
    ForestImportance {
        /// 树的棵数.
        #[serde(default = "default_trees")]
        n_trees: usize,
    },
}

impl SelectionMethod {
    /// 方法名.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anova => "anova",
            Self::Correlation { .. } => "correlation",
            Self::Lasso { .. } => "lasso",
            Self::ForestImportance { .. } => "forest_importance",
        }
    }

    /// 检查参数.
    pub fn validate(&self) -> Result<(), SelectError> {
        match *self {
            Self::Correlation { threshold } if !(threshold > 0.0 && threshold <= 1.0) => Err(
                SelectError::InvalidParameter(format!("correlation threshold {threshold} not in (0, 1]")),
            ),
            Self::Lasso { alpha } if !(alpha > 0.0 && alpha.is_finite()) => Err(
                SelectError::InvalidParameter(format!("lasso alpha {alpha} must be positive")),
            ),
            Self::ForestImportance { n_trees: 0 } => Err(SelectError::InvalidParameter(
                "forest importance needs at least one tree".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// 选出的特征, 按排名从高到低排列. 生成后不可修改.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectedFeatureSet {
    method: String,
    names: Vec<String>,
    scores: Vec<f64>,
}

impl SelectedFeatureSet {
    /// 使用全部给定特征, 不排序 (分数记为 0).
    pub fn all<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            method: "all".into(),
            names: names.iter().map(|n| n.as_ref().to_owned()).collect(),
            scores: vec![0.0; names.len()],
        }
    }

    /// 方法名.
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// 特征名.
    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// 与 [`Self::names`] 对应的分数.
    #[inline]
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// 特征个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// 所选特征在 `dataset` 中的列下标.
    pub fn columns_in(&self, dataset: &Dataset) -> Result<Vec<usize>, SelectError> {
        self.names
            .iter()
            .map(|n| {
                dataset
                    .column_names()
                    .position(|c| c == n)
                    .ok_or_else(|| SelectError::UnknownFeature(n.clone()))
            })
            .collect()
    }

    /// 取出 `dataset` 中所选特征组成的矩阵, 列按排名排列.
    pub fn project(&self, dataset: &Dataset) -> Result<Array2<f64>, SelectError> {
        Ok(dataset.x().select(Axis(1), &self.columns_in(dataset)?))
    }
}

/// 皮尔逊相关系数. 任一方差为 0 时为 NaN.
fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len() as f64;
    let (ma, mb) = (a.sum() / n, b.sum() / n);
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    sab / (saa * sbb).sqrt()
}

/// 单因素 F 值.
fn anova_scores(x: ArrayView2<f64>, y: ArrayView1<f64>, task: Task) -> Vec<f64> {
    let n = y.len() as f64;
    x.columns()
        .into_iter()
        .map(|col| match task {
            Task::Classification => {
                let mean = col.sum() / n;
                let (mut ssb, mut ssw) = (0.0, 0.0);
                let mut k = 0.0;
                for class in [0.0, 1.0] {
                    let v: Vec<f64> = col.iter().zip(&y).filter(|(_, l)| **l == class).map(|(v, _)| *v).collect();
                    if v.is_empty() {
                        continue;
                    }
                    k += 1.0;
                    let m = v.iter().sum::<f64>() / v.len() as f64;
                    ssb += v.len() as f64 * (m - mean).powi(2);
                    ssw += v.iter().map(|x| (x - m).powi(2)).sum::<f64>();
                }
                (ssb / (k - 1.0)) / (ssw / (n - k))
            }
            Task::Regression => {
                let r = pearson(col, y);
                r * r / (1.0 - r * r) * (n - 2.0)
            }
        })
        .collect()
}

/// 与标签的相关性排序后剔除冗余特征. 返回 (列, 分数), 被剔除的列不出现.
fn correlation_candidates(x: ArrayView2<f64>, y: ArrayView1<f64>, threshold: f64) -> Vec<(usize, f64)> {
    let relevance: Vec<f64> = x.columns().into_iter().map(|c| pearson(c, y).abs()).collect();
    let ranked = top_k(relevance.iter().copied().enumerate(), relevance.len());
    let mut kept: Vec<usize> = Vec::with_capacity(ranked.len());
    for c in ranked {
        let redundant = kept
            .iter()
            .any(|k| pearson(x.column(*k), x.column(c)).abs() > threshold);
        if !redundant {
            kept.push(c);
        }
    }
    kept.into_iter().map(|c| (c, relevance[c])).collect()
}

/// 分数最高的 `k` 列. 分数相同时列下标小者优先.
fn top_k<I: IntoIterator<Item = (usize, f64)>>(scores: I, k: usize) -> Vec<usize> {
    let mut heap: BinaryHeap<(usize, OrderedFloat<f64>), _> =
        BinaryHeap::new_by(|a: &(usize, OrderedFloat<f64>), b: &(usize, OrderedFloat<f64>)| {
            a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0))
        });
    for (i, s) in scores {
        let s = if s.is_nan() { f64::NEG_INFINITY } else { s };
        heap.push((i, OrderedFloat(s)));
    }
    let mut out = Vec::with_capacity(k);
    while out.len() < k {
        match heap.pop() {
            Some((i, _)) => out.push(i),
            None => break,
        }
    }
    out
}

/// 在训练行上为每一列打分, 选出至多 `target_size` 个特征.
///
/// 目标数大于列数时返回全部列 (按排名). 结果只依赖于训练行, 方法,
/// 目标数和 `seed` (仅随机森林使用).
pub fn select(
    train: &TrainRows,
    method: &SelectionMethod,
    target_size: usize,
    seed: u64,
) -> Result<SelectedFeatureSet, SelectError> {
    method.validate()?;
    if target_size == 0 {
        return Err(SelectError::ZeroTarget);
    }
    let data = train.dataset();
    if data.is_empty() {
        return Err(SelectError::EmptyTrain);
    }
    if data.columns().is_empty() {
        return Err(SelectError::NoFeatures);
    }
    let (x, y) = (data.x().view(), data.labels().view());

    let candidates: Vec<(usize, f64)> = match *method {
        SelectionMethod::Anova => anova_scores(x, y, data.task()).into_iter().enumerate().collect(),
        SelectionMethod::Correlation { threshold } => correlation_candidates(x, y, threshold),
        SelectionMethod::Lasso { alpha } => {
            let xs = Standardizer::fit(Scaling::ZScore, x).transform(x);
            let yc = &y - y.mean().unwrap_or(0.0);
            lasso(xs.view(), yc.view(), alpha)
                .map_err(|e| SelectError::InvalidParameter(e.0))?
                .iter()
                .map(|w| w.abs())
                .enumerate()
                .collect()
        }
        SelectionMethod::ForestImportance { n_trees } => {
            let mut forest = RandomForest::new(ForestParams {
                n_trees,
                ..Default::default()
            });
            forest
                .fit(x, y, data.task(), &mut ChaCha8Rng::seed_from_u64(seed))
                .map_err(|e| SelectError::InvalidParameter(e.0))?;
            forest
                .importances()
                .map(|imp| imp.iter().copied().enumerate().collect())
                .unwrap_or_default()
        }
    };

    let mut score_of = vec![f64::NAN; data.columns().len()];
    candidates.iter().for_each(|(c, v)| score_of[*c] = *v);
    let picked = top_k(candidates, target_size);
    let names: Vec<String> = data.column_names().map(String::from).collect();
    let selected = SelectedFeatureSet {
        method: method.name().to_owned(),
        names: picked.iter().map(|c| names[*c].clone()).collect(),
        scores: picked.iter().map(|c| score_of[*c]).collect(),
    };
    log::debug!(
        "{} selected {} of {} features on {} rows",
        selected.method,
        selected.len(),
        names.len(),
        data.len()
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, ColumnRole};
    use ndarray::Array1;

    /// `p` 个特征的数据集, 第 `j` 列与标签的关联随 `j` 递减, 后面的列是噪声.
    fn wide(n: usize, p: usize) -> Dataset {
        let label = |i: usize| (i % 2) as f64;
        Dataset::new(
            Task::Classification,
            vec!["0".into(), "1".into()],
            (0..p)
                .map(|j| Column {
                    name: format!("original_firstorder_F{j:03}"),
                    role: ColumnRole::Radiomic,
                })
                .collect(),
            (0..n).map(|i| format!("c{i:03}")).collect(),
            (0..n).map(|i| format!("c{i:03}")).collect(),
            Array1::from_iter((0..n).map(label)),
            Array2::from_shape_fn((n, p), |(i, j)| {
                let noise = ((i * 31 + j * 17) % 13) as f64 / 13.0;
                if j < 20 {
                    label(i) * 4.0 * 0.8_f64.powi(j as i32) + noise
                } else {
                    noise
                }
            }),
        )
        .unwrap()
    }

    /// 200 个特征中选 10 个: 恰好 10 个, 全部来自输入, 且包含最强的特征.
    #[test]
    fn test_select_ten_of_two_hundred() {
        let ds = wide(60, 200);
        let train = TrainRows::whole(ds.clone());
        let all: Vec<&str> = ds.column_names().collect();
        for method in [
            SelectionMethod::Anova,
            SelectionMethod::Lasso { alpha: 0.01 },
            SelectionMethod::ForestImportance { n_trees: 20 },
        ] {
            let s = select(&train, &method, 10, 1).unwrap();
            assert_eq!(s.len(), 10, "{}", method.name());
            assert!(s.names().iter().all(|n| all.contains(&n.as_str())));
            let mut uniq = s.names().to_vec();
            uniq.dedup();
            assert_eq!(uniq.len(), 10);
        }
        let s = select(&train, &SelectionMethod::Anova, 10, 1).unwrap();
        assert_eq!(s.names()[0], "original_firstorder_F000");
    }

    #[test]
    fn test_select_deterministic() {
        let train = TrainRows::whole(wide(40, 30));
        let m = SelectionMethod::ForestImportance { n_trees: 10 };
        assert_eq!(select(&train, &m, 5, 9).unwrap(), select(&train, &m, 5, 9).unwrap());
    }

    /// 分数相同时按原始列序.
    #[test]
    fn test_ties_keep_column_order() {
        assert_eq!(top_k(vec![(0, 1.0), (1, 2.0), (2, 1.0), (3, f64::NAN)], 3), vec![1, 0, 2]);
        assert_eq!(top_k(vec![(0, 1.0)], 5), vec![0]);
    }

    /// 目标数大于列数时返回全部列.
    #[test]
    fn test_target_larger_than_columns() {
        let train = TrainRows::whole(wide(20, 4));
        let s = select(&train, &SelectionMethod::Anova, 10, 0).unwrap();
        assert_eq!(s.len(), 4);
        assert!(matches!(
            select(&train, &SelectionMethod::Anova, 0, 0),
            Err(SelectError::ZeroTarget)
        ));
    }

    /// 冗余的重复列被相关性过滤剔除.
    #[test]
    fn test_correlation_drops_duplicates() {
        let base = wide(30, 30);
        let dup = base.select_columns(&[25, 25, 26, 27]);
        let s = select(&TrainRows::whole(dup), &SelectionMethod::Correlation { threshold: 0.95 }, 4, 0).unwrap();
        assert_eq!(s.len(), 3);
    }

    /// 只有训练行参与选择: 修改测试行不改变结果.
    #[test]
    fn test_selection_ignores_test_rows() {
        use crate::split::{split, Partition, SplitStrategy};
        let ds = wide(40, 20);
        let s = split(&ds, &SplitStrategy::StratifiedKFold, 2, 4).unwrap().remove(0);
        let before = select(&TrainRows::from_split(&ds, &s), &SelectionMethod::Anova, 5, 0).unwrap();

        let test = s.indices(&ds, Partition::Test);
        let mut x = ds.x().clone();
        for i in &test {
            x.row_mut(*i).fill(1e6);
        }
        let tampered = Dataset::new(
            ds.task(),
            ds.classes().to_vec(),
            ds.columns().to_vec(),
            ds.ids().to_vec(),
            ds.groups().to_vec(),
            ds.labels().clone(),
            x,
        )
        .unwrap();
        let after = select(&TrainRows::from_split(&tampered, &s), &SelectionMethod::Anova, 5, 0).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_method_serde_and_validate() {
        let m: SelectionMethod = serde_json::from_str(r#"{"type":"lasso"}"#).unwrap();
        assert_eq!(m, SelectionMethod::Lasso { alpha: 0.01 });
        assert!(SelectionMethod::Correlation { threshold: 1.5 }.validate().is_err());

        let ds = wide(10, 3);
        let s = SelectedFeatureSet::all(&["original_firstorder_F002"]);
        assert_eq!(s.project(&ds).unwrap().column(0), ds.x().column(2));
        assert!(SelectedFeatureSet::all(&["nope"]).project(&ds).is_err());
    }
}
