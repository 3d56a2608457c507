//! 随机森林: 在自助样本和随机特征子集上训练 smartcore 的 CART 决策树, 再取平均.
//!
//! 分类树输出类别, 森林的得分是投给正类的树所占比例; 回归森林输出各树预测的均值.
//! 特征重要性为每棵树在袋外样本上的置换重要性. 每棵树的随机源由森林随机源预先抽取,
//! 并行拟合与顺序拟合结果一致.

use std::sync::Arc;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters, SplitCriterion,
};
use smartcore::tree::decision_tree_regressor::{DecisionTreeRegressor, DecisionTreeRegressorParameters};

use super::dense::{class_labels, dense_columns};
use super::{Divergence, Model};
use crate::dataset::Task;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::prelude::*;
    }
}

/// 森林超参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    /// 树的棵数.
    pub n_trees: usize,
    /// 最大深度, `None` 表示不限制.
    pub max_depth: Option<usize>,
    /// 节点继续划分所需的最少样本数.
    pub min_samples_split: usize,
    /// 叶子的最少样本数.
    pub min_samples_leaf: usize,
    /// 每棵树使用的特征数. `None`: 分类取一半 (向上取整), 回归取全部.
    pub max_features: Option<usize>,
    /// 每棵树是否使用自助采样.
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            bootstrap: true,
        }
    }
}

impl ForestParams {
    fn features_per_tree(&self, p: usize, task: Task) -> usize {
        let m = match (self.max_features, task) {
            (Some(m), _) => m,
            (None, Task::Classification) => (p + 1) / 2,
            (None, Task::Regression) => p,
        };
        m.clamp(1, p.max(1))
    }

    fn max_depth_u16(&self) -> Option<u16> {
        self.max_depth.map(|d| u16::try_from(d).unwrap_or(u16::MAX))
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
enum Learner {
    /// 样本只有一种标签.
    Constant(f64),
    Classifier(DecisionTreeClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>),
    Regressor(DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>),
}

/// 一棵树及其使用的特征列.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Tree {
    columns: Vec<usize>,
    learner: Learner,
}

impl Tree {
    fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        columns: Vec<usize>,
        task: Task,
        params: &ForestParams,
    ) -> Result<Self, Divergence> {
        let first = y.iter().next().copied().unwrap_or(0.0);
        if y.iter().all(|v| *v == first) {
            return Ok(Self {
                columns,
                learner: Learner::Constant(first),
            });
        }
        let xs = dense_columns(x, &columns);
        let learner = match task {
            Task::Classification => {
                let mut tp = DecisionTreeClassifierParameters::default()
                    .with_criterion(SplitCriterion::Gini)
                    .with_min_samples_leaf(params.min_samples_leaf)
                    .with_min_samples_split(params.min_samples_split);
                if let Some(d) = params.max_depth_u16() {
                    tp = tp.with_max_depth(d);
                }
                let tree = DecisionTreeClassifier::fit(&xs, &class_labels(y), tp)
                    .map_err(|e| Divergence(format!("decision tree: {e}")))?;
                Learner::Classifier(tree)
            }
            Task::Regression => {
                let mut tp = DecisionTreeRegressorParameters::default()
                    .with_min_samples_leaf(params.min_samples_leaf)
                    .with_min_samples_split(params.min_samples_split);
                if let Some(d) = params.max_depth_u16() {
                    tp = tp.with_max_depth(d);
                }
                let tree = DecisionTreeRegressor::fit(&xs, &y.to_vec(), tp)
                    .map_err(|e| Divergence(format!("regression tree: {e}")))?;
                Learner::Regressor(tree)
            }
        };
        Ok(Self { columns, learner })
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<f64>, Divergence> {
        match &self.learner {
            Learner::Constant(v) => Ok(vec![*v; x.nrows()]),
            Learner::Classifier(t) => t
                .predict(&dense_columns(x, &self.columns))
                .map(|labels| labels.into_iter().map(f64::from).collect())
                .map_err(|e| Divergence(format!("decision tree: {e}"))),
            Learner::Regressor(t) => t
                .predict(&dense_columns(x, &self.columns))
                .map_err(|e| Divergence(format!("regression tree: {e}"))),
        }
    }
}

/// 分类为错误率, 回归为均方误差.
fn loss(pred: &[f64], y: ArrayView1<f64>, task: Task) -> f64 {
    let n = pred.len().max(1) as f64;
    let sum: f64 = match task {
        Task::Classification => pred.iter().zip(y).filter(|(p, t)| p != t).count() as f64,
        Task::Regression => pred.iter().zip(y).map(|(p, t)| (p - t).powi(2)).sum(),
    };
    sum / n
}

/// 在 `rows` 上逐列打乱该树使用的特征, 记录损失的增加量.
fn permutation_importance(
    tree: &Tree,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    rows: &[usize],
    task: Task,
    rng: &mut ChaCha8Rng,
) -> Result<Vec<f64>, Divergence> {
    let mut importance = vec![0.0; x.ncols()];
    if matches!(tree.learner, Learner::Constant(_)) {
        return Ok(importance);
    }
    let xo = x.select(Axis(0), rows);
    let yo = y.select(Axis(0), rows);
    let base = loss(&tree.predict(xo.view())?, yo.view(), task);
    for &c in &tree.columns {
        let mut shuffled = xo.clone();
        let mut col = xo.column(c).to_vec();
        col.shuffle(rng);
        shuffled.column_mut(c).assign(&Array1::from(col));
        let permuted = loss(&tree.predict(shuffled.view())?, yo.view(), task);
        importance[c] = (permuted - base).max(0.0);
    }
    Ok(importance)
}

fn fit_tree(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    task: Task,
    params: &ForestParams,
    seed: u64,
) -> Result<(Tree, Vec<f64>), Divergence> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let (n, p) = x.dim();
    let rows: Vec<usize> = if params.bootstrap {
        (0..n).map(|_| rng.gen_range(0..n)).collect()
    } else {
        (0..n).collect()
    };
    let mut columns = index::sample(&mut rng, p, params.features_per_tree(p, task)).into_vec();
    columns.sort_unstable();

    let tree = Tree::fit(
        x.select(Axis(0), &rows).view(),
        y.select(Axis(0), &rows).view(),
        columns,
        task,
        params,
    )?;

    // 袋外行; 不做自助采样时用全部训练行
    let mut in_bag = vec![false; n];
    rows.iter().for_each(|r| in_bag[*r] = true);
    let mut oob: Vec<usize> = (0..n).filter(|i| !in_bag[*i]).collect();
    if oob.is_empty() {
        oob = (0..n).collect();
    }
    let importance = permutation_importance(&tree, x, y, &oob, task, &mut rng)?;
    Ok((tree, importance))
}

/// 随机森林.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    params: ForestParams,
    task: Task,
    trees: Arc<Vec<Tree>>,
    importances: Vec<f64>,
}

impl RandomForest {
    /// 未训练的森林.
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            task: Task::Classification,
            trees: Arc::new(Vec::new()),
            importances: Vec::new(),
        }
    }

    /// 超参数.
    #[inline]
    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    /// 树的棵数.
    #[inline]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    /// 是否尚未训练?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

impl Model for RandomForest {
    fn name(&self) -> &'static str {
        "forest"
    }

    fn task(&self) -> Task {
        self.task
    }

    fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        task: Task,
        rng: &mut ChaCha8Rng,
    ) -> Result<(), Divergence> {
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(Divergence("no rows or columns to fit".into()));
        }
        if self.params.n_trees == 0 {
            return Err(Divergence("forest needs at least one tree".into()));
        }
        self.task = task;
        let seeds: Vec<u64> = (0..self.params.n_trees).map(|_| rng.gen()).collect();
        let params = &self.params;

        #[cfg(feature = "rayon")]
        let fitted = seeds
            .par_iter()
            .map(|s| fit_tree(x, y, task, params, *s))
            .collect::<Result<Vec<_>, _>>()?;
        #[cfg(not(feature = "rayon"))]
        let fitted = seeds
            .iter()
            .map(|s| fit_tree(x, y, task, params, *s))
            .collect::<Result<Vec<_>, _>>()?;

        let mut total = vec![0.0; x.ncols()];
        for (_, imp) in &fitted {
            total.iter_mut().zip(imp).for_each(|(t, v)| *t += v);
        }
        let sum: f64 = total.iter().sum();
        if sum > 0.0 {
            total.iter_mut().for_each(|t| *t /= sum);
        }
        self.importances = total;
        self.trees = Arc::new(fitted.into_iter().map(|(t, _)| t).collect());
        log::trace!("forest: {} trees on {} rows", self.trees.len(), x.nrows());
        Ok(())
    }

    fn predict_score(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let mut sum = Array1::<f64>::zeros(x.nrows());
        for tree in self.trees.iter() {
            match tree.predict(x) {
                Ok(pred) => sum.iter_mut().zip(pred).for_each(|(s, p)| *s += p),
                Err(e) => {
                    log::error!("forest prediction failed: {}", e.0);
                    return Array1::from_elem(x.nrows(), f64::NAN);
                }
            }
        }
        sum / self.trees.len().max(1) as f64
    }

    fn importances(&self) -> Option<Array1<f64>> {
        Some(Array1::from(self.importances.clone()))
    }
}
