//! 模型.
//!
//! 三类模型 (线性, 随机森林, RBF 核) 实现同一个 [`Model`] trait,
//! 由配置中的 [`ModelSpec`] 标签选择, 统一包装在 [`AnyModel`] 中.
//! 每个折的训练过程见 [`fit`] 与 [`FoldState`].

use itertools::iproduct;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::DECISION_THRESHOLD;
use crate::dataset::Task;

pub mod forest;
pub mod kernel;
pub mod linear;
mod dense;
mod sampling;
pub mod scale;
mod state;
mod trained;

use forest::{ForestParams, RandomForest};
use kernel::{KernelModel, KernelParams};
use linear::{LinearModel, LinearParams};

pub use sampling::oversample;
pub use scale::{Scaling, Standardizer};
pub use state::FoldState;
pub use trained::{fit, FitOptions, TrainedModel};
pub(crate) use trained::check_train;

/// 模型在数值上发散 (系数出现 NaN/Inf, 方程组奇异等).
#[derive(Clone, Debug, PartialEq)]
pub struct Divergence(pub String);

/// 训练错误. 只对所在的折致命.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainError {
    /// 训练部分的标签少于两类.
    #[error("fold {fold}: training partition has {classes} label class(es), need 2")]
    DegenerateLabel {
        /// 折下标.
        fold: usize,
        /// 实际类别数.
        classes: usize,
    },

    /// 拟合发散.
    #[error("fold {fold}: {model} model diverged: {reason}")]
    Divergence {
        /// 折下标.
        fold: usize,
        /// 模型名.
        model: &'static str,
        /// 原因.
        reason: String,
    },

    /// 训练部分为空.
    #[error("fold {fold}: training partition is empty")]
    EmptyTrain {
        /// 折下标.
        fold: usize,
    },

    /// 评估行缺少模型所需的特征.
    #[error("fold {fold}: feature `{name}` is missing from the rows")]
    MissingFeature {
        /// 折下标.
        fold: usize,
        /// 特征名.
        name: String,
    },

    /// 折状态机的非法转移.
    #[error("fold {fold}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// 折下标.
        fold: usize,
        /// 当前状态.
        from: FoldState,
        /// 目标状态.
        to: FoldState,
    },

    /// 模型超参数非法.
    #[error("invalid model spec: {0}")]
    InvalidSpec(String),
}

/// 模型持久化错误.
#[derive(Debug, Error)]
pub enum PersistError {
    /// 文件读写失败.
    #[error("model file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// 编码或解码失败.
    #[error("model encoding failed: {0}")]
    Codec(#[from] bincode::Error),
}

/// 模型能力集合.
pub trait Model {
    /// 模型名, 与配置标签一致.
    fn name(&self) -> &'static str;

    /// 最近一次拟合的任务类型.
    fn task(&self) -> Task;

    /// 在 `x`, `y` 上拟合. 随机性只来自 `rng`.
    fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        task: Task,
        rng: &mut ChaCha8Rng,
    ) -> Result<(), Divergence>;

    /// 连续输出: 分类为正类概率, 回归为预测值.
    fn predict_score(&self, x: ArrayView2<f64>) -> Array1<f64>;

    /// 预测. 分类按 [`DECISION_THRESHOLD`] 给出 0/1.
    fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let score = self.predict_score(x);
        match self.task() {
            Task::Classification => score.mapv(|s| if s >= DECISION_THRESHOLD { 1.0 } else { 0.0 }),
            Task::Regression => score,
        }
    }

    /// 特征重要性 (若模型支持).
    fn importances(&self) -> Option<Array1<f64>>;
}

/// 模型类别.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// 线性模型.
    Linear,
    /// 随机森林.
    Forest,
    /// RBF 核模型.
    Kernel,
}

impl ModelKind {
    /// 派生随机源时使用的编号.
    #[inline]
    pub(crate) fn code(self) -> u64 {
        match self {
            Self::Linear => 1,
            Self::Forest => 2,
            Self::Kernel => 3,
        }
    }
}

/// 模型规格: 类别标签加超参数.
///
/// ```json
/// {"type": "forest", "n_trees": 200, "max_depth": 5}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSpec {
    /// 线性模型.
    Linear(LinearParams),
    /// 随机森林.
    Forest(ForestParams),
    /// RBF 核模型.
    Kernel(KernelParams),
}

impl ModelSpec {
    /// 模型类别.
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Linear(_) => ModelKind::Linear,
            Self::Forest(_) => ModelKind::Forest,
            Self::Kernel(_) => ModelKind::Kernel,
        }
    }

    /// 模型名.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear(_) => "linear",
            Self::Forest(_) => "forest",
            Self::Kernel(_) => "kernel",
        }
    }

    /// 检查超参数.
    pub fn validate(&self) -> Result<(), TrainError> {
        let bad = |m: String| -> Result<(), TrainError> { Err(TrainError::InvalidSpec(m)) };
        match self {
            Self::Linear(p) if !(p.c > 0.0 && p.c.is_finite()) => bad(format!("linear C must be positive, got {}", p.c)),
            Self::Forest(p) if p.n_trees == 0 => bad("forest needs at least one tree".into()),
            Self::Forest(p) if p.min_samples_leaf == 0 => bad("forest min_samples_leaf must be positive".into()),
            Self::Forest(p) if p.max_depth == Some(0) => bad("forest max_depth must be positive".into()),
            Self::Forest(p) if p.max_features == Some(0) => bad("forest max_features must be positive".into()),
            Self::Kernel(p) if !(p.c > 0.0 && p.c.is_finite()) => bad(format!("kernel C must be positive, got {}", p.c)),
            Self::Kernel(p) if p.gamma.is_some_and(|g| !(g > 0.0 && g.is_finite())) => {
                bad("kernel gamma must be positive".into())
            }
            _ => Ok(()),
        }
    }

    /// 以该规格为中心的默认超参数网格. 未出现在网格中的参数沿用本规格的取值.
    pub fn default_grid(&self) -> Vec<ModelSpec> {
        match self {
            Self::Linear(_) => [0.001, 0.01, 0.1, 1.0, 10.0, 100.0, 1000.0]
                .into_iter()
                .map(|c| Self::Linear(LinearParams { c }))
                .collect(),
            Self::Forest(p) => iproduct!([None, Some(3), Some(6)], [2, 5], [1, 4])
                .map(|(max_depth, min_samples_split, min_samples_leaf)| {
                    Self::Forest(ForestParams {
                        max_depth,
                        min_samples_split,
                        min_samples_leaf,
                        ..p.clone()
                    })
                })
                .collect(),
            Self::Kernel(_) => iproduct!([0.001, 0.01, 0.1, 1.0, 10.0], [0.001, 0.01, 0.1, 1.0])
                .map(|(c, gamma)| Self::Kernel(KernelParams { c, gamma: Some(gamma) }))
                .collect(),
        }
    }

    /// 构造未训练的模型.
    pub fn build(&self) -> AnyModel {
        match self {
            Self::Linear(p) => AnyModel::Linear(LinearModel::new(p.clone())),
            Self::Forest(p) => AnyModel::Forest(RandomForest::new(p.clone())),
            Self::Kernel(p) => AnyModel::Kernel(KernelModel::new(p.clone())),
        }
    }
}

/// 任一模型.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AnyModel {
    /// 线性模型.
    Linear(LinearModel),
    /// 随机森林.
    Forest(RandomForest),
    /// RBF 核模型.
    Kernel(KernelModel),
}

macro_rules! dispatch {
    ($self: expr, $m: ident => $body: expr) => {
        match $self {
            AnyModel::Linear($m) => $body,
            AnyModel::Forest($m) => $body,
            AnyModel::Kernel($m) => $body,
        }
    };
}

impl AnyModel {
    /// 模型类别.
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Linear(_) => ModelKind::Linear,
            Self::Forest(_) => ModelKind::Forest,
            Self::Kernel(_) => ModelKind::Kernel,
        }
    }
}

impl Model for AnyModel {
    fn name(&self) -> &'static str {
        dispatch!(self, m => m.name())
    }

    fn task(&self) -> Task {
        dispatch!(self, m => m.task())
    }

    fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        task: Task,
        rng: &mut ChaCha8Rng,
    ) -> Result<(), Divergence> {
        dispatch!(self, m => m.fit(x, y, task, rng))
    }

    fn predict_score(&self, x: ArrayView2<f64>) -> Array1<f64> {
        dispatch!(self, m => m.predict_score(x))
    }

    fn importances(&self) -> Option<Array1<f64>> {
        dispatch!(self, m => m.importances())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_serde_defaults() {
        let spec: ModelSpec = serde_json::from_str(r#"{"type": "forest", "max_depth": 4}"#).unwrap();
        match &spec {
            ModelSpec::Forest(p) => {
                assert_eq!(p.max_depth, Some(4));
                assert_eq!(p.n_trees, 100);
            }
            other => panic!("unexpected spec {other:?}"),
        }
        assert_eq!(spec.kind(), ModelKind::Forest);
        assert_eq!(spec.build().kind(), ModelKind::Forest);

        let spec: ModelSpec = serde_json::from_str(r#"{"type": "linear"}"#).unwrap();
        assert_eq!(spec, ModelSpec::Linear(LinearParams::default()));
        assert!(serde_json::from_str::<ModelSpec>(r#"{"type": "xgboost"}"#).is_err());
    }

    #[test]
    fn test_grids() {
        assert_eq!(ModelSpec::Linear(Default::default()).default_grid().len(), 7);
        let forest = ModelSpec::Forest(ForestParams {
            n_trees: 7,
            ..Default::default()
        });
        let grid = forest.default_grid();
        assert_eq!(grid.len(), 12);
        assert!(grid.iter().all(|s| matches!(s, ModelSpec::Forest(p) if p.n_trees == 7)));
        assert_eq!(ModelSpec::Kernel(Default::default()).default_grid().len(), 20);
        assert!(grid.iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn test_validate() {
        let bad = ModelSpec::Linear(LinearParams { c: 0.0 });
        assert!(matches!(bad.validate(), Err(TrainError::InvalidSpec(_))));
        let bad = ModelSpec::Forest(ForestParams {
            max_depth: Some(0),
            ..Default::default()
        });
        assert!(bad.validate().is_err());
        let bad = ModelSpec::Kernel(KernelParams {
            c: 1.0,
            gamma: Some(-1.0),
        });
        assert!(bad.validate().is_err());
    }
}
