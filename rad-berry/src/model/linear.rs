//! 线性模型: L2 正则的 logistic 回归 (分类) 与岭回归 (回归), 由 smartcore 求解.
//!
//! 正则强度以 `C` 表示 (越大正则越弱), 传给 smartcore 的 `alpha` 为 `1 / C`.
//! 拟合后只保留系数和截距, 预测与持久化都不再依赖 smartcore 的模型对象.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::lasso::{Lasso, LassoParameters};
use smartcore::linear::logistic_regression::{LogisticRegression, LogisticRegressionParameters};
use smartcore::linear::ridge_regression::{RidgeRegression, RidgeRegressionParameters};

use super::dense::{class_labels, dense, flatten};
use super::{Divergence, Model};
use crate::dataset::Task;

/// 线性模型超参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearParams {
    /// 正则强度的倒数.
    pub c: f64,
}

impl Default for LinearParams {
    fn default() -> Self {
        Self { c: 1.0 }
    }
}

/// 线性模型.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    params: LinearParams,
    task: Task,
    weights: Array1<f64>,
    bias: f64,
}

#[inline]
fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// 第 0 行全零, 第 `j + 1` 行为第 `j` 个单位向量.
fn unit_rows(p: usize) -> DenseMatrix<f64> {
    let mut m = Array2::<f64>::zeros((p + 1, p));
    for j in 0..p {
        m[[j + 1, j]] = 1.0;
    }
    dense(m.view())
}

/// 由线性回归器在 [`unit_rows`] 上的输出还原 (系数, 截距).
fn recover_linear(pred: &[f64], p: usize) -> Result<(Array1<f64>, f64), Divergence> {
    if pred.len() != p + 1 {
        return Err(Divergence(format!("expected {} predictions, got {}", p + 1, pred.len())));
    }
    let b = pred[0];
    Ok((pred[1..].iter().map(|v| v - b).collect(), b))
}

/// Lasso 回归系数, smartcore 内点法求解.
///
/// `x` 和 `y` 需已中心化; 系数接近但不一定恰好为 0.
pub(crate) fn lasso(x: ArrayView2<f64>, y: ArrayView1<f64>, alpha: f64) -> Result<Array1<f64>, Divergence> {
    let p = x.ncols();
    let params = LassoParameters::default()
        .with_alpha(alpha)
        .with_normalize(false);
    let model: Lasso<f64, f64, DenseMatrix<f64>, Vec<f64>> =
        Lasso::fit(&dense(x), &y.to_vec(), params).map_err(|e| Divergence(format!("lasso: {e}")))?;
    let pred = model
        .predict(&unit_rows(p))
        .map_err(|e| Divergence(format!("lasso: {e}")))?;
    recover_linear(&pred, p).map(|(w, _)| w)
}

impl LinearModel {
    /// 未训练的模型.
    pub fn new(params: LinearParams) -> Self {
        Self {
            params,
            task: Task::Classification,
            weights: Array1::zeros(0),
            bias: 0.0,
        }
    }

    /// 超参数.
    #[inline]
    pub fn params(&self) -> &LinearParams {
        &self.params
    }

    /// 系数.
    #[inline]
    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// 截距.
    #[inline]
    pub fn bias(&self) -> f64 {
        self.bias
    }

    fn fit_logistic(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), Divergence> {
        let params = LogisticRegressionParameters::default().with_alpha(1.0 / self.params.c);
        let model: LogisticRegression<f64, i32, DenseMatrix<f64>, Vec<i32>> =
            LogisticRegression::fit(&dense(x), &class_labels(y), params)
                .map_err(|e| Divergence(format!("logistic regression: {e}")))?;
        let weights = flatten(model.coefficients());
        if weights.len() != x.ncols() {
            return Err(Divergence(format!(
                "expected {} coefficients, got {}",
                x.ncols(),
                weights.len()
            )));
        }
        self.weights = weights;
        self.bias = flatten(model.intercept())
            .get(0)
            .copied()
            .ok_or_else(|| Divergence("missing intercept".into()))?;
        Ok(())
    }

    /// 中心化后求无截距的岭回归, 截距由均值还原.
    fn fit_ridge(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), Divergence> {
        let p = x.ncols();
        let x_mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
        let y_mean = y.mean().unwrap_or(0.0);
        let xc = &x - &x_mean;
        let yc = (&y - y_mean).to_vec();

        let params = RidgeRegressionParameters::default()
            .with_alpha(1.0 / self.params.c)
            .with_normalize(false);
        let model: RidgeRegression<f64, f64, DenseMatrix<f64>, Vec<f64>> =
            RidgeRegression::fit(&dense(xc.view()), &yc, params)
                .map_err(|e| Divergence(format!("ridge regression: {e}")))?;
        let pred = model
            .predict(&unit_rows(p))
            .map_err(|e| Divergence(format!("ridge regression: {e}")))?;
        let (w, b) = recover_linear(&pred, p)?;
        self.bias = y_mean + b - x_mean.dot(&w);
        self.weights = w;
        Ok(())
    }
}

impl Model for LinearModel {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn task(&self) -> Task {
        self.task
    }

    fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        task: Task,
        _rng: &mut ChaCha8Rng,
    ) -> Result<(), Divergence> {
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(Divergence("no rows or columns to fit".into()));
        }
        self.task = task;
        match task {
            Task::Classification => self.fit_logistic(x, y)?,
            Task::Regression => self.fit_ridge(x, y)?,
        }
        if !self.bias.is_finite() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err(Divergence("non-finite coefficients".into()));
        }
        Ok(())
    }

    fn predict_score(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let z = x.dot(&self.weights) + self.bias;
        match self.task {
            Task::Classification => z.mapv(sigmoid),
            Task::Regression => z,
        }
    }

    fn importances(&self) -> Option<Array1<f64>> {
        Some(self.weights.mapv(f64::abs))
    }
}
