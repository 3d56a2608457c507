//! RBF 核模型 (核岭回归形式的最小二乘支持向量机).
//!
//! 以 smartcore 的 Cholesky 分解求解 `(K + I/C) α = y - ȳ`, 预测 `f(x) = Σ α_i k(x, x_i) + ȳ`.
//! 分类任务以 0/1 为目标, 输出截断到 `[0, 1]` 作为正类概率.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::dense::{dense, solve_spd};
use super::{Divergence, Model};
use crate::dataset::Task;

/// 核模型超参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelParams {
    /// 正则强度的倒数.
    pub c: f64,
    /// RBF 宽度 `exp(-gamma ||x - x'||²)`. `None` 取 `1 / 特征数`.
    pub gamma: Option<f64>,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self { c: 1.0, gamma: None }
    }
}

/// 核模型. 保存全部训练样本.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    params: KernelParams,
    task: Task,
    gamma: f64,
    support: Array2<f64>,
    dual: Array1<f64>,
    bias: f64,
}

#[inline]
fn rbf(a: ArrayView1<f64>, b: ArrayView1<f64>, gamma: f64) -> f64 {
    let d: f64 = a.iter().zip(b).map(|(p, q)| (p - q) * (p - q)).sum();
    (-gamma * d).exp()
}

impl KernelModel {
    /// 未训练的模型.
    pub fn new(params: KernelParams) -> Self {
        Self {
            params,
            task: Task::Classification,
            gamma: 1.0,
            support: Array2::zeros((0, 0)),
            dual: Array1::zeros(0),
            bias: 0.0,
        }
    }

    /// 超参数.
    #[inline]
    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    /// 实际使用的 RBF 宽度.
    #[inline]
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    fn decision(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.rows()
            .into_iter()
            .map(|row| {
                self.support
                    .rows()
                    .into_iter()
                    .zip(&self.dual)
                    .map(|(s, a)| a * rbf(row, s, self.gamma))
                    .sum::<f64>()
                    + self.bias
            })
            .collect()
    }
}

impl Model for KernelModel {
    fn name(&self) -> &'static str {
        "kernel"
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
        let (n, p) = x.dim();
        if n == 0 || p == 0 {
            return Err(Divergence("no rows or columns to fit".into()));
        }
        self.task = task;
        self.gamma = self.params.gamma.unwrap_or(1.0 / p as f64);
        let mut k = Array2::from_shape_fn((n, n), |(i, j)| rbf(x.row(i), x.row(j), self.gamma));
        k.diag_mut().mapv_inplace(|v| v + 1.0 / self.params.c);

        let bias = y.mean().unwrap_or(0.0);
        let target = &y - bias;
        let dual = solve_spd(dense(k.view()), target.view())
            .map_err(|e| Divergence(format!("kernel system of {n} rows: {}", e.0)))?;
        self.support = x.to_owned();
        self.dual = dual;
        self.bias = bias;
        Ok(())
    }

    fn predict_score(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let f = self.decision(x);
        match self.task {
            Task::Classification => f.mapv(|v| v.clamp(0.0, 1.0)),
            Task::Regression => f,
        }
    }

    fn importances(&self) -> Option<Array1<f64>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_kernel_fits_xor() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = array![0.0, 1.0, 1.0, 0.0];
        let mut m = KernelModel::new(KernelParams {
            c: 100.0,
            gamma: Some(5.0),
        });
        m.fit(x.view(), y.view(), Task::Classification, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();
        assert_eq!(m.predict(x.view()), y);
        assert!(m.importances().is_none());
    }

    /// 默认宽度为特征数的倒数.
    #[test]
    fn test_default_gamma() {
        let x = Array2::from_shape_fn((6, 4), |(i, j)| (i + j) as f64);
        let y = Array1::from_iter((0..6).map(|i| i as f64));
        let mut m = KernelModel::new(KernelParams::default());
        m.fit(x.view(), y.view(), Task::Regression, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();
        assert_eq!(m.gamma(), 0.25);
        let pred = m.predict_score(x.view());
        assert!(pred.iter().zip(&y).all(|(p, t)| (p - t).abs() < 2.0));
        assert!(pred[5] > pred[0]);
    }
}
