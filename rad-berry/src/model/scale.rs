//! 特征缩放. 只在训练行上拟合, 随模型一起保存.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// 缩放方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scaling {
    /// 不缩放.
    None,
    /// 缩放到 `[0, 1]`.
    #[default]
    MinMax,
    /// 减均值除以标准差.
    ZScore,
}

/// 拟合好的逐列仿射变换 `(x - offset) / scale`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    scaling: Scaling,
    offset: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    /// 在 `x` (训练行) 上拟合. 常数列的尺度取 1.
    pub fn fit(scaling: Scaling, x: ArrayView2<f64>) -> Self {
        let p = x.ncols();
        let (offset, scale) = match scaling {
            Scaling::None => (Array1::zeros(p), Array1::ones(p)),
            Scaling::MinMax => {
                let lo = x.fold_axis(Axis(0), f64::INFINITY, |a, v| a.min(*v));
                let hi = x.fold_axis(Axis(0), f64::NEG_INFINITY, |a, v| a.max(*v));
                let range = &hi - &lo;
                (lo, range)
            }
            Scaling::ZScore => {
                let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
                let std = x.std_axis(Axis(0), 0.0);
                (mean, std)
            }
        };
        let scale = scale.mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });
        let offset = offset.mapv(|o| if o.is_finite() { o } else { 0.0 });
        Self {
            scaling,
            offset,
            scale,
        }
    }

    /// 缩放方式.
    #[inline]
    pub fn scaling(&self) -> Scaling {
        self.scaling
    }

    /// 列数.
    #[inline]
    pub fn len(&self) -> usize {
        self.offset.len()
    }

    /// 是否没有列?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offset.is_empty()
    }

    /// 变换.
    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        (&x - &self.offset) / &self.scale
    }
}
