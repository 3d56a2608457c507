//! 一阶 (直方图) 特征和灰度离散化.

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_BIN_WIDTH;

/// 直方图类特征使用的离散化方案.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BinScheme {
    /// 固定箱宽. 箱边界与 0 对齐.
    FixedWidth {
        /// 箱宽.
        width: f64,
    },

    /// 固定箱数. 在 ROI 强度范围内等分.
    FixedCount {
        /// 箱数.
        count: u32,
    },
}

impl Default for BinScheme {
    fn default() -> Self {
        Self::FixedWidth {
            width: DEFAULT_BIN_WIDTH,
        }
    }
}

impl BinScheme {
    /// 检查参数是否合法.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::FixedWidth { width } => width.is_finite() && *width > 0.0,
            Self::FixedCount { count } => *count > 0,
        }
    }

    /// 将 ROI 强度离散化为从 1 开始的灰度级.
    ///
    /// 返回 (每个体素的灰度级, 灰度级个数). `values` 非空且全部有限.
    pub fn discretize(&self, values: &[f64]) -> (Vec<u32>, u32) {
        let (min, max) = min_max(values);
        let levels: Vec<u32> = match *self {
            Self::FixedWidth { width } => {
                let lo = (min / width).floor();
                values
                    .iter()
                    .map(|v| ((v / width).floor() - lo) as u32 + 1)
                    .collect()
            }
            Self::FixedCount { count } => {
                if max == min {
                    vec![1; values.len()]
                } else {
                    values
                        .iter()
                        .map(|v| (((v - min) / (max - min) * count as f64).floor() as u32 + 1).min(count))
                        .collect()
                }
            }
        };
        let ng = levels.iter().copied().max().unwrap_or(1);
        (levels, ng)
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
}

/// 对已排序数组按线性插值取分位数, `q` 在 `[0, 1]` 内.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let t = rank - lo as f64;
    sorted[lo] * (1.0 - t) + sorted[hi] * t
}

/// 计算一阶特征. `values` 为 ROI 内的强度, `levels`/`ng` 为离散化结果,
/// `voxel` 为单个体素体积 (立方毫米).
pub fn features(values: &[f64], levels: &[u32], ng: u32, voxel: f64) -> Vec<(&'static str, f64)> {
    let n = values.len() as f64;
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let energy: f64 = values.iter().map(|v| v * v).sum();
    let mean = values.iter().sum::<f64>() / n;
    let m2 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let m3 = values.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
    let m4 = values.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / n;

    let p10 = percentile(&sorted, 0.10);
    let p25 = percentile(&sorted, 0.25);
    let p50 = percentile(&sorted, 0.50);
    let p75 = percentile(&sorted, 0.75);
    let p90 = percentile(&sorted, 0.90);
    let (min, max) = (sorted[0], sorted[sorted.len() - 1]);

    let mad = values.iter().map(|v| (v - mean).abs()).sum::<f64>() / n;
    let robust: Vec<f64> = sorted
        .iter()
        .copied()
        .filter(|v| (p10..=p90).contains(v))
        .collect();
    let robust_mean = robust.iter().sum::<f64>() / robust.len() as f64;
    let rmad = robust.iter().map(|v| (v - robust_mean).abs()).sum::<f64>() / robust.len() as f64;

    let mut hist = vec![0u64; ng as usize + 1];
    for l in levels {
        hist[*l as usize] += 1;
    }
    let (entropy, uniformity) = hist.iter().filter(|c| **c > 0).fold((0.0, 0.0), |(e, u), c| {
        let p = *c as f64 / n;
        (e - p * p.log2(), u + p * p)
    });

    // 方差为 0 时偏度和峰度按常数分布定义.
    let (skewness, kurtosis) = if m2 > 0.0 {
        (m3 / m2.powf(1.5), m4 / (m2 * m2))
    } else {
        (0.0, 0.0)
    };

    vec![
        ("Energy", energy),
        ("TotalEnergy", voxel * energy),
        ("Entropy", entropy),
        ("Minimum", min),
        ("10Percentile", p10),
        ("90Percentile", p90),
        ("Maximum", max),
        ("Mean", mean),
        ("Median", p50),
        ("InterquartileRange", p75 - p25),
        ("Range", max - min),
        ("MeanAbsoluteDeviation", mad),
        ("RobustMeanAbsoluteDeviation", rmad),
        ("RootMeanSquared", (energy / n).sqrt()),
        ("Variance", m2),
        ("Skewness", skewness),
        ("Kurtosis", kurtosis),
        ("Uniformity", uniformity),
    ]
}
