//! 灰度共生矩阵 (GLCM) 纹理特征.
//!
//! 距离为 1, 在 13 个三维方向上分别统计对称共生矩阵, 每个方向单独计算特征后取平均.
//! 没有任何体素对的方向被跳过.

use ndarray::{Array2, Array3};

use crate::Idx3d;

/// 13 个互不相反的三维方向 (dz, dh, dw).
const DIRECTIONS: [(isize, isize, isize); 13] = [
    (0, 0, 1),
    (0, 1, -1),
    (0, 1, 0),
    (0, 1, 1),
    (1, -1, -1),
    (1, -1, 0),
    (1, -1, 1),
    (1, 0, -1),
    (1, 0, 0),
    (1, 0, 1),
    (1, 1, -1),
    (1, 1, 0),
    (1, 1, 1),
];

/// 特征名, 顺序与 [`single_direction`] 的返回值一致.
const NAMES: [&str; 21] = [
    "Autocorrelation",
    "ClusterProminence",
    "ClusterShade",
    "ClusterTendency",
    "Contrast",
    "Correlation",
    "DifferenceAverage",
    "DifferenceEntropy",
    "DifferenceVariance",
    "Id",
    "Idm",
    "Idmn",
    "Idn",
    "InverseVariance",
    "JointAverage",
    "JointEnergy",
    "JointEntropy",
    "MaximumProbability",
    "SumAverage",
    "SumEntropy",
    "SumSquares",
];

/// 在 `grid` 上统计方向 `d` 的对称共生矩阵. `grid` 中 0 表示 ROI 外.
fn cooccurrence(grid: &Array3<u32>, positions: &[Idx3d], ng: usize, d: (isize, isize, isize)) -> Array2<f64> {
    let mut p = Array2::<f64>::zeros((ng, ng));
    for &(z, h, w) in positions {
        let i = grid[(z, h, w)];
        let nb = (
            z.wrapping_add_signed(d.0),
            h.wrapping_add_signed(d.1),
            w.wrapping_add_signed(d.2),
        );
        if let Some(&j) = grid.get(nb) {
            if j > 0 {
                let (a, b) = (i as usize - 1, j as usize - 1);
                p[(a, b)] += 1.0;
                p[(b, a)] += 1.0;
            }
        }
    }
    p
}

#[inline]
fn entropy<'a>(probs: impl Iterator<Item = &'a f64>) -> f64 {
    probs.filter(|p| **p > 0.0).map(|p| -p * p.log2()).sum()
}

/// 由归一化共生矩阵计算一个方向的全部特征.
fn single_direction(p: &Array2<f64>) -> [f64; 21] {
    let ng = p.nrows();
    let ngf = ng as f64;
    let lvl = |k: usize| (k + 1) as f64;

    let px: Vec<f64> = p.rows().into_iter().map(|r| r.sum()).collect();
    let mu = px.iter().enumerate().map(|(k, v)| lvl(k) * v).sum::<f64>();
    let var = px
        .iter()
        .enumerate()
        .map(|(k, v)| (lvl(k) - mu).powi(2) * v)
        .sum::<f64>();

    let mut sum_p = vec![0.0; 2 * ng + 1];
    let mut diff_p = vec![0.0; ng];
    let (mut auto, mut prom, mut shade, mut tend, mut contrast) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let (mut energy, mut max_p) = (0.0, 0.0f64);
    for ((a, b), v) in p.indexed_iter() {
        let (i, j) = (lvl(a), lvl(b));
        sum_p[a + b + 2] += v;
        diff_p[a.abs_diff(b)] += v;
        auto += i * j * v;
        let c = i + j - 2.0 * mu;
        tend += c.powi(2) * v;
        shade += c.powi(3) * v;
        prom += c.powi(4) * v;
        contrast += (i - j).powi(2) * v;
        energy += v * v;
        max_p = max_p.max(*v);
    }

    // 单一灰度时相关系数定义为 1.
    let correlation = if var > 0.0 { (auto - mu * mu) / var } else { 1.0 };

    let diff_avg = diff_p.iter().enumerate().map(|(k, v)| k as f64 * v).sum::<f64>();
    let diff_var = diff_p
        .iter()
        .enumerate()
        .map(|(k, v)| (k as f64 - diff_avg).powi(2) * v)
        .sum::<f64>();
    let inv = |f: &dyn Fn(f64) -> f64| {
        diff_p
            .iter()
            .enumerate()
            .map(|(k, v)| v / f(k as f64))
            .sum::<f64>()
    };
    let inverse_variance = diff_p
        .iter()
        .enumerate()
        .skip(1)
        .map(|(k, v)| v / (k * k) as f64)
        .sum::<f64>();
    let sum_avg = sum_p.iter().enumerate().map(|(k, v)| k as f64 * v).sum::<f64>();

    [
        auto,
        prom,
        shade,
        tend,
        contrast,
        correlation,
        diff_avg,
        entropy(diff_p.iter()),
        diff_var,
        inv(&|k: f64| 1.0 + k),
        inv(&|k: f64| 1.0 + k * k),
        inv(&|k: f64| 1.0 + k * k / (ngf * ngf)),
        inv(&|k: f64| 1.0 + k / ngf),
        inverse_variance,
        mu,
        energy,
        entropy(p.iter()),
        max_p,
        sum_avg,
        entropy(sum_p.iter()),
        var,
    ]
}

/// 计算 GLCM 特征. `levels` 与 `positions` 一一对应, 取值 `1..=ng`.
///
/// 所有方向都没有体素对时 (如单体素 ROI), 全部特征为 NaN.
pub fn features(shape: Idx3d, positions: &[Idx3d], levels: &[u32], ng: u32) -> Vec<(&'static str, f64)> {
    let mut grid = Array3::<u32>::zeros(shape);
    for (pos, l) in positions.iter().zip(levels) {
        grid[*pos] = *l;
    }

    let ng = ng as usize;
    let mut acc = [0.0; 21];
    let mut used = 0usize;
    for d in DIRECTIONS {
        let mut p = cooccurrence(&grid, positions, ng, d);
        let total = p.sum();
        if total == 0.0 {
            continue;
        }
        p /= total;
        for (a, v) in acc.iter_mut().zip(single_direction(&p)) {
            *a += v;
        }
        used += 1;
    }

    let scale = if used == 0 { f64::NAN } else { 1.0 / used as f64 };
    NAMES.iter().zip(acc).map(|(n, v)| (*n, v * scale)).collect()
}
