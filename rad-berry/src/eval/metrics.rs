//! 评价指标.
//!
//! 分类: AUC, 准确率, 灵敏度, 特异度, 精确率, F1 (区分度) 与 Brier 分数 (校准).
//! 回归: RMSE, MAE, R². 无定义的指标 (如只有一类时的 AUC) 为 NaN.

use std::collections::BTreeMap;

use ndarray::ArrayView1;

use crate::consts::DECISION_THRESHOLD;
use crate::dataset::Task;

/// 分类指标名.
pub const CLASSIFICATION_METRICS: [&str; 7] =
    ["auc", "accuracy", "sensitivity", "specificity", "precision", "f1", "brier"];

/// 回归指标名.
pub const REGRESSION_METRICS: [&str; 3] = ["rmse", "mae", "r2"];

/// 任务对应的指标名.
pub fn metric_names(task: Task) -> &'static [&'static str] {
    match task {
        Task::Classification => &CLASSIFICATION_METRICS,
        Task::Regression => &REGRESSION_METRICS,
    }
}

/// 内层搜索使用的主指标: 分类为 AUC, 回归为 R². 均为越大越好.
pub fn primary_metric(task: Task) -> &'static str {
    match task {
        Task::Classification => "auc",
        Task::Regression => "r2",
    }
}

/// ROC 曲线下面积, 即 Mann-Whitney U 统计量. 并列分数取平均秩.
pub fn roc_auc(y: ArrayView1<f64>, score: ArrayView1<f64>) -> f64 {
    let n = y.len();
    let n_pos = y.iter().filter(|v| **v >= 0.5).count();
    let n_neg = n - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| score[*a].total_cmp(&score[*b]));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && score[order[j + 1]] == score[order[i]] {
            j += 1;
        }
        // 秩从 1 开始, i..=j 并列
        let avg = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += order[i..=j].iter().filter(|k| y[**k] >= 0.5).count() as f64 * avg;
        i = j + 1;
    }
    let (p, q) = (n_pos as f64, n_neg as f64);
    (rank_sum - p * (p + 1.0) / 2.0) / (p * q)
}

/// 混淆矩阵.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Confusion {
    /// 真阳性.
    pub tp: usize,
    /// 假阳性.
    pub fp: usize,
    /// 真阴性.
    pub tn: usize,
    /// 假阴性.
    pub fn_: usize,
}

#[inline]
fn ratio(a: usize, b: usize) -> f64 {
    if b == 0 {
        f64::NAN
    } else {
        a as f64 / b as f64
    }
}

impl Confusion {
    /// 由标签和 0/1 预测统计.
    pub fn new(y: ArrayView1<f64>, pred: ArrayView1<f64>) -> Self {
        let mut c = Self::default();
        for (t, p) in y.iter().zip(pred) {
            match (*t >= 0.5, *p >= 0.5) {
                (true, true) => c.tp += 1,
                (false, true) => c.fp += 1,
                (false, false) => c.tn += 1,
                (true, false) => c.fn_ += 1,
            }
        }
        c
    }

    /// 准确率.
    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.tp + self.tn + self.fp + self.fn_)
    }

    /// 灵敏度 (召回率).
    pub fn sensitivity(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    /// 特异度.
    pub fn specificity(&self) -> f64 {
        ratio(self.tn, self.tn + self.fp)
    }

    /// 精确率.
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// F1.
    pub fn f1(&self) -> f64 {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }
}

/// Brier 分数: 概率与标签差的平方均值.
pub fn brier(y: ArrayView1<f64>, prob: ArrayView1<f64>) -> f64 {
    mean(y.iter().zip(prob).map(|(t, p)| (p - t).powi(2)), y.len())
}

/// 均方根误差.
pub fn rmse(y: ArrayView1<f64>, pred: ArrayView1<f64>) -> f64 {
    mean(y.iter().zip(pred).map(|(t, p)| (p - t).powi(2)), y.len()).sqrt()
}

/// 平均绝对误差.
pub fn mae(y: ArrayView1<f64>, pred: ArrayView1<f64>) -> f64 {
    mean(y.iter().zip(pred).map(|(t, p)| (p - t).abs()), y.len())
}

/// 决定系数. 标签方差为 0 时为 NaN.
pub fn r2(y: ArrayView1<f64>, pred: ArrayView1<f64>) -> f64 {
    let m = mean(y.iter().copied(), y.len());
    let ss_tot: f64 = y.iter().map(|t| (t - m).powi(2)).sum();
    let ss_res: f64 = y.iter().zip(pred).map(|(t, p)| (t - p).powi(2)).sum();
    if ss_tot == 0.0 {
        f64::NAN
    } else {
        1.0 - ss_res / ss_tot
    }
}

#[inline]
fn mean<I: Iterator<Item = f64>>(it: I, n: usize) -> f64 {
    if n == 0 {
        f64::NAN
    } else {
        it.sum::<f64>() / n as f64
    }
}

/// 计算任务的全部指标. `score` 为模型连续输出 (分类为正类概率).
pub fn compute(task: Task, y: ArrayView1<f64>, score: ArrayView1<f64>) -> BTreeMap<&'static str, f64> {
    match task {
        Task::Classification => {
            let pred = score.mapv(|s| if s >= DECISION_THRESHOLD { 1.0 } else { 0.0 });
            let c = Confusion::new(y, pred.view());
            BTreeMap::from([
                ("auc", roc_auc(y, score)),
                ("accuracy", c.accuracy()),
                ("sensitivity", c.sensitivity()),
                ("specificity", c.specificity()),
                ("precision", c.precision()),
                ("f1", c.f1()),
                ("brier", brier(y, score)),
            ])
        }
        Task::Regression => BTreeMap::from([
            ("rmse", rmse(y, score)),
            ("mae", mae(y, score)),
            ("r2", r2(y, score)),
        ]),
    }
}
