//! 可复现的数据划分.
//!
//! 划分的最小单位是分组 (通常是患者). 数据集总是带有分组键, 未配置分组列时
//! 每个案例自成一组, 因此任何策略下同一分组都不会同时出现在训练侧和测试侧.
//!
//! # 算法
//!
//! 1. 分组按首个成员在数据集中的顺序排列, 用派生种子的随机源打乱, 再按分组大小稳定降序排序.
//! 2. 依次将分组分配到 "当前最欠缺" 的折: 分层时比较该类别在各折中的填充比例,
//!   其次比较折大小, 最后比较折下标.
//!
//! 相同的数据集, 策略, 种子和折数总是得到逐位相同的结果.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{Dataset, Task};
use crate::rng::{stage_rng, Stage};

mod plan;

pub use plan::{FoldPlan, SplitPlan};

/// 划分错误. 划分错误对整个运行是致命的.
#[derive(Debug, Error)]
pub enum SplitError {
    /// 某个类别或分组数少于折数.
    #[error("{what}: {count} unit(s) available, {folds} fold(s) requested")]
    InsufficientCases {
        /// 不足的对象 (类别或分组).
        what: String,
        /// 可用单位数.
        count: usize,
        /// 需要的折数.
        folds: usize,
    },

    /// 分层划分时同一分组内标签不一致.
    #[error("group `{0}` contains more than one label class")]
    InconsistentGroupLabel(String),

    /// 预定义测试集拆散了某个分组.
    #[error("group `{0}` spans both train and test partitions")]
    GroupSpansPartitions(String),

    /// 预定义测试集中的案例不在数据集中.
    #[error("unknown case `{0}` in predefined test set")]
    UnknownCase(String),

    /// 折数或比例不合法.
    #[error("invalid split parameter: {0}")]
    InvalidParameter(String),

    /// 划分文件读写失败.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 划分文件格式错误.
    #[error("split file: {0}")]
    Json(#[from] serde_json::Error),
}

/// 划分策略.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitStrategy {
    /// 单次留出. 测试集约占 `test_ratio`, 分类任务按类别分层.
    Holdout {
        /// 测试集比例, 在 (0, 1) 内.
        test_ratio: f64,
    },
    /// 分层 k 折.
    StratifiedKFold,
    /// 分组 k 折, 不分层.
    GroupedKFold,
    /// 分层分组 k 折.
    StratifiedGroupedKFold,
    /// 给定测试集.
    PredefinedTest {
        /// 测试集案例标识.
        test_ids: Vec<String>,
    },
}

impl Default for SplitStrategy {
    fn default() -> Self {
        Self::StratifiedGroupedKFold
    }
}

impl SplitStrategy {
    /// 策略名.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Holdout { .. } => "holdout",
            Self::StratifiedKFold => "stratified_kfold",
            Self::GroupedKFold => "grouped_kfold",
            Self::StratifiedGroupedKFold => "stratified_grouped_kfold",
            Self::PredefinedTest { .. } => "predefined_test",
        }
    }

    fn stratified(&self) -> bool {
        !matches!(self, Self::GroupedKFold)
    }
}

/// 划分中的角色.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// 训练.
    Train,
    /// 验证 (内层).
    Validation,
    /// 测试 (外层).
    Test,
}

/// 一次划分: 每个案例的角色.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    /// 策略名.
    pub name: String,
    /// 折下标.
    pub fold: usize,
    /// 生成该划分的种子.
    pub seed: u64,
    /// 案例标识 -> 角色.
    pub assignments: BTreeMap<String, Partition>,
}

impl Split {
    /// 属于 `part` 的案例标识, 升序.
    pub fn ids(&self, part: Partition) -> Vec<&str> {
        self.assignments
            .iter()
            .filter(|(_, p)| **p == part)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// 属于 `part` 的案例个数.
    pub fn count(&self, part: Partition) -> usize {
        self.assignments.values().filter(|p| **p == part).count()
    }

    /// 属于 `part` 的案例在 `dataset` 中的行下标, 升序. 不在数据集中的标识被忽略.
    pub fn indices(&self, dataset: &Dataset, part: Partition) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .ids(part)
            .into_iter()
            .filter_map(|id| dataset.index_of(id))
            .collect();
        out.sort_unstable();
        out
    }

    /// 检查 `dataset` 的任何分组都只出现在一种角色中.
    pub fn groups_disjoint(&self, dataset: &Dataset) -> bool {
        let mut seen: BTreeMap<&str, Partition> = BTreeMap::new();
        dataset.rows().all(|r| match self.assignments.get(r.case_id) {
            Some(p) => *seen.entry(r.group).or_insert(*p) == *p,
            None => true,
        })
    }
}

/// 划分单位: 一个分组.
struct Unit {
    key: String,
    rows: Vec<usize>,
    class: Option<u32>,
}

/// 按分组收集单位, 按首个成员的行序排列.
fn units(dataset: &Dataset, stratified: bool) -> Result<Vec<Unit>, SplitError> {
    let mut order: Vec<Unit> = Vec::new();
    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, row) in dataset.rows().enumerate() {
        let class = stratified.then_some(row.label as u32);
        match index.get(row.group) {
            Some(&u) => {
                if order[u].class != class {
                    return Err(SplitError::InconsistentGroupLabel(row.group.to_owned()));
                }
                order[u].rows.push(i);
            }
            None => {
                index.insert(row.group, order.len());
                order.push(Unit {
                    key: row.group.to_owned(),
                    rows: vec![i],
                    class,
                });
            }
        }
    }
    Ok(order)
}

/// 将单位分配到 `k` 个折, 返回每行所在的折.
fn assign_folds(dataset: &Dataset, k: usize, stratified: bool, seed: u64, stage: Stage, path: &[u64]) -> Result<Vec<usize>, SplitError> {
    if k < 2 {
        return Err(SplitError::InvalidParameter(format!("need at least 2 folds, got {k}")));
    }
    let stratified = stratified && dataset.task() == Task::Classification;
    let mut units = units(dataset, stratified)?;

    // 每个类别 (或不分层时全部) 的单位数不得少于折数.
    let mut per_class: BTreeMap<Option<u32>, (usize, usize)> = BTreeMap::new();
    for u in &units {
        let e = per_class.entry(u.class).or_insert((0, 0));
        e.0 += 1;
        e.1 += u.rows.len();
    }
    for (class, (count, _)) in &per_class {
        if *count < k {
            let what = match class {
                Some(c) => format!("class {c}"),
                None => "groups".to_owned(),
            };
            return Err(SplitError::InsufficientCases {
                what,
                count: *count,
                folds: k,
            });
        }
    }

    // 先按种子洗牌, 再按大小稳定排序: 大的分组先分配, 同样大小的分组保持洗牌后的顺序.
    let mut rng = stage_rng(seed, stage, path);
    units.shuffle(&mut rng);
    units.sort_by_key(|u| Reverse(u.rows.len()));

    let mut fold_size = vec![0usize; k];
    let mut fold_class: Vec<BTreeMap<Option<u32>, usize>> = vec![BTreeMap::new(); k];
    let mut fold_of = vec![0usize; dataset.len()];
    for u in &units {
        let total = per_class[&u.class].1 as f64;
        let best = (0..k)
            .min_by(|&a, &b| {
                let fa = *fold_class[a].get(&u.class).unwrap_or(&0) as f64 / total;
                let fb = *fold_class[b].get(&u.class).unwrap_or(&0) as f64 / total;
                fa.total_cmp(&fb)
                    .then(fold_size[a].cmp(&fold_size[b]))
                    .then(a.cmp(&b))
            })
            .unwrap_or(0);
        fold_size[best] += u.rows.len();
        *fold_class[best].entry(u.class).or_insert(0) += u.rows.len();
        for r in &u.rows {
            fold_of[*r] = best;
        }
        log::trace!("group `{}` -> fold {best}", u.key);
    }
    Ok(fold_of)
}

fn make_split(dataset: &Dataset, name: &str, fold: usize, seed: u64, held_out: Partition, is_held: impl Fn(usize) -> bool) -> Split {
    Split {
        name: name.to_owned(),
        fold,
        seed,
        assignments: dataset
            .ids()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), if is_held(i) { held_out } else { Partition::Train }))
            .collect(),
    }
}

fn predefined(dataset: &Dataset, test_ids: &[String], seed: u64) -> Result<Split, SplitError> {
    let mut test = vec![false; dataset.len()];
    for id in test_ids {
        let i = dataset
            .index_of(id)
            .ok_or_else(|| SplitError::UnknownCase(id.clone()))?;
        test[i] = true;
    }
    let n_test = test.iter().filter(|t| **t).count();
    if n_test == 0 || n_test == dataset.len() {
        return Err(SplitError::InsufficientCases {
            what: "predefined test set".into(),
            count: n_test,
            folds: 2,
        });
    }
    let mut side: BTreeMap<&str, bool> = BTreeMap::new();
    for (i, row) in dataset.rows().enumerate() {
        if *side.entry(row.group).or_insert(test[i]) != test[i] {
            return Err(SplitError::GroupSpansPartitions(row.group.to_owned()));
        }
    }
    Ok(make_split(dataset, "predefined_test", 0, seed, Partition::Test, |i| test[i]))
}

/// 按比例留出, 返回每行是否被留出.
///
/// 每个类别 (回归任务为全体) 内, 按种子洗牌后取前 `round(ratio * 单位数)` 个单位,
/// 至少 1 个且至少留 1 个在训练侧. 只有一个单位的类别全部留在训练侧.
fn holdout(dataset: &Dataset, test_ratio: f64, seed: u64, stage: Stage, path: &[u64]) -> Result<Vec<bool>, SplitError> {
    if !(test_ratio > 0.0 && test_ratio < 1.0) {
        return Err(SplitError::InvalidParameter(format!("test ratio {test_ratio} not in (0, 1)")));
    }
    let stratified = dataset.task() == Task::Classification;
    let mut strata: BTreeMap<Option<u32>, Vec<Unit>> = BTreeMap::new();
    for u in units(dataset, stratified)? {
        strata.entry(u.class).or_default().push(u);
    }

    let mut rng = stage_rng(seed, stage, path);
    let mut held = vec![false; dataset.len()];
    for (class, mut stratum) in strata {
        let n = stratum.len();
        if n < 2 {
            log::warn!("holdout: stratum {class:?} has a single group, kept in train");
            continue;
        }
        stratum.shuffle(&mut rng);
        let n_test = ((test_ratio * n as f64).round() as usize).clamp(1, n - 1);
        for u in &stratum[..n_test] {
            for r in &u.rows {
                held[*r] = true;
            }
            log::trace!("group `{}` -> held out", u.key);
        }
    }

    let n_held = held.iter().filter(|h| **h).count();
    if n_held == 0 || n_held == held.len() {
        return Err(SplitError::InsufficientCases {
            what: "holdout groups".into(),
            count: n_held,
            folds: 2,
        });
    }
    Ok(held)
}

/// 外层划分. k 折策略返回 `n_folds` 个划分, 留出和预定义测试集返回一个划分.
/// 被留出的案例标记为 [`Partition::Test`].
pub fn split(dataset: &Dataset, strategy: &SplitStrategy, seed: u64, n_folds: usize) -> Result<Vec<Split>, SplitError> {
    partition(dataset, strategy, seed, n_folds, Partition::Test, Stage::OuterSplit, &[])
}

/// 内层划分: 在外层第 `outer_fold` 折的训练部分上做 k 折, 留出的案例标记为
/// [`Partition::Validation`]. 留出类外层策略在内层使用分层分组 k 折.
pub fn split_inner(train: &Dataset, outer: &SplitStrategy, seed: u64, n_folds: usize, outer_fold: usize) -> Result<Vec<Split>, SplitError> {
    let inner = match outer {
        SplitStrategy::Holdout { .. } | SplitStrategy::PredefinedTest { .. } => SplitStrategy::StratifiedGroupedKFold,
        s => s.clone(),
    };
    partition(train, &inner, seed, n_folds, Partition::Validation, Stage::InnerSplit, &[outer_fold as u64])
}

fn partition(
    dataset: &Dataset,
    strategy: &SplitStrategy,
    seed: u64,
    n_folds: usize,
    held_out: Partition,
    stage: Stage,
    path: &[u64],
) -> Result<Vec<Split>, SplitError> {
    let name = strategy.name();
    let splits = match strategy {
        SplitStrategy::PredefinedTest { test_ids } => vec![predefined(dataset, test_ids, seed)?],
        SplitStrategy::Holdout { test_ratio } => {
            let held = holdout(dataset, *test_ratio, seed, stage, path)?;
            vec![make_split(dataset, name, 0, seed, held_out, |i| held[i])]
        }
        s => {
            let fold_of = assign_folds(dataset, n_folds, s.stratified(), seed, stage, path)?;
            (0..n_folds)
                .map(|f| make_split(dataset, name, f, seed, held_out, |i| fold_of[i] == f))
                .collect()
        }
    };
    for s in &splits {
        log::debug!(
            "{name} fold {}: {} train / {} held out",
            s.fold,
            s.count(Partition::Train),
            s.count(held_out)
        );
    }
    Ok(splits)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dataset::{Column, ColumnRole};
    use ndarray::{Array1, Array2};

    /// 构造 `n` 个案例的二分类数据集. `group_of(i)` 给出第 i 个案例的分组, `label_of(i)` 给出标签.
    pub(crate) fn toy(n: usize, group_of: impl Fn(usize) -> String, label_of: impl Fn(usize) -> f64) -> Dataset {
        Dataset::new(
            Task::Classification,
            vec!["0".into(), "1".into()],
            vec![Column {
                name: "f".into(),
                role: ColumnRole::Radiomic,
            }],
            (0..n).map(|i| format!("case{i:03}")).collect(),
            (0..n).map(&group_of).collect(),
            Array1::from_iter((0..n).map(&label_of)),
            Array2::from_shape_fn((n, 1), |(i, _)| i as f64),
        )
        .unwrap()
    }

    /// 100 个案例, 50/50, 100 位患者, 5 折分层分组: 每个测试折恰好 20 个案例.
    #[test]
    fn test_stratified_grouped_even_folds() {
        let ds = toy(100, |i| format!("p{i}"), |i| (i % 2) as f64);
        let splits = split(&ds, &SplitStrategy::StratifiedGroupedKFold, 7, 5).unwrap();
        assert_eq!(splits.len(), 5);
        let mut seen = std::collections::BTreeSet::new();
        for s in &splits {
            assert_eq!(s.count(Partition::Test), 20);
            let test = s.indices(&ds, Partition::Test);
            assert_eq!(test.iter().filter(|i| ds.labels()[**i] == 1.0).count(), 10);
            assert!(s.groups_disjoint(&ds));
            seen.extend(s.ids(Partition::Test).into_iter().map(String::from));
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_split_reproducible() {
        let ds = toy(40, |i| format!("p{}", i / 2), |i| ((i / 2) % 2) as f64);
        let a = split(&ds, &SplitStrategy::StratifiedGroupedKFold, 11, 4).unwrap();
        let b = split(&ds, &SplitStrategy::StratifiedGroupedKFold, 11, 4).unwrap();
        assert_eq!(a, b);
        let c = split(&ds, &SplitStrategy::StratifiedGroupedKFold, 12, 4).unwrap();
        assert_ne!(a, c);
    }

    /// 分组不会跨越训练和测试.
    #[test]
    fn test_grouped_kfold_keeps_groups() {
        let ds = toy(30, |i| format!("p{}", i / 3), |i| (i % 2) as f64);
        for s in split(&ds, &SplitStrategy::GroupedKFold, 3, 5).unwrap() {
            assert!(s.groups_disjoint(&ds));
            assert_eq!(s.count(Partition::Test), 6);
        }
    }

    #[test]
    fn test_insufficient_cases() {
        let ds = toy(10, |i| format!("p{i}"), |i| if i < 3 { 1.0 } else { 0.0 });
        let err = split(&ds, &SplitStrategy::StratifiedKFold, 1, 5).unwrap_err();
        assert!(matches!(err, SplitError::InsufficientCases { count: 3, folds: 5, .. }));

        let ds = toy(10, |i| format!("p{}", i / 5), |_| 0.0);
        let err = split(&ds, &SplitStrategy::GroupedKFold, 1, 3).unwrap_err();
        assert!(matches!(err, SplitError::InsufficientCases { count: 2, .. }));
    }

    #[test]
    fn test_inconsistent_group_label() {
        let ds = toy(10, |i| format!("p{}", i / 2), |i| (i % 2) as f64);
        assert!(matches!(
            split(&ds, &SplitStrategy::StratifiedGroupedKFold, 1, 2),
            Err(SplitError::InconsistentGroupLabel(_))
        ));
        assert!(split(&ds, &SplitStrategy::GroupedKFold, 1, 2).is_ok());
    }

    #[test]
    fn test_holdout_and_inner() {
        let ds = toy(50, |i| format!("p{i}"), |i| (i % 2) as f64);
        let outer = split(&ds, &SplitStrategy::Holdout { test_ratio: 0.2 }, 5, 3).unwrap();
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].count(Partition::Test), 10);

        let train = ds.subset(&outer[0].indices(&ds, Partition::Train));
        let inner = split_inner(&train, &SplitStrategy::Holdout { test_ratio: 0.2 }, 5, 4, 0).unwrap();
        assert_eq!(inner.len(), 4);
        for s in &inner {
            assert_eq!(s.count(Partition::Test), 0);
            assert_eq!(s.count(Partition::Validation), 10);
            assert!(s.ids(Partition::Validation).iter().all(|id| outer[0].assignments[*id] == Partition::Train));
        }
        assert!(matches!(
            split(&ds, &SplitStrategy::Holdout { test_ratio: 1.5 }, 5, 3),
            Err(SplitError::InvalidParameter(_))
        ));
    }

    /// 留出比例按每个类别的单位数取整, 而不是换算成折数.
    #[test]
    fn test_holdout_exact_ratio() {
        let ds = toy(100, |i| format!("p{i}"), |i| (i % 2) as f64);
        for (ratio, n_test) in [(0.3, 30), (0.4, 40), (0.25, 26)] {
            let s = &split(&ds, &SplitStrategy::Holdout { test_ratio: ratio }, 9, 5).unwrap()[0];
            assert_eq!(s.count(Partition::Test), n_test, "ratio {ratio}");
            let test = s.indices(&ds, Partition::Test);
            assert_eq!(test.iter().filter(|i| ds.labels()[**i] == 1.0).count(), n_test / 2);
        }
    }

    /// 少数类只有 3 个单位时留出照样成功, 且分组不跨越两侧.
    #[test]
    fn test_holdout_small_class() {
        let ds = toy(40, |i| format!("p{}", i / 2), |i| if i < 6 { 1.0 } else { 0.0 });
        let s = &split(&ds, &SplitStrategy::Holdout { test_ratio: 0.2 }, 3, 5).unwrap()[0];
        assert!(s.groups_disjoint(&ds));
        let test = s.indices(&ds, Partition::Test);
        assert_eq!(test.iter().filter(|i| ds.labels()[**i] == 1.0).count(), 2);
        assert_eq!(test.len(), 2 + 2 * 3);

        let ds = toy(10, |i| format!("p{i}"), |i| if i == 0 { 1.0 } else { 0.0 });
        let s = &split(&ds, &SplitStrategy::Holdout { test_ratio: 0.5 }, 3, 5).unwrap()[0];
        assert_eq!(s.assignments["case000"], Partition::Train);
        assert_eq!(s.count(Partition::Test), 5);
    }

    /// 同样大小的分组按洗牌顺序分配: 不同种子得到不同的折内容, 而不只是折编号不同.
    #[test]
    fn test_seed_changes_fold_members() {
        let ds = toy(40, |i| format!("p{i}"), |i| (i % 2) as f64);
        let members = |seed: u64| {
            let mut folds: Vec<Vec<String>> = split(&ds, &SplitStrategy::StratifiedGroupedKFold, seed, 4)
                .unwrap()
                .iter()
                .map(|s| s.ids(Partition::Test).into_iter().map(String::from).collect())
                .collect();
            folds.sort();
            folds
        };
        assert_eq!(members(21), members(21));
        assert_ne!(members(21), members(22));
    }

    #[test]
    fn test_predefined_test() {
        let ds = toy(10, |i| format!("p{}", i / 2), |i| (i % 2) as f64);
        let s = split(
            &ds,
            &SplitStrategy::PredefinedTest {
                test_ids: vec!["case000".into(), "case001".into()],
            },
            0,
            5,
        )
        .unwrap();
        assert_eq!(s[0].ids(Partition::Test), vec!["case000", "case001"]);

        let err = split(
            &ds,
            &SplitStrategy::PredefinedTest {
                test_ids: vec!["case000".into()],
            },
            0,
            5,
        )
        .unwrap_err();
        assert!(matches!(err, SplitError::GroupSpansPartitions(g) if g == "p0"));
        assert!(matches!(
            split(&ds, &SplitStrategy::PredefinedTest { test_ids: vec!["zzz".into()] }, 0, 5),
            Err(SplitError::UnknownCase(_))
        ));
    }
}
