//! 嵌套交叉验证的完整划分方案, 以及方案文件的读写.
//!
//! 方案在任何训练开始前一次性生成. 内层划分错误因此与外层划分错误一样,
//! 在规划阶段就被发现并终止运行.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{split, split_inner, Partition, Split, SplitError, SplitStrategy};
use crate::dataset::Dataset;

/// 一个外层折及其内层划分.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoldPlan {
    /// 外层划分 (训练 / 测试).
    pub outer: Split,
    /// 外层训练部分上的内层划分 (训练 / 验证).
    pub inner: Vec<Split>,
}

/// 完整划分方案.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitPlan {
    /// 策略名.
    pub split_type: String,
    /// 运行种子.
    pub seed: u64,
    /// 每个外层折.
    pub folds: Vec<FoldPlan>,
}

impl SplitPlan {
    /// 生成外层与内层划分.
    pub fn build(
        dataset: &Dataset,
        strategy: &SplitStrategy,
        seed: u64,
        n_folds: usize,
        inner_folds: usize,
    ) -> Result<Self, SplitError> {
        let outer = split(dataset, strategy, seed, n_folds)?;
        let mut folds = Vec::with_capacity(outer.len());
        for o in outer {
            let train = dataset.subset(&o.indices(dataset, Partition::Train));
            let inner = split_inner(&train, strategy, seed, inner_folds, o.fold)?;
            folds.push(FoldPlan { outer: o, inner });
        }
        Ok(Self {
            split_type: strategy.name().to_owned(),
            seed,
            folds,
        })
    }

    /// 检查每个外层折的测试部分与其内层划分涉及的案例, 分组互不相交.
    pub fn is_leakage_free(&self, dataset: &Dataset) -> bool {
        self.folds.iter().all(|f| {
            let test = f.outer.ids(Partition::Test);
            f.outer.groups_disjoint(dataset)
                && f.inner.iter().all(|s| {
                    s.assignments.keys().all(|id| !test.contains(&id.as_str()))
                })
        })
    }

    /// 写为 JSON 文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SplitError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// 读取 JSON 文件.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SplitError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::tests::toy;

    #[test]
    fn test_plan_nested_and_leakage_free() {
        let ds = toy(60, |i| format!("p{}", i / 2), |i| ((i / 2) % 2) as f64);
        let plan = SplitPlan::build(&ds, &SplitStrategy::StratifiedGroupedKFold, 9, 3, 2).unwrap();
        assert_eq!(plan.folds.len(), 3);
        for f in &plan.folds {
            assert_eq!(f.inner.len(), 2);
            let n_train = f.outer.count(Partition::Train);
            assert_eq!(f.inner[0].assignments.len(), n_train);
        }
        assert!(plan.is_leakage_free(&ds));
    }

    /// 内层折数过多在规划阶段即报错.
    #[test]
    fn test_plan_inner_error_is_fatal() {
        let ds = toy(12, |i| format!("p{i}"), |i| (i % 2) as f64);
        let err = SplitPlan::build(&ds, &SplitStrategy::StratifiedKFold, 1, 3, 5).unwrap_err();
        assert!(matches!(err, SplitError::InsufficientCases { .. }));
    }

    #[test]
    fn test_plan_file_round_trip() {
        let ds = toy(20, |i| format!("p{i}"), |i| (i % 2) as f64);
        let plan = SplitPlan::build(&ds, &SplitStrategy::Holdout { test_ratio: 0.25 }, 4, 5, 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("splits.json");
        plan.save(&p).unwrap();
        assert_eq!(SplitPlan::load(&p).unwrap(), plan);
    }
}
