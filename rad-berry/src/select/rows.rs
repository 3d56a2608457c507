//! 训练行与评估行.
//!
//! 特征选择和模型拟合只接受 [`TrainRows`], 评估只接受 [`EvalRows`].
//! 两者都只能从一次划分中取出, 因此测试行不可能混入训练.

use std::ops::Deref;

use crate::dataset::Dataset;
use crate::split::{Partition, Split};

/// 一次划分的训练部分.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainRows(Dataset);

impl TrainRows {
    /// 取 `split` 中角色为训练的行.
    pub fn from_split(dataset: &Dataset, split: &Split) -> Self {
        Self(dataset.subset(&split.indices(dataset, Partition::Train)))
    }

    /// 将整个数据集作为训练行 (不做评估的场合, 如最终模型).
    pub fn whole(dataset: Dataset) -> Self {
        Self(dataset)
    }

    /// 底层数据集.
    #[inline]
    pub fn dataset(&self) -> &Dataset {
        &self.0
    }
}

impl Deref for TrainRows {
    type Target = Dataset;

    fn deref(&self) -> &Dataset {
        &self.0
    }
}

/// 一次划分的评估部分 (测试或验证).
#[derive(Clone, Debug, PartialEq)]
pub struct EvalRows(Dataset);

impl EvalRows {
    /// 取 `split` 中角色为 `part` 的行. `part` 为训练时返回空集.
    pub fn from_split(dataset: &Dataset, split: &Split, part: Partition) -> Self {
        let rows = match part {
            Partition::Train => Vec::new(),
            _ => split.indices(dataset, part),
        };
        Self(dataset.subset(&rows))
    }

    /// 底层数据集.
    #[inline]
    pub fn dataset(&self) -> &Dataset {
        &self.0
    }
}

impl Deref for EvalRows {
    type Target = Dataset;

    fn deref(&self) -> &Dataset {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::tests::toy;
    use crate::split::{split, SplitStrategy};

    /// 训练行与测试行的案例和分组互不相交.
    #[test]
    fn test_rows_disjoint() {
        let ds = toy(30, |i| format!("p{}", i / 3), |i| ((i / 3) % 2) as f64);
        for s in split(&ds, &SplitStrategy::StratifiedGroupedKFold, 3, 5).unwrap() {
            let train = TrainRows::from_split(&ds, &s);
            let test = EvalRows::from_split(&ds, &s, Partition::Test);
            assert_eq!(train.len() + test.len(), ds.len());
            assert!(train.ids().iter().all(|id| test.index_of(id).is_none()));
            assert!(train.groups().iter().all(|g| !test.groups().contains(g)));
        }
        let s = split(&ds, &SplitStrategy::StratifiedKFold, 3, 5).unwrap().remove(0);
        assert!(EvalRows::from_split(&ds, &s, Partition::Train).is_empty());
    }
}
