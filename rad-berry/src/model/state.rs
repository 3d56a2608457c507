//! 每个折的训练状态机.

use serde::{Deserialize, Serialize};

use super::TrainError;

/// 折状态. 合法转移:
///
/// ```text
/// Untrained -> Fitting -> Fitted -> Evaluated
///                 |          |
///                 +----------+--> Failed
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldState {
    /// 尚未开始.
    #[default]
    Untrained,
    /// 特征选择, 超参数搜索与拟合中.
    Fitting,
    /// 已拟合.
    Fitted,
    /// 已评估. 终态.
    Evaluated,
    /// 失败. 终态.
    Failed,
}

impl FoldState {
    /// 能否从当前状态转移到 `to`?
    pub fn can_advance(self, to: FoldState) -> bool {
        use FoldState::*;
        matches!(
            (self, to),
            (Untrained, Fitting) | (Fitting, Fitted) | (Fitted, Evaluated) | (Fitting, Failed) | (Fitted, Failed)
        )
    }

    /// 转移到 `to`. 非法转移返回错误且状态不变.
    pub fn advance(&mut self, to: FoldState, fold: usize) -> Result<(), TrainError> {
        if !self.can_advance(to) {
            return Err(TrainError::InvalidTransition { fold, from: *self, to });
        }
        log::debug!("fold {fold}: {:?} -> {to:?}", *self);
        *self = to;
        Ok(())
    }

    /// 是否为终态?
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, FoldState::Evaluated | FoldState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut s = FoldState::default();
        for to in [FoldState::Fitting, FoldState::Fitted, FoldState::Evaluated] {
            s.advance(to, 0).unwrap();
        }
        assert!(s.is_terminal());
    }

    /// 只有拟合中和已拟合可以失败; 终态不能再转移.
    #[test]
    fn test_failed_transitions() {
        assert!(!FoldState::Untrained.can_advance(FoldState::Failed));
        assert!(FoldState::Fitting.can_advance(FoldState::Failed));
        assert!(FoldState::Fitted.can_advance(FoldState::Failed));
        assert!(!FoldState::Evaluated.can_advance(FoldState::Failed));

        let mut s = FoldState::Untrained;
        let err = s.advance(FoldState::Fitted, 3).unwrap_err();
        assert!(matches!(err, TrainError::InvalidTransition { fold: 3, .. }));
        assert_eq!(s, FoldState::Untrained);
    }
}
