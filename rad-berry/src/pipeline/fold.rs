//! 一个外层折的完整流程: 特征选择, 超参数搜索, 拟合, 评估, 持久化.
//!
//! 折内的任何错误都只终结该折, 以 [`FoldOutcome::Failed`] 返回.
//! 产物先写入 `fold_{k}.partial`, 全部完成后才重命名为 `fold_{k}`;
//! 失败或取消的折不会留下任何产物.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::persist;
use super::search::{prepare_inner, search, FoldSettings, SearchOutcome};
use super::{RunConfig, RunPaths};
use crate::cancel::CancelToken;
use crate::dataset::Dataset;
use crate::eval::{evaluate, EvaluationResult};
use crate::model::{check_train, fit, FoldState, TrainError, TrainedModel};
use crate::select::{select, EvalRows, SelectError, SelectedFeatureSet, TrainRows};
use crate::split::{FoldPlan, Partition};

/// 折失败时所处的阶段.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldStage {
    /// 特征选择.
    Selection,
    /// 拟合 (含训练部分检查).
    Fit,
    /// 评估.
    Evaluate,
    /// 写出产物.
    Persist,
}

/// 折级错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FoldError {
    /// 训练错误.
    #[error(transparent)]
    Train(#[from] TrainError),

    /// 特征选择错误.
    #[error("fold {fold}: {source}")]
    Select {
        /// 折下标.
        fold: usize,
        /// 原始错误.
        source: SelectError,
    },

    /// 产物写出失败.
    #[error("fold {fold}: cannot write artifacts: {reason}")]
    Persist {
        /// 折下标.
        fold: usize,
        /// 原因.
        reason: String,
    },
}

/// 失败的折.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldFailure {
    /// 折下标.
    pub fold: usize,
    /// 失败阶段.
    pub stage: FoldStage,
    /// 失败时的状态.
    pub failed_in: FoldState,
    /// 错误.
    pub error: FoldError,
}

/// 一个模型在一个外层折上的结果.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFoldResult {
    /// 超参数搜索结果.
    pub search: SearchOutcome,
    /// 在外层训练部分上用最优超参数拟合的模型.
    pub model: TrainedModel,
    /// 外层测试部分上的评估.
    pub evaluation: EvaluationResult,
}

/// 成功的折.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldResult {
    /// 折下标.
    pub fold: usize,
    /// 外层训练部分上选出的特征.
    pub selected: SelectedFeatureSet,
    /// 每个模型的结果, 与配置顺序一致.
    pub models: Vec<ModelFoldResult>,
}

/// 一个外层折的结局.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    /// 已评估并写出产物.
    Completed(FoldResult),
    /// 失败.
    Failed(FoldFailure),
    /// 被取消.
    Cancelled(usize),
}

impl FoldOutcome {
    /// 折下标.
    pub fn fold(&self) -> usize {
        match self {
            Self::Completed(r) => r.fold,
            Self::Failed(f) => f.fold,
            Self::Cancelled(k) => *k,
        }
    }
}

/// 所有折共享的只读上下文.
pub(crate) struct FoldContext<'a> {
    pub config: &'a RunConfig,
    pub dataset: &'a Dataset,
    pub paths: &'a RunPaths,
    pub cancel: &'a CancelToken,
}

struct Failure(FoldStage, FoldError);

fn at<E: Into<FoldError>>(stage: FoldStage) -> impl FnOnce(E) -> Failure {
    move |e| Failure(stage, e.into())
}

/// 运行一个外层折.
pub(crate) fn run_fold(ctx: &FoldContext, plan: &FoldPlan) -> FoldOutcome {
    let fold = plan.outer.fold;
    let partial = ctx.paths.partial_dir(fold);
    let mut state = FoldState::Untrained;
    let outcome = match drive(ctx, plan, &partial, &mut state) {
        Ok(Some(result)) => {
            log::info!("fold {fold}: evaluated {} model(s)", result.models.len());
            return FoldOutcome::Completed(result);
        }
        Ok(None) => {
            log::warn!("fold {fold}: cancelled while {state:?}");
            FoldOutcome::Cancelled(fold)
        }
        Err(Failure(stage, error)) => {
            let failed_in = state;
            // 已评估的折在写出时失败, 状态机上不再转移
            if state.can_advance(FoldState::Failed) {
                let _ = state.advance(FoldState::Failed, fold);
            }
            log::warn!("fold {fold}: failed during {stage:?}: {error}");
            FoldOutcome::Failed(FoldFailure {
                fold,
                stage,
                failed_in,
                error,
            })
        }
    };
    if let Err(e) = persist::discard(&partial) {
        log::warn!("fold {fold}: cannot remove {}: {e}", partial.display());
    }
    outcome
}

/// 依次推进折状态. 取消时返回 `Ok(None)`.
fn drive(
    ctx: &FoldContext,
    plan: &FoldPlan,
    partial: &Path,
    state: &mut FoldState,
) -> Result<Option<FoldResult>, Failure> {
    let fold = plan.outer.fold;
    let cfg = ctx.config;
    let cancelled = || ctx.cancel.is_cancelled();
    if cancelled() {
        return Ok(None);
    }
    state.advance(FoldState::Fitting, fold).map_err(at(FoldStage::Fit))?;

    let train = TrainRows::from_split(ctx.dataset, &plan.outer);
    let test = EvalRows::from_split(ctx.dataset, &plan.outer, Partition::Test);
    check_train(train.dataset(), fold).map_err(at(FoldStage::Fit))?;
    log::debug!("fold {fold}: {} train / {} test rows", train.len(), test.len());

    let settings = FoldSettings::new(cfg, fold);
    let inner = if cfg.hyperparameter_search {
        prepare_inner(&train, &plan.inner, &settings)
    } else {
        Vec::new()
    };
    let selected = select(&train, &cfg.selection_method, cfg.target_feature_count, settings.selection_seed(0))
        .map_err(|source| Failure(FoldStage::Selection, FoldError::Select { fold, source }))?;

    let mut fitted = Vec::with_capacity(cfg.model_specs.len());
    for spec in &cfg.model_specs {
        if cancelled() {
            return Ok(None);
        }
        let outcome = if cfg.hyperparameter_search {
            search(&inner, spec, &settings)
        } else {
            SearchOutcome::fixed(spec)
        };
        let opts = settings.fit_options(vec![fold as u64, 0, spec.kind().code()]);
        let model = fit(&train, &selected, &outcome.best, &opts).map_err(at(FoldStage::Fit))?;
        fitted.push((outcome, model));
    }
    state.advance(FoldState::Fitted, fold).map_err(at(FoldStage::Fit))?;

    if cancelled() {
        return Ok(None);
    }
    let mut models = Vec::with_capacity(fitted.len());
    for (search, model) in fitted {
        let evaluation = evaluate(&model, &test, &cfg.bootstrap, cfg.seed).map_err(at(FoldStage::Evaluate))?;
        models.push(ModelFoldResult {
            search,
            model,
            evaluation,
        });
    }
    state.advance(FoldState::Evaluated, fold).map_err(at(FoldStage::Evaluate))?;

    let result = FoldResult { fold, selected, models };
    let persist_err = |e: &dyn std::fmt::Display| {
        Failure(
            FoldStage::Persist,
            FoldError::Persist {
                fold,
                reason: e.to_string(),
            },
        )
    };
    persist::write_fold(partial, &result, cfg.save_models).map_err(|e| persist_err(&e))?;
    if cancelled() {
        return Ok(None);
    }
    persist::commit(partial, &ctx.paths.fold_dir(fold)).map_err(|e| persist_err(&e))?;
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::linear::LinearParams;
    use crate::model::ModelSpec;
    use crate::split::tests::toy;
    use crate::split::{SplitPlan, SplitStrategy};

    fn config() -> RunConfig {
        let mut cfg = RunConfig::new(
            serde_json::from_str(r#"{"id_column": "ID", "label_column": "y"}"#).unwrap(),
            vec![ModelSpec::Linear(LinearParams::default())],
        );
        cfg.hyperparameter_search = false;
        cfg.bootstrap.n_resamples = 20;
        cfg
    }

    /// 成功的折只留下最终目录.
    #[test]
    fn test_fold_completed() {
        let ds = toy(20, |i| format!("p{i}"), |i| (i % 2) as f64);
        let plan = SplitPlan::build(&ds, &SplitStrategy::StratifiedKFold, 1, 2, 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), dir.path());
        let cfg = config();
        let cancel = CancelToken::new();
        let ctx = FoldContext {
            config: &cfg,
            dataset: &ds,
            paths: &paths,
            cancel: &cancel,
        };
        let FoldOutcome::Completed(r) = run_fold(&ctx, &plan.folds[1]) else {
            panic!("fold did not complete");
        };
        assert_eq!(r.fold, 1);
        assert_eq!(r.models[0].evaluation.n_cases, 10);
        assert!(paths.fold_dir(1).join("model_linear.bin.gz").is_file());
        assert!(!paths.partial_dir(1).exists());
    }

    /// 训练部分只有一类时该折失败于拟合阶段, 不留下产物.
    #[test]
    fn test_fold_degenerate() {
        // 阳性案例全部在分组 "pos" 中
        let ds = toy(12, |i| if i < 4 { "pos".into() } else { format!("n{i}") }, |i| if i < 4 { 1.0 } else { 0.0 });
        let plan = SplitPlan::build(&ds, &SplitStrategy::GroupedKFold, 3, 3, 2).unwrap();
        let k = plan
            .folds
            .iter()
            .position(|f| f.outer.assignments["case000"] == Partition::Test)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), dir.path());
        let cfg = config();
        let cancel = CancelToken::new();
        let ctx = FoldContext {
            config: &cfg,
            dataset: &ds,
            paths: &paths,
            cancel: &cancel,
        };
        let FoldOutcome::Failed(f) = run_fold(&ctx, &plan.folds[k]) else {
            panic!("fold should fail");
        };
        assert_eq!(f.stage, FoldStage::Fit);
        assert_eq!(f.failed_in, FoldState::Fitting);
        assert_eq!(f.error, FoldError::Train(TrainError::DegenerateLabel { fold: k, classes: 1 }));
        assert!(!paths.fold_dir(k).exists());
        assert!(!paths.partial_dir(k).exists());
    }

    #[test]
    fn test_fold_cancelled() {
        let ds = toy(20, |i| format!("p{i}"), |i| (i % 2) as f64);
        let plan = SplitPlan::build(&ds, &SplitStrategy::StratifiedKFold, 1, 2, 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), dir.path());
        let cfg = config();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = FoldContext {
            config: &cfg,
            dataset: &ds,
            paths: &paths,
            cancel: &cancel,
        };
        assert_eq!(run_fold(&ctx, &plan.folds[0]), FoldOutcome::Cancelled(0));
        assert!(!paths.fold_dir(0).exists());
    }
}
