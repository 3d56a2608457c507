//! 内层交叉验证上的超参数搜索.
//!
//! 每个内层划分只在其训练部分上做一次特征选择, 由该折所有模型的全部候选共用.
//! 候选的得分是各内层验证部分上主指标的均值 (忽略无定义的值);
//! 拟合失败的候选在该内层折上记为无定义.

use serde::{Deserialize, Serialize};

use super::RunConfig;
use crate::eval::{compute, primary_metric};
use crate::model::{fit, FitOptions, ModelSpec, Scaling};
use crate::rng::{derive_seed, Stage};
use crate::select::{select, EvalRows, SelectedFeatureSet, SelectionMethod, TrainRows};
use crate::split::{Partition, Split};

/// 一个候选超参数及其内层得分.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// 候选规格.
    pub spec: ModelSpec,
    /// 内层验证主指标的均值. 全部无定义时为 `None`.
    pub score: Option<f64>,
}

/// 一个模型在一个外层折上的搜索结果.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// 选中的规格.
    pub best: ModelSpec,
    /// 选中规格的内层得分.
    pub score: Option<f64>,
    /// 全部候选, 按网格顺序.
    pub candidates: Vec<Candidate>,
}

impl SearchOutcome {
    /// 不搜索, 直接使用 `spec`.
    pub fn fixed(spec: &ModelSpec) -> Self {
        Self {
            best: spec.clone(),
            score: None,
            candidates: Vec::new(),
        }
    }
}

/// 一个外层折内搜索与拟合共用的设置.
#[derive(Clone, Debug)]
pub(crate) struct FoldSettings<'a> {
    pub method: &'a SelectionMethod,
    pub target: usize,
    pub scaling: Scaling,
    pub oversample: bool,
    pub seed: u64,
    pub fold: usize,
}

impl<'a> FoldSettings<'a> {
    pub fn new(config: &'a RunConfig, fold: usize) -> Self {
        Self {
            method: &config.selection_method,
            target: config.target_feature_count,
            scaling: config.scaling,
            oversample: config.oversample,
            seed: config.seed,
            fold,
        }
    }

    /// 特征选择种子. `inner` 为 0 表示外层训练部分.
    pub fn selection_seed(&self, inner: usize) -> u64 {
        derive_seed(self.seed, Stage::Selection, &[self.fold as u64, inner as u64])
    }

    pub fn fit_options(&self, path: Vec<u64>) -> FitOptions {
        FitOptions {
            scaling: self.scaling,
            oversample: self.oversample,
            seed: self.seed,
            fold: self.fold,
            path,
        }
    }
}

/// 一个内层折: 训练行, 验证行, 以及在训练行上选出的特征.
pub(crate) struct InnerFold {
    train: TrainRows,
    valid: EvalRows,
    selected: Option<SelectedFeatureSet>,
}

/// 取出外层训练部分上的各内层折, 并在每个内层训练部分上选择特征.
pub(crate) fn prepare_inner(outer_train: &TrainRows, inner: &[Split], settings: &FoldSettings) -> Vec<InnerFold> {
    let data = outer_train.dataset();
    inner
        .iter()
        .enumerate()
        .map(|(j, split)| {
            let train = TrainRows::from_split(data, split);
            let valid = EvalRows::from_split(data, split, Partition::Validation);
            let selected = match select(&train, settings.method, settings.target, settings.selection_seed(j + 1)) {
                Ok(s) => Some(s),
                Err(e) => {
                    log::debug!("fold {} inner {j}: selection failed: {e}", settings.fold);
                    None
                }
            };
            InnerFold { train, valid, selected }
        })
        .collect()
}

/// 在 `spec` 的默认网格上搜索. 得分相同时取网格中靠前者;
/// 全部候选都无定义时退回 `spec` 本身.
pub(crate) fn search(inner: &[InnerFold], spec: &ModelSpec, settings: &FoldSettings) -> SearchOutcome {
    let candidates: Vec<Candidate> = spec
        .default_grid()
        .into_iter()
        .enumerate()
        .map(|(g, cand)| {
            let score = score_candidate(inner, &cand, g, settings);
            Candidate { spec: cand, score }
        })
        .collect();

    let mut best: Option<&Candidate> = None;
    for c in &candidates {
        let Some(s) = c.score else { continue };
        if best.and_then(|b| b.score).map_or(true, |b| s > b) {
            best = Some(c);
        }
    }
    let (best, score) = match best {
        Some(c) => (c.spec.clone(), c.score),
        None => {
            log::warn!(
                "fold {}: no {} candidate could be scored, using configured parameters",
                settings.fold,
                spec.name()
            );
            (spec.clone(), None)
        }
    };
    log::debug!("fold {}: best {} {:?} (score {score:?})", settings.fold, spec.name(), best);
    SearchOutcome {
        best,
        score,
        candidates,
    }
}

fn score_candidate(inner: &[InnerFold], spec: &ModelSpec, g: usize, settings: &FoldSettings) -> Option<f64> {
    let mut scores = Vec::with_capacity(inner.len());
    for (j, f) in inner.iter().enumerate() {
        let Some(selected) = &f.selected else { continue };
        if f.valid.is_empty() {
            continue;
        }
        let path = vec![settings.fold as u64, j as u64 + 1, spec.kind().code(), g as u64];
        let model = match fit(&f.train, selected, spec, &settings.fit_options(path)) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("inner {j}: {e}");
                continue;
            }
        };
        let Ok(score) = model.predict_score(f.valid.dataset()) else {
            continue;
        };
        let task = f.valid.task();
        let v = compute(task, f.valid.labels().view(), score.view())[primary_metric(task)];
        if v.is_finite() {
            scores.push(v);
        }
    }
    (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::model::linear::LinearParams;
    use crate::split::tests::toy;
    use crate::split::{split_inner, SplitStrategy};

    fn inner_folds(ds: &Dataset, settings: &FoldSettings) -> Vec<InnerFold> {
        let splits = split_inner(ds, &SplitStrategy::StratifiedKFold, 5, 3, 0).unwrap();
        prepare_inner(&TrainRows::whole(ds.clone()), &splits, settings)
    }

    fn settings(config: &RunConfig) -> FoldSettings<'_> {
        FoldSettings::new(config, 0)
    }

    fn config() -> RunConfig {
        RunConfig::new(
            serde_json::from_str(r#"{"id_column": "ID", "label_column": "y"}"#).unwrap(),
            vec![ModelSpec::Linear(LinearParams::default())],
        )
    }

    /// 可分数据上选出的候选得分有定义, 且结果可复现.
    #[test]
    fn test_search_linear() {
        let ds = toy(30, |i| format!("p{i}"), |i| if i >= 15 { 1.0 } else { 0.0 });
        let cfg = config();
        let s = settings(&cfg);
        let inner = inner_folds(&ds, &s);
        assert_eq!(inner.len(), 3);
        assert!(inner.iter().all(|f| f.selected.is_some()));

        let out = search(&inner, &cfg.model_specs[0], &s);
        assert_eq!(out.candidates.len(), 7);
        let best = out.score.unwrap();
        assert!(out.candidates.iter().all(|c| c.score.map_or(true, |v| v <= best)));
        // 平局取网格靠前者
        let first = out.candidates.iter().position(|c| c.score == Some(best)).unwrap();
        assert_eq!(out.best, out.candidates[first].spec);
        assert_eq!(search(&inner, &cfg.model_specs[0], &s), out);
    }

    /// 内层选择全部失败时没有候选能打分, 退回配置的规格.
    #[test]
    fn test_search_fallback() {
        let ds = toy(12, |i| format!("p{i}"), |i| if i % 2 == 0 { 1.0 } else { 0.0 });
        let cfg = config();
        let s = settings(&cfg);
        let inner: Vec<InnerFold> = inner_folds(&ds, &s)
            .into_iter()
            .map(|f| InnerFold { selected: None, ..f })
            .collect();
        let out = search(&inner, &cfg.model_specs[0], &s);
        assert_eq!(out.best, cfg.model_specs[0]);
        assert_eq!(out.score, None);
        assert!(out.candidates.iter().all(|c| c.score.is_none()));
    }
}
