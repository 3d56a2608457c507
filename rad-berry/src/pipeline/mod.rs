//! 嵌套交叉验证流水线.
//!
//! 外层划分给出测试折; 每个外层训练部分内, 内层划分用于特征选择后的超参数搜索.
//! 所有划分在训练开始前一次性规划好 (见 [`SplitPlan`]), 划分错误因此是致命的;
//! 而折内错误只终结该折, 其余折照常汇总.
//!
//! # 示例
//!
//! ```no_run
//! use rad_berry::pipeline::{Orchestrator, RunConfig, RunPaths};
//!
//! let config = RunConfig::load("run.json").unwrap();
//! let report = Orchestrator::new(config, RunPaths::new("input", "results"))
//!     .unwrap()
//!     .run()
//!     .unwrap();
//! println!("{:?}", report.completed_folds());
//! ```

use std::fs;
use std::io;

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::dataset::writer::{write_dataset_csv, write_dataset_npz, write_vectors_csv};
use crate::dataset::{CaseManifest, ClinicalTable, Dataset, DatasetBuilder, DatasetError, TableSchema};
use crate::extract::{extract_batch, extract_loaded, ExtractionError, ExtractionReport, Extractor, LoadedCase};
use crate::model::TrainError;
use crate::split::{FoldPlan, SplitError, SplitPlan, SplitStrategy};

mod config;
mod fold;
mod persist;
mod report;
mod search;

pub use config::{ConfigError, RunConfig, RunPaths, TestSetColumn};
pub use fold::{FoldError, FoldFailure, FoldOutcome, FoldResult, FoldStage, ModelFoldResult};
pub use report::{FoldStatus, ModelFoldReport, ModelReport, RunReport};
pub use search::{Candidate, SearchOutcome};

use fold::{run_fold, FoldContext};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 运行级错误. 出现时整个运行终止.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 配置错误.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 提取配置错误.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// 数据集构建错误.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// 划分错误.
    #[error(transparent)]
    Split(#[from] SplitError),

    /// 写预测表时模型无法预测.
    #[error(transparent)]
    Train(#[from] TrainError),

    /// 结果写出失败.
    #[error("cannot write results: {0}")]
    Io(#[from] io::Error),

    /// 运行被取消. 已完成的折保留其产物.
    #[error("run cancelled, {} fold(s) completed", completed.len())]
    Cancelled {
        /// 已完成的折.
        completed: Vec<usize>,
    },
}

/// 流水线编排器.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: RunConfig,
    paths: RunPaths,
    cancel: CancelToken,
}

impl Orchestrator {
    /// 校验配置并构造编排器.
    pub fn new(config: RunConfig, paths: RunPaths) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            paths,
            cancel: CancelToken::new(),
        })
    }

    /// 使用外部的取消令牌.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 取消令牌. 在其它线程调用 [`CancelToken::cancel`] 即可中止运行.
    #[inline]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// 运行配置.
    #[inline]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// 目录.
    #[inline]
    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// 完整运行: 读取临床表格, 提取 (或从表格读取) 特征, 构建数据集, 嵌套交叉验证.
    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let table_path = self.paths.input_dir.join(&self.config.clinical_table);
        let mut table = ClinicalTable::read_csv(&table_path)?;
        log::info!("loaded {} row(s) from {}", table.len(), table_path.display());

        let mut schema = self.config.schema.clone();
        let (case_ids, extraction): (Vec<String>, ExtractionReport) = match &self.config.manifest {
            Some(columns) => {
                let mut columns = columns.clone();
                if columns.root_dir.is_none() {
                    columns.root_dir = Some(self.paths.input_dir.clone());
                }
                let manifest = CaseManifest::from_table(&mut table, &columns)?;
                if manifest.id_column() != schema.id_column {
                    log::info!("using manifest id column `{}`", manifest.id_column());
                    schema.id_column = manifest.id_column().to_owned();
                }
                let extractor = Extractor::new(self.config.extraction.clone())?;
                let report = extract_batch(&extractor, manifest.records(), &self.cancel);
                (manifest.case_ids().map(String::from).collect(), report)
            }
            None => {
                let vectors = table.feature_vectors(&schema.id_column, schema.feature_columns.as_deref())?;
                let ids: Vec<String> = table
                    .column(&schema.id_column)
                    .map(|c| c.map(|s| s.trim().to_owned()).collect())
                    .unwrap_or_default();
                let report = ExtractionReport {
                    vectors,
                    ..Default::default()
                };
                (ids, report)
            }
        };
        let extracted = self.config.manifest.is_some();
        self.run_extracted(schema, &case_ids, extraction, extracted, &table)
    }

    /// 对已加载的影像运行. `table` 提供标签与临床变量.
    pub fn run_loaded(&self, cases: &[LoadedCase], table: &ClinicalTable) -> Result<RunReport, PipelineError> {
        let extractor = Extractor::new(self.config.extraction.clone())?;
        let report = extract_loaded(&extractor, cases, &self.cancel);
        let ids: Vec<String> = cases.iter().map(|c| c.case_id.clone()).collect();
        self.run_extracted(self.config.schema.clone(), &ids, report, true, table)
    }

    fn run_extracted(
        &self,
        schema: TableSchema,
        case_ids: &[String],
        extraction: ExtractionReport,
        extracted: bool,
        table: &ClinicalTable,
    ) -> Result<RunReport, PipelineError> {
        if extraction.cancelled {
            log::warn!("run cancelled during feature extraction");
            return Err(PipelineError::Cancelled { completed: Vec::new() });
        }
        fs::create_dir_all(&self.paths.results_dir)?;
        if extracted && !extraction.vectors.is_empty() {
            write_vectors_csv(&extraction.vectors, self.paths.result("extracted_features.csv"))?;
        }

        let builder = DatasetBuilder::new(schema, table)?;
        let dataset = builder.build(
            case_ids.iter().map(String::as_str),
            &extraction.vectors,
            &extraction.failures,
            table,
        )?;
        let strategy = self.resolve_strategy(Some(table), &builder.schema().id_column)?;
        self.run_planned(&dataset, &strategy)
    }

    /// 对已构建的数据集运行嵌套交叉验证.
    pub fn run_dataset(&self, dataset: &Dataset) -> Result<RunReport, PipelineError> {
        let strategy = self.resolve_strategy(None, "")?;
        fs::create_dir_all(&self.paths.results_dir)?;
        self.run_planned(dataset, &strategy)
    }

    /// 由表格列指定的测试集优先于配置的策略.
    fn resolve_strategy(&self, table: Option<&ClinicalTable>, id_column: &str) -> Result<SplitStrategy, PipelineError> {
        let Some(t) = &self.config.test_set else {
            return Ok(self.config.split_strategy.clone());
        };
        let Some(table) = table else {
            return Err(ConfigError::Invalid {
                field: "test_set",
                reason: "a test set column needs the clinical table".into(),
            }
            .into());
        };
        let test_ids = table.ids_where(id_column, &t.column, &t.value)?;
        log::info!("{} test case(s) where `{}` = `{}`", test_ids.len(), t.column, t.value);
        Ok(SplitStrategy::PredefinedTest { test_ids })
    }

    fn run_planned(&self, dataset: &Dataset, strategy: &SplitStrategy) -> Result<RunReport, PipelineError> {
        let cfg = &self.config;
        cfg.save(self.paths.result("config.json"))?;
        write_dataset_csv(dataset, self.paths.result("features.csv"))?;
        write_dataset_npz(dataset, self.paths.result("features.npz"))?;

        let plan = SplitPlan::build(dataset, strategy, cfg.seed, cfg.n_folds, cfg.inner_folds)?;
        plan.save(self.paths.result("splits.json"))?;
        log::info!(
            "{} case(s), {} feature(s), {} outer fold(s) ({})",
            dataset.len(),
            dataset.columns().len(),
            plan.folds.len(),
            plan.split_type
        );
        for f in &plan.folds {
            persist::discard(&self.paths.partial_dir(f.outer.fold))?;
        }

        let outcomes = self.run_folds(dataset, &plan);
        let completed: Vec<&FoldResult> = outcomes
            .iter()
            .filter_map(|o| match o {
                FoldOutcome::Completed(r) => Some(r),
                _ => None,
            })
            .collect();
        if self.cancel.is_cancelled() {
            let completed: Vec<usize> = completed.iter().map(|r| r.fold).collect();
            log::warn!("run cancelled after fold(s) {completed:?}");
            return Err(PipelineError::Cancelled { completed });
        }

        persist::write_optimal_params(&self.paths.result("optimal_params"), &completed)?;
        persist::write_predictions(&self.paths.result("predictions.csv"), dataset, &plan, &completed)?;
        let report = RunReport::new(dataset, &plan.split_type, cfg.seed, &outcomes, &cfg.bootstrap);
        report.save(self.paths.result("report.json"))?;

        let failed = report.failed_folds();
        if failed.is_empty() {
            log::info!("all {} fold(s) completed", outcomes.len());
        } else {
            log::warn!("{} of {} fold(s) failed", failed.len(), outcomes.len());
        }
        Ok(report)
    }

    /// 运行全部外层折. 开启 `rayon` 且配置允许时并行; 结果按折下标排列.
    fn run_folds(&self, dataset: &Dataset, plan: &SplitPlan) -> Vec<FoldOutcome> {
        let ctx = FoldContext {
            config: &self.config,
            dataset,
            paths: &self.paths,
            cancel: &self.cancel,
        };
        let run = |f: &FoldPlan| run_fold(&ctx, f);

        #[cfg(feature = "rayon")]
        let outcomes = if self.config.parallel_folds {
            plan.folds.par_iter().map(run).collect()
        } else {
            plan.folds.iter().map(run).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let outcomes = plan.folds.iter().map(run).collect();
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::linear::LinearParams;
    use crate::model::ModelSpec;
    use crate::split::tests::toy;

    fn config() -> RunConfig {
        let mut cfg = RunConfig::new(
            serde_json::from_str(r#"{"id_column": "ID", "label_column": "y"}"#).unwrap(),
            vec![ModelSpec::Linear(LinearParams::default())],
        );
        cfg.split_strategy = SplitStrategy::StratifiedKFold;
        cfg.n_folds = 3;
        cfg.inner_folds = 2;
        cfg.bootstrap.n_resamples = 20;
        cfg
    }

    #[test]
    fn test_run_dataset_artifacts() {
        let ds = toy(30, |i| format!("p{i}"), |i| if i >= 15 { 1.0 } else { 0.0 });
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), dir.path().join("results"));
        let report = Orchestrator::new(config(), paths.clone()).unwrap().run_dataset(&ds).unwrap();

        assert_eq!(report.completed_folds(), vec![0, 1, 2]);
        assert!(!report.is_partial());
        assert_eq!(report.models["linear"].aggregate.folds.len(), 3);
        for name in ["config.json", "features.csv", "features.npz", "splits.json", "predictions.csv", "report.json"] {
            assert!(paths.result(name).is_file(), "{name}");
        }
        assert!(paths.result("optimal_params").join("linear.json").is_file());
        let back = RunReport::load(paths.result("report.json")).unwrap();
        assert_eq!(back.completed_folds(), report.completed_folds());
        assert_eq!(back.models["linear"].folds.len(), 3);

        // 每个案例作为测试行恰好出现一次
        let csv = fs::read_to_string(paths.result("predictions.csv")).unwrap();
        let test_rows = csv.lines().skip(1).filter(|l| l.split(',').nth(3) == Some("1")).count();
        assert_eq!(test_rows, 30);
    }

    #[test]
    fn test_cancelled_before_start() {
        let ds = toy(30, |i| format!("p{i}"), |i| if i >= 15 { 1.0 } else { 0.0 });
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), dir.path());
        let orch = Orchestrator::new(config(), paths.clone()).unwrap();
        orch.cancel_token().cancel();
        let err = orch.run_dataset(&ds).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { ref completed } if completed.is_empty()));
        for k in 0..3 {
            assert!(!paths.fold_dir(k).exists());
            assert!(!paths.partial_dir(k).exists());
        }
        assert!(!paths.result("report.json").exists());
    }

    #[test]
    fn test_test_set_needs_table() {
        let mut cfg = config();
        cfg.test_set = Some(TestSetColumn {
            column: "cohort".into(),
            value: "external".into(),
        });
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(cfg, RunPaths::new(dir.path(), dir.path())).unwrap();
        let ds = toy(10, |i| format!("p{i}"), |i| (i % 2) as f64);
        assert!(matches!(
            orch.run_dataset(&ds),
            Err(PipelineError::Config(ConfigError::Invalid { field: "test_set", .. }))
        ));
    }
}
