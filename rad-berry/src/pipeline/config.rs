//! 运行配置.
//!
//! 配置以 JSON 文件给出, 运行开始时校验一次, 随后原样写入结果目录,
//! 与运行种子一起足以复现整个运行.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{DEFAULT_INNER_FOLDS, DEFAULT_OUTER_FOLDS, DEFAULT_SEED};
use crate::dataset::{ManifestColumns, TableSchema};
use crate::eval::BootstrapConfig;
use crate::extract::ExtractionConfig;
use crate::model::{ModelSpec, Scaling};
use crate::select::SelectionMethod;
use crate::split::SplitStrategy;

/// 配置错误. 对整个运行是致命的.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 某个字段取值非法.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// 字段名.
        field: &'static str,
        /// 原因.
        reason: String,
    },

    /// 配置文件读写失败.
    #[error("config file: {0}")]
    Io(#[from] std::io::Error),

    /// 配置文件格式错误.
    #[error("config file: {0}")]
    Json(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// 用临床表格的某一列指定测试集: 该列等于 `value` 的案例作为测试集.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestSetColumn {
    /// 列名.
    pub column: String,
    /// 取值.
    pub value: String,
}

fn default_table() -> PathBuf {
    PathBuf::from("clinical.csv")
}

fn default_outer() -> usize {
    DEFAULT_OUTER_FOLDS as usize
}

fn default_inner() -> usize {
    DEFAULT_INNER_FOLDS as usize
}

fn default_target() -> usize {
    10
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn yes() -> bool {
    true
}

/// 一次运行的完整配置.
///
/// ```json
/// {
///   "schema": {"id_column": "ID", "label_column": "Tumor", "group_column": "Patient"},
///   "manifest": {"image_column": "Image", "mask_column": "Mask"},
///   "split_strategy": {"type": "stratified_grouped_k_fold"},
///   "selection_method": {"type": "anova"},
///   "target_feature_count": 10,
///   "model_specs": [{"type": "linear"}, {"type": "forest", "n_trees": 200}],
///   "seed": 123
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// 临床表格文件, 相对于输入目录.
    #[serde(default = "default_table")]
    pub clinical_table: PathBuf,

    /// 表结构.
    pub schema: TableSchema,

    /// 影像 / 掩膜路径列. 给出时先从影像提取特征;
    /// 否则特征直接取自临床表格中的特征列.
    #[serde(default)]
    pub manifest: Option<ManifestColumns>,

    /// 特征提取配置.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// 外层划分策略.
    #[serde(default)]
    pub split_strategy: SplitStrategy,

    /// 外层折数.
    #[serde(default = "default_outer")]
    pub n_folds: usize,

    /// 内层折数.
    #[serde(default = "default_inner")]
    pub inner_folds: usize,

    /// 由表格列指定的测试集. 给出时覆盖 `split_strategy`.
    #[serde(default)]
    pub test_set: Option<TestSetColumn>,

    /// 特征选择方法.
    #[serde(default)]
    pub selection_method: SelectionMethod,

    /// 选出的特征数.
    #[serde(default = "default_target")]
    pub target_feature_count: usize,

    /// 候选模型. 每种类别至多一个.
    pub model_specs: Vec<ModelSpec>,

    /// 是否用内层交叉验证在默认网格上搜索超参数.
    /// 关闭时直接使用 `model_specs` 中的取值.
    #[serde(default = "yes")]
    pub hyperparameter_search: bool,

    /// 特征缩放.
    #[serde(default)]
    pub scaling: Scaling,

    /// 是否对训练部分的少数类过采样.
    #[serde(default)]
    pub oversample: bool,

    /// 置信区间设置.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// 运行种子.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// 外层折是否并行 (需要 `rayon` feature).
    #[serde(default = "yes")]
    pub parallel_folds: bool,

    /// 是否保存每个折的模型文件.
    #[serde(default = "yes")]
    pub save_models: bool,
}

impl RunConfig {
    /// 以默认值构造只含必填项的配置.
    pub fn new(schema: TableSchema, model_specs: Vec<ModelSpec>) -> Self {
        Self {
            clinical_table: default_table(),
            schema,
            manifest: None,
            extraction: ExtractionConfig::default(),
            split_strategy: SplitStrategy::default(),
            n_folds: default_outer(),
            inner_folds: default_inner(),
            test_set: None,
            selection_method: SelectionMethod::default(),
            target_feature_count: default_target(),
            model_specs,
            hyperparameter_search: true,
            scaling: Scaling::default(),
            oversample: false,
            bootstrap: BootstrapConfig::default(),
            seed: DEFAULT_SEED,
            parallel_folds: true,
            save_models: true,
        }
    }

    /// 检查取值范围.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_folds < 2 {
            return Err(invalid("n_folds", format!("need at least 2, got {}", self.n_folds)));
        }
        if self.inner_folds < 2 {
            return Err(invalid("inner_folds", format!("need at least 2, got {}", self.inner_folds)));
        }
        if let SplitStrategy::Holdout { test_ratio } = self.split_strategy {
            if !(test_ratio > 0.0 && test_ratio < 1.0) {
                return Err(invalid("split_strategy", format!("test_ratio {test_ratio} not in (0, 1)")));
            }
        }
        if self.target_feature_count == 0 {
            return Err(invalid("target_feature_count", "must be at least 1"));
        }
        self.selection_method
            .validate()
            .map_err(|e| invalid("selection_method", e.to_string()))?;

        if self.model_specs.is_empty() {
            return Err(invalid("model_specs", "no model configured"));
        }
        let mut kinds = HashSet::new();
        for spec in &self.model_specs {
            spec.validate().map_err(|e| invalid("model_specs", e.to_string()))?;
            if !kinds.insert(spec.kind()) {
                return Err(invalid("model_specs", format!("`{}` configured twice", spec.name())));
            }
        }

        let c = self.bootstrap.confidence;
        if !(c > 0.0 && c < 1.0) {
            return Err(invalid("bootstrap", format!("confidence {c} not in (0, 1)")));
        }
        self.extraction
            .validate()
            .map_err(|e| invalid("extraction", e.to_string()))?;
        Ok(())
    }

    /// 读取 JSON 配置文件并校验.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// 写为 JSON 文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// 输入与结果目录.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunPaths {
    /// 输入目录: 临床表格, 以及清单中的相对路径的默认根目录.
    pub input_dir: PathBuf,
    /// 结果目录.
    pub results_dir: PathBuf,
}

impl RunPaths {
    /// 构造.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(input_dir: P, results_dir: Q) -> Self {
        Self {
            input_dir: input_dir.into(),
            results_dir: results_dir.into(),
        }
    }

    /// 外层折 `fold` 的结果目录.
    pub fn fold_dir(&self, fold: usize) -> PathBuf {
        self.results_dir.join(format!("fold_{fold}"))
    }

    /// 外层折 `fold` 未完成时写入的临时目录.
    pub fn partial_dir(&self, fold: usize) -> PathBuf {
        self.results_dir.join(format!("fold_{fold}.partial"))
    }

    /// 结果目录下的文件.
    #[inline]
    pub fn result(&self, name: &str) -> PathBuf {
        self.results_dir.join(name)
    }
}
