//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Spacing};

pub use crate::cancel::CancelToken;
pub use crate::data::{ImageVolume, IntensityWindow, RoiMask, VolumeAttr};

pub use crate::extract::{
    extract, extract_batch, BinScheme, ExtractionConfig, ExtractionError, Extractor, FeatureClass,
    FeatureVector, LoadedCase, PreprocessFilter,
};

pub use crate::dataset::{
    CaseManifest, CaseRecord, ClinicalTable, Dataset, DatasetBuilder, DatasetError, TableSchema, Task,
};

pub use crate::split::{split, Partition, Split, SplitError, SplitPlan, SplitStrategy};

pub use crate::select::{select, EvalRows, SelectedFeatureSet, SelectionMethod, TrainRows};

pub use crate::model::{fit, FitOptions, Model, ModelSpec, Scaling, TrainError, TrainedModel};

pub use crate::eval::{aggregate, evaluate, AggregateReport, BootstrapConfig, EvaluationResult};

pub use crate::pipeline::{Orchestrator, PipelineError, RunConfig, RunPaths, RunReport};
