//! 单个折的拟合结果及其持久化.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};

use super::{oversample, AnyModel, Model, ModelKind, ModelSpec, PersistError, Scaling, Standardizer, TrainError};
use crate::consts::DEFAULT_SEED;
use crate::dataset::{Dataset, Task};
use crate::rng::{stage_rng, Stage};
use crate::select::{SelectError, SelectedFeatureSet, TrainRows};

/// 拟合选项.
#[derive(Clone, Debug, PartialEq)]
pub struct FitOptions {
    /// 特征缩放方式.
    pub scaling: Scaling,
    /// 是否对少数类随机过采样 (仅分类).
    pub oversample: bool,
    /// 运行种子.
    pub seed: u64,
    /// 外层折下标, 用于错误上下文.
    pub fold: usize,
    /// 派生随机源的阶段路径, 区分同一折内的多次拟合.
    pub path: Vec<u64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            scaling: Scaling::default(),
            oversample: false,
            seed: DEFAULT_SEED,
            fold: 0,
            path: Vec::new(),
        }
    }
}

/// 拟合好的模型: 模型本身, 所用特征子集与缩放变换.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    kind: ModelKind,
    fold: usize,
    task: Task,
    classes: Vec<String>,
    features: SelectedFeatureSet,
    scaler: Standardizer,
    model: AnyModel,
}

/// 在训练行上拟合 `spec`.
///
/// 分类任务的训练行少于两类时返回 [`TrainError::DegenerateLabel`].
pub fn fit(
    train: &TrainRows,
    selected: &SelectedFeatureSet,
    spec: &ModelSpec,
    opts: &FitOptions,
) -> Result<TrainedModel, TrainError> {
    spec.validate()?;
    let fold = opts.fold;
    let data = train.dataset();
    check_train(data, fold)?;
    let task = data.task();

    let x = selected
        .project(data)
        .map_err(|e| missing_feature(e, fold))?;
    let scaler = Standardizer::fit(opts.scaling, x.view());
    let mut xs = scaler.transform(x.view());
    let mut y = data.labels().clone();
    if opts.oversample && task == Task::Classification {
        let idx = oversample(y.view(), &mut stage_rng(opts.seed, Stage::Oversample, &opts.path));
        xs = xs.select(Axis(0), &idx);
        y = y.select(Axis(0), &idx);
    }

    let mut model = spec.build();
    model
        .fit(xs.view(), y.view(), task, &mut stage_rng(opts.seed, Stage::Fit, &opts.path))
        .map_err(|d| TrainError::Divergence {
            fold,
            model: spec.name(),
            reason: d.0,
        })?;

    Ok(TrainedModel {
        kind: spec.kind(),
        fold,
        task,
        classes: data.classes().to_vec(),
        features: selected.clone(),
        scaler,
        model,
    })
}

/// 训练行非空, 且分类任务至少有两类.
pub(crate) fn check_train(data: &Dataset, fold: usize) -> Result<(), TrainError> {
    if data.is_empty() {
        return Err(TrainError::EmptyTrain { fold });
    }
    if data.task() == Task::Classification {
        let classes = data.class_counts().len();
        if classes < 2 {
            return Err(TrainError::DegenerateLabel { fold, classes });
        }
    }
    Ok(())
}

fn missing_feature(e: SelectError, fold: usize) -> TrainError {
    match e {
        SelectError::UnknownFeature(name) => TrainError::MissingFeature { fold, name },
        other => TrainError::InvalidSpec(other.to_string()),
    }
}

impl TrainedModel {
    /// 模型类别.
    #[inline]
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// 外层折下标.
    #[inline]
    pub fn fold(&self) -> usize {
        self.fold
    }

    /// 任务类型.
    #[inline]
    pub fn task(&self) -> Task {
        self.task
    }

    /// 类别名.
    #[inline]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// 使用的特征.
    #[inline]
    pub fn features(&self) -> &SelectedFeatureSet {
        &self.features
    }

    /// 缩放变换.
    #[inline]
    pub fn scaler(&self) -> &Standardizer {
        &self.scaler
    }

    /// 底层模型.
    #[inline]
    pub fn model(&self) -> &AnyModel {
        &self.model
    }

    /// 拟合时使用的规格 (类别标签和超参数).
    pub fn spec(&self) -> ModelSpec {
        match &self.model {
            AnyModel::Linear(m) => ModelSpec::Linear(m.params().clone()),
            AnyModel::Forest(m) => ModelSpec::Forest(m.params().clone()),
            AnyModel::Kernel(m) => ModelSpec::Kernel(m.params().clone()),
        }
    }

    /// 对 `rows` 给出连续输出. `rows` 需包含模型的全部特征列.
    pub fn predict_score(&self, rows: &Dataset) -> Result<Array1<f64>, TrainError> {
        let x = self
            .features
            .project(rows)
            .map_err(|e| missing_feature(e, self.fold))?;
        Ok(self.model.predict_score(self.scaler.transform(x.view()).view()))
    }

    /// 对 `rows` 给出预测.
    pub fn predict(&self, rows: &Dataset) -> Result<Array1<f64>, TrainError> {
        let x = self
            .features
            .project(rows)
            .map_err(|e| missing_feature(e, self.fold))?;
        Ok(self.model.predict(self.scaler.transform(x.view()).view()))
    }

    /// 以 gzip 压缩的 bincode 格式写出.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistError> {
        let mut enc = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
        bincode::serialize_into(&mut enc, self)?;
        enc.finish()?.flush()?;
        Ok(())
    }

    /// 读取 [`Self::save`] 写出的文件.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let dec = GzDecoder::new(BufReader::new(File::open(path)?));
        Ok(bincode::deserialize_from(dec)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::forest::ForestParams;
    use crate::model::kernel::KernelParams;
    use crate::model::linear::LinearParams;
    use crate::split::tests::toy;

    fn train_rows(n: usize) -> TrainRows {
        TrainRows::whole(toy(n, |i| format!("p{i}"), |i| if i >= n / 2 { 1.0 } else { 0.0 }))
    }

    fn specs() -> Vec<ModelSpec> {
        vec![
            ModelSpec::Linear(LinearParams::default()),
            ModelSpec::Forest(ForestParams {
                n_trees: 8,
                ..Default::default()
            }),
            ModelSpec::Kernel(KernelParams {
                c: 10.0,
                gamma: Some(10.0),
            }),
        ]
    }

    #[test]
    fn test_fit_all_kinds() {
        let train = train_rows(30);
        let features = SelectedFeatureSet::all(&["f"]);
        for spec in specs() {
            let m = fit(&train, &features, &spec, &FitOptions::default()).unwrap();
            assert_eq!(m.kind(), spec.kind());
            assert_eq!(m.spec(), spec);
            let pred = m.predict(train.dataset()).unwrap();
            let correct = pred.iter().zip(train.labels()).filter(|(p, y)| p == y).count();
            assert!(correct >= 27, "{}: {correct}", spec.name());
        }
    }

    /// 训练行只有一类.
    #[test]
    fn test_degenerate_label() {
        let train = TrainRows::whole(toy(10, |i| format!("p{i}"), |_| 1.0));
        let opts = FitOptions {
            fold: 4,
            ..Default::default()
        };
        let err = fit(&train, &SelectedFeatureSet::all(&["f"]), &specs()[0], &opts).unwrap_err();
        assert_eq!(err, TrainError::DegenerateLabel { fold: 4, classes: 1 });
    }

    #[test]
    fn test_missing_feature() {
        let err = fit(&train_rows(10), &SelectedFeatureSet::all(&["g"]), &specs()[0], &FitOptions::default())
            .unwrap_err();
        assert!(matches!(err, TrainError::MissingFeature { fold: 0, ref name } if name == "g"));
    }

    /// 保存后重新加载, 预测逐位一致.
    #[test]
    fn test_save_load_identical_predictions() {
        let train = train_rows(24);
        let dir = tempfile::tempdir().unwrap();
        for (i, spec) in specs().iter().enumerate() {
            let opts = FitOptions {
                oversample: true,
                ..Default::default()
            };
            let m = fit(&train, &SelectedFeatureSet::all(&["f"]), spec, &opts).unwrap();
            let p = dir.path().join(format!("model_{i}.bin.gz"));
            m.save(&p).unwrap();
            let back = TrainedModel::load(&p).unwrap();
            assert_eq!(back, m);
            assert_eq!(
                back.predict_score(train.dataset()).unwrap(),
                m.predict_score(train.dataset()).unwrap()
            );
        }
    }
}
