//! 特征提取.
//!
//! 将 (影像, 掩膜) 对转换为特征向量. 具体特征由可插拔的 [`FeatureBackend`] 计算,
//! 后端通过配置中的 [`BackendKind`] 标签选择.
//!
//! 提取是无状态的: 相同的影像, 掩膜和配置总是得到相同的特征向量
//! (在 [`ExtractionConfig::tolerance`] 给出的相对容差内).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::{DEFAULT_GEOMETRY_TOLERANCE, DEFAULT_TOLERANCE, ORIGINAL_PREFIX};
use crate::data::{ImageVolume, RoiMask, VolumeAttr};
use crate::Idx3d;

pub mod batch;
mod error;
pub(crate) mod first_order;
mod glcm;
pub mod preprocess;
mod shape;

pub use batch::{extract_batch, extract_loaded, ExtractionReport, LoadedCase};
pub use error::ExtractionError;
pub use first_order::BinScheme;
pub use preprocess::PreprocessFilter;

/// 离散化后允许的最大灰度级数.
pub const MAX_GRAY_LEVELS: u32 = 1024;

/// 特征类别.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureClass {
    /// 一阶直方图统计.
    FirstOrder,
    /// 三维形状.
    Shape,
    /// 灰度共生矩阵纹理.
    Glcm,
}

impl FeatureClass {
    /// 特征名中使用的类别名.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::FirstOrder => "firstorder",
            Self::Shape => "shape",
            Self::Glcm => "glcm",
        }
    }

    /// 全部类别.
    pub fn all() -> BTreeSet<FeatureClass> {
        [Self::FirstOrder, Self::Shape, Self::Glcm].into_iter().collect()
    }
}

/// 后端标签.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// 纯 Rust 内置实现.
    #[default]
    Builtin,
}

impl BackendKind {
    /// 构造标签对应的后端.
    pub fn backend(&self) -> Box<dyn FeatureBackend> {
        match self {
            Self::Builtin => Box::new(BuiltinBackend),
        }
    }
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

fn default_geometry_tolerance() -> f64 {
    DEFAULT_GEOMETRY_TOLERANCE
}

/// 特征提取配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// 计算后端.
    #[serde(default)]
    pub backend: BackendKind,

    /// 需要计算的特征类别.
    #[serde(default = "FeatureClass::all")]
    pub feature_classes: BTreeSet<FeatureClass>,

    /// 按顺序作用的预处理过滤器.
    #[serde(default)]
    pub preprocessing_filters: Vec<PreprocessFilter>,

    /// 直方图类特征的离散化方案.
    #[serde(default)]
    pub binning: BinScheme,

    /// ROI 标签. `None` 表示所有非零体素.
    #[serde(default)]
    pub mask_label: Option<u8>,

    /// 复现比对的相对容差.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// 影像与掩膜分辨率比较的相对容差.
    #[serde(default = "default_geometry_tolerance")]
    pub geometry_tolerance: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            feature_classes: FeatureClass::all(),
            preprocessing_filters: Vec::new(),
            binning: BinScheme::default(),
            mask_label: None,
            tolerance: DEFAULT_TOLERANCE,
            geometry_tolerance: DEFAULT_GEOMETRY_TOLERANCE,
        }
    }
}

impl ExtractionConfig {
    /// 检查配置是否合法.
    pub fn validate(&self) -> Result<(), ExtractionError> {
        let bad = |msg: String| Err(ExtractionError::InvalidConfig(msg));
        if self.feature_classes.is_empty() {
            return bad("no feature class selected".into());
        }
        if !self.binning.is_valid() {
            return bad(format!("invalid binning {:?}", self.binning));
        }
        if !(self.tolerance >= 0.0 && self.geometry_tolerance >= 0.0) {
            return bad("tolerances must be non-negative".into());
        }
        Ok(())
    }

    /// 配置哈希: 规范 JSON 表示的 SHA-256, 十六进制.
    ///
    /// 同一哈希下产生的特征向量具有完全相同的特征名集合.
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        Sha256::digest(&canonical)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// 单个案例的特征向量.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// 案例标识.
    pub case_id: String,
    /// 产生该向量的配置哈希.
    pub config_hash: String,
    /// 有序的 (特征名, 值).
    pub values: Vec<(String, f64)>,
}

impl FeatureVector {
    /// 特征名, 按输出顺序.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    /// 按名称查找特征值.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// 特征个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 是否没有任何特征?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 判断两个向量在相对容差 `tolerance` 内是否一致. 特征名与顺序必须完全相同.
    pub fn approx_eq(&self, other: &FeatureVector, tolerance: f64) -> bool {
        self.config_hash == other.config_hash
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|((na, a), (nb, b))| {
                    na == nb && (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0)
                })
    }
}

/// 特征计算后端.
///
/// 后端只负责在已校验, 已预处理的数据上计算特征; 几何检查, 空掩膜检查和
/// 非有限值检查由 [`Extractor`] 统一完成.
pub trait FeatureBackend: Send + Sync {
    /// 后端名称.
    fn name(&self) -> &'static str;

    /// 计算 `positions` 所指 ROI 的特征. `positions` 非空.
    fn compute(
        &self,
        image: &ImageVolume,
        mask: &RoiMask,
        positions: &[Idx3d],
        config: &ExtractionConfig,
    ) -> Result<Vec<(String, f64)>, ExtractionError>;
}

/// 内置后端: 一阶, 形状, GLCM.
#[derive(Copy, Clone, Debug, Default)]
pub struct BuiltinBackend;

impl FeatureBackend for BuiltinBackend {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn compute(
        &self,
        image: &ImageVolume,
        mask: &RoiMask,
        positions: &[Idx3d],
        config: &ExtractionConfig,
    ) -> Result<Vec<(String, f64)>, ExtractionError> {
        let values: Vec<f64> = positions.iter().map(|p| image[*p] as f64).collect();
        let needs_levels = config
            .feature_classes
            .iter()
            .any(|c| matches!(c, FeatureClass::FirstOrder | FeatureClass::Glcm));

        // 非有限强度无法离散化.
        let (levels, ng) = if needs_levels && values.iter().all(|v| v.is_finite()) {
            let (levels, ng) = config.binning.discretize(&values);
            if ng > MAX_GRAY_LEVELS {
                return Err(ExtractionError::InvalidConfig(format!(
                    "binning {:?} yields {ng} gray levels (max {MAX_GRAY_LEVELS})",
                    config.binning
                )));
            }
            (levels, ng)
        } else {
            (Vec::new(), 0)
        };

        let mut out = Vec::new();
        for class in &config.feature_classes {
            let part = match class {
                FeatureClass::FirstOrder if levels.is_empty() => {
                    vec![("Mean", f64::NAN)]
                }
                FeatureClass::FirstOrder => first_order::features(&values, &levels, ng, image.voxel()),
                FeatureClass::Shape => shape::features(mask, positions, config.mask_label),
                FeatureClass::Glcm if levels.is_empty() => vec![("Contrast", f64::NAN)],
                FeatureClass::Glcm => glcm::features(image.shape(), positions, &levels, ng),
            };
            out.extend(
                part.into_iter()
                    .map(|(n, v)| (format!("{ORIGINAL_PREFIX}_{}_{n}", class.tag()), v)),
            );
        }
        Ok(out)
    }
}

/// 特征提取器. 持有已校验的配置和对应后端.
pub struct Extractor {
    config: ExtractionConfig,
    config_hash: String,
    backend: Box<dyn FeatureBackend>,
}

impl Extractor {
    /// 使用配置中标签对应的后端创建提取器.
    pub fn new(config: ExtractionConfig) -> Result<Self, ExtractionError> {
        let backend = config.backend.backend();
        Self::with_backend(config, backend)
    }

    /// 使用自定义后端创建提取器.
    pub fn with_backend(
        config: ExtractionConfig,
        backend: Box<dyn FeatureBackend>,
    ) -> Result<Self, ExtractionError> {
        config.validate()?;
        let config_hash = config.config_hash();
        Ok(Self {
            config,
            config_hash,
            backend,
        })
    }

    /// 提取配置.
    #[inline]
    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// 配置哈希.
    #[inline]
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// 后端名称.
    #[inline]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// 提取单个案例的特征.
    pub fn extract(
        &self,
        case_id: &str,
        image: &ImageVolume,
        mask: &RoiMask,
    ) -> Result<FeatureVector, ExtractionError> {
        if !image.same_space(mask, self.config.geometry_tolerance) {
            return Err(ExtractionError::GeometryMismatch {
                case_id: case_id.to_owned(),
                image_shape: image.shape(),
                mask_shape: mask.shape(),
                image_spacing: image.spacing(),
                mask_spacing: mask.spacing(),
            });
        }

        let (image, mask) = preprocess::apply(image, mask, &self.config.preprocessing_filters)?;
        let positions = mask.roi_positions(self.config.mask_label);
        if positions.is_empty() {
            return Err(ExtractionError::EmptyMask {
                case_id: case_id.to_owned(),
            });
        }

        let values = self
            .backend
            .compute(&image, &mask, &positions, &self.config)?;
        if let Some((feature, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ExtractionError::InvalidFeatureValue {
                case_id: case_id.to_owned(),
                feature: feature.clone(),
                value: *value,
            });
        }

        Ok(FeatureVector {
            case_id: case_id.to_owned(),
            config_hash: self.config_hash.clone(),
            values,
        })
    }
}

/// 使用 `config` 提取单个案例的特征.
pub fn extract(
    case_id: &str,
    image: &ImageVolume,
    mask: &RoiMask,
    config: &ExtractionConfig,
) -> Result<FeatureVector, ExtractionError> {
    Extractor::new(config.clone())?.extract(case_id, image, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    fn phantom() -> (ImageVolume, RoiMask) {
        let img = Array3::from_shape_fn((6, 8, 8), |(z, h, w)| ((z * 7 + h * 3 + w * 5) % 50) as f32 * 4.0);
        let mut m = Array3::<u8>::zeros((6, 8, 8));
        m.slice_mut(s![1..5, 2..6, 1..7]).fill(1);
        (
            ImageVolume::from_parts(img, [2.0, 0.8, 0.8]),
            RoiMask::from_parts(m, [2.0, 0.8, 0.8]),
        )
    }

    /// 重复提取结果一致.
    #[test]
    fn test_extract_deterministic() {
        let (img, mask) = phantom();
        let cfg = ExtractionConfig::default();
        let a = extract("c1", &img, &mask, &cfg).unwrap();
        let b = extract("c1", &img, &mask, &cfg).unwrap();
        assert!(a.approx_eq(&b, cfg.tolerance));
        assert_eq!(a, b);
        assert_eq!(a.len(), 18 + 10 + 21);
        assert!(a.get("original_firstorder_Mean").is_some());
        assert!(a.get("original_shape_VoxelVolume").is_some());
        assert!(a.get("original_glcm_Contrast").is_some());
    }

    #[test]
    fn test_empty_mask() {
        let (img, _) = phantom();
        let mask = RoiMask::from_parts(Array3::zeros((6, 8, 8)), [2.0, 0.8, 0.8]);
        let err = extract("c2", &img, &mask, &ExtractionConfig::default()).unwrap_err();
        assert_eq!(
            err,
            ExtractionError::EmptyMask {
                case_id: "c2".into()
            }
        );
    }

    #[test]
    fn test_geometry_mismatch() {
        let (img, mask) = phantom();
        let other = RoiMask::from_parts(mask.data().to_owned(), [2.0, 0.8, 0.9]);
        let err = extract("c3", &img, &other, &ExtractionConfig::default()).unwrap_err();
        assert!(matches!(err, ExtractionError::GeometryMismatch { .. }));
        assert_eq!(err.case_id(), Some("c3"));
    }

    #[test]
    fn test_nan_never_coerced() {
        let (mut img, mask) = phantom();
        img[(2, 3, 3)] = f32::NAN;
        let err = extract("c4", &img, &mask, &ExtractionConfig::default()).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidFeatureValue { .. }));
    }

    #[test]
    fn test_single_voxel_shape_is_invalid() {
        let (img, _) = phantom();
        let mut m = Array3::<u8>::zeros((6, 8, 8));
        m[(3, 3, 3)] = 1;
        let mask = RoiMask::from_parts(m, [2.0, 0.8, 0.8]);

        let mut cfg = ExtractionConfig::default();
        assert!(extract("c5", &img, &mask, &cfg).is_err());
        cfg.feature_classes = [FeatureClass::FirstOrder].into_iter().collect();
        let v = extract("c5", &img, &mask, &cfg).unwrap();
        assert_eq!(v.len(), 18);
    }

    #[test]
    fn test_config_hash_and_names() {
        let a = ExtractionConfig::default();
        let mut b = a.clone();
        assert_eq!(a.config_hash(), b.config_hash());
        b.binning = BinScheme::FixedCount { count: 16 };
        assert_ne!(a.config_hash(), b.config_hash());
        assert_eq!(a.config_hash().len(), 64);

        let json = r#"{"feature_classes": ["first_order"], "binning": {"type": "fixed_count", "count": 8}}"#;
        let c: ExtractionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.binning, BinScheme::FixedCount { count: 8 });
        assert_eq!(c.tolerance, DEFAULT_TOLERANCE);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let cfg = ExtractionConfig {
            feature_classes: BTreeSet::new(),
            ..Default::default()
        };
        assert!(Extractor::new(cfg).is_err());
    }

    struct ConstBackend;

    impl FeatureBackend for ConstBackend {
        fn name(&self) -> &'static str {
            "const"
        }

        fn compute(
            &self,
            _: &ImageVolume,
            _: &RoiMask,
            positions: &[Idx3d],
            _: &ExtractionConfig,
        ) -> Result<Vec<(String, f64)>, ExtractionError> {
            Ok(vec![("original_custom_Count".into(), positions.len() as f64)])
        }
    }

    #[test]
    fn test_custom_backend() {
        let (img, mask) = phantom();
        let ex = Extractor::with_backend(ExtractionConfig::default(), Box::new(ConstBackend)).unwrap();
        assert_eq!(ex.backend_name(), "const");
        let v = ex.extract("c6", &img, &mask).unwrap();
        assert_eq!(v.get("original_custom_Count"), Some(4.0 * 4.0 * 6.0));
    }
}
