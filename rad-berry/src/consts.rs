//! 通用常量.

/// 掩膜像素值.
pub mod mask {
    /// 掩膜中背景的像素值.
    pub const BACKGROUND: u8 = 0;

    /// 单标签掩膜中 ROI 的像素值.
    pub const ROI: u8 = 1;

    /// 像素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, BACKGROUND)
    }

    /// 像素是否属于 ROI?
    ///
    /// `label` 为 `None` 时任何非零像素都视为 ROI, 否则只有等于 `label` 的像素属于 ROI.
    #[inline]
    pub const fn is_roi(p: u8, label: Option<u8>) -> bool {
        match label {
            Some(l) => p == l,
            None => p != BACKGROUND,
        }
    }
}

/// 影像组学特征名的图像类型前缀. 数据集构建时用于自动识别特征列.
pub const FEATURE_PREFIXES: [&str; 4] = ["original", "wavelet", "log-sigma", "shape"];

/// 内置后端输出特征名的图像类型前缀.
pub const ORIGINAL_PREFIX: &str = "original";

/// 固定箱宽离散化的默认箱宽.
pub const DEFAULT_BIN_WIDTH: f64 = 25.0;

/// 特征复现比对的默认相对容差.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// 图像与掩膜体素分辨率比较的默认相对容差.
pub const DEFAULT_GEOMETRY_TOLERANCE: f64 = 1e-5;

/// 自助法 (bootstrap) 默认重采样次数.
pub const DEFAULT_BOOTSTRAP: u32 = 1000;

/// 默认置信水平.
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

/// 默认内层交叉验证折数.
pub const DEFAULT_INNER_FOLDS: u32 = 3;

/// 默认外层交叉验证折数.
pub const DEFAULT_OUTER_FOLDS: u32 = 5;

/// 默认随机种子.
pub const DEFAULT_SEED: u64 = 123;

/// 二分类预测时的默认判定阈值.
pub const DECISION_THRESHOLD: f64 = 0.5;

/// 案例标识列的默认列名.
pub const DEFAULT_ID_COLUMN: &str = "ID";

/// 自动生成案例标识时, `ID` 已被占用时使用的列名.
pub const AUTO_ID_COLUMN: &str = "ID_autogenerated";
