//! 特征提取运行时错误.

use std::path::PathBuf;

use thiserror::Error;

use crate::{Idx3d, Spacing};

/// 单个案例的特征提取错误. 每个变体都携带案例标识.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    /// ROI 为空 (零体积).
    #[error("case `{case_id}`: mask has no ROI voxels")]
    EmptyMask {
        /// 案例标识.
        case_id: String,
    },

    /// 影像与掩膜的形状或分辨率不一致.
    #[error(
        "case `{case_id}`: image {image_shape:?} @ {image_spacing:?} mm and \
         mask {mask_shape:?} @ {mask_spacing:?} mm are not in the same space"
    )]
    GeometryMismatch {
        /// 案例标识.
        case_id: String,
        /// 影像形状 (z, H, W).
        image_shape: Idx3d,
        /// 掩膜形状 (z, H, W).
        mask_shape: Idx3d,
        /// 影像体素分辨率.
        image_spacing: Spacing,
        /// 掩膜体素分辨率.
        mask_spacing: Spacing,
    },

    /// 特征计算结果为 NaN 或无穷大.
    #[error("case `{case_id}`: feature `{feature}` evaluated to {value}")]
    InvalidFeatureValue {
        /// 案例标识.
        case_id: String,
        /// 特征名.
        feature: String,
        /// 非法值.
        value: f64,
    },

    /// 影像或掩膜文件无法读取.
    #[error("case `{case_id}`: cannot read `{}`: {reason}", path.display())]
    Unreadable {
        /// 案例标识.
        case_id: String,
        /// 出错的文件路径.
        path: PathBuf,
        /// 底层错误描述.
        reason: String,
    },

    /// 提取配置不合法 (如非正的重采样分辨率).
    #[error("invalid extraction config: {0}")]
    InvalidConfig(String),
}

impl ExtractionError {
    /// 获取错误对应的案例标识. 配置错误不属于任何案例.
    pub fn case_id(&self) -> Option<&str> {
        match self {
            Self::EmptyMask { case_id }
            | Self::GeometryMismatch { case_id, .. }
            | Self::InvalidFeatureValue { case_id, .. }
            | Self::Unreadable { case_id, .. } => Some(case_id),
            Self::InvalidConfig(_) => None,
        }
    }
}
