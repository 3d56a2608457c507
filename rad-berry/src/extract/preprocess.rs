//! 特征计算前的影像预处理.
//!
//! 过滤器按配置顺序依次作用. 影像和掩膜总是一起变换, 因此二者始终处于同一几何空间.

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use super::ExtractionError;
use crate::data::{ImageVolume, IntensityWindow, RoiMask, VolumeAttr};
use crate::Spacing;

/// 预处理过滤器.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreprocessFilter {
    /// 按窗位/窗宽截断强度.
    Window {
        /// 窗位.
        level: f32,
        /// 窗宽.
        width: f32,
    },

    /// 整幅影像 z-score 标准化后乘以 `scale`.
    Normalize {
        /// 标准化后的缩放系数.
        scale: f64,
    },

    /// 重采样到给定体素分辨率 (z, H, W), 单位毫米.
    /// 影像使用三线性插值, 掩膜使用最近邻插值.
    Resample {
        /// 目标分辨率.
        spacing: Spacing,
    },
}

/// 依次应用 `filters`, 返回变换后的 (影像, 掩膜).
pub fn apply(
    image: &ImageVolume,
    mask: &RoiMask,
    filters: &[PreprocessFilter],
) -> Result<(ImageVolume, RoiMask), ExtractionError> {
    let mut image = image.clone();
    let mut mask = mask.clone();
    for f in filters {
        match f {
            PreprocessFilter::Window { level, width } => {
                let w = IntensityWindow::new(*level, *width).ok_or_else(|| {
                    ExtractionError::InvalidConfig(format!(
                        "window level {level} / width {width} out of range"
                    ))
                })?;
                window(&mut image, &w);
            }
            PreprocessFilter::Normalize { scale } => normalize(&mut image, *scale),
            PreprocessFilter::Resample { spacing } => {
                if spacing.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                    return Err(ExtractionError::InvalidConfig(format!(
                        "resample spacing must be positive, got {spacing:?}"
                    )));
                }
                (image, mask) = resample(&image, &mask, *spacing);
            }
        }
    }
    Ok((image, mask))
}

/// 截断强度. 非有限值保持原样, 由后续特征校验报告.
fn window(image: &mut ImageVolume, w: &IntensityWindow) {
    image
        .data_mut()
        .iter_mut()
        .for_each(|v| *v = w.clamp(*v).unwrap_or(*v));
}

/// 整幅影像 z-score 标准化. 若标准差为 0 则只做去均值.
fn normalize(image: &mut ImageVolume, scale: f64) {
    let n = image.size() as f64;
    if n == 0.0 {
        return;
    }
    let mean = image.data().iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = image
        .data()
        .iter()
        .map(|v| (*v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let std = var.sqrt();
    let factor = if std > 0.0 { scale / std } else { 1.0 };
    image
        .data_mut()
        .iter_mut()
        .for_each(|v| *v = ((*v as f64 - mean) * factor) as f32);
}

/// 新网格第 `j` 个体素中心在原网格上的连续坐标.
#[inline]
fn source_coord(j: usize, new_sp: f64, old_sp: f64, old_len: usize) -> f64 {
    let u = (j as f64 + 0.5) * new_sp / old_sp - 0.5;
    u.clamp(0.0, (old_len - 1) as f64)
}

/// 新网格形状. 保持物理范围不变.
#[inline]
fn resampled_len(len: usize, old_sp: f64, new_sp: f64) -> usize {
    ((len as f64 * old_sp / new_sp).round() as usize).max(1)
}

fn resample(image: &ImageVolume, mask: &RoiMask, spacing: Spacing) -> (ImageVolume, RoiMask) {
    let (z, h, w) = image.shape();
    let old = image.spacing();
    if z == 0 || h == 0 || w == 0 {
        return (
            ImageVolume::from_parts(image.data().to_owned(), spacing),
            RoiMask::from_parts(mask.data().to_owned(), spacing),
        );
    }
    let shape = (
        resampled_len(z, old[0], spacing[0]),
        resampled_len(h, old[1], spacing[1]),
        resampled_len(w, old[2], spacing[2]),
    );
    let src = image.data();
    let msk = mask.data();

    let img = Array3::from_shape_fn(shape, |(i, j, k)| {
        let cz = source_coord(i, spacing[0], old[0], z);
        let ch = source_coord(j, spacing[1], old[1], h);
        let cw = source_coord(k, spacing[2], old[2], w);
        let (z0, h0, w0) = (cz.floor() as usize, ch.floor() as usize, cw.floor() as usize);
        let (z1, h1, w1) = ((z0 + 1).min(z - 1), (h0 + 1).min(h - 1), (w0 + 1).min(w - 1));
        let (fz, fh, fw) = (cz - z0 as f64, ch - h0 as f64, cw - w0 as f64);

        let lerp = |a: f32, b: f32, t: f64| a as f64 * (1.0 - t) + b as f64 * t;
        let c00 = lerp(src[(z0, h0, w0)], src[(z0, h0, w1)], fw);
        let c01 = lerp(src[(z0, h1, w0)], src[(z0, h1, w1)], fw);
        let c10 = lerp(src[(z1, h0, w0)], src[(z1, h0, w1)], fw);
        let c11 = lerp(src[(z1, h1, w0)], src[(z1, h1, w1)], fw);
        let c0 = c00 * (1.0 - fh) + c01 * fh;
        let c1 = c10 * (1.0 - fh) + c11 * fh;
        (c0 * (1.0 - fz) + c1 * fz) as f32
    });

    let m = Array3::from_shape_fn(shape, |(i, j, k)| {
        let cz = source_coord(i, spacing[0], old[0], z).round() as usize;
        let ch = source_coord(j, spacing[1], old[1], h).round() as usize;
        let cw = source_coord(k, spacing[2], old[2], w).round() as usize;
        msk[(cz, ch, cw)]
    });

    (
        ImageVolume::from_parts(img, spacing),
        RoiMask::from_parts(m, spacing),
    )
}
