use std::ops::{Index, IndexMut};
use std::path::Path;

use ndarray::{Array3, ArrayView, ArrayViewMut, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

use crate::consts::mask::*;
use crate::{Idx3d, Spacing};

pub mod window;

pub use window::IntensityWindow;

/// 打开 nii 体数据时的错误.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// 底层 nifti 解码错误.
    #[error("nifti decoding failed: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 体数据不是三维的.
    #[error("volume is not three-dimensional: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// 从 header 读取体素分辨率, 并将 (W, H, z) 转换成 (z, H, W). 以后均按照该模式访问.
#[inline]
fn spacing_from_header(h: &NiftiHeader) -> Spacing {
    let [_, w, h, z, ..] = h.pixdim;
    [z.abs() as f64, h.abs() as f64, w.abs() as f64]
}

/// 读取 nii 文件, 得到 (z, H, W) 排列的标准布局数组和体素分辨率.
///
/// nifti 对元素类型的约束较多, 因此使用宏按具体类型展开.
macro_rules! read_volume {
    ($path: expr, $elem: ty) => {{
        let obj = ReaderOptions::new().read_file($path.as_ref())?;
        let spacing = spacing_from_header(obj.header());

        // [W, H, z] -> [z, H, W].
        // hint: 原第一维向下增长, 原第二维向右增长.
        let data = obj
            .into_volume()
            .into_ndarray::<$elem>()?
            .permuted_axes([2, 1, 0].as_slice());
        let data = data
            .as_standard_layout()
            .into_owned()
            .into_dimensionality::<Ix3>()?;
        (data, spacing)
    }};
}

/// 三维体数据的共用几何属性和部分通用操作.
///
/// 形状与分辨率均按 (z, H, W) 排列. 分辨率以毫米为单位.
pub trait VolumeAttr {
    /// 获取数据形状大小.
    fn shape(&self) -> Idx3d;

    /// 获取单个体素分辨率. 分别代表空间 (相邻切片方向), 高 (自然图像的垂直方向),
    /// 宽 (自然图像的水平方向).
    fn spacing(&self) -> Spacing;

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        let (z, h, w) = self.shape();
        z * h * w
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.spacing().iter().product()
    }

    /// 判断两个体数据是否处于同一几何空间: 形状完全相同,
    /// 且各方向分辨率的相对误差不超过 `tolerance`.
    fn same_space<V: VolumeAttr + ?Sized>(&self, other: &V, tolerance: f64) -> bool {
        self.shape() == other.shape()
            && self
                .spacing()
                .iter()
                .zip(other.spacing().iter())
                .all(|(a, b)| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0))
    }
}

/// 三维影像体数据. 体素强度以 `f32` 保存 (如 CT HU 值).
#[derive(Debug, Clone)]
pub struct ImageVolume {
    spacing: Spacing,
    data: Array3<f32>,
}

impl VolumeAttr for ImageVolume {
    #[inline]
    fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    #[inline]
    fn spacing(&self) -> Spacing {
        self.spacing
    }
}

impl Index<Idx3d> for ImageVolume {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for ImageVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl ImageVolume {
    /// 打开 nii 文件格式的三维影像. `path` 为 nii 文件的本地路径.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        let (data, spacing) = read_volume!(path, f32);
        Ok(Self { spacing, data })
    }

    /// 根据 (z, H, W) 排列的裸数据和体素分辨率直接创建影像.
    #[inline]
    pub fn from_parts(data: Array3<f32>, spacing: Spacing) -> Self {
        Self { spacing, data }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, f32, Ix3> {
        self.data.view_mut()
    }
}

/// 三维 ROI 掩膜. 标签值以 `u8` 保存.
#[derive(Debug, Clone)]
pub struct RoiMask {
    spacing: Spacing,
    data: Array3<u8>,
}

impl VolumeAttr for RoiMask {
    #[inline]
    fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    #[inline]
    fn spacing(&self) -> Spacing {
        self.spacing
    }
}

impl Index<Idx3d> for RoiMask {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl RoiMask {
    /// 打开 nii 文件格式的三维掩膜. `path` 为 nii 文件的本地路径.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        let (data, spacing) = read_volume!(path, u8);
        Ok(Self { spacing, data })
    }

    /// 根据 (z, H, W) 排列的裸数据和体素分辨率直接创建掩膜.
    #[inline]
    pub fn from_parts(data: Array3<u8>, spacing: Spacing) -> Self {
        Self { spacing, data }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u8, Ix3> {
        self.data.view()
    }

    /// 获取掩膜中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 收集属于 ROI 的所有体素下标, 结果按行优先存储.
    ///
    /// `label` 的含义见 [`crate::consts::mask::is_roi`].
    pub fn roi_positions(&self, label: Option<u8>) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, pixel)| is_roi(*pixel, label).then_some(pos))
            .collect()
    }

    /// 判断 `pos` 处体素是否属于 ROI. 越界位置视为背景.
    #[inline]
    pub fn is_roi_at(&self, pos: Idx3d, label: Option<u8>) -> bool {
        self.data.get(pos).is_some_and(|p| is_roi(*p, label))
    }

    /// 获取 `pos` 前后上下左右六个点的坐标.
    ///
    /// 在数据范围外的坐标会被过滤掉, 不会包含在返回值中.
    pub fn diamond_neighbours(&self, (z, h, w): Idx3d) -> Vec<Idx3d> {
        [
            (z.wrapping_sub(1), h, w),
            (z.saturating_add(1), h, w),
            (z, h.wrapping_sub(1), w),
            (z, h.saturating_add(1), w),
            (z, h, w.wrapping_sub(1)),
            (z, h, w.saturating_add(1)),
        ]
        .into_iter()
        .filter(|p| self.check(p) && *p != (z, h, w))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn cube_mask() -> RoiMask {
        let mut data = Array3::<u8>::zeros((4, 4, 4));
        data.slice_mut(ndarray::s![1..3, 1..3, 1..3]).fill(ROI);
        RoiMask::from_parts(data, [2.0, 1.0, 1.0])
    }

    #[test]
    fn test_mask_positions() {
        let m = cube_mask();
        assert_eq!(m.count(ROI), 8);
        let pos = m.roi_positions(None);
        assert_eq!(pos.len(), 8);
        assert_eq!(pos[0], (1, 1, 1));
        assert!(m.roi_positions(Some(2)).is_empty());
        assert!(m.is_roi_at((1, 2, 2), Some(1)));
        assert!(!m.is_roi_at((9, 9, 9), None));
    }

    #[test]
    fn test_diamond_neighbours_clipped() {
        let m = cube_mask();
        assert_eq!(m.diamond_neighbours((0, 0, 0)).len(), 3);
        assert_eq!(m.diamond_neighbours((1, 1, 1)).len(), 6);
        assert_eq!(m.diamond_neighbours((3, 3, 3)).len(), 3);
    }

    #[test]
    fn test_same_space() {
        let m = cube_mask();
        let img = ImageVolume::from_parts(Array3::zeros((4, 4, 4)), [2.0, 1.0, 1.0]);
        assert!(img.same_space(&m, 1e-6));
        assert!((img.voxel() - 2.0).abs() < 1e-12);

        let shifted = ImageVolume::from_parts(Array3::zeros((4, 4, 4)), [2.1, 1.0, 1.0]);
        assert!(!shifted.same_space(&m, 1e-6));

        let other_shape = ImageVolume::from_parts(Array3::zeros((4, 4, 5)), [2.0, 1.0, 1.0]);
        assert!(!other_shape.same_space(&m, 1e-6));
    }
}
