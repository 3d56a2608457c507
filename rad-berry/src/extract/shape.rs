//! 三维形状特征. 只依赖掩膜, 与影像强度无关.
//!
//! 体素按各向异性分辨率换算成毫米坐标. 表面积按暴露体素面累加, 不做网格重建.

use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linalg::traits::evd::EVDDecomposable;

use crate::data::{RoiMask, VolumeAttr};
use crate::Idx3d;

/// 体素在 (z, H, W) 三个方向上的暴露面, 及该面面积的索引.
const FACES: [((isize, isize, isize), usize); 6] = [
    ((-1, 0, 0), 0),
    ((1, 0, 0), 0),
    ((0, -1, 0), 1),
    ((0, 1, 0), 1),
    ((0, 0, -1), 2),
    ((0, 0, 1), 2),
];

#[inline]
fn offset((z, h, w): Idx3d, (dz, dh, dw): (isize, isize, isize)) -> Idx3d {
    (
        z.wrapping_add_signed(dz),
        h.wrapping_add_signed(dh),
        w.wrapping_add_signed(dw),
    )
}

#[inline]
fn to_mm((z, h, w): Idx3d, sp: &[f64; 3]) -> [f64; 3] {
    [z as f64 * sp[0], h as f64 * sp[1], w as f64 * sp[2]]
}

/// 对称 3x3 矩阵的特征值, 降序排列. 分解失败时全为 NaN.
fn symmetric_eigenvalues(a: [[f64; 3]; 3]) -> [f64; 3] {
    let m = DenseMatrix::new(3, 3, a.iter().flatten().copied().collect(), false);
    match m.evd(true) {
        Ok(evd) if evd.d.len() == 3 => {
            let mut ev = [evd.d[0], evd.d[1], evd.d[2]];
            ev.sort_by(|x, y| y.total_cmp(x));
            ev
        }
        _ => [f64::NAN; 3],
    }
}

/// 计算形状特征. `positions` 为 ROI 体素, 至少包含一个体素.
///
/// 只有一个体素时主轴类特征无定义, 结果为 NaN, 由调用者按非法值处理.
pub fn features(mask: &RoiMask, positions: &[Idx3d], label: Option<u8>) -> Vec<(&'static str, f64)> {
    let sp = mask.spacing();
    let face_area = [sp[1] * sp[2], sp[0] * sp[2], sp[0] * sp[1]];
    let n = positions.len() as f64;
    let volume = n * mask.voxel();

    let mut area = 0.0;
    let mut surface = Vec::new();
    for &pos in positions {
        let mut exposed = false;
        for (d, axis) in FACES {
            if !mask.is_roi_at(offset(pos, d), label) {
                area += face_area[axis];
                exposed = true;
            }
        }
        if exposed {
            surface.push(to_mm(pos, &sp));
        }
    }

    let mut diameter = 0.0f64;
    for (i, a) in surface.iter().enumerate() {
        for b in &surface[i + 1..] {
            let d2: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
            diameter = diameter.max(d2);
        }
    }
    let diameter = diameter.sqrt();

    // 物理坐标的样本协方差.
    let coords: Vec<[f64; 3]> = positions.iter().map(|p| to_mm(*p, &sp)).collect();
    let mut mean = [0.0; 3];
    for c in &coords {
        for k in 0..3 {
            mean[k] += c[k] / n;
        }
    }
    let mut cov = [[0.0; 3]; 3];
    let denom = (n - 1.0).max(1.0);
    for c in &coords {
        for r in 0..3 {
            for k in 0..3 {
                cov[r][k] += (c[r] - mean[r]) * (c[k] - mean[k]) / denom;
            }
        }
    }
    let [l1, l2, l3] = symmetric_eigenvalues(cov).map(|v| v.max(0.0));

    vec![
        ("VoxelVolume", volume),
        ("SurfaceArea", area),
        ("SurfaceVolumeRatio", area / volume),
        (
            "Sphericity",
            (36.0 * std::f64::consts::PI * volume * volume).cbrt() / area,
        ),
        ("Maximum3DDiameter", diameter),
        ("MajorAxisLength", 4.0 * l1.sqrt()),
        ("MinorAxisLength", 4.0 * l2.sqrt()),
        ("LeastAxisLength", 4.0 * l3.sqrt()),
        ("Elongation", (l2 / l1).sqrt()),
        ("Flatness", (l3 / l1).sqrt()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn get(f: &[(&str, f64)], name: &str) -> f64 {
        f.iter().find(|(n, _)| *n == name).unwrap().1
    }

    fn block(spacing: [f64; 3]) -> RoiMask {
        let mut data = Array3::<u8>::zeros((4, 4, 4));
        data.slice_mut(s![1..3, 1..3, 1..3]).fill(1);
        RoiMask::from_parts(data, spacing)
    }

    #[test]
    fn test_eigenvalues_diagonal_and_rotated() {
        let ev = symmetric_eigenvalues([[1.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 2.0]]);
        assert!(f64_eq(ev[0], 3.0) && f64_eq(ev[1], 2.0) && f64_eq(ev[2], 1.0));

        // [[2,1,0],[1,2,0],[0,0,5]] 的特征值为 5, 3, 1.
        let ev = symmetric_eigenvalues([[2.0, 1.0, 0.0], [1.0, 2.0, 0.0], [0.0, 0.0, 5.0]]);
        assert!(f64_eq(ev[0], 5.0) && f64_eq(ev[1], 3.0) && f64_eq(ev[2], 1.0));
    }

    /// 2x2x2 立方体的体积, 表面积和主轴.
    #[test]
    fn test_cube_shape() {
        let m = block([1.0; 3]);
        let pos = m.roi_positions(None);
        let f = features(&m, &pos, None);
        assert!(f64_eq(get(&f, "VoxelVolume"), 8.0));
        assert!(f64_eq(get(&f, "SurfaceArea"), 24.0));
        assert!(f64_eq(get(&f, "SurfaceVolumeRatio"), 3.0));
        assert!(f64_eq(get(&f, "Maximum3DDiameter"), 3f64.sqrt()));
        assert!(f64_eq(get(&f, "Elongation"), 1.0));
        assert!(f64_eq(get(&f, "Flatness"), 1.0));
        assert!(f64_eq(get(&f, "MajorAxisLength"), 4.0 * (2.0f64 / 7.0).sqrt()));
    }

    #[test]
    fn test_anisotropic_spacing() {
        let m = block([2.0, 1.0, 1.0]);
        let pos = m.roi_positions(None);
        let f = features(&m, &pos, None);
        assert!(f64_eq(get(&f, "VoxelVolume"), 16.0));
        // z 面: 2 * 4 * 1, H/W 面: 4 * 4 * 2.
        assert!(f64_eq(get(&f, "SurfaceArea"), 8.0 + 32.0));
        assert!(get(&f, "Elongation") < 1.0);
    }

    #[test]
    fn test_single_voxel_undefined_axes() {
        let mut data = Array3::<u8>::zeros((3, 3, 3));
        data[(1, 1, 1)] = 1;
        let m = RoiMask::from_parts(data, [1.0; 3]);
        let f = features(&m, &[(1, 1, 1)], None);
        assert!(f64_eq(get(&f, "SurfaceArea"), 6.0));
        assert!(get(&f, "Elongation").is_nan());
    }
}
