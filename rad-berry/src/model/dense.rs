//! ndarray 与 smartcore 矩阵之间的转换.

use ndarray::{Array1, ArrayView1, ArrayView2};
use smartcore::linalg::basic::arrays::Array as _;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linalg::traits::cholesky::CholeskyDecomposable;

use super::Divergence;

/// 行优先复制为 smartcore 稠密矩阵.
pub(crate) fn dense(x: ArrayView2<f64>) -> DenseMatrix<f64> {
    let (n, p) = x.dim();
    DenseMatrix::new(n, p, x.iter().copied().collect(), false)
}

/// 只取 `cols` 列.
pub(crate) fn dense_columns(x: ArrayView2<f64>, cols: &[usize]) -> DenseMatrix<f64> {
    let data = x
        .rows()
        .into_iter()
        .flat_map(|row| cols.iter().map(move |c| row[*c]))
        .collect();
    DenseMatrix::new(x.nrows(), cols.len(), data, false)
}

/// 二分类标签 (0/1) 转为类别编号.
pub(crate) fn class_labels(y: ArrayView1<f64>) -> Vec<i32> {
    y.iter().map(|v| if *v >= 0.5 { 1 } else { 0 }).collect()
}

/// 按行展开. 用于读取单行或单列的系数矩阵.
pub(crate) fn flatten(m: &DenseMatrix<f64>) -> Array1<f64> {
    let (r, c) = m.shape();
    (0..r)
        .flat_map(|i| (0..c).map(move |j| (i, j)))
        .map(|pos| *m.get(pos))
        .collect()
}

/// 以 Cholesky 分解求解对称正定方程组 `a x = b`.
pub(crate) fn solve_spd(a: DenseMatrix<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, Divergence> {
    let rhs = DenseMatrix::new(b.len(), 1, b.to_vec(), false);
    let x = a
        .cholesky_solve_mut(rhs)
        .map_err(|e| Divergence(format!("cholesky solve failed: {e}")))?;
    let x = flatten(&x);
    if x.iter().any(|v| !v.is_finite()) {
        return Err(Divergence("system is singular".into()));
    }
    Ok(x)
}
