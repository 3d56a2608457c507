//! 特征表写出.
//!
//! CSV 供人工查看, npz 供其它工具直接加载 (`x.npy`: 特征矩阵, `y.npy`: 标签).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::Array1;
use ndarray_npy::NpzWriter;

use super::table::join_line;
use super::{Dataset, DatasetError};
use crate::extract::FeatureVector;

/// 将数据集写为 CSV. 列依次为案例标识, 分组, 标签和全部特征列.
pub fn write_dataset_csv<P: AsRef<Path>>(dataset: &Dataset, path: P) -> Result<(), DatasetError> {
    let mut w = BufWriter::new(File::create(path)?);
    let mut header = vec!["case_id".to_owned(), "group".to_owned(), "label".to_owned()];
    header.extend(dataset.column_names().map(String::from));
    writeln!(w, "{}", join_line(&header))?;

    for row in dataset.rows() {
        let mut cells = vec![row.case_id.to_owned(), row.group.to_owned(), row.label.to_string()];
        cells.extend(row.values.iter().map(|v| v.to_string()));
        writeln!(w, "{}", join_line(&cells))?;
    }
    w.flush()?;
    Ok(())
}

/// 将特征向量写为 CSV. 所有向量的特征名必须一致, 以第一个向量为准.
pub fn write_vectors_csv<P: AsRef<Path>>(vectors: &[FeatureVector], path: P) -> Result<(), DatasetError> {
    let Some(first) = vectors.first() else {
        return Err(DatasetError::Empty);
    };
    let mut w = BufWriter::new(File::create(path)?);
    let mut header = vec!["case_id".to_owned()];
    header.extend(first.names().map(String::from));
    writeln!(w, "{}", join_line(&header))?;

    for v in vectors {
        if !v.names().eq(first.names()) {
            return Err(DatasetError::InconsistentFeatures {
                case_id: v.case_id.clone(),
                reason: "feature names differ".into(),
            });
        }
        let mut cells = vec![v.case_id.clone()];
        cells.extend(v.values.iter().map(|(_, x)| x.to_string()));
        writeln!(w, "{}", join_line(&cells))?;
    }
    w.flush()?;
    Ok(())
}

/// 将特征矩阵和标签写为 npz 归档.
pub fn write_dataset_npz<P: AsRef<Path>>(dataset: &Dataset, path: P) -> Result<(), DatasetError> {
    let mut npz = NpzWriter::new(File::create(path)?);
    npz.add_array("x.npy", dataset.x())?;
    npz.add_array("y.npy", dataset.labels())?;
    let ids: Array1<u64> = (0..dataset.len() as u64).collect();
    npz.add_array("row.npy", &ids)?;
    npz.finish()?;
    Ok(())
}
