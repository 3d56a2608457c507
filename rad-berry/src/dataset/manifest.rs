//! 案例清单: 每个案例的影像路径和掩膜路径.
//!
//! 提供迭代器风格的数据加载模式.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::table::{is_missing, ClinicalTable};
use super::DatasetError;
use crate::consts::{AUTO_ID_COLUMN, DEFAULT_ID_COLUMN};
use crate::data::{ImageVolume, RoiMask};
use crate::extract::ExtractionError;

/// 单个案例的文件引用.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    /// 案例标识.
    pub case_id: String,
    /// 影像文件路径.
    pub image_path: PathBuf,
    /// 掩膜文件路径.
    pub mask_path: PathBuf,
}

impl CaseRecord {
    /// 创建案例引用.
    pub fn new<S: Into<String>, P: Into<PathBuf>, Q: Into<PathBuf>>(case_id: S, image: P, mask: Q) -> Self {
        Self {
            case_id: case_id.into(),
            image_path: image.into(),
            mask_path: mask.into(),
        }
    }

    /// 打开影像与掩膜. 任一文件无法读取时返回 [`ExtractionError::Unreadable`].
    pub fn open(&self) -> Result<(ImageVolume, RoiMask), ExtractionError> {
        let unreadable = |path: &Path, e: &dyn std::fmt::Display| ExtractionError::Unreadable {
            case_id: self.case_id.clone(),
            path: path.to_owned(),
            reason: e.to_string(),
        };
        let image = ImageVolume::open(&self.image_path).map_err(|e| unreadable(&self.image_path, &e))?;
        let mask = RoiMask::open(&self.mask_path).map_err(|e| unreadable(&self.mask_path, &e))?;
        Ok((image, mask))
    }
}

/// 清单的列配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestColumns {
    /// 影像路径列.
    pub image_column: String,
    /// 掩膜路径列.
    pub mask_column: String,
    /// 案例标识列. `None` 时自动生成 `0, 1, ...`.
    #[serde(default)]
    pub id_column: Option<String>,
    /// 相对路径的根目录.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
}

/// 案例清单.
#[derive(Clone, Debug, PartialEq)]
pub struct CaseManifest {
    id_column: String,
    records: Vec<CaseRecord>,
}

impl CaseManifest {
    /// 从表格构造清单.
    ///
    /// # 注意
    ///
    /// 1. 影像列和掩膜列必须存在且不含空值.
    /// 2. 案例标识必须唯一.
    /// 3. 未指定标识列时, 标识按行号生成, 并作为新列追加到 `table` 中.
    ///   列名为 `ID`; 若 `ID` 已被占用则为 `ID_autogenerated`.
    pub fn from_table(table: &mut ClinicalTable, columns: &ManifestColumns) -> Result<Self, DatasetError> {
        let image = table.require(&columns.image_column)?;
        let mask = table.require(&columns.mask_column)?;

        let id_column = match &columns.id_column {
            Some(c) => {
                table.require(c)?;
                c.clone()
            }
            None => {
                let name = if table.column_index(DEFAULT_ID_COLUMN).is_some() {
                    AUTO_ID_COLUMN
                } else {
                    DEFAULT_ID_COLUMN
                };
                table.push_column(name, (0..table.len()).map(|i| i.to_string()).collect())?;
                name.to_owned()
            }
        };
        let id = table.require(&id_column)?;

        let resolve = |p: &str| -> PathBuf {
            let p = Path::new(p.trim());
            match &columns.root_dir {
                Some(root) if p.is_relative() => root.join(p),
                _ => p.to_owned(),
            }
        };

        let mut seen = HashSet::with_capacity(table.len());
        let mut records = Vec::with_capacity(table.len());
        for row in 0..table.len() {
            let case_id = table.cell(row, id).trim().to_owned();
            for (col, name) in [(id, &id_column), (image, &columns.image_column), (mask, &columns.mask_column)] {
                if is_missing(table.cell(row, col)) {
                    return Err(DatasetError::EmptyCell {
                        column: name.clone(),
                        line: row + 2,
                    });
                }
            }
            if !seen.insert(case_id.clone()) {
                return Err(DatasetError::DuplicateCase(case_id));
            }
            records.push(CaseRecord {
                case_id,
                image_path: resolve(table.cell(row, image)),
                mask_path: resolve(table.cell(row, mask)),
            });
        }

        Ok(Self { id_column, records })
    }

    /// 直接由案例引用构造. 标识必须唯一.
    pub fn from_records(records: Vec<CaseRecord>) -> Result<Self, DatasetError> {
        let mut seen = HashSet::with_capacity(records.len());
        if let Some(dup) = records.iter().find(|r| !seen.insert(r.case_id.as_str())) {
            return Err(DatasetError::DuplicateCase(dup.case_id.clone()));
        }
        Ok(Self {
            id_column: DEFAULT_ID_COLUMN.to_owned(),
            records,
        })
    }

    /// 标识列名.
    #[inline]
    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// 全部案例.
    #[inline]
    pub fn records(&self) -> &[CaseRecord] {
        &self.records
    }

    /// 案例标识.
    pub fn case_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.records.iter().map(|r| r.case_id.as_str())
    }

    /// 创建按清单顺序打开案例的加载器.
    pub fn loader(&self) -> CaseLoader<'_> {
        CaseLoader {
            records: self.records.iter(),
        }
    }
}

/// 案例数据加载器. 每次迭代打开一对 nii 文件.
#[derive(Debug)]
pub struct CaseLoader<'a> {
    records: std::slice::Iter<'a, CaseRecord>,
}

impl<'a> Iterator for CaseLoader<'a> {
    type Item = (&'a str, Result<(ImageVolume, RoiMask), ExtractionError>);

    fn next(&mut self) -> Option<Self::Item> {
        let rec = self.records.next()?;
        Some((rec.case_id.as_str(), rec.open()))
    }
}

impl ExactSizeIterator for CaseLoader<'_> {
    #[inline]
    fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(id: Option<&str>) -> ManifestColumns {
        ManifestColumns {
            image_column: "Image".into(),
            mask_column: "Mask".into(),
            id_column: id.map(String::from),
            root_dir: Some(PathBuf::from("/data")),
        }
    }

    #[test]
    fn test_manifest_with_ids() {
        let mut t = ClinicalTable::parse("Case,Image,Mask\np1,a.nii,/abs/m.nii\np2,b.nii,m2.nii\n").unwrap();
        let m = CaseManifest::from_table(&mut t, &columns(Some("Case"))).unwrap();
        assert_eq!(m.id_column(), "Case");
        assert_eq!(m.case_ids().collect::<Vec<_>>(), vec!["p1", "p2"]);
        assert_eq!(m.records()[0].image_path, PathBuf::from("/data/a.nii"));
        assert_eq!(m.records()[0].mask_path, PathBuf::from("/abs/m.nii"));
        assert_eq!(m.loader().len(), 2);
    }

    /// 自动生成标识, `ID` 被占用时改用 `ID_autogenerated`.
    #[test]
    fn test_manifest_auto_ids() {
        let mut t = ClinicalTable::parse("Image,Mask\na,b\nc,d\n").unwrap();
        let m = CaseManifest::from_table(&mut t, &columns(None)).unwrap();
        assert_eq!(m.id_column(), "ID");
        assert_eq!(t.column("ID").unwrap().collect::<Vec<_>>(), vec!["0", "1"]);

        let mut t = ClinicalTable::parse("ID,Image,Mask\nx,a,b\n").unwrap();
        let m = CaseManifest::from_table(&mut t, &columns(None)).unwrap();
        assert_eq!(m.id_column(), "ID_autogenerated");
        assert_eq!(m.case_ids().next(), Some("0"));
    }

    #[test]
    fn test_manifest_rejects_bad_rows() {
        let mut t = ClinicalTable::parse("Case,Image,Mask\np1,a,b\np1,c,d\n").unwrap();
        assert!(matches!(
            CaseManifest::from_table(&mut t, &columns(Some("Case"))),
            Err(DatasetError::DuplicateCase(id)) if id == "p1"
        ));

        let mut t = ClinicalTable::parse("Case,Image,Mask\np1,,b\n").unwrap();
        assert!(matches!(
            CaseManifest::from_table(&mut t, &columns(Some("Case"))),
            Err(DatasetError::EmptyCell { line: 2, .. })
        ));

        let mut t = ClinicalTable::parse("Case,Img,Mask\np1,a,b\n").unwrap();
        assert!(matches!(
            CaseManifest::from_table(&mut t, &columns(Some("Case"))),
            Err(DatasetError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_loader_reports_unreadable() {
        let m = CaseManifest::from_records(vec![CaseRecord::new("z", "/no/such.nii", "/no/mask.nii")]).unwrap();
        let (id, res) = m.loader().next().unwrap();
        assert_eq!(id, "z");
        assert!(matches!(res, Err(ExtractionError::Unreadable { .. })));
    }
}
