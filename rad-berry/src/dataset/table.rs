//! 简单的 CSV 表格.
//!
//! 只支持逗号分隔, 双引号包裹 (`""` 转义) 的字段, 首行为表头. 所有单元格以字符串保存,
//! 类型推断由 [`super::DatasetBuilder`] 统一完成.

use std::fs;
use std::path::Path;

use super::DatasetError;
use crate::consts::FEATURE_PREFIXES;
use crate::extract::FeatureVector;

/// 被视为缺失值的单元格内容 (忽略首尾空白).
const MISSING: [&str; 6] = ["", "NA", "NaN", "nan", "null", "None"];

/// 单元格是否缺失?
#[inline]
pub fn is_missing(cell: &str) -> bool {
    MISSING.contains(&cell.trim())
}

/// 拆分一行 CSV.
fn split_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    out.push(cur);
    out
}

/// 按记录拆分文本, 引号内的换行属于同一条记录. 返回 (起始行下标, 记录内容).
fn records(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    for (no, line) in text.lines().enumerate() {
        let (start, mut record) = match pending.take() {
            Some((start, mut r)) => {
                r.push('\n');
                (start, r)
            }
            None => (no, String::new()),
        };
        record.push_str(line);
        // `""` 转义成对出现, 不影响奇偶.
        if record.matches('"').count() % 2 == 1 {
            pending = Some((start, record));
        } else {
            out.push((start, record));
        }
    }
    out.extend(pending);
    out
}

fn quote(cell: &str) -> String {
    if cell.contains([',', '"', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_owned()
    }
}

/// 将一行单元格编码为 CSV 行 (不含换行符).
pub(crate) fn join_line<S: AsRef<str>>(cells: &[S]) -> String {
    cells
        .iter()
        .map(|c| quote(c.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// 以字符串保存的表格. 行顺序与文件一致.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClinicalTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl ClinicalTable {
    /// 从 CSV 文本解析. 空行被忽略; 列数与表头不一致的行报错.
    pub fn parse(text: &str) -> Result<Self, DatasetError> {
        let mut lines = records(text)
            .into_iter()
            .filter(|(_, l)| !l.trim().is_empty());
        let headers: Vec<String> = match lines.next() {
            Some((_, h)) => split_line(h.trim_start_matches('\u{feff}'))
                .into_iter()
                .map(|s| s.trim().to_owned())
                .collect(),
            None => return Err(DatasetError::Empty),
        };

        let mut rows = Vec::new();
        for (no, line) in lines {
            let cells = split_line(&line);
            if cells.len() != headers.len() {
                return Err(DatasetError::Parse {
                    line: no + 1,
                    reason: format!("expected {} fields, found {}", headers.len(), cells.len()),
                });
            }
            rows.push(cells);
        }
        Ok(Self { headers, rows })
    }

    /// 读取 CSV 文件.
    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// 直接从表头和行构造. 行长度必须与表头一致.
    pub fn from_rows(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, DatasetError> {
        if let Some(i) = rows.iter().position(|r| r.len() != headers.len()) {
            return Err(DatasetError::Parse {
                line: i + 2,
                reason: format!("expected {} fields, found {}", headers.len(), rows[i].len()),
            });
        }
        Ok(Self { headers, rows })
    }

    /// 表头.
    #[inline]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// 行数.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// 是否没有数据行?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 列下标.
    #[inline]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// 列下标, 不存在时报 [`DatasetError::UnknownColumn`].
    pub fn require(&self, name: &str) -> Result<usize, DatasetError> {
        self.column_index(name)
            .ok_or_else(|| DatasetError::UnknownColumn(name.to_owned()))
    }

    /// 按列名取一列.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &str> + '_> {
        let i = self.column_index(name)?;
        Some(self.rows.iter().map(move |r| r[i].as_str()))
    }

    /// 第 `row` 行第 `col` 列.
    #[inline]
    pub fn cell(&self, row: usize, col: usize) -> &str {
        &self.rows[row][col]
    }

    /// 追加一列. `values` 长度必须等于行数.
    pub fn push_column(&mut self, name: &str, values: Vec<String>) -> Result<(), DatasetError> {
        if self.column_index(name).is_some() {
            return Err(DatasetError::DuplicateColumn(name.to_owned()));
        }
        if values.len() != self.rows.len() {
            return Err(DatasetError::Parse {
                line: 0,
                reason: format!("column `{name}` has {} values for {} rows", values.len(), self.rows.len()),
            });
        }
        self.headers.push(name.to_owned());
        self.rows.iter_mut().zip(values).for_each(|(r, v)| r.push(v));
        Ok(())
    }

    /// `column` 列取值为 `value` 的行的案例标识. 用于从表格列指定测试集.
    pub fn ids_where(&self, id_column: &str, column: &str, value: &str) -> Result<Vec<String>, DatasetError> {
        let id = self.require(id_column)?;
        let col = self.require(column)?;
        Ok(self
            .rows
            .iter()
            .filter(|r| r[col].trim() == value)
            .map(|r| r[id].trim().to_owned())
            .collect())
    }

    /// 自动识别的影像组学特征列: 列名以 [`FEATURE_PREFIXES`] 中任一前缀开头.
    pub fn radiomics_columns(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| FEATURE_PREFIXES.iter().any(|p| h.starts_with(p)))
            .cloned()
            .collect()
    }

    /// 将表中的特征列读取为特征向量. `features` 为 `None` 时自动识别特征列.
    ///
    /// 含缺失值的行不产生特征向量, 由数据集构建时按 "缺少特征" 记录.
    pub fn feature_vectors(
        &self,
        id_column: &str,
        features: Option<&[String]>,
    ) -> Result<Vec<FeatureVector>, DatasetError> {
        let id = self.require(id_column)?;
        let names = match features {
            Some(f) => f.to_vec(),
            None => self.radiomics_columns(),
        };
        if names.is_empty() {
            return Err(DatasetError::NoFeatures);
        }
        let cols = names
            .iter()
            .map(|n| self.require(n))
            .collect::<Result<Vec<_>, _>>()?;
        let hash = format!("table:{}", names.join("|"));

        let mut out = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            if cols.iter().any(|c| is_missing(&row[*c])) {
                continue;
            }
            let values = names
                .iter()
                .zip(&cols)
                .map(|(n, c)| {
                    row[*c]
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(|v| (n.clone(), v))
                        .ok_or_else(|| DatasetError::Parse {
                            line: i + 2,
                            reason: format!("feature `{n}` is not a finite number: `{}`", row[*c]),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.push(FeatureVector {
                case_id: row[id].trim().to_owned(),
                config_hash: hash.clone(),
                values,
            });
        }
        Ok(out)
    }
}
