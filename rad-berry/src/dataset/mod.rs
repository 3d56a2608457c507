//! 数据集构建.
//!
//! 将案例清单, 特征向量和临床表格按案例标识连接成一张带列角色的数值表.
//! 表结构 ([`TableSchema`]) 在 [`DatasetBuilder`] 构造时一次性校验并推断列类型,
//! 之后不再改变. 缺少特征或标签的案例被丢弃, 并记录在 [`DropLog`] 中.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::{ExtractionError, FeatureVector};

mod manifest;
mod table;
pub mod writer;

pub use manifest::{CaseLoader, CaseManifest, CaseRecord, ManifestColumns};
pub use table::{is_missing, ClinicalTable};
pub(crate) use table::join_line;

/// 数据集构建错误. 这些错误对整个运行是致命的.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// 标签列不存在.
    #[error("label column `{0}` not found in clinical table")]
    MissingLabel(String),

    /// 案例标识重复.
    #[error("duplicate case `{0}`")]
    DuplicateCase(String),

    /// 列名重复.
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),

    /// 配置中引用了不存在的列.
    #[error("unknown column `{0}`")]
    UnknownColumn(String),

    /// 必填单元格为空.
    #[error("empty value in column `{column}` at line {line}")]
    EmptyCell {
        /// 列名.
        column: String,
        /// 文件行号 (从 1 开始, 含表头).
        line: usize,
    },

    /// 特征向量之间特征名或配置哈希不一致.
    #[error("case `{case_id}`: inconsistent feature vector: {reason}")]
    InconsistentFeatures {
        /// 案例标识.
        case_id: String,
        /// 原因.
        reason: String,
    },

    /// 分类任务的标签类别数不是 2.
    #[error("binary classification needs at most two label classes, found {0:?}")]
    UnsupportedLabel(Vec<String>),

    /// 标签无法解析.
    #[error("case `{case_id}`: invalid label `{value}`")]
    InvalidLabel {
        /// 案例标识.
        case_id: String,
        /// 原始值.
        value: String,
    },

    /// 没有可用的特征列.
    #[error("no feature columns")]
    NoFeatures,

    /// 构建时使用的表格与构造 builder 时的表结构不同.
    #[error("clinical table columns differ from the validated schema")]
    SchemaMismatch,

    /// 表格为空, 或连接后没有剩余案例.
    #[error("dataset is empty")]
    Empty,

    /// CSV 解析失败.
    #[error("line {line}: {reason}")]
    Parse {
        /// 行号.
        line: usize,
        /// 原因.
        reason: String,
    },

    /// 文件读写失败.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// npz 写出失败.
    #[error("npz: {0}")]
    Npz(#[from] ndarray_npy::WriteNpzError),
}

/// 任务类型.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// 二分类.
    #[default]
    Classification,
    /// 回归.
    Regression,
}

/// 表结构: 各列的角色.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// 案例标识列.
    pub id_column: String,
    /// 标签列.
    pub label_column: String,
    /// 分组 (如患者) 列. 同组案例总是被划分到同一侧.
    #[serde(default)]
    pub group_column: Option<String>,
    /// 作为特征使用的临床列.
    #[serde(default)]
    pub clinical_columns: Vec<String>,
    /// 强制按类别型处理的临床列.
    #[serde(default)]
    pub categorical_columns: Vec<String>,
    /// 使用的影像组学特征. `None` 表示特征向量中的全部特征.
    #[serde(default)]
    pub feature_columns: Option<Vec<String>>,
    /// 任务类型.
    #[serde(default)]
    pub task: Task,
}

/// 推断得到的列类型.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// 连续数值.
    Continuous,
    /// 类别, 按取值排序后 one-hot 编码.
    Categorical {
        /// 全部取值.
        levels: Vec<String>,
    },
}

/// 数值表中一列的角色.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// 影像组学特征.
    Radiomic,
    /// 临床变量 (类别型已展开).
    Clinical,
}

/// 数值表的一列.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// 列名.
    pub name: String,
    /// 角色.
    pub role: ColumnRole,
}

/// 案例被丢弃的原因.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    /// 特征提取失败.
    ExtractionFailed {
        /// 错误描述.
        error: String,
    },
    /// 没有对应的特征向量.
    MissingFeatures,
    /// 临床表格中没有该案例, 或标签为空.
    MissingLabel,
    /// 分组键为空.
    MissingGroup,
    /// 临床变量为空.
    MissingClinical {
        /// 列名.
        column: String,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExtractionFailed { error } => write!(f, "extraction failed ({error})"),
            Self::MissingFeatures => f.write_str("no feature vector"),
            Self::MissingLabel => f.write_str("missing label"),
            Self::MissingGroup => f.write_str("missing group key"),
            Self::MissingClinical { column } => write!(f, "missing clinical value `{column}`"),
        }
    }
}

/// 被丢弃的案例.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DroppedCase {
    /// 案例标识.
    pub case_id: String,
    /// 原因.
    #[serde(flatten)]
    pub reason: DropReason,
}

/// 丢弃记录, 按案例标识排序.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropLog(Vec<DroppedCase>);

impl DropLog {
    /// 全部记录.
    #[inline]
    pub fn entries(&self) -> &[DroppedCase] {
        &self.0
    }

    /// 记录条数.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 是否没有丢弃任何案例?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 查询某个案例的丢弃原因.
    pub fn reason(&self, case_id: &str) -> Option<&DropReason> {
        self.0.iter().find(|d| d.case_id == case_id).map(|d| &d.reason)
    }

    fn push(&mut self, case_id: &str, reason: DropReason) {
        log::warn!("dropping case `{case_id}`: {reason}");
        self.0.push(DroppedCase {
            case_id: case_id.to_owned(),
            reason,
        });
    }
}

/// 数据集中的一行 (只读视图).
#[derive(Clone, Debug)]
pub struct Row<'a> {
    /// 案例标识.
    pub case_id: &'a str,
    /// 分组键. 未配置分组时等于案例标识.
    pub group: &'a str,
    /// 标签. 分类任务中为 0 或 1.
    pub label: f64,
    /// 特征值, 与 [`Dataset::columns`] 对应.
    pub values: ArrayView1<'a, f64>,
}

/// 连接后的数据集. 行按案例标识升序排列.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    task: Task,
    classes: Vec<String>,
    columns: Vec<Column>,
    ids: Vec<String>,
    groups: Vec<String>,
    labels: Array1<f64>,
    x: Array2<f64>,
    drop_log: DropLog,
}

impl Dataset {
    /// 从原始数据构造, 行会按案例标识重新排序.
    ///
    /// `classes` 为分类任务的类别名 (下标即编码), 回归任务传空.
    pub fn new(
        task: Task,
        classes: Vec<String>,
        columns: Vec<Column>,
        ids: Vec<String>,
        groups: Vec<String>,
        labels: Array1<f64>,
        x: Array2<f64>,
    ) -> Result<Self, DatasetError> {
        let n = ids.len();
        if groups.len() != n || labels.len() != n || x.nrows() != n || x.ncols() != columns.len() {
            return Err(DatasetError::Parse {
                line: 0,
                reason: "dataset parts have inconsistent lengths".into(),
            });
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| ids[*a].cmp(&ids[*b]));
        if let Some(w) = order.windows(2).find(|w| ids[w[0]] == ids[w[1]]) {
            return Err(DatasetError::DuplicateCase(ids[w[0]].clone()));
        }
        Ok(Self {
            task,
            classes,
            columns,
            ids: order.iter().map(|i| ids[*i].clone()).collect(),
            groups: order.iter().map(|i| groups[*i].clone()).collect(),
            labels: labels.select(Axis(0), &order),
            x: x.select(Axis(0), &order),
            drop_log: DropLog::default(),
        })
    }

    /// 行数.
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// 是否没有任何行?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 任务类型.
    #[inline]
    pub fn task(&self) -> Task {
        self.task
    }

    /// 分类任务的类别名.
    #[inline]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// 全部列.
    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// 列名.
    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// 案例标识.
    #[inline]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// 分组键.
    #[inline]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// 标签.
    #[inline]
    pub fn labels(&self) -> &Array1<f64> {
        &self.labels
    }

    /// 特征矩阵 (行 × 列).
    #[inline]
    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    /// 丢弃记录.
    #[inline]
    pub fn drop_log(&self) -> &DropLog {
        &self.drop_log
    }

    /// 第 `i` 行.
    pub fn row(&self, i: usize) -> Row<'_> {
        Row {
            case_id: &self.ids[i],
            group: &self.groups[i],
            label: self.labels[i],
            values: self.x.row(i),
        }
    }

    /// 逐行迭代.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        (0..self.len()).map(|i| self.row(i))
    }

    /// 按案例标识查找行下标.
    pub fn index_of(&self, case_id: &str) -> Option<usize> {
        self.ids.binary_search_by(|id| id.as_str().cmp(case_id)).ok()
    }

    /// 取部分行. 下标会先排序, 因此结果仍按案例标识有序. 丢弃记录不被继承.
    pub fn subset(&self, rows: &[usize]) -> Dataset {
        let mut rows = rows.to_vec();
        rows.sort_unstable();
        rows.dedup();
        Dataset {
            task: self.task,
            classes: self.classes.clone(),
            columns: self.columns.clone(),
            ids: rows.iter().map(|i| self.ids[*i].clone()).collect(),
            groups: rows.iter().map(|i| self.groups[*i].clone()).collect(),
            labels: self.labels.select(Axis(0), &rows),
            x: self.x.select(Axis(0), &rows),
            drop_log: DropLog::default(),
        }
    }

    /// 取部分列.
    pub fn select_columns(&self, cols: &[usize]) -> Dataset {
        Dataset {
            columns: cols.iter().map(|c| self.columns[*c].clone()).collect(),
            x: self.x.select(Axis(1), cols),
            drop_log: DropLog::default(),
            ..self.clone()
        }
    }

    /// 每个类别的行数. 回归任务返回空表.
    pub fn class_counts(&self) -> BTreeMap<u32, usize> {
        let mut out = BTreeMap::new();
        if self.task == Task::Classification {
            for l in &self.labels {
                *out.entry(*l as u32).or_insert(0) += 1;
            }
        }
        out
    }
}

/// 标签编码方式.
#[derive(Clone, Debug, PartialEq)]
enum LabelCodec {
    /// 按数值比较的类别.
    Numeric(Vec<f64>),
    /// 按字符串比较的类别.
    Text(Vec<String>),
    /// 回归标签.
    Continuous,
}

impl LabelCodec {
    fn infer(task: Task, cells: &[&str]) -> Result<Self, DatasetError> {
        let present: Vec<&str> = cells.iter().map(|c| c.trim()).filter(|c| !is_missing(c)).collect();
        if task == Task::Regression {
            return Ok(Self::Continuous);
        }
        let numeric: Option<Vec<f64>> = present.iter().map(|c| c.parse::<f64>().ok()).collect();
        let codec = match numeric {
            Some(mut v) => {
                v.sort_by(f64::total_cmp);
                v.dedup();
                Self::Numeric(v)
            }
            None => {
                let mut v: Vec<String> = present.iter().map(|c| c.to_string()).collect();
                v.sort();
                v.dedup();
                Self::Text(v)
            }
        };
        let classes = codec.classes();
        if classes.len() > 2 {
            return Err(DatasetError::UnsupportedLabel(classes));
        }
        Ok(codec)
    }

    fn classes(&self) -> Vec<String> {
        match self {
            Self::Numeric(v) => v.iter().map(|x| x.to_string()).collect(),
            Self::Text(v) => v.clone(),
            Self::Continuous => Vec::new(),
        }
    }

    fn encode(&self, cell: &str) -> Option<f64> {
        let cell = cell.trim();
        match self {
            Self::Numeric(v) => {
                let x = cell.parse::<f64>().ok()?;
                v.iter().position(|c| *c == x).map(|i| i as f64)
            }
            Self::Text(v) => v.iter().position(|c| c == cell).map(|i| i as f64),
            Self::Continuous => cell.parse::<f64>().ok().filter(|x| x.is_finite()),
        }
    }
}

/// 数据集构建器. 持有已校验的表结构.
#[derive(Clone, Debug)]
pub struct DatasetBuilder {
    schema: TableSchema,
    headers: Vec<String>,
    kinds: Vec<(String, ColumnKind)>,
    label: LabelCodec,
}

impl DatasetBuilder {
    /// 校验表结构并推断列类型.
    ///
    /// 所有引用的列都必须存在于 `table` 中. 类型推断只在这里做一次.
    pub fn new(schema: TableSchema, table: &ClinicalTable) -> Result<Self, DatasetError> {
        table.require(&schema.id_column)?;
        let label_col = table
            .column_index(&schema.label_column)
            .ok_or_else(|| DatasetError::MissingLabel(schema.label_column.clone()))?;
        if let Some(g) = &schema.group_column {
            table.require(g)?;
        }
        if let Some(c) = schema
            .categorical_columns
            .iter()
            .find(|c| !schema.clinical_columns.contains(c))
        {
            return Err(DatasetError::UnknownColumn(c.clone()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = schema.clinical_columns.iter().find(|c| !seen.insert(*c)) {
            return Err(DatasetError::DuplicateColumn(dup.clone()));
        }

        let mut kinds = Vec::with_capacity(schema.clinical_columns.len());
        for name in &schema.clinical_columns {
            let col = table.require(name)?;
            let cells: Vec<&str> = (0..table.len())
                .map(|r| table.cell(r, col).trim())
                .filter(|c| !is_missing(c))
                .collect();
            let numeric = cells.iter().all(|c| c.parse::<f64>().is_ok());
            let kind = if numeric && !schema.categorical_columns.contains(name) {
                ColumnKind::Continuous
            } else {
                let mut levels: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
                levels.sort();
                levels.dedup();
                ColumnKind::Categorical { levels }
            };
            kinds.push((name.clone(), kind));
        }

        let label_cells: Vec<&str> = (0..table.len()).map(|r| table.cell(r, label_col)).collect();
        let label = LabelCodec::infer(schema.task, &label_cells)?;

        Ok(Self {
            schema,
            headers: table.headers().to_vec(),
            kinds,
            label,
        })
    }

    /// 表结构.
    #[inline]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// 推断得到的临床列类型.
    #[inline]
    pub fn column_kinds(&self) -> &[(String, ColumnKind)] {
        &self.kinds
    }

    /// 分类任务的类别名. 下标即编码值.
    pub fn classes(&self) -> Vec<String> {
        self.label.classes()
    }

    /// 特征列名, 检查所有特征向量一致.
    fn feature_names(&self, vectors: &[FeatureVector]) -> Result<Vec<String>, DatasetError> {
        let Some(first) = vectors.first() else {
            return Err(DatasetError::NoFeatures);
        };
        for v in vectors {
            if v.config_hash != first.config_hash {
                return Err(DatasetError::InconsistentFeatures {
                    case_id: v.case_id.clone(),
                    reason: format!("config hash `{}` != `{}`", v.config_hash, first.config_hash),
                });
            }
            if !v.names().eq(first.names()) {
                return Err(DatasetError::InconsistentFeatures {
                    case_id: v.case_id.clone(),
                    reason: "feature names differ".into(),
                });
            }
        }
        let all: Vec<String> = first.names().map(String::from).collect();
        let names = match &self.schema.feature_columns {
            Some(wanted) => {
                if let Some(w) = wanted.iter().find(|w| !all.contains(w)) {
                    return Err(DatasetError::UnknownColumn(w.clone()));
                }
                wanted.clone()
            }
            None => all,
        };
        if names.is_empty() {
            return Err(DatasetError::NoFeatures);
        }
        Ok(names)
    }

    /// 按案例标识连接案例, 特征向量和临床表格.
    ///
    /// `failures` 中的案例以 "提取失败" 记录到丢弃日志; 缺少特征向量或标签的案例同样被丢弃.
    /// 结果按案例标识升序排列, 与输入顺序无关.
    pub fn build<'a, I>(
        &self,
        case_ids: I,
        vectors: &[FeatureVector],
        failures: &[ExtractionError],
        table: &ClinicalTable,
    ) -> Result<Dataset, DatasetError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if table.headers() != self.headers.as_slice() {
            return Err(DatasetError::SchemaMismatch);
        }
        let feature_names = self.feature_names(vectors)?;

        let mut by_id: HashMap<&str, &FeatureVector> = HashMap::with_capacity(vectors.len());
        for v in vectors {
            if by_id.insert(v.case_id.as_str(), v).is_some() {
                return Err(DatasetError::DuplicateCase(v.case_id.clone()));
            }
        }
        let failed: HashMap<&str, &ExtractionError> = failures
            .iter()
            .filter_map(|e| e.case_id().map(|id| (id, e)))
            .collect();

        let id_col = table.require(&self.schema.id_column)?;
        let label_col = table.require(&self.schema.label_column)?;
        let group_col = match &self.schema.group_column {
            Some(g) => Some(table.require(g)?),
            None => None,
        };
        let mut rows_by_id: HashMap<&str, usize> = HashMap::with_capacity(table.len());
        for r in 0..table.len() {
            let id = table.cell(r, id_col).trim();
            if rows_by_id.insert(id, r).is_some() {
                return Err(DatasetError::DuplicateCase(id.to_owned()));
            }
        }
        let clinical_cols = self
            .kinds
            .iter()
            .map(|(n, _)| table.require(n))
            .collect::<Result<Vec<_>, _>>()?;

        let mut ids: Vec<&str> = case_ids.into_iter().collect();
        ids.sort_unstable();
        if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(DatasetError::DuplicateCase(w[0].to_owned()));
        }

        let mut columns: Vec<Column> = feature_names
            .iter()
            .map(|n| Column {
                name: n.clone(),
                role: ColumnRole::Radiomic,
            })
            .collect();
        for (name, kind) in &self.kinds {
            match kind {
                ColumnKind::Continuous => columns.push(Column {
                    name: name.clone(),
                    role: ColumnRole::Clinical,
                }),
                ColumnKind::Categorical { levels } => columns.extend(levels.iter().map(|l| Column {
                    name: format!("{name}_{l}"),
                    role: ColumnRole::Clinical,
                })),
            }
        }

        let mut drop_log = DropLog::default();
        let mut kept_ids = Vec::new();
        let mut groups = Vec::new();
        let mut labels = Vec::new();
        let mut flat = Vec::new();
        'cases: for id in ids {
            if let Some(e) = failed.get(id) {
                drop_log.push(id, DropReason::ExtractionFailed { error: e.to_string() });
                continue;
            }
            let Some(vector) = by_id.get(id) else {
                drop_log.push(id, DropReason::MissingFeatures);
                continue;
            };
            let Some(&r) = rows_by_id.get(id) else {
                drop_log.push(id, DropReason::MissingLabel);
                continue;
            };
            let label_cell = table.cell(r, label_col);
            if is_missing(label_cell) {
                drop_log.push(id, DropReason::MissingLabel);
                continue;
            }
            let label = self.label.encode(label_cell).ok_or_else(|| DatasetError::InvalidLabel {
                case_id: id.to_owned(),
                value: label_cell.to_owned(),
            })?;
            let group = match group_col {
                Some(g) if is_missing(table.cell(r, g)) => {
                    drop_log.push(id, DropReason::MissingGroup);
                    continue;
                }
                Some(g) => table.cell(r, g).trim().to_owned(),
                None => id.to_owned(),
            };

            let mut row: Vec<f64> = feature_names
                .iter()
                .map(|n| vector.get(n).unwrap_or(f64::NAN))
                .collect();
            for ((name, kind), col) in self.kinds.iter().zip(&clinical_cols) {
                let cell = table.cell(r, *col).trim();
                if is_missing(cell) {
                    drop_log.push(id, DropReason::MissingClinical { column: name.clone() });
                    continue 'cases;
                }
                match kind {
                    ColumnKind::Continuous => row.push(cell.parse::<f64>().unwrap_or(f64::NAN)),
                    ColumnKind::Categorical { levels } => {
                        row.extend(levels.iter().map(|l| if l == cell { 1.0 } else { 0.0 }))
                    }
                }
            }

            kept_ids.push(id.to_owned());
            groups.push(group);
            labels.push(label);
            flat.extend(row);
        }

        if kept_ids.is_empty() {
            return Err(DatasetError::Empty);
        }
        log::info!(
            "dataset built: {} case(s), {} column(s), {} dropped",
            kept_ids.len(),
            columns.len(),
            drop_log.len()
        );

        let n = kept_ids.len();
        let x = Array2::from_shape_vec((n, columns.len()), flat).map_err(|e| DatasetError::Parse {
            line: 0,
            reason: e.to_string(),
        })?;
        Ok(Dataset {
            task: self.schema.task,
            classes: self.label.classes(),
            columns,
            ids: kept_ids,
            groups,
            labels: Array1::from(labels),
            x,
            drop_log,
        })
    }
}
