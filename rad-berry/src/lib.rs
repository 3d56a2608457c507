#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 从 nii 体数据和 ROI 掩膜提取影像组学特征, 并在得到的表格数据上运行
//! 可配置的嵌套交叉验证建模流程 (特征选择, 模型训练, 评估).
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 不存在任何全局状态: 配置, 目录和种子都是显式参数, 核心库不读取环境变量.
//! 2. 特征选择与拟合只接受训练行 ([`select::TrainRows`]), 测试行不可能混入训练.
//! 3. 同一配置和种子下, 无论外层折是否并行, 结果逐位一致.
//!
//! # 开发计划
//!
//! ### 特征提取 ✅
//!
//! 一阶统计, 形状, GLCM 三类特征; 预处理过滤器 (归一化, 重采样, 强度窗口);
//! 固定箱宽 / 固定箱数离散化. 批量提取在 `rayon` feature 下并行.
//!
//! 实现位于 `rad-berry/src/extract`.
//!
//! ### 数据集构建 ✅
//!
//! 影像清单, 临床表格, 表结构校验与列类型推断, 丢弃日志.
//!
//! 实现位于 `rad-berry/src/dataset`.
//!
//! ### 可复现划分 ✅
//!
//! 留出, 分层 k 折, 分组 k 折, 分层分组 k 折, 预定义测试集; 划分方案文件.
//!
//! 实现位于 `rad-berry/src/split`.
//!
//! ### 特征选择 ✅
//!
//! F 检验, 相关性过滤, Lasso, 随机森林重要性.
//!
//! 实现位于 `rad-berry/src/select`.
//!
//! ### 模型与评估 ✅
//!
//! 线性模型, 随机森林, RBF 核模型的纯 Rust 实现; 自助法置信区间.
//!
//! 实现位于 `rad-berry/src/model`, `rad-berry/src/eval`.
//!
//! ### 嵌套交叉验证 ✅
//!
//! 内层超参数搜索, 外层折并行, 折级失败隔离, 取消与结果目录.
//!
//! 实现位于 `rad-berry/src/pipeline`.
//!
//! ### 多分类 ⌛️
//!
//! 目前分类任务只支持二分类.

/// 三维索引 (z, H, W).
pub type Idx3d = (usize, usize, usize);

/// 体素分辨率 (z, H, W), 单位 mm.
pub type Spacing = [f64; 3];

pub mod cancel;
pub mod consts;

/// nii 体数据与掩膜.
pub mod data;

pub mod dataset;
pub mod eval;
pub mod extract;
pub mod model;
pub mod pipeline;
pub mod prelude;
pub mod rng;
pub mod select;
pub mod split;

pub use cancel::CancelToken;
pub use data::{ImageVolume, RoiMask, VolumeAttr};
