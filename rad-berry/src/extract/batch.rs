//! 批量特征提取.
//!
//! 案例之间互相独立, 开启 `rayon` feature 时并行处理. 结果总是按案例标识排序,
//! 与完成顺序无关. 单个案例失败只会使该案例被排除, 不影响其它案例.

use super::{ExtractionError, Extractor, FeatureVector};
use crate::cancel::CancelToken;
use crate::data::{ImageVolume, RoiMask};
use crate::dataset::CaseRecord;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 已加载到内存的案例.
#[derive(Debug, Clone)]
pub struct LoadedCase {
    /// 案例标识.
    pub case_id: String,
    /// 影像.
    pub image: ImageVolume,
    /// 掩膜.
    pub mask: RoiMask,
}

/// 批量提取结果.
#[derive(Debug, Clone, Default)]
pub struct ExtractionReport {
    /// 成功的特征向量, 按案例标识升序.
    pub vectors: Vec<FeatureVector>,
    /// 失败的案例, 按案例标识升序.
    pub failures: Vec<ExtractionError>,
    /// 是否因取消而跳过了部分案例.
    pub cancelled: bool,
}

impl ExtractionReport {
    /// 失败案例的标识.
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().filter_map(|e| e.case_id())
    }
}

/// 对每个元素执行 `op`, 已取消时跳过. 开启 `rayon` 时并行.
fn run_each<T, F>(items: &[T], cancel: &CancelToken, op: F) -> Vec<Option<Result<FeatureVector, ExtractionError>>>
where
    T: Sync,
    F: Fn(&T) -> Result<FeatureVector, ExtractionError> + Sync + Send,
{
    let step = |item: &T| (!cancel.is_cancelled()).then(|| op(item));
    #[cfg(feature = "rayon")]
    let results = items.par_iter().map(step).collect();
    #[cfg(not(feature = "rayon"))]
    let results = items.iter().map(step).collect();
    results
}

fn collect_report(results: Vec<Option<Result<FeatureVector, ExtractionError>>>) -> ExtractionReport {
    let mut report = ExtractionReport::default();
    for r in results {
        match r {
            Some(Ok(v)) => report.vectors.push(v),
            Some(Err(e)) => {
                log::warn!("feature extraction failed: {e}");
                report.failures.push(e);
            }
            None => report.cancelled = true,
        }
    }
    report.vectors.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    report
        .failures
        .sort_by(|a, b| a.case_id().cmp(&b.case_id()));

    log::info!(
        "extracted {} case(s), {} failed{}",
        report.vectors.len(),
        report.failures.len(),
        if report.cancelled { ", cancelled" } else { "" }
    );
    report
}

/// 打开 `records` 中的 nii 文件并逐个提取特征.
pub fn extract_batch(extractor: &Extractor, records: &[CaseRecord], cancel: &CancelToken) -> ExtractionReport {
    let results = run_each(records, cancel, |rec| {
        let (image, mask) = rec.open()?;
        extractor.extract(&rec.case_id, &image, &mask)
    });
    collect_report(results)
}

/// 对已加载的案例提取特征.
pub fn extract_loaded(extractor: &Extractor, cases: &[LoadedCase], cancel: &CancelToken) -> ExtractionReport {
    let results = run_each(cases, cancel, |c| {
        extractor.extract(&c.case_id, &c.image, &c.mask)
    });
    collect_report(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractionConfig;
    use ndarray::{s, Array3};

    fn case(id: &str, empty: bool) -> LoadedCase {
        let img = Array3::from_shape_fn((4, 6, 6), |(z, h, w)| (z + h * w) as f32 * 10.0);
        let mut m = Array3::<u8>::zeros((4, 6, 6));
        if !empty {
            m.slice_mut(s![1..3, 1..5, 1..5]).fill(1);
        }
        LoadedCase {
            case_id: id.into(),
            image: ImageVolume::from_parts(img, [1.0; 3]),
            mask: RoiMask::from_parts(m, [1.0; 3]),
        }
    }

    /// 输出顺序与输入顺序无关, 失败案例被单独收集.
    #[test]
    fn test_batch_sorted_and_isolated() {
        let ex = Extractor::new(ExtractionConfig::default()).unwrap();
        let cases = vec![case("c", false), case("a", false), case("b", true)];
        let report = extract_loaded(&ex, &cases, &CancelToken::new());
        let ids: Vec<&str> = report.vectors.iter().map(|v| v.case_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(report.failed_ids().collect::<Vec<_>>(), vec!["b"]);
        assert!(!report.cancelled);
        assert!(report.vectors[0].names().eq(report.vectors[1].names()));
    }

    #[test]
    fn test_batch_unreadable_file() {
        let ex = Extractor::new(ExtractionConfig::default()).unwrap();
        let rec = CaseRecord::new("x", "/nonexistent/img.nii.gz", "/nonexistent/mask.nii.gz");
        let report = extract_batch(&ex, &[rec], &CancelToken::new());
        assert!(report.vectors.is_empty());
        assert!(matches!(
            report.failures[0],
            ExtractionError::Unreadable { .. }
        ));
    }

    #[test]
    fn test_batch_cancelled() {
        let ex = Extractor::new(ExtractionConfig::default()).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let report = extract_loaded(&ex, &[case("a", false)], &token);
        assert!(report.cancelled);
        assert!(report.vectors.is_empty());
    }
}
