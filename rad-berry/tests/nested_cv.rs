//! 嵌套交叉验证的端到端测试.

use std::fs;
use std::path::Path;

use ndarray::{s, Array3};
use rad_berry::dataset::DropReason;
use rad_berry::eval::EvaluationResult;
use rad_berry::model::forest::ForestParams;
use rad_berry::model::linear::LinearParams;
use rad_berry::prelude::*;

fn init_logger() {
    let _ = simple_logger::init_with_level(log::Level::Warn);
}

/// 第 i 个合成案例. 阳性案例 ROI 内强度整体偏高; ROI 宽度随 i 变化.
fn phantom(i: usize, positive: bool, empty: bool) -> LoadedCase {
    let offset = if positive { 60.0 } else { 0.0 };
    let img = Array3::from_shape_fn((6, 8, 8), |(z, h, w)| ((z * 7 + h * 3 + w * 5 + i) % 50) as f32 * 4.0 + offset);
    let mut m = Array3::<u8>::zeros((6, 8, 8));
    if !empty {
        m.slice_mut(s![1..5, 2..6, 1..(5 + i % 3)]).fill(1);
    }
    LoadedCase {
        case_id: format!("c{i:02}"),
        image: ImageVolume::from_parts(img, [2.0, 0.8, 0.8]),
        mask: RoiMask::from_parts(m, [2.0, 0.8, 0.8]),
    }
}

/// 32 个案例, 16 位患者 (每人两例), 患者标签交替; 另有一个空掩膜案例 `c99`.
fn cohort() -> (Vec<LoadedCase>, ClinicalTable) {
    let mut cases = Vec::new();
    let mut csv = String::from("ID,patient,y\n");
    for i in 0..32 {
        let label = (i / 2) % 2;
        cases.push(phantom(i, label == 1, false));
        csv.push_str(&format!("c{i:02},p{},{label}\n", i / 2));
    }
    cases.push(phantom(99, true, true));
    csv.push_str("c99,p99,1\n");
    (cases, ClinicalTable::parse(&csv).unwrap())
}

fn schema() -> TableSchema {
    serde_json::from_str(r#"{"id_column": "ID", "label_column": "y", "group_column": "patient"}"#).unwrap()
}

fn config() -> RunConfig {
    let mut cfg = RunConfig::new(
        schema(),
        vec![
            ModelSpec::Linear(LinearParams::default()),
            ModelSpec::Forest(ForestParams {
                n_trees: 15,
                ..Default::default()
            }),
        ],
    );
    cfg.split_strategy = SplitStrategy::StratifiedGroupedKFold;
    cfg.n_folds = 4;
    cfg.inner_folds = 2;
    cfg.target_feature_count = 5;
    cfg.bootstrap.n_resamples = 100;
    cfg
}

fn no_partial_dirs(dir: &Path) -> bool {
    fs::read_dir(dir)
        .unwrap()
        .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".partial"))
}

/// 提取, 构建, 划分, 选择, 搜索, 评估全流程.
#[test]
fn test_nested_cv_on_synthetic_volumes() {
    init_logger();
    let (cases, table) = cohort();
    let dir = tempfile::tempdir().unwrap();
    let paths = RunPaths::new(dir.path(), dir.path().join("results"));
    let report = Orchestrator::new(config(), paths.clone())
        .unwrap()
        .run_loaded(&cases, &table)
        .unwrap();

    assert_eq!(report.n_cases, 32);
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].case_id, "c99");
    assert!(matches!(
        &report.dropped[0].reason,
        DropReason::ExtractionFailed { error } if error.contains("no ROI")
    ));

    assert_eq!(report.completed_folds(), vec![0, 1, 2, 3]);
    assert!(!report.is_partial());
    for f in &report.folds {
        assert!(f.selected_features.len() <= 5 && !f.selected_features.is_empty());
    }
    for name in ["linear", "forest"] {
        let m = &report.models[name];
        assert_eq!(m.aggregate.folds, vec![0, 1, 2, 3]);
        let auc = m.aggregate.pooled["auc"].value.unwrap();
        assert!(auc > 0.9, "{name}: pooled auc {auc}");
        for k in 0..4 {
            assert!(paths.fold_dir(k).join(format!("model_{name}.bin.gz")).is_file());
        }
    }
    assert!(paths.result("extracted_features.csv").is_file());
    assert!(no_partial_dirs(&paths.results_dir));
}

fn build_dataset() -> Dataset {
    let (cases, table) = cohort();
    let ex = Extractor::new(ExtractionConfig::default()).unwrap();
    let report = rad_berry::extract::extract_loaded(&ex, &cases, &CancelToken::new());
    DatasetBuilder::new(schema(), &table)
        .unwrap()
        .build(
            cases.iter().map(|c| c.case_id.as_str()),
            &report.vectors,
            &report.failures,
            &table,
        )
        .unwrap()
}

/// 重新加载保存的模型, 在测试行上的输出与评估结果一致.
#[test]
fn test_saved_models_reproduce_predictions() {
    let ds = build_dataset();
    let dir = tempfile::tempdir().unwrap();
    let paths = RunPaths::new(dir.path(), dir.path());
    Orchestrator::new(config(), paths.clone())
        .unwrap()
        .run_dataset(&ds)
        .unwrap();

    let plan = SplitPlan::load(paths.result("splits.json")).unwrap();
    assert!(plan.is_leakage_free(&ds));
    for fold in &plan.folds {
        let k = fold.outer.fold;
        let model = TrainedModel::load(paths.fold_dir(k).join("model_linear.bin.gz")).unwrap();
        let rows = EvalRows::from_split(&ds, &fold.outer, Partition::Test);
        let scores = model.predict_score(rows.dataset()).unwrap();

        let text = fs::read_to_string(paths.fold_dir(k).join("evaluation_linear.json")).unwrap();
        let eval: EvaluationResult = serde_json::from_str(&text).unwrap();
        assert_eq!(eval.n_cases, rows.len());
        for (p, s) in eval.predictions.iter().zip(&scores) {
            assert!((p.score - s).abs() < 1e-9, "{}: {} vs {s}", p.case_id, p.score);
        }
    }
}

/// 外层折并行与否, 结果相同.
#[test]
fn test_parallel_folds_are_deterministic() {
    let ds = build_dataset();
    let run = |parallel: bool| {
        let mut cfg = config();
        cfg.parallel_folds = parallel;
        cfg.save_models = false;
        let dir = tempfile::tempdir().unwrap();
        Orchestrator::new(cfg, RunPaths::new(dir.path(), dir.path()))
            .unwrap()
            .run_dataset(&ds)
            .unwrap()
    };
    assert_eq!(run(true), run(false));
}

/// 所有阳性案例属于同一位患者: 该患者在测试侧的折, 训练部分只有一类.
/// 该折失败, 其余折照常汇总.
#[test]
fn test_degenerate_fold_still_aggregates() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut csv = String::from("ID,patient,y,original_firstorder_Mean,original_shape_Volume\n");
    for i in 0..24 {
        let (patient, y) = if i < 6 { ("P0".to_owned(), 1) } else { (format!("P{i}"), 0) };
        csv.push_str(&format!("c{i:02},{patient},{y},{},{}\n", y * 10 + i % 5, i as f64 * 1.5));
    }
    fs::write(dir.path().join("clinical.csv"), csv).unwrap();

    let mut cfg = RunConfig::new(schema(), vec![ModelSpec::Linear(LinearParams::default())]);
    cfg.split_strategy = SplitStrategy::GroupedKFold;
    cfg.n_folds = 3;
    cfg.inner_folds = 2;
    cfg.bootstrap.n_resamples = 50;
    let paths = RunPaths::new(dir.path(), dir.path().join("results"));
    let report = Orchestrator::new(cfg, paths.clone()).unwrap().run().unwrap();

    assert_eq!(report.n_cases, 24);
    assert!(report.is_partial());
    let failed = report.failed_folds();
    assert_eq!(failed.len(), 1);
    let bad = failed[0].fold;
    assert!(failed[0].error.as_deref().unwrap().contains("label class"));
    assert!(!paths.fold_dir(bad).exists());

    let agg = &report.models["linear"].aggregate;
    assert_eq!(agg.folds.len(), 2);
    assert!(!agg.folds.contains(&bad));
    assert!(agg.per_fold["accuracy"].mean.is_some());
    for k in &agg.folds {
        assert!(paths.fold_dir(*k).join("evaluation_linear.json").is_file());
    }
    assert!(no_partial_dirs(&paths.results_dir));
    assert_eq!(RunReport::load(paths.result("report.json")).unwrap().failed_folds().len(), 1);
}
