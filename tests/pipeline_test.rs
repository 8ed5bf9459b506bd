use std::path::Path;
use std::sync::Mutex;

use defect_classifier::{
    run, DefectClassifier, InspectionKind, Normalization, PipelineOutcome, TrainConfig, CLASS_NAMES,
};
use env_logger::{Builder, Env};
use image::{Rgb, RgbImage};

// tch seeds a process-wide generator; runs must not interleave
static RUN_LOCK: Mutex<()> = Mutex::new(());

fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

fn write_split(root: &Path, split: &str, per_class: usize) {
    for (c, name) in CLASS_NAMES.iter().enumerate() {
        let dir = root.join(split).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let base = (c * 20) as u8;
            let img = RgbImage::from_fn(20, 20, |x, y| {
                Rgb([base, base.wrapping_add((x * 3) as u8), (y * 5 + i as u32) as u8])
            });
            img.save(dir.join(format!("{i}.png"))).unwrap();
        }
    }
}

fn synthetic_dataset(root: &Path) {
    write_split(root, "train", 3);
    write_split(root, "val", 1);
}

fn small_config(dataset: &Path, out: &Path) -> TrainConfig {
    TrainConfig::default()
        .with_img_size(32)
        .with_batch_size(8)
        .with_epochs(2, 1)
        .with_dataset_path(dataset)
        .with_pretrained_path(None)
        .with_output_dir(out)
}

#[test]
fn missing_dataset_root_writes_nothing() {
    init();
    let _lock = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = tempfile::tempdir().unwrap();
    let cfg = small_config(&tmp.path().join("nope"), &tmp.path().join("out"));

    let outcome = run(&cfg).unwrap();
    assert!(matches!(outcome, PipelineOutcome::DatasetMissing));
    assert!(!cfg.model_path.exists());
    assert!(!cfg.plot_path.exists());
}

#[test]
fn missing_or_empty_split_is_an_error() {
    init();
    let _lock = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("dataset");
    write_split(&root, "train", 1);

    let cfg = small_config(&root, &tmp.path().join("out"));
    assert!(run(&cfg).is_err());

    for name in CLASS_NAMES {
        std::fs::create_dir_all(root.join("val").join(name)).unwrap();
    }
    assert!(run(&cfg).is_err());
    assert!(!cfg.model_path.exists());
}

#[test]
fn full_run_exports_model_and_chart() {
    init();
    let _lock = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("dataset");
    synthetic_dataset(&root);
    let cfg = small_config(&root, &tmp.path().join("out"));

    let outcome = run(&cfg).unwrap();
    let PipelineOutcome::Completed { export, frozen, fine_tune, class_names } = outcome else {
        panic!("pipeline did not complete");
    };

    let size = std::fs::metadata(&cfg.model_path).unwrap().len() as usize;
    assert!(size > 0);
    assert_eq!(size, export.bytes);
    assert!(export.bytes < export.unquantized_bytes);

    assert!(cfg.plot_path.exists());
    assert_eq!(frozen.len() + fine_tune.len(), cfg.total_epochs());

    let mut sorted: Vec<String> = CLASS_NAMES.iter().map(|s| s.to_string()).collect();
    sorted.sort();
    assert_eq!(class_names, sorted);

    let clf = DefectClassifier::load(&cfg.model_path).unwrap();
    assert_eq!(clf.normalization(), Normalization::ImageNet);
    let img = image::open(root.join("val").join(CLASS_NAMES[3]).join("0.png")).unwrap();
    let out = clf.classify(&img, None).unwrap();
    assert_eq!(out.probabilities.len(), 12);
    let total: f32 = out.probabilities.iter().sum();
    approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-2);

    let scratch = clf.classify(&img, Some(InspectionKind::Scratch)).unwrap();
    assert_eq!(scratch.class.unwrap().kind(), InspectionKind::Scratch);
}

#[test]
fn same_seed_gives_close_validation_accuracy() {
    init();
    let _lock = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("dataset");
    synthetic_dataset(&root);

    let mut accs = Vec::new();
    for run_idx in 0..2 {
        let cfg = small_config(&root, &tmp.path().join(format!("out{run_idx}"))).with_epochs(1, 1);
        match run(&cfg).unwrap() {
            PipelineOutcome::Completed { fine_tune, .. } => {
                accs.push(fine_tune.last().unwrap().val_accuracy)
            }
            PipelineOutcome::DatasetMissing => panic!("dataset should exist"),
        }
    }
    approx::assert_abs_diff_eq!(accs[0], accs[1], epsilon = 0.1);
}
