//! One end-to-end run: load, build, train, export, plot.

use std::time::Instant;

use anyhow::{Context, Result};
use log::{info, warn};
use tch::{nn, Device};

use crate::config::TrainConfig;
use crate::data::load_splits;
use crate::export::{export_model, ArtifactMeta, ExportReport};
use crate::model::pretrained::load_pretrained_backbone;
use crate::model::{DefectNet, HeadConfig, BACKBONE_PREFIX};
use crate::report::plot_history;
use crate::train::{History, Trainer};

#[derive(Debug)]
pub enum PipelineOutcome {
    /// The dataset root does not exist; nothing was trained or written.
    DatasetMissing,
    Completed {
        export: ExportReport,
        frozen: History,
        fine_tune: History,
        class_names: Vec<String>,
    },
}

pub fn run(cfg: &TrainConfig) -> Result<PipelineOutcome> {
    let start_time = Instant::now();
    tch::manual_seed(cfg.seed as i64);
    tch::set_num_threads(num_cpus::get() as i32);
    let device = Device::cuda_if_available();
    info!("Using device: {:?} | threads: {}", device, num_cpus::get());

    if !cfg.dataset_path.exists() {
        println!("❌ Dataset not found at: {}", cfg.dataset_path.display());
        println!("Expected layout:");
        println!("  {}/train/<class>/*.jpg", cfg.dataset_path.display());
        println!("  {}/val/<class>/*.jpg", cfg.dataset_path.display());
        return Ok(PipelineOutcome::DatasetMissing);
    }

    let data = load_splits(&cfg.dataset_path, cfg.img_size, cfg.num_classes, cfg.seed)
        .with_context(|| format!("loading dataset from {}", cfg.dataset_path.display()))?;
    info!("📊 Dataset summary:");
    info!("  Train: {} images", data.train.len());
    info!("  Val:   {} images", data.val.len());
    info!("  Classes ({}): {:?}", data.class_names.len(), data.class_names);

    let mut vs = nn::VarStore::new(device);
    let head = HeadConfig {
        dropout: cfg.head_dropout,
        hidden: cfg.hidden_units,
        hidden_dropout: cfg.hidden_dropout,
    };
    let net = DefectNet::new(&vs.root(), cfg.variant, cfg.num_classes as i64, head, false)
        .with_normalization(cfg.normalization);
    info!(
        "🧠 Built {} backbone ({} layers) + dense head, input normalization {}",
        net.backbone().variant(),
        net.backbone().layers().len(),
        net.normalization().name()
    );

    match &cfg.pretrained_path {
        Some(path) => {
            let copied = load_pretrained_backbone(&mut vs, cfg.variant, BACKBONE_PREFIX, path)
                .with_context(|| format!("loading pretrained backbone from {}", path.display()))?;
            info!("✓ Loaded pretrained base (copied {copied}) from {}", path.display());
        }
        None => warn!("⚠ No pretrained weights configured; backbone starts from random init"),
    }

    let mut trainer = Trainer::new(vs, net, cfg);
    trainer.run(&data).context("training")?;

    let meta = ArtifactMeta {
        labels: data.class_names.clone(),
        variant: trainer.net().backbone().variant(),
        img_size: cfg.img_size,
        hidden: cfg.hidden_units,
        normalization: trainer.net().normalization(),
    };
    let export = export_model(&trainer, &meta, &cfg.model_path)
        .with_context(|| format!("exporting to {}", cfg.model_path.display()))?;
    info!("✅ Model saved: {}", export.path.display());
    info!(
        "📦 Size: {:.2} MB (f32: {:.2} MB)",
        export.size_mib(),
        export.unquantized_mib()
    );

    let plotted = plot_history(trainer.frozen_history(), trainer.fine_tune_history(), &cfg.plot_path)
        .with_context(|| format!("writing {}", cfg.plot_path.display()))?;
    info!("📈 Plotted {plotted} epochs to {}", cfg.plot_path.display());
    info!("⏱ Total time: {:.2}s", start_time.elapsed().as_secs_f64());

    let (_, _, frozen, fine_tune) = trainer.into_parts();
    Ok(PipelineOutcome::Completed {
        export,
        frozen,
        fine_tune,
        class_names: data.class_names,
    })
}
