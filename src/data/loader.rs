use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::DynamicImage;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::DatasetError;
use crate::taxonomy::DefectClass;

const IMAGE_EXTENSIONS: [&str; 5] = ["bmp", "gif", "jpeg", "jpg", "png"];

/// One cached image: RGB bytes in HWC order at the collection's resolution.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pixels: Vec<u8>,
    pub label: usize,
}

#[derive(Debug, Clone)]
pub struct ImageSet {
    pub samples: Vec<Sample>,
    pub img_size: u32,
}

impl ImageSet {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageSet,
    pub val: ImageSet,
    /// Directory-alphabetical order; index = one-hot position.
    pub class_names: Vec<String>,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let entries = fs::read_dir(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();
    Ok(paths)
}

/// Class names of a split: its subdirectories, sorted.
pub fn list_classes(split_dir: &Path) -> Result<Vec<String>, DatasetError> {
    let classes = read_dir_sorted(split_dir)?
        .into_iter()
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(|s| s.to_string()))
        .collect();
    Ok(classes)
}

fn decode(path: &Path, img_size: u32) -> Result<Vec<u8>, DatasetError> {
    let img = image::open(path).map_err(|source| DatasetError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(to_pixels(&img, img_size))
}

/// Square-resized RGB bytes in HWC order, as cached for training.
pub fn to_pixels(img: &DynamicImage, img_size: u32) -> Vec<u8> {
    img.resize_exact(img_size, img_size, FilterType::Triangle)
        .to_rgb8()
        .into_raw()
}

fn split_dir(root: &Path, split: &'static str) -> Result<PathBuf, DatasetError> {
    let path = root.join(split);
    if !path.is_dir() {
        return Err(DatasetError::MissingSplit { split, path });
    }
    Ok(path)
}

fn load_split(
    dir: &Path,
    split: &'static str,
    classes: &[String],
    img_size: u32,
) -> Result<ImageSet, DatasetError> {
    info!("📸 Loading {} dataset from {}", split, dir.display());

    let mut samples = Vec::new();
    for (class_idx, class_name) in classes.iter().enumerate() {
        let class_dir = dir.join(class_name);
        let img_paths: Vec<PathBuf> = read_dir_sorted(&class_dir)?
            .into_iter()
            .filter(|p| p.is_file() && is_image(p))
            .collect();

        info!("  Class {}: {} ({} images)", class_idx, class_name, img_paths.len());

        let decoded: Vec<Sample> = img_paths
            .par_iter()
            .map(|p| {
                decode(p, img_size).map(|pixels| Sample {
                    pixels,
                    label: class_idx,
                })
            })
            .collect::<Result<_, _>>()?;
        samples.extend(decoded);
    }

    if samples.is_empty() {
        return Err(DatasetError::EmptySplit {
            split,
            path: dir.to_path_buf(),
        });
    }
    info!("✓ Loaded {} {} images", samples.len(), split);
    Ok(ImageSet { samples, img_size })
}

/// Loads `root/train` and `root/val`.
///
/// Labels come from the `train` subdirectories in alphabetical order. The
/// training samples are shuffled once with `seed`; validation keeps file
/// order.
pub fn load_splits(
    root: &Path,
    img_size: u32,
    num_classes: usize,
    seed: u64,
) -> Result<DatasetSplits, DatasetError> {
    let train_dir = split_dir(root, "train")?;
    let val_dir = split_dir(root, "val")?;

    let class_names = list_classes(&train_dir)?;
    let val_classes = list_classes(&val_dir)?;

    let train_set: BTreeSet<_> = class_names.iter().collect();
    let val_set: BTreeSet<_> = val_classes.iter().collect();
    if train_set != val_set {
        return Err(DatasetError::ClassMismatch {
            train: class_names,
            val: val_classes,
        });
    }
    if class_names.len() != num_classes {
        return Err(DatasetError::ClassCount {
            found: class_names.len(),
            expected: num_classes,
        });
    }
    for name in &class_names {
        if DefectClass::from_label(name).is_none() {
            warn!("⚠ Class directory '{}' is not part of the defect taxonomy", name);
        }
    }

    let mut train = load_split(&train_dir, "train", &class_names, img_size)?;
    let val = load_split(&val_dir, "val", &class_names, img_size)?;

    let mut rng = StdRng::seed_from_u64(seed);
    train.samples.shuffle(&mut rng);

    Ok(DatasetSplits {
        train,
        val,
        class_names,
    })
}
