//! Mobile export: batch-norm folding, dropout removal and `f16` storage in a
//! single safetensors file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use half::f16;
use safetensors::tensor::{Dtype, TensorView};
use tch::{Device, Kind, Tensor};

use crate::error::ExportError;
use crate::model::blocks::BN_EPS;
use crate::model::{BackboneVariant, DefectNet, Normalization, BACKBONE_PREFIX};
use crate::train::{Phase, Trainer};

pub const META_LABELS: &str = "labels";
pub const META_BACKBONE: &str = "backbone";
pub const META_INPUT_SIZE: &str = "input_size";
pub const META_HIDDEN: &str = "head_hidden";
pub const META_NORMALIZATION: &str = "normalization";

/// What an exported artifact says about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactMeta {
    /// Index order of the output probabilities.
    pub labels: Vec<String>,
    pub variant: BackboneVariant,
    pub img_size: u32,
    pub hidden: i64,
    pub normalization: Normalization,
}

impl ArtifactMeta {
    pub fn to_map(&self) -> Result<HashMap<String, String>, ExportError> {
        let mut map = HashMap::new();
        map.insert(META_LABELS.to_string(), serde_json::to_string(&self.labels)?);
        map.insert(META_BACKBONE.to_string(), self.variant.name().to_string());
        map.insert(META_INPUT_SIZE.to_string(), self.img_size.to_string());
        map.insert(META_HIDDEN.to_string(), self.hidden.to_string());
        map.insert(META_NORMALIZATION.to_string(), self.normalization.name().to_string());
        Ok(map)
    }

    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            labels: serde_json::from_str(map.get(META_LABELS)?).ok()?,
            variant: BackboneVariant::from_name(map.get(META_BACKBONE)?)?,
            img_size: map.get(META_INPUT_SIZE)?.parse().ok()?,
            hidden: map.get(META_HIDDEN)?.parse().ok()?,
            normalization: Normalization::from_name(map.get(META_NORMALIZATION)?)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    pub bytes: usize,
    /// Size the same folded graph takes with `f32` weights.
    pub unquantized_bytes: usize,
    pub tensors: usize,
}

impl ExportReport {
    pub fn size_mib(&self) -> f64 {
        self.bytes as f64 / 1024.0 / 1024.0
    }

    pub fn unquantized_mib(&self) -> f64 {
        self.unquantized_bytes as f64 / 1024.0 / 1024.0
    }
}

fn backbone_layer(name: &str) -> Option<&str> {
    name.strip_prefix(BACKBONE_PREFIX)?.strip_prefix('.')?.split('.').next()
}

fn get<'a>(vars: &'a HashMap<String, Tensor>, name: &str) -> Result<&'a Tensor, ExportError> {
    vars.get(name).ok_or_else(|| ExportError::MissingTensor(name.to_string()))
}

/// Rewrites every `conv → batch-norm` pair as one biased convolution and
/// copies the remaining parameters. Batch-norm tensors are dropped.
pub fn fold_batch_norm(
    vars: &HashMap<String, Tensor>,
    net: &DefectNet,
) -> Result<BTreeMap<String, Tensor>, ExportError> {
    let _guard = tch::no_grad_guard();
    let folds = net.backbone().layers().folds();
    let consumed: BTreeSet<&str> = folds
        .iter()
        .flat_map(|(conv, bn)| [conv.as_str(), bn.as_str()])
        .collect();

    let mut out = BTreeMap::new();
    for (conv, bn) in folds {
        let w = get(vars, &format!("{BACKBONE_PREFIX}.{conv}.weight"))?;
        let gamma = get(vars, &format!("{BACKBONE_PREFIX}.{bn}.weight"))?;
        let beta = get(vars, &format!("{BACKBONE_PREFIX}.{bn}.bias"))?;
        let mean = get(vars, &format!("{BACKBONE_PREFIX}.{bn}.running_mean"))?;
        let var = get(vars, &format!("{BACKBONE_PREFIX}.{bn}.running_var"))?;

        let scale = gamma / (var + BN_EPS).sqrt();
        let folded_w = w * scale.view([-1, 1, 1, 1]);
        let folded_b = beta - mean * &scale;
        out.insert(format!("{BACKBONE_PREFIX}.{conv}.weight"), folded_w.detach());
        out.insert(format!("{BACKBONE_PREFIX}.{conv}.bias"), folded_b.detach());
    }

    for (name, t) in vars {
        if backbone_layer(name).map_or(false, |layer| consumed.contains(layer)) {
            continue;
        }
        out.insert(name.clone(), t.detach());
    }
    Ok(out)
}

/// Host-side little-endian bytes of `t` in the requested dtype.
fn tensor_bytes(t: &Tensor, dtype: Dtype) -> Result<Vec<u8>, ExportError> {
    let flat = t.to_device(Device::Cpu).to_kind(Kind::Float).reshape([-1]);
    let values = Vec::<f32>::try_from(&flat)?;
    let bytes = match dtype {
        Dtype::F16 => {
            let bits: Vec<u16> = values.iter().map(|&v| f16::from_f32(v).to_bits()).collect();
            bytemuck::cast_slice::<u16, u8>(&bits).to_vec()
        }
        _ => bytemuck::cast_slice::<f32, u8>(&values).to_vec(),
    };
    Ok(bytes)
}

/// Serializes `tensors` as a safetensors buffer with `dtype` weights.
pub fn serialize_tensors(
    tensors: &BTreeMap<String, Tensor>,
    dtype: Dtype,
    meta: &ArtifactMeta,
) -> Result<Vec<u8>, ExportError> {
    let mut encoded = Vec::with_capacity(tensors.len());
    for (name, t) in tensors {
        let shape: Vec<usize> = t.size().iter().map(|&d| d as usize).collect();
        encoded.push((name.clone(), shape, tensor_bytes(t, dtype)?));
    }
    let views = encoded
        .iter()
        .map(|(name, shape, bytes)| Ok((name.clone(), TensorView::new(dtype, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>, ExportError>>()?;
    Ok(safetensors::serialize(views, &Some(meta.to_map()?))?)
}

/// Folds, quantizes to `f16` and writes the artifact, replacing any
/// existing file at `path`.
pub fn export_var_store(
    vars: &HashMap<String, Tensor>,
    net: &DefectNet,
    meta: &ArtifactMeta,
    path: &Path,
) -> Result<ExportReport, ExportError> {
    let folded = fold_batch_norm(vars, net)?;
    let quantized = serialize_tensors(&folded, Dtype::F16, meta)?;
    let unquantized_bytes = serialize_tensors(&folded, Dtype::F32, meta)?.len();

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, &quantized)?;

    Ok(ExportReport {
        path: path.to_path_buf(),
        bytes: quantized.len(),
        unquantized_bytes,
        tensors: folded.len(),
    })
}

/// Exports a trainer that has finished both phases.
pub fn export_model(trainer: &Trainer, meta: &ArtifactMeta, path: &Path) -> Result<ExportReport, ExportError> {
    if trainer.phase() != Phase::Done {
        return Err(ExportError::NotTrained);
    }
    export_var_store(&trainer.var_store().variables(), trainer.net(), meta, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeadConfig;
    use safetensors::SafeTensors;
    use tch::{nn, nn::ModuleT};

    fn meta() -> ArtifactMeta {
        ArtifactMeta {
            labels: vec!["a".into(), "b".into(), "c".into()],
            variant: BackboneVariant::Small,
            img_size: 32,
            hidden: 128,
            normalization: Normalization::ImageNet,
        }
    }

    fn trained_like_net() -> (nn::VarStore, DefectNet) {
        tch::manual_seed(4);
        let vs = nn::VarStore::new(Device::Cpu);
        let net = DefectNet::new(&vs.root(), BackboneVariant::Small, 3, HeadConfig::default(), false);
        // non-trivial batch-norm statistics so folding actually matters
        tch::no_grad(|| {
            for (name, mut t) in vs.variables() {
                if name.ends_with("running_mean") {
                    let _ = t.copy_(&(Tensor::rand_like(&t) * 0.1));
                } else if name.ends_with("running_var") {
                    let _ = t.copy_(&(Tensor::rand_like(&t) + 0.5));
                }
            }
        });
        (vs, net)
    }

    #[test]
    fn meta_round_trips_through_string_map() {
        let m = meta();
        assert_eq!(ArtifactMeta::from_map(&m.to_map().unwrap()), Some(m));
        assert_eq!(ArtifactMeta::from_map(&HashMap::new()), None);
    }

    #[test]
    fn meta_records_input_normalization() {
        let map = meta().to_map().unwrap();
        assert_eq!(map[META_NORMALIZATION], "imagenet_mean_std");

        let mut symmetric = map.clone();
        symmetric.insert(META_NORMALIZATION.to_string(), Normalization::Symmetric.name().to_string());
        let parsed = ArtifactMeta::from_map(&symmetric).unwrap();
        assert_eq!(parsed.normalization, Normalization::Symmetric);

        let mut unknown = map;
        unknown.insert(META_NORMALIZATION.to_string(), "bogus".to_string());
        assert_eq!(ArtifactMeta::from_map(&unknown), None);
    }

    #[test]
    fn folding_drops_batch_norm_tensors() {
        let (vs, net) = trained_like_net();
        let folded = fold_batch_norm(&vs.variables(), &net).unwrap();
        assert!(!folded.keys().any(|k| k.contains("_bn.")));
        assert!(folded.contains_key("backbone.conv.bias"));
        assert!(folded.contains_key("head.dense_1.weight"));
    }

    #[test]
    fn folded_graph_matches_original_outputs() {
        let (vs, net) = trained_like_net();
        let folded = fold_batch_norm(&vs.variables(), &net).unwrap();

        let mut folded_vs = nn::VarStore::new(Device::Cpu);
        let folded_net = DefectNet::new(&folded_vs.root(), BackboneVariant::Small, 3, HeadConfig::default(), true);
        let mut targets = folded_vs.variables();
        for (name, t) in &folded {
            assert!(crate::model::pretrained::try_copy(&mut targets, name, t), "{name}");
        }
        folded_vs.freeze();

        let xs = Tensor::rand([2, 3, 32, 32], (Kind::Float, Device::Cpu)) * 255.0;
        let a = tch::no_grad(|| net.forward_t(&xs, false));
        let b = tch::no_grad(|| folded_net.forward_t(&xs, false));
        assert!((a - b).abs().max().double_value(&[]) < 1e-4);
    }

    #[test]
    fn f16_artifact_is_smaller_and_carries_metadata() {
        let (vs, net) = trained_like_net();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("model.safetensors");

        let report = export_var_store(&vs.variables(), &net, &meta(), &path).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), report.bytes);
        assert!(report.bytes > 0);
        assert!(report.bytes < report.unquantized_bytes);

        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        let map = header.metadata().clone().unwrap();
        assert_eq!(ArtifactMeta::from_map(&map), Some(meta()));

        let st = SafeTensors::deserialize(&bytes).unwrap();
        assert_eq!(st.tensor("backbone.conv.weight").unwrap().dtype(), Dtype::F16);
        assert_eq!(st.names().len(), report.tensors);
    }
}
