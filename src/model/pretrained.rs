use std::collections::HashMap;
use std::fs;
use std::path::Path;

use half::f16;
use log::{debug, warn};
use safetensors::{tensor::Dtype, SafeTensors};
use tch::{nn, Kind, Tensor};

use super::mobilenet_v3::{torchvision_layer_map, BackboneVariant};
use crate::error::ModelError;

/// Reads every tensor of a safetensors file. `f16` tensors are widened to
/// `f32`; integer tensors keep their kind.
pub fn load_safetensors_to_map(path: &Path) -> Result<HashMap<String, Tensor>, ModelError> {
    let bytes = fs::read(path)?;
    let st = SafeTensors::deserialize(&bytes)?;
    let mut map = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name)?;
        let shape: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        // safetensors payloads are not guaranteed to be aligned for the
        // element type, so copy through owned buffers
        let t = match tv.dtype() {
            Dtype::F32 => {
                let values: Vec<f32> = data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Tensor::from_slice(&values).reshape(&shape)
            }
            Dtype::F16 => {
                let values: Vec<f32> = data
                    .chunks_exact(2)
                    .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect();
                Tensor::from_slice(&values).reshape(&shape)
            }
            Dtype::I64 => {
                let values: Vec<i64> = data
                    .chunks_exact(8)
                    .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                    .collect();
                Tensor::from_slice(&values).reshape(&shape).to_kind(Kind::Int64)
            }
            other => {
                return Err(ModelError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{other:?}"),
                })
            }
        };
        map.insert(name.to_string(), t);
    }
    Ok(map)
}

/// Copies `src` into the variable `name` if it exists with the same shape.
pub fn try_copy(dst: &mut HashMap<String, Tensor>, name: &str, src: &Tensor) -> bool {
    if let Some(d) = dst.get_mut(name) {
        if d.size() == src.size() {
            tch::no_grad(|| {
                d.copy_(src);
            });
            return true;
        }
        debug!("shape mismatch for {name}: {:?} vs {:?}", d.size(), src.size());
    }
    false
}

/// Translates a source key to a variable name under `prefix`, accepting the
/// native layout (`backbone.*`) or torchvision's (`features.*`).
fn map_key(key: &str, prefix: &str, tv_map: &HashMap<String, String>) -> Option<String> {
    if key.starts_with(&format!("{prefix}.")) {
        return Some(key.to_string());
    }
    if key.starts_with("features.") {
        let (module, param) = key.rsplit_once('.')?;
        if param == "num_batches_tracked" {
            return None;
        }
        let layer = tv_map.get(module)?;
        return Some(format!("{prefix}.{layer}.{param}"));
    }
    None
}

/// Loads ImageNet backbone weights into every variable under `prefix`.
/// Returns the number of copied tensors.
pub fn load_pretrained_backbone(
    vs: &mut nn::VarStore,
    variant: BackboneVariant,
    prefix: &str,
    path: &Path,
) -> Result<usize, ModelError> {
    if !path.exists() {
        return Err(ModelError::PretrainedMissing(path.to_path_buf()));
    }
    let src = load_safetensors_to_map(path)?;
    let tv_map = torchvision_layer_map(variant);
    let mut vars = vs.variables();

    let mut copied = 0usize;
    let mut skipped = 0usize;
    for (key, tensor) in &src {
        match map_key(key, prefix, &tv_map) {
            Some(dst) if try_copy(&mut vars, &dst, tensor) => copied += 1,
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("⚠ {skipped} pretrained tensors had no matching backbone variable");
    }
    if copied == 0 {
        return Err(ModelError::NothingCopied(path.to_path_buf()));
    }
    Ok(copied)
}
