//! Single-image classification with an exported artifact.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use image::DynamicImage;
use log::info;
use safetensors::SafeTensors;
use tch::{nn, nn::ModuleT, Device, Kind, Tensor};

use crate::data::to_pixels;
use crate::error::InferenceError;
use crate::export::ArtifactMeta;
use crate::model::pretrained::{load_safetensors_to_map, try_copy};
use crate::model::{DefectNet, HeadConfig, Normalization};
use crate::taxonomy::{DefectClass, InspectionKind};

#[derive(Debug, Clone)]
pub struct Classification {
    pub label: String,
    /// `None` when the label is not part of the fixed taxonomy.
    pub class: Option<DefectClass>,
    /// Probability of the reported label. When an inspection kind replaces
    /// the top-1 prediction with its ok class, this is the ok class's own
    /// probability, not the top-1 probability.
    pub confidence: f32,
    /// One entry per artifact label, in artifact order.
    pub probabilities: Vec<f32>,
    pub inference_time: Duration,
}

pub struct DefectClassifier {
    _vs: nn::VarStore,
    net: DefectNet,
    meta: ArtifactMeta,
}

impl DefectClassifier {
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let bytes = fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let meta = header
            .metadata()
            .as_ref()
            .and_then(ArtifactMeta::from_map)
            .ok_or_else(|| InferenceError::MissingMetadata(path.to_path_buf()))?;

        let mut vs = nn::VarStore::new(Device::Cpu);
        let head = HeadConfig {
            hidden: meta.hidden,
            ..HeadConfig::default()
        };
        let net = DefectNet::new(&vs.root(), meta.variant, meta.labels.len() as i64, head, true)
            .with_normalization(meta.normalization);

        let src = load_safetensors_to_map(path)?;
        let mut vars = vs.variables();
        let expected = vars.len();
        let copied = src
            .iter()
            .filter(|(name, t)| try_copy(&mut vars, name, t))
            .count();
        if copied != expected {
            return Err(InferenceError::IncompleteArtifact { copied, expected });
        }
        vs.freeze();

        info!(
            "✓ Loaded {} classifier ({} labels) from {}",
            meta.variant,
            meta.labels.len(),
            path.display()
        );
        Ok(Self { _vs: vs, net, meta })
    }

    pub fn labels(&self) -> &[String] {
        &self.meta.labels
    }

    pub fn input_size(&self) -> u32 {
        self.meta.img_size
    }

    pub fn normalization(&self) -> Normalization {
        self.meta.normalization
    }

    /// Class probabilities for one image, in artifact label order.
    pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>, InferenceError> {
        let side = self.meta.img_size as i64;
        let pixels = to_pixels(image, self.meta.img_size);
        let xs = Tensor::from_slice(&pixels)
            .view([1, side, side, 3])
            .permute(&[0, 3, 1, 2])
            .to_kind(Kind::Float);
        let probs = tch::no_grad(|| self.net.forward_t(&xs, false)).view([-1]);
        Ok(Vec::<f32>::try_from(&probs)?)
    }

    /// Top-1 prediction. With `kind`, a prediction outside that kind's
    /// classes is reported as the kind's ok class.
    pub fn classify(
        &self,
        image: &DynamicImage,
        kind: Option<InspectionKind>,
    ) -> Result<Classification, InferenceError> {
        let start = Instant::now();
        let probabilities = self.probabilities(image)?;
        let inference_time = start.elapsed();

        let best = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut label = self.meta.labels.get(best).cloned().unwrap_or_default();
        let mut class = DefectClass::from_label(&label);

        if let (Some(kind), Some(predicted)) = (kind, class) {
            let restricted = kind.restrict(predicted);
            if restricted != predicted {
                label = restricted.label().to_string();
                class = Some(restricted);
            }
        }

        let confidence = self
            .meta
            .labels
            .iter()
            .position(|l| *l == label)
            .and_then(|i| probabilities.get(i).copied())
            .unwrap_or(0.0);

        Ok(Classification {
            label,
            class,
            confidence,
            probabilities,
            inference_time,
        })
    }
}
