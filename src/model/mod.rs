//! Transfer-learning classifier: input normalization, a MobileNetV3
//! backbone and a small dense head.

pub mod blocks;
pub mod mobilenet_v3;
pub mod pretrained;

use std::collections::BTreeSet;

use tch::{nn, nn::Module, nn::ModuleT, Kind, Tensor};

pub use mobilenet_v3::{Backbone, BackboneVariant};

pub const BACKBONE_PREFIX: &str = "backbone";
pub const HEAD_PREFIX: &str = "head";

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Input scaling applied to raw 0..255 NCHW pixels before the backbone.
/// Must match the statistics the pretrained weights were trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// Per-channel ImageNet mean/std, as torchvision weights expect.
    #[default]
    ImageNet,
    /// 0..255 to -1..1.
    Symmetric,
}

impl Normalization {
    pub fn name(self) -> &'static str {
        match self {
            Normalization::ImageNet => "imagenet_mean_std",
            Normalization::Symmetric => "x/127.5-1",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "imagenet_mean_std" => Some(Normalization::ImageNet),
            "x/127.5-1" => Some(Normalization::Symmetric),
            _ => None,
        }
    }

    pub fn apply(self, xs: &Tensor) -> Tensor {
        let x = xs / 255.0;
        match self {
            Normalization::ImageNet => {
                let mean = Tensor::from_slice(&IMAGENET_MEAN).view([1, 3, 1, 1]).to_device(xs.device());
                let std = Tensor::from_slice(&IMAGENET_STD).view([1, 3, 1, 1]).to_device(xs.device());
                (x - mean) / std
            }
            Normalization::Symmetric => (x - 0.5) / 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadConfig {
    pub dropout: f64,
    pub hidden: i64,
    pub hidden_dropout: f64,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            dropout: 0.3,
            hidden: 128,
            hidden_dropout: 0.2,
        }
    }
}

/// pool → dropout → dense(relu) → dropout → dense. Produces logits; softmax
/// is applied by the owning network.
#[derive(Debug)]
struct Head {
    cfg: HeadConfig,
    hidden: nn::Linear,
    out: nn::Linear,
}

impl Head {
    fn new(vs: &nn::Path, in_features: i64, num_classes: i64, cfg: HeadConfig) -> Self {
        let hidden = nn::linear(vs / "dense", in_features, cfg.hidden, Default::default());
        let out = nn::linear(vs / "dense_1", cfg.hidden, num_classes, Default::default());
        Self { cfg, hidden, out }
    }
}

impl ModuleT for Head {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let features = xs.adaptive_avg_pool2d(&[1, 1]).flatten(1, -1);
        let x = features.dropout(self.cfg.dropout, train);
        let x = self.hidden.forward(&x).relu();
        let x = x.dropout(self.cfg.hidden_dropout, train);
        self.out.forward(&x)
    }
}

/// End-to-end network from raw pixels to class probabilities.
///
/// `folded` builds the inference layout (batch-norm merged into convolution
/// biases) used by exported artifacts.
#[derive(Debug)]
pub struct DefectNet {
    backbone: Backbone,
    head: Head,
    normalization: Normalization,
}

impl DefectNet {
    pub fn new(
        root: &nn::Path,
        variant: BackboneVariant,
        num_classes: i64,
        head: HeadConfig,
        folded: bool,
    ) -> Self {
        let backbone = Backbone::new(&(root / BACKBONE_PREFIX), variant, folded);
        let head = Head::new(&(root / HEAD_PREFIX), backbone.out_channels(), num_classes, head);
        Self {
            backbone,
            head,
            normalization: Normalization::default(),
        }
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Unnormalized class scores. The backbone always runs in inference
    /// mode; `train` only toggles the head's dropout.
    pub fn logits(&self, xs: &Tensor, train: bool) -> Tensor {
        let x = self.normalization.apply(xs);
        let features = self.backbone.forward(&x);
        self.head.forward_t(&features, train)
    }
}

impl ModuleT for DefectNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.logits(xs, train).softmax(-1, Kind::Float)
    }
}

/// Which backbone layers receive gradient updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezePolicy {
    /// Whole backbone frozen; only the head trains.
    FrozenBackbone,
    /// Backbone layers at or after this index train along with the head.
    FineTuneFrom(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreezeSummary {
    pub frozen: usize,
    pub trainable: usize,
}

/// Names of the variables that can ever train, captured before any
/// freezing. Batch-norm running statistics are never in this set.
#[derive(Debug, Clone)]
pub struct TrainableVars {
    names: BTreeSet<String>,
}

impl TrainableVars {
    pub fn capture(vs: &nn::VarStore) -> Self {
        let names = vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .map(|(name, _)| name)
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn backbone_layer(name: &str) -> Option<&str> {
        name.strip_prefix(BACKBONE_PREFIX)?
            .strip_prefix('.')?
            .split('.')
            .next()
    }

    /// Sets `requires_grad` on every captured variable according to `policy`.
    pub fn apply(&self, vs: &nn::VarStore, net: &DefectNet, policy: FreezePolicy) -> FreezeSummary {
        let layers = net.backbone().layers();
        let mut summary = FreezeSummary::default();
        for (name, var) in vs.variables() {
            if !self.names.contains(&name) {
                continue;
            }
            let trainable = match Self::backbone_layer(&name) {
                None => true,
                Some(layer) => match policy {
                    FreezePolicy::FrozenBackbone => false,
                    FreezePolicy::FineTuneFrom(at) => {
                        layers.index_of(layer).map_or(false, |idx| idx >= at)
                    }
                },
            };
            let _ = var.set_requires_grad(trainable);
            if trainable {
                summary.trainable += 1;
            } else {
                summary.frozen += 1;
            }
        }
        summary
    }
}
