use tch::{nn, nn::Module, Tensor};

/// Batch-norm epsilon used by every backbone normalization layer.
pub const BN_EPS: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    HardSwish,
}

impl Activation {
    pub fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Relu => xs.relu(),
            Activation::HardSwish => xs.hardswish(),
        }
    }
}

/// Backbone layers in construction order. Indices count every layer,
/// parameterized or not, and drive the fine-tuning cut-off.
#[derive(Debug, Clone, Default)]
pub struct LayerList {
    names: Vec<String>,
    folds: Vec<(String, String)>,
}

impl LayerList {
    pub fn push(&mut self, name: impl Into<String>) -> String {
        let name = name.into();
        self.names.push(name.clone());
        name
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// (conv, batch-norm) layer pairs that fold into a single convolution.
    pub fn folds(&self) -> &[(String, String)] {
        &self.folds
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConvSpec {
    pub in_c: i64,
    pub out_c: i64,
    pub kernel: i64,
    pub stride: i64,
    pub groups: i64,
}

impl ConvSpec {
    pub fn pointwise(in_c: i64, out_c: i64) -> Self {
        Self { in_c, out_c, kernel: 1, stride: 1, groups: 1 }
    }
}

/// Convolution followed by batch-norm and an optional activation. When
/// built `folded`, the batch-norm is absent and the convolution carries a
/// bias instead.
#[derive(Debug)]
pub struct ConvBn {
    conv: nn::Conv2D,
    bn: Option<nn::BatchNorm>,
    act: Option<Activation>,
}

impl ConvBn {
    pub fn new(
        vs: &nn::Path,
        layers: &mut LayerList,
        name: &str,
        spec: ConvSpec,
        act: Option<Activation>,
        folded: bool,
    ) -> Self {
        let conv_name = layers.push(name);
        let conv = nn::conv2d(
            &vs.sub(&conv_name),
            spec.in_c,
            spec.out_c,
            spec.kernel,
            nn::ConvConfig {
                stride: spec.stride,
                padding: spec.kernel / 2,
                groups: spec.groups,
                bias: folded,
                ..Default::default()
            },
        );

        let bn_name = layers.push(format!("{name}_bn"));
        let bn = if folded {
            None
        } else {
            let cfg = nn::BatchNormConfig { eps: BN_EPS, momentum: 0.01, ..Default::default() };
            Some(nn::batch_norm2d(&vs.sub(&bn_name), spec.out_c, cfg))
        };
        layers.folds.push((conv_name, bn_name));

        if act.is_some() {
            layers.push(format!("{name}_act"));
        }
        Self { conv, bn, act }
    }
}

impl Module for ConvBn {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut x = self.conv.forward(xs);
        if let Some(bn) = &self.bn {
            // backbone statistics stay frozen in both training phases
            x = nn::ModuleT::forward_t(bn, &x, false);
        }
        match self.act {
            Some(act) => act.apply(&x),
            None => x,
        }
    }
}

/// Rounds `v` to a multiple of `divisor`, never dropping more than 10%.
pub fn make_divisible(v: f64, divisor: i64) -> i64 {
    let d = divisor as f64;
    let rounded = (divisor).max(((v + d / 2.0) / d) as i64 * divisor);
    if (rounded as f64) < 0.9 * v {
        rounded + divisor
    } else {
        rounded
    }
}

#[derive(Debug)]
pub struct SqueezeExcite {
    reduce: nn::Conv2D,
    expand: nn::Conv2D,
}

impl SqueezeExcite {
    pub fn new(vs: &nn::Path, layers: &mut LayerList, prefix: &str, channels: i64) -> Self {
        let squeeze = make_divisible(channels as f64 / 4.0, 8);
        layers.push(format!("{prefix}_se_pool"));
        let reduce_name = layers.push(format!("{prefix}_se_reduce"));
        let reduce = nn::conv2d(&vs.sub(&reduce_name), channels, squeeze, 1, Default::default());
        layers.push(format!("{prefix}_se_relu"));
        let expand_name = layers.push(format!("{prefix}_se_expand"));
        let expand = nn::conv2d(&vs.sub(&expand_name), squeeze, channels, 1, Default::default());
        layers.push(format!("{prefix}_se_hardsigmoid"));
        layers.push(format!("{prefix}_se_mul"));
        Self { reduce, expand }
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let scale = xs.adaptive_avg_pool2d(&[1, 1]);
        let scale = self.reduce.forward(&scale).relu();
        let scale = self.expand.forward(&scale).hardsigmoid();
        xs * scale
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockSpec {
    pub kernel: i64,
    pub expand: i64,
    pub out: i64,
    pub se: bool,
    pub act: Activation,
    pub stride: i64,
}

#[derive(Debug)]
pub struct InvertedResidual {
    expand: Option<ConvBn>,
    depthwise: ConvBn,
    se: Option<SqueezeExcite>,
    project: ConvBn,
    use_res: bool,
}

impl InvertedResidual {
    pub fn new(
        vs: &nn::Path,
        layers: &mut LayerList,
        prefix: &str,
        in_c: i64,
        spec: BlockSpec,
        folded: bool,
    ) -> Self {
        let expand = (spec.expand != in_c).then(|| {
            ConvBn::new(
                vs,
                layers,
                &format!("{prefix}_expand"),
                ConvSpec::pointwise(in_c, spec.expand),
                Some(spec.act),
                folded,
            )
        });
        if spec.stride == 2 {
            layers.push(format!("{prefix}_depthwise_pad"));
        }
        let depthwise = ConvBn::new(
            vs,
            layers,
            &format!("{prefix}_depthwise"),
            ConvSpec {
                in_c: spec.expand,
                out_c: spec.expand,
                kernel: spec.kernel,
                stride: spec.stride,
                groups: spec.expand,
            },
            Some(spec.act),
            folded,
        );
        let se = spec.se.then(|| SqueezeExcite::new(vs, layers, prefix, spec.expand));
        let project = ConvBn::new(
            vs,
            layers,
            &format!("{prefix}_project"),
            ConvSpec::pointwise(spec.expand, spec.out),
            None,
            folded,
        );
        let use_res = spec.stride == 1 && in_c == spec.out;
        if use_res {
            layers.push(format!("{prefix}_add"));
        }
        Self { expand, depthwise, se, project, use_res }
    }
}

impl Module for InvertedResidual {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut x = match &self.expand {
            Some(expand) => expand.forward(xs),
            None => xs.shallow_clone(),
        };
        x = self.depthwise.forward(&x);
        if let Some(se) = &self.se {
            x = se.forward(&x);
        }
        x = self.project.forward(&x);
        if self.use_res { xs + x } else { x }
    }
}
