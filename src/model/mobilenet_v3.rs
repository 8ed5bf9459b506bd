use std::collections::HashMap;
use std::fmt;

use tch::{nn, nn::Module, Tensor};

use super::blocks::{Activation, BlockSpec, ConvBn, ConvSpec, InvertedResidual, LayerList};

use super::blocks::Activation::{HardSwish as HS, Relu as RE};

const fn block(kernel: i64, expand: i64, out: i64, se: bool, act: Activation, stride: i64) -> BlockSpec {
    BlockSpec { kernel, expand, out, se, act, stride }
}

// kernel, expand, out, se, act, stride
const SMALL: [BlockSpec; 11] = [
    block(3, 16, 16, true, RE, 2),
    block(3, 72, 24, false, RE, 2),
    block(3, 88, 24, false, RE, 1),
    block(5, 96, 40, true, HS, 2),
    block(5, 240, 40, true, HS, 1),
    block(5, 240, 40, true, HS, 1),
    block(5, 120, 48, true, HS, 1),
    block(5, 144, 48, true, HS, 1),
    block(5, 288, 96, true, HS, 2),
    block(5, 576, 96, true, HS, 1),
    block(5, 576, 96, true, HS, 1),
];

const LARGE: [BlockSpec; 15] = [
    block(3, 16, 16, false, RE, 1),
    block(3, 64, 24, false, RE, 2),
    block(3, 72, 24, false, RE, 1),
    block(5, 72, 40, true, RE, 2),
    block(5, 120, 40, true, RE, 1),
    block(5, 120, 40, true, RE, 1),
    block(3, 240, 80, false, HS, 2),
    block(3, 200, 80, false, HS, 1),
    block(3, 184, 80, false, HS, 1),
    block(3, 184, 80, false, HS, 1),
    block(3, 480, 112, true, HS, 1),
    block(3, 672, 112, true, HS, 1),
    block(5, 672, 160, true, HS, 2),
    block(5, 960, 160, true, HS, 1),
    block(5, 960, 160, true, HS, 1),
];

const STEM_CHANNELS: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneVariant {
    Small,
    Large,
}

impl BackboneVariant {
    pub fn name(self) -> &'static str {
        match self {
            BackboneVariant::Small => "MobileNetV3Small",
            BackboneVariant::Large => "MobileNetV3Large",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MobileNetV3Small" => Some(BackboneVariant::Small),
            "MobileNetV3Large" => Some(BackboneVariant::Large),
            _ => None,
        }
    }

    pub fn blocks(self) -> &'static [BlockSpec] {
        match self {
            BackboneVariant::Small => &SMALL,
            BackboneVariant::Large => &LARGE,
        }
    }

    /// Channels of the final 1x1 convolution (the feature width).
    pub fn out_channels(self) -> i64 {
        self.blocks().last().map(|b| b.expand).unwrap_or(STEM_CHANNELS)
    }
}

impl fmt::Display for BackboneVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn block_prefix(i: usize) -> String {
    format!("expanded_conv_{i}")
}

/// MobileNetV3 feature extractor without its classification top. Output is
/// the last convolution's activation map, `[N, out_channels, H/32, W/32]`.
#[derive(Debug)]
pub struct Backbone {
    variant: BackboneVariant,
    stem: ConvBn,
    blocks: Vec<InvertedResidual>,
    last: ConvBn,
    layers: LayerList,
}

impl Backbone {
    pub fn new(vs: &nn::Path, variant: BackboneVariant, folded: bool) -> Self {
        let mut layers = LayerList::default();
        layers.push("input");
        // input scaling runs in `DefectNet` but still occupies a layer slot
        layers.push("rescaling");

        let stem = ConvBn::new(
            vs,
            &mut layers,
            "conv",
            ConvSpec { in_c: 3, out_c: STEM_CHANNELS, kernel: 3, stride: 2, groups: 1 },
            Some(HS),
            folded,
        );

        let mut in_c = STEM_CHANNELS;
        let mut blocks = Vec::new();
        for (i, &spec) in variant.blocks().iter().enumerate() {
            let block = InvertedResidual::new(vs, &mut layers, &block_prefix(i), in_c, spec, folded);
            blocks.push(block);
            in_c = spec.out;
        }

        let last = ConvBn::new(
            vs,
            &mut layers,
            "conv_1",
            ConvSpec::pointwise(in_c, variant.out_channels()),
            Some(HS),
            folded,
        );

        Self { variant, stem, blocks, last, layers }
    }

    pub fn variant(&self) -> BackboneVariant {
        self.variant
    }

    pub fn layers(&self) -> &LayerList {
        &self.layers
    }

    pub fn out_channels(&self) -> i64 {
        self.variant.out_channels()
    }
}

impl Module for Backbone {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut x = self.stem.forward(xs);
        for block in &self.blocks {
            x = block.forward(&x);
        }
        self.last.forward(&x)
    }
}

fn insert_conv_bn(map: &mut HashMap<String, String>, tv: &str, ours: &str) {
    map.insert(format!("{tv}.0"), ours.to_string());
    map.insert(format!("{tv}.1"), format!("{ours}_bn"));
}

/// Maps torchvision `features.*` module prefixes to backbone layer names.
pub fn torchvision_layer_map(variant: BackboneVariant) -> HashMap<String, String> {
    let mut map = HashMap::new();
    insert_conv_bn(&mut map, "features.0", "conv");

    let blocks = variant.blocks();
    let mut in_c = STEM_CHANNELS;
    for (i, spec) in blocks.iter().enumerate() {
        let prefix = block_prefix(i);
        let mut units = Vec::new();
        if spec.expand != in_c {
            units.push("expand");
        }
        units.push("depthwise");
        if spec.se {
            units.push("se");
        }
        units.push("project");

        for (j, unit) in units.into_iter().enumerate() {
            let tv = format!("features.{}.block.{j}", i + 1);
            if unit == "se" {
                map.insert(format!("{tv}.fc1"), format!("{prefix}_se_reduce"));
                map.insert(format!("{tv}.fc2"), format!("{prefix}_se_expand"));
            } else {
                insert_conv_bn(&mut map, &tv, &format!("{prefix}_{unit}"));
            }
        }
        in_c = spec.out;
    }

    insert_conv_bn(&mut map, &format!("features.{}", blocks.len() + 1), "conv_1");
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn small_backbone_downsamples_by_32() {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = Backbone::new(&vs.root(), BackboneVariant::Small, false);
        let xs = Tensor::rand([1, 3, 64, 64], (Kind::Float, Device::Cpu));
        let out = tch::no_grad(|| backbone.forward(&xs));
        assert_eq!(out.size(), vec![1, 576, 2, 2]);
    }

    #[test]
    fn layer_list_is_deep_enough_for_fine_tuning() {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = Backbone::new(&vs.root(), BackboneVariant::Small, false);
        let layers = backbone.layers();
        assert_eq!(layers.names()[0], "input");
        assert_eq!(layers.names()[1], "rescaling");
        assert_eq!(layers.names().last().map(String::as_str), Some("conv_1_act"));
        assert!(layers.len() > 100);
    }

    #[test]
    fn fine_tune_cut_lands_at_block_seven_squeeze_excite() {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = Backbone::new(&vs.root(), BackboneVariant::Small, false);
        let layers = backbone.layers();
        assert_eq!(layers.names()[100], "expanded_conv_7_se_pool");
        assert_eq!(layers.index_of("expanded_conv_0_depthwise_pad"), Some(5));
        assert_eq!(layers.index_of("expanded_conv_3_depthwise_pad"), Some(38));
        assert!(layers.index_of("expanded_conv_7_se_reduce").unwrap() > 100);
        assert!(layers.index_of("expanded_conv_7_depthwise").unwrap() < 100);
    }

    #[test]
    fn variant_names_round_trip() {
        for v in [BackboneVariant::Small, BackboneVariant::Large] {
            assert_eq!(BackboneVariant::from_name(v.name()), Some(v));
        }
        assert_eq!(BackboneVariant::Large.out_channels(), 960);
    }

    #[test]
    fn torchvision_map_covers_every_parameterized_layer() {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = Backbone::new(&vs.root(), BackboneVariant::Small, false);
        let map = torchvision_layer_map(BackboneVariant::Small);

        assert_eq!(map.get("features.0.0").map(String::as_str), Some("conv"));
        assert_eq!(map.get("features.1.block.0.0").map(String::as_str), Some("expanded_conv_0_depthwise"));
        assert_eq!(map.get("features.1.block.1.fc1").map(String::as_str), Some("expanded_conv_0_se_reduce"));
        assert_eq!(map.get("features.1.block.2.1").map(String::as_str), Some("expanded_conv_0_project_bn"));
        assert_eq!(map.get("features.12.0").map(String::as_str), Some("conv_1"));

        let mapped: std::collections::HashSet<&String> = map.values().collect();
        for name in vs.variables().keys() {
            let layer = name.split('.').next().unwrap().to_string();
            assert!(mapped.contains(&layer), "unmapped layer {layer}");
        }
        assert!(backbone.layers().len() > map.len());
    }
}
