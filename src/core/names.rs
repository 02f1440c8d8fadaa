//! Checkpoint tensor names.
//!
//! Every weight the loader knows about is a `(Branch, TensorSlot)` pair. Names are generated
//! from slots when tensors are declared and parsed back into slots while streaming, so the
//! grammar lives in exactly one place.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Text,
    Vision,
}

impl Branch {
    fn prefix(self) -> &'static str {
        match self {
            Branch::Text => "text_model.",
            Branch::Vision => "vision_model.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerTensor {
    QueryWeight,
    QueryBias,
    KeyWeight,
    KeyBias,
    ValueWeight,
    ValueBias,
    OutWeight,
    OutBias,
    Norm1Weight,
    Norm1Bias,
    Fc1Weight,
    Fc1Bias,
    Fc2Weight,
    Fc2Bias,
    Norm2Weight,
    Norm2Bias,
}

impl LayerTensor {
    pub const ALL: [LayerTensor; 16] = [
        LayerTensor::QueryWeight,
        LayerTensor::QueryBias,
        LayerTensor::KeyWeight,
        LayerTensor::KeyBias,
        LayerTensor::ValueWeight,
        LayerTensor::ValueBias,
        LayerTensor::OutWeight,
        LayerTensor::OutBias,
        LayerTensor::Norm1Weight,
        LayerTensor::Norm1Bias,
        LayerTensor::Fc1Weight,
        LayerTensor::Fc1Bias,
        LayerTensor::Fc2Weight,
        LayerTensor::Fc2Bias,
        LayerTensor::Norm2Weight,
        LayerTensor::Norm2Bias,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            LayerTensor::QueryWeight => "self_attn.q_proj.weight",
            LayerTensor::QueryBias => "self_attn.q_proj.bias",
            LayerTensor::KeyWeight => "self_attn.k_proj.weight",
            LayerTensor::KeyBias => "self_attn.k_proj.bias",
            LayerTensor::ValueWeight => "self_attn.v_proj.weight",
            LayerTensor::ValueBias => "self_attn.v_proj.bias",
            LayerTensor::OutWeight => "self_attn.out_proj.weight",
            LayerTensor::OutBias => "self_attn.out_proj.bias",
            LayerTensor::Norm1Weight => "layer_norm1.weight",
            LayerTensor::Norm1Bias => "layer_norm1.bias",
            LayerTensor::Fc1Weight => "mlp.fc1.weight",
            LayerTensor::Fc1Bias => "mlp.fc1.bias",
            LayerTensor::Fc2Weight => "mlp.fc2.weight",
            LayerTensor::Fc2Bias => "mlp.fc2.bias",
            LayerTensor::Norm2Weight => "layer_norm2.weight",
            LayerTensor::Norm2Bias => "layer_norm2.bias",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        LayerTensor::ALL.into_iter().find(|t| t.suffix() == suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorSlot {
    TokenEmbedding,
    ClassEmbedding,
    PatchEmbedding,
    PositionEmbedding,
    PreNormWeight,
    PreNormBias,
    /// `final_layer_norm` for text, `post_layernorm` for vision
    PostNormWeight,
    PostNormBias,
    Projection,
    Layer(usize, LayerTensor),
}

impl TensorSlot {
    /// Name of this slot under `branch`, or `None` when the branch has no such tensor.
    pub fn name(self, branch: Branch) -> Option<String> {
        let p = branch.prefix();
        let name = match (branch, self) {
            (Branch::Text, TensorSlot::TokenEmbedding) => format!("{p}embeddings.token_embedding.weight"),
            (Branch::Vision, TensorSlot::ClassEmbedding) => format!("{p}embeddings.class_embedding"),
            (Branch::Vision, TensorSlot::PatchEmbedding) => format!("{p}embeddings.patch_embedding.weight"),
            (_, TensorSlot::PositionEmbedding) => format!("{p}embeddings.position_embedding.weight"),
            (Branch::Vision, TensorSlot::PreNormWeight) => format!("{p}pre_layrnorm.weight"),
            (Branch::Vision, TensorSlot::PreNormBias) => format!("{p}pre_layrnorm.bias"),
            (Branch::Text, TensorSlot::PostNormWeight) => format!("{p}final_layer_norm.weight"),
            (Branch::Text, TensorSlot::PostNormBias) => format!("{p}final_layer_norm.bias"),
            (Branch::Vision, TensorSlot::PostNormWeight) => format!("{p}post_layernorm.weight"),
            (Branch::Vision, TensorSlot::PostNormBias) => format!("{p}post_layernorm.bias"),
            (Branch::Text, TensorSlot::Projection) => "text_projection.weight".to_string(),
            (Branch::Vision, TensorSlot::Projection) => "visual_projection.weight".to_string(),
            (_, TensorSlot::Layer(i, t)) => format!("{p}encoder.layers.{}.{}", i, t.suffix()),
            _ => return None,
        };
        Some(name)
    }
}

/// Parse a checkpoint tensor name. Layer indices are not range-checked here.
pub fn parse(name: &str) -> Option<(Branch, TensorSlot)> {
    match name {
        "text_projection.weight" => return Some((Branch::Text, TensorSlot::Projection)),
        "visual_projection.weight" => return Some((Branch::Vision, TensorSlot::Projection)),
        _ => {}
    }

    let (branch, rest) = if let Some(rest) = name.strip_prefix(Branch::Text.prefix()) {
        (Branch::Text, rest)
    } else if let Some(rest) = name.strip_prefix(Branch::Vision.prefix()) {
        (Branch::Vision, rest)
    } else {
        return None;
    };

    if let Some(layer) = rest.strip_prefix("encoder.layers.") {
        let (index, suffix) = layer.split_once('.')?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if index.len() > 1 && index.starts_with('0') {
            return None;
        }
        let index = index.parse().ok()?;
        let tensor = LayerTensor::from_suffix(suffix)?;
        return Some((branch, TensorSlot::Layer(index, tensor)));
    }

    let slot = match (branch, rest) {
        (Branch::Text, "embeddings.token_embedding.weight") => TensorSlot::TokenEmbedding,
        (Branch::Vision, "embeddings.class_embedding") => TensorSlot::ClassEmbedding,
        (Branch::Vision, "embeddings.patch_embedding.weight") => TensorSlot::PatchEmbedding,
        (_, "embeddings.position_embedding.weight") => TensorSlot::PositionEmbedding,
        (Branch::Vision, "pre_layrnorm.weight") => TensorSlot::PreNormWeight,
        (Branch::Vision, "pre_layrnorm.bias") => TensorSlot::PreNormBias,
        (Branch::Text, "final_layer_norm.weight") => TensorSlot::PostNormWeight,
        (Branch::Text, "final_layer_norm.bias") => TensorSlot::PostNormBias,
        (Branch::Vision, "post_layernorm.weight") => TensorSlot::PostNormWeight,
        (Branch::Vision, "post_layernorm.bias") => TensorSlot::PostNormBias,
        _ => return None,
    };
    Some((branch, slot))
}
