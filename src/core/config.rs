/// Feed-forward non-linearity. OpenAI CLIP checkpoints are trained with quick GELU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Activation {
    #[default]
    QuickGelu,
    Gelu,
}

/// Where the resized image lands on the square canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Letterbox {
    /// Scaled image at the top-left corner, padding to the right and bottom.
    /// Reference accuracy numbers were measured with this placement.
    #[default]
    TopLeft,
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// 0 = quiet, 1 = summary, 2 = one line per tensor
    pub verbosity: u8,
    pub activation: Activation,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            verbosity: 1,
            activation: Activation::default(),
        }
    }
}

pub const CLIP_IMAGE_SIZE: usize = 224;
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessOptions {
    pub image_size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub letterbox: Letterbox,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        PreprocessOptions {
            image_size: CLIP_IMAGE_SIZE,
            mean: CLIP_MEAN,
            std: CLIP_STD,
            letterbox: Letterbox::default(),
        }
    }
}

impl PreprocessOptions {
    pub fn with_image_size(image_size: usize) -> Self {
        PreprocessOptions {
            image_size,
            ..Default::default()
        }
    }
}

/// Worker count used when the caller has no preference: up to four cores.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(1)
}
