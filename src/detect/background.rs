//! Per-pixel adaptive background model.
//!
//! Each pixel carries a running Gaussian (mean, variance) over grayscale
//! intensity. A pixel is foreground when its squared distance from the mean
//! exceeds `var_threshold * variance`. Pixels that are darker than the mean but
//! within the shadow ratio band are marked as shadow instead.

/// Mask value for background pixels.
pub const MASK_BACKGROUND: u8 = 0;
/// Mask value for shadow pixels.
pub const MASK_SHADOW: u8 = 127;
/// Mask value for foreground pixels.
pub const MASK_FOREGROUND: u8 = 255;

const VAR_INIT: f32 = 15.0;
const VAR_MIN: f32 = 4.0;
const VAR_MAX: f32 = 75.0;
/// Shadows are between this fraction of the background intensity and the intensity itself.
const SHADOW_RATIO: f32 = 0.5;
/// Foreground pixels are folded into the model at this fraction of the learning rate.
const FOREGROUND_ABSORB: f32 = 0.1;

#[derive(Clone, Debug)]
pub struct BackgroundModelConfig {
    /// Number of frames the learning rate averages over once warmed up.
    pub history: u32,
    /// Squared Mahalanobis distance beyond which a pixel is foreground.
    pub var_threshold: f32,
    pub detect_shadows: bool,
}

impl Default for BackgroundModelConfig {
    fn default() -> Self {
        Self {
            history: 500,
            var_threshold: 50.0,
            detect_shadows: true,
        }
    }
}

pub struct BackgroundModel {
    config: BackgroundModelConfig,
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    frames_seen: u64,
}

impl BackgroundModel {
    pub fn new(config: BackgroundModelConfig) -> Self {
        Self {
            config,
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Classify `gray` against the model, then fold it into the model.
    ///
    /// The first frame (and the first frame after a size change) seeds the model
    /// and is reported as all background.
    pub fn apply(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<u8> {
        let len = (width as usize) * (height as usize);
        debug_assert_eq!(gray.len(), len);

        if width != self.width || height != self.height || self.mean.len() != len {
            if self.frames_seen > 0 {
                log::info!(
                    "background model reset: {}x{} -> {}x{}",
                    self.width,
                    self.height,
                    width,
                    height
                );
            }
            self.width = width;
            self.height = height;
            self.mean = gray.iter().map(|&g| g as f32).collect();
            self.variance = vec![VAR_INIT; len];
            self.frames_seen = 1;
            return vec![MASK_BACKGROUND; len];
        }

        self.frames_seen += 1;
        let alpha = self.learning_rate();
        let threshold = self.config.var_threshold;
        let mut mask = vec![MASK_BACKGROUND; len];

        for (i, &g) in gray.iter().enumerate() {
            let value = g as f32;
            let mean = self.mean[i];
            let var = self.variance[i];
            let diff = value - mean;
            let dist2 = diff * diff;

            let foreground = dist2 > threshold * var;
            if foreground {
                mask[i] = if self.config.detect_shadows && is_shadow(value, mean) {
                    MASK_SHADOW
                } else {
                    MASK_FOREGROUND
                };
            }

            let rate = if mask[i] == MASK_FOREGROUND {
                alpha * FOREGROUND_ABSORB
            } else {
                alpha
            };
            self.mean[i] = mean + rate * diff;
            self.variance[i] = (var + rate * (dist2 - var)).clamp(VAR_MIN, VAR_MAX);
        }

        mask
    }

    fn learning_rate(&self) -> f32 {
        let window = self.frames_seen.min(self.config.history.max(1) as u64);
        1.0 / window as f32
    }
}

fn is_shadow(value: f32, mean: f32) -> bool {
    if mean <= 0.0 {
        return false;
    }
    let ratio = value / mean;
    (SHADOW_RATIO..1.0).contains(&ratio)
}
