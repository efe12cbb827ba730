//! Wake-word scoring seam
//!
//! Acoustic scoring is a black box to the core: a scorer consumes capture
//! blocks and reports per-label confidences. Production deployments plug in
//! a real model behind `WakeWordScorer`; `EnergyScorer` is a stand-in that
//! lets the whole pipeline run without one.

use crate::audio::AudioBlock;
use std::collections::{HashMap, VecDeque};

/// Per-label confidence in [0, 1] for the most recent sample.
pub type ScoreMap = HashMap<String, f32>;

/// Black-box wake-word scorer. Stateful across calls (implementations keep a
/// rolling buffer internally); each call must be blocking-free.
pub trait WakeWordScorer: Send {
    fn score(&mut self, block: &AudioBlock) -> ScoreMap;
}

/// Crude energy-based stand-in scorer: reports a confidence for a single
/// label proportional to the rolling RMS level. Not a wake-word model; it
/// exists so demos and soak tests can arm the gate by speaking loudly.
pub struct EnergyScorer {
    label: String,
    window: VecDeque<f32>,
    window_blocks: usize,
    /// RMS (of full-scale) at which confidence saturates to 1.0.
    full_scale_rms: f32,
}

impl EnergyScorer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            window: VecDeque::new(),
            window_blocks: 8,
            full_scale_rms: 0.2,
        }
    }

    fn block_rms(block: &AudioBlock) -> f32 {
        if block.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = block
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        (sum / block.samples.len() as f64).sqrt() as f32
    }
}

impl WakeWordScorer for EnergyScorer {
    fn score(&mut self, block: &AudioBlock) -> ScoreMap {
        self.window.push_back(Self::block_rms(block));
        while self.window.len() > self.window_blocks {
            self.window.pop_front();
        }

        let avg = self.window.iter().sum::<f32>() / self.window.len() as f32;
        let confidence = (avg / self.full_scale_rms).clamp(0.0, 1.0);

        let mut scores = ScoreMap::new();
        scores.insert(self.label.clone(), confidence);
        scores
    }
}
