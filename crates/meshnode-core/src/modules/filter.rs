//! ADC helpers

use std::collections::VecDeque;

/// Full-scale voltage of the ADC front end
pub const ADC_REFERENCE_V: f32 = 3.3;

/// Scale a normalized (0..=1) reading to volts
pub fn adc_to_voltage(normalized: f32) -> f32 {
    normalized.clamp(0.0, 1.0) * ADC_REFERENCE_V
}

/// Median over the last `size` samples
#[derive(Debug, Clone)]
pub struct RunningMedianFilter {
    size: usize,
    window: VecDeque<f32>,
}

impl RunningMedianFilter {
    /// A window of at least one sample
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            window: VecDeque::with_capacity(size),
        }
    }

    /// Push a sample, evicting the oldest when full
    pub fn add(&mut self, sample: f32) {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    /// Median of the window; mean of the middle pair for even counts
    pub fn median(&self) -> Option<f32> {
        if self.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<f32> = self.window.iter().copied().collect();
        sorted.sort_by(f32::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }

    /// Samples currently held
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
