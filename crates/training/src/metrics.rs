use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Wall-clock and smoothed-loss bookkeeping for the training loop. Purely
/// observational; nothing here feeds back into training state.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    images_processed: u64,
    g_ema: ExponentialMovingAverage,
    c_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            images_processed: 0,
            g_ema: ExponentialMovingAverage::new(0.1),
            c_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_iteration(&mut self, images: u64, loss_g: f64, loss_c: f64) -> IterationSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.images_processed = self.images_processed.saturating_add(images);
        let images_per_sec = if step_duration > Duration::ZERO {
            images as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        IterationSnapshot {
            loss_g,
            loss_c,
            loss_g_ema: self.g_ema.update(loss_g),
            loss_c_ema: self.c_ema.update(loss_c),
            images_per_sec,
            total_images: self.images_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct IterationSnapshot {
    pub loss_g: f64,
    pub loss_c: f64,
    pub loss_g_ema: f64,
    pub loss_c_ema: f64,
    pub images_per_sec: f64,
    pub total_images: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_the_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.1);
        assert_eq!(ema.update(4.0), 4.0);
        let second = ema.update(2.0);
        assert!((second - (0.1 * 2.0 + 0.9 * 4.0)).abs() < 1e-12);
    }

    #[test]
    fn image_counter_accumulates() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_iteration(128, 1.0, 2.0);
        let snapshot = metrics.record_iteration(128, 1.0, 2.0);
        assert_eq!(snapshot.total_images, 256);
    }
}
