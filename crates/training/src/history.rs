use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Tolerance for the additive loss invariant when re-validating persisted
/// histories (f32 values survive a JSON round trip exactly, but older
/// checkpoints may have been written by hand or by other tools).
const INVARIANT_TOLERANCE: f32 = 1e-5;

/// In-memory training history: four append-only loss arrays, always the same
/// length, plus the ordered snapshot-grid list. Mutated only by the training
/// loop, one loss entry per outer iteration.
#[derive(Debug, Default)]
pub struct History {
    g_losses: Vec<f32>,
    c_losses: Vec<f32>,
    c_losses_real: Vec<f32>,
    c_losses_fake: Vec<f32>,
    snapshots: Vec<Tensor>,
}

/// Serialized form of the loss arrays, tied to the iteration they cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub iteration: usize,
    pub g_losses: Vec<f32>,
    pub c_losses: Vec<f32>,
    pub c_losses_real: Vec<f32>,
    pub c_losses_fake: Vec<f32>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one iteration's losses. The combined critic loss is derived
    /// here so the additive invariant holds by construction.
    pub fn push_losses(&mut self, g: f32, c_real: f32, c_fake: f32) {
        self.g_losses.push(g);
        self.c_losses.push(c_real + c_fake);
        self.c_losses_real.push(c_real);
        self.c_losses_fake.push(c_fake);
    }

    pub fn push_snapshot(&mut self, grid: Tensor) {
        self.snapshots.push(grid);
    }

    pub fn len(&self) -> usize {
        self.g_losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.g_losses.is_empty()
    }

    pub fn g_losses(&self) -> &[f32] {
        &self.g_losses
    }

    pub fn c_losses(&self) -> &[f32] {
        &self.c_losses
    }

    pub fn c_losses_real(&self) -> &[f32] {
        &self.c_losses_real
    }

    pub fn c_losses_fake(&self) -> &[f32] {
        &self.c_losses_fake
    }

    pub fn snapshots(&self) -> &[Tensor] {
        &self.snapshots
    }

    pub fn to_record(&self, iteration: usize) -> HistoryRecord {
        HistoryRecord {
            iteration,
            g_losses: self.g_losses.clone(),
            c_losses: self.c_losses.clone(),
            c_losses_real: self.c_losses_real.clone(),
            c_losses_fake: self.c_losses_fake.clone(),
        }
    }

    /// Rebuilds a history from persisted state, rejecting anything
    /// internally inconsistent. Used on resume; failures surface as
    /// [`TrainingError::Resume`].
    pub fn from_record(
        record: HistoryRecord,
        snapshots: Vec<Tensor>,
    ) -> Result<Self, TrainingError> {
        let len = record.g_losses.len();
        if record.c_losses.len() != len
            || record.c_losses_real.len() != len
            || record.c_losses_fake.len() != len
        {
            return Err(TrainingError::resume(format!(
                "loss histories disagree on length: g={} c={} c_real={} c_fake={}",
                len,
                record.c_losses.len(),
                record.c_losses_real.len(),
                record.c_losses_fake.len()
            )));
        }
        if record.iteration != len {
            return Err(TrainingError::resume(format!(
                "checkpoint claims iteration {} but histories hold {} entries",
                record.iteration, len
            )));
        }
        for k in 0..len {
            let expected = record.c_losses_real[k] + record.c_losses_fake[k];
            if (record.c_losses[k] - expected).abs() > INVARIANT_TOLERANCE {
                return Err(TrainingError::resume(format!(
                    "critic loss invariant broken at entry {}: {} != {} + {}",
                    k, record.c_losses[k], record.c_losses_real[k], record.c_losses_fake[k]
                )));
            }
        }
        Ok(Self {
            g_losses: record.g_losses,
            c_losses: record.c_losses,
            c_losses_real: record.c_losses_real,
            c_losses_fake: record.c_losses_fake,
            snapshots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_stay_in_lockstep() {
        let mut history = History::new();
        for k in 0..10 {
            history.push_losses(k as f32, 0.5, 0.25);
        }
        assert_eq!(history.len(), 10);
        assert_eq!(history.g_losses().len(), 10);
        assert_eq!(history.c_losses().len(), 10);
        assert_eq!(history.c_losses_real().len(), 10);
        assert_eq!(history.c_losses_fake().len(), 10);
        for k in 0..10 {
            let sum = history.c_losses_real()[k] + history.c_losses_fake()[k];
            assert!((history.c_losses()[k] - sum).abs() < 1e-7);
        }
    }

    #[test]
    fn record_roundtrip_preserves_entries() {
        let mut history = History::new();
        history.push_losses(1.0, 0.75, 0.5);
        history.push_losses(0.5, 0.25, 0.125);

        let record = history.to_record(2);
        let restored = History::from_record(record, Vec::new()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.g_losses(), history.g_losses());
        assert_eq!(restored.c_losses(), history.c_losses());
    }

    #[test]
    fn mismatched_lengths_fail_resume() {
        let record = HistoryRecord {
            iteration: 2,
            g_losses: vec![1.0, 2.0],
            c_losses: vec![1.0],
            c_losses_real: vec![0.5, 0.5],
            c_losses_fake: vec![0.5, 0.5],
        };
        let err = History::from_record(record, Vec::new()).unwrap_err();
        assert!(matches!(err, TrainingError::Resume(_)));
    }

    #[test]
    fn iteration_count_must_match_history_length() {
        let record = HistoryRecord {
            iteration: 5,
            g_losses: vec![1.0],
            c_losses: vec![1.0],
            c_losses_real: vec![0.5],
            c_losses_fake: vec![0.5],
        };
        assert!(matches!(
            History::from_record(record, Vec::new()),
            Err(TrainingError::Resume(_))
        ));
    }

    #[test]
    fn broken_additive_invariant_fails_resume() {
        let record = HistoryRecord {
            iteration: 1,
            g_losses: vec![1.0],
            c_losses: vec![2.0],
            c_losses_real: vec![0.5],
            c_losses_fake: vec![0.5],
        };
        assert!(matches!(
            History::from_record(record, Vec::new()),
            Err(TrainingError::Resume(_))
        ));
    }
}
