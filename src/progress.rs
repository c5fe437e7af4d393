//! Progress reporting types shared by the replicator and the task runner.
//!
//! Each long-running operation owns an `mpsc` channel; percentage is
//! action-count-weighted as actions complete and, for sends, additionally
//! weighted by estimated bytes (spec §4.6 step 5).

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub actions_done: usize,
    pub actions_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub message: String,
}

impl ProgressUpdate {
    /// Action-count fraction, in `[0.0, 1.0]`.
    pub fn fraction_by_count(&self) -> f64 {
        if self.actions_total == 0 {
            1.0
        } else {
            self.actions_done as f64 / self.actions_total as f64
        }
    }

    /// Byte-weighted fraction, falling back to the count fraction when no
    /// size estimate is available.
    pub fn fraction_by_bytes(&self) -> f64 {
        if self.bytes_total == 0 {
            self.fraction_by_count()
        } else {
            self.bytes_done as f64 / self.bytes_total as f64
        }
    }
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressUpdate>;

pub fn channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_by_count_handles_zero_total() {
        let update = ProgressUpdate {
            actions_done: 0,
            actions_total: 0,
            bytes_done: 0,
            bytes_total: 0,
            message: String::new(),
        };
        assert_eq!(update.fraction_by_count(), 1.0);
    }

    #[test]
    fn fraction_by_bytes_falls_back_without_estimate() {
        let update = ProgressUpdate {
            actions_done: 1,
            actions_total: 4,
            bytes_done: 0,
            bytes_total: 0,
            message: String::new(),
        };
        assert_eq!(update.fraction_by_bytes(), 0.25);
    }
}
