use serde::{Deserialize, Serialize};

/// Loss and accuracy history persisted alongside checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingStats {
    pub train_losses: Vec<f32>,
    pub train_losses_ts: Vec<usize>,
    pub train_accs: Vec<f64>,
    pub val_accs: Vec<f64>,
    pub val_accs_ts: Vec<usize>,
    pub best_val_acc: f64,
    pub best_model_t: usize,
    pub model_t: usize,
    pub epoch: usize,
}

impl TrainingStats {
    pub fn record_loss(&mut self, iteration: usize, loss: f32) {
        self.train_losses.push(loss);
        self.train_losses_ts.push(iteration);
    }

    /// Returns `true` when `val_acc` beats every earlier validation accuracy.
    pub fn record_accuracy(&mut self, iteration: usize, train_acc: f64, val_acc: f64) -> bool {
        self.train_accs.push(train_acc);
        self.val_accs.push(val_acc);
        self.val_accs_ts.push(iteration);
        self.model_t = iteration;

        let improved = self.val_accs.len() == 1 || val_acc > self.best_val_acc;
        if improved {
            self.best_val_acc = val_acc;
            self.best_model_t = iteration;
        }
        improved
    }
}

/// Running mean of the losses seen since the last record.
#[derive(Debug, Clone, Default)]
pub struct LossWindow {
    sum: f64,
    count: usize,
}

impl LossWindow {
    pub fn push(&mut self, loss: f32) {
        self.sum += f64::from(loss);
        self.count += 1;
    }

    /// Mean of the window, which is then cleared.
    pub fn take_mean(&mut self) -> Option<f32> {
        if self.count == 0 {
            return None;
        }
        let mean = (self.sum / self.count as f64) as f32;
        *self = Self::default();
        Some(mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_accuracy_tracking() {
        let mut stats = TrainingStats::default();
        assert!(stats.record_accuracy(10, 0.4, 0.0));
        assert!(stats.record_accuracy(20, 0.6, 0.5));
        assert!(!stats.record_accuracy(30, 0.7, 0.5));
        assert_eq!(stats.best_model_t, 20);
        assert_eq!(stats.model_t, 30);
        assert_eq!(stats.val_accs_ts, vec![10, 20, 30]);
    }

    #[test]
    fn test_loss_window_mean() {
        let mut window = LossWindow::default();
        assert_eq!(window.take_mean(), None);
        window.push(1.0);
        window.push(3.0);
        assert_eq!(window.take_mean(), Some(2.0));
        assert_eq!(window.take_mean(), None);
    }
}
