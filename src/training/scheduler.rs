/// Plateau learning-rate decay and early stopping driven by validation score

/// Plateau scheduler configuration
#[derive(Debug, Clone)]
pub struct PlateauConfig {
    /// Initial learning rate
    pub lr_init: f64,
    /// Learning rate is divided by this on every non-improving epoch
    pub decay_factor: f64,
    /// Stop once this many epochs pass without a new best score
    pub patience: usize,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            lr_init: 1e-3,
            decay_factor: 10.0,
            patience: 3,
        }
    }
}

/// Outcome of one epoch's validation score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochDecision {
    /// Score strictly beat the previous best
    pub new_best: bool,
    /// Score fell strictly below the previous best; lr was decayed
    pub decayed: bool,
    /// Learning rate to use from the next epoch on
    pub lr: f64,
    /// Patience exhausted
    pub stop: bool,
}

/// Plateau scheduler
///
/// Both the decay and the best-update checks compare against the best score
/// from before the current epoch with strict inequalities, so a score equal
/// to the best neither decays nor updates.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    lr: f64,
    best_score: f64,
    best_epoch: Option<usize>,
}

impl PlateauScheduler {
    /// Create new plateau scheduler with a zero best-score baseline
    pub fn new(config: PlateauConfig) -> Self {
        Self {
            lr: config.lr_init,
            config,
            best_score: 0.0,
            best_epoch: None,
        }
    }

    /// Get current learning rate
    pub fn get_lr(&self) -> f64 {
        self.lr
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    /// Epoch of the best score, `None` until something beats the baseline
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Record the validation score of `epoch` (1-based)
    pub fn observe(&mut self, epoch: usize, val_score: f64) -> EpochDecision {
        let previous_best = self.best_score;

        let decayed = val_score < previous_best;
        if decayed {
            self.lr /= self.config.decay_factor;
        }

        let new_best = val_score > previous_best;
        if new_best {
            self.best_score = val_score;
            self.best_epoch = Some(epoch);
        }

        EpochDecision {
            new_best,
            decayed,
            lr: self.lr,
            stop: self.should_stop(epoch),
        }
    }

    /// Patience check; counts from epoch -1 when nothing has improved yet
    pub fn should_stop(&self, epoch: usize) -> bool {
        match self.best_epoch {
            Some(best) => epoch.saturating_sub(best) >= self.config.patience,
            None => epoch + 1 >= self.config.patience,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> PlateauScheduler {
        PlateauScheduler::new(PlateauConfig {
            lr_init: 1e-3,
            ..Default::default()
        })
    }

    #[test]
    fn test_tie_neither_decays_nor_updates() {
        let mut scheduler = scheduler();

        let d1 = scheduler.observe(1, 0.5);
        assert!(d1.new_best && !d1.decayed);
        assert_eq!(scheduler.best_epoch(), Some(1));

        let d2 = scheduler.observe(2, 0.5);
        assert!(!d2.new_best && !d2.decayed);
        assert_eq!(scheduler.best_epoch(), Some(1));
        assert_eq!(d2.lr, 1e-3);

        let d3 = scheduler.observe(3, 0.7);
        assert!(d3.new_best && !d3.decayed);
        assert_eq!(scheduler.best_epoch(), Some(3));

        let d4 = scheduler.observe(4, 0.6);
        assert!(!d4.new_best && d4.decayed);
        assert!((d4.lr - 1e-4).abs() < 1e-12);
        assert_eq!(scheduler.best_score(), 0.7);
    }

    #[test]
    fn test_stops_three_epochs_after_best() {
        let mut scheduler = scheduler();
        scheduler.observe(1, 0.6);
        scheduler.observe(2, 0.8);

        assert!(!scheduler.observe(3, 0.7).stop);
        assert!(!scheduler.observe(4, 0.7).stop);
        assert!(scheduler.observe(5, 0.7).stop);
        assert!((scheduler.get_lr() - 1e-6).abs() < 1e-15);
    }

    #[test]
    fn test_improvement_resets_patience() {
        let mut scheduler = scheduler();
        scheduler.observe(1, 0.6);
        scheduler.observe(2, 0.8);
        scheduler.observe(3, 0.7);

        let d4 = scheduler.observe(4, 0.9);
        assert!(d4.new_best && !d4.stop);
        assert!(!scheduler.observe(5, 0.85).stop);
        assert!(!scheduler.observe(6, 0.85).stop);
        assert!(scheduler.observe(7, 0.85).stop);
    }

    #[test]
    fn test_never_improving_stops_at_patience() {
        let mut scheduler = scheduler();

        assert!(!scheduler.observe(1, 0.0).stop);
        let d2 = scheduler.observe(2, f64::NAN);
        assert!(d2.stop && !d2.decayed);
        assert_eq!(scheduler.best_epoch(), None);
        assert_eq!(scheduler.get_lr(), 1e-3);
    }
}
