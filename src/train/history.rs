#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// Per-epoch metrics of one training phase, in epoch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    epochs: Vec<EpochMetrics>,
}

impl History {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    fn series(&self, f: impl Fn(&EpochMetrics) -> f64) -> Vec<f64> {
        self.epochs.iter().map(f).collect()
    }

    pub fn loss(&self) -> Vec<f64> {
        self.series(|m| m.loss)
    }

    pub fn accuracy(&self) -> Vec<f64> {
        self.series(|m| m.accuracy)
    }

    pub fn val_loss(&self) -> Vec<f64> {
        self.series(|m| m.val_loss)
    }

    pub fn val_accuracy(&self) -> Vec<f64> {
        self.series(|m| m.val_accuracy)
    }

    /// Phases appended in order, as plotted across the whole run.
    pub fn concat(phases: &[&History]) -> History {
        History {
            epochs: phases.iter().flat_map(|h| h.epochs.iter().copied()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(v: f64) -> EpochMetrics {
        EpochMetrics {
            loss: v,
            accuracy: 1.0 - v,
            val_loss: v * 2.0,
            val_accuracy: 1.0 - v * 2.0,
        }
    }

    #[test]
    fn concat_preserves_phase_order() {
        let mut first = History::default();
        first.push(metrics(0.4));
        first.push(metrics(0.3));
        let mut second = History::default();
        second.push(metrics(0.1));

        let all = History::concat(&[&first, &second]);
        assert_eq!(all.len(), 3);
        assert_eq!(all.loss(), vec![0.4, 0.3, 0.1]);
        assert_eq!(all.val_loss(), vec![0.8, 0.6, 0.2]);
        assert_eq!(all.last(), Some(&metrics(0.1)));
    }
}
