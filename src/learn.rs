use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Objectives.
pub mod criterion;
/// Neural Networks.
pub mod neural_network;

/// Training / Testing statistics.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: Option<f32>,
}

impl Stats {
    /// Adds the loss of a batch of `count` images.
    pub fn add(&mut self, count: usize, loss: f32) {
        self.count += count;
        self.loss.replace(self.loss.unwrap_or_default() + count as f32 * loss);
    }
    /// The number of images.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean loss per image, if any batch was added.
    pub fn mean_loss(&self) -> Option<f32> {
        self.loss
            .filter(|_| self.count > 0)
            .map(|loss| loss / self.count as f32)
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
    test: Stats,
}

impl Summary {
    /// Runs one pass over the training and held out images.
    ///
    /// `f` trains on every training batch and evaluates every held out batch, returning the
    /// stats of both. The summary only advances when `f` succeeds, so an epoch interrupted by a
    /// [`Numerical`](crate::error::Error::Numerical) error can be rerun by the caller.
    pub fn run_epoch<F>(&mut self, f: F) -> Result<(Stats, Stats)>
    where
        F: FnOnce(&Self) -> Result<(Stats, Stats)>,
    {
        let start = Instant::now();
        let stats = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        (self.train, self.test) = stats;
        Ok(stats)
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The duration of every epoch.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The training stats of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
    /// The testing stats of the last epoch.
    pub fn test(&self) -> &Stats {
        &self.test
    }
}
