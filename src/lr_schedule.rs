use crate::common::*;

/// Step decay that multiplies the learning rate by `gamma` each time a
/// milestone is passed.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    step: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: &[usize], gamma: f64) -> Result<Self> {
        ensure!(base_lr > 0.0, "learning rate must be positive");
        ensure!(gamma > 0.0, "decay factor must be positive");
        ensure!(
            milestones.windows(2).all(|pair| pair[0] < pair[1]),
            "milestones must be strictly increasing"
        );

        Ok(Self {
            base_lr,
            milestones: milestones.to_vec(),
            gamma,
            step: 0,
        })
    }

    pub fn lr(&self) -> f64 {
        let passed = self
            .milestones
            .iter()
            .take_while(|&&milestone| milestone <= self.step)
            .count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    /// Advances one iteration and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.lr()
    }
}
