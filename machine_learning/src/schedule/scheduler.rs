use serde::{Deserialize, Serialize};

use super::Schedule;

/// The resumable part of an `LrScheduler`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub base_lr: f32,
    pub last_epoch: usize,
}

/// Tracks the epoch a `Schedule` is evaluated at.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    base_lr: f32,
    schedule: Schedule,
    last_epoch: usize,
}

impl LrScheduler {
    pub fn new(base_lr: f32, schedule: Schedule) -> Self {
        Self {
            base_lr,
            schedule,
            last_epoch: 0,
        }
    }

    /// Advances to the next epoch.
    ///
    /// # Returns
    /// The learning rate for that epoch.
    pub fn step(&mut self) -> f32 {
        self.last_epoch += 1;
        self.lr()
    }

    /// The learning rate at the current epoch.
    pub fn lr(&self) -> f32 {
        self.schedule.lr(self.base_lr, self.last_epoch)
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            base_lr: self.base_lr,
            last_epoch: self.last_epoch,
        }
    }

    pub fn load_state(&mut self, state: SchedulerState) {
        self.base_lr = state.base_lr;
        self.last_epoch = state.last_epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restored_scheduler_continues_where_it_stopped() {
        let schedule = Schedule::Exponential { gamma: 0.5 };
        let mut a = LrScheduler::new(1., schedule.clone());
        a.step();
        a.step();

        let mut b = LrScheduler::new(1., schedule);
        b.load_state(a.state());

        assert_eq!(b.last_epoch(), 2);
        assert_eq!(a.step(), b.step());
        assert_eq!(b.lr(), 0.125);
    }
}
