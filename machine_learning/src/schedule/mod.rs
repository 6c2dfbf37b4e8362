//! Epoch-level learning rate schedules and their composition.

mod scheduler;
mod spec;

pub use scheduler::{LrScheduler, SchedulerState};
pub use spec::{ScheduleSpec, SchedulerKind, WarmupMethod};

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

/// A learning rate as a closed-form function of the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Multiplies by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f32 },
    /// Half a cosine period from the base rate down to `eta_min` over `t_max` epochs.
    Cosine { t_max: usize, eta_min: f32 },
    /// Multiplies by `gamma` every epoch.
    Exponential { gamma: f32 },
    /// Ramps the factor linearly from `start_factor` to 1 over `total_iters` epochs.
    Linear { start_factor: f32, total_iters: usize },
    /// Holds the factor at `factor` for `total_iters` epochs, then 1.
    Constant { factor: f32, total_iters: usize },
    /// Hands over to the next schedule at every milestone, restarting its epoch count.
    Sequential {
        schedules: Vec<Schedule>,
        milestones: Vec<usize>,
    },
}

impl Schedule {
    /// The learning rate at `epoch` for a base rate of `base_lr`.
    pub fn lr(&self, base_lr: f32, epoch: usize) -> f32 {
        match self {
            Schedule::Step { step_size, gamma } => {
                base_lr * gamma.powi((epoch / (*step_size).max(1)) as i32)
            }
            Schedule::Cosine { t_max, eta_min } => {
                let progress = epoch as f32 / (*t_max).max(1) as f32;
                eta_min + (base_lr - eta_min) * (1. + (PI * progress).cos()) / 2.
            }
            Schedule::Exponential { gamma } => base_lr * gamma.powi(epoch as i32),
            Schedule::Linear {
                start_factor,
                total_iters,
            } => {
                let done = epoch.min(*total_iters) as f32 / (*total_iters).max(1) as f32;
                base_lr * (start_factor + (1. - start_factor) * done)
            }
            Schedule::Constant {
                factor,
                total_iters,
            } => {
                if epoch < *total_iters {
                    base_lr * factor
                } else {
                    base_lr
                }
            }
            Schedule::Sequential {
                schedules,
                milestones,
            } => {
                let idx = milestones.iter().filter(|&&m| m <= epoch).count();
                let offset = idx.checked_sub(1).map_or(0, |i| milestones[i]);

                match schedules.get(idx).or(schedules.last()) {
                    Some(schedule) => schedule.lr(base_lr, epoch - offset),
                    None => base_lr,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn step_decays_every_step_size_epochs() {
        let s = Schedule::Step {
            step_size: 2,
            gamma: 0.1,
        };
        let lrs: Vec<_> = (0..5).map(|e| s.lr(1., e)).collect();

        assert!(close(lrs[1], 1.));
        assert!(close(lrs[2], 0.1));
        assert!(close(lrs[4], 0.01));
    }

    #[test]
    fn cosine_reaches_eta_min_at_t_max() {
        let s = Schedule::Cosine {
            t_max: 4,
            eta_min: 0.,
        };

        assert!(close(s.lr(0.1, 0), 0.1));
        assert!(close(s.lr(0.1, 2), 0.05));
        assert!(close(s.lr(0.1, 4), 0.));
    }

    #[test]
    fn constant_warmup_switches_off() {
        let s = Schedule::Constant {
            factor: 0.5,
            total_iters: 2,
        };

        assert!(close(s.lr(1., 1), 0.5));
        assert!(close(s.lr(1., 2), 1.));
    }

    #[test]
    fn sequential_restarts_the_following_schedule() {
        let s = Schedule::Sequential {
            schedules: vec![
                Schedule::Linear {
                    start_factor: 0.1,
                    total_iters: 2,
                },
                Schedule::Exponential { gamma: 0.5 },
            ],
            milestones: vec![2],
        };
        let lrs: Vec<_> = (0..5).map(|e| s.lr(1., e)).collect();

        assert!(close(lrs[0], 0.1));
        assert!(close(lrs[1], 0.55));
        assert!(close(lrs[2], 1.));
        assert!(close(lrs[3], 0.5));
        assert!(close(lrs[4], 0.25));
    }
}
