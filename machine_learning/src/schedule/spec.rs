use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use super::Schedule;
use crate::{MlErr, Result};

/// The primary learning rate schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Step,
    Cosa,
    Exp,
}

/// How the learning rate behaves during the warmup epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupMethod {
    Linear,
    Constant,
}

impl FromStr for SchedulerKind {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "step" => Ok(Self::Step),
            "cosa" => Ok(Self::Cosa),
            "exp" => Ok(Self::Exp),
            other => Err(MlErr::InvalidConfig(format!(
                "unsupported lr scheduler {other}"
            ))),
        }
    }
}

impl FromStr for WarmupMethod {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            other => Err(MlErr::InvalidConfig(format!(
                "unsupported lr warmup method {other}"
            ))),
        }
    }
}

impl Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Step => "step",
            Self::Cosa => "cosa",
            Self::Exp => "exp",
        };

        write!(f, "{s}")
    }
}

impl Display for WarmupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Linear => "linear",
            Self::Constant => "constant",
        };

        write!(f, "{s}")
    }
}

/// Everything needed to compose the schedule of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub kind: SchedulerKind,
    pub epochs: usize,
    pub step_size: usize,
    pub gamma: f32,
    pub warmup_epochs: usize,
    pub warmup_method: WarmupMethod,
    pub warmup_decay: f32,
}

impl ScheduleSpec {
    /// Builds the schedule, chaining the warmup in front of the
    /// primary schedule when `warmup_epochs > 0`.
    ///
    /// # Returns
    /// An `InvalidConfig` error when cosine annealing is left with no epochs
    /// after the warmup or the step size is zero.
    pub fn build(&self) -> Result<Schedule> {
        let main = match self.kind {
            SchedulerKind::Step => {
                if self.step_size == 0 {
                    return Err(MlErr::InvalidConfig("lr step size must be positive".into()));
                }

                Schedule::Step {
                    step_size: self.step_size,
                    gamma: self.gamma,
                }
            }
            SchedulerKind::Cosa => {
                let t_max = self.epochs.saturating_sub(self.warmup_epochs);
                if t_max == 0 {
                    return Err(MlErr::InvalidConfig(format!(
                        "cosine annealing needs more epochs ({}) than warmup epochs ({})",
                        self.epochs, self.warmup_epochs
                    )));
                }

                Schedule::Cosine { t_max, eta_min: 0. }
            }
            SchedulerKind::Exp => Schedule::Exponential { gamma: self.gamma },
        };

        if self.warmup_epochs == 0 {
            return Ok(main);
        }

        let warmup = match self.warmup_method {
            WarmupMethod::Linear => Schedule::Linear {
                start_factor: self.warmup_decay,
                total_iters: self.warmup_epochs,
            },
            WarmupMethod::Constant => Schedule::Constant {
                factor: self.warmup_decay,
                total_iters: self.warmup_epochs,
            },
        };

        Ok(Schedule::Sequential {
            schedules: vec![warmup, main],
            milestones: vec![self.warmup_epochs],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: SchedulerKind, epochs: usize, warmup_epochs: usize) -> ScheduleSpec {
        ScheduleSpec {
            kind,
            epochs,
            step_size: 30,
            gamma: 0.1,
            warmup_epochs,
            warmup_method: WarmupMethod::Linear,
            warmup_decay: 0.01,
        }
    }

    #[test]
    fn linear_warmup_then_cosine_to_zero() {
        let schedule = spec(SchedulerKind::Cosa, 10, 2).build().unwrap();
        let lr = |e| schedule.lr(0.1, e);

        assert!((lr(0) - 0.001).abs() < 1e-7);
        assert!((lr(1) - 0.0505).abs() < 1e-6);
        assert!((lr(2) - 0.1).abs() < 1e-7);
        assert!(lr(9) < lr(5));
        assert!(lr(10).abs() < 1e-7);
    }

    #[test]
    fn no_warmup_is_the_bare_schedule() {
        let schedule = spec(SchedulerKind::Exp, 10, 0).build().unwrap();
        assert_eq!(schedule, Schedule::Exponential { gamma: 0.1 });
    }

    #[test]
    fn cosine_without_epochs_left_fails() {
        assert!(matches!(
            spec(SchedulerKind::Cosa, 5, 5).build(),
            Err(MlErr::InvalidConfig(_))
        ));
    }

    #[test]
    fn names_parse() {
        assert_eq!("COSA".parse::<SchedulerKind>().unwrap(), SchedulerKind::Cosa);
        assert_eq!(
            "constant".parse::<WarmupMethod>().unwrap(),
            WarmupMethod::Constant
        );
        assert!("plateau".parse::<SchedulerKind>().is_err());
        assert!("cubic".parse::<WarmupMethod>().is_err());
    }
}
