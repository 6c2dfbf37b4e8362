use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use super::{AdamW, Optimizer, Sgd};
use crate::MlErr;

/// The supported optimization algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adamw" => Ok(Self::AdamW),
            other => Err(MlErr::InvalidConfig(format!(
                "invalid optimizer {other}, only sgd and adamw are supported"
            ))),
        }
    }
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sgd => "sgd",
            Self::AdamW => "adamw",
        };

        write!(f, "{s}")
    }
}

/// The settings an optimizer is built from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: OptimizerKind,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl OptimizerSpec {
    /// Builds the optimizer for a model of `len` parameters.
    ///
    /// `momentum` only applies to `Sgd`.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer> {
        match self.kind {
            OptimizerKind::Sgd => Box::new(Sgd::new(len, self.lr, self.momentum, self.weight_decay)),
            OptimizerKind::AdamW => Box::new(AdamW::new(len, self.lr, self.weight_decay)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!("adamw".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn built_optimizer_reports_its_kind() {
        let spec = OptimizerSpec {
            kind: OptimizerKind::AdamW,
            lr: 0.001,
            momentum: 0.9,
            weight_decay: 0.,
        };

        let optimizer = spec.build(4);
        assert_eq!(optimizer.state().kind, OptimizerKind::AdamW);
        assert_eq!(optimizer.lr(), 0.001);
    }

    #[test]
    fn state_metadata_is_json() {
        let state = Sgd::new(1, 0.1, 0., 0.).state();
        let json = serde_json::to_string(&state).unwrap();

        assert_eq!(json, r#"{"kind":"sgd","lr":0.1,"steps":0}"#);
    }
}
