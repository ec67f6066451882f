//! Element-wise activations, selectable by name from a layer configuration.

use crate::error::DagnnError;
use crate::nn::module::{Module, Parameter};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alpha used by `elu`.
const ELU_ALPHA: f32 = 1.0;

/// Activation layer. Has no trainable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Elu,
    /// Identity.
    Linear,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Elu => "elu",
            Activation::Linear => "linear",
        }
    }
}

impl FromStr for Activation {
    type Err = DagnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "elu" => Ok(Activation::Elu),
            "linear" | "none" | "" => Ok(Activation::Linear),
            other => Err(DagnnError::Configuration(format!(
                "unknown activation '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Activation {
    type Error = DagnnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Activation> for String {
    fn from(value: Activation) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Module for Activation {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        match self {
            Activation::Relu => inputs.relu(),
            Activation::Sigmoid => inputs.sigmoid(),
            Activation::Tanh => inputs.tanh(),
            Activation::Elu => inputs.elu(ELU_ALPHA),
            Activation::Linear => inputs.clone(),
        }
    }

    fn parameters(&self) -> Vec<Parameter> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("linear".parse::<Activation>().unwrap(), Activation::Linear);
        assert!(matches!(
            "gelu".parse::<Activation>(),
            Err(DagnnError::Configuration(_))
        ));
    }

    #[test]
    fn serializes_as_its_name() {
        let json = serde_json::to_string(&Activation::Tanh).unwrap();
        assert_eq!(json, "\"tanh\"");
        let back: Activation = serde_json::from_str("\"elu\"").unwrap();
        assert_eq!(back, Activation::Elu);
        assert!(serde_json::from_str::<Activation>("\"swish\"").is_err());
    }
}
