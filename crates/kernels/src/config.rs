//! Kernel configuration structures.

use crate::matmul::{DynMatmulKernel, ParallelMatmul, ReferenceMatmul};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl MatmulProblem {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActivationKind {
    #[default]
    None,
    Relu,
}

/// Which matmul implementation dense layers run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelChoice {
    #[default]
    Reference,
    Parallel,
}

impl KernelChoice {
    pub fn kernel(&self) -> DynMatmulKernel {
        match self {
            KernelChoice::Reference => Arc::new(ReferenceMatmul::new()),
            KernelChoice::Parallel => Arc::new(ParallelMatmul::new()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KernelChoice::Reference => "reference",
            KernelChoice::Parallel => "parallel",
        }
    }
}

impl std::str::FromStr for KernelChoice {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "reference" => Ok(KernelChoice::Reference),
            "parallel" => Ok(KernelChoice::Parallel),
            other => anyhow::bail!("unknown matmul kernel '{}'", other),
        }
    }
}
