// Copyright 2025 Policyward Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Operator internals

/// Generic Error for controller lifecycle
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Kubernetes internal error
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    /// `serde` errors
    #[error("Serialization Error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Stored policy could not be compiled or evaluated
    #[error("Policy Error: {0}")]
    PolicyError(#[from] rego::PolicyError),

    /// Policy store request failed
    #[error("Store Error: {0}")]
    StoreError(#[from] store::StoreError),

    /// Generic string error messages
    #[error("{0}")]
    Message(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

/// Generic result type to be used in the controller
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod config;
pub mod controller;
mod diagnostics;

pub mod rego;
pub mod store;
pub mod telemetry;

pub use crate::config::Config;
pub use crate::controller::{State, run};
pub use crate::diagnostics::*;
