// Copyright 2025 Policyward Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Custom resource definitions for the policyward operator

pub mod v1_alpha1;

pub use v1_alpha1::PolicySyncStatus;
pub use v1_alpha1::Stack;
pub use v1_alpha1::System;
