// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Typed failures of the group-by core.
//!
//! Planning-time kinds are returned before any device work begins. Runtime
//! kinds surface through the per-lane `error_code` slots after a launch and
//! come with a partial result the caller must discard.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupByError {
    #[error("watchdog: group by float / double would be slow")]
    WouldBeSlow,

    #[error("strings must be dictionary-encoded in {0}")]
    StringsMustBeDictionaryEncoded(&'static str),

    #[error("watchdog: cannot use a fast path for COUNT distinct")]
    CannotUseFastPath,

    #[error("watchdog: query would use too much memory")]
    WouldUseTooMuchMemory,

    #[error("UNNEST not supported in the projection list yet")]
    UnsupportedUnnestInProjection,

    #[error("kernel reported error code {0}")]
    KernelError(i32),

    #[error("device allocation of {bytes} bytes failed on device {device_id}")]
    DeviceAllocationFailed { bytes: usize, device_id: i32 },

    #[error("{0}")]
    Unsupported(String),
}

pub type GroupByResult<T> = Result<T, GroupByError>;

impl GroupByError {
    /// Planning-time kinds abort before buffers exist; runtime kinds do not.
    pub fn is_planning_time(&self) -> bool {
        !matches!(
            self,
            GroupByError::KernelError(_) | GroupByError::DeviceAllocationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::GroupByError;

    #[test]
    fn test_planning_time_split() {
        assert!(GroupByError::WouldBeSlow.is_planning_time());
        assert!(GroupByError::CannotUseFastPath.is_planning_time());
        assert!(GroupByError::WouldUseTooMuchMemory.is_planning_time());
        assert!(!GroupByError::KernelError(4).is_planning_time());
        assert!(
            !GroupByError::DeviceAllocationFailed {
                bytes: 64,
                device_id: 0
            }
            .is_planning_time()
        );
    }
}
