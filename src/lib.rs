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
//! basalt: hash-based GROUP BY / aggregation execution core.
//!
//! Given a relational execution unit and per-fragment statistics, basalt
//! decides how group slots are laid out in memory for the chosen device,
//! owns the buffer lifecycle, emits the per-row update protocol against a
//! narrow JIT interface, and reduces per-block buffers into an arrow row set.

pub mod common;
pub mod exec;
pub mod jit;
pub mod runtime;

pub use common::config as basalt_config;
pub use common::error::{GroupByError, GroupByResult};
pub use common::logging as basalt_logging;
pub use exec::groupby::descriptor::QueryMemoryDescriptor;
pub use exec::unit::ExecutionUnit;
