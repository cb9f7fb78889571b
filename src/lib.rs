// Copyright 2025 The execmux Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bidirectional, multiplexed channels between two processes over a
//! single pair of byte streams, with a remote-execution loop on the
//! worker side.
//!
//! A controlling [`gateway::Gateway`] and a [`worker::WorkerGateway`]
//! each own one transport, one receiver thread and a channel factory.
//! Any number of flow-ordered logical [`channel::Channel`]s share the
//! transport, carrying values in a compact, cross-language opcode
//! format that includes live channel references.

pub mod channel;
pub mod dirsync;
pub mod error;
pub mod gateway;
pub mod prelude;
pub mod transport;
pub mod utils;
pub mod wire;
pub mod worker;

mod factory;
