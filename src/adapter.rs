// Copyright 2025 Gauntlet Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Adapter seam between the engine and the system under test.
//!
//! How an agent or team is actually invoked (framework discovery, process
//! management, transport) lives behind this trait; the engine only sees one
//! output per spec.

use crate::types::TestSpec;
use async_trait::async_trait;
use thiserror::Error;

/// Ambient parameters for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub project_path: String,
    pub timeout_ms: u64,
}

/// Output of a single execution.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub output: serde_json::Value,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),
}

/// Executes one test spec against the target system.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn execute(
        &self,
        spec: &TestSpec,
        ctx: &ExecutionContext,
    ) -> Result<AdapterResponse, AdapterError>;
}
