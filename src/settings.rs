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

//! Per-dimension scoring configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scoring configuration for one dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimensionSettings {
    /// How harshly the judge should score, 0.0 (lenient) to 1.0 (strict).
    pub default_strictness: f64,

    /// Percentage of criteria that must be met for a pass, 0-100.
    pub passing_criteria_percentage: f64,
}

impl Default for DimensionSettings {
    fn default() -> Self {
        Self {
            default_strictness: 0.7,
            passing_criteria_percentage: 75.0,
        }
    }
}

/// Source of dimension settings.
pub trait DimensionSettingsProvider: Send + Sync {
    fn dimension_settings(&self, name: &str) -> DimensionSettings;
}

/// In-memory provider with per-dimension overrides.
#[derive(Debug, Default)]
pub struct StaticDimensionSettings {
    overrides: HashMap<String, DimensionSettings>,
}

impl StaticDimensionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, dimension: &str, settings: DimensionSettings) -> Self {
        self.overrides.insert(dimension.to_string(), settings);
        self
    }
}

impl DimensionSettingsProvider for StaticDimensionSettings {
    fn dimension_settings(&self, name: &str) -> DimensionSettings {
        self.overrides.get(name).copied().unwrap_or_default()
    }
}
