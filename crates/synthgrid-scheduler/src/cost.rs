//! Cost estimator — maps generation parameters to budget units.
//!
//! `units = max(min_units, ceil(width * height * effective_steps / pixel_steps_per_unit))`
//!
//! The formula is non-decreasing in width, height and steps. Construction
//! fails unless the largest request the configured bounds allow fits in the
//! budget, otherwise such a request could never be admitted.

use thiserror::Error;

use synthgrid_core::config::{ConfigError, CostConfig};
use synthgrid_core::GenerationParams;

/// A request dimension exceeded the configured bounds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} {value} exceeds the maximum of {limit}")]
pub struct OutOfBounds {
    pub field: &'static str,
    pub value: u32,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct CostEstimator {
    config: CostConfig,
}

impl CostEstimator {
    pub fn new(config: CostConfig, capacity: u32) -> Result<Self, ConfigError> {
        let estimator = Self { config };
        let worst_case = estimator.worst_case();
        if worst_case > u64::from(capacity) {
            return Err(ConfigError::Unbounded {
                worst_case,
                capacity,
            });
        }
        Ok(estimator)
    }

    /// Cost of a request, or the first dimension that is out of bounds.
    pub fn cost(&self, params: &GenerationParams) -> Result<u32, OutOfBounds> {
        let c = &self.config;
        check("width", params.width, c.max_width)?;
        check("height", params.height, c.max_height)?;
        // Raw steps are bounded even when strength shortens the schedule.
        check("steps", params.steps, c.max_steps)?;
        let steps = params.effective_steps();
        check("steps", steps, c.max_steps)?;

        // Bounded by worst_case() <= capacity, so the cast cannot truncate.
        Ok(self.units(params.width, params.height, steps) as u32)
    }

    /// Cost of the largest request the bounds allow.
    pub fn worst_case(&self) -> u64 {
        let c = &self.config;
        self.units(c.max_width, c.max_height, c.max_steps)
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    fn units(&self, width: u32, height: u32, steps: u32) -> u64 {
        let work = u128::from(width) * u128::from(height) * u128::from(steps);
        let per_unit = u128::from(self.config.pixel_steps_per_unit.max(1));
        let units = work.div_ceil(per_unit).max(u128::from(self.config.min_units));
        u64::try_from(units).unwrap_or(u64::MAX)
    }
}

fn check(field: &'static str, value: u32, limit: u32) -> Result<(), OutOfBounds> {
    if value > limit {
        Err(OutOfBounds {
            field,
            value,
            limit,
        })
    } else {
        Ok(())
    }
}
