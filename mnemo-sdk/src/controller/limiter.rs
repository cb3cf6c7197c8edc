//! Per-class token buckets.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;

use super::OperationClass;
use crate::config::{ConfigValidationError, ControllerConfig, RateLimit};
use crate::SDKResult;

fn quota(field: &str, limit: RateLimit) -> SDKResult<Quota> {
    let invalid = || ConfigValidationError::InvalidValue {
        field: field.into(),
        message: "per_second and burst must be greater than 0".into(),
    };
    let per_second = NonZeroU32::new(limit.per_second).ok_or_else(invalid)?;
    let burst = NonZeroU32::new(limit.burst).ok_or_else(invalid)?;
    Ok(Quota::per_second(per_second).allow_burst(burst))
}

/// One direct limiter per operation class.
pub struct ClassLimiters {
    search: DefaultDirectRateLimiter,
    write: DefaultDirectRateLimiter,
    consolidate: DefaultDirectRateLimiter,
}

impl ClassLimiters {
    pub fn new(config: &ControllerConfig) -> SDKResult<Self> {
        Ok(Self {
            search: RateLimiter::direct(quota("controller.search_rate", config.search_rate)?),
            write: RateLimiter::direct(quota("controller.write_rate", config.write_rate)?),
            consolidate: RateLimiter::direct(quota("controller.consolidate_rate", config.consolidate_rate)?),
        })
    }

    fn limiter(&self, class: OperationClass) -> &DefaultDirectRateLimiter {
        match class {
            OperationClass::Search => &self.search,
            OperationClass::Write => &self.write,
            OperationClass::Consolidate => &self.consolidate,
        }
    }

    /// Wait for a token of `class`.
    pub async fn until_ready(&self, class: OperationClass) {
        self.limiter(class).until_ready().await;
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self, class: OperationClass) -> bool {
        self.limiter(class).check().is_ok()
    }
}
