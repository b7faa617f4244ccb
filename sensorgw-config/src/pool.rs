//! Block pool geometry for outgoing documents.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    #[validate(range(min = 64, max = 1048576))]
    pub page_size: usize,

    /// Requests strictly below this size are served from the pool.
    #[validate(range(min = 8, max = 65536))]
    pub block_size: usize,

    #[validate(range(max = 4096))]
    #[validate(custom(function = validation::validate_power_of_two))]
    pub alignment: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            block_size: 128,
            alignment: 16,
        }
    }
}
