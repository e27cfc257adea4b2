//! Process-wide allocator settings.
//!
//! These are resolved once, the first time the heap is touched. Reading
//! them must not allocate since we may be the global allocator at that
//! point, so the environment is read through [`libc::getenv`] directly.

use std::{ffi::CStr, str::FromStr};

use thiserror::Error;

/// Environment variable selecting the [`FitStrategy`].
pub const ALGORITHM_VAR: &CStr = c"ALLOCATOR_ALGORITHM";

/// Environment variable enabling payload scribbling.
pub const SCRIBBLE_VAR: &CStr = c"ALLOCATOR_SCRIBBLE";

/// How a free block is picked for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FitStrategy {
    /// First block on the free list that is big enough.
    #[default]
    First,
    /// Smallest block that is big enough.
    Best,
    /// Largest block on the free list.
    Worst,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown fit strategy `{0}`")]
pub struct ParseStrategyError(pub String);

impl FromStr for FitStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| ParseStrategyError(s.to_owned()))
    }
}

impl FitStrategy {
    /// Non-allocating counterpart of [`FromStr`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "first" | "first_fit" => Some(Self::First),
            "best" | "best_fit" => Some(Self::Best),
            "worst" | "worst_fit" => Some(Self::Worst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    pub strategy: FitStrategy,
    /// Fill new payloads with [`crate::utils::SCRIBBLE_BYTE`] before handing them out.
    pub scribble: bool,
}

impl Config {
    pub const fn new(strategy: FitStrategy, scribble: bool) -> Self {
        Self { strategy, scribble }
    }

    /// Reads [`ALGORITHM_VAR`] and [`SCRIBBLE_VAR`]. Anything unrecognised
    /// falls back to the defaults.
    pub fn from_env() -> Self {
        let strategy = getenv(ALGORITHM_VAR)
            .and_then(FitStrategy::from_name)
            .unwrap_or_default();

        let scribble = getenv(SCRIBBLE_VAR).is_some_and(is_enabled);

        Self { strategy, scribble }
    }
}

fn is_enabled(value: &str) -> bool {
    !matches!(value, "" | "0" | "false")
}

fn getenv(name: &CStr) -> Option<&'static str> {
    // Nothing in this crate modifies the environment.
    unsafe {
        let value = libc::getenv(name.as_ptr());
        if value.is_null() {
            return None;
        }
        CStr::from_ptr(value).to_str().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names() {
        assert_eq!(Ok(FitStrategy::First), "first_fit".parse());
        assert_eq!(Ok(FitStrategy::Best), "best".parse());
        assert_eq!(Ok(FitStrategy::Worst), "worst_fit".parse());
        assert_eq!(
            Err(ParseStrategyError("next_fit".into())),
            "next_fit".parse::<FitStrategy>()
        );
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(FitStrategy::First, config.strategy);
        assert!(!config.scribble);
    }

    #[test]
    fn scribble_values() {
        assert!(is_enabled("1"));
        assert!(is_enabled("yes"));
        assert!(!is_enabled("0"));
        assert!(!is_enabled(""));
        assert!(!is_enabled("false"));
    }

    #[test]
    fn missing_variable() {
        assert_eq!(None, getenv(c"MEMALLOC_SURELY_UNSET_VARIABLE"));
    }
}
