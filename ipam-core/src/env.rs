//! helpers for reading settings that only come from the environment
use anyhow::Context;

use std::{env, str};

/// Reads `name` from the environment and parses it, using `default` when the
/// variable is unset
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
}

/// [`parse_var`] with the variable name attached to the error
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}
