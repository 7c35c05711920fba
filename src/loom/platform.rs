use std::{fmt::Display, str::FromStr};

pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// Reads `key` from the environment, falling back to `default` if it is unset or unparsable.
pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(value) => value,
            Err(err) => {
                log::warn!("ignoring invalid {key}=`{value}`: {err}");
                default
            }
        },
        Err(_) => default,
    }
}
