//! Typed operator parameters parsed from string key/value pairs.
//!
//! Parameter structs derive [`Params`](weft_derive::Params); each field type implements
//! [`ParamValue`]. Unknown keys are rejected, fields without a default are required and
//! `Option<_>` fields may be omitted.

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{context::Context, num::DataType, shape::Shape};

pub type ParamDict = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("required parameter `{0}` is missing")]
    Missing(&'static str),
    #[error("unknown parameter `{key}`, expected one of [{expected}]")]
    Unknown { key: String, expected: String },
    #[error("invalid value `{value}` for parameter `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("parameters `{0}` were not parsed for this op")]
    Unparsed(&'static str),
}

pub trait Params: Sized + Send + Sync + 'static {
    /// Keys accepted by the parameter struct.
    const FIELDS: &'static [&'static str];

    fn from_dict(dict: &ParamDict) -> Result<Self, ParamError>;
}

/// A value that can be parsed from a parameter string.
pub trait ParamValue: Sized {
    fn parse_param(value: &str) -> Result<Self, String>;
}

macro_rules! impl_param_value_from_str {
    ($($t:ty),+) => {
        $(
            impl ParamValue for $t {
                #[inline]
                fn parse_param(value: &str) -> Result<Self, String> {
                    value.trim().parse().map_err(|err| format!("{err}"))
                }
            }
        )+
    };
}

impl_param_value_from_str!(usize, u64, i32, i64, f32, f64, String, Shape, DataType, Context);

impl ParamValue for bool {
    fn parse_param(value: &str) -> Result<Self, String> {
        match value.trim() {
            "true" | "True" | "1" => Ok(true),
            "false" | "False" | "0" => Ok(false),
            value => Err(format!("`{value}` is not a boolean")),
        }
    }
}

/// Checks that every key of `dict` is one of `fields`.
pub fn check_keys(dict: &ParamDict, fields: &[&str]) -> Result<(), ParamError> {
    match dict.keys().find(|key| !fields.contains(&key.as_str())) {
        Some(key) => Err(ParamError::Unknown {
            key: key.clone(),
            expected: fields.join(", "),
        }),
        None => Ok(()),
    }
}

/// Parses a field, falling back to `default` when the key is absent.
pub fn field<T: ParamValue>(
    dict: &ParamDict,
    key: &'static str,
    default: Option<&str>,
) -> Result<T, ParamError> {
    let value = match (dict.get(key), default) {
        (Some(value), _) => value.as_str(),
        (None, Some(default)) => default,
        (None, None) => return Err(ParamError::Missing(key)),
    };
    T::parse_param(value).map_err(|reason| ParamError::Invalid {
        key,
        value: value.to_string(),
        reason,
    })
}

/// Parses a field that may be omitted.
pub fn optional<T: ParamValue>(dict: &ParamDict, key: &'static str) -> Result<Option<T>, ParamError> {
    dict.get(key)
        .map(|value| {
            T::parse_param(value).map_err(|reason| ParamError::Invalid {
                key,
                value: value.clone(),
                reason,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use weft_derive::Params;

    use super::{ParamDict, ParamError, Params};
    use crate::loom::shape::Shape;

    #[derive(Debug, Params)]
    #[params(crate = "crate")]
    struct DemoParam {
        axis: Shape,
        #[param(default = "false")]
        keepdims: bool,
        #[param(rename = "num_args", default = "1")]
        count: usize,
        scale: Option<f32>,
    }

    fn dict(pairs: &[(&str, &str)]) -> ParamDict {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_derive_params() -> Result<(), ParamError> {
        let param = DemoParam::from_dict(&dict(&[("axis", "(0,2)"), ("num_args", "3")]))?;
        assert_eq!(param.axis, Shape::from([0, 2]));
        assert!(!param.keepdims);
        assert_eq!(param.count, 3);
        assert_eq!(param.scale, None);

        let param = DemoParam::from_dict(&dict(&[("axis", "1"), ("scale", "0.5")]))?;
        assert_eq!(param.scale, Some(0.5));
        Ok(())
    }

    #[test]
    fn test_params_errors() {
        let err = DemoParam::from_dict(&dict(&[])).unwrap_err();
        assert!(matches!(err, ParamError::Missing("axis")));

        let err = DemoParam::from_dict(&dict(&[("axis", "1"), ("bogus", "1")])).unwrap_err();
        assert!(matches!(err, ParamError::Unknown { .. }));

        let err = DemoParam::from_dict(&dict(&[("axis", "1"), ("keepdims", "maybe")])).unwrap_err();
        assert!(matches!(err, ParamError::Invalid { key: "keepdims", .. }));
    }
}
