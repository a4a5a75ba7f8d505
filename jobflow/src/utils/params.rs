//! Job parameters: value conversion, secret masking and display ordering.

use regex::Regex;
use std::collections::BTreeMap;

/// Default pattern for parameter names whose values are never printed.
pub const DEFAULT_SECRET_PARAMS: &str = ".*passw.*|.*PASSW.*";

/// Replacement shown for secret parameter values.
pub const SECRET_MASK: &str = "******";

/// Empty parameter list for invocations without parameters.
pub const NO_PARAMS: [(&str, &str); 0] = [];

/// Parameters passed to one job invocation, sorted by name.
pub type JobParams = BTreeMap<String, String>;

/// A parameter value as sent to the job runner.
///
/// Booleans are lowercased and integers are stringified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamValue(String);

impl ParamValue {
    /// Returns the value as sent to the runner.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the value.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&String> for ParamValue {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self(value.to_string())
    }
}

macro_rules! param_value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(value: $ty) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

param_value_from_int!(i32, i64, u32, u64, usize);

/// Collects `(name, value)` pairs into [`JobParams`].
pub fn job_params<I, K, V>(params: I) -> JobParams
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ParamValue>,
{
    params
        .into_iter()
        .map(|(key, value)| (key.into(), value.into().into_string()))
        .collect()
}

/// Compiles a secret parameter pattern.
pub fn secret_params_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(pattern)
}

/// Returns a copy of `params` with secret values replaced by [`SECRET_MASK`].
#[must_use]
pub fn mask_secrets(params: &JobParams, secret_params: &Regex) -> JobParams {
    params
        .iter()
        .map(|(key, value)| {
            let shown = if secret_params.is_match(key) {
                SECRET_MASK.to_string()
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}

/// Orders parameters for display.
///
/// `order` has the form `[first..., "*", last...]`. Names not mentioned are
/// shown sorted at the position of `"*"`, or last when there is no `"*"`.
#[must_use]
pub fn display_order(params: &JobParams, order: &[String]) -> Vec<(String, String)> {
    let mut remaining = params.clone();
    let mut first = Vec::new();
    let mut last = Vec::new();
    let mut after_star = false;

    for name in order {
        if name == "*" {
            after_star = true;
        }
        if let Some(value) = remaining.remove(name) {
            let target = if after_star { &mut last } else { &mut first };
            target.push((name.clone(), value));
        }
    }

    first.into_iter().chain(remaining).chain(last).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(ordered: &[(String, String)]) -> Vec<&str> {
        ordered.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn test_bool_and_int_params_are_stringified() {
        let params = job_params([("flag", ParamValue::from(true)), ("count", ParamValue::from(3_i64))]);
        assert_eq!(params["flag"], "true");
        assert_eq!(params["count"], "3");

        let params = job_params([("off", false)]);
        assert_eq!(params["off"], "false");
    }

    #[test]
    fn test_mask_secrets_default_pattern() {
        let regex = secret_params_regex(DEFAULT_SECRET_PARAMS).unwrap();
        let params = job_params([("password", "s3cret"), ("DB_PASSWORD", "x"), ("user", "bob")]);

        let masked = mask_secrets(&params, &regex);
        assert_eq!(masked["password"], SECRET_MASK);
        assert_eq!(masked["DB_PASSWORD"], SECRET_MASK);
        assert_eq!(masked["user"], "bob");
    }

    #[test]
    fn test_display_order_with_star() {
        let params = job_params([("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")]);
        let order: Vec<String> = ["d", "*", "a"].iter().map(ToString::to_string).collect();

        assert_eq!(names(&display_order(&params, &order)), vec!["d", "b", "c", "e", "a"]);
    }

    #[test]
    fn test_display_order_without_star_puts_rest_last() {
        let params = job_params([("x", "1"), ("b", "2"), ("a", "3")]);
        let order = vec!["x".to_string()];

        assert_eq!(names(&display_order(&params, &order)), vec!["x", "a", "b"]);
    }

    #[test]
    fn test_display_order_ignores_unknown_names() {
        let params = job_params([("a", "1")]);
        let order = vec!["zzz".to_string(), "*".to_string()];
        assert_eq!(names(&display_order(&params, &order)), vec!["a"]);
    }
}
