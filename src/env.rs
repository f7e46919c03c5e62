//! Parsing of configuration overrides from environment variables.

/// Interpret a string value such as "1" or "no" as a boolean.
///
/// Returns `None` for unrecognized values.
pub fn str_as_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "t" | "yes" | "y" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Return the value of environment variable `name`, if set and valid
/// Unicode.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    match env_var(name) {
        Some(val) => str_as_bool(&val).unwrap_or_else(|| {
            tracing::warn!(var = name, value = %val, "unrecognized boolean value");
            default
        }),
        None => default,
    }
}

/// Return the value of an environment variable parsed as a positive
/// integer, or `None` if unset or invalid.
pub fn env_usize(name: &str) -> Option<usize> {
    let val = env_var(name)?;
    match val.trim().parse() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(var = name, value = %val, "expected a positive integer");
            None
        }
    }
}

/// Return the value of an environment variable matched against a list of
/// `(name, value)` choices, or `None` if unset or not one of the choices.
pub fn env_choice<T: Copy>(name: &str, choices: &[(&str, T)]) -> Option<T> {
    let val = env_var(name)?;
    let key = val.trim().to_ascii_lowercase();
    let choice = choices
        .iter()
        .find(|(choice, _)| *choice == key)
        .map(|(_, value)| *value);
    if choice.is_none() {
        tracing::warn!(var = name, value = %val, "unrecognized value");
    }
    choice
}

#[cfg(test)]
mod tests {
    use shardprop_testing::TestCases;

    use super::str_as_bool;

    #[test]
    fn test_str_as_bool() {
        #[derive(Debug)]
        struct Case {
            value: &'static str,
            expected: Option<bool>,
        }

        let cases = [
            ("1", Some(true)),
            ("yes", Some(true)),
            ("t", Some(true)),
            ("0", Some(false)),
            ("no", Some(false)),
            ("maybe", None),
            ("", None),
        ]
        .map(|(value, expected)| Case { value, expected });

        cases.test_each(|case| {
            assert_eq!(str_as_bool(case.value), case.expected);
        });
    }
}
