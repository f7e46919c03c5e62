//! Internal testing utilities for the shardprop crates.

use std::any::Any;
use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Table-driven test runner.
///
/// Implemented for any collection of test cases. Conventionally a test
/// defines a `Case` struct deriving `Debug`, builds an array of cases and
/// calls `test_each` with the assertions to run for each one:
///
/// ```
/// use shardprop_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     ndim: usize,
///     sharded_axes: usize,
///     replicated_axes: usize,
/// }
///
/// let cases = [
///     Case { ndim: 2, sharded_axes: 1, replicated_axes: 1 },
///     Case { ndim: 3, sharded_axes: 0, replicated_axes: 3 },
/// ];
///
/// cases.test_each(|case| {
///     assert_eq!(case.sharded_axes + case.replicated_axes, case.ndim);
/// });
/// ```
///
/// Every case is run even if earlier ones fail. Once all cases have run,
/// the runner panics with the index, debug representation and panic
/// message of each failing case.
///
/// Cases and captured values must be unwind safe. Wrap values which are
/// not in [`AssertUnwindSafe`](std::panic::AssertUnwindSafe), or construct
/// them inside the test closure.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Run `test` with a reference to each case.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Run `test` with an owned clone of each case.
    ///
    /// Useful when the test consumes fields of the case, eg. to move a
    /// graph into the code under test.
    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe;
}

/// A failed test case.
struct Failure {
    index: usize,
    case: String,
    message: String,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

fn report(failures: Vec<Failure>) {
    if failures.is_empty() {
        return;
    }
    let mut summary = format!("{} test cases failed:", failures.len());
    for failure in &failures {
        summary.push_str(&format!(
            "\n  case #{} {}: {}",
            failure.index, failure.case, failure.message
        ));
    }
    panic!("{}", summary);
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let mut failures = Vec::new();
        for (index, case) in self.into_iter().enumerate() {
            if let Err(payload) = std::panic::catch_unwind(|| test(&case)) {
                failures.push(Failure {
                    index,
                    case: format!("{:?}", case),
                    message: panic_message(payload.as_ref()),
                });
            }
        }
        report(failures);
    }

    fn test_each_clone(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe,
    {
        let mut failures = Vec::new();
        for (index, case) in self.into_iter().enumerate() {
            let owned = case.clone();
            let test = &test;
            if let Err(payload) = std::panic::catch_unwind(move || test(owned)) {
                failures.push(Failure {
                    index,
                    case: format!("{:?}", case),
                    message: panic_message(payload.as_ref()),
                });
            }
        }
        report(failures);
    }
}

#[cfg(test)]
mod tests {
    use super::TestCases;

    #[derive(Clone, Debug)]
    struct Case {
        x: i32,
    }

    #[test]
    fn test_all_cases_pass() {
        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.clone().test_each(|case| assert!(case.x > 0));
        cases.test_each_clone(|case| assert!(case.x > 0));
    }

    #[test]
    #[should_panic(expected = "1 test cases failed")]
    fn test_reports_failing_case() {
        let cases = [Case { x: 1 }, Case { x: -1 }];
        cases.test_each(|case| assert!(case.x > 0, "x must be positive"));
    }

    #[test]
    #[should_panic(expected = "case #1 Case { x: -3 }: negative")]
    fn test_clone_failure_includes_message() {
        let cases = [Case { x: 1 }, Case { x: -3 }];
        cases.test_each_clone(|case| {
            if case.x < 0 {
                panic!("negative");
            }
        });
    }
}
