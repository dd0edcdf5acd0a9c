//! Test groups
//!
//! Thin registration layer over the event loop: a group holds sync tests
//! (plain bodies) and async tests (bodies run as the first call of their own
//! `EventLoop`), runs them in order and returns a `GroupReport`. `Totals`
//! aggregates reports across groups; nothing here is global.

use crate::clock;
use crate::done::Done;
use crate::engine::{Callback, EventLoop, LoopConfig, LoopCtx};
use crate::error::{CallError, CallResult};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, info, warn};

/// Bail out of a test body or loop call when `cond` is false.
#[macro_export]
macro_rules! check {
    ($cond:expr) => {
        if !($cond) {
            return ::core::result::Result::Err($crate::CallError::Bailout(
                ::std::string::String::from(concat!(
                    "check(",
                    stringify!($cond),
                    ") failed at ",
                    file!(),
                    ":",
                    line!()
                )),
            ));
        }
    };
}

/// `check!` the condition, then resolve `tag` on the loop.
#[macro_export]
macro_rules! done_or_error {
    ($ctx:expr, $cond:expr, $tag:expr) => {
        $crate::check!($cond);
        $ctx.resolve($tag)?;
    };
}

type SyncBody = Box<dyn FnOnce() -> CallResult>;

enum Body {
    Sync(SyncBody),
    Async { dones: Vec<Done>, body: Callback },
}

struct TestCase {
    name: String,
    body: Body,
    disabled: bool,
}

/// A failed test and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestFailure {
    pub test: String,
    pub message: String,
}

/// Result of running one group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub name: String,
    /// Enabled tests.
    pub num_tests: usize,
    pub num_disabled: usize,
    pub failures: Vec<TestFailure>,
    /// Errors outside any single test, e.g. in group cleanup.
    pub group_errors: Vec<String>,
    pub exec_ms: i64,
}

impl GroupReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.group_errors.is_empty()
    }

    pub fn num_errors(&self) -> usize {
        self.failures.len() + self.group_errors.len()
    }
}

/// Aggregate over several groups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub groups: usize,
    pub tests: usize,
    pub failed: usize,
    pub disabled: usize,
    pub exec_ms: i64,
}

impl Totals {
    pub fn add(&mut self, report: &GroupReport) {
        self.groups += 1;
        self.tests += report.num_tests;
        self.failed += report.failures.len();
        self.disabled += report.num_disabled;
        self.exec_ms += report.exec_ms;
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Process exit status: the number of failed tests.
    pub fn exit_code(&self) -> i32 {
        i32::try_from(self.failed).unwrap_or(i32::MAX)
    }

    pub fn log_summary(&self) {
        if self.all_passed() {
            info!(
                tests = self.tests,
                groups = self.groups,
                exec_ms = self.exec_ms,
                "all tests passed"
            );
        } else {
            error!(
                failed = self.failed,
                tests = self.tests,
                groups = self.groups,
                exec_ms = self.exec_ms,
                "some tests failed"
            );
        }
        if self.disabled > 0 {
            warn!(disabled = self.disabled, "tests disabled");
        }
    }
}

/// A named group of tests sharing hooks and loop configuration.
pub struct TestGroup {
    name: String,
    config: LoopConfig,
    tests: Vec<TestCase>,
    before_each: Option<Box<dyn FnMut(&str) -> CallResult>>,
    after_each: Option<Box<dyn FnMut(&str)>>,
    cleanup: Option<SyncBody>,
}

impl TestGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: LoopConfig::default(),
            tests: Vec::new(),
            before_each: None,
            after_each: None,
            cleanup: None,
        }
    }

    /// Configuration for every async test's loop.
    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs before each test body; a failure here fails the test.
    pub fn before_each(mut self, f: impl FnMut(&str) -> CallResult + 'static) -> Self {
        self.before_each = Some(Box::new(f));
        self
    }

    /// Runs after each test; panics here are logged and ignored.
    pub fn after_each(mut self, f: impl FnMut(&str) + 'static) -> Self {
        self.after_each = Some(Box::new(f));
        self
    }

    /// Runs once after all tests.
    pub fn cleanup(mut self, f: impl FnOnce() -> CallResult + 'static) -> Self {
        self.cleanup = Some(Box::new(f));
        self
    }

    pub fn sync_test(
        mut self,
        name: impl Into<String>,
        f: impl FnOnce() -> CallResult + 'static,
    ) -> Self {
        self.tests.push(TestCase {
            name: name.into(),
            body: Body::Sync(Box::new(f)),
            disabled: false,
        });
        self
    }

    /// Test whose body runs as the first call of a fresh loop. With no
    /// `dones` the loop gets the implicit `_default` marker.
    pub fn async_test<F>(mut self, name: impl Into<String>, dones: Vec<Done>, f: F) -> Self
    where
        F: FnOnce(&mut LoopCtx<'_>) -> CallResult + Send + 'static,
    {
        self.tests.push(TestCase {
            name: name.into(),
            body: Body::Async {
                dones,
                body: Box::new(f),
            },
            disabled: false,
        });
        self
    }

    /// Skip the test(s) registered under `name`.
    pub fn disable(mut self, name: &str) -> Self {
        for test in self.tests.iter_mut().filter(|t| t.name == name) {
            test.disabled = true;
        }
        self
    }

    pub fn run(mut self) -> GroupReport {
        let tests = std::mem::take(&mut self.tests);
        let num_disabled = tests.iter().filter(|t| t.disabled).count();
        let mut report = GroupReport {
            name: self.name.clone(),
            num_tests: tests.len() - num_disabled,
            num_disabled,
            ..Default::default()
        };
        info!(
            group = %self.name,
            tests = report.num_tests,
            disabled = num_disabled,
            "RUN group"
        );

        for test in tests {
            if test.disabled {
                warn!(test = %test.name, "disabled");
                continue;
            }
            let (exec_ms, failure) = self.run_one(&test.name, test.body);
            report.exec_ms += exec_ms;
            match failure {
                None => info!(test = %test.name, exec_ms, "pass"),
                Some(message) => {
                    error!(test = %test.name, exec_ms, %message, "fail");
                    report.failures.push(TestFailure {
                        test: test.name,
                        message,
                    });
                }
            }
        }

        if let Some(cleanup) = self.cleanup.take() {
            if let Err(msg) = catch(cleanup) {
                report
                    .group_errors
                    .push(format!("Exception in cleanup of test group: {}", msg));
            }
        }

        if report.passed() {
            info!(group = %report.name, tests = report.num_tests, exec_ms = report.exec_ms, "PASS");
        } else {
            error!(
                group = %report.name,
                errors = report.num_errors(),
                tests = report.num_tests,
                exec_ms = report.exec_ms,
                "FAIL"
            );
        }
        report
    }

    fn run_one(&mut self, name: &str, body: Body) -> (i64, Option<String>) {
        info!(test = name, "run");
        if let Some(before) = self.before_each.as_mut() {
            if let Err(msg) = catch(|| before(name)) {
                return (0, Some(format!("Error during 'before-each': {}", msg)));
            }
        }

        let start = clock::now_ms();
        let result = match body {
            Body::Sync(body) => catch(body),
            Body::Async { dones, body } => run_async(&self.config, dones, body),
        };
        let exec_ms = clock::now_ms() - start;

        if let Some(after) = self.after_each.as_mut() {
            if panic::catch_unwind(AssertUnwindSafe(|| after(name))).is_err() {
                warn!(test = name, "after-each panicked");
            }
        }
        (exec_ms, result.err())
    }
}

fn run_async(config: &LoopConfig, dones: Vec<Done>, body: Callback) -> Result<(), String> {
    let lp = if dones.is_empty() {
        EventLoop::with_config(config.clone())
    } else {
        EventLoop::with_config_and_dones(config.clone(), dones)
            .map_err(|e| format!("Usage error: {}", e))?
    };
    lp.schedule_with_jitter(0, 0, body);

    let mut outcome = None;
    catch(|| {
        outcome = Some(lp.run()?);
        Ok(())
    })?;
    match outcome {
        Some(o) if o.is_error() => Err(o.error.unwrap_or_else(|| "unknown loop error".into())),
        _ => Ok(()),
    }
}

/// Run a body, turning bail-outs, usage errors and panics into a message.
fn catch(f: impl FnOnce() -> CallResult) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(CallError::Bailout(msg))) => Err(msg),
        Ok(Err(CallError::Usage(e))) => Err(format!("Usage error: {}", e)),
        Err(payload) => Err(format!("Exception: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn quiet() -> LoopConfig {
        LoopConfig {
            jitter_pct: 0,
            default_timeout_ms: 300,
            seed: Some("runner".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_sync_pass_and_check_failure() {
        let report = TestGroup::new("sync")
            .sync_test("passes", || {
                let a = 2;
                crate::check!(a == 2);
                Ok(())
            })
            .sync_test("fails", || {
                let a = 3;
                crate::check!(a == 2);
                Ok(())
            })
            .run();

        assert_eq!(report.num_tests, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].test, "fails");
        assert!(report.failures[0].message.starts_with("check(a == 2) failed at "));
    }

    #[test]
    fn test_panic_is_caught() {
        let report = TestGroup::new("panics")
            .sync_test("boom", || panic!("kaboom"))
            .run();
        assert_eq!(report.failures[0].message, "Exception: kaboom");
    }

    #[test]
    fn test_async_default_done() {
        let report = TestGroup::new("async")
            .with_config(quiet())
            .async_test("resolves", Vec::new(), |ctx| {
                ctx.schedule(20, |ctx| {
                    ctx.resolve_default()?;
                    Ok(())
                });
                Ok(())
            })
            .async_test("times out", Vec::new(), |_| Ok(()))
            .run();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].test, "times out");
        assert_eq!(report.failures[0].message, "done('_default'): Timeout");
    }

    #[test]
    fn test_async_ordered_dones() {
        let report = TestGroup::new("ordered")
            .with_config(quiet())
            .async_test(
                "in order",
                vec![Done::new("event 1").order(1), Done::new("event 2").order(2)],
                |ctx| {
                    ctx.schedule(10, |ctx| {
                        crate::done_or_error!(ctx, 1 + 1 == 2, "event 1");
                        ctx.schedule(10, |ctx| {
                            ctx.resolve("event 2")?;
                            Ok(())
                        });
                        Ok(())
                    });
                    Ok(())
                },
            )
            .run();
        assert!(report.passed(), "{:?}", report.failures);
    }

    #[test]
    fn test_usage_error_fails_test() {
        let report = TestGroup::new("usage")
            .with_config(quiet())
            .async_test("unknown tag", Vec::new(), |ctx| {
                ctx.resolve("nope")?;
                Ok(())
            })
            .async_test("duplicate", vec![Done::new("a"), Done::new("a")], |_| Ok(()))
            .run();
        assert_eq!(report.failures.len(), 2);
        assert_eq!(
            report.failures[0].message,
            "Usage error: Unknown done() tag 'nope'"
        );
        assert_eq!(
            report.failures[1].message,
            "Usage error: addDone: Duplicate done() tag 'a'"
        );
    }

    #[test]
    fn test_hooks_and_disabled() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let before = seen.clone();
        let after = seen.clone();
        let cleanup = seen.clone();

        let report = TestGroup::new("hooks")
            .before_each(move |name| {
                before.borrow_mut().push(format!("before {}", name));
                Ok(())
            })
            .after_each(move |name| after.borrow_mut().push(format!("after {}", name)))
            .cleanup(move || {
                cleanup.borrow_mut().push("cleanup".to_string());
                Ok(())
            })
            .sync_test("one", || Ok(()))
            .sync_test("skipped", || Ok(()))
            .disable("skipped")
            .run();

        assert!(report.passed());
        assert_eq!(report.num_tests, 1);
        assert_eq!(report.num_disabled, 1);
        assert_eq!(
            *seen.borrow(),
            vec!["before one", "after one", "cleanup"]
        );
    }

    #[test]
    fn test_failing_before_each() {
        let report = TestGroup::new("setup")
            .before_each(|_| Err(CallError::Bailout("no fixture".into())))
            .sync_test("never runs", || panic!("body must not run"))
            .run();
        assert_eq!(
            report.failures[0].message,
            "Error during 'before-each': no fixture"
        );
    }

    #[test]
    fn test_totals() {
        let mut totals = Totals::default();
        totals.add(&GroupReport {
            name: "a".into(),
            num_tests: 3,
            num_disabled: 1,
            failures: vec![TestFailure {
                test: "x".into(),
                message: "m".into(),
            }],
            group_errors: Vec::new(),
            exec_ms: 10,
        });
        totals.add(&GroupReport {
            name: "b".into(),
            num_tests: 2,
            exec_ms: 5,
            ..Default::default()
        });
        assert_eq!(totals.groups, 2);
        assert_eq!(totals.tests, 5);
        assert_eq!(totals.disabled, 1);
        assert_eq!(totals.exec_ms, 15);
        assert!(!totals.all_passed());
        assert_eq!(totals.exit_code(), 1);
    }
}
