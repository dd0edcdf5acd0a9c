//! Demo of the async test loop
//!
//! Runs one group with an ordered async test, a worker-thread test and a
//! sync check, then exits with the number of failed tests.
//!
//! Usage:
//!   cargo run --bin loop_demo
//!   RUST_LOG=async_test_loop=debug cargo run --bin loop_demo   # marker transitions
//!   TESTLOOP_JITTER_PCT=0 cargo run --bin loop_demo           # no jitter

use async_test_loop::{check, init_tracing, Done, LoopConfig, TestGroup, Totals};
use std::thread;
use std::time::Duration;

fn main() {
    init_tracing();
    let mut config = LoopConfig::from_env();
    // Set the default delay fuzziness for every loop in the group.
    config.jitter_pct = config.jitter_pct.min(40);

    let report = TestGroup::new("group one")
        .with_config(config)
        .before_each(|name| {
            tracing::info!(test = name, "beforeEach");
            Ok(())
        })
        .async_test(
            "test one",
            vec![
                Done::new("event 1").order(1),
                Done::new("event 2").order(2).timeout(4000),
            ],
            |ctx| {
                ctx.schedule(100, |ctx| {
                    ctx.resolve("event 1")?;
                    ctx.schedule(100, |ctx| {
                        ctx.resolve("event 2")?;
                        Ok(())
                    });
                    Ok(())
                });
                Ok(())
            },
        )
        .async_test("test two", Vec::new(), |ctx| {
            let handle = ctx.handle();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(150));
                if let Err(e) = handle.resolve_default() {
                    tracing::error!(error = %e, "worker could not resolve");
                }
            });
            Ok(())
        })
        .sync_test("test three", || {
            let a = 2;
            check!(a == 2);
            Ok(())
        })
        .run();

    let mut totals = Totals::default();
    totals.add(&report);
    totals.log_summary();
    std::process::exit(totals.exit_code());
}
