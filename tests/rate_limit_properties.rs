//! The token-bucket bound across concurrent workflows: completed agent
//! invocations in [0, t] never exceed C + r·t for the shared bucket.

mod common;

use std::time::Instant;

use common::*;
use quorum::{ScriptedAgent, ScriptedOutcome, WorkflowStatus};

#[tokio::test]
async fn shared_bucket_bounds_total_invocation_rate() {
    let mut config = test_config();
    config.max_concurrent_workflows = 4;
    config.rate_limits.insert(
        STUB.to_string(),
        quorum::config::RateLimitOverride {
            capacity: 2,
            refill_per_second: 50.0,
        },
    );
    let agent = ScriptedAgent::new(STUB).with_fallback(ScriptedOutcome::Succeed {
        text: plan_json(&[("t1", &[]), ("t2", &["t1"])]),
    });
    let h = harness_with_agent(config, agent).await;

    let a = create_workflow(&h, "rate limited a").await;
    let b = create_workflow(&h, "rate limited b").await;

    let start = Instant::now();
    let handle_a = h.orchestrator.start(&a, false).await.unwrap().unwrap();
    let handle_b = h.orchestrator.start(&b, false).await.unwrap().unwrap();
    handle_a.wait().await.unwrap();
    handle_b.wait().await.unwrap();
    let elapsed = start.elapsed();

    // 10 invocations drained one shared {C=2, r=50/s} bucket: at least
    // (10 - 2) / 50 = 160 ms of refill had to pass. Checked loosely to
    // stay robust on slow machines.
    let invocations = h.agent.invocation_count() as f64;
    assert_eq!(invocations, 10.0);
    let bound = 2.0 + 50.0 * elapsed.as_secs_f64();
    assert!(
        invocations <= bound,
        "{invocations} invocations exceed C + r*t = {bound:.1}"
    );
    assert!(
        elapsed.as_millis() >= 120,
        "completed suspiciously fast for the configured bucket: {elapsed:?}"
    );

    for id in [&a, &b] {
        assert_eq!(
            h.orchestrator.get(id).await.unwrap().status,
            WorkflowStatus::Completed
        );
    }
}
