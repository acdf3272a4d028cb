//! End-to-end tests driving full saga lifecycles through the
//! coordinator: forward success, automatic compensation, manual
//! decisions, compensation exhaustion and recovery, cancellation

use crate::model::{
    ChainDefinition, Decision, FailureRule, ManualDecision, MetadataRegistry, SagaMetadata,
    StepData,
};
use crate::types::{ActionType, FailureVerdict, SagaConfig, SagaStatus, StepStatus};
use crate::{CompensationHandler, SagaCoordinator, TenantContext};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn ctx() -> TenantContext {
    TenantContext::new("tenant-1")
}

/// Order fulfillment chain: Reserve and Charge are compensatable,
/// Ship auto-compensates on TIMEOUT and parks for an operator on
/// anything else
fn order_registry() -> Arc<MetadataRegistry> {
    let mut registry = MetadataRegistry::new();
    registry.register_chain(ChainDefinition::new(
        "OrderFlow",
        vec!["Reserve", "Charge", "Ship"],
    ));
    registry.register_component(SagaMetadata::new("Reserve").with_compensation("ReleaseReserve"));
    registry.register_component(SagaMetadata::new("Charge").with_compensation("RefundCharge"));
    registry.register_component(
        SagaMetadata::new("Ship")
            .with_rule(FailureRule::new("TIMEOUT", ActionType::AutoCompensate))
            .with_default_strategy(ActionType::ManualDecision),
    );
    Arc::new(registry)
}

fn fast_config() -> SagaConfig {
    SagaConfig {
        compensation_retry_delay_ms: 1,
        check_interval_ms: 10,
        ..Default::default()
    }
}

fn recording_handler(log: Arc<Mutex<Vec<String>>>, name: &str) -> CompensationHandler {
    let name = name.to_string();
    Arc::new(move |_step| {
        let log = log.clone();
        let name = name.clone();
        Box::new(Box::pin(async move {
            log.lock().await.push(name);
            Ok(())
        }))
    })
}

/// Handler that fails its first `fail_times` invocations
fn flaky_handler(counter: Arc<AtomicU32>, fail_times: u32) -> CompensationHandler {
    Arc::new(move |_step| {
        let counter = counter.clone();
        Box::new(Box::pin(async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= fail_times {
                Err(format!("downstream unavailable (call {})", call))
            } else {
                Ok(())
            }
        }))
    })
}

async fn run_forward_steps(
    coordinator: &SagaCoordinator,
    execution_id: &str,
    steps: &[(&str, &str)],
) {
    for (step_id, component) in steps {
        coordinator
            .on_step_start(&ctx(), execution_id, step_id, component, StepData::new())
            .await
            .unwrap();
        coordinator
            .on_step_success(&ctx(), execution_id, step_id, StepData::new())
            .await
            .unwrap();
    }
}

async fn wait_for_status(
    coordinator: &SagaCoordinator,
    execution_id: &str,
    expected: SagaStatus,
) {
    for _ in 0..200 {
        if coordinator.status(&ctx(), execution_id).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "execution {} never reached {:?}, stuck at {:?}",
        execution_id,
        expected,
        coordinator.status(&ctx(), execution_id).await.unwrap()
    );
}

#[tokio::test]
async fn test_forward_success_completes_saga() {
    let coordinator = Arc::new(SagaCoordinator::new(order_registry(), fast_config()));

    let execution_id = coordinator.begin_chain(&ctx(), "OrderFlow").await.unwrap();
    run_forward_steps(
        &coordinator,
        &execution_id,
        &[("s1", "Reserve"), ("s2", "Charge"), ("s3", "Ship")],
    )
    .await;

    assert_eq!(
        coordinator.status(&ctx(), &execution_id).await.unwrap(),
        SagaStatus::Completed
    );
    let stack = coordinator
        .get_execution_stack(&ctx(), &execution_id)
        .await
        .unwrap();
    let ids: Vec<&str> = stack.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ids, vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn test_timeout_failure_auto_compensates_in_reverse_order() {
    let coordinator = Arc::new(SagaCoordinator::new(order_registry(), fast_config()));
    coordinator.start().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    coordinator
        .register_compensation_handler(
            "ReleaseReserve",
            recording_handler(order.clone(), "ReleaseReserve"),
        )
        .await;
    coordinator
        .register_compensation_handler(
            "RefundCharge",
            recording_handler(order.clone(), "RefundCharge"),
        )
        .await;

    let execution_id = coordinator.begin_chain(&ctx(), "OrderFlow").await.unwrap();
    run_forward_steps(
        &coordinator,
        &execution_id,
        &[("s1", "Reserve"), ("s2", "Charge")],
    )
    .await;

    coordinator
        .on_step_start(&ctx(), &execution_id, "s3", "Ship", StepData::new())
        .await
        .unwrap();
    let verdict = coordinator
        .on_step_failure(
            &ctx(),
            &execution_id,
            "s3",
            "TIMEOUT",
            "carrier did not respond",
            None,
        )
        .await
        .unwrap();
    assert_eq!(verdict, FailureVerdict::Compensate);

    wait_for_status(&coordinator, &execution_id, SagaStatus::Compensated).await;

    // Charge was pushed after Reserve, so it is undone first
    assert_eq!(
        *order.lock().await,
        vec!["RefundCharge".to_string(), "ReleaseReserve".to_string()]
    );

    let execution_lock = coordinator.store().get(&execution_id).await.unwrap();
    let execution = execution_lock.read().await;
    assert_eq!(execution.step("s1").unwrap().status, StepStatus::Compensated);
    assert_eq!(execution.step("s2").unwrap().status, StepStatus::Compensated);
    assert_eq!(execution.step("s3").unwrap().status, StepStatus::Failed);
    drop(execution);

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_failure_parks_for_operator_continue() {
    let coordinator = Arc::new(SagaCoordinator::new(order_registry(), fast_config()));

    let execution_id = coordinator.begin_chain(&ctx(), "OrderFlow").await.unwrap();
    run_forward_steps(
        &coordinator,
        &execution_id,
        &[("s1", "Reserve"), ("s2", "Charge")],
    )
    .await;

    coordinator
        .on_step_start(&ctx(), &execution_id, "s3", "Ship", StepData::new())
        .await
        .unwrap();
    let verdict = coordinator
        .on_step_failure(
            &ctx(),
            &execution_id,
            "s3",
            "LABEL_PRINTER_JAM",
            "no rule for this one",
            None,
        )
        .await
        .unwrap();
    assert_eq!(verdict, FailureVerdict::ManualDecision);
    assert_eq!(
        coordinator.status(&ctx(), &execution_id).await.unwrap(),
        SagaStatus::WaitingManualDecision
    );

    let mut adjusted = StepData::new();
    adjusted.insert("carrier".to_string(), serde_json::json!("fallback-post"));
    coordinator
        .manual_decision(
            &ctx(),
            &execution_id,
            ManualDecision::new(Decision::Continue, "ops-alice", "ship manually")
                .with_modified_data(adjusted),
        )
        .await
        .unwrap();

    // Ship was the last step, so skipping it completes the saga
    assert_eq!(
        coordinator.status(&ctx(), &execution_id).await.unwrap(),
        SagaStatus::Completed
    );

    let execution_lock = coordinator.store().get(&execution_id).await.unwrap();
    let execution = execution_lock.read().await;
    assert_eq!(execution.step("s3").unwrap().status, StepStatus::Skipped);
    assert_eq!(execution.decisions.len(), 1);
    assert_eq!(execution.decisions[0].operator, "ops-alice");
}

#[tokio::test]
async fn test_compensation_exhaustion_then_operator_retry() {
    let config = fast_config();
    let max_attempts = config.max_compensation_attempts;
    let coordinator = Arc::new(SagaCoordinator::new(order_registry(), config));
    coordinator.start().await.unwrap();

    let refund_calls = Arc::new(AtomicU32::new(0));
    // Fails one call past the attempt budget, so the first drain
    // exhausts and the operator retry succeeds on its second attempt
    coordinator
        .register_compensation_handler(
            "RefundCharge",
            flaky_handler(refund_calls.clone(), max_attempts + 1),
        )
        .await;
    let order = Arc::new(Mutex::new(Vec::new()));
    coordinator
        .register_compensation_handler(
            "ReleaseReserve",
            recording_handler(order.clone(), "ReleaseReserve"),
        )
        .await;

    let execution_id = coordinator.begin_chain(&ctx(), "OrderFlow").await.unwrap();
    run_forward_steps(
        &coordinator,
        &execution_id,
        &[("s1", "Reserve"), ("s2", "Charge")],
    )
    .await;
    coordinator
        .on_step_start(&ctx(), &execution_id, "s3", "Ship", StepData::new())
        .await
        .unwrap();
    coordinator
        .on_step_failure(&ctx(), &execution_id, "s3", "TIMEOUT", "timed out", None)
        .await
        .unwrap();

    wait_for_status(&coordinator, &execution_id, SagaStatus::CompensationFailed).await;
    assert_eq!(refund_calls.load(Ordering::SeqCst), max_attempts);

    {
        let execution_lock = coordinator.store().get(&execution_id).await.unwrap();
        let execution = execution_lock.read().await;
        let step = execution.step("s2").unwrap();
        assert_eq!(step.status, StepStatus::CompensationFailed);
        assert_eq!(step.compensation_attempts, max_attempts);
        // The drain halted before reaching the earlier step
        assert_eq!(execution.step("s1").unwrap().status, StepStatus::Success);
    }

    coordinator
        .retry_compensation(&ctx(), &execution_id, "s2", "ops-alice", "downstream recovered")
        .await
        .unwrap();

    assert_eq!(
        coordinator.status(&ctx(), &execution_id).await.unwrap(),
        SagaStatus::Compensated
    );
    assert_eq!(*order.lock().await, vec!["ReleaseReserve".to_string()]);

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_forward_progress() {
    let coordinator = Arc::new(SagaCoordinator::new(order_registry(), fast_config()));

    let execution_id = coordinator.begin_chain(&ctx(), "OrderFlow").await.unwrap();
    run_forward_steps(&coordinator, &execution_id, &[("s1", "Reserve")]).await;

    coordinator
        .cancel(&ctx(), &execution_id, "ops-bob", "customer withdrew order")
        .await
        .unwrap();
    assert_eq!(
        coordinator.status(&ctx(), &execution_id).await.unwrap(),
        SagaStatus::Cancelled
    );

    // A cancelled saga accepts no further step events
    assert!(coordinator
        .on_step_start(&ctx(), &execution_id, "s2", "Charge", StepData::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_tenant_isolation_through_coordinator() {
    let coordinator = Arc::new(SagaCoordinator::new(order_registry(), fast_config()));

    let execution_id = coordinator.begin_chain(&ctx(), "OrderFlow").await.unwrap();

    let other = TenantContext::new("tenant-2");
    assert!(coordinator.status(&other, &execution_id).await.is_err());
    assert!(coordinator
        .on_step_start(&other, &execution_id, "s1", "Reserve", StepData::new())
        .await
        .is_err());
}
