//! Workflow runner lifecycle: the linear scenario, single-completion,
//! pause/resume, and the resume cap.

mod common;

use std::time::Duration;

use common::*;
use quorum::{
    EventPayload, QuorumError, ScriptedOutcome, TaskStatus, WorkflowStatus,
};

#[tokio::test]
async fn linear_plan_runs_to_completion_in_order() {
    let h = harness().await;
    push_pipeline(&h.agent, &plan_json(&[("t1", &[]), ("t2", &["t1"]), ("t3", &["t2"])]));
    push_task_success(&h.agent, "one.txt");
    push_task_success(&h.agent, "two.txt");
    push_task_success(&h.agent, "three.txt");

    let id = create_workflow(&h, "add /health endpoint").await;
    let mut subscriber = h.orchestrator.subscribe();
    let handle = h.orchestrator.start(&id, false).await.unwrap().unwrap();
    let events = collect_until_terminal(&mut subscriber, &id).await;
    handle.wait().await.unwrap();

    assert_eq!(
        lifecycle_trace(&events),
        vec![
            "started",
            "phase:refine",
            "phase:analyze",
            "phase:plan",
            "phase:execute",
            "task_started:t1",
            "task_completed:t1",
            "task_started:t2",
            "task_completed:t2",
            "task_started:t3",
            "task_completed:t3",
            "completed",
        ]
    );

    let workflow = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let branch = workflow.workflow_branch.clone().unwrap();
    assert_eq!(branch, format!("quorum/{id}"));
    for task in workflow.tasks.values() {
        assert_eq!(task.status, TaskStatus::Completed);
        let task_branch = task.branch.as_ref().unwrap();
        assert!(h.git.is_merged_into(task_branch, &branch).unwrap());
    }

    // All three files landed on the workflow branch tip.
    assert_eq!(workflow.metrics.tasks_completed, 3);
}

#[tokio::test]
async fn exactly_one_terminal_event_per_run() {
    let h = harness().await;
    push_pipeline(&h.agent, &plan_json(&[("t1", &[])]));
    push_task_success(&h.agent, "only.txt");

    let id = create_workflow(&h, "single task workflow").await;
    let mut subscriber = h.orchestrator.subscribe();
    h.orchestrator.start(&id, true).await.unwrap();

    // Drain everything published for this run.
    let mut terminal_count = 0;
    let mut last_was_terminal = false;
    while let Ok(Some(envelope)) =
        tokio::time::timeout(Duration::from_millis(300), subscriber.recv()).await
    {
        if envelope.workflow_id != id {
            continue;
        }
        match envelope.payload {
            EventPayload::WorkflowCompleted { .. } | EventPayload::WorkflowFailed { .. } => {
                terminal_count += 1;
                last_was_terminal = true;
            }
            _ => last_was_terminal = false,
        }
    }
    assert_eq!(terminal_count, 1);
    assert!(last_was_terminal, "terminal event must be the last one");
}

#[tokio::test]
async fn pause_takes_effect_between_tasks_and_resume_finishes() {
    let h = harness().await;
    push_pipeline(&h.agent, &plan_json(&[("t1", &[]), ("t2", &["t1"]), ("t3", &["t2"])]));
    push_task_success(&h.agent, "one.txt");
    h.agent.push(ScriptedOutcome::Sleep {
        ms: 400,
        text: "slow task two".into(),
    });
    push_task_success(&h.agent, "three.txt");

    let id = create_workflow(&h, "pausable workflow").await;
    let mut subscriber = h.orchestrator.subscribe();
    let handle = h.orchestrator.start(&id, false).await.unwrap().unwrap();

    // Wait for t2 to start, then ask for a pause while it is in flight.
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(30), subscriber.recv())
            .await
            .expect("timed out")
            .expect("bus closed");
        if envelope.workflow_id != id {
            continue;
        }
        if matches!(&envelope.payload, EventPayload::TaskStarted { task_id, .. } if task_id == "t2")
        {
            break;
        }
    }
    h.orchestrator.pause(&id).await.unwrap();
    handle.wait().await.unwrap();

    let workflow = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Paused);
    // The in-flight task finished; the pause landed before t3.
    assert_eq!(workflow.tasks["t2"].status, TaskStatus::Completed);
    assert_eq!(workflow.tasks["t3"].status, TaskStatus::Pending);

    h.orchestrator.resume(&id, true).await.unwrap();
    let workflow = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.resume_count, 1);
    assert_eq!(workflow.tasks["t3"].status, TaskStatus::Completed);
}

#[tokio::test]
async fn resume_cap_is_enforced() {
    let h = harness().await;
    let id = create_workflow(&h, "capped workflow").await;

    let mut workflow = h.store.load_workflow(&id).await.unwrap();
    workflow.transition(WorkflowStatus::Running).unwrap();
    workflow.transition(WorkflowStatus::Paused).unwrap();
    workflow.resume_count = workflow.max_resumes;
    h.store.save_workflow(&workflow).await.unwrap();

    let err = h.orchestrator.resume(&id, true).await.unwrap_err();
    assert!(matches!(err, QuorumError::Validation(_)));
}

#[tokio::test]
async fn pause_on_non_running_workflow_is_an_error() {
    let h = harness().await;
    let id = create_workflow(&h, "never started").await;
    let err = h.orchestrator.pause(&id).await.unwrap_err();
    assert!(matches!(err, QuorumError::Validation(_)));
}

#[tokio::test]
async fn cancel_is_idempotent_even_when_dormant() {
    let h = harness().await;
    let id = create_workflow(&h, "cancel me").await;

    h.orchestrator.cancel(&id).await.unwrap();
    let workflow = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Cancelled);
    // Second cancel is a no-op.
    h.orchestrator.cancel(&id).await.unwrap();
}

#[tokio::test]
async fn empty_prompt_is_rejected_at_create() {
    let h = harness().await;
    let err = h
        .orchestrator
        .create(quorum::CreateOptions {
            prompt: "   ".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QuorumError::Validation(_)));
}

#[tokio::test]
async fn completed_run_writes_a_report() {
    let h = harness().await;
    push_pipeline(&h.agent, &plan_json(&[("t1", &[])]));
    push_task_success(&h.agent, "done.txt");

    let id = create_workflow(&h, "report me").await;
    h.orchestrator.start(&id, true).await.unwrap();

    let report = h
        .dir
        .path()
        .join(".quorum/runs")
        .join(id.as_str())
        .join("report.md");
    assert!(report.exists());
    let body = std::fs::read_to_string(report).unwrap();
    assert!(body.contains("completed"));
    assert!(body.contains("t1"));
}
