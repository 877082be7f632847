//! Job lifecycle tests
//!
//! Drive the controller end to end with scripted model and sandbox doubles.

use at_core::prelude::*;
use at_core::{
    AttemptOutcome, CodeQa, ConfigId, Direction, RecordStore, SubmitError, TranscriptPurpose,
};
use at_model::{ChatRole, ModelError};
use at_test_utils::*;
use pretty_assertions::assert_eq;
use serde_json::json;

async fn phone_config(harness: &Harness) -> ConfigId {
    harness
        .configs
        .upsert(UpsertConfig::new("phones", phone_schema()).with_examples(vec![phone_example()]))
        .await
        .unwrap()
        .id
}

/// Every batch record is checked against a QA answer
fn check_everything(request: UpsertConfig) -> UpsertConfig {
    UpsertConfig {
        code_qa: Some(CodeQa {
            qa_pct: 1.0,
            min_qa: 0,
        }),
        ..request
    }
}

async fn checked_phone_config(harness: &Harness) -> ConfigId {
    let request =
        check_everything(UpsertConfig::new("phones", phone_schema()).with_examples(vec![phone_example()]));
    harness.configs.upsert(request).await.unwrap().id
}

#[tokio::test]
async fn repairs_execution_error_on_second_attempt() {
    let sandbox = ScriptedSandbox::new()
        .with("strict", strict_phone)
        .with("lenient", lenient_phone);
    let model = ScriptedModel::with_programs(&["strict", "lenient"]);
    model.set_qa_answer(lenient_phone);
    let harness = Harness::new(model, sandbox, 3);
    let config_id = checked_phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output_count, 2);

    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(attempts[0].execution_errors.len(), 1);
    assert_eq!(
        attempts[0].execution_errors[0].record.to_value(),
        json!({"phone_entry": "not a phone"})
    );
    assert!(attempts[0].output_schema_errors.is_empty());
    assert!(attempts[0].logic_errors.is_empty());
    assert_eq!(attempts[1].outcome, AttemptOutcome::Passed);

    // The second prompt carries the first attempt's errors
    let prompts = harness.model.code_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].iter().any(|m| m.content.contains("LATEST SYSTEM RESULT")));
    let repair = prompts[1].last().unwrap();
    assert_eq!(repair.role, ChatRole::User);
    assert!(repair.content.contains("**Execution Errors**"));
    assert!(repair.content.contains("ValueError"));

    let config = harness.store.get_config(config_id).await.unwrap();
    assert_eq!(config.active_program.unwrap().code, program("lenient"));
    assert_eq!(config.bot_examples.len(), 2);
    assert_eq!(config.user_examples.len(), 1);

    let outputs = harness
        .records
        .preview(config_id, job.id, Direction::Output, 10)
        .await
        .unwrap();
    assert_eq!(
        outputs,
        vec![json!({"phone_number": "+14158549030"}), json!({"phone_number": null})]
    );
}

#[tokio::test]
async fn exhausted_budget_fails_with_ordered_attempts() {
    let sandbox = ScriptedSandbox::new().with("strict", strict_phone);
    let harness = Harness::new(ScriptedModel::with_programs(&["strict"]), sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);

    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    for (i, pair) in attempts.windows(2).enumerate() {
        assert!(pair[0].created_at < pair[1].created_at, "attempt {i} not before {}", i + 1);
        assert_eq!(pair[1].index, pair[0].index + 1);
    }
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Failed));

    let config = harness.store.get_config(config_id).await.unwrap();
    assert!(config.active_program.is_none());
    assert!(config.bot_examples.is_empty());
}

#[tokio::test]
async fn stop_takes_effect_at_next_cycle_boundary() {
    let sandbox = ScriptedSandbox::new()
        .with("p1", wrong_shape)
        .with("p2", wrong_shape)
        .with("p3", lenient_phone);
    let hold = sandbox.hold("p2");
    let harness = Harness::new(ScriptedModel::with_programs(&["p1", "p2", "p3"]), sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    hold.entered().await;
    assert!(harness.controller.stop(job.id).await.unwrap());
    hold.release();

    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Stopped);
    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(harness.sandbox.calls("p3"), 0);
}

#[tokio::test]
async fn passing_attempt_wins_over_pending_stop() {
    let sandbox = ScriptedSandbox::new().with("good", lenient_phone);
    let hold = sandbox.hold("good");
    let harness = Harness::new(ScriptedModel::with_programs(&["good"]), sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    hold.entered().await;
    harness.controller.stop(job.id).await.unwrap();
    hold.release();

    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn empty_batch_completes_without_attempts() {
    let harness = Harness::new(ScriptedModel::default(), ScriptedSandbox::new(), 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, vec![]).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(harness.store.list_attempts(job.id).await.unwrap().is_empty());
    assert_eq!(harness.model.code_calls(), 0);
}

#[tokio::test]
async fn stop_after_settle_is_noop() {
    let harness = Harness::new(ScriptedModel::default(), ScriptedSandbox::new(), 3);
    let config_id = phone_config(&harness).await;
    let job = harness.controller.submit(config_id, vec![]).await.unwrap();

    assert!(!harness.controller.stop(job.id).await.unwrap());
    let after = harness.store.get_job(job.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Completed);
}

#[tokio::test]
async fn second_submission_conflicts_while_running() {
    let sandbox = ScriptedSandbox::new().with("good", lenient_phone);
    let hold = sandbox.hold("good");
    let harness = Harness::new(ScriptedModel::with_programs(&["good"]), sandbox, 3);
    let config_id = phone_config(&harness).await;

    let first = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    hold.entered().await;
    let err = harness
        .controller
        .submit(config_id, phone_batch())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(err, SubmitError::Conflict { running, .. } if running == first.id));

    hold.release();
    harness.settle(first.id).await;
    let next = harness.controller.submit(config_id, vec![]).await.unwrap();
    assert_eq!(next.status, JobStatus::Completed);
}

#[tokio::test]
async fn malformed_and_unknown_submissions_are_rejected() {
    let harness = Harness::new(ScriptedModel::default(), ScriptedSandbox::new(), 3);
    let config_id = phone_config(&harness).await;

    let err = harness
        .controller
        .submit(config_id, vec![json!({"phone_entry": "1"}), json!(42)])
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Malformed(_)));

    let err = harness
        .controller
        .submit(ConfigId::new(), vec![json!({"a": 1})])
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::UnknownConfig(_)));
    assert!(harness.store.list_jobs(config_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn active_program_is_revalidated_before_synthesis() {
    let sandbox = ScriptedSandbox::new().with("lenient", lenient_phone);
    let model = ScriptedModel::with_programs(&["lenient"]);
    model.set_qa_answer(lenient_phone);
    let harness = Harness::new(model, sandbox, 3);
    let config_id = checked_phone_config(&harness).await;

    let first = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    harness.settle(first.id).await;
    assert_eq!(harness.model.code_calls(), 1);

    let second = harness
        .controller
        .submit(config_id, vec![json!({"phone_entry": "(617) 555-0100"})])
        .await
        .unwrap();
    let second = harness.settle(second.id).await;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(harness.model.code_calls(), 1);

    let attempts = harness.store.list_attempts(second.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].program.as_deref(), Some(program("lenient").as_str()));

    let config = harness.store.get_config(config_id).await.unwrap();
    assert_eq!(config.bot_examples.len(), 3);
}

#[tokio::test]
async fn logic_errors_drive_repair_and_judge_is_consulted() {
    let sandbox = ScriptedSandbox::new()
        .with("bare", bare_digits)
        .with("strict", strict_phone);
    let model = ScriptedModel::with_programs(&["bare", "strict"]);
    model.set_judge_equivalent(false);
    let harness = Harness::new(model, sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness
        .controller
        .submit(config_id, vec![json!({"phone_entry": "415-854-9030"})])
        .await
        .unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts[0].logic_errors.len(), 1);
    assert_eq!(attempts[0].logic_errors[0].actual, json!({"phone_number": "2073077621"}));
    assert_eq!(attempts[0].logic_errors[0].expected, json!({"phone_number": "+12073077621"}));
    assert_eq!(harness.model.judge_calls(), 1);
    assert!(harness.model.code_prompts()[1]
        .last()
        .unwrap()
        .content
        .contains("**Logic Errors**"));
}

#[tokio::test]
async fn equivalent_judgment_accepts_different_formatting() {
    let sandbox = ScriptedSandbox::new().with("bare", bare_digits);
    let model = ScriptedModel::with_programs(&["bare"]);
    model.set_judge_equivalent(true);
    let harness = Harness::new(model, sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness
        .controller
        .submit(config_id, vec![json!({"phone_entry": "415-854-9030"})])
        .await
        .unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.store.list_attempts(job.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reply_without_program_consumes_an_attempt() {
    let sandbox = ScriptedSandbox::new().with("lenient", lenient_phone);
    let model = ScriptedModel::default();
    model.push_code_reply(Ok("I am not sure how to do that.".into()));
    model.push_code_reply(Ok(program_reply("lenient")));
    let harness = Harness::new(model, sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts[0].outcome, AttemptOutcome::SynthesisFailed);
    assert!(attempts[0].program.is_none());
    assert!(attempts[0].failure.is_some());
    assert_eq!(attempts[1].outcome, AttemptOutcome::Passed);
    assert!(harness.model.code_prompts()[1]
        .last()
        .unwrap()
        .content
        .contains("did not contain a ```python block"));
}

#[tokio::test]
async fn model_outage_fails_the_job() {
    let model = ScriptedModel::default();
    model.push_code_reply(Err(ModelError::Transport("connection refused".into())));
    let harness = Harness::new(model, ScriptedSandbox::new(), 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);

    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::InfrastructureFailed);

    // The claim was released
    let next = harness.controller.submit(config_id, vec![]).await.unwrap();
    assert_eq!(next.status, JobStatus::Completed);
}

#[tokio::test]
async fn late_subscriber_sees_snapshot_then_settles() {
    let sandbox = ScriptedSandbox::new()
        .with("strict", strict_phone)
        .with("lenient", lenient_phone);
    let harness = Harness::new(ScriptedModel::with_programs(&["strict", "lenient"]), sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    harness.settle(job.id).await;

    let mut subscription = harness.controller.subscribe(job.id).await.unwrap();
    match subscription.next().await {
        Some(JobEvent::Snapshot { job, attempts }) => {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(attempts.len(), 2);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn qa_answer_catches_wrong_unlabeled_output() {
    let sandbox = ScriptedSandbox::new()
        .with("partial", example_only_phone)
        .with("strict", strict_phone);
    let model = ScriptedModel::with_programs(&["partial", "strict"]);
    model.set_qa_answer(strict_phone);
    model.set_judge_equivalent(false);
    let harness = Harness::new(model, sandbox, 3);
    let config_id = checked_phone_config(&harness).await;

    let job = harness
        .controller
        .submit(config_id, vec![json!({"phone_entry": "415-854-9030"})])
        .await
        .unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].logic_errors.len(), 1);
    assert_eq!(
        attempts[0].logic_errors[0].record.to_value(),
        json!({"phone_entry": "415-854-9030"})
    );
    assert_eq!(attempts[0].logic_errors[0].actual, json!({"phone_number": "4158549030"}));
    assert_eq!(attempts[0].logic_errors[0].expected, json!({"phone_number": "+14158549030"}));
    assert!(attempts[0]
        .transcripts
        .iter()
        .any(|t| t.purpose == TranscriptPurpose::Qa));
    assert_eq!(harness.model.qa_calls(), 1);

    let config = harness.store.get_config(config_id).await.unwrap();
    assert_eq!(config.bot_examples.len(), 1);
    assert_eq!(config.bot_examples[0].output, json!({"phone_number": "+14158549030"}));
}

#[tokio::test]
async fn unchecked_batch_records_never_become_bot_examples() {
    let sandbox = ScriptedSandbox::new().with("lenient", lenient_phone);
    let harness = Harness::new(ScriptedModel::with_programs(&["lenient"]), sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(harness.model.qa_calls() >= 1);

    // The QA model never gave a usable answer
    let config = harness.store.get_config(config_id).await.unwrap();
    assert!(config.bot_examples.is_empty());
}

#[tokio::test]
async fn bot_examples_stop_at_the_configured_limit() {
    let sandbox = ScriptedSandbox::new().with("lenient", lenient_phone);
    let model = ScriptedModel::with_programs(&["lenient"]);
    model.set_qa_answer(lenient_phone);
    let harness = Harness::new(model, sandbox, 3);
    let mut request =
        check_everything(UpsertConfig::new("phones", phone_schema()).with_examples(vec![phone_example()]));
    request.bot_example_limit = Some(3);
    let config_id = harness.configs.upsert(request).await.unwrap().id;

    for batch in [
        vec![json!({"phone_entry": "415-854-9030"}), json!({"phone_entry": "617-555-0100"})],
        vec![json!({"phone_entry": "212-555-0199"}), json!({"phone_entry": "303-555-0142"})],
        vec![json!({"phone_entry": "503-555-0177"})],
    ] {
        let job = harness.controller.submit(config_id, batch).await.unwrap();
        assert_eq!(harness.settle(job.id).await.status, JobStatus::Completed);
    }

    let config = harness.store.get_config(config_id).await.unwrap();
    assert_eq!(config.bot_examples.len(), 3);
    assert_eq!(
        config.bot_examples[0].input.to_value(),
        json!({"phone_entry": "415-854-9030"})
    );
}

#[tokio::test]
async fn schema_revision_replaces_the_candidate_schema() {
    let sandbox = ScriptedSandbox::new().with("lenient", lenient_phone);
    let model = ScriptedModel::with_programs(&["lenient"]);
    model.set_schema_reply(&phone_schema());
    model.set_qa_answer(lenient_phone);
    let harness = Harness::new(model, sandbox, 3);
    let mut request = check_everything(
        UpsertConfig::new("phones", strict_phone_schema()).with_examples(vec![phone_example()]),
    );
    request.schema_revision = Some(true);
    let config_id = harness.configs.upsert(request).await.unwrap().id;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    let job = harness.settle(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let attempts = harness.store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].schema, strict_phone_schema());
    assert_eq!(attempts[0].output_schema_errors.len(), 1);
    assert_eq!(attempts[1].schema, phone_schema());
    assert!(attempts[1].output_schema_errors.is_empty());
    assert_eq!(harness.model.schema_calls(), 1);

    let purposes: Vec<TranscriptPurpose> = attempts[1].transcripts.iter().map(|t| t.purpose).collect();
    assert_eq!(purposes[0], TranscriptPurpose::Schema);
    assert!(purposes.contains(&TranscriptPurpose::Code));
    assert!(purposes.contains(&TranscriptPurpose::Qa));

    // The revised conversation starts over from the new schema
    let prompts = harness.model.code_prompts();
    assert!(prompts[1][1].content.contains("\"null\""));

    let config = harness.store.get_config(config_id).await.unwrap();
    assert_eq!(config.output_schema.schema, phone_schema());
    assert_eq!(config.active_program.unwrap().code, program("lenient"));
}

#[tokio::test]
async fn config_updates_wait_for_the_running_job() {
    let sandbox = ScriptedSandbox::new().with("good", lenient_phone);
    let hold = sandbox.hold("good");
    let harness = Harness::new(ScriptedModel::with_programs(&["good"]), sandbox, 3);
    let config_id = phone_config(&harness).await;

    let job = harness.controller.submit(config_id, phone_batch()).await.unwrap();
    hold.entered().await;
    let mut rename = UpsertConfig::new("phones-v2", phone_schema());
    rename.id = Some(config_id);
    assert!(harness.configs.upsert(rename.clone()).await.is_err());

    hold.release();
    harness.settle(job.id).await;
    let renamed = harness.configs.upsert(rename).await.unwrap();
    assert_eq!(renamed.name, "phones-v2");
    assert!(renamed.active_program.is_some());
}
