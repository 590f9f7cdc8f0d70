mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use answer_batch_runner::infrastructure::{LockGuard, WorkStore};
use answer_batch_runner::models::{Batch, BatchPatch, BatchStatus, Run, RunStatus, Topic};
use answer_batch_runner::Config;
use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use common::*;

#[tokio::test]
async fn test_all_runs_complete() {
    let llm = Arc::new(FakeLlmClient::new());
    let app = app_with(test_config(), llm.clone(), &[1, 2], 3);
    let batch_id = create_batch(&app, &[1, 2], 1).await;

    assert_ok!(app.service().start_batch(batch_id).await);
    let snapshot = wait_finished(&app, batch_id).await;

    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.progress_percentage, 100.0);
    assert!(snapshot.batch.completed_at.is_some());
    assert_eq!(snapshot.runs.len(), 2);
    for run in &snapshot.runs {
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.completed_questions_count, 3);
        assert_eq!(run.failed_questions_count, 0);
        assert_eq!(run.progress_percentage, 100.0);
        assert_eq!(app.store().answers_for_run(run.id).await.unwrap().len(), 3);
    }
    assert_eq!(llm.calls(), 6);
}

#[tokio::test]
async fn test_cell_failure_does_not_fail_run() {
    let llm = Arc::new(FakeLlmClient::new().fail_on(&model_name(1), &question_text(2)));
    let app = app_with(test_config(), llm.clone(), &[1, 2], 3);
    let batch_id = create_batch(&app, &[1, 2], 1).await;

    assert_ok!(app.service().start_batch(batch_id).await);
    let snapshot = wait_finished(&app, batch_id).await;

    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.progress_percentage, 100.0);

    let first = snapshot.runs.iter().find(|r| r.model_id == 1).unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.completed_questions_count, 2);
    assert_eq!(first.failed_questions_count, 1);
    assert!(first.failed_questions_ids.contains(&2));
    assert_eq!(app.store().answers_for_run(first.id).await.unwrap().len(), 2);

    let second = snapshot.runs.iter().find(|r| r.model_id == 2).unwrap();
    assert_eq!(second.completed_questions_count, 3);
}

#[tokio::test]
async fn test_pause_mid_run_then_resume_without_duplicates() {
    let gate = Gate::at(2);
    let llm = Arc::new(FakeLlmClient::new().with_gate(gate.clone()));
    let app = app_with(test_config(), llm.clone(), &[1], 3);
    let batch_id = create_batch(&app, &[1], 2).await;

    assert_ok!(app.service().start_batch(batch_id).await);

    // 第 2 个单元正在生成时暂停
    gate.reached.notified().await;
    assert_ok!(app.service().pause_batch(batch_id, "手动暂停").await);
    gate.release.notify_one();
    wait_idle(&app, batch_id).await;

    let paused = app.service().snapshot(batch_id).await.unwrap();
    assert_eq!(paused.batch.status, BatchStatus::Paused);
    assert_eq!(paused.batch.pause_reason.as_deref(), Some("手动暂停"));
    let run = &paused.runs[0];
    assert_eq!(run.status, RunStatus::Paused);
    assert!(run.processed_count() <= 2);
    let answered = app.store().answers_for_run(run.id).await.unwrap().len();
    assert_eq!(answered, 2);

    // 中断之后不会再写入新的回答
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.store().answers_for_run(run.id).await.unwrap().len(), answered);

    assert_ok!(app.service().resume_batch(batch_id).await);
    let snapshot = wait_finished(&app, batch_id).await;

    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.resume_count, 1);
    let run = &snapshot.runs[0];
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.resume_count, 1);
    assert_eq!(run.completed_questions_count, 6);

    let answers = app.store().answers_for_run(run.id).await.unwrap();
    let keys: HashSet<_> = answers.iter().map(|a| a.key()).collect();
    assert_eq!(answers.len(), 6);
    assert_eq!(keys.len(), 6);
    // 已回答的两个单元不会再调用模型
    assert_eq!(llm.calls(), 6);
}

#[tokio::test]
async fn test_resume_while_cell_still_generating() {
    let gate = Gate::at(2);
    let llm = Arc::new(FakeLlmClient::new().with_gate(gate.clone()));
    let app = app_with(test_config(), llm.clone(), &[1], 3);
    let batch_id = create_batch(&app, &[1], 2).await;

    assert_ok!(app.service().start_batch(batch_id).await);

    // 第 2 个单元仍在生成时暂停并立即恢复，原任务还持有运行的执行租约
    gate.reached.notified().await;
    assert_ok!(app.service().pause_batch(batch_id, "手动暂停").await);
    assert_ok!(app.service().resume_batch(batch_id).await);
    gate.release.notify_one();

    let snapshot = wait_finished(&app, batch_id).await;
    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.resume_count, 1);
    let run = &snapshot.runs[0];
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_questions_count, 6);

    let answers = app.store().answers_for_run(run.id).await.unwrap();
    let keys: HashSet<_> = answers.iter().map(|a| a.key()).collect();
    assert_eq!(answers.len(), 6);
    assert_eq!(keys.len(), 6);
    assert_eq!(llm.calls(), 6);

    wait_idle(&app, batch_id).await;
    assert!(!app.scheduler().is_in_flight(batch_id));
}

#[tokio::test]
async fn test_pause_and_resume_transitions() {
    let app = app_with(test_config(), Arc::new(FakeLlmClient::new()), &[1], 2);
    let batch_id = create_batch(&app, &[1], 1).await;
    let state = app.service().state();

    assert_ok!(state.pause(batch_id, "检查").await);
    assert_eq!(state.status(batch_id).await.unwrap(), Some(BatchStatus::Paused));
    assert!(state.is_interrupted(batch_id).await.unwrap());

    // 重复暂停被拒绝，状态不变
    let err = assert_err!(state.pause(batch_id, "再次暂停").await);
    assert!(err.is_invalid_transition());
    assert_eq!(state.status(batch_id).await.unwrap(), Some(BatchStatus::Paused));

    assert_ok!(state.resume(batch_id, None).await);
    let batch = app.store().batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Resuming);
    assert_eq!(batch.resume_count, 1);
    assert!(batch.pause_time.is_none());
    assert!(!state.is_interrupted(batch_id).await.unwrap());
    for run in app.store().runs_for_batch(batch_id).await.unwrap() {
        assert_eq!(run.status, RunStatus::Resuming);
        assert_eq!(run.resume_count, 1);
    }
}

#[tokio::test]
async fn test_illegal_transition_leaves_state_unchanged() {
    let app = app_with(test_config(), Arc::new(FakeLlmClient::new()), &[1], 1);
    let batch_id = create_batch(&app, &[1], 1).await;
    let state = app.service().state();

    let err = assert_err!(state.transition(batch_id, BatchStatus::Completed, None).await);
    assert!(err.is_invalid_transition());
    assert_eq!(state.status(batch_id).await.unwrap(), Some(BatchStatus::Pending));

    // 非暂停状态不能恢复
    assert_err!(app.service().resume_batch(batch_id).await);
    let batch = app.store().batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.resume_count, 0);
}

#[tokio::test]
async fn test_lock_timeout_rejects_pause() {
    let config = Config {
        lock_wait_ms: 50,
        ..test_config()
    };
    let app = app_with(config, Arc::new(FakeLlmClient::new()), &[1], 1);
    let batch_id = create_batch(&app, &[1], 1).await;
    let state = app.service().state();

    let guard = state.coordinator().lock_batch(batch_id).await.unwrap();
    let err = assert_err!(state.pause(batch_id, "抢锁").await);
    assert!(err.is_lock_timeout());
    assert_eq!(state.status(batch_id).await.unwrap(), Some(BatchStatus::Pending));

    assert!(guard.release().await.unwrap());
    assert_ok!(state.pause(batch_id, "抢锁").await);
}

#[tokio::test]
async fn test_scheduler_dispatches_only_orphans() {
    let llm = Arc::new(FakeLlmClient::new());
    let app = app_with(test_config(), llm.clone(), &[1], 2);
    let orphan = create_batch(&app, &[1], 1).await;
    let busy = create_batch(&app, &[1], 1).await;
    let state = app.service().state();

    let now = Utc::now();
    for (batch_id, idle) in [(orphan, chrono::Duration::minutes(10)), (busy, chrono::Duration::seconds(30))] {
        assert_ok!(state.transition(batch_id, BatchStatus::InProgress, None).await);
        app.store()
            .update_batch(batch_id, BatchPatch::new().touch(now - idle))
            .await
            .unwrap();
    }

    let report = app.scheduler().check_orphans().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.dispatched, 1);

    let snapshot = wait_finished(&app, orphan).await;
    assert_eq!(snapshot.batch.status, BatchStatus::Completed);

    let busy_batch = app.store().batch(busy).await.unwrap().unwrap();
    assert_eq!(busy_batch.status, BatchStatus::InProgress);
    assert!(busy_batch.last_check_time.is_some());
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_missing_batch_only_emits_error() {
    let app = app_with(test_config(), Arc::new(FakeLlmClient::new()), &[1], 1);
    let mut events = app.subscribe();

    assert!(app.scheduler().submit(999, true).await.unwrap());

    let (topic, event) = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (topic, event) = events.recv().await.unwrap();
            if topic == Topic::Error(999) {
                return (topic, event);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(topic.to_string(), "/topic/error/999");
    assert!(event.payload.to_string().contains("999"));
    assert!(app.store().batch(999).await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_dataset_fails_batch() {
    let app = app_with(test_config(), Arc::new(FakeLlmClient::new()), &[1], 1);
    let store = app.store();

    // 绕过创建校验，直接写入指向空数据集的批次
    let batch_id = store.allocate_batch_id().await.unwrap();
    store.insert_batch(Batch::new(batch_id, "空数据集", 42, 1)).await.unwrap();
    let run_id = store.allocate_run_id().await.unwrap();
    store.insert_run(Run::new(run_id, batch_id, 1, "run")).await.unwrap();

    assert!(app.scheduler().submit(batch_id, true).await.unwrap());
    let snapshot = wait_finished(&app, batch_id).await;

    assert_eq!(snapshot.batch.status, BatchStatus::Failed);
    assert!(snapshot.batch.error_message.unwrap().contains("没有问题"));
    assert_eq!(snapshot.runs[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_unreachable_model_fails_start() {
    let config = Config {
        check_model_connectivity: true,
        ..test_config()
    };
    let llm = Arc::new(FakeLlmClient::new().unreachable(&model_name(2)));
    let app = app_with(config, llm.clone(), &[1, 2], 2);
    let batch_id = create_batch(&app, &[1, 2], 1).await;

    let err = assert_err!(app.service().start_batch(batch_id).await);
    assert!(err.to_string().contains("以下模型连接失败"));

    let batch = app.store().batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error_message.unwrap().contains("model-2"));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_create_batch_validates_plan() {
    let app = app_with(test_config(), Arc::new(FakeLlmClient::new()), &[1], 1);

    let err = assert_err!(
        app.service()
            .create_batch(answer_batch_runner::orchestrator::BatchPlan {
                name: "无运行".to_string(),
                dataset_id: DATASET_ID,
                repeat_count: 1,
                global_parameters: Default::default(),
                runs: Vec::new(),
            })
            .await
    );
    assert!(err.to_string().contains("没有关联的运行"));

    let err = assert_err!(
        app.service()
            .create_batch(answer_batch_runner::orchestrator::BatchPlan {
                name: "未知模型".to_string(),
                dataset_id: DATASET_ID,
                repeat_count: 1,
                global_parameters: Default::default(),
                runs: vec![answer_batch_runner::orchestrator::RunPlan {
                    model_id: 77,
                    name: "ghost".to_string(),
                    parameters: Default::default(),
                }],
            })
            .await
    );
    assert!(err.to_string().contains("找不到模型"));
}
