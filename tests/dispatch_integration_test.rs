//! Stage dispatch end to end against the in-memory queue: planning, fan-out to
//! workers, batch-level failure isolation and ordered consolidation.

mod common;

use batchflow_core::orchestration::input_location;
use batchflow_core::{
    DispatchOptions, DurableStore, ExecutionId, MemoryStore, ProcessorRegistry, RecordStoreExt,
    Stage, StageStatus, StoreKey,
};
use common::processors::{
    CategoryProcessor, FailingIdsProcessor, RejectAllProcessor, RejectThenStallProcessor,
    ReverseLatencyProcessor, StallOnceProcessor, StampProcessor, StuckProcessor,
};
use common::{
    dispatcher, dispatcher_with_scheduler, ids, records, test_config, CrashingScheduler,
    FailingStore,
};
use std::sync::Arc;

async fn seed_stage_input(store: &dyn DurableStore, exec: &ExecutionId, stage: Stage, count: usize) {
    store
        .put_records(&input_location("test", exec, stage), &records(count))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_137_items_fan_out_and_consolidate_in_order() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 137).await;

    let processors = ProcessorRegistry::new().with_processor(
        Stage::Extraction,
        Arc::new(ReverseLatencyProcessor { total: 137 }),
    );
    let result = dispatcher(store.clone(), processors, test_config())
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, StageStatus::Completed);
    assert_eq!(result.input_count, 137);
    assert_eq!(result.batch_count, 6);
    assert_eq!(result.worker_count, 6);
    assert_eq!(result.processed_count, 137);
    assert_eq!(result.error_count, 0);
    assert!(result.failed_batches.is_empty());

    let output_key = StoreKey::stage_output("test", &exec, Stage::Extraction);
    assert_eq!(result.output_location.as_ref(), Some(&output_key));
    let output = store.get_records(&output_key).await.unwrap();
    assert_eq!(ids(&output), (0..137).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_stamped_fields_reach_consolidated_output() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 30).await;

    let processors = ProcessorRegistry::new()
        .with_processor(Stage::Extraction, Arc::new(StampProcessor::new("extracted", true)));
    dispatcher(store.clone(), processors, test_config())
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    let output = store
        .get_records(&StoreKey::stage_output("test", &exec, Stage::Extraction))
        .await
        .unwrap();
    assert_eq!(output.len(), 30);
    assert!(output.iter().all(|r| r["extracted"] == true));
}

#[tokio::test]
async fn test_failed_output_write_drops_one_batch_only() {
    let store = Arc::new(FailingStore::new());
    store.fail_writes_to("batch_3_output.json");
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 137).await;

    let result = dispatcher(store.clone(), ProcessorRegistry::new(), test_config())
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, StageStatus::Completed);
    assert_eq!(result.processed_count, 112);
    assert_eq!(result.error_count, 25);
    assert_eq!(result.failed_batches, vec![3]);
    assert_eq!(store.failed_puts(), 1);

    let output = store
        .get_records(&StoreKey::stage_output("test", &exec, Stage::Extraction))
        .await
        .unwrap();
    let expected: Vec<u64> = (0..75).chain(100..137).collect();
    assert_eq!(ids(&output), expected);
}

#[tokio::test]
async fn test_failed_input_write_is_a_materialization_failure() {
    let store = Arc::new(FailingStore::new());
    store.fail_writes_to("batch_3_input.json");
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 137).await;

    let result = dispatcher(store.clone(), ProcessorRegistry::new(), test_config())
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, StageStatus::Completed);
    assert_eq!(result.materialization_failures, 25);
    assert_eq!(result.error_count, 25);
    assert_eq!(result.processed_count, 112);
    assert_eq!(result.batch_count, 6);
    assert_eq!(result.failed_batches, vec![3]);
}

#[tokio::test]
async fn test_batch_of_rejected_items_keeps_stage_alive() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 137).await;

    let processors = ProcessorRegistry::new().with_processor(
        Stage::Extraction,
        Arc::new(FailingIdsProcessor { failing_ids: 25..50 }),
    );
    let result = dispatcher(store.clone(), processors, test_config())
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, StageStatus::Completed);
    assert_eq!(result.processed_count, 112);
    assert_eq!(result.error_count, 25);

    let errors_key = StoreKey::for_stage(
        "test",
        &exec,
        Stage::Extraction,
        "batch_1_errors.json",
    );
    let error_rows = store.get_records(&errors_key).await.unwrap();
    assert_eq!(error_rows.len(), 25);
    assert_eq!(error_rows[0]["_batch_number"], 1);
    assert_eq!(error_rows[0]["_item_index"], 0);
    assert_eq!(error_rows[0]["_record"]["id"], 25);
    assert_eq!(error_rows[0]["_error"], "record 25 rejected");
}

#[tokio::test]
async fn test_all_items_rejected_fails_stage() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Classification, 40).await;

    let processors = ProcessorRegistry::new()
        .with_processor(Stage::Classification, Arc::new(RejectAllProcessor));
    let result = dispatcher(store.clone(), processors, test_config())
        .run_stage(Stage::Classification, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, StageStatus::Failed);
    assert_eq!(result.error_count, 40);
    assert!(result.output_location.is_none());
    assert!(!store
        .exists(&StoreKey::stage_output("test", &exec, Stage::Classification))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_reconsolidation_is_byte_identical() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 90).await;
    let dispatcher = dispatcher(store.clone(), ProcessorRegistry::new(), test_config());
    let output_key = StoreKey::stage_output("test", &exec, Stage::Extraction);

    dispatcher
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();
    let first = store.get(&output_key).await.unwrap();

    dispatcher
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();
    let second = store.get(&output_key).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_crashed_worker_does_not_lose_batches() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 137).await;

    let result = dispatcher_with_scheduler(
        store.clone(),
        ProcessorRegistry::new(),
        test_config(),
        Arc::new(CrashingScheduler::new(1)),
    )
    .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
    .await
    .unwrap();

    // the surviving workers drain every batch
    assert_eq!(result.status, StageStatus::Completed);
    assert_eq!(result.worker_count, 6);
    assert_eq!(result.processed_count, 137);
    assert_eq!(result.error_count, 0);
}

#[tokio::test]
async fn test_stage_timeout_aborts_stuck_workers() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 10).await;

    let mut config = test_config();
    config.stages.get_mut(Stage::Extraction).stage_timeout_seconds = 1;
    let processors =
        ProcessorRegistry::new().with_processor(Stage::Extraction, Arc::new(StuckProcessor));

    let started = std::time::Instant::now();
    let result = dispatcher(store.clone(), processors, config)
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(result.status, StageStatus::Failed);
    assert_eq!(result.error_count, 10);
    assert_eq!(result.failed_batches, vec![0]);
}

#[tokio::test]
async fn test_rerun_after_stage_timeout_recovers() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 10).await;

    let mut config = test_config();
    config.stages.get_mut(Stage::Extraction).stage_timeout_seconds = 1;
    let processors = ProcessorRegistry::new()
        .with_processor(Stage::Extraction, Arc::new(StallOnceProcessor::default()));
    let dispatcher = dispatcher(store.clone(), processors, config);

    let first = dispatcher
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, StageStatus::Failed);

    // same queue name, so leftovers of the timed-out run must be gone
    let second = dispatcher
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, StageStatus::Completed);
    assert_eq!(second.processed_count, 10);
    assert_eq!(second.error_count, 0);
    assert!(second.failed_batches.is_empty());
}

#[tokio::test]
async fn test_aborted_worker_keeps_error_rows_of_finished_batches() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 50).await;

    let mut config = test_config();
    let settings = config.stages.get_mut(Stage::Extraction);
    settings.stage_timeout_seconds = 1;
    settings.max_workers = 1;
    let processors = ProcessorRegistry::new().with_processor(
        Stage::Extraction,
        Arc::new(RejectThenStallProcessor {
            rejected: 0..5,
            stall_from: 25,
        }),
    );

    let result = dispatcher(store.clone(), processors, config)
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    // batch 0 finished with 5 rejects before the lone worker hung on batch 1
    assert_eq!(result.status, StageStatus::Completed);
    assert_eq!(result.batch_count, 2);
    assert_eq!(result.worker_count, 1);
    assert_eq!(result.processed_count, 20);
    assert_eq!(result.failed_batches, vec![1]);
    assert_eq!(result.error_count, 30);
}

#[tokio::test]
async fn test_summary_field_distribution() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Categorization, 30).await;

    let processors = ProcessorRegistry::new()
        .with_processor(Stage::Categorization, Arc::new(CategoryProcessor));
    let result = dispatcher(store.clone(), processors, test_config())
        .run_stage(Stage::Categorization, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    let distribution = result.distribution.unwrap();
    assert_eq!(distribution.get("vision"), Some(&10));
    assert_eq!(distribution.get("dental"), Some(&10));
    assert_eq!(distribution.get("first_aid"), Some(&10));
}

#[tokio::test]
async fn test_empty_input_fails_without_batches() {
    let store = Arc::new(MemoryStore::new());
    let exec = ExecutionId::generate();
    seed_stage_input(store.as_ref(), &exec, Stage::Extraction, 0).await;

    let result = dispatcher(store.clone(), ProcessorRegistry::new(), test_config())
        .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, StageStatus::Failed);
    assert_eq!(result.batch_count, 0);
    assert_eq!(result.worker_count, 0);
    assert!(result.error.unwrap().contains("empty"));
    // only the seeded input exists
    assert_eq!(store.len(), 1);
}
