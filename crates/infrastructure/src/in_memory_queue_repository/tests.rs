use std::collections::HashSet;
use std::time::Duration;

use flowline_application::QueueRepository;
use flowline_core::{CoreError, FlowName, InstanceId};
use flowline_domain::{RecordId, RecordStatus};
use serde_json::{Value, json};

use super::InMemoryQueueRepository;

fn flow(name: &str) -> FlowName {
    match FlowName::new(name) {
        Ok(value) => value,
        Err(error) => panic!("flow name rejected: {error}"),
    }
}

fn instance(host: &str) -> InstanceId {
    match InstanceId::generate(host) {
        Ok(value) => value,
        Err(error) => panic!("instance id rejected: {error}"),
    }
}

async fn enqueue_one(queue: &InMemoryQueueRepository, flow_name: &FlowName, payload: Value) {
    let count = queue.enqueue(flow_name, &[payload]).await;
    assert_eq!(count.ok(), Some(1));
}

async fn claim_one(
    queue: &InMemoryQueueRepository,
    flow_name: &FlowName,
    claimer: &InstanceId,
) -> RecordId {
    let records = match queue.claim_batch(flow_name, claimer, 1).await {
        Ok(records) => records,
        Err(error) => panic!("claim failed: {error}"),
    };
    assert_eq!(records.len(), 1);
    records[0].id
}

#[tokio::test]
async fn single_claimer_drains_five_records_in_enqueue_order() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("scenario_one");
    let payloads: Vec<Value> = (1..=5).map(|i| json!({"i": i})).collect();

    let count = queue.enqueue(&flow_name, &payloads).await;
    assert_eq!(count.ok(), Some(5));

    let records = match queue.claim_batch(&flow_name, &instance("a"), 10).await {
        Ok(records) => records,
        Err(error) => panic!("claim failed: {error}"),
    };
    assert_eq!(records.len(), 5);
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.payload["i"], json!(index as i64 + 1));
        assert_eq!(record.retry_count, 0);
    }

    for record in &records {
        let completed = queue.complete(record.id, None).await;
        assert!(completed.is_ok());
    }

    let status = match queue.status(Some(&flow_name)).await {
        Ok(status) => status,
        Err(error) => panic!("status failed: {error}"),
    };
    assert_eq!(status.pending, 0);
    assert_eq!(status.processing, 0);
    assert_eq!(status.completed, 5);
    assert_eq!(status.failed, 0);
    assert_eq!(status.total, 5);
}

#[tokio::test]
async fn two_claimers_split_the_queue_without_overlap() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("scenario_two");
    let payloads: Vec<Value> = (0..100).map(|i| json!({"i": i})).collect();
    let count = queue.enqueue(&flow_name, &payloads).await;
    assert_eq!(count.ok(), Some(100));

    let mut claimed_by_a = HashSet::new();
    let mut claimed_by_b = HashSet::new();
    let claimer_a = instance("a");
    let claimer_b = instance("b");

    loop {
        let batch_a = match queue.claim_batch(&flow_name, &claimer_a, 10).await {
            Ok(records) => records,
            Err(error) => panic!("claimer a failed: {error}"),
        };
        let batch_b = match queue.claim_batch(&flow_name, &claimer_b, 10).await {
            Ok(records) => records,
            Err(error) => panic!("claimer b failed: {error}"),
        };

        if batch_a.is_empty() && batch_b.is_empty() {
            break;
        }

        for record in batch_a {
            assert!(claimed_by_a.insert(record.id), "record claimed twice by a");
            let completed = queue.complete(record.id, None).await;
            assert!(completed.is_ok());
        }
        for record in batch_b {
            assert!(claimed_by_b.insert(record.id), "record claimed twice by b");
            let completed = queue.complete(record.id, None).await;
            assert!(completed.is_ok());
        }
    }

    assert!(claimed_by_a.is_disjoint(&claimed_by_b));
    assert_eq!(claimed_by_a.len() + claimed_by_b.len(), 100);

    let status = match queue.status(Some(&flow_name)).await {
        Ok(status) => status,
        Err(error) => panic!("status failed: {error}"),
    };
    assert_eq!(status.completed, 100);
}

#[tokio::test]
async fn orphaned_records_return_to_pending_with_a_retry_increment() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("scenario_three");
    enqueue_one(&queue, &flow_name, json!({"i": 1})).await;

    // Instance X claims and then "crashes" by never reporting.
    let record_id = claim_one(&queue, &flow_name, &instance("x")).await;

    let orphan_timeout = Duration::from_secs(600);

    // Not yet an orphan.
    let reaped = queue.reap_orphans(orphan_timeout).await;
    assert_eq!(reaped.ok(), Some(0));

    queue.advance_clock(orphan_timeout + Duration::from_secs(1)).await;
    assert_eq!(queue.count_orphans(orphan_timeout).await.ok(), Some(1));

    let reaped = queue.reap_orphans(orphan_timeout).await;
    assert_eq!(reaped.ok(), Some(1));

    let record = queue.record(record_id).await;
    let record = match record {
        Some(record) => record,
        None => panic!("record vanished"),
    };
    assert_eq!(record.status, RecordStatus::Pending);
    assert_eq!(record.retry_count, 1);
    assert!(record.instance_id.is_none());
    assert!(record.claimed_at.is_none());
    assert!(record.invariants_hold());

    // A fresh claimer receives the recovered record.
    let reclaimed = claim_one(&queue, &flow_name, &instance("y")).await;
    assert_eq!(reclaimed, record_id);
}

#[tokio::test]
async fn reap_is_idempotent_without_intervening_activity() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("reap_idempotent");
    enqueue_one(&queue, &flow_name, json!({"i": 1})).await;
    claim_one(&queue, &flow_name, &instance("x")).await;

    let orphan_timeout = Duration::from_secs(60);
    queue.advance_clock(Duration::from_secs(120)).await;

    assert_eq!(queue.reap_orphans(orphan_timeout).await.ok(), Some(1));
    assert_eq!(queue.reap_orphans(orphan_timeout).await.ok(), Some(0));
}

#[tokio::test]
async fn handler_failure_reset_and_redelivery() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("scenario_four");
    enqueue_one(&queue, &flow_name, json!({"i": 1})).await;

    let record_id = claim_one(&queue, &flow_name, &instance("a")).await;
    let failed = queue.fail(record_id, "bad data").await;
    assert!(failed.is_ok());

    let record = queue.record(record_id).await;
    let record = match record {
        Some(record) => record,
        None => panic!("record vanished"),
    };
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.error_message.as_deref(), Some("bad data"));
    assert!(record.invariants_hold());

    let reset = queue.reset_failed(Some(&flow_name), 3).await;
    assert_eq!(reset.ok(), Some(1));

    let record = queue.record(record_id).await;
    let record = match record {
        Some(record) => record,
        None => panic!("record vanished"),
    };
    assert_eq!(record.status, RecordStatus::Pending);
    // Retry accounting only advances via fail and reap.
    assert_eq!(record.retry_count, 1);
    assert!(record.error_message.is_none());

    let reclaimed = claim_one(&queue, &flow_name, &instance("b")).await;
    assert_eq!(reclaimed, record_id);
}

#[tokio::test]
async fn reset_failed_skips_records_at_the_retry_ceiling() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("reset_ceiling");
    enqueue_one(&queue, &flow_name, json!({"i": 1})).await;

    let claimer = instance("a");
    for attempt in 1..=3 {
        let record_id = claim_one(&queue, &flow_name, &claimer).await;
        let failed = queue.fail(record_id, "still broken").await;
        assert!(failed.is_ok());

        let reset = queue.reset_failed(Some(&flow_name), 3).await;
        if attempt < 3 {
            assert_eq!(reset.ok(), Some(1));
        } else {
            // retry_count reached max_retries; the record stays failed.
            assert_eq!(reset.ok(), Some(0));
        }
    }

    let status = match queue.status(Some(&flow_name)).await {
        Ok(status) => status,
        Err(error) => panic!("status failed: {error}"),
    };
    assert_eq!(status.failed, 1);
}

#[tokio::test]
async fn reset_failed_applied_twice_reclaims_only_once() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("reset_twice");
    enqueue_one(&queue, &flow_name, json!({"i": 1})).await;

    let record_id = claim_one(&queue, &flow_name, &instance("a")).await;
    assert!(queue.fail(record_id, "boom").await.is_ok());

    assert_eq!(queue.reset_failed(Some(&flow_name), 3).await.ok(), Some(1));
    assert_eq!(queue.reset_failed(Some(&flow_name), 3).await.ok(), Some(0));
}

#[tokio::test]
async fn terminal_transitions_are_idempotent_and_exclusive() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("terminal_laws");
    enqueue_one(&queue, &flow_name, json!({"i": 1})).await;
    enqueue_one(&queue, &flow_name, json!({"i": 2})).await;

    let claimer = instance("a");
    let completed_id = claim_one(&queue, &flow_name, &claimer).await;
    let failed_id = claim_one(&queue, &flow_name, &claimer).await;

    assert!(queue.complete(completed_id, Some(json!({"r": 1}))).await.is_ok());
    assert!(queue.fail(failed_id, "boom").await.is_ok());

    // Repeating the same terminal transition is a no-op.
    assert!(queue.complete(completed_id, None).await.is_ok());
    assert!(queue.fail(failed_id, "boom again").await.is_ok());

    // Crossing terminal transitions is illegal.
    let cross_complete = queue.complete(failed_id, None).await;
    assert!(matches!(cross_complete, Err(CoreError::IllegalTransition(_))));
    let cross_fail = queue.fail(completed_id, "late failure").await;
    assert!(matches!(cross_fail, Err(CoreError::IllegalTransition(_))));

    // The repeated fail above must not advance retry accounting.
    let record = queue.record(failed_id).await;
    let record = match record {
        Some(record) => record,
        None => panic!("record vanished"),
    };
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn reporting_an_unknown_record_is_a_query_failure() {
    let queue = InMemoryQueueRepository::new();

    let complete = queue.complete(RecordId::new(4242), None).await;
    assert!(matches!(complete, Err(CoreError::QueryFailed(_))));

    let fail = queue.fail(RecordId::new(4242), "boom").await;
    assert!(matches!(fail, Err(CoreError::QueryFailed(_))));
}

#[tokio::test]
async fn completion_replaces_the_payload_with_the_result_document() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("payload_swap");
    enqueue_one(&queue, &flow_name, json!({"input": true})).await;

    let record_id = claim_one(&queue, &flow_name, &instance("a")).await;
    assert!(
        queue
            .complete(record_id, Some(json!({"score": 0.9})))
            .await
            .is_ok()
    );

    let record = queue.record(record_id).await;
    let record = match record {
        Some(record) => record,
        None => panic!("record vanished"),
    };
    assert_eq!(record.payload, json!({"score": 0.9}));
    assert!(record.completed_at.is_some());
    assert!(record.invariants_hold());
}

#[tokio::test]
async fn empty_boundaries_are_no_ops() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("boundaries");

    assert_eq!(queue.enqueue(&flow_name, &[]).await.ok(), Some(0));
    assert!(
        queue
            .claim_batch(&flow_name, &instance("a"), 0)
            .await
            .is_ok_and(|records| records.is_empty())
    );
    assert!(
        queue
            .claim_batch(&flow_name, &instance("a"), 10)
            .await
            .is_ok_and(|records| records.is_empty())
    );
}

#[tokio::test]
async fn unscoped_status_breaks_counts_down_per_flow() {
    let queue = InMemoryQueueRepository::new();
    let alpha = flow("alpha");
    let beta = flow("beta");

    let enqueued = queue.enqueue(&alpha, &[json!({}), json!({})]).await;
    assert_eq!(enqueued.ok(), Some(2));
    enqueue_one(&queue, &beta, json!({})).await;
    let record_id = claim_one(&queue, &beta, &instance("a")).await;
    assert!(queue.fail(record_id, "boom").await.is_ok());

    let status = match queue.status(None).await {
        Ok(status) => status,
        Err(error) => panic!("status failed: {error}"),
    };

    assert_eq!(status.total, 3);
    assert_eq!(status.pending, 2);
    assert_eq!(status.failed, 1);
    assert_eq!(status.flows.len(), 2);
    assert_eq!(status.flows[0].flow_name, "alpha");
    assert_eq!(status.flows[0].pending, 2);
    assert_eq!(status.flows[1].flow_name, "beta");
    assert_eq!(status.flows[1].failed, 1);

    let scoped = match queue.status(Some(&alpha)).await {
        Ok(status) => status,
        Err(error) => panic!("status failed: {error}"),
    };
    assert_eq!(scoped.total, 2);
    assert!(scoped.flows.is_empty());
}

#[tokio::test]
async fn performance_window_counts_terminal_transitions_and_top_errors() {
    let queue = InMemoryQueueRepository::new();
    let flow_name = flow("perf");
    let claimer = instance("a");

    for i in 0..4 {
        enqueue_one(&queue, &flow_name, json!({"i": i})).await;
    }

    for _ in 0..2 {
        let record_id = claim_one(&queue, &flow_name, &claimer).await;
        assert!(queue.complete(record_id, None).await.is_ok());
    }
    for _ in 0..2 {
        let record_id = claim_one(&queue, &flow_name, &claimer).await;
        assert!(queue.fail(record_id, "bad data").await.is_ok());
    }

    let stats = match queue.performance_window(Duration::from_secs(3600)).await {
        Ok(stats) => stats,
        Err(error) => panic!("performance window failed: {error}"),
    };

    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.top_errors.len(), 1);
    assert_eq!(stats.top_errors[0].message, "bad data");
    assert_eq!(stats.top_errors[0].count, 2);
}
