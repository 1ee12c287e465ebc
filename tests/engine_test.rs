//! Integration tests for the request queue engine.

use rmsq::engine::Engine;
use rmsq::error::Error;
use rmsq::model::*;

fn test_engine() -> Engine {
    Engine::in_memory().expect("failed to create in-memory engine")
}

fn replicate(name: &str, lfn: &str) -> Request {
    Request::new(name).with_operation(
        Operation::new("ReplicateAndRegister")
            .target_se("CERN-DST")
            .with_file(File::new(lfn)),
    )
}

fn put(engine: &mut Engine, request: Request) -> Request {
    let mut request = request;
    engine.put_request(&mut request).unwrap();
    request
}

// ---------------------------------------------------------------------------
// End-to-end: create → claim → refuse second claim → cancel → status
// ---------------------------------------------------------------------------

#[test]
fn create_claim_cancel_lifecycle() {
    let mut engine = test_engine();

    let mut request = replicate("R1", "/a/b/c");
    let id = engine.put_request(&mut request).unwrap();
    assert!(id.0 > 0);
    assert_eq!(request.request_id, Some(id));

    let claimed = engine.get_request("R1").unwrap();
    assert_eq!(claimed.status, RequestStatus::Assigned);
    assert_eq!(claimed.operations.len(), 1);
    assert_eq!(claimed.operations[0].op_type, "ReplicateAndRegister");
    assert_eq!(claimed.operations[0].order, 0);
    assert_eq!(claimed.operations[0].files[0].lfn, "/a/b/c");
    assert_eq!(claimed.operations[0].files[0].status, FileStatus::Waiting);

    match engine.get_request("R1") {
        Err(Error::AlreadyAssigned(name)) => assert_eq!(name, "R1"),
        other => panic!("expected AlreadyAssigned, got {other:?}"),
    }

    assert_eq!(engine.cancel_request("R1").unwrap(), id);
    assert_eq!(
        engine.get_request_status("R1").unwrap(),
        RequestStatus::Canceled
    );
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[test]
fn names_are_unique() {
    let mut engine = test_engine();
    let first = put(&mut engine, replicate("dup", "/f1"));

    let mut second = replicate("dup", "/f2");
    match engine.put_request(&mut second) {
        Err(Error::DuplicateName { name, existing }) => {
            assert_eq!(name, "dup");
            assert_eq!(Some(existing), first.request_id);
        }
        other => panic!("expected DuplicateName, got {other:?}"),
    }
    assert!(second.request_id.is_none());

    // The stored tree is untouched.
    let stored = engine.peek_request("dup").unwrap();
    assert_eq!(stored.operations[0].files[0].lfn, "/f1");
}

#[test]
fn put_updates_existing_tree() {
    let mut engine = test_engine();
    let mut request = put(&mut engine, replicate("update-me", "/f1"));
    let id = request.request_id.unwrap();
    let op_id = request.operations[0].operation_id.unwrap();

    request.operations[0].files[0].status = FileStatus::Done;
    request.operations[0].status = OperationStatus::Done;
    request.status = RequestStatus::Done;
    assert_eq!(engine.put_request(&mut request).unwrap(), id);

    let stored = engine.peek_request("update-me").unwrap();
    assert_eq!(stored.status, RequestStatus::Done);
    assert_eq!(stored.operations[0].operation_id, Some(op_id));
    assert_eq!(stored.operations[0].status, OperationStatus::Done);
    assert_eq!(stored.operations[0].files[0].status, FileStatus::Done);
}

#[test]
fn put_removes_children_dropped_from_the_tree() {
    let mut engine = test_engine();
    let mut request = put(
        &mut engine,
        Request::new("prune")
            .with_operation(
                Operation::new("RemoveFile")
                    .with_file(File::new("/keep"))
                    .with_file(File::new("/drop")),
            )
            .with_operation(Operation::new("RemoveReplica").with_file(File::new("/other"))),
    );

    request.operations.truncate(1);
    request.operations[0].files.retain(|f| f.lfn == "/keep");
    engine.put_request(&mut request).unwrap();

    let stored = engine.peek_request("prune").unwrap();
    assert_eq!(stored.operations.len(), 1);
    assert_eq!(stored.operations[0].files.len(), 1);
    assert_eq!(stored.operations[0].files[0].lfn, "/keep");

    let summary = engine.get_db_summary().unwrap();
    assert!(!summary.operation.contains_key("RemoveReplica"));
    assert_eq!(summary.file.values().sum::<u64>(), 1);
}

#[test]
fn put_with_unknown_identity_is_not_found() {
    let mut engine = test_engine();
    let mut request = replicate("ghost", "/f");
    request.request_id = Some(RequestId(4242));
    assert!(matches!(
        engine.put_request(&mut request),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn operations_keep_their_order() {
    let mut engine = test_engine();
    let request = put(
        &mut engine,
        Request::new("ordered")
            .with_operation(Operation::new("ReplicateAndRegister"))
            .with_operation(Operation::new("RemoveReplica"))
            .with_operation(Operation::new("RemoveFile")),
    );

    let stored = engine.peek_request("ordered").unwrap();
    let types: Vec<_> = stored.operations.iter().map(|op| op.op_type.as_str()).collect();
    assert_eq!(types, vec!["ReplicateAndRegister", "RemoveReplica", "RemoveFile"]);
    let orders: Vec<_> = stored.operations.iter().map(|op| op.order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(
        stored.operations[1].operation_id,
        request.operations[1].operation_id
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn cancel_is_idempotent() {
    let mut engine = test_engine();
    assert!(matches!(
        engine.cancel_request("missing"),
        Err(Error::NotFound(_))
    ));

    let request = put(&mut engine, replicate("twice", "/f"));
    let id = request.request_id.unwrap();
    assert_eq!(engine.cancel_request("twice").unwrap(), id);
    assert_eq!(engine.cancel_request("twice").unwrap(), id);
    assert_eq!(
        engine.get_request_status("twice").unwrap(),
        RequestStatus::Canceled
    );
}

#[test]
fn cancel_of_done_request_is_accepted() {
    let mut engine = test_engine();
    let mut request = replicate("finished", "/f");
    request.status = RequestStatus::Done;
    put(&mut engine, request);

    engine.cancel_request("finished").unwrap();
    assert_eq!(
        engine.get_request_status("finished").unwrap(),
        RequestStatus::Canceled
    );
}

#[test]
fn cancellation_is_sticky() {
    let mut engine = test_engine();
    put(&mut engine, replicate("R1", "/a/b/c"));

    let mut claimed = engine.get_request("R1").unwrap();
    let id = claimed.request_id.unwrap();
    engine.cancel_request("R1").unwrap();

    // A stale worker writes its copy back.
    claimed.status = RequestStatus::Done;
    claimed.operations[0].status = OperationStatus::Done;
    claimed.operations[0].files[0].status = FileStatus::Done;
    assert_eq!(engine.put_request(&mut claimed).unwrap(), id);

    let stored = engine.peek_request("R1").unwrap();
    assert_eq!(stored.request_id, Some(id));
    assert_eq!(stored.status, RequestStatus::Canceled);
    assert_eq!(stored.operations[0].status, OperationStatus::Queued);
    assert_eq!(stored.operations[0].files[0].status, FileStatus::Waiting);
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[test]
fn delete_cascades_to_children() {
    let mut engine = test_engine();
    let request = put(
        &mut engine,
        Request::new("doomed")
            .job_id(77)
            .with_operation(
                Operation::new("RemoveFile")
                    .with_file(File::new("/x"))
                    .with_file(File::new("/y")),
            )
            .with_operation(Operation::new("RemoveReplica").with_file(File::new("/z"))),
    );
    let op_id = request.operations[0].operation_id.unwrap();

    engine.delete_request("doomed").unwrap();

    assert!(matches!(
        engine.peek_request("doomed"),
        Err(Error::NotFound(_))
    ));
    assert!(engine.get_scheduled_request(op_id).unwrap().is_none());
    assert_eq!(engine.get_db_summary().unwrap(), QueueSummary::default());
}

#[test]
fn delete_of_unknown_request_succeeds() {
    let mut engine = test_engine();
    engine.delete_request("never-existed").unwrap();
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[test]
fn anonymous_claim_never_returns_assigned() {
    let mut engine = test_engine();
    for i in 0..5 {
        put(&mut engine, replicate(&format!("req-{i}"), "/f"));
    }
    engine.get_request("req-2").unwrap();

    let mut seen = Vec::new();
    while let Some(request) = engine.claim_next().unwrap() {
        assert_eq!(request.status, RequestStatus::Assigned);
        assert_ne!(request.name, "req-2");
        seen.push(request.name);
    }
    seen.sort();
    assert_eq!(seen, vec!["req-0", "req-1", "req-3", "req-4"]);
    assert!(engine.peek_next().unwrap().is_none());
}

#[test]
fn claim_next_on_empty_queue_is_none() {
    let mut engine = test_engine();
    assert!(engine.claim_next().unwrap().is_none());
    assert!(engine.peek_next().unwrap().is_none());
}

#[test]
fn peek_next_does_not_claim() {
    let mut engine = test_engine();
    put(&mut engine, replicate("only", "/f"));

    let peeked = engine.peek_next().unwrap().unwrap();
    assert_eq!(peeked.name, "only");
    assert_eq!(peeked.status, RequestStatus::Waiting);
    assert_eq!(
        engine.get_request_status("only").unwrap(),
        RequestStatus::Waiting
    );
}

#[test]
fn bulk_claim_cardinality() {
    let mut engine = test_engine();
    for i in 0..5 {
        put(&mut engine, replicate(&format!("bulk-{i}"), "/f"));
    }

    let first = engine.get_bulk_requests(3, true).unwrap();
    assert_eq!(first.len(), 3);
    assert!(first.values().all(|r| r.status == RequestStatus::Assigned));

    let second = engine.get_bulk_requests(3, true).unwrap();
    assert_eq!(second.len(), 2);
    assert!(second.keys().all(|id| !first.contains_key(id)));

    assert!(engine.get_bulk_requests(3, true).unwrap().is_empty());
}

#[test]
fn bulk_claim_rejects_zero_size() {
    let mut engine = test_engine();
    assert!(matches!(
        engine.get_bulk_requests(0, true),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn bulk_peek_leaves_requests_waiting() {
    let mut engine = test_engine();
    for i in 0..3 {
        put(&mut engine, replicate(&format!("peek-{i}"), "/f"));
    }

    let peeked = engine.get_bulk_requests(10, false).unwrap();
    assert_eq!(peeked.len(), 3);
    assert!(peeked.values().all(|r| r.status == RequestStatus::Waiting));
    assert_eq!(engine.get_bulk_requests(10, true).unwrap().len(), 3);
}

#[test]
fn scheduled_request_is_claimed_by_operation() {
    let mut engine = test_engine();
    let mut request = put(&mut engine, replicate("fts", "/f"));
    request.status = RequestStatus::Scheduled;
    request.operations[0].status = OperationStatus::Scheduled;
    engine.put_request(&mut request).unwrap();
    let op_id = request.operations[0].operation_id.unwrap();

    let claimed = engine.get_scheduled_request(op_id).unwrap().unwrap();
    assert_eq!(claimed.name, "fts");
    assert_eq!(claimed.status, RequestStatus::Assigned);
    assert!(claimed.operation(op_id).is_some());

    assert!(matches!(
        engine.get_scheduled_request(op_id),
        Err(Error::AlreadyAssigned(_))
    ));
    assert!(
        engine
            .get_scheduled_request(OperationId(9999))
            .unwrap()
            .is_none()
    );
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[test]
fn unknown_files_report_none() {
    let mut engine = test_engine();
    put(
        &mut engine,
        Request::new("files").with_operation(
            Operation::new("RemoveFile")
                .with_file(File::new("/known"))
                .with_file(File::new("/done")),
        ),
    );
    let mut request = engine.get_request("files").unwrap();
    request.operations[0].files[1].status = FileStatus::Done;
    engine.put_request(&mut request).unwrap();

    let lfns = vec![
        "/known".to_string(),
        "/done".to_string(),
        "/elsewhere".to_string(),
    ];
    let statuses = engine
        .get_request_file_status(&RequestRef::from("files"), &lfns)
        .unwrap();
    assert_eq!(statuses.len(), 3);
    assert_eq!(statuses["/known"], Some(FileStatus::Waiting));
    assert_eq!(statuses["/done"], Some(FileStatus::Done));
    assert_eq!(statuses["/elsewhere"], None);

    let by_id = engine
        .get_request_file_status(&RequestRef::Id(request.request_id.unwrap()), &lfns)
        .unwrap();
    assert_eq!(by_id, statuses);

    let missing = engine
        .get_request_file_status(&RequestRef::from("nope"), &lfns)
        .unwrap();
    assert!(missing.values().all(Option::is_none));
    let missing = engine
        .get_request_file_status(&RequestRef::Id(RequestId(987_654)), &lfns)
        .unwrap();
    assert!(missing.values().all(Option::is_none));
}

#[test]
fn request_info_by_name_and_id() {
    let mut engine = test_engine();
    let request = put(
        &mut engine,
        replicate("info", "/f")
            .job_id(1234)
            .owner("/DC=org/CN=alice", "lhcb_user")
            .setup("Production")
            .source_component("JobWrapper"),
    );
    let id = request.request_id.unwrap();

    let by_name = engine.get_request_info(&"info".into()).unwrap();
    assert_eq!(by_name.request_id, id);
    assert_eq!(by_name.status, RequestStatus::Waiting);
    assert_eq!(by_name.job_id, Some(1234));
    assert_eq!(by_name.owner_dn.as_deref(), Some("/DC=org/CN=alice"));
    assert_eq!(by_name.owner_group.as_deref(), Some("lhcb_user"));
    assert_eq!(by_name.setup.as_deref(), Some("Production"));
    assert_eq!(by_name.source_component.as_deref(), Some("JobWrapper"));

    let by_id = engine.get_request_info(&id.into()).unwrap();
    assert_eq!(by_id, by_name);

    assert!(matches!(
        engine.get_request_info(&"absent".into()),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn request_name_by_id() {
    let mut engine = test_engine();
    let request = put(&mut engine, replicate("named", "/f"));
    assert_eq!(
        engine.get_request_name(request.request_id.unwrap()).unwrap(),
        "named"
    );
    assert!(matches!(
        engine.get_request_name(RequestId(999)),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn request_names_filter_by_status() {
    let mut engine = test_engine();
    for (name, status) in [
        ("w", RequestStatus::Waiting),
        ("d", RequestStatus::Done),
        ("f", RequestStatus::Failed),
        ("c", RequestStatus::Canceled),
    ] {
        let mut request = replicate(name, "/f");
        request.status = status;
        put(&mut engine, request);
    }

    // Final statuses by default, least recently updated first.
    let names = engine.get_request_names(&NamesFilter::default()).unwrap();
    assert_eq!(names, vec!["d", "f", "c"]);

    let waiting = engine
        .get_request_names(&NamesFilter {
            statuses: vec![RequestStatus::Waiting],
            ..NamesFilter::default()
        })
        .unwrap();
    assert_eq!(waiting, vec!["w"]);

    let limited = engine
        .get_request_names(&NamesFilter {
            limit: Some(1),
            ..NamesFilter::default()
        })
        .unwrap();
    assert_eq!(limited, vec!["d"]);
}

#[test]
fn job_lookup_partitions_found_and_missing() {
    let mut engine = test_engine();
    put(&mut engine, replicate("job-10", "/f").job_id(10));
    put(&mut engine, replicate("job-20", "/g").job_id(20));

    let names = engine.get_request_names_for_jobs(&[10, 20, 30]).unwrap();
    assert_eq!(names.successful.len(), 2);
    assert_eq!(names.successful[&10], "job-10");
    assert_eq!(names.successful[&20], "job-20");
    assert_eq!(names.failed.len(), 1);
    assert_eq!(names.failed[&30], "Request not found");

    let trees = engine.read_requests_for_jobs(&[20, 40]).unwrap();
    assert_eq!(trees.successful[&20].name, "job-20");
    assert_eq!(trees.successful[&20].operations[0].files[0].lfn, "/g");
    assert!(trees.failed.contains_key(&40));

    assert!(matches!(
        engine.get_request_names_for_jobs(&[]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn summary_counts_every_level() {
    let mut engine = test_engine();
    put(
        &mut engine,
        Request::new("s1")
            .with_operation(
                Operation::new("ReplicateAndRegister")
                    .with_file(File::new("/1"))
                    .with_file(File::new("/2")),
            )
            .with_operation(Operation::new("RemoveFile").with_file(File::new("/1"))),
    );
    put(&mut engine, replicate("s2", "/3"));
    engine.get_request("s2").unwrap();

    let summary = engine.get_db_summary().unwrap();
    assert_eq!(summary.request[&RequestStatus::Waiting], 1);
    assert_eq!(summary.request[&RequestStatus::Assigned], 1);
    assert_eq!(
        summary.operation["ReplicateAndRegister"][&OperationStatus::Queued],
        2
    );
    assert_eq!(summary.operation["RemoveFile"][&OperationStatus::Queued], 1);
    assert_eq!(summary.file[&FileStatus::Waiting], 4);
}

#[test]
fn summary_histogram_is_exact() {
    let mut engine = test_engine();
    for i in 0..4 {
        put(&mut engine, replicate(&format!("w{i}"), "/f"));
    }
    let mut done = replicate("done", "/f");
    done.status = RequestStatus::Done;
    put(&mut engine, done);
    engine.get_request("w0").unwrap();

    let summary = engine.get_db_summary().unwrap();
    assert_eq!(
        summary.request,
        std::collections::BTreeMap::from([
            (RequestStatus::Waiting, 3),
            (RequestStatus::Assigned, 1),
            (RequestStatus::Done, 1),
        ])
    );
}

#[test]
fn digest_of_missing_request_is_empty() {
    let mut engine = test_engine();
    assert_eq!(engine.get_digest("nothing").unwrap(), "");

    put(&mut engine, replicate("digest", "/a/b/c"));
    let digest = engine.get_digest("digest").unwrap();
    assert!(digest.starts_with("digest [Waiting]"));
    assert!(digest.contains("ReplicateAndRegister"));
    assert!(digest.contains("/a/b/c"));
}
