//! Chain ledger integration tests
//!
//! Append, verify, tamper detection and trail export against a file-backed
//! SQLite database.

mod common;

use chain_ledger::ledger::{read_jsonl, BreakReason, Partition, ScopePolicy, Target};
use chain_ledger::LedgerError;
use common::{request, setup_ledger, setup_ledger_with, tamper};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_three_entry_chain_and_tampered_state() {
    let t = setup_ledger().await;
    let cancel = CancellationToken::new();

    let a = t.ledger.append(&request("org-1", "x")).await.unwrap();
    let b = t.ledger.append(&request("org-1", "y")).await.unwrap();
    let c = t
        .ledger
        .append(&request("org-1", "z").after(json!({"qty": 3})))
        .await
        .unwrap();

    assert!(a.previous_hash.is_none());
    assert_eq!(b.previous_hash.as_deref(), Some(a.hash.as_str()));
    assert_eq!(c.previous_hash.as_deref(), Some(b.hash.as_str()));

    let result = t.ledger.verify("org-1", &cancel).await.unwrap();
    assert!(result.valid);
    assert_eq!(result.total_entries, 3);
    assert_eq!(result.tail_hash.as_deref(), Some(c.hash.as_str()));

    tamper(
        t.database(),
        r#"UPDATE ledger_entries SET after_json = '{"qty":300}' WHERE id = ?1"#,
        &c.id.to_string(),
    )
    .await;

    let result = t.ledger.verify("org-1", &cancel).await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.total_entries, 3);
    assert_eq!(result.broken_at_index, Some(2));
    assert_eq!(result.broken_entry_id, Some(c.id.to_string()));
    assert_eq!(result.reason, Some(BreakReason::HashMismatch));
}

#[tokio::test]
async fn test_empty_scope_is_valid() {
    let t = setup_ledger().await;
    let result = t
        .ledger
        .verify("nobody", &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.valid);
    assert_eq!(result.total_entries, 0);
    assert!(result.broken_at_index.is_none());
}

#[tokio::test]
async fn test_stored_rows_reject_updates() {
    let t = setup_ledger().await;
    let a = t.ledger.append(&request("org-1", "x")).await.unwrap();

    let err = sqlx::query("UPDATE ledger_entries SET action = 'y' WHERE id = ?1")
        .bind(a.id.to_string())
        .execute(&t.database().pool)
        .await;
    assert!(err.is_err());

    let err = sqlx::query("DELETE FROM ledger_entries WHERE id = ?1")
        .bind(a.id.to_string())
        .execute(&t.database().pool)
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_deleted_entry_reports_gap() {
    let t = setup_ledger().await;
    t.ledger.append(&request("org-1", "x")).await.unwrap();
    let b = t.ledger.append(&request("org-1", "y")).await.unwrap();
    t.ledger.append(&request("org-1", "z")).await.unwrap();

    tamper(
        t.database(),
        "DELETE FROM ledger_entries WHERE id = ?1",
        &b.id.to_string(),
    )
    .await;

    let result = t
        .ledger
        .verify("org-1", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_index, Some(1));
    assert_eq!(result.reason, Some(BreakReason::SequenceGap));
}

#[tokio::test]
async fn test_unknown_format_version_fails_closed() {
    let t = setup_ledger().await;
    t.ledger.append(&request("org-1", "x")).await.unwrap();
    let b = t.ledger.append(&request("org-1", "y")).await.unwrap();

    tamper(
        t.database(),
        "UPDATE ledger_entries SET format_version = 9 WHERE id = ?1",
        &b.id.to_string(),
    )
    .await;

    let result = t
        .ledger
        .verify("org-1", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_index, Some(1));
    assert_eq!(result.reason, Some(BreakReason::UnknownFormatVersion));
}

#[tokio::test]
async fn test_format_version_switch_mid_chain() {
    let t = setup_ledger().await;
    t.ledger.append(&request("org-1", "x")).await.unwrap();
    t.ledger.append(&request("org-1", "y")).await.unwrap();

    let v2 = t.reopen_with(|c| c.format_version = 2).await;
    v2.append(&request("org-1", "z").before(json!({"a": 1})))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let entries = t.ledger.entries("org-1", &cancel).await.unwrap();
    let versions: Vec<u8> = entries.iter().map(|e| e.format_version).collect();
    assert_eq!(versions, vec![1, 1, 2]);

    let result = t.ledger.verify("org-1", &cancel).await.unwrap();
    assert!(result.valid);
    assert_eq!(result.total_entries, 3);
}

#[tokio::test]
async fn test_invalid_append_is_rejected_before_storage() {
    let t = setup_ledger().await;
    let err = t
        .ledger
        .append(&request("org-1", "Bad Action!"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert!(!err.is_transient());
    assert!(t.database().tail("org-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_registered_policy() {
    let t = setup_ledger_with(|c| c.scope_policy = ScopePolicy::Registered).await;
    assert_eq!(t.ledger.resolver().policy(), ScopePolicy::Registered);
    let scope = t
        .ledger
        .resolver()
        .resolve(Partition::ShareLedger, "org-1")
        .unwrap();

    let err = t
        .ledger
        .append(&request(scope.as_str(), "share.issue"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    assert!(t.ledger.register_scope(&scope, "organization").await.unwrap());
    assert!(!t.ledger.register_scope(&scope, "organization").await.unwrap());

    let receipt = t
        .ledger
        .append(&request(scope.as_str(), "share.issue"))
        .await
        .unwrap();
    assert_eq!(receipt.sequence, 0);
    assert!(t
        .database()
        .tail("audit:org-1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_trail_is_ordered_subsequence() {
    let t = setup_ledger().await;
    for i in 0..10 {
        let holding = format!("h-{}", i % 3);
        t.ledger
            .append(
                &request("org-1", "holding.update")
                    .target(Target::new("holding", holding))
                    .after(json!({"step": i})),
            )
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let all = t.ledger.entries("org-1", &cancel).await.unwrap();
    let trail = t
        .ledger
        .trail("org-1", "holding", "h-1", &cancel)
        .await
        .unwrap();

    let expected: Vec<_> = all
        .iter()
        .filter(|e| e.matches_target("holding", "h-1"))
        .cloned()
        .collect();
    assert_eq!(trail.len(), 3);
    assert_eq!(trail, expected);
    assert!(trail.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn test_trail_paging_matches_single_page() {
    let t = setup_ledger_with(|c| c.verify_page_size = 2).await;
    for i in 0..7 {
        t.ledger
            .append(
                &request("org-1", "holding.update")
                    .target(Target::new("holding", "h-1"))
                    .after(json!({"step": i})),
            )
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let trail = t
        .ledger
        .trail("org-1", "holding", "h-1", &cancel)
        .await
        .unwrap();
    let sequences: Vec<u64> = trail.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..7).collect::<Vec<u64>>());

    let result = t.ledger.verify("org-1", &cancel).await.unwrap();
    assert!(result.valid);
    assert_eq!(result.total_entries, 7);
}

#[tokio::test]
async fn test_export_trail_jsonl() {
    let t = setup_ledger().await;
    t.ledger
        .append(
            &request("org-1", "holding.create")
                .target(Target::new("holding", "h-1"))
                .after(json!({"qty": 10, "note": "opening"})),
        )
        .await
        .unwrap();
    t.ledger
        .append(&request("org-1", "member.invite").target(Target::new("member", "m-1")))
        .await
        .unwrap();
    t.ledger
        .append(
            &request("org-1", "holding.update")
                .target(Target::new("holding", "h-1"))
                .before(json!({"qty": 10}))
                .after(json!({"qty": 12.5})),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let bytes = t
        .ledger
        .export_trail("org-1", "holding", "h-1", &cancel)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert_eq!(text.lines().count(), 2);

    let exported = read_jsonl(bytes.as_slice()).unwrap();
    let trail = t
        .ledger
        .trail("org-1", "holding", "h-1", &cancel)
        .await
        .unwrap();
    assert_eq!(exported, trail);
    assert_eq!(exported[1].after_state, Some(json!({"qty": 12.5})));
}

#[tokio::test]
async fn test_full_scope_export_verifies_offline() {
    let t = setup_ledger().await;
    for action in ["x", "y", "z"] {
        t.ledger.append(&request("org-1", action)).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let bytes = t.ledger.export_scope("org-1", &cancel).await.unwrap();
    let entries = read_jsonl(bytes.as_slice()).unwrap();

    let result = chain_ledger::ledger::verify_entries("org-1", &entries);
    assert!(result.valid);
    assert_eq!(result.total_entries, 3);
}

#[tokio::test]
async fn test_verify_for_target_covers_prefix_only() {
    let t = setup_ledger().await;
    let mut ids = Vec::new();
    for i in 0..4 {
        let holding = if i % 2 == 0 { "h-1" } else { "h-2" };
        let receipt = t
            .ledger
            .append(
                &request("org-1", "holding.update")
                    .target(Target::new("holding", holding))
                    .after(json!({"step": i})),
            )
            .await
            .unwrap();
        ids.push(receipt.id.to_string());
    }

    tamper(
        t.database(),
        r#"UPDATE ledger_entries SET after_json = '{"step":99}' WHERE id = ?1"#,
        &ids[3],
    )
    .await;

    let cancel = CancellationToken::new();
    let h1 = t
        .ledger
        .verify_for_target("org-1", "holding", "h-1", &cancel)
        .await
        .unwrap();
    assert!(h1.valid);
    assert_eq!(h1.total_entries, 2);

    let h2 = t
        .ledger
        .verify_for_target("org-1", "holding", "h-2", &cancel)
        .await
        .unwrap();
    assert!(!h2.valid);
    assert_eq!(h2.broken_at_index, Some(3));
    assert_eq!(h2.broken_entry_id.as_deref(), Some(ids[3].as_str()));

    let missing = t
        .ledger
        .verify_for_target("org-1", "holding", "h-9", &cancel)
        .await
        .unwrap();
    assert!(missing.valid);
    assert_eq!(missing.total_entries, 0);
}

#[tokio::test]
async fn test_cancelled_runs_stop() {
    let t = setup_ledger().await;
    t.ledger
        .append(&request("org-1", "x").target(Target::new("holding", "h-1")))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = t.ledger.verify("org-1", &cancel).await.unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));

    let err = t
        .ledger
        .export_trail("org-1", "holding", "h-1", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
}

#[tokio::test]
async fn test_verify_all_reports_each_scope() {
    let t = setup_ledger().await;
    t.ledger.append(&request("org-1", "x")).await.unwrap();
    t.ledger.append(&request("org-2", "x")).await.unwrap();
    let b = t.ledger.append(&request("org-2", "y")).await.unwrap();

    tamper(
        t.database(),
        "UPDATE ledger_entries SET actor_id = 'mallory' WHERE id = ?1",
        &b.id.to_string(),
    )
    .await;

    let results = t
        .ledger
        .verify_all(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].valid);
    assert_eq!(results[0].scope_id, "org-1");
    assert!(!results[1].valid);
    assert_eq!(results[1].broken_at_index, Some(1));
}
