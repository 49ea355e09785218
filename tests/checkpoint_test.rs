mod common;

use chain_ledger::ledger::BreakReason;
use common::{request, setup_ledger_with, tamper, TestLedger};
use tokio_util::sync::CancellationToken;

async fn ledger_with_entries(count: usize) -> (TestLedger, Vec<String>) {
    let t = setup_ledger_with(|c| c.checkpoint_interval = 3).await;
    let mut ids = Vec::new();
    for _ in 0..count {
        let receipt = t.ledger.append(&request("org-1", "x")).await.unwrap();
        ids.push(receipt.id.to_string());
    }
    (t, ids)
}

#[tokio::test]
async fn test_checkpoint_written_when_due() {
    let (t, _) = ledger_with_entries(2).await;
    let cancel = CancellationToken::new();

    let outcome = t.ledger.verify_and_checkpoint("org-1", &cancel).await.unwrap();
    assert!(outcome.result.valid);
    assert_eq!(outcome.checkpoint, None);

    t.ledger.append(&request("org-1", "x")).await.unwrap();
    t.ledger.append(&request("org-1", "x")).await.unwrap();
    t.ledger.append(&request("org-1", "x")).await.unwrap();

    let outcome = t.ledger.verify_and_checkpoint("org-1", &cancel).await.unwrap();
    assert!(outcome.result.valid);
    assert_eq!(outcome.checkpoint, Some(4));

    let latest = t.database().latest_checkpoint("org-1").await.unwrap().unwrap();
    assert_eq!(latest.sequence, 4);
    assert_eq!(Some(latest.hash), outcome.result.tail_hash);

    // nothing new since the checkpoint
    let outcome = t.ledger.verify_and_checkpoint("org-1", &cancel).await.unwrap();
    assert_eq!(outcome.result.resumed_from, Some(4));
    assert_eq!(outcome.checkpoint, None);
}

#[tokio::test]
async fn test_resumed_verification_continues_past_checkpoint() {
    let (t, _) = ledger_with_entries(5).await;
    let cancel = CancellationToken::new();
    t.ledger.verify_and_checkpoint("org-1", &cancel).await.unwrap();

    let c = t.ledger.append(&request("org-1", "y")).await.unwrap();
    t.ledger.append(&request("org-1", "z")).await.unwrap();

    let result = t.ledger.verify_resumed("org-1", &cancel).await.unwrap();
    assert!(result.valid);
    assert_eq!(result.resumed_from, Some(4));
    assert_eq!(result.total_entries, 7);

    tamper(
        t.database(),
        "UPDATE ledger_entries SET action = 'q' WHERE id = ?1",
        &c.id.to_string(),
    )
    .await;

    let result = t.ledger.verify_resumed("org-1", &cancel).await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_index, Some(5));
    assert_eq!(result.reason, Some(BreakReason::HashMismatch));
}

#[tokio::test]
async fn test_checkpoint_is_trusted_but_full_replay_is_not() {
    let (t, ids) = ledger_with_entries(5).await;
    let cancel = CancellationToken::new();
    t.ledger.verify_and_checkpoint("org-1", &cancel).await.unwrap();

    tamper(
        t.database(),
        "UPDATE ledger_entries SET action = 'q' WHERE id = ?1",
        &ids[1],
    )
    .await;

    let resumed = t.ledger.verify_resumed("org-1", &cancel).await.unwrap();
    assert!(resumed.valid);

    let full = t.ledger.verify("org-1", &cancel).await.unwrap();
    assert!(!full.valid);
    assert_eq!(full.broken_at_index, Some(1));
    assert_eq!(full.resumed_from, None);
}

#[tokio::test]
async fn test_rewritten_checkpoint_entry_detected() {
    let (t, ids) = ledger_with_entries(5).await;
    let cancel = CancellationToken::new();
    t.ledger.verify_and_checkpoint("org-1", &cancel).await.unwrap();

    let forged = "0".repeat(64);
    tamper(
        t.database(),
        &format!("UPDATE ledger_entries SET hash = '{}' WHERE id = ?1", forged),
        &ids[4],
    )
    .await;

    let result = t.ledger.verify_resumed("org-1", &cancel).await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_index, Some(4));
    assert_eq!(result.reason, Some(BreakReason::HashMismatch));
    assert_eq!(result.resumed_from, Some(4));
}

#[tokio::test]
async fn test_truncation_below_checkpoint_detected() {
    let (t, ids) = ledger_with_entries(5).await;
    let cancel = CancellationToken::new();
    t.ledger.verify_and_checkpoint("org-1", &cancel).await.unwrap();

    tamper(t.database(), "DELETE FROM ledger_entries WHERE id = ?1", &ids[4]).await;
    tamper(t.database(), "DELETE FROM ledger_entries WHERE id = ?1", &ids[3]).await;

    let result = t.ledger.verify_resumed("org-1", &cancel).await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.reason, Some(BreakReason::TruncatedBelowCheckpoint));
    assert_eq!(result.broken_at_index, Some(3));

    // a plain replay sees a shorter, internally consistent chain
    let full = t.ledger.verify("org-1", &cancel).await.unwrap();
    assert!(full.valid);
    assert_eq!(full.total_entries, 3);
}
