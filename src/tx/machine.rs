//! Transaction state machine
//!
//! Every transition appends a `[state, timestamp]` entry to the transaction
//! history. The history is also the failure counter: failures are the
//! submission attempts recorded since the latest `aborted` marker.

use crate::error::{RelayerError, RelayerResult};
use crate::model::{HistoryEntry, Transaction, TxState};
use crate::state::Store;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

/// Whether `from -> to` is a legal transition
pub fn can_become(from: TxState, to: TxState) -> bool {
    use TxState::*;

    // The indexer may confirm anything it finds on chain
    if matches!(to, Done | Confirm) && from != Done {
        return true;
    }

    match (from, to) {
        (Held, Deploy) => true,
        (Deploy, Deploying) | (Deploy, Held) => true,
        (Retry, Retrying) | (Retry, Held) => true,
        (Deploying, Retry) | (Retrying, Retry) => true,
        // Attempt interrupted before its outcome was recorded
        (Deploying, Deploying) | (Deploying, Retrying) | (Retrying, Retrying) => true,
        (Deleted, Deploying) | (Deleted, Retrying) => true,
        (Aborted, Deploy) => true,
        (Done, Deleted) | (Confirm, Deleted) => true,
        (from, Aborted) => !matches!(from, Done | Confirm | Aborted),
        _ => false,
    }
}

/// Move `tx` to `state`, recording the transition in its history.
///
/// Entering `done` while `level + min_confirmations` is above `head` lands in
/// `confirm` instead. Returns the state actually entered.
pub fn state_set(
    tx: &mut Transaction,
    state: TxState,
    head: u64,
    min_confirmations: u64,
) -> RelayerResult<TxState> {
    let mut state = state;
    if state == TxState::Done {
        if let Some(level) = tx.level {
            if level + min_confirmations > head {
                info!(
                    "tx {} at level {} needs {} confirmations, head {}: confirm",
                    tx.id, level, min_confirmations, head
                );
                state = TxState::Confirm;
            }
        }
    }

    if !can_become(tx.state, state) {
        return Err(RelayerError::InvalidStateTransition {
            from: tx.state.to_string(),
            to: state.to_string(),
        });
    }

    let now = Utc::now();
    tx.state = state;
    tx.updated_at = now;
    tx.history.push(HistoryEntry(state, now.timestamp()));

    info!("tx {} state={}", tx.id, state);
    Ok(state)
}

/// Submission attempts since the latest `aborted` marker
pub fn failure_count(history: &[HistoryEntry]) -> u32 {
    history
        .iter()
        .rev()
        .take_while(|entry| entry.0 != TxState::Aborted)
        .filter(|entry| entry.0.is_submitting())
        .count() as u32
}

/// Record a failed submission attempt on `tx` and move it to `retry`, or to
/// `aborted` once the error is permanent or `max_fails` is reached.
pub fn record_failure(tx: &mut Transaction, error: &RelayerError) -> RelayerResult<TxState> {
    tx.last_fail = Some(Utc::now());

    let fails = failure_count(&tx.history);
    let state = if error.is_permanent() {
        tx.error = Some(error.to_string());
        TxState::Aborted
    } else if fails >= tx.max_fails {
        tx.error = Some(format!(
            "Aborting because >= {} failures, last error: {}",
            tx.max_fails, error
        ));
        TxState::Aborted
    } else {
        tx.error = Some(error.to_string());
        TxState::Retry
    };

    if state == TxState::Aborted {
        warn!("tx {} aborted after {} failures: {}", tx.id, fails, error);
    }

    // Neither target goes through the done/confirm downgrade
    state_set(tx, state, 0, 0)
}

/// Mark `tx` aborted, no-op when it already is
pub fn abort(tx: &mut Transaction, reason: &str) -> RelayerResult<bool> {
    if tx.state == TxState::Aborted {
        return Ok(false);
    }
    tx.error = Some(reason.to_string());
    state_set(tx, TxState::Aborted, 0, 0)?;
    Ok(true)
}

/// Operator action: put an aborted transaction back into the spool.
///
/// The `aborted` marker left in the history resets the failure count.
pub fn requeue(tx: &mut Transaction) -> RelayerResult<()> {
    if tx.state != TxState::Aborted {
        return Err(RelayerError::InvalidStateTransition {
            from: tx.state.to_string(),
            to: TxState::Deploy.to_string(),
        });
    }
    tx.last_fail = None;
    state_set(tx, TxState::Deploy, 0, 0)?;
    Ok(())
}

/// Read-modify-write transition against the store
pub async fn transition(
    store: &dyn Store,
    tx_id: Uuid,
    state: TxState,
    head: u64,
    min_confirmations: u64,
) -> RelayerResult<Transaction> {
    let mut tx = store.get_transaction(tx_id).await?;
    state_set(&mut tx, state, head, min_confirmations)?;
    store.save_transaction(&tx).await?;
    Ok(tx)
}

/// Bulk-abort every transaction of an aborted dependency chain
pub async fn abort_all(store: &dyn Store, ids: &[Uuid], reason: &str) -> RelayerResult<usize> {
    let mut aborted = 0;
    for id in ids {
        let mut tx = store.get_transaction(*id).await?;
        if matches!(tx.state, TxState::Done | TxState::Confirm) {
            continue;
        }
        if abort(&mut tx, reason)? {
            store.save_transaction(&tx).await?;
            aborted += 1;
        }
    }
    Ok(aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TxKind;
    use crate::state::MemoryStore;

    fn states(tx: &Transaction) -> Vec<TxState> {
        tx.history.iter().map(|entry| entry.0).collect()
    }

    #[test]
    fn test_done_downgrades_to_confirm_below_depth() {
        let mut tx = Transaction::new(1, TxKind::Contract);
        tx.state = TxState::Deploying;
        tx.level = Some(10);

        assert_eq!(state_set(&mut tx, TxState::Done, 11, 2).unwrap(), TxState::Confirm);
        assert_eq!(tx.state, TxState::Confirm);

        assert_eq!(state_set(&mut tx, TxState::Done, 12, 2).unwrap(), TxState::Done);
        assert_eq!(states(&tx), vec![TxState::Confirm, TxState::Done]);
    }

    #[test]
    fn test_confirm_can_be_rechecked() {
        let mut tx = Transaction::new(1, TxKind::Function);
        tx.state = TxState::Confirm;
        tx.level = Some(5);
        assert_eq!(state_set(&mut tx, TxState::Done, 5, 2).unwrap(), TxState::Confirm);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut tx = Transaction::new(1, TxKind::Transfer);
        tx.state = TxState::Done;
        assert!(state_set(&mut tx, TxState::Deploying, 0, 0).is_err());
        assert!(state_set(&mut tx, TxState::Aborted, 0, 0).is_err());
        assert!(tx.history.is_empty());

        assert!(can_become(TxState::Held, TxState::Deploy));
        assert!(!can_become(TxState::Held, TxState::Deploying));
        assert!(can_become(TxState::Deleted, TxState::Deploying));
        assert!(!can_become(TxState::Retrying, TxState::Deploying));
    }

    #[test]
    fn test_interrupted_attempt_can_restart() {
        let mut tx = Transaction::new(1, TxKind::Transfer);
        state_set(&mut tx, TxState::Deploying, 0, 0).unwrap();
        state_set(&mut tx, TxState::Deploying, 0, 0).unwrap();
        assert_eq!(failure_count(&tx.history), 2);

        tx.state = TxState::Retrying;
        assert_eq!(state_set(&mut tx, TxState::Retrying, 0, 0).unwrap(), TxState::Retrying);
    }

    #[test]
    fn test_failure_count_stops_at_aborted() {
        use TxState::*;
        let history: Vec<HistoryEntry> = [Deploying, Retry, Retrying, Retry, Aborted, Deploy, Deploying, Retry]
            .iter()
            .enumerate()
            .map(|(i, s)| HistoryEntry(*s, i as i64))
            .collect();
        assert_eq!(failure_count(&history), 1);
        assert_eq!(failure_count(&history[..4]), 2);
        assert_eq!(failure_count(&[]), 0);
    }

    #[test]
    fn test_contract_aborts_after_max_fails() {
        let mut tx = Transaction::new(1, TxKind::Contract);
        tx.max_fails = 2;
        let error = RelayerError::Submission("node unreachable".into());

        state_set(&mut tx, TxState::Deploying, 0, 0).unwrap();
        assert_eq!(record_failure(&mut tx, &error).unwrap(), TxState::Retry);
        state_set(&mut tx, TxState::Retrying, 0, 0).unwrap();
        assert_eq!(record_failure(&mut tx, &error).unwrap(), TxState::Aborted);

        use TxState::*;
        assert_eq!(states(&tx), vec![Deploying, Retry, Retrying, Aborted]);
        let message = tx.error.clone().unwrap();
        assert!(message.contains("Aborting because >= 2 failures"));
        assert!(message.contains("node unreachable"));
        assert!(tx.last_fail.is_some());
    }

    #[test]
    fn test_permanent_error_skips_counter() {
        let mut tx = Transaction::new(1, TxKind::Function);
        state_set(&mut tx, TxState::Deploying, 0, 0).unwrap();
        let error = RelayerError::PermanentSubmission("args must be a list".into());
        assert_eq!(record_failure(&mut tx, &error).unwrap(), TxState::Aborted);
        assert!(!tx.error.clone().unwrap().contains("Aborting because"));
    }

    #[test]
    fn test_requeue_resets_failure_count() {
        let mut tx = Transaction::new(1, TxKind::Contract);
        tx.max_fails = 1;
        state_set(&mut tx, TxState::Deploying, 0, 0).unwrap();
        record_failure(&mut tx, &RelayerError::Submission("x".into())).unwrap();
        assert_eq!(tx.state, TxState::Aborted);

        requeue(&mut tx).unwrap();
        assert_eq!(tx.state, TxState::Deploy);
        assert_eq!(failure_count(&tx.history), 0);
        assert!(requeue(&mut tx).is_err());
    }

    #[tokio::test]
    async fn test_abort_all_skips_confirmed() {
        let store = MemoryStore::new();
        let mut a = Transaction::new(1, TxKind::Contract);
        a.state = TxState::Aborted;
        let b = Transaction::new(1, TxKind::Function);
        let mut c = Transaction::new(1, TxKind::Function);
        c.state = TxState::Done;
        for tx in [&a, &b, &c] {
            store.insert_transaction(tx).await.unwrap();
        }

        let count = abort_all(&store, &[a.id, b.id, c.id], "dependency aborted")
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.get_transaction(b.id).await.unwrap().state, TxState::Aborted);
        assert_eq!(store.get_transaction(c.id).await.unwrap().state, TxState::Done);
    }
}
