//! Guarded status transitions.
//!
//! Every status change after publication goes through [`StateStore::write_if`]
//! with the status field itself as the guard, so two writers racing on one
//! task can never move it out of a terminal state. The first terminal write
//! wins; later ones report `false` and leave the stored outcome alone.

use remote_futures_store::{FieldGuard, FieldWrite, StateStore, StoreError};

use crate::namespace::OperationNamespace;
use crate::protocol::TaskStatus;

/// Encoded statuses a transition may start from.
const OPEN: &[&[u8]] = &[b"0", b"1"];

fn open_guard<'a>(status_key: &'a str, task_id: &'a str) -> FieldGuard<'a> {
    FieldGuard {
        key: status_key,
        field: task_id,
        expected: OPEN,
    }
}

/// Moves a not-started or running task to `Running`.
///
/// Returns `false` if the task is already terminal or no longer exists.
pub(crate) async fn mark_running(
    store: &dyn StateStore,
    namespace: &OperationNamespace,
    task_id: &str,
) -> Result<bool, StoreError> {
    let status_key = namespace.status_key();
    let running = TaskStatus::Running.encode();
    store
        .write_if(
            open_guard(&status_key, task_id),
            &[FieldWrite {
                key: &status_key,
                field: task_id,
                value: &running,
            }],
        )
        .await
}

/// Records a terminal outcome: the result payload first, then `status`.
///
/// Returns `false` if another writer resolved the task first, or the
/// operation was purged, in which case nothing is written.
pub(crate) async fn resolve(
    store: &dyn StateStore,
    namespace: &OperationNamespace,
    task_id: &str,
    status: TaskStatus,
    payload: &[u8],
) -> Result<bool, StoreError> {
    write_terminal(store, namespace, task_id, OPEN, status, payload).await
}

/// Like [`resolve`], but only while the task is still in `observed`.
///
/// Used for verdicts drawn from a status snapshot: a task that moved on
/// since (claimed, or re-claimed after the snapshot) is left alone.
pub(crate) async fn resolve_from(
    store: &dyn StateStore,
    namespace: &OperationNamespace,
    task_id: &str,
    observed: TaskStatus,
    status: TaskStatus,
    payload: &[u8],
) -> Result<bool, StoreError> {
    let observed = observed.encode();
    write_terminal(store, namespace, task_id, &[observed.as_slice()], status, payload).await
}

async fn write_terminal(
    store: &dyn StateStore,
    namespace: &OperationNamespace,
    task_id: &str,
    expected: &[&[u8]],
    status: TaskStatus,
    payload: &[u8],
) -> Result<bool, StoreError> {
    debug_assert!(status.is_terminal());
    let status_key = namespace.status_key();
    let results_key = namespace.results_key();
    let encoded = status.encode();
    store
        .write_if(
            FieldGuard {
                key: &status_key,
                field: task_id,
                expected,
            },
            &[
                FieldWrite {
                    key: &results_key,
                    field: task_id,
                    value: payload,
                },
                FieldWrite {
                    key: &status_key,
                    field: task_id,
                    value: &encoded,
                },
            ],
        )
        .await
}
