//! Get-family executors: plain/keyed/quiet gets, replica reads, lock
//! acquisition, touch and get-and-touch, random reads, and unlock.

use crate::connection::Session;
use crate::executor::{master_store, replica_store, store_error_response, EngineError, Resolved};
use crate::item::{absolute_expiry, now_secs};
use crate::protocol::{Opcode, RequestFrame, ResponseFrame, Status};
use crate::server::NodeContext;
use crate::store::{StoreError, VBucketStore};

pub(super) fn execute(
    op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let now = now_secs();
    let store = if op == Opcode::GetReplica {
        replica_store(frame, node)?
    } else {
        match master_store(frame, node, session) {
            Resolved::Store(store) => store,
            Resolved::Reply(reply) => return Ok(vec![reply]),
        }
    };

    match op {
        Opcode::GetLocked => return Ok(lock_response(frame, store, session, now)),
        Opcode::Touch | Opcode::Gat | Opcode::GatQ => {
            return Ok(touch_response(op, frame, store, session, now))
        }
        _ => {}
    }

    let Some(item) = store.get(&frame.key, now) else {
        if op.is_quiet() {
            return Ok(Vec::new());
        }
        return Ok(vec![ResponseFrame::error(
            frame,
            Status::KeyNotFound,
            session.error_context("failed to look up item"),
        )]);
    };

    let key_echo = matches!(op, Opcode::GetK | Opcode::GetKQ).then_some(frame.key.as_slice());
    Ok(vec![ResponseFrame::item(
        frame,
        key_echo,
        item.flags,
        &item.value,
        item.exposed_cas(now),
    )])
}

/// GETL: acquire the lock and answer with the lock's own CAS, or report the
/// conflict. Never falls through to a plain get response.
fn lock_response(
    frame: &RequestFrame,
    store: &VBucketStore,
    session: &Session,
    now: u64,
) -> Vec<ResponseFrame> {
    match store.lock(&frame.key, frame.expiry_extra(), now) {
        Ok((item, lock_cas)) => vec![ResponseFrame::item(
            frame,
            None,
            item.flags,
            &item.value,
            lock_cas,
        )],
        Err(StoreError::KeyNotFound) => vec![ResponseFrame::error(
            frame,
            Status::KeyNotFound,
            session.error_context("failed to look up item"),
        )],
        Err(_) => vec![ResponseFrame::error(
            frame,
            session.locked_status(),
            session.error_context("failed to lock item"),
        )],
    }
}

/// TOUCH/GAT/GATQ: update the expiry, then answer. A bare TOUCH carries no
/// payload; the GAT variants return the full item.
fn touch_response(
    op: Opcode,
    frame: &RequestFrame,
    store: &VBucketStore,
    session: &Session,
    now: u64,
) -> Vec<ResponseFrame> {
    let expiry = absolute_expiry(frame.expiry_extra(), now);
    match store.touch(&frame.key, expiry, now) {
        Ok(item) => {
            if op == Opcode::Touch {
                vec![ResponseFrame::mutation(frame, item.cas)]
            } else {
                vec![ResponseFrame::item(frame, None, item.flags, &item.value, item.cas)]
            }
        }
        Err(StoreError::KeyNotFound) => {
            if op.is_quiet() {
                Vec::new()
            } else {
                vec![ResponseFrame::error(
                    frame,
                    Status::KeyNotFound,
                    session.error_context("failed to look up item"),
                )]
            }
        }
        Err(err) => vec![store_error_response(frame, err, session)],
    }
}

/// GET_RANDOM: any live item from the vbuckets this node masters, key
/// always echoed so the client learns what it got.
pub(super) fn random(
    _op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let now = now_secs();
    match node.storage.random_item(node.id, now) {
        Some((_, key, item)) => Ok(vec![ResponseFrame::item(
            frame,
            Some(&key),
            item.flags,
            &item.value,
            item.exposed_cas(now),
        )]),
        None => Ok(vec![ResponseFrame::error(
            frame,
            Status::KeyNotFound,
            session.error_context("no items stored on this node"),
        )]),
    }
}

/// UNLOCK: release a held lock given its token.
pub(super) fn unlock(
    _op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let now = now_secs();
    let store = match master_store(frame, node, session) {
        Resolved::Store(store) => store,
        Resolved::Reply(reply) => return Ok(vec![reply]),
    };
    match store.unlock(&frame.key, frame.cas, now) {
        Ok(()) => Ok(vec![ResponseFrame::mutation(frame, 0)]),
        Err(err) => Ok(vec![store_error_response(frame, err, session)]),
    }
}
