//! Mutation executors: the store family (set/add/replace), value
//! concatenation (append/prepend), and deletes, each with quiet variants.

use crate::connection::Session;
use crate::executor::{master_store, store_error_response, EngineError, Resolved};
use crate::item::{absolute_expiry, now_secs, Item};
use crate::protocol::{Opcode, RequestFrame, ResponseFrame, Status, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::server::NodeContext;

/// Argument checks shared by every mutation opcode. These are genuine
/// errors, so they are reported even for quiet variants.
fn validate(frame: &RequestFrame, session: &Session) -> Option<ResponseFrame> {
    if frame.key.is_empty() || frame.key.len() > MAX_KEY_LEN {
        return Some(ResponseFrame::error(
            frame,
            Status::InvalidArguments,
            session.error_context("key length is out of range"),
        ));
    }
    if frame.value.len() > MAX_VALUE_LEN {
        return Some(ResponseFrame::error(
            frame,
            Status::ValueTooBig,
            session.error_context("value exceeds the maximum size"),
        ));
    }
    None
}

pub(super) fn store_family(
    op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    if let Some(reply) = validate(frame, session) {
        return Ok(vec![reply]);
    }
    let store = match master_store(frame, node, session) {
        Resolved::Store(store) => store,
        Resolved::Reply(reply) => return Ok(vec![reply]),
    };

    let now = now_secs();
    let (flags, expiry) = frame.store_extras();
    let item = Item::new(frame.value.clone(), flags, absolute_expiry(expiry, now));
    let result = match op {
        Opcode::Set | Opcode::SetQ => store.set(&frame.key, item, frame.cas, now),
        Opcode::Add | Opcode::AddQ => store.add(&frame.key, item, now),
        Opcode::Replace | Opcode::ReplaceQ => store.replace(&frame.key, item, frame.cas, now),
        _ => {
            return Ok(vec![ResponseFrame::error(
                frame,
                Status::InternalError,
                session.error_context("opcode wired to the wrong executor"),
            )])
        }
    };

    Ok(match result {
        Ok(_) if op.is_quiet() => Vec::new(),
        Ok(cas) => vec![ResponseFrame::mutation(frame, cas)],
        Err(err) => vec![store_error_response(frame, err, session)],
    })
}

pub(super) fn concat_family(
    op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    if let Some(reply) = validate(frame, session) {
        return Ok(vec![reply]);
    }
    let store = match master_store(frame, node, session) {
        Resolved::Store(store) => store,
        Resolved::Reply(reply) => return Ok(vec![reply]),
    };

    let now = now_secs();
    let prepend = matches!(op, Opcode::Prepend | Opcode::PrependQ);
    Ok(
        match store.concat(&frame.key, &frame.value, prepend, frame.cas, now) {
            Ok(_) if op.is_quiet() => Vec::new(),
            Ok(cas) => vec![ResponseFrame::mutation(frame, cas)],
            Err(err) => vec![store_error_response(frame, err, session)],
        },
    )
}

pub(super) fn delete_family(
    op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let store = match master_store(frame, node, session) {
        Resolved::Store(store) => store,
        Resolved::Reply(reply) => return Ok(vec![reply]),
    };

    let now = now_secs();
    Ok(match store.delete(&frame.key, frame.cas, now) {
        Ok(()) if op.is_quiet() => Vec::new(),
        Ok(()) => vec![ResponseFrame::mutation(frame, 0)],
        Err(err) => vec![store_error_response(frame, err, session)],
    })
}
