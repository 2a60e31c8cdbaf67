//! Counter executors: increment/decrement with optional seeding.

use bytes::BufMut;

use crate::connection::Session;
use crate::executor::{master_store, store_error_response, EngineError, Resolved};
use crate::item::now_secs;
use crate::protocol::{Opcode, RequestFrame, ResponseFrame, Status};
use crate::server::NodeContext;

/// Expiry sentinel that disables creating a missing counter.
const NO_CREATE: u32 = 0xffff_ffff;

pub(super) fn execute(
    op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let Some((delta, initial, expiry)) = frame.counter_extras() else {
        return Ok(vec![ResponseFrame::error(
            frame,
            Status::InvalidArguments,
            session.error_context("counter extras must be 20 bytes"),
        )]);
    };
    let store = match master_store(frame, node, session) {
        Resolved::Store(store) => store,
        Resolved::Reply(reply) => return Ok(vec![reply]),
    };

    let now = now_secs();
    let create_expiry = (expiry != NO_CREATE).then_some(expiry);
    let decrement = matches!(op, Opcode::Decrement | Opcode::DecrementQ);
    Ok(
        match store.counter(&frame.key, delta, initial, create_expiry, decrement, now) {
            Ok(_) if op.is_quiet() => Vec::new(),
            Ok((value, cas)) => {
                let mut payload = Vec::with_capacity(8);
                payload.put_u64(value);
                vec![ResponseFrame::value(frame, payload, cas)]
            }
            Err(err) => vec![store_error_response(frame, err, session)],
        },
    )
}
