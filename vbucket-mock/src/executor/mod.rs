//! Per-opcode command executors.
//!
//! Dispatch is a 256-slot table from opcode byte to a stateless handler
//! function, built once per server node. Executors are pure functions of
//! (frame, node, session) and return zero or more response frames; quiet
//! suppression is simply an executor returning no frames.

mod counter;
mod get;
mod mutation;
mod session;

use crate::connection::Session;
use crate::protocol::{Opcode, RequestFrame, ResponseFrame, Status};
use crate::server::NodeContext;
use crate::store::{StoreError, VBucketStore};
use crate::topology::NodeId;

/// Faults that tear the connection down instead of producing a response.
/// Distinct from every status-carrying command failure so tests can assert
/// on them specifically.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(
        "node {node} is neither master nor replica for vbucket {vbucket} (opcode 0x{opcode:02x})"
    )]
    AccessViolation { node: NodeId, vbucket: u16, opcode: u8 },
}

pub type ExecutorFn =
    fn(Opcode, &RequestFrame, &NodeContext, &mut Session) -> Result<Vec<ResponseFrame>, EngineError>;

/// Opcode-indexed dispatch table.
pub struct CommandTable {
    slots: [Option<ExecutorFn>; 256],
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        use Opcode::*;
        let wiring: &[(Opcode, ExecutorFn)] = &[
            (Get, get::execute),
            (GetK, get::execute),
            (GetQ, get::execute),
            (GetKQ, get::execute),
            (GetReplica, get::execute),
            (GetLocked, get::execute),
            (Touch, get::execute),
            (Gat, get::execute),
            (GatQ, get::execute),
            (GetRandom, get::random),
            (Unlock, get::unlock),
            (Set, mutation::store_family),
            (SetQ, mutation::store_family),
            (Add, mutation::store_family),
            (AddQ, mutation::store_family),
            (Replace, mutation::store_family),
            (ReplaceQ, mutation::store_family),
            (Append, mutation::concat_family),
            (AppendQ, mutation::concat_family),
            (Prepend, mutation::concat_family),
            (PrependQ, mutation::concat_family),
            (Delete, mutation::delete_family),
            (DeleteQ, mutation::delete_family),
            (Increment, counter::execute),
            (IncrementQ, counter::execute),
            (Decrement, counter::execute),
            (DecrementQ, counter::execute),
            (Quit, session::quit),
            (QuitQ, session::quit),
            (Flush, session::flush),
            (FlushQ, session::flush),
            (Noop, session::noop),
            (Version, session::version),
            (Verbosity, session::verbosity),
            (Hello, session::hello),
            (Stat, session::stat),
        ];
        let mut slots: [Option<ExecutorFn>; 256] = [None; 256];
        for &(op, handler) in wiring {
            slots[op as usize] = Some(handler);
        }
        Self { slots }
    }

    /// Runs the executor for one parsed frame. Unknown opcodes answer with
    /// `UnknownCommand`; only access-control faults escape as errors.
    pub fn dispatch(
        &self,
        frame: &RequestFrame,
        node: &NodeContext,
        session: &mut Session,
    ) -> Result<Vec<ResponseFrame>, EngineError> {
        let executor = Opcode::from_u8(frame.opcode).and_then(|op| {
            self.slots[frame.opcode as usize].map(|handler| (op, handler))
        });
        match executor {
            Some((op, handler)) => handler(op, frame, node, session),
            None => Ok(vec![ResponseFrame::error(
                frame,
                Status::UnknownCommand,
                session.error_context("unknown command"),
            )]),
        }
    }
}

/// Outcome of resolving the store a frame may operate on through the
/// topology: either the store, or the response that ends the command.
pub(crate) enum Resolved<'a> {
    Store(&'a VBucketStore),
    Reply(ResponseFrame),
}

/// Master-path resolution: the serving node must master the vbucket, else
/// the command fails with `NotMyVBucket` (there is no forwarding here).
pub(crate) fn master_store<'a>(
    frame: &RequestFrame,
    node: &'a NodeContext,
    session: &Session,
) -> Resolved<'a> {
    if !node.storage.topology().is_master(node.id, frame.vbucket) {
        return Resolved::Reply(ResponseFrame::error(
            frame,
            Status::NotMyVBucket,
            session.error_context("vbucket is not owned by this node"),
        ));
    }
    let store = node
        .storage
        .vbucket(frame.vbucket)
        .expect("topology and storage agree on vbucket count");
    Resolved::Store(store)
}

/// Replica-read resolution: a node holding neither master nor replica
/// rights is a protocol violation, not a command failure.
pub(crate) fn replica_store<'a>(
    frame: &RequestFrame,
    node: &'a NodeContext,
) -> Result<&'a VBucketStore, EngineError> {
    if !node.storage.topology().has_access(node.id, frame.vbucket) {
        return Err(EngineError::AccessViolation {
            node: node.id,
            vbucket: frame.vbucket,
            opcode: frame.opcode,
        });
    }
    Ok(node
        .storage
        .vbucket(frame.vbucket)
        .expect("access implies the vbucket exists"))
}

/// Maps an ordinary storage failure onto its response, honoring the
/// session's negotiated error reporting.
pub(crate) fn store_error_response(
    frame: &RequestFrame,
    err: StoreError,
    session: &Session,
) -> ResponseFrame {
    let (status, context) = match err {
        StoreError::KeyNotFound => (Status::KeyNotFound, "key not found"),
        StoreError::KeyExists => (Status::KeyExists, "cas mismatch"),
        StoreError::Locked => (session.locked_status(), "item is locked"),
        StoreError::NotLocked => (Status::TemporaryFailure, "item is not locked"),
        StoreError::NotStored => (Status::NotStored, "no existing value"),
        StoreError::BadDelta => (Status::BadDelta, "existing value is not a number"),
    };
    ResponseFrame::error(frame, status, session.error_context(context))
}
