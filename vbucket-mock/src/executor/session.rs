//! Session and housekeeping executors: quit, flush, noop, version,
//! verbosity, feature negotiation, and statistics.

use bytes::BufMut;

use crate::connection::Session;
use crate::executor::EngineError;
use crate::item::now_secs;
use crate::protocol::{Feature, Opcode, RequestFrame, ResponseFrame, Status};
use crate::server::NodeContext;

/// QUIT answers success before the connection closes; QUITQ closes without
/// a word. Either way no further frames are read from this session.
pub(super) fn quit(
    op: Opcode,
    frame: &RequestFrame,
    _node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    session.begin_close();
    if op == Opcode::Quit {
        Ok(vec![ResponseFrame::status(frame, Status::Success)])
    } else {
        Ok(Vec::new())
    }
}

pub(super) fn flush(
    op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    _session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    node.storage.flush_all();
    if op.is_quiet() {
        Ok(Vec::new())
    } else {
        Ok(vec![ResponseFrame::status(frame, Status::Success)])
    }
}

pub(super) fn noop(
    _op: Opcode,
    frame: &RequestFrame,
    _node: &NodeContext,
    _session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    Ok(vec![ResponseFrame::status(frame, Status::Success)])
}

pub(super) fn version(
    _op: Opcode,
    frame: &RequestFrame,
    _node: &NodeContext,
    _session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let version = env!("CARGO_PKG_VERSION").as_bytes().to_vec();
    Ok(vec![ResponseFrame::value(frame, version, 0)])
}

pub(super) fn verbosity(
    _op: Opcode,
    frame: &RequestFrame,
    _node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    session.set_verbosity(frame.expiry_extra());
    Ok(vec![ResponseFrame::status(frame, Status::Success)])
}

/// HELLO: enable every supported feature the client asked for and echo the
/// accepted codes back. Re-negotiation is idempotent; features only turn on.
pub(super) fn hello(
    _op: Opcode,
    frame: &RequestFrame,
    _node: &NodeContext,
    session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let mut accepted = Vec::new();
    for code in frame.feature_codes() {
        if let Some(feature) = Feature::from_u16(code) {
            session.enable(feature);
            accepted.put_u16(code);
        }
    }
    Ok(vec![ResponseFrame::value(frame, accepted, 0)])
}

/// STAT: one response per statistic, closed by an empty-key terminator the
/// client fences on.
pub(super) fn stat(
    _op: Opcode,
    frame: &RequestFrame,
    node: &NodeContext,
    _session: &mut Session,
) -> Result<Vec<ResponseFrame>, EngineError> {
    let now = now_secs();
    let uptime = node.started.elapsed().as_secs();
    Ok(vec![
        ResponseFrame::stat(frame, "version", env!("CARGO_PKG_VERSION")),
        ResponseFrame::stat(frame, "uptime", &uptime.to_string()),
        ResponseFrame::stat(frame, "curr_items", &node.storage.curr_items(now).to_string()),
        ResponseFrame::stat(frame, "", ""),
    ])
}
