//! Per-socket session handling: the framing loop, negotiated features, and
//! the response send path.
//!
//! Each connection processes its frames strictly sequentially. Quiet
//! commands simply produce no response frames; fatal framing errors and
//! access-control faults tear the connection down without answering the
//! offending frame.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::{decode_request, Feature, Status};
use crate::server::NodeContext;

/// Negotiated state of one client connection, visible to every executor
/// invocation on it.
#[derive(Debug, Default)]
pub struct Session {
    features: HashSet<Feature>,
    closing: bool,
    verbosity: u32,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feature negotiation only ever turns features on, so repeating it is
    /// idempotent.
    pub fn enable(&mut self, feature: Feature) {
        self.features.insert(feature);
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Whether this connection negotiated enhanced error contexts.
    pub fn xerror(&self) -> bool {
        self.has_feature(Feature::Xerror)
    }

    /// Diagnostic context for error responses; attached only once the
    /// client negotiated enhanced errors.
    pub fn error_context(&self, message: &str) -> Option<String> {
        self.xerror().then(|| message.to_string())
    }

    /// Lock conflicts report `Locked` to sessions that negotiated enhanced
    /// errors and the legacy `TemporaryFailure` to everyone else.
    pub fn locked_status(&self) -> Status {
        if self.xerror() {
            Status::Locked
        } else {
            Status::TemporaryFailure
        }
    }

    pub fn set_verbosity(&mut self, level: u32) {
        self.verbosity = level;
    }

    pub fn verbosity(&self) -> u32 {
        self.verbosity
    }

    /// Enters the Closing state: any in-flight response is still written,
    /// then the socket closes and no further frames are read.
    pub fn begin_close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

/// Drives one client connection to completion: read frames, dispatch,
/// write responses, until EOF, quit, or a fatal fault.
pub async fn handle_connection(stream: TcpStream, ctx: Arc<NodeContext>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (mut reader, mut writer) = stream.into_split();
    let mut session = Session::new();
    let mut inbound = BytesMut::with_capacity(8 * 1024);
    let mut outbound = BytesMut::new();

    loop {
        let frame = loop {
            match decode_request(&mut inbound) {
                Ok(Some(frame)) => break Some(frame),
                Ok(None) => {
                    let read = reader
                        .read_buf(&mut inbound)
                        .await
                        .context("failed to read from client socket")?;
                    if read == 0 {
                        if !inbound.is_empty() {
                            debug!(?peer, pending = inbound.len(), "client left a partial frame behind");
                        }
                        break None;
                    }
                }
                // Framing faults are fatal: no response for the offending
                // frame, the connection just goes away.
                Err(err) => return Err(err).context("malformed frame"),
            }
        };
        let Some(frame) = frame else { break };

        let responses = ctx
            .table
            .dispatch(&frame, &ctx, &mut session)
            .context("protocol violation")?;

        if !responses.is_empty() {
            outbound.clear();
            for response in &responses {
                response.encode(&mut outbound);
            }
            writer
                .write_all(&outbound)
                .await
                .context("failed to write response")?;
        }

        if session.is_closing() {
            break;
        }
    }

    writer.shutdown().await.ok();
    Ok(())
}
