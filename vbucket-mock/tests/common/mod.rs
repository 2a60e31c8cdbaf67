//! Minimal binary-protocol client the integration tests drive the server
//! with.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use vbucket_mock::protocol::{
    decode_response, encode_request, Opcode, RequestFrame, ResponseFrame,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestClient {
    stream: TcpStream,
    inbound: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Self {
            stream,
            inbound: BytesMut::with_capacity(4096),
        })
    }

    pub async fn send(&mut self, frame: &RequestFrame) -> Result<()> {
        let mut outbound = BytesMut::new();
        encode_request(frame, &mut outbound);
        self.stream
            .write_all(&outbound)
            .await
            .context("failed to write request")?;
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .context("failed to write raw bytes")?;
        Ok(())
    }

    pub async fn read_response(&mut self) -> Result<ResponseFrame> {
        loop {
            if let Some(frame) = decode_response(&mut self.inbound)? {
                return Ok(frame);
            }
            let read = timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.inbound))
                .await
                .context("timed out waiting for a response")?
                .context("failed to read response")?;
            if read == 0 {
                return Err(anyhow!("connection closed while waiting for a response"));
            }
        }
    }

    pub async fn roundtrip(&mut self, frame: &RequestFrame) -> Result<ResponseFrame> {
        self.send(frame).await?;
        self.read_response().await
    }

    /// Asserts the server closes the connection without sending anything
    /// further.
    pub async fn expect_eof(&mut self) -> Result<()> {
        let read = timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.inbound))
            .await
            .context("timed out waiting for the server to close")?
            .context("failed to read while waiting for close")?;
        if read != 0 || !self.inbound.is_empty() {
            return Err(anyhow!(
                "expected a silent close, got {} buffered byte(s)",
                self.inbound.len() + read
            ));
        }
        Ok(())
    }
}

pub fn request(op: Opcode, vbucket: u16, key: &[u8]) -> RequestFrame {
    RequestFrame {
        opcode: op as u8,
        data_type: 0,
        vbucket,
        opaque: 0,
        cas: 0,
        extras: Vec::new(),
        key: key.to_vec(),
        value: Vec::new(),
    }
}

pub fn set(vbucket: u16, key: &[u8], value: &[u8], flags: u32, expiry: u32, cas: u64) -> RequestFrame {
    let mut extras = Vec::with_capacity(8);
    extras.extend_from_slice(&flags.to_be_bytes());
    extras.extend_from_slice(&expiry.to_be_bytes());
    RequestFrame {
        opcode: Opcode::Set as u8,
        data_type: 0,
        vbucket,
        opaque: 0,
        cas,
        extras,
        key: key.to_vec(),
        value: value.to_vec(),
    }
}

pub fn get_locked(vbucket: u16, key: &[u8], duration_secs: u32) -> RequestFrame {
    let mut frame = request(Opcode::GetLocked, vbucket, key);
    frame.extras = duration_secs.to_be_bytes().to_vec();
    frame
}

pub fn hello(features: &[u16]) -> RequestFrame {
    let mut frame = request(Opcode::Hello, 0, b"vbucket-mock-tests");
    for feature in features {
        frame.value.extend_from_slice(&feature.to_be_bytes());
    }
    frame
}
