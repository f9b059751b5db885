//! Chunked payload transfer
//!
//! A payload travels over its own data channel as one text meta envelope
//! followed by binary chunks. The sender never closes the channel; the
//! receiver closes it once the declared byte count has arrived.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use pagelink_core::{ChannelId, MetaEnvelope, ProtocolError, TransferConfig};

use crate::transport::{ChannelMessage, DataChannel, TransportError};

/// Upper bound on the buffer reserved up front from a declared size
const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

/// Errors surfaced through a request's rendezvous
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("channel {0} is not ready")]
    ChannelNotReady(ChannelId),

    #[error("binary data arrived before the meta envelope")]
    MissingMeta,

    #[error("duplicate meta envelope")]
    DuplicateMeta,

    #[error("size mismatch: declared {declared} bytes, received {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("channel closed after {received} bytes (expected {expected:?})")]
    Incomplete { expected: Option<u64>, received: u64 },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outcome of a completed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub bytes: u64,
    pub chunks: usize,
    /// Times the sender suspended at the high watermark
    pub pauses: usize,
}

/// Stream `payload` over `channel`: meta envelope, then chunks under flow control
///
/// The sender suspends whenever the channel's buffered amount reaches the
/// high watermark and resumes once it drains to the low watermark.
pub async fn send_payload(
    channel: &DataChannel,
    payload: Bytes,
    chunk_size: usize,
    config: &TransferConfig,
) -> Result<SendReport, TransferError> {
    if !channel.is_open() {
        return Err(TransferError::ChannelNotReady(channel.id()));
    }

    let total = payload.len();
    channel.send_text(MetaEnvelope::new(total as u64).to_json())?;

    let chunk_size = chunk_size.max(1);
    let (low, high) = config.watermarks(chunk_size);
    channel.set_buffered_amount_low_threshold(low);

    let mut report = SendReport {
        bytes: total as u64,
        chunks: 0,
        pauses: 0,
    };

    let mut offset = 0;
    while offset < total {
        if channel.buffered_amount() >= high {
            report.pauses += 1;
            trace!(
                id = channel.id(),
                buffered = channel.buffered_amount(),
                "High watermark reached, suspending"
            );
            channel.buffered_amount_low().await;
            if !channel.is_open() {
                return Err(TransferError::Transport(TransportError::ChannelClosed(
                    channel.id(),
                )));
            }
        }

        let end = (offset + chunk_size).min(total);
        channel.send_binary(payload.slice(offset..end))?;
        report.chunks += 1;
        offset = end;
    }

    debug!(
        id = channel.id(),
        bytes = total,
        chunks = report.chunks,
        pauses = report.pauses,
        "Payload queued"
    );
    Ok(report)
}

/// Progress of a payload being reassembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    /// Exactly the declared number of bytes has arrived
    Complete,
}

/// Receiver-side reassembly of one payload
#[derive(Debug, Default)]
pub struct PayloadAssembler {
    declared: Option<u64>,
    buffer: BytesMut,
}

impl PayloadAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declared(&self) -> Option<u64> {
        self.declared
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.declared == Some(self.received())
    }

    /// Feed one inbound message
    ///
    /// Text that is not a meta envelope is ignored.
    pub fn accept(&mut self, message: ChannelMessage) -> Result<Progress, TransferError> {
        match message {
            ChannelMessage::Text(text) => {
                let meta = match MetaEnvelope::from_json(&text) {
                    Ok(meta) => meta,
                    Err(e) => {
                        debug!("Ignoring text message on transfer channel: {}", e);
                        return Ok(self.progress());
                    }
                };
                if self.declared.is_some() {
                    return Err(TransferError::DuplicateMeta);
                }
                self.declared = Some(meta.size);
                self.buffer
                    .reserve((meta.size as usize).min(MAX_PREALLOCATION));
            }
            ChannelMessage::Binary(data) => {
                let declared = self.declared.ok_or(TransferError::MissingMeta)?;
                let received = self.received() + data.len() as u64;
                if received > declared {
                    return Err(TransferError::SizeMismatch { declared, received });
                }
                self.buffer.extend_from_slice(&data);
            }
        }
        Ok(self.progress())
    }

    fn progress(&self) -> Progress {
        if self.is_complete() {
            Progress::Complete
        } else {
            Progress::Pending
        }
    }

    /// Result once the channel has closed
    pub fn finish(self) -> Result<Bytes, TransferError> {
        if self.is_complete() {
            Ok(self.buffer.freeze())
        } else {
            Err(TransferError::Incomplete {
                expected: self.declared,
                received: self.received(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mem::{loopback_pair, MemConfig};
    use crate::transport::{ChannelEvent, Transport, TransportEvent};

    #[test]
    fn test_assembler_exact_size() {
        let mut asm = PayloadAssembler::new();
        assert_eq!(
            asm.accept(ChannelMessage::Text(MetaEnvelope::new(5).to_json())).unwrap(),
            Progress::Pending
        );
        assert_eq!(
            asm.accept(ChannelMessage::Binary(Bytes::from_static(b"abc"))).unwrap(),
            Progress::Pending
        );
        assert_eq!(
            asm.accept(ChannelMessage::Binary(Bytes::from_static(b"de"))).unwrap(),
            Progress::Complete
        );
        assert_eq!(asm.finish().unwrap(), Bytes::from_static(b"abcde"));
    }

    #[test]
    fn test_assembler_zero_size_completes_on_meta() {
        let mut asm = PayloadAssembler::new();
        assert_eq!(
            asm.accept(ChannelMessage::Text(MetaEnvelope::new(0).to_json())).unwrap(),
            Progress::Complete
        );
        assert!(asm.finish().unwrap().is_empty());
    }

    #[test]
    fn test_assembler_binary_before_meta() {
        let mut asm = PayloadAssembler::new();
        assert_eq!(
            asm.accept(ChannelMessage::Binary(Bytes::from_static(b"x"))),
            Err(TransferError::MissingMeta)
        );
    }

    #[test]
    fn test_assembler_overflow() {
        let mut asm = PayloadAssembler::new();
        asm.accept(ChannelMessage::Text(MetaEnvelope::new(2).to_json())).unwrap();
        assert_eq!(
            asm.accept(ChannelMessage::Binary(Bytes::from_static(b"xyz"))),
            Err(TransferError::SizeMismatch {
                declared: 2,
                received: 3
            })
        );
    }

    #[test]
    fn test_assembler_incomplete() {
        let mut asm = PayloadAssembler::new();
        asm.accept(ChannelMessage::Text(MetaEnvelope::new(10).to_json())).unwrap();
        asm.accept(ChannelMessage::Binary(Bytes::from_static(b"1234"))).unwrap();
        assert_eq!(
            asm.finish(),
            Err(TransferError::Incomplete {
                expected: Some(10),
                received: 4
            })
        );
        assert_eq!(
            PayloadAssembler::new().finish(),
            Err(TransferError::Incomplete {
                expected: None,
                received: 0
            })
        );
    }

    #[test]
    fn test_assembler_ignores_other_text() {
        let mut asm = PayloadAssembler::new();
        asm.accept(ChannelMessage::Text("{\"type\":\"note\"}".into())).unwrap();
        assert_eq!(asm.declared(), None);
        asm.accept(ChannelMessage::Text(MetaEnvelope::new(1).to_json())).unwrap();
        assert_eq!(
            asm.accept(ChannelMessage::Text(MetaEnvelope::new(1).to_json())),
            Err(TransferError::DuplicateMeta)
        );
    }

    #[test]
    fn test_send_requires_open_channel() {
        let (channel, _queue) = DataChannel::new(7, "file");
        let result = tokio_test::block_on(send_payload(
            &channel,
            Bytes::from_static(b"data"),
            16,
            &TransferConfig::default(),
        ));
        assert_eq!(result, Err(TransferError::ChannelNotReady(7)));
    }

    #[tokio::test]
    async fn test_send_suspends_at_high_watermark() {
        let config = MemConfig {
            max_message_size: 1024,
            frame_delay: Some(Duration::from_millis(1)),
        };
        let (a, mut b) = loopback_pair(config);
        let sender = a.transport.open_channel("file").unwrap();
        let mut sender_events = sender.take_events().unwrap();
        assert_eq!(sender_events.recv().await, Some(ChannelEvent::Open));

        let receiver = loop {
            if let Some(TransportEvent::ChannelOffered(channel)) = b.events.recv().await {
                break channel;
            }
        };
        let mut inbound = receiver.take_events().unwrap();

        // Floor of 8 KiB, so the sender must pause on a 64 KiB payload
        let transfer = TransferConfig {
            high_watermark_floor: 8 * 1024,
            ..Default::default()
        };
        let payload = Bytes::from((0..64 * 1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
        let report = send_payload(&sender, payload.clone(), 1024, &transfer)
            .await
            .unwrap();
        assert_eq!(report.chunks, 64);
        assert!(report.pauses > 0);

        let mut asm = PayloadAssembler::new();
        while let Some(event) = inbound.recv().await {
            if let ChannelEvent::Message(message) = event {
                if asm.accept(message).unwrap() == Progress::Complete {
                    break;
                }
            }
        }
        assert_eq!(asm.finish().unwrap(), payload);
    }
}
