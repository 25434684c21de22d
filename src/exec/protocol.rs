//! Worker wire protocol: length-prefixed, self-describing records.
//!
//! Every value crossing the isolation boundary is fully serialized; no
//! shared in-process identity is ever assumed. One channel carries exactly
//! one job: the coordinator writes the job, the worker writes everything
//! after it.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ExecutionMode;
use crate::model::BlockRef;
use crate::suite::{TestDescriptor, TestVerdict};

/// Protocol version carried in every job message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// What the worker is asked to execute against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// The unmodified program, with block-entry instrumentation on.
    Baseline,
    /// One mutant: the named unit is replaced by the rewritten bytes.
    Mutant {
        /// Unit to replace.
        unit: String,
        /// Re-encoded unit with the mutation applied.
        rewritten_unit: Vec<u8>,
    },
}

/// One protocol record.
///
/// Externally tagged so the bincode frame codec can decode it without a
/// self-describing format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Coordinator → worker: the single job of this channel.
    Job {
        /// Protocol version of the sender.
        version: u8,
        /// Baseline or mutant execution.
        kind: JobKind,
        /// Tests to run, in execution order.
        tests: Vec<TestDescriptor>,
        /// Stop at first failure or run everything.
        mode: ExecutionMode,
    },
    /// Worker → coordinator: a test is about to run.
    TestStarted {
        /// The test.
        test: TestDescriptor,
    },
    /// Worker → coordinator: a test finished.
    TestResult {
        /// The test.
        test: TestDescriptor,
        /// Pass or fail.
        verdict: TestVerdict,
        /// Failure detail when the verdict is a failure.
        detail: Option<String>,
        /// Wall-clock duration of this test.
        duration_ms: u64,
        /// Blocks entered while the test ran; populated for baseline jobs
        /// only.
        covered: Vec<BlockRef>,
    },
    /// Worker → coordinator: clean completion, channel may close.
    Done {
        /// Tests executed.
        executed: u32,
        /// Tests that failed.
        failed: u32,
    },
}

impl WireMessage {
    /// Message label for diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Job { .. } => "job",
            Self::TestStarted { .. } => "test_started",
            Self::TestResult { .. } => "test_result",
            Self::Done { .. } => "done",
        }
    }
}

/// Malformed or unexpected traffic on a channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// IO failure on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame payload failed to decode.
    #[error("frame codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// Declared frame length exceeds the protocol bound.
    #[error("frame of {0} bytes exceeds protocol maximum")]
    FrameTooLarge(u32),
    /// A message arrived out of protocol order.
    #[error("unexpected {got} message, expected {expected}")]
    UnexpectedMessage {
        /// What the state machine allowed here.
        expected: &'static str,
        /// What actually arrived.
        got: &'static str,
    },
    /// Sender speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version this build speaks.
        expected: u8,
        /// Version the peer declared.
        got: u8,
    },
}

/// Write one frame: 4-byte little-endian length prefix plus payload.
pub fn write_frame(writer: &mut impl Write, message: &WireMessage) -> Result<(), ProtocolError> {
    let payload = bincode::serialize(message)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end-of-stream at a frame
/// boundary. EOF inside a frame is an IO error.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<WireMessage>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            )));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockId, MethodId};

    fn sample_messages() -> Vec<WireMessage> {
        vec![
            WireMessage::Job {
                version: PROTOCOL_VERSION,
                kind: JobKind::Mutant {
                    unit: "calc".to_string(),
                    rewritten_unit: vec![1, 2, 3],
                },
                tests: vec![TestDescriptor::new("calc_tests", "sum_works")],
                mode: ExecutionMode::StopOnFirstFailure,
            },
            WireMessage::TestStarted {
                test: TestDescriptor::new("calc_tests", "sum_works"),
            },
            WireMessage::TestResult {
                test: TestDescriptor::new("calc_tests", "sum_works"),
                verdict: TestVerdict::Fail,
                detail: Some("expected 3, got 1".to_string()),
                duration_ms: 2,
                covered: vec![BlockRef {
                    unit: "calc".to_string(),
                    method: MethodId(0),
                    block: BlockId(0),
                }],
            },
            WireMessage::Done {
                executed: 1,
                failed: 1,
            },
        ]
    }

    #[test]
    fn frames_roundtrip_in_order() {
        let mut buffer = Vec::new();
        let messages = sample_messages();
        for message in &messages {
            write_frame(&mut buffer, message).expect("frame should write");
        }

        let mut cursor = std::io::Cursor::new(buffer);
        for expected in &messages {
            let read = read_frame(&mut cursor)
                .expect("frame should read")
                .expect("stream should not be at eof");
            assert_eq!(&read, expected);
        }
        assert!(
            read_frame(&mut cursor)
                .expect("eof read should succeed")
                .is_none()
        );
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        bytes.extend_from_slice(&[0; 16]);
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &WireMessage::Done { executed: 2, failed: 0 })
            .expect("frame should write");
        buffer.truncate(buffer.len() - 1);

        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Io(_))
        ));
    }

    #[test]
    fn garbage_payload_is_a_codec_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Codec(_))
        ));
    }
}
