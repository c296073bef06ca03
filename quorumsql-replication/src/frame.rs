//! The frames command: one transaction's frame batch as a consensus log
//! entry.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quorumsql_vfs::wal::is_valid_page_size;
use quorumsql_vfs::{FrameBatch, WalFrame};

use crate::error::Error;
use crate::id::RequestId;
use crate::Result;

/// Command tag for a frames entry. Other tags are reserved for membership
/// and no-op entries handled by the consensus layer.
pub const FRAMES_COMMAND: u8 = 0x01;

const FLAG_BEGIN: u8 = 1 << 0;
const FLAG_COMMIT: u8 = 1 << 1;
const FLAG_TRUNCATE: u8 = 1 << 2;

/// Fixed-size prefix of the payload: tag, page size, flags, truncate
/// target and frame count.
const PAYLOAD_PREFIX: usize = 1 + 4 + 1 + 4 + 4;

/// The replication unit for one write transaction.
///
/// `start_frame` is the WAL frame index the batch begins at on the leader;
/// it travels next to the request id as entry metadata (the payload itself
/// is byte-exact per the wire format) and lets the apply path recognise
/// replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramesEntry {
    pub req_id: RequestId,
    pub start_frame: u32,
    pub batch: FrameBatch,
}

impl FramesEntry {
    /// Encodes the batch as the byte-exact frames command payload.
    pub fn encode_payload(&self) -> Bytes {
        encode_frames(&self.batch)
    }

    /// Decodes a frames command payload received from the consensus log.
    pub fn decode_payload(req_id: RequestId, start_frame: u32, payload: Bytes) -> Result<Self> {
        Ok(Self {
            req_id,
            start_frame,
            batch: decode_frames(payload)?,
        })
    }
}

pub fn encode_frames(batch: &FrameBatch) -> Bytes {
    let page_size = batch.page_size as usize;
    let mut buf = BytesMut::with_capacity(PAYLOAD_PREFIX + batch.len() * (4 + page_size));
    buf.put_u8(FRAMES_COMMAND);
    buf.put_u32(batch.page_size);

    let mut flags = 0u8;
    if batch.is_begin {
        flags |= FLAG_BEGIN;
    }
    if batch.is_commit {
        flags |= FLAG_COMMIT;
    }
    if batch.truncate.is_some() {
        flags |= FLAG_TRUNCATE;
    }
    buf.put_u8(flags);
    buf.put_u32(batch.truncate.unwrap_or(0));
    buf.put_u32(batch.len() as u32);

    for frame in &batch.frames {
        debug_assert_eq!(frame.page.len(), page_size);
        buf.put_u32(frame.page_no);
        buf.put_slice(&frame.page);
    }
    buf.freeze()
}

pub fn decode_frames(mut payload: Bytes) -> Result<FrameBatch> {
    if payload.len() < PAYLOAD_PREFIX {
        return Err(Error::UnexpectedEof);
    }
    let tag = payload.get_u8();
    if tag != FRAMES_COMMAND {
        return Err(Error::InvalidCommandTag(tag));
    }
    let page_size = payload.get_u32();
    if !is_valid_page_size(page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }
    let flags = payload.get_u8();
    let truncate_to = payload.get_u32();
    let count = payload.get_u32();
    if count == 0 {
        return Err(Error::EmptyBatch);
    }

    let frame_size = 4 + page_size as usize;
    if payload.len() != count as usize * frame_size {
        return Err(Error::FrameCountMismatch {
            declared: count,
            got: payload.len() / frame_size,
        });
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let page_no = payload.get_u32();
        let page = payload.copy_to_bytes(page_size as usize);
        frames.push(WalFrame { page_no, page });
    }

    Ok(FrameBatch {
        page_size,
        is_begin: flags & FLAG_BEGIN != 0,
        is_commit: flags & FLAG_COMMIT != 0,
        truncate: (flags & FLAG_TRUNCATE != 0).then_some(truncate_to),
        frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdState;

    fn sample_batch() -> FrameBatch {
        FrameBatch {
            page_size: 512,
            is_begin: true,
            is_commit: true,
            truncate: Some(2),
            frames: vec![
                WalFrame {
                    page_no: 1,
                    page: Bytes::from(vec![0xaa; 512]),
                },
                WalFrame {
                    page_no: 2,
                    page: Bytes::from(vec![0xbb; 512]),
                },
            ],
        }
    }

    #[test]
    fn payload_layout_is_byte_exact() {
        let batch = sample_batch();
        let payload = encode_frames(&batch);

        assert_eq!(payload.len(), PAYLOAD_PREFIX + 2 * (4 + 512));
        assert_eq!(payload[0], FRAMES_COMMAND);
        assert_eq!(&payload[1..5], &512u32.to_be_bytes());
        // begin | commit | truncate
        assert_eq!(payload[5], 0b0000_0111);
        assert_eq!(&payload[6..10], &2u32.to_be_bytes());
        assert_eq!(&payload[10..14], &2u32.to_be_bytes());
        assert_eq!(&payload[14..18], &1u32.to_be_bytes());
        assert_eq!(payload[18], 0xaa);
        assert_eq!(&payload[14 + 516..14 + 520], &2u32.to_be_bytes());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let batch = sample_batch();
        let decoded = decode_frames(encode_frames(&batch)).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_frames(Bytes::from_static(&[0x01, 0x00])),
            Err(Error::UnexpectedEof)
        ));

        let mut payload = BytesMut::new();
        payload.put_u8(0x7f);
        payload.put_slice(&[0u8; PAYLOAD_PREFIX]);
        assert!(matches!(
            decode_frames(payload.freeze()),
            Err(Error::InvalidCommandTag(0x7f))
        ));

        let mut truncated = encode_frames(&sample_batch());
        truncated.truncate(truncated.len() - 1);
        assert!(matches!(
            decode_frames(truncated),
            Err(Error::FrameCountMismatch { declared: 2, .. })
        ));
    }

    #[test]
    fn entry_payload_roundtrip() {
        let mut ids = IdState::seed(1);
        let entry = FramesEntry {
            req_id: RequestId::generate(&mut ids),
            start_frame: 7,
            batch: sample_batch(),
        };
        let decoded =
            FramesEntry::decode_payload(entry.req_id, entry.start_frame, entry.encode_payload())
                .unwrap();
        assert_eq!(decoded, entry);
    }
}
