//! 컨트롤 경로 메시지 정의
//!
//! 청크 단위 ACK/NAK와 전송 결과를 하나의 고정 길이 메시지로 표현

use serde::{Deserialize, Serialize};

use crate::{Error, Result, ACK_MESSAGE_SIZE};

/// ACK 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckType {
    /// 청크 수신 확인
    ChunkReceived = 0x01,

    /// 청크 에러 (재전송 요청)
    ChunkError = 0x02,

    /// 모든 청크 조립 완료 (검증 결과와 무관)
    TransferComplete = 0x03,

    /// 전체 CRC 검증 성공
    TransferSuccess = 0x04,

    /// 전체 CRC 검증 실패 또는 수신 중단
    TransferFailed = 0x05,
}

impl TryFrom<u8> for AckType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(AckType::ChunkReceived),
            0x02 => Ok(AckType::ChunkError),
            0x03 => Ok(AckType::TransferComplete),
            0x04 => Ok(AckType::TransferSuccess),
            0x05 => Ok(AckType::TransferFailed),
            other => Err(Error::UnknownAckType(other)),
        }
    }
}

/// 와이어 레이아웃 (ack_type은 u8 그대로 직렬화)
#[derive(Serialize, Deserialize)]
struct AckFrame {
    ack_type: u8,
    chunk_number: u32,
    total_chunks: u32,
    global_crc32: u32,
}

/// ACK 메시지 (컨트롤 경로)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    /// ACK 타입
    pub ack_type: AckType,

    /// 대상 청크 번호 (청크와 무관하면 0)
    pub chunk_number: u32,

    /// 세션 총 청크 수
    pub total_chunks: u32,

    /// 세션 전체 CRC32
    pub global_crc32: u32,
}

impl AckMessage {
    pub fn new(ack_type: AckType, chunk_number: u32, total_chunks: u32, global_crc32: u32) -> Self {
        Self {
            ack_type,
            chunk_number,
            total_chunks,
            global_crc32,
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let frame = AckFrame {
            ack_type: self.ack_type as u8,
            chunk_number: self.chunk_number,
            total_chunks: self.total_chunks,
            global_crc32: self.global_crc32,
        };
        let bytes = bincode::serialize(&frame).unwrap_or_default();
        debug_assert_eq!(bytes.len(), ACK_MESSAGE_SIZE);
        bytes
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ACK_MESSAGE_SIZE {
            return Err(Error::Truncated {
                what: "ACK 메시지",
                needed: ACK_MESSAGE_SIZE,
                got: bytes.len(),
            });
        }

        let frame: AckFrame = bincode::deserialize(&bytes[..ACK_MESSAGE_SIZE])?;

        Ok(Self {
            ack_type: AckType::try_from(frame.ack_type)?,
            chunk_number: frame.chunk_number,
            total_chunks: frame.total_chunks,
            global_crc32: frame.global_crc32,
        })
    }

    /// 전송 전체에 대한 메시지인지 여부
    pub fn is_transfer_level(&self) -> bool {
        matches!(
            self.ack_type,
            AckType::TransferComplete | AckType::TransferSuccess | AckType::TransferFailed
        )
    }
}
