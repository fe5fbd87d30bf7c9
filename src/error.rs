//! 에러 타입 정의

use thiserror::Error;

/// 보안 한도 위반 사유
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitViolation {
    #[error("빈 페이로드")]
    EmptyPayload,

    #[error("전체 크기 {size} bytes가 최대 {max} bytes 초과")]
    TotalSizeExceeded { size: usize, max: usize },

    #[error("청크 수 {chunks}개가 최대 {max}개 초과")]
    TooManyChunks { chunks: usize, max: usize },

    #[error("청크 수 불일치: 크기 기준 {expected}개, 헤더 {declared}개")]
    ChunkCountMismatch { expected: usize, declared: usize },
}

/// CBP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("{what} 길이 부족: 최소 {needed} bytes, got {got}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("알 수 없는 ACK 타입: 0x{0:02X}")]
    UnknownAckType(u8),

    #[error("유효하지 않은 청크 헤더 (chunk {chunk_num}/{total_chunks}): {reason}")]
    InvalidHeader {
        chunk_num: u16,
        total_chunks: u16,
        reason: &'static str,
    },

    #[error("보안 한도 초과: {0}")]
    SecurityRejected(LimitViolation),

    #[error("청크 {chunk_num} CRC 불일치: expected {expected:08X}, got {got:08X}")]
    ChunkCrcMismatch { chunk_num: u16, expected: u32, got: u32 },

    #[error("청크 {chunk_num} 크기 불일치: declared {declared}, actual {actual}")]
    ChunkSizeMismatch {
        chunk_num: u16,
        declared: usize,
        actual: usize,
    },

    #[error("전체 CRC 불일치: expected {expected:08X}, got {got:08X}")]
    GlobalCrcMismatch { expected: u32, got: u32 },

    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(String),

    #[error("타임아웃: {0}")]
    Timeout(&'static str),

    #[error("재시도 초과: chunk {chunk_num}, {attempts}회 전송")]
    RetriesExhausted { chunk_num: u16, attempts: u32 },

    #[error("버퍼 할당 실패: {size} bytes")]
    AllocationFailure { size: usize },

    #[error("연결 끊김")]
    ConnectionLost,

    #[error("연결되지 않음")]
    NotConnected,

    #[error("이미 전송 중")]
    TransferInProgress,

    #[error("전송 취소: {0}")]
    Cancelled(String),

    #[error("프레임 크기 {len} bytes가 MTU {mtu} bytes 초과")]
    FrameTooLarge { len: usize, mtu: usize },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelError,
}

impl Error {
    /// 세션을 끝내지 않는 국소 에러인지 여부
    ///
    /// 구조/청크 무결성 에러는 CHUNK_ERROR 응답과 재시도로 복구된다.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Truncated { .. }
                | Error::UnknownAckType(_)
                | Error::InvalidHeader { .. }
                | Error::ChunkCrcMismatch { .. }
                | Error::ChunkSizeMismatch { .. }
        )
    }

    /// 청크 무결성 에러 (청크 CRC 또는 크기 필드 불일치)
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Error::ChunkCrcMismatch { .. } | Error::ChunkSizeMismatch { .. }
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
