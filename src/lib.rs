//! # CBP (Chunked BLE Protocol)
//!
//! MTU가 작은 notify 기반 무선 링크 위의 ACK 기반 청크 전송 프로토콜
//!
//! ## 핵심 특징
//! - **청크 분할**: 큰 페이로드를 MTU 크기의 청크로 분할, 오프셋 기반 조립
//! - **이중 CRC32**: 청크별 CRC + 전체 페이로드 CRC
//! - **ACK 기반 재전송**: 한 번에 하나의 청크만 전송, 제한된 재시도
//! - **보안 한도**: 신뢰할 수 없는 헤더로 인한 무제한 메모리 할당 차단
//! - **반응형 엔진**: 블로킹 없이 deadline 기록, 주기적 tick으로 타임아웃 처리
//! - **단일 직렬화 지점**: 연결당 하나의 엔진을 하나의 태스크가 소유

pub mod chunk;
pub mod config;
pub mod crc;
pub mod engine;
pub mod error;
pub mod event;
pub mod link;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod state;
pub mod stats;
pub mod transport;
pub mod udp;
pub mod validate;

pub use chunk::{Chunk, ChunkHeader, Chunker, Reassembly};
pub use config::Config;
pub use engine::{ChunkOutcome, Engine};
pub use error::{Error, LimitViolation, Result};
pub use event::{Callbacks, Direction, Event, EventReceiver, FailureReason};
pub use link::Link;
pub use message::{AckMessage, AckType};
pub use state::TransferState;
pub use stats::TransferStats;
pub use transport::{LinkConditions, MemoryTransport, Transport, Wire};
pub use udp::UdpTransport;

/// 청크 헤더 크기 (바이트)
///
/// chunk_num(2) + total_chunks(2) + data_size(1) + chunk_crc32(4) + global_crc32(4) + total_data_size(4)
pub const CHUNK_HEADER_SIZE: usize = 17;

/// ACK 메시지 크기 (바이트)
///
/// ack_type(1) + chunk_number(4) + total_chunks(4) + global_crc32(4)
pub const ACK_MESSAGE_SIZE: usize = 13;

/// 기본 링크 MTU (바이트)
pub const DEFAULT_MTU_SIZE: usize = 185;

/// 기본 청크 데이터 크기 (MTU - 헤더)
pub const DEFAULT_CHUNK_PAYLOAD: usize = DEFAULT_MTU_SIZE - CHUNK_HEADER_SIZE;

/// data_size 필드가 8비트이므로 청크 데이터의 절대 상한
pub const MAX_CHUNK_PAYLOAD: usize = u8::MAX as usize;

/// 기본 최대 전송 크기 (64KB)
pub const DEFAULT_MAX_TOTAL_DATA_SIZE: usize = 64 * 1024;
