//! 입력 검증과 보안 한도
//!
//! 모든 할당과 상태 변경 이전에 적용된다.

use crate::chunk::ChunkHeader;
use crate::{Config, Error, LimitViolation, Result};

/// 전송 크기 검증, 성공 시 필요한 청크 수 반환
///
/// 송신 페이로드 길이와 수신 헤더의 total_data_size 모두 이 함수를 거친다.
pub fn check_total_size(config: &Config, size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::SecurityRejected(LimitViolation::EmptyPayload));
    }

    if size > config.max_total_data_size {
        return Err(Error::SecurityRejected(LimitViolation::TotalSizeExceeded {
            size,
            max: config.max_total_data_size,
        }));
    }

    let chunks = config.chunks_for(size);
    if chunks > config.max_chunks_per_transfer {
        return Err(Error::SecurityRejected(LimitViolation::TooManyChunks {
            chunks,
            max: config.max_chunks_per_transfer,
        }));
    }

    Ok(chunks)
}

/// 새 수신 세션을 열기 전 헤더의 전송 파라미터 검증
///
/// 선언된 total_chunks가 크기로 계산한 값과 다르면 오프셋 계산을 믿을 수 없다.
pub fn check_transfer_geometry(config: &Config, header: &ChunkHeader) -> Result<usize> {
    let chunks = check_total_size(config, header.total_data_size as usize)?;

    if chunks != header.total_chunks as usize {
        return Err(Error::SecurityRejected(LimitViolation::ChunkCountMismatch {
            expected: chunks,
            declared: header.total_chunks as usize,
        }));
    }

    Ok(chunks)
}

/// 헤더 구조 검증 (범위 검사만, 세션과 무관)
pub fn check_header(config: &Config, header: &ChunkHeader) -> Result<()> {
    let invalid = |reason| Error::InvalidHeader {
        chunk_num: header.chunk_num,
        total_chunks: header.total_chunks,
        reason,
    };

    if header.total_chunks == 0 {
        return Err(invalid("total_chunks가 0"));
    }
    if header.total_chunks as usize > config.max_chunks_per_transfer {
        return Err(invalid("total_chunks가 최대 청크 수 초과"));
    }
    if header.chunk_num == 0 || header.chunk_num > header.total_chunks {
        return Err(invalid("chunk_num이 [1, total_chunks] 범위 밖"));
    }
    if header.data_size == 0 {
        return Err(invalid("data_size가 0"));
    }
    if header.data_size as usize > config.chunk_payload_size {
        return Err(invalid("data_size가 청크 크기 초과"));
    }

    Ok(())
}

/// 청크 번호에 대해 기대되는 데이터 길이
///
/// 마지막 청크만 나머지 길이를 가진다.
pub fn expected_chunk_len(config: &Config, total_data_size: usize, chunk_num: u16) -> usize {
    let offset = (chunk_num as usize).saturating_sub(1) * config.chunk_payload_size;
    total_data_size
        .saturating_sub(offset)
        .min(config.chunk_payload_size)
}
