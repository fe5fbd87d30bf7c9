//! 청크 헤더와 청크 분할/조립
//!
//! - Chunk: 헤더(17 bytes) + 최대 255 bytes 데이터, 전송 패킷 하나
//! - Reassembly: 오프셋 기반 수신 버퍼, 순서와 무관하게 조립

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{crc, Error, Result, CHUNK_HEADER_SIZE};

/// 청크 헤더 (모든 페이로드 방향 패킷의 앞부분)
///
/// bincode 고정 길이 little-endian 인코딩으로 필드 순서 그대로 17 bytes가 된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// 청크 번호 (1부터 시작)
    pub chunk_num: u16,

    /// 전송 내 총 청크 수
    pub total_chunks: u16,

    /// 헤더 뒤에 오는 데이터 길이
    pub data_size: u8,

    /// 이 청크 데이터의 CRC32
    pub chunk_crc32: u32,

    /// 전체 페이로드의 CRC32 (모든 청크에서 동일)
    pub global_crc32: u32,

    /// 전체 페이로드 크기
    pub total_data_size: u32,
}

impl ChunkHeader {
    /// 헤더를 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let bytes = bincode::serialize(self).unwrap_or_default();
        debug_assert_eq!(bytes.len(), CHUNK_HEADER_SIZE);
        bytes
    }

    /// 바이트에서 헤더 역직렬화 (뒤따르는 데이터는 무시)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(Error::Truncated {
                what: "청크 헤더",
                needed: CHUNK_HEADER_SIZE,
                got: bytes.len(),
            });
        }

        Ok(bincode::deserialize(&bytes[..CHUNK_HEADER_SIZE])?)
    }

    /// 같은 전송에 속하는 헤더인지 확인
    pub fn same_transfer(&self, other: &ChunkHeader) -> bool {
        self.total_chunks == other.total_chunks
            && self.global_crc32 == other.global_crc32
            && self.total_data_size == other.total_data_size
    }
}

/// 청크 (송신 패킷 단위)
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 청크 헤더
    pub header: ChunkHeader,

    /// 실제 데이터
    pub data: Bytes,
}

impl Chunk {
    /// 새 청크 생성 (청크 CRC 계산 포함)
    pub fn new(
        chunk_num: u16,
        total_chunks: u16,
        global_crc32: u32,
        total_data_size: u32,
        data: Bytes,
    ) -> Self {
        Self {
            header: ChunkHeader {
                chunk_num,
                total_chunks,
                data_size: data.len() as u8,
                chunk_crc32: crc::compute(&data),
                global_crc32,
                total_data_size,
            },
            data,
        }
    }

    /// 헤더 + 데이터를 한 프레임으로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// 프레임에서 청크 역직렬화
    ///
    /// 헤더 이후의 바이트를 그대로 데이터로 취급한다. 크기/CRC 검증은 수신측 몫.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = ChunkHeader::from_bytes(bytes)?;
        let data = Bytes::copy_from_slice(&bytes[CHUNK_HEADER_SIZE..]);
        Ok(Self { header, data })
    }

    /// 청크 CRC 검증
    pub fn verify_crc(&self) -> bool {
        crc::compute(&self.data) == self.header.chunk_crc32
    }
}

/// 청크 분할기 (송신측)
///
/// 페이로드를 복사하지 않고 `Bytes::slice`로 잘라낸다.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 페이로드에 필요한 청크 수
    pub fn total_chunks(&self, payload_len: usize) -> usize {
        crate::config::chunks_for(payload_len, self.chunk_size)
    }

    /// 0부터 시작하는 인덱스의 청크 생성
    pub fn chunk_at(&self, payload: &Bytes, index: usize, global_crc32: u32) -> Option<Chunk> {
        let start = index.checked_mul(self.chunk_size)?;
        if start >= payload.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(payload.len());

        Some(Chunk::new(
            (index + 1) as u16,
            self.total_chunks(payload.len()) as u16,
            global_crc32,
            payload.len() as u32,
            payload.slice(start..end),
        ))
    }

    /// 전체 페이로드를 청크들로 분할
    pub fn split(&self, payload: &Bytes) -> Vec<Chunk> {
        let global_crc32 = crc::compute(payload);
        (0..self.total_chunks(payload.len()))
            .filter_map(|index| self.chunk_at(payload, index, global_crc32))
            .collect()
    }
}

/// 청크 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// 새로 저장됨
    Stored,
    /// 이미 받은 청크
    Duplicate,
}

/// 수신 조립 버퍼
///
/// 크기는 한도 검증이 끝난 뒤 정확히 total_size로 한 번만 할당된다.
#[derive(Debug)]
pub struct Reassembly {
    /// 페이로드 버퍼
    data: Vec<u8>,

    /// 수신된 청크 비트맵 (chunk_num - 1 -> 수신 여부)
    received_chunks: Vec<bool>,

    /// 청크 데이터 크기 (오프셋 계산용)
    chunk_size: usize,

    /// 수신된 청크 수
    received_count: usize,

    /// 저장된 바이트 수
    bytes_stored: usize,
}

impl Reassembly {
    /// 새 조립 버퍼 생성
    ///
    /// 할당 실패는 패닉 대신 `AllocationFailure`로 보고된다.
    pub fn new(total_size: usize, total_chunks: usize, chunk_size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(total_size)
            .map_err(|_| Error::AllocationFailure { size: total_size })?;
        data.resize(total_size, 0);

        let mut received_chunks = Vec::new();
        received_chunks
            .try_reserve_exact(total_chunks)
            .map_err(|_| Error::AllocationFailure { size: total_chunks })?;
        received_chunks.resize(total_chunks, false);

        Ok(Self {
            data,
            received_chunks,
            chunk_size,
            received_count: 0,
            bytes_stored: 0,
        })
    }

    /// 청크 데이터 삽입
    ///
    /// 오프셋은 `(chunk_num - 1) * chunk_size`이며, 쓰기 전에 실제 버퍼 길이로 범위를 검사한다.
    pub fn insert(&mut self, chunk_num: u16, payload: &[u8]) -> Result<Insert> {
        let index = (chunk_num as usize)
            .checked_sub(1)
            .filter(|&i| i < self.received_chunks.len())
            .ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "청크 번호 {} 범위 밖 (총 {}개)",
                    chunk_num,
                    self.received_chunks.len()
                ))
            })?;

        if self.received_chunks[index] {
            return Ok(Insert::Duplicate);
        }

        let offset = index * self.chunk_size;
        let end = offset
            .checked_add(payload.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "청크 {} 쓰기 범위 {}+{}가 버퍼 {} bytes 초과",
                    chunk_num,
                    offset,
                    payload.len(),
                    self.data.len()
                ))
            })?;

        self.data[offset..end].copy_from_slice(payload);
        self.received_chunks[index] = true;
        self.received_count += 1;
        self.bytes_stored += payload.len();
        Ok(Insert::Stored)
    }

    /// 특정 청크 수신 여부
    pub fn contains(&self, chunk_num: u16) -> bool {
        (chunk_num as usize)
            .checked_sub(1)
            .and_then(|i| self.received_chunks.get(i).copied())
            .unwrap_or(false)
    }

    /// 완료 여부 확인
    pub fn is_complete(&self) -> bool {
        self.received_count == self.received_chunks.len()
    }

    /// 누락된 청크 번호 목록 (1부터 시작)
    pub fn missing_chunks(&self) -> Vec<u16> {
        self.received_chunks
            .iter()
            .enumerate()
            .filter(|(_, &received)| !received)
            .map(|(i, _)| (i + 1) as u16)
            .collect()
    }

    pub fn received_count(&self) -> usize {
        self.received_count
    }

    pub fn total_chunks(&self) -> usize {
        self.received_chunks.len()
    }

    pub fn bytes_stored(&self) -> usize {
        self.bytes_stored
    }

    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// 수신률 계산
    pub fn receive_ratio(&self) -> f64 {
        if self.received_chunks.is_empty() {
            return 0.0;
        }
        self.received_count as f64 / self.received_chunks.len() as f64
    }

    /// 조립된 버퍼의 CRC32
    pub fn crc32(&self) -> u32 {
        crc::compute(&self.data)
    }

    /// 완료된 데이터 추출
    pub fn into_data(self) -> Bytes {
        Bytes::from(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_fixed_little_endian() {
        let header = ChunkHeader {
            chunk_num: 0x0102,
            total_chunks: 0x0304,
            data_size: 0x05,
            chunk_crc32: 0x0A09_0807,
            global_crc32: 0x0E0D_0C0B,
            total_data_size: 0x1211_100F,
        };

        let bytes = header.to_bytes();
        assert_eq!(
            bytes,
            vec![
                0x02, 0x01, 0x04, 0x03, 0x05, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
                0x0F, 0x10, 0x11, 0x12
            ]
        );
        assert_eq!(ChunkHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_short_input() {
        let err = ChunkHeader::from_bytes(&[0u8; CHUNK_HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                needed: CHUNK_HEADER_SIZE,
                got: 16,
                ..
            }
        ));
    }

    #[test]
    fn test_chunk_serialization() {
        let chunk = Chunk::new(1, 3, 0xDEAD_BEEF, 400, Bytes::from(vec![1, 2, 3, 4, 5]));

        let bytes = chunk.to_bytes();
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE + 5);

        let restored = Chunk::from_bytes(&bytes).unwrap();
        assert_eq!(restored.header, chunk.header);
        assert_eq!(restored.data, chunk.data);
        assert!(restored.verify_crc());
    }

    #[test]
    fn test_chunker_slices_without_copy() {
        let payload = Bytes::from((0..250u8).collect::<Vec<_>>());
        let chunker = Chunker::new(100);
        let chunks = chunker.split(&payload);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].header.chunk_num, 1);
        assert_eq!(chunks[2].header.chunk_num, 3);
        assert_eq!(chunks[2].header.data_size, 50);
        assert!(chunks.iter().all(|c| c.header.total_chunks == 3));
        assert!(chunks.iter().all(|c| c.header.total_data_size == 250));
        assert!(chunks.iter().all(|c| c.header.global_crc32 == crc::compute(&payload)));
        assert_eq!(chunks[1].data.as_ptr(), payload[100..].as_ptr());
        assert!(chunker.chunk_at(&payload, 3, 0).is_none());
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let payload = Bytes::from((0..250u8).collect::<Vec<_>>());
        let chunks = Chunker::new(100).split(&payload);

        let mut reassembly = Reassembly::new(250, 3, 100).unwrap();
        for chunk in chunks.iter().rev() {
            assert_eq!(
                reassembly.insert(chunk.header.chunk_num, &chunk.data).unwrap(),
                Insert::Stored
            );
        }

        assert!(reassembly.is_complete());
        assert_eq!(reassembly.bytes_stored(), 250);
        assert_eq!(reassembly.crc32(), crc::compute(&payload));
        assert_eq!(reassembly.into_data(), payload);
    }

    #[test]
    fn test_reassembly_duplicate_and_bounds() {
        let mut reassembly = Reassembly::new(150, 2, 100).unwrap();

        assert_eq!(reassembly.insert(2, &[7u8; 50]).unwrap(), Insert::Stored);
        assert_eq!(reassembly.insert(2, &[9u8; 50]).unwrap(), Insert::Duplicate);
        assert_eq!(reassembly.bytes_stored(), 50);
        assert_eq!(reassembly.missing_chunks(), vec![1]);
        assert!(reassembly.contains(2));
        assert!(!reassembly.contains(1));

        assert!(reassembly.insert(0, &[0u8; 10]).is_err());
        assert!(reassembly.insert(3, &[0u8; 10]).is_err());

        // 헤더가 선언한 범위 안이라도 실제 버퍼를 넘어서는 쓰기는 거부
        let mut short = Reassembly::new(120, 2, 100).unwrap();
        assert!(short.insert(2, &[0u8; 50]).is_err());
        assert_eq!(short.bytes_stored(), 0);
    }
}
