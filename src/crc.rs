//! CRC32 (IEEE 802.3) 계산
//!
//! 다항식 0xEDB88320 (reflected), 초기값 0xFFFFFFFF, 최종 XOR 0xFFFFFFFF.
//! 실제 계산은 `crc32fast`가 담당한다 (SIMD 가속 자동 선택).

use std::sync::Once;

use tracing::debug;

/// "123456789"의 CRC32 검사값
pub const CHECK_VALUE: u32 = 0xCBF4_3926;

static INIT: Once = Once::new();

/// 엔진 준비 (여러 번 호출해도 한 번만 수행)
///
/// 가속 경로 선택을 첫 청크 처리 전에 끝내고 검사값을 확인한다.
pub fn init() {
    INIT.call_once(|| {
        let check = compute(b"123456789");
        debug!("CRC32 준비 완료 (검사값 {:08X})", check);
    });
}

/// 바이트 슬라이스의 CRC32 계산
#[inline]
pub fn compute(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 스트리밍 CRC32 계산기
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(compute(b""), 0);
        assert_eq!(compute(b"123456789"), CHECK_VALUE);
        assert_eq!(
            compute(b"The quick brown fox jumps over the lazy dog"),
            0x414F_A339
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        assert_eq!(compute(b"123456789"), CHECK_VALUE);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();

        let mut hasher = Crc32::new();
        for part in data.chunks(37) {
            hasher.update(part);
        }

        assert_eq!(hasher.finalize(), compute(&data));
    }

    #[test]
    fn test_single_bit_flip_changes_checksum() {
        let mut data: Vec<u8> = (0..168u32).map(|i| i as u8).collect();
        let before = compute(&data);
        data[100] ^= 0x01;
        assert_ne!(compute(&data), before);
    }
}
