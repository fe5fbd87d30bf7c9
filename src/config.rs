//! 프로토콜 설정

use std::time::Duration;

use crate::{
    Error, Result, CHUNK_HEADER_SIZE, DEFAULT_CHUNK_PAYLOAD, DEFAULT_MAX_TOTAL_DATA_SIZE,
    MAX_CHUNK_PAYLOAD,
};

/// CBP 프로토콜 설정
///
/// 와이어 포맷에는 포함되지 않으므로 양쪽 끝이 같은 값을 사용해야 한다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크당 데이터 크기 (바이트, 최대 255)
    pub chunk_payload_size: usize,

    /// 청크 수신 타임아웃 (밀리초)
    /// 마지막 청크 이후 이 시간 동안 다음 청크가 없으면 수신 세션 취소
    pub chunk_timeout_ms: u64,

    /// ACK 대기 타임아웃 (밀리초)
    pub ack_timeout_ms: u64,

    /// 청크당 최대 재전송 횟수
    pub max_retries: u8,

    /// 최대 전송 크기 (바이트)
    pub max_total_data_size: usize,

    /// 전송당 최대 청크 수
    pub max_chunks_per_transfer: usize,

    /// 청크별 ACK 사용 여부
    /// false면 전체 청크를 연속 전송하고 최종 결과만 기다림 (CRC 검증은 유지)
    pub per_chunk_ack: bool,

    /// 타임아웃 검사 주기 (밀리초)
    pub tick_interval_ms: u64,

    /// 링크 명령 채널 크기
    pub command_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_payload_size: DEFAULT_CHUNK_PAYLOAD,       // 168 bytes
            chunk_timeout_ms: 5000,                          // 5초
            ack_timeout_ms: 2000,                            // 2초
            max_retries: 3,
            max_total_data_size: DEFAULT_MAX_TOTAL_DATA_SIZE, // 64KB
            max_chunks_per_transfer: chunks_for(DEFAULT_MAX_TOTAL_DATA_SIZE, DEFAULT_CHUNK_PAYLOAD),
            per_chunk_ack: true,
            tick_interval_ms: 100,
            command_buffer: 1000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 협상된 MTU에 맞춘 설정
    ///
    /// 청크 데이터 크기는 MTU에서 헤더를 뺀 값이며 255를 넘지 않는다.
    pub fn for_mtu(mtu: usize) -> Self {
        let chunk_payload_size = mtu
            .saturating_sub(CHUNK_HEADER_SIZE)
            .clamp(1, MAX_CHUNK_PAYLOAD);

        Self {
            chunk_payload_size,
            max_chunks_per_transfer: chunks_for(DEFAULT_MAX_TOTAL_DATA_SIZE, chunk_payload_size),
            ..Self::default()
        }
    }

    /// 손실이 많은 링크용 설정
    pub fn unreliable_link() -> Self {
        Self {
            chunk_timeout_ms: 15000,
            ack_timeout_ms: 4000,
            max_retries: 8,
            ..Self::default()
        }
    }

    /// 청크별 ACK 없이 동작하는 설정 (신뢰할 수 있는 저손실 링크용)
    pub fn unacknowledged() -> Self {
        Self {
            per_chunk_ack: false,
            ..Self::default()
        }
    }

    /// 크기에 필요한 청크 수 계산
    pub fn chunks_for(&self, size: usize) -> usize {
        chunks_for(size, self.chunk_payload_size)
    }

    /// 청크 타임아웃
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    /// ACK 타임아웃
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// tick 주기
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_payload_size == 0 || self.chunk_payload_size > MAX_CHUNK_PAYLOAD {
            return Err(Error::InvalidConfig(format!(
                "chunk_payload_size {}는 1..={} 범위여야 함",
                self.chunk_payload_size, MAX_CHUNK_PAYLOAD
            )));
        }

        if self.max_total_data_size == 0 || self.max_total_data_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_total_data_size {} 범위 초과",
                self.max_total_data_size
            )));
        }

        if self.max_chunks_per_transfer == 0 || self.max_chunks_per_transfer > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_chunks_per_transfer {}는 1..={} 범위여야 함",
                self.max_chunks_per_transfer,
                u16::MAX
            )));
        }

        if self.chunk_timeout_ms == 0 || self.ack_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("타임아웃과 tick 주기는 0보다 커야 함".into()));
        }

        if self.command_buffer == 0 {
            return Err(Error::InvalidConfig("command_buffer는 0보다 커야 함".into()));
        }

        Ok(())
    }
}

/// ceil(size / chunk_size)
pub(crate) fn chunks_for(size: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    (size + chunk_size - 1) / chunk_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_cover_max_size() {
        let config = Config::default();
        assert_eq!(config.chunk_payload_size, 168);
        assert_eq!(config.max_chunks_per_transfer, 391);
        assert!(
            config.max_chunks_per_transfer * config.chunk_payload_size
                >= config.max_total_data_size
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_mtu_caps_payload() {
        assert_eq!(Config::for_mtu(23).chunk_payload_size, 6);
        assert_eq!(Config::for_mtu(517).chunk_payload_size, 255);

        let config = Config::for_mtu(247);
        assert_eq!(config.chunk_payload_size, 230);
        assert!(config.max_chunks_per_transfer * 230 >= config.max_total_data_size);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            chunk_payload_size: 256,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            ack_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_chunks_per_transfer: 70_000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunks_for() {
        let config = Config::default();
        assert_eq!(config.chunks_for(0), 0);
        assert_eq!(config.chunks_for(1), 1);
        assert_eq!(config.chunks_for(168), 1);
        assert_eq!(config.chunks_for(169), 2);
        assert_eq!(config.chunks_for(64 * 1024), 391);
    }
}
