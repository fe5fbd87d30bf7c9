//! 전송 통계

use std::time::{Duration, Instant};

/// 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간 (마지막 리셋 기준)
    pub start_time: Instant,

    /// 송신 데이터 바이트 (헤더 제외, 재전송 포함)
    pub bytes_sent: u64,

    /// 수신 데이터 바이트 (중복 제외)
    pub bytes_received: u64,

    /// 송신 청크 수 (재전송 포함)
    pub chunks_sent: u64,

    /// 새로 저장된 수신 청크 수
    pub chunks_received: u64,

    /// 중복 수신 청크 수
    pub duplicate_chunks: u64,

    /// 재전송 청크 수
    pub retransmissions: u64,

    /// 청크/전체 CRC 또는 크기 필드 불일치
    pub crc_errors: u64,

    /// 구조적으로 잘못된 프레임 (짧은 헤더, 범위 밖 필드, 알 수 없는 ACK)
    pub malformed_frames: u64,

    /// 보안 한도 위반으로 거부된 전송
    pub security_rejections: u64,

    /// 타임아웃 횟수 (청크 타임아웃 + ACK 타임아웃)
    pub timeouts: u64,

    /// 성공한 전송 수 (송신 + 수신)
    pub transfers_completed: u64,

    /// 실패한 전송 수 (송신 + 수신)
    pub transfers_failed: u64,

    /// 마지막 전송 완료 시간
    pub last_transfer_time: Option<Instant>,

    /// 마지막으로 성공한 전송의 소요 시간 (세션 시작부터 완료까지)
    pub last_transfer_duration: Option<Duration>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_sent: 0,
            bytes_received: 0,
            chunks_sent: 0,
            chunks_received: 0,
            duplicate_chunks: 0,
            retransmissions: 0,
            crc_errors: 0,
            malformed_frames: 0,
            security_rejections: 0,
            timeouts: 0,
            transfers_completed: 0,
            transfers_failed: 0,
            last_transfer_time: None,
            last_transfer_duration: None,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 송수신 합산 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        (self.bytes_sent + self.bytes_received) as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmission_ratio(&self) -> f64 {
        if self.chunks_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.chunks_sent as f64
    }

    pub(crate) fn record_transfer_completed(&mut self, finished_at: Instant, duration: Duration) {
        self.transfers_completed += 1;
        self.last_transfer_time = Some(finished_at);
        self.last_transfer_duration = Some(duration);
    }

    pub(crate) fn record_transfer_failed(&mut self) {
        self.transfers_failed += 1;
    }

    /// 통계 리셋
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} bytes ({} chunks, {} retx) | Received: {} bytes ({} chunks, {} dup) | CRC errors: {} | Timeouts: {} | Transfers: {} ok / {} failed",
            self.elapsed().as_secs_f64(),
            self.bytes_sent,
            self.chunks_sent,
            self.retransmissions,
            self.bytes_received,
            self.chunks_received,
            self.duplicate_chunks,
            self.crc_errors,
            self.timeouts,
            self.transfers_completed,
            self.transfers_failed,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
