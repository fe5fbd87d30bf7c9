//! 송신측 세션
//!
//! - 청크별 ACK 모드: 한 번에 하나의 청크만 전송, ACK 후 다음 청크
//! - 비확인 모드: 전체 청크 연속 전송, CHUNK_ERROR 받은 청크만 재전송
//! - 마지막 청크 이후 상대의 TRANSFER_SUCCESS / TRANSFER_FAILED 대기

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::chunk::Chunker;
use crate::engine::Context;
use crate::event::{Direction, Event, FailureReason};
use crate::message::{AckMessage, AckType};
use crate::state::{StateMachine, TransferState};
use crate::{crc, validate, Error, Result};

/// 송신 세션 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    /// 현재 청크의 ACK 대기
    ChunkInFlight,
    /// 모든 청크 전송 완료, 최종 결과 대기
    AwaitingResult,
}

/// 진행 중인 송신 세션
#[derive(Debug)]
struct SendSession {
    /// 원본 페이로드 (청크는 여기서 잘라낸다)
    payload: Bytes,
    chunker: Chunker,
    global_crc32: u32,
    total_chunks: usize,

    /// ACK를 기다리는 청크 인덱스 (0부터)
    current_index: usize,

    /// 확인된 가장 큰 청크 번호 (1부터, 0이면 없음)
    last_acked: u32,

    /// 남은 재시도 횟수
    /// 청크별 ACK 모드에서는 청크마다, 비확인 모드에서는 전송 전체에 대해 적용
    retries_remaining: u8,

    /// 현재 청크의 전송 횟수
    attempts: u32,

    phase: SendPhase,
    deadline: Instant,
    started_at: Instant,
}

impl SendSession {
    /// 상대가 보낸 ACK가 이 전송에 대한 것인지 확인
    fn matches(&self, ack: &AckMessage) -> bool {
        ack.total_chunks == self.total_chunks as u32 && ack.global_crc32 == self.global_crc32
    }

    fn outstanding_chunk(&self) -> u32 {
        self.current_index as u32 + 1
    }
}

/// 송신 방향 상태
#[derive(Debug)]
pub struct Sender {
    state: StateMachine,
    session: Option<SendSession>,
}

impl Sender {
    pub fn new() -> Self {
        Self {
            state: StateMachine::new(Direction::Sending),
            session: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state.state()
    }

    pub fn last_outcome(&self) -> Option<TransferState> {
        self.state.last_outcome()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// (확인된 청크 수, 총 청크 수)
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.session
            .as_ref()
            .map(|s| (s.last_acked as usize, s.total_chunks))
    }

    /// 새 송신 시작
    pub(crate) fn start(&mut self, payload: Bytes, now: Instant, ctx: &mut Context<'_>) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::TransferInProgress);
        }

        let total_chunks = match validate::check_total_size(ctx.config, payload.len()) {
            Ok(chunks) => chunks,
            Err(e) => {
                ctx.stats.security_rejections += 1;
                warn!("송신 거부: {}", e);
                return Err(e);
            }
        };

        let global_crc32 = crc::compute(&payload);
        self.state.transition(TransferState::Sending)?;

        info!(
            "송신 시작: {} bytes, {} 청크, global CRC {:08X}",
            payload.len(),
            total_chunks,
            global_crc32
        );

        self.session = Some(SendSession {
            payload,
            chunker: Chunker::new(ctx.config.chunk_payload_size),
            global_crc32,
            total_chunks,
            current_index: 0,
            last_acked: 0,
            retries_remaining: ctx.config.max_retries,
            attempts: 0,
            phase: SendPhase::ChunkInFlight,
            deadline: now + ctx.config.ack_timeout(),
            started_at: now,
        });

        if ctx.config.per_chunk_ack {
            self.send_next_chunk(now, ctx)
        } else {
            self.send_all_chunks(now, ctx)
        }
    }

    /// 청크 하나를 전송 계층으로 내보냄
    ///
    /// 전송 계층 에러는 로그만 남기고 타임아웃/재전송 경로에 맡긴다.
    fn transmit(session: &SendSession, index: usize, ctx: &mut Context<'_>) {
        let Some(chunk) = session
            .chunker
            .chunk_at(&session.payload, index, session.global_crc32)
        else {
            warn!("청크 인덱스 {} 범위 밖", index);
            return;
        };

        match ctx.transport.send_payload(&chunk.to_bytes()) {
            Ok(()) => {
                ctx.stats.chunks_sent += 1;
                ctx.stats.bytes_sent += chunk.data.len() as u64;
                debug!(
                    "청크 {}/{} 전송 ({} bytes)",
                    chunk.header.chunk_num,
                    chunk.header.total_chunks,
                    chunk.data.len()
                );
            }
            Err(e) => warn!("청크 {} 전송 실패: {}", chunk.header.chunk_num, e),
        }
    }

    /// 인덱스의 청크를 보내고 ACK 대기 상태로 전환
    fn send_chunk(&mut self, index: usize, now: Instant, ctx: &mut Context<'_>) -> Result<()> {
        if self.state.state() == TransferState::AwaitingAck {
            self.state.transition(TransferState::Sending)?;
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::ProtocolViolation("활성 송신 세션 없음".into()))?;

        Self::transmit(session, index, ctx);
        session.attempts += 1;
        session.deadline = now + ctx.config.ack_timeout();

        self.state.transition(TransferState::AwaitingAck)
    }

    /// 다음 청크 전송, 모두 확인되었으면 최종 결과 대기로 전환
    fn send_next_chunk(&mut self, now: Instant, ctx: &mut Context<'_>) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::ProtocolViolation("활성 송신 세션 없음".into()))?;

        if session.current_index >= session.total_chunks {
            session.phase = SendPhase::AwaitingResult;
            session.deadline = now + ctx.config.ack_timeout();
            debug!("모든 청크 ACK 수신, 최종 결과 대기");
            return Ok(());
        }

        let index = session.current_index;
        ctx.events
            .progress(index + 1, session.total_chunks, Direction::Sending);
        self.send_chunk(index, now, ctx)
    }

    /// 비확인 모드: 전체 청크 연속 전송
    fn send_all_chunks(&mut self, now: Instant, ctx: &mut Context<'_>) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::ProtocolViolation("활성 송신 세션 없음".into()))?;

        for index in 0..session.total_chunks {
            Self::transmit(session, index, ctx);
            ctx.events
                .progress(index + 1, session.total_chunks, Direction::Sending);
        }

        session.current_index = session.total_chunks;
        session.phase = SendPhase::AwaitingResult;
        session.deadline = now + ctx.config.ack_timeout();
        debug!("{} 청크 연속 전송 완료, 최종 결과 대기", session.total_chunks);

        self.state.transition(TransferState::AwaitingAck)
    }

    /// 청크 재전송 (재시도 한도 적용)
    fn retry(&mut self, index: usize, now: Instant, ctx: &mut Context<'_>) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::ProtocolViolation("활성 송신 세션 없음".into()))?;

        let chunk_num = (index + 1) as u16;
        if session.retries_remaining == 0 {
            let attempts = session.attempts;
            warn!("청크 {} 재시도 초과 ({}회 전송)", chunk_num, attempts);
            self.fail(FailureReason::RetriesExhausted, ctx);
            return Err(Error::RetriesExhausted { chunk_num, attempts });
        }

        session.retries_remaining -= 1;
        ctx.stats.retransmissions += 1;
        debug!(
            "청크 {} 재전송, 남은 재시도 {}",
            chunk_num, session.retries_remaining
        );

        self.send_chunk(index, now, ctx)
    }

    /// 컨트롤 경로로 들어온 ACK 처리
    pub(crate) fn handle_ack(
        &mut self,
        ack: &AckMessage,
        now: Instant,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        let per_chunk_ack = ctx.config.per_chunk_ack;
        let Some(session) = self.session.as_mut() else {
            debug!("송신 세션 없음, {:?} 무시", ack.ack_type);
            return Ok(());
        };

        if !session.matches(ack) {
            debug!(
                "다른 전송의 {:?} 무시 (global CRC {:08X})",
                ack.ack_type, ack.global_crc32
            );
            return Ok(());
        }

        match ack.ack_type {
            AckType::ChunkReceived => {
                if !per_chunk_ack || session.phase == SendPhase::AwaitingResult {
                    return Ok(());
                }
                if ack.chunk_number <= session.last_acked {
                    debug!("중복 ACK {} 무시", ack.chunk_number);
                    return Ok(());
                }
                if ack.chunk_number != session.outstanding_chunk() {
                    warn!(
                        "예상하지 않은 ACK {} (대기 중인 청크 {})",
                        ack.chunk_number,
                        session.outstanding_chunk()
                    );
                    return Ok(());
                }

                session.last_acked = ack.chunk_number;
                session.current_index += 1;
                session.retries_remaining = ctx.config.max_retries;
                session.attempts = 0;
                self.send_next_chunk(now, ctx)
            }

            AckType::ChunkError => {
                let index = if per_chunk_ack {
                    if session.phase == SendPhase::AwaitingResult
                        || ack.chunk_number != session.outstanding_chunk()
                    {
                        debug!("대기 중이 아닌 청크 {}의 CHUNK_ERROR 무시", ack.chunk_number);
                        return Ok(());
                    }
                    session.current_index
                } else {
                    match (ack.chunk_number as usize).checked_sub(1) {
                        Some(index) if index < session.total_chunks => index,
                        _ => {
                            warn!("범위 밖 청크 {}의 CHUNK_ERROR 무시", ack.chunk_number);
                            return Ok(());
                        }
                    }
                };

                warn!("청크 {} 오류 보고 수신", ack.chunk_number);
                self.retry(index, now, ctx)
            }

            AckType::TransferComplete => {
                debug!("상대 조립 완료, 검증 결과 대기");
                Ok(())
            }

            AckType::TransferSuccess => {
                // 마지막 청크의 ACK가 손실되어도 성공 응답으로 완료할 수 있다
                let last_in_flight = session.current_index + 1 >= session.total_chunks;
                if session.phase == SendPhase::AwaitingResult || last_in_flight {
                    self.complete(now, ctx)
                } else {
                    warn!(
                        "청크 {}/{} 전송 중 TRANSFER_SUCCESS 수신, 무시",
                        session.outstanding_chunk(),
                        session.total_chunks
                    );
                    Ok(())
                }
            }

            AckType::TransferFailed => {
                warn!("상대가 전송 실패 보고");
                self.fail(FailureReason::GlobalIntegrity, ctx);
                Ok(())
            }
        }
    }

    /// ACK 타임아웃 검사
    pub(crate) fn check_timeout(&mut self, now: Instant, ctx: &mut Context<'_>) {
        let (phase, index, can_resend) = match self.session.as_ref() {
            Some(session) if now >= session.deadline => (
                session.phase,
                session.current_index,
                ctx.config.per_chunk_ack && session.retries_remaining > 0,
            ),
            _ => return,
        };

        ctx.stats.timeouts += 1;
        match phase {
            SendPhase::ChunkInFlight => {
                warn!("청크 {} ACK 타임아웃", index + 1);
                if let Err(e) = self.retry(index, now, ctx) {
                    warn!("{}", e);
                }
            }
            SendPhase::AwaitingResult if can_resend => {
                // 결과 ACK가 손실되었을 수 있으므로 마지막 청크로 다시 묻는다
                debug!("최종 결과 타임아웃, 마지막 청크 재전송");
                if let Err(e) = self.retry(index.saturating_sub(1), now, ctx) {
                    warn!("{}", e);
                }
            }
            SendPhase::AwaitingResult => {
                warn!("최종 결과 타임아웃");
                self.fail(FailureReason::Timeout, ctx);
            }
        }
    }

    fn complete(&mut self, now: Instant, ctx: &mut Context<'_>) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let elapsed = now.duration_since(session.started_at);
        ctx.stats.record_transfer_completed(now, elapsed);
        self.state.finish(TransferState::Complete)?;

        let bytes = session.payload.len();
        info!(
            "송신 완료: {} bytes, {} 청크, {:.2}ms",
            bytes,
            session.total_chunks,
            elapsed.as_secs_f64() * 1000.0
        );
        ctx.events.emit(Event::SendCompleted { bytes });
        Ok(())
    }

    /// 세션 해제 (페이로드 참조도 함께 버려진다)
    pub(crate) fn fail(&mut self, reason: FailureReason, ctx: &mut Context<'_>) {
        let Some(session) = self.session.take() else {
            return;
        };

        if reason == FailureReason::ConnectionLost {
            self.state.reset();
        } else if let Err(e) = self.state.finish(TransferState::Failed) {
            warn!("{}", e);
            self.state.reset();
        }

        info!(
            "송신 세션 해제 ({:?}): {}/{} 청크 확인 상태",
            reason, session.last_acked, session.total_chunks
        );
        ctx.stats.record_transfer_failed();
        ctx.events.failed(Direction::Sending, reason);
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkHeader;
    use crate::event::{EventReceiver, EventSink};
    use crate::stats::TransferStats;
    use crate::transport::{MemoryTransport, Wire};
    use crate::Config;
    use std::time::Duration;

    struct Harness {
        config: Config,
        transport: MemoryTransport,
        wire: Wire,
        stats: TransferStats,
        events: EventSink,
        event_rx: EventReceiver,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let (transport, wire) = MemoryTransport::new(crate::DEFAULT_MTU_SIZE);
            let (events, event_rx) = EventSink::channel();
            Self {
                config,
                transport,
                wire,
                stats: TransferStats::new(),
                events,
                event_rx,
            }
        }

        fn ctx(&mut self) -> Context<'_> {
            Context {
                config: &self.config,
                transport: &self.transport,
                stats: &mut self.stats,
                events: &self.events,
            }
        }

        fn sent_chunks(&mut self) -> Vec<u16> {
            self.wire
                .drain_payload()
                .iter()
                .map(|frame| ChunkHeader::from_bytes(frame).unwrap().chunk_num)
                .collect()
        }

        fn failures(&mut self) -> Vec<FailureReason> {
            let mut reasons = Vec::new();
            while let Ok(event) = self.event_rx.try_recv() {
                if let Event::TransferFailed { reason, .. } = event {
                    reasons.push(reason);
                }
            }
            reasons
        }
    }

    fn ack(ack_type: AckType, chunk_number: u32, total: u32, payload: &Bytes) -> AckMessage {
        AckMessage::new(ack_type, chunk_number, total, crc::compute(payload))
    }

    #[test]
    fn test_unacknowledged_retry_budget_is_per_transfer() {
        let mut h = Harness::new(Config::unacknowledged());
        let mut sender = Sender::new();
        let payload = Bytes::from(vec![0x42u8; 1000]);
        let now = Instant::now();

        sender.start(payload.clone(), now, &mut h.ctx()).unwrap();
        assert_eq!(h.sent_chunks(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(sender.state(), TransferState::AwaitingAck);

        for chunk in [2, 4, 5] {
            let nak = ack(AckType::ChunkError, chunk, 6, &payload);
            sender.handle_ack(&nak, now, &mut h.ctx()).unwrap();
            assert_eq!(h.sent_chunks(), vec![chunk as u16]);
        }

        let nak = ack(AckType::ChunkError, 6, 6, &payload);
        assert!(matches!(
            sender.handle_ack(&nak, now, &mut h.ctx()),
            Err(Error::RetriesExhausted { chunk_num: 6, .. })
        ));
        assert!(!sender.is_active());
        assert_eq!(h.failures(), vec![FailureReason::RetriesExhausted]);
    }

    #[test]
    fn test_result_timeout_without_retry_budget() {
        let config = Config {
            max_retries: 0,
            ..Config::default()
        };
        let mut h = Harness::new(config);
        let mut sender = Sender::new();
        let payload = Bytes::from_static(b"one chunk");
        let now = Instant::now();

        sender.start(payload.clone(), now, &mut h.ctx()).unwrap();
        sender
            .handle_ack(&ack(AckType::ChunkReceived, 1, 1, &payload), now, &mut h.ctx())
            .unwrap();
        assert!(sender.is_active());

        sender.check_timeout(now + Duration::from_millis(1999), &mut h.ctx());
        assert!(sender.is_active());

        sender.check_timeout(now + Duration::from_secs(2), &mut h.ctx());
        assert!(!sender.is_active());
        assert_eq!(h.failures(), vec![FailureReason::Timeout]);
        assert_eq!(h.stats.timeouts, 1);
    }

    #[test]
    fn test_transfer_failed_is_terminal() {
        let mut h = Harness::new(Config::default());
        let mut sender = Sender::new();
        let payload = Bytes::from(vec![1u8; 300]);
        let now = Instant::now();

        sender.start(payload.clone(), now, &mut h.ctx()).unwrap();
        sender
            .handle_ack(&ack(AckType::TransferFailed, 0, 2, &payload), now, &mut h.ctx())
            .unwrap();

        assert!(!sender.is_active());
        assert_eq!(sender.last_outcome(), Some(TransferState::Failed));
        assert_eq!(h.failures(), vec![FailureReason::GlobalIntegrity]);
        assert_eq!(h.stats.transfers_failed, 1);
    }

    #[test]
    fn test_early_transfer_success_is_ignored() {
        let mut h = Harness::new(Config::default());
        let mut sender = Sender::new();
        let payload = Bytes::from(vec![1u8; 500]);
        let now = Instant::now();

        sender.start(payload.clone(), now, &mut h.ctx()).unwrap();
        sender
            .handle_ack(&ack(AckType::TransferSuccess, 0, 3, &payload), now, &mut h.ctx())
            .unwrap();

        assert!(sender.is_active());
        assert_eq!(sender.progress(), Some((0, 3)));
    }

    #[test]
    fn test_completion_time_follows_injected_clock() {
        let mut h = Harness::new(Config::default());
        let mut sender = Sender::new();
        let payload = Bytes::from_static(b"one chunk");
        let start = Instant::now();
        let acked = start + Duration::from_millis(1000);
        let finish = start + Duration::from_millis(1500);

        sender.start(payload.clone(), start, &mut h.ctx()).unwrap();
        sender
            .handle_ack(&ack(AckType::ChunkReceived, 1, 1, &payload), acked, &mut h.ctx())
            .unwrap();
        sender
            .handle_ack(&ack(AckType::TransferSuccess, 0, 1, &payload), finish, &mut h.ctx())
            .unwrap();

        assert!(!sender.is_active());
        assert_eq!(h.stats.last_transfer_time, Some(finish));
        assert_eq!(
            h.stats.last_transfer_duration,
            Some(Duration::from_millis(1500))
        );
    }
}
