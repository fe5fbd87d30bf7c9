//! 수신측 세션
//!
//! - 순서 무관, 중복 허용 청크 조립
//! - 청크별 CRC 검증 후 CHUNK_RECEIVED / CHUNK_ERROR 응답
//! - 전체 조립 후 전체 CRC 검증

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::chunk::{ChunkHeader, Insert, Reassembly};
use crate::engine::Context;
use crate::event::{Direction, Event, FailureReason};
use crate::message::{AckMessage, AckType};
use crate::state::{StateMachine, TransferState};
use crate::{crc, validate, Error, Result, CHUNK_HEADER_SIZE};

/// 청크 하나를 처리한 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 새 청크 저장
    Stored {
        chunk_num: u16,
        received: usize,
        total: usize,
    },
    /// 이미 받은 청크 (CHUNK_RECEIVED 재전송만 수행)
    Duplicate { chunk_num: u16 },
    /// 전체 조립 및 전체 CRC 검증 성공
    Completed { bytes: usize },
}

/// 진행 중인 수신 세션
#[derive(Debug)]
struct ReceiveSession {
    /// 세션을 연 청크의 헤더 (전송 식별용)
    transfer: ChunkHeader,
    reassembly: Reassembly,
    started_at: Instant,
    deadline: Instant,
}

impl ReceiveSession {
    fn matches(&self, header: &ChunkHeader) -> bool {
        self.transfer.same_transfer(header)
    }

    fn ack(&self, ack_type: AckType, chunk_number: u32) -> AckMessage {
        AckMessage::new(
            ack_type,
            chunk_number,
            self.transfer.total_chunks as u32,
            self.transfer.global_crc32,
        )
    }
}

/// 최근에 성공한 수신
///
/// 마지막 ACK들이 모두 손실되어 송신측이 청크를 재전송할 때
/// 새 세션을 열지 않고 성공 응답만 다시 보내기 위해 잠시 유지한다.
#[derive(Debug)]
struct CompletedTransfer {
    transfer: ChunkHeader,
    expires: Instant,
}

/// 헤더 값을 그대로 되돌려주는 CHUNK_ERROR
fn chunk_error(header: &ChunkHeader) -> AckMessage {
    AckMessage::new(
        AckType::ChunkError,
        header.chunk_num as u32,
        header.total_chunks as u32,
        header.global_crc32,
    )
}

/// 청크 길이와 CRC 검증, 실패하면 CHUNK_ERROR 응답
fn check_integrity(
    header: &ChunkHeader,
    data: &[u8],
    total_size: usize,
    ctx: &mut Context<'_>,
) -> Result<()> {
    let chunk_num = header.chunk_num;
    let declared = header.data_size as usize;

    if data.len() != declared {
        ctx.stats.crc_errors += 1;
        warn!(
            "청크 {} 크기 불일치: header {}, received {}",
            chunk_num,
            declared,
            data.len()
        );
        ctx.send_ack(chunk_error(header));
        return Err(Error::ChunkSizeMismatch {
            chunk_num,
            declared,
            actual: data.len(),
        });
    }

    let expected_len = validate::expected_chunk_len(ctx.config, total_size, chunk_num);
    if declared != expected_len {
        ctx.stats.crc_errors += 1;
        warn!(
            "청크 {} 길이 {}가 위치상 기대 길이 {}와 다름",
            chunk_num, declared, expected_len
        );
        ctx.send_ack(chunk_error(header));
        return Err(Error::ChunkSizeMismatch {
            chunk_num,
            declared,
            actual: expected_len,
        });
    }

    let actual_crc = crc::compute(data);
    if actual_crc != header.chunk_crc32 {
        ctx.stats.crc_errors += 1;
        warn!(
            "청크 {} CRC 불일치: expected {:08X}, calculated {:08X}",
            chunk_num, header.chunk_crc32, actual_crc
        );
        ctx.send_ack(chunk_error(header));
        return Err(Error::ChunkCrcMismatch {
            chunk_num,
            expected: header.chunk_crc32,
            got: actual_crc,
        });
    }

    Ok(())
}

/// 수신 방향 상태
#[derive(Debug)]
pub struct Receiver {
    state: StateMachine,
    session: Option<ReceiveSession>,
    completed: Option<CompletedTransfer>,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            state: StateMachine::new(Direction::Receiving),
            session: None,
            completed: None,
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

    /// (수신 청크 수, 총 청크 수)
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.session.as_ref().map(|s| {
            (
                s.reassembly.received_count(),
                s.reassembly.total_chunks(),
            )
        })
    }

    /// 현재 세션에 저장된 바이트 수
    pub fn bytes_stored(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.reassembly.bytes_stored())
    }

    /// 페이로드 경로로 들어온 프레임 처리
    pub(crate) fn handle_chunk(
        &mut self,
        frame: &[u8],
        now: Instant,
        ctx: &mut Context<'_>,
    ) -> Result<ChunkOutcome> {
        let header = match ChunkHeader::from_bytes(frame) {
            Ok(header) => header,
            Err(e) => {
                ctx.stats.malformed_frames += 1;
                warn!("청크 무시: {}", e);
                return Err(e);
            }
        };

        if let Err(e) = validate::check_header(ctx.config, &header) {
            ctx.stats.malformed_frames += 1;
            warn!("청크 거부: {}", e);
            ctx.send_ack(chunk_error(&header));

            if self.session.as_ref().map_or(false, |s| !s.matches(&header)) {
                self.abort(FailureReason::ProtocolViolation, ctx);
            }
            return Err(e);
        }

        let in_session = self.session.as_ref().map(|s| s.matches(&header));
        if in_session != Some(true) && self.is_recently_completed(&header, now) {
            ctx.stats.duplicate_chunks += 1;
            debug!("완료된 전송의 청크 {} 재수신, 성공 응답 재전송", header.chunk_num);
            let ack = |ack_type, chunk_number| {
                AckMessage::new(
                    ack_type,
                    chunk_number,
                    header.total_chunks as u32,
                    header.global_crc32,
                )
            };
            if ctx.config.per_chunk_ack {
                ctx.send_ack(ack(AckType::ChunkReceived, header.chunk_num as u32));
            }
            ctx.send_ack(ack(AckType::TransferSuccess, 0));
            return Ok(ChunkOutcome::Duplicate {
                chunk_num: header.chunk_num,
            });
        }

        match in_session {
            Some(true) => {}
            Some(false) if header.chunk_num == 1 => {
                // 새 전송의 청크가 검증과 할당을 통과한 뒤에만 기존 세션을 버린다
                let fresh = Self::prepare(&header, now, ctx)?;
                let data = &frame[CHUNK_HEADER_SIZE..];
                check_integrity(&header, data, fresh.reassembly.total_size(), ctx)?;
                warn!(
                    "새 전송 시작으로 진행 중인 수신 대체 (global CRC {:08X})",
                    header.global_crc32
                );
                self.abort(FailureReason::Superseded, ctx);
                self.open(fresh)?;
            }
            Some(false) => {
                warn!(
                    "청크 {}의 전송 파라미터가 진행 중인 세션과 다름, 세션 취소",
                    header.chunk_num
                );
                ctx.send_ack(chunk_error(&header));
                self.abort(FailureReason::ProtocolViolation, ctx);
                return Err(Error::ProtocolViolation(format!(
                    "청크 {}가 다른 전송에 속함",
                    header.chunk_num
                )));
            }
            None => {
                let fresh = Self::prepare(&header, now, ctx)?;
                self.open(fresh)?;
            }
        }

        self.accept(&header, &frame[CHUNK_HEADER_SIZE..], now, ctx)
    }

    fn is_recently_completed(&self, header: &ChunkHeader, now: Instant) -> bool {
        self.completed
            .as_ref()
            .map_or(false, |c| now < c.expires && c.transfer.same_transfer(header))
    }

    /// 새 수신 세션 준비 (한도 검증 이후에만 할당)
    ///
    /// 기존 세션과 수신 상태는 건드리지 않는다. 거부되면 CHUNK_ERROR만 보낸다.
    fn prepare(header: &ChunkHeader, now: Instant, ctx: &mut Context<'_>) -> Result<ReceiveSession> {
        let total_chunks = match validate::check_transfer_geometry(ctx.config, header) {
            Ok(chunks) => chunks,
            Err(e) => {
                ctx.stats.security_rejections += 1;
                warn!("수신 세션 거부: {}", e);
                ctx.send_ack(chunk_error(header));
                return Err(e);
            }
        };

        let total_size = header.total_data_size as usize;
        let reassembly =
            match Reassembly::new(total_size, total_chunks, ctx.config.chunk_payload_size) {
                Ok(reassembly) => reassembly,
                Err(e) => {
                    warn!("수신 버퍼 할당 실패: {}", e);
                    ctx.send_ack(chunk_error(header));
                    return Err(e);
                }
            };

        Ok(ReceiveSession {
            transfer: *header,
            reassembly,
            started_at: now,
            deadline: now + ctx.config.chunk_timeout(),
        })
    }

    /// 준비된 세션을 활성화
    fn open(&mut self, session: ReceiveSession) -> Result<()> {
        self.state.transition(TransferState::Receiving)?;
        self.completed = None;

        info!(
            "수신 세션 시작: {} bytes, {} 청크, global CRC {:08X}",
            session.transfer.total_data_size,
            session.transfer.total_chunks,
            session.transfer.global_crc32
        );
        self.session = Some(session);
        Ok(())
    }

    /// 세션에 속한 청크 검증 및 저장
    fn accept(
        &mut self,
        header: &ChunkHeader,
        data: &[u8],
        now: Instant,
        ctx: &mut Context<'_>,
    ) -> Result<ChunkOutcome> {
        let per_chunk_ack = ctx.config.per_chunk_ack;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::ProtocolViolation("활성 수신 세션 없음".into()))?;

        let chunk_num = header.chunk_num;
        check_integrity(header, data, session.reassembly.total_size(), ctx)?;

        session.deadline = now + ctx.config.chunk_timeout();

        if session.reassembly.insert(chunk_num, data)? == Insert::Duplicate {
            ctx.stats.duplicate_chunks += 1;
            debug!("중복 청크 {} 무시", chunk_num);
            if per_chunk_ack {
                ctx.send_ack(session.ack(AckType::ChunkReceived, chunk_num as u32));
            }
            return Ok(ChunkOutcome::Duplicate { chunk_num });
        }

        ctx.stats.chunks_received += 1;
        ctx.stats.bytes_received += data.len() as u64;
        if per_chunk_ack {
            ctx.send_ack(session.ack(AckType::ChunkReceived, chunk_num as u32));
        }

        let received = session.reassembly.received_count();
        let total = session.reassembly.total_chunks();
        debug!("청크 {} 저장: {}/{}", chunk_num, received, total);

        if session.reassembly.is_complete() {
            return self.complete(now, ctx);
        }

        ctx.events.progress(received, total, Direction::Receiving);
        Ok(ChunkOutcome::Stored {
            chunk_num,
            received,
            total,
        })
    }

    /// 모든 청크 수신 후 전체 CRC 검증
    fn complete(&mut self, now: Instant, ctx: &mut Context<'_>) -> Result<ChunkOutcome> {
        let session = self
            .session
            .take()
            .ok_or_else(|| Error::ProtocolViolation("활성 수신 세션 없음".into()))?;

        // 조립 완료 알림은 검증 결과와 무관하게 먼저 보낸다
        ctx.send_ack(session.ack(AckType::TransferComplete, 0));

        let expected = session.transfer.global_crc32;
        let actual = session.reassembly.crc32();
        let total = session.reassembly.total_chunks();
        let elapsed = now.duration_since(session.started_at);

        if actual != expected {
            ctx.send_ack(session.ack(AckType::TransferFailed, 0));
            ctx.stats.crc_errors += 1;
            ctx.stats.record_transfer_failed();
            self.state.finish(TransferState::Failed)?;
            warn!(
                "전체 CRC 불일치: expected {:08X}, calculated {:08X}",
                expected, actual
            );
            ctx.events
                .failed(Direction::Receiving, FailureReason::GlobalIntegrity);
            return Err(Error::GlobalCrcMismatch {
                expected,
                got: actual,
            });
        }

        ctx.send_ack(session.ack(AckType::TransferSuccess, 0));
        ctx.events.progress(total, total, Direction::Receiving);
        ctx.stats.record_transfer_completed(now, elapsed);
        self.state.finish(TransferState::Complete)?;
        self.completed = Some(CompletedTransfer {
            transfer: session.transfer,
            expires: now + ctx.config.ack_timeout() * (u32::from(ctx.config.max_retries) + 1),
        });

        let data = session.reassembly.into_data();
        let bytes = data.len();
        info!(
            "수신 완료: {} bytes, {} 청크, {:.2}ms",
            bytes,
            total,
            elapsed.as_secs_f64() * 1000.0
        );
        ctx.events.emit(Event::DataReceived(data));

        Ok(ChunkOutcome::Completed { bytes })
    }

    /// 청크 타임아웃 검사
    pub(crate) fn check_timeout(&mut self, now: Instant, ctx: &mut Context<'_>) {
        if self.completed.as_ref().map_or(false, |c| now >= c.expires) {
            self.completed = None;
        }

        let expired = match self.session.as_ref() {
            Some(session) if now >= session.deadline => session,
            _ => return,
        };

        warn!(
            "청크 타임아웃: {:.1}% 수신 ({}/{})",
            expired.reassembly.receive_ratio() * 100.0,
            expired.reassembly.received_count(),
            expired.reassembly.total_chunks()
        );
        ctx.stats.timeouts += 1;
        self.abort(FailureReason::Timeout, ctx);
    }

    /// 세션 해제 (버퍼는 여기서만 버려진다)
    ///
    /// 연결 끊김이 아니면 상대에게 TRANSFER_FAILED를 알린다.
    pub(crate) fn abort(&mut self, reason: FailureReason, ctx: &mut Context<'_>) {
        let Some(session) = self.session.take() else {
            return;
        };

        if reason == FailureReason::ConnectionLost {
            self.state.reset();
        } else {
            ctx.send_ack(session.ack(AckType::TransferFailed, 0));
            if let Err(e) = self.state.finish(TransferState::Failed) {
                warn!("{}", e);
                self.state.reset();
            }
        }

        info!(
            "수신 세션 해제 ({:?}): {}/{} 청크 수신 상태",
            reason,
            session.reassembly.received_count(),
            session.reassembly.total_chunks()
        );
        ctx.stats.record_transfer_failed();
        ctx.events.failed(Direction::Receiving, reason);
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunker;
    use crate::event::{EventReceiver, EventSink};
    use crate::stats::TransferStats;
    use crate::transport::{MemoryTransport, Wire};
    use crate::Config;
    use bytes::Bytes;
    use std::time::Duration;

    struct Harness {
        config: Config,
        transport: MemoryTransport,
        wire: Wire,
        stats: TransferStats,
        events: EventSink,
        _event_rx: EventReceiver,
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
                _event_rx: event_rx,
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

        fn ack_types(&mut self) -> Vec<AckType> {
            self.wire
                .drain_control()
                .iter()
                .map(|frame| AckMessage::from_bytes(frame).unwrap().ack_type)
                .collect()
        }
    }

    fn frames(len: usize) -> Vec<Vec<u8>> {
        let payload = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>());
        Chunker::new(168)
            .split(&payload)
            .iter()
            .map(|chunk| chunk.to_bytes())
            .collect()
    }

    #[test]
    fn test_state_follows_session() {
        let mut h = Harness::new(Config::default());
        let mut receiver = Receiver::new();
        let frames = frames(200);
        let now = Instant::now();

        assert_eq!(receiver.state(), TransferState::Idle);
        receiver.handle_chunk(&frames[0], now, &mut h.ctx()).unwrap();
        assert_eq!(receiver.state(), TransferState::Receiving);
        assert_eq!(receiver.progress(), Some((1, 2)));
        assert_eq!(receiver.bytes_stored(), Some(168));

        receiver.handle_chunk(&frames[1], now, &mut h.ctx()).unwrap();
        assert_eq!(receiver.state(), TransferState::Idle);
        assert_eq!(receiver.last_outcome(), Some(TransferState::Complete));
        assert!(receiver.progress().is_none());
    }

    #[test]
    fn test_completed_transfer_answers_retransmits_until_expiry() {
        let mut h = Harness::new(Config::default());
        let mut receiver = Receiver::new();
        let frames = frames(200);
        let now = Instant::now();

        for frame in &frames {
            receiver.handle_chunk(frame, now, &mut h.ctx()).unwrap();
        }
        h.wire.drain_control();

        // 재전송된 마지막 청크는 새 세션을 열지 않는다
        let outcome = receiver.handle_chunk(&frames[1], now, &mut h.ctx()).unwrap();
        assert_eq!(outcome, ChunkOutcome::Duplicate { chunk_num: 2 });
        assert!(!receiver.is_active());
        assert_eq!(
            h.ack_types(),
            vec![AckType::ChunkReceived, AckType::TransferSuccess]
        );

        let later = now + Duration::from_secs(60);
        receiver.check_timeout(later, &mut h.ctx());
        let outcome = receiver.handle_chunk(&frames[1], later, &mut h.ctx()).unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::Stored {
                chunk_num: 2,
                received: 1,
                total: 2
            }
        );
        assert!(receiver.is_active());
    }

    #[test]
    fn test_unacknowledged_mode_sends_only_results() {
        let mut h = Harness::new(Config::unacknowledged());
        let mut receiver = Receiver::new();
        let now = Instant::now();

        for frame in &frames(400) {
            receiver.handle_chunk(frame, now, &mut h.ctx()).unwrap();
        }

        assert_eq!(
            h.ack_types(),
            vec![AckType::TransferComplete, AckType::TransferSuccess]
        );
        assert_eq!(h.stats.chunks_received, 3);
    }

    #[test]
    fn test_short_frame_gets_no_reply() {
        let mut h = Harness::new(Config::default());
        let mut receiver = Receiver::new();

        assert!(matches!(
            receiver.handle_chunk(&[1, 2, 3], Instant::now(), &mut h.ctx()),
            Err(Error::Truncated { got: 3, .. })
        ));
        assert!(h.ack_types().is_empty());
        assert_eq!(h.stats.malformed_frames, 1);
    }

    #[test]
    fn test_completion_time_follows_injected_clock() {
        let mut h = Harness::new(Config::default());
        let mut receiver = Receiver::new();
        let frames = frames(200);
        let start = Instant::now();
        let finish = start + Duration::from_secs(3);

        receiver.handle_chunk(&frames[0], start, &mut h.ctx()).unwrap();
        receiver.handle_chunk(&frames[1], finish, &mut h.ctx()).unwrap();

        assert_eq!(h.stats.last_transfer_time, Some(finish));
        assert_eq!(h.stats.last_transfer_duration, Some(Duration::from_secs(3)));
    }
}
