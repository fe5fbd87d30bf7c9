//! 프로토콜 엔진
//!
//! 연결 하나당 하나. 모든 입력(프레임, 연결 변경, 송신 요청, tick)은
//! 이 구조체의 메서드 호출로 직렬화되며, 어떤 메서드도 블로킹하지 않는다.
//! 타임아웃은 deadline만 기록하고 `tick`에서 만료를 처리한다.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::event::{EventReceiver, EventSink, FailureReason, Event};
use crate::message::AckMessage;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::state::TransferState;
use crate::stats::TransferStats;
use crate::transport::Transport;
use crate::{crc, Config, Error, Result, ACK_MESSAGE_SIZE, CHUNK_HEADER_SIZE};

pub use crate::receiver::ChunkOutcome;

/// 송수신 세션이 공유하는 호출 단위 컨텍스트
pub(crate) struct Context<'a> {
    pub config: &'a Config,
    pub transport: &'a dyn Transport,
    pub stats: &'a mut TransferStats,
    pub events: &'a EventSink,
}

impl Context<'_> {
    /// 컨트롤 경로로 ACK 전송 (실패는 로그만)
    pub fn send_ack(&self, ack: AckMessage) {
        if let Err(e) = self.transport.send_control(&ack.to_bytes()) {
            warn!("{:?} 전송 실패: {}", ack.ack_type, e);
        }
    }
}

/// CBP 엔진
pub struct Engine<T: Transport> {
    config: Config,
    transport: T,
    receiver: Receiver,
    sender: Sender,
    stats: TransferStats,
    events: EventSink,
    connected: bool,
}

impl<T: Transport> Engine<T> {
    /// 새 엔진 생성
    ///
    /// 설정이 잘못되었거나 청크 프레임이 전송 계층 MTU를 넘으면 실패한다.
    pub fn new(config: Config, transport: T) -> Result<(Self, EventReceiver)> {
        config.validate()?;

        let max_frame = transport.max_payload_size();
        if CHUNK_HEADER_SIZE + config.chunk_payload_size > max_frame {
            return Err(Error::InvalidConfig(format!(
                "청크 프레임 {} bytes가 MTU {} bytes 초과",
                CHUNK_HEADER_SIZE + config.chunk_payload_size,
                max_frame
            )));
        }
        if ACK_MESSAGE_SIZE > max_frame {
            return Err(Error::InvalidConfig(format!(
                "ACK 메시지 {} bytes가 MTU {} bytes 초과",
                ACK_MESSAGE_SIZE, max_frame
            )));
        }

        crc::init();
        let (events, event_rx) = EventSink::channel();

        info!(
            "CBP 엔진 초기화: MTU {}, 청크 {} bytes, 최대 {} bytes / {} 청크, 청크별 ACK {}",
            max_frame,
            config.chunk_payload_size,
            config.max_total_data_size,
            config.max_chunks_per_transfer,
            config.per_chunk_ack
        );

        let engine = Self {
            config,
            transport,
            receiver: Receiver::new(),
            sender: Sender::new(),
            stats: TransferStats::new(),
            events,
            connected: false,
        };

        Ok((engine, event_rx))
    }

    /// 페이로드 경로 쓰기 (상대가 보낸 청크)
    pub fn on_payload_write(&mut self, frame: &[u8], now: Instant) -> Result<ChunkOutcome> {
        let mut ctx = Context {
            config: &self.config,
            transport: &self.transport,
            stats: &mut self.stats,
            events: &self.events,
        };
        self.receiver.handle_chunk(frame, now, &mut ctx)
    }

    /// 컨트롤 경로 쓰기 (상대가 보낸 ACK)
    pub fn on_control_write(&mut self, frame: &[u8], now: Instant) -> Result<()> {
        let ack = match AckMessage::from_bytes(frame) {
            Ok(ack) => ack,
            Err(e) => {
                self.stats.malformed_frames += 1;
                warn!("ACK 무시: {}", e);
                return Err(e);
            }
        };

        let mut ctx = Context {
            config: &self.config,
            transport: &self.transport,
            stats: &mut self.stats,
            events: &self.events,
        };
        self.sender.handle_ack(&ack, now, &mut ctx)
    }

    /// 연결 상태 변경
    ///
    /// 끊기면 송수신 세션을 모두 해제하고 곧바로 IDLE로 돌아간다.
    pub fn on_connection_changed(&mut self, connected: bool) {
        if connected {
            info!("연결됨");
        } else {
            info!("연결 끊김");
            let mut ctx = Context {
                config: &self.config,
                transport: &self.transport,
                stats: &mut self.stats,
                events: &self.events,
            };
            self.receiver.abort(FailureReason::ConnectionLost, &mut ctx);
            self.sender.fail(FailureReason::ConnectionLost, &mut ctx);
        }

        self.connected = connected;
        self.events.emit(Event::ConnectionChanged(connected));
    }

    /// 페이로드 송신 시작
    ///
    /// 첫 청크만 보내고 바로 반환한다. 결과는 이벤트로 전달된다.
    pub fn send_data(&mut self, payload: Bytes, now: Instant) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let mut ctx = Context {
            config: &self.config,
            transport: &self.transport,
            stats: &mut self.stats,
            events: &self.events,
        };
        self.sender.start(payload, now, &mut ctx)
    }

    /// 만료된 deadline 처리
    pub fn tick(&mut self, now: Instant) {
        let mut ctx = Context {
            config: &self.config,
            transport: &self.transport,
            stats: &mut self.stats,
            events: &self.events,
        };
        self.receiver.check_timeout(now, &mut ctx);
        self.sender.check_timeout(now, &mut ctx);
    }

    /// 진행 중인 송수신 취소
    ///
    /// 해제된 세션이 있었으면 true
    pub fn cancel_current_transfer(&mut self, reason: &str) -> bool {
        let active = self.is_transfer_in_progress();
        if !active {
            debug!("취소할 전송 없음");
            return false;
        }

        info!("전송 취소: {}", reason);
        let mut ctx = Context {
            config: &self.config,
            transport: &self.transport,
            stats: &mut self.stats,
            events: &self.events,
        };
        self.receiver.abort(FailureReason::Cancelled, &mut ctx);
        self.sender.fail(FailureReason::Cancelled, &mut ctx);
        true
    }

    pub fn is_transfer_in_progress(&self) -> bool {
        self.receiver.is_active() || self.sender.is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn statistics(&self) -> &TransferStats {
        &self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    pub fn receive_state(&self) -> TransferState {
        self.receiver.state()
    }

    pub fn send_state(&self) -> TransferState {
        self.sender.state()
    }

    /// 수신 진행률 (수신 청크 수, 총 청크 수)
    pub fn receive_progress(&self) -> Option<(usize, usize)> {
        self.receiver.progress()
    }

    /// 송신 진행률 (확인된 청크 수, 총 청크 수)
    pub fn send_progress(&self) -> Option<(usize, usize)> {
        self.sender.progress()
    }

    /// 마지막 수신/송신 세션 결과
    pub fn last_outcomes(&self) -> (Option<TransferState>, Option<TransferState>) {
        (self.receiver.last_outcome(), self.sender.last_outcome())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunker;
    use crate::message::AckType;
    use crate::transport::{MemoryTransport, Wire};
    use std::time::Duration;

    fn engine(config: Config) -> (Engine<MemoryTransport>, Wire, EventReceiver) {
        let (transport, wire) = MemoryTransport::new(crate::DEFAULT_MTU_SIZE);
        let (mut engine, events) = Engine::new(config, transport).unwrap();
        engine.on_connection_changed(true);
        (engine, wire, events)
    }

    fn acks(wire: &mut Wire) -> Vec<AckMessage> {
        wire.drain_control()
            .iter()
            .map(|frame| AckMessage::from_bytes(frame).unwrap())
            .collect()
    }

    #[test]
    fn test_rejects_chunk_larger_than_mtu() {
        let (transport, _wire) = MemoryTransport::new(100);
        assert!(matches!(
            Engine::new(Config::default(), transport),
            Err(Error::InvalidConfig(_))
        ));

        let (transport, _wire) = MemoryTransport::new(100);
        assert!(Engine::new(Config::for_mtu(100), transport).is_ok());
    }

    #[test]
    fn test_send_requires_connection() {
        let (transport, _wire) = MemoryTransport::new(crate::DEFAULT_MTU_SIZE);
        let (mut engine, _events) = Engine::new(Config::default(), transport).unwrap();

        assert!(matches!(
            engine.send_data(Bytes::from_static(b"hello"), Instant::now()),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_single_chunk_receive_acks() {
        let (mut engine, mut wire, _events) = engine(Config::default());
        let payload = Bytes::from_static(b"single chunk payload");
        let chunk = Chunker::new(168).split(&payload).remove(0);

        let outcome = engine
            .on_payload_write(&chunk.to_bytes(), Instant::now())
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Completed { bytes: payload.len() });

        let types: Vec<_> = acks(&mut wire).iter().map(|a| a.ack_type).collect();
        assert_eq!(
            types,
            vec![
                AckType::ChunkReceived,
                AckType::TransferComplete,
                AckType::TransferSuccess
            ]
        );
        assert_eq!(engine.receive_state(), TransferState::Idle);
        assert_eq!(engine.statistics().transfers_completed, 1);
    }

    #[test]
    fn test_stop_and_wait_sends_one_chunk_at_a_time() {
        let (mut engine, mut wire, _events) = engine(Config::default());
        let payload = Bytes::from(vec![0x5Au8; 400]);
        let now = Instant::now();

        engine.send_data(payload.clone(), now).unwrap();
        assert_eq!(wire.drain_payload().len(), 1);
        assert_eq!(engine.send_state(), TransferState::AwaitingAck);

        // 두 번째 송신 요청은 거부
        assert!(matches!(
            engine.send_data(payload.clone(), now),
            Err(Error::TransferInProgress)
        ));

        let global = crc::compute(&payload);
        for chunk_number in 1..=3u32 {
            let ack = AckMessage::new(AckType::ChunkReceived, chunk_number, 3, global);
            engine.on_control_write(&ack.to_bytes(), now).unwrap();
            let expected = if chunk_number < 3 { 1 } else { 0 };
            assert_eq!(wire.drain_payload().len(), expected);
        }

        let success = AckMessage::new(AckType::TransferSuccess, 0, 3, global);
        engine.on_control_write(&success.to_bytes(), now).unwrap();
        assert!(!engine.is_transfer_in_progress());
        assert_eq!(engine.last_outcomes().1, Some(TransferState::Complete));
    }

    #[test]
    fn test_malformed_control_frame_counted() {
        let (mut engine, _wire, _events) = engine(Config::default());

        assert!(engine.on_control_write(&[0x01, 0x02], Instant::now()).is_err());
        assert!(engine.on_payload_write(&[0u8; 5], Instant::now()).is_err());
        assert_eq!(engine.statistics().malformed_frames, 2);
    }

    #[test]
    fn test_disconnect_releases_sessions() {
        let (mut engine, _wire, mut events) = engine(Config::default());
        let now = Instant::now();
        engine.send_data(Bytes::from(vec![1u8; 500]), now).unwrap();
        assert!(engine.is_transfer_in_progress());

        engine.on_connection_changed(false);
        assert!(!engine.is_transfer_in_progress());
        assert_eq!(engine.send_state(), TransferState::Idle);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let Event::TransferFailed { reason, .. } = event {
                assert_eq!(reason, FailureReason::ConnectionLost);
                saw_failure = true;
            }
        }
        assert!(saw_failure);

        // 끊긴 뒤 tick은 아무 일도 하지 않음
        engine.tick(now + Duration::from_secs(60));
        assert_eq!(engine.statistics().timeouts, 0);
    }

    #[test]
    fn test_cancel_current_transfer() {
        let (mut engine, _wire, _events) = engine(Config::default());
        assert!(!engine.cancel_current_transfer("nothing"));

        engine
            .send_data(Bytes::from(vec![1u8; 10]), Instant::now())
            .unwrap();
        assert!(engine.cancel_current_transfer("user request"));
        assert!(!engine.is_transfer_in_progress());
        assert_eq!(engine.statistics().transfers_failed, 1);
    }
}
