//! 애플리케이션 이벤트
//!
//! 엔진은 콜백을 직접 호출하지 않고 채널로 이벤트를 보낸다.
//! 콜백은 별도 태스크에서 실행되므로 엔진에 동기적으로 재진입할 수 없다.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 이벤트 채널 수신기 타입
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

impl Direction {
    pub fn is_receiving(self) -> bool {
        self == Direction::Receiving
    }
}

/// 세션 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// 청크/ACK 타임아웃
    Timeout,
    /// 재전송 횟수 초과
    RetriesExhausted,
    /// 전체 CRC 불일치 (로컬 검증 실패 또는 상대의 TRANSFER_FAILED)
    GlobalIntegrity,
    /// 전송 중 파라미터가 바뀜
    ProtocolViolation,
    /// 새 전송이 진행 중인 수신을 대체
    Superseded,
    /// 연결 끊김
    ConnectionLost,
    /// 명시적 취소
    Cancelled,
}

/// 엔진 -> 애플리케이션 이벤트
#[derive(Debug, Clone)]
pub enum Event {
    /// 전체 CRC 검증까지 끝난 수신 데이터
    DataReceived(Bytes),

    /// 연결 상태 변경
    ConnectionChanged(bool),

    /// 진행률 (청크 단위)
    Progress {
        current: usize,
        total: usize,
        direction: Direction,
    },

    /// 송신 완료 (상대가 TRANSFER_SUCCESS 응답)
    SendCompleted { bytes: usize },

    /// 세션 실패
    TransferFailed {
        direction: Direction,
        reason: FailureReason,
    },
}

/// 이벤트 송신측 (채널이 닫혀도 엔진은 계속 동작)
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn progress(&self, current: usize, total: usize, direction: Direction) {
        self.emit(Event::Progress {
            current,
            total,
            direction,
        });
    }

    pub(crate) fn failed(&self, direction: Direction, reason: FailureReason) {
        self.emit(Event::TransferFailed { direction, reason });
    }
}

type DataCallback = Box<dyn FnMut(Bytes) + Send>;
type ConnectionCallback = Box<dyn FnMut(bool) + Send>;
type ProgressCallback = Box<dyn FnMut(usize, usize, bool) + Send>;
type SendCompleteCallback = Box<dyn FnMut(usize) + Send>;
type FailureCallback = Box<dyn FnMut(Direction, FailureReason) + Send>;

/// 등록형 콜백 묶음
///
/// 이벤트 채널을 소비하는 태스크에서 호출된다.
#[derive(Default)]
pub struct Callbacks {
    on_data_received: Option<DataCallback>,
    on_connection_changed: Option<ConnectionCallback>,
    on_progress: Option<ProgressCallback>,
    on_send_complete: Option<SendCompleteCallback>,
    on_transfer_failed: Option<FailureCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 전체 데이터 수신 콜백
    pub fn on_data_received(mut self, f: impl FnMut(Bytes) + Send + 'static) -> Self {
        self.on_data_received = Some(Box::new(f));
        self
    }

    /// 연결 상태 콜백
    pub fn on_connection_changed(mut self, f: impl FnMut(bool) + Send + 'static) -> Self {
        self.on_connection_changed = Some(Box::new(f));
        self
    }

    /// 진행률 콜백: (current, total, is_receiving)
    pub fn on_progress(mut self, f: impl FnMut(usize, usize, bool) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_send_complete(mut self, f: impl FnMut(usize) + Send + 'static) -> Self {
        self.on_send_complete = Some(Box::new(f));
        self
    }

    pub fn on_transfer_failed(
        mut self,
        f: impl FnMut(Direction, FailureReason) + Send + 'static,
    ) -> Self {
        self.on_transfer_failed = Some(Box::new(f));
        self
    }

    /// 이벤트 하나를 해당 콜백으로 전달
    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::DataReceived(data) => {
                if let Some(f) = self.on_data_received.as_mut() {
                    f(data);
                }
            }
            Event::ConnectionChanged(connected) => {
                if let Some(f) = self.on_connection_changed.as_mut() {
                    f(connected);
                }
            }
            Event::Progress {
                current,
                total,
                direction,
            } => {
                if let Some(f) = self.on_progress.as_mut() {
                    f(current, total, direction.is_receiving());
                }
            }
            Event::SendCompleted { bytes } => {
                if let Some(f) = self.on_send_complete.as_mut() {
                    f(bytes);
                }
            }
            Event::TransferFailed { direction, reason } => {
                if let Some(f) = self.on_transfer_failed.as_mut() {
                    f(direction, reason);
                }
            }
        }
    }

    /// 이벤트 채널이 닫힐 때까지 콜백을 실행하는 태스크 생성
    pub fn spawn(mut self, mut events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.dispatch(event);
            }
        })
    }
}
