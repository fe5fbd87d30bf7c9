//! 방향별 전송 상태 머신
//!
//! IDLE -> ACTIVE (Receiving | Sending <-> AwaitingAck) -> (Complete | Failed) -> IDLE
//! 연결 끊김은 어떤 상태에서든 곧바로 IDLE로 되돌린다.

use tracing::debug;

use crate::event::Direction;
use crate::{Error, Result};

/// 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Receiving,
    Sending,
    AwaitingAck,
    Complete,
    Failed,
}

impl TransferState {
    /// 세션이 살아있는 상태인지 여부
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransferState::Receiving | TransferState::Sending | TransferState::AwaitingAck
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }

    /// 허용된 전이인지 확인
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        match (self, next) {
            (Idle, Receiving) | (Idle, Sending) => true,
            (Sending, AwaitingAck) | (AwaitingAck, Sending) => true,
            (Receiving, Complete) | (Receiving, Failed) => true,
            (Sending, Complete) | (Sending, Failed) => true,
            (AwaitingAck, Complete) | (AwaitingAck, Failed) => true,
            (Complete, Idle) | (Failed, Idle) => true,
            _ => false,
        }
    }
}

/// 한 방향의 상태 머신
#[derive(Debug, Clone)]
pub struct StateMachine {
    direction: Direction,
    state: TransferState,
    last_outcome: Option<TransferState>,
}

impl StateMachine {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: TransferState::Idle,
            last_outcome: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// 마지막으로 끝난 세션의 결과 (Complete 또는 Failed)
    pub fn last_outcome(&self) -> Option<TransferState> {
        self.last_outcome
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// 상태 전이
    pub fn transition(&mut self, next: TransferState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::ProtocolViolation(format!(
                "{:?} 상태 전이 불가: {:?} -> {:?}",
                self.direction, self.state, next
            )));
        }

        debug!("{:?} 상태: {:?} -> {:?}", self.direction, self.state, next);
        if next.is_terminal() {
            self.last_outcome = Some(next);
        }
        self.state = next;
        Ok(())
    }

    /// 활성 세션을 결과 상태를 거쳐 IDLE로 되돌림
    pub fn finish(&mut self, outcome: TransferState) -> Result<()> {
        self.transition(outcome)?;
        self.transition(TransferState::Idle)
    }

    /// 강제로 IDLE 복귀 (연결 끊김)
    pub fn reset(&mut self) {
        if self.state != TransferState::Idle {
            debug!("{:?} 상태 강제 초기화: {:?} -> Idle", self.direction, self.state);
        }
        self.state = TransferState::Idle;
    }
}
