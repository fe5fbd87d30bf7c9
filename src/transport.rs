//! 전송 계층 추상화
//!
//! 실제 BLE 스택(광고, 연결, MTU 협상, characteristic notify)은 외부에서 제공된다.
//! 엔진은 바이트 블롭을 보내는 두 경로와 MTU만 알면 된다.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result, CHUNK_HEADER_SIZE};

/// 엔진이 사용하는 전송 계층
///
/// 데이터 characteristic과 컨트롤 characteristic 하나씩으로 구성된다.
pub trait Transport {
    /// 페이로드 경로로 프레임 전송 (청크)
    fn send_payload(&self, frame: &[u8]) -> Result<()>;

    /// 컨트롤 경로로 프레임 전송 (ACK)
    fn send_control(&self, frame: &[u8]) -> Result<()>;

    /// 한 프레임의 최대 크기
    fn max_payload_size(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send_payload(&self, frame: &[u8]) -> Result<()> {
        (**self).send_payload(frame)
    }

    fn send_control(&self, frame: &[u8]) -> Result<()> {
        (**self).send_control(frame)
    }

    fn max_payload_size(&self) -> usize {
        (**self).max_payload_size()
    }
}

/// 링크 품질 시뮬레이션 조건
#[derive(Debug, Clone, Default)]
pub struct LinkConditions {
    /// 프레임 손실 확률 (0.0 ~ 1.0)
    pub drop_rate: f64,

    /// 페이로드 프레임의 데이터 바이트 하나를 뒤집을 확률
    pub corrupt_rate: f64,

    /// 프레임 중복 전달 확률
    pub duplicate_rate: f64,

    /// RNG 시드 (None이면 엔트로피 사용)
    pub seed: Option<u64>,
}

impl LinkConditions {
    /// 손실 없는 링크
    pub fn lossless() -> Self {
        Self::default()
    }

    /// 손실/손상/중복이 있는 링크
    pub fn lossy(drop_rate: f64, corrupt_rate: f64, duplicate_rate: f64, seed: u64) -> Self {
        Self {
            drop_rate,
            corrupt_rate,
            duplicate_rate,
            seed: Some(seed),
        }
    }
}

/// 메모리 전송 계층이 내보낸 프레임
///
/// 상대 엔진의 on_payload_write / on_control_write로 전달하면 된다.
pub struct Wire {
    pub payload: mpsc::UnboundedReceiver<Bytes>,
    pub control: mpsc::UnboundedReceiver<Bytes>,
}

impl Wire {
    /// 대기 중인 페이로드 프레임을 모두 꺼냄
    pub fn drain_payload(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.payload.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// 대기 중인 컨트롤 프레임을 모두 꺼냄
    pub fn drain_control(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.control.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// 프로세스 내 전송 계층 (테스트, 시뮬레이션용)
pub struct MemoryTransport {
    payload_tx: mpsc::UnboundedSender<Bytes>,
    control_tx: mpsc::UnboundedSender<Bytes>,
    mtu: usize,
    conditions: LinkConditions,
    rng: Mutex<StdRng>,
}

impl MemoryTransport {
    /// 손실 없는 메모리 전송 계층 생성
    pub fn new(mtu: usize) -> (Self, Wire) {
        Self::with_conditions(mtu, LinkConditions::lossless())
    }

    /// 링크 조건을 지정해 생성
    pub fn with_conditions(mtu: usize, conditions: LinkConditions) -> (Self, Wire) {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let rng = match conditions.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let transport = Self {
            payload_tx,
            control_tx,
            mtu,
            conditions,
            rng: Mutex::new(rng),
        };
        let wire = Wire {
            payload: payload_rx,
            control: control_rx,
        };

        (transport, wire)
    }

    fn deliver(
        &self,
        tx: &mpsc::UnboundedSender<Bytes>,
        frame: &[u8],
        corruptible: bool,
    ) -> Result<()> {
        if frame.len() > self.mtu {
            return Err(Error::FrameTooLarge {
                len: frame.len(),
                mtu: self.mtu,
            });
        }

        let mut rng = self.rng.lock();

        if self.conditions.drop_rate > 0.0 && rng.gen_bool(self.conditions.drop_rate) {
            debug!("시뮬레이션: 프레임 손실 ({} bytes)", frame.len());
            return Ok(());
        }

        let mut buf = frame.to_vec();
        if corruptible
            && buf.len() > CHUNK_HEADER_SIZE
            && self.conditions.corrupt_rate > 0.0
            && rng.gen_bool(self.conditions.corrupt_rate)
        {
            let index = rng.gen_range(CHUNK_HEADER_SIZE..buf.len());
            buf[index] ^= 0xFF;
            debug!("시뮬레이션: 프레임 손상 (byte {})", index);
        }

        let duplicate =
            self.conditions.duplicate_rate > 0.0 && rng.gen_bool(self.conditions.duplicate_rate);

        let frame = Bytes::from(buf);
        if duplicate {
            debug!("시뮬레이션: 프레임 중복");
            tx.send(frame.clone()).map_err(|_| Error::ChannelError)?;
        }
        tx.send(frame).map_err(|_| Error::ChannelError)
    }
}

impl Transport for MemoryTransport {
    fn send_payload(&self, frame: &[u8]) -> Result<()> {
        self.deliver(&self.payload_tx, frame, true)
    }

    fn send_control(&self, frame: &[u8]) -> Result<()> {
        self.deliver(&self.control_tx, frame, false)
    }

    fn max_payload_size(&self) -> usize {
        self.mtu
    }
}
