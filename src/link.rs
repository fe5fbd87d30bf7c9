//! 비동기 링크 드라이버
//!
//! 엔진은 하나의 태스크만 소유하고, 모든 입력은 명령 채널로 직렬화된다.
//! 별도 타이머 태스크가 주기적으로 Tick을 넣어 타임아웃을 처리한다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::event::EventReceiver;
use crate::stats::TransferStats;
use crate::transport::{Transport, Wire};
use crate::{Config, Error, Result};

/// 링크 명령
enum LinkCmd {
    Payload(Bytes),
    Control(Bytes),
    Connection(bool),
    Send(Bytes, oneshot::Sender<Result<()>>),
    Cancel(String, oneshot::Sender<bool>),
    Tick,
    ResetStats,
    Stop,
}

/// 엔진 태스크 핸들
///
/// 복제해서 여러 태스크(전송 계층 콜백, 애플리케이션)에서 사용할 수 있다.
#[derive(Clone)]
pub struct Link {
    cmd_tx: mpsc::Sender<LinkCmd>,
    stats: Arc<RwLock<TransferStats>>,
    in_progress: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl Link {
    /// 엔진 태스크와 타이머 태스크 시작
    pub fn start<T>(config: Config, transport: T) -> Result<(Self, EventReceiver)>
    where
        T: Transport + Send + 'static,
    {
        let tick_interval = config.tick_interval();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<LinkCmd>(config.command_buffer);
        let (mut engine, events) = Engine::new(config, transport)?;

        // 공유 상태
        let stats = Arc::new(RwLock::new(TransferStats::new()));
        let in_progress = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        // 타이머 태스크
        let cmd_tx_tick = cmd_tx.clone();
        let running_tick = running.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while running_tick.load(Ordering::SeqCst) {
                interval.tick().await;
                if cmd_tx_tick.send(LinkCmd::Tick).await.is_err() {
                    break;
                }
            }
        });

        // 메인 처리 태스크
        let stats_main = stats.clone();
        let in_progress_main = in_progress.clone();
        let connected_main = connected.clone();
        let running_main = running.clone();

        tokio::spawn(async move {
            let publish = |engine: &Engine<T>| {
                *stats_main.write() = engine.statistics().clone();
                in_progress_main.store(engine.is_transfer_in_progress(), Ordering::SeqCst);
                connected_main.store(engine.is_connected(), Ordering::SeqCst);
            };

            while let Some(cmd) = cmd_rx.recv().await {
                // tokio 시계를 따르므로 테스트에서 시간을 멈추고 진행시킬 수 있다
                let now = tokio::time::Instant::now().into_std();

                match cmd {
                    LinkCmd::Payload(frame) => {
                        if let Err(e) = engine.on_payload_write(&frame, now) {
                            debug!("청크 처리 결과: {}", e);
                        }
                    }
                    LinkCmd::Control(frame) => {
                        if let Err(e) = engine.on_control_write(&frame, now) {
                            debug!("ACK 처리 결과: {}", e);
                        }
                    }
                    LinkCmd::Connection(state) => engine.on_connection_changed(state),
                    LinkCmd::Send(payload, reply) => {
                        let result = engine.send_data(payload, now);
                        publish(&engine);
                        let _ = reply.send(result);
                    }
                    LinkCmd::Cancel(reason, reply) => {
                        let cancelled = engine.cancel_current_transfer(&reason);
                        publish(&engine);
                        let _ = reply.send(cancelled);
                    }
                    LinkCmd::Tick => engine.tick(now),
                    LinkCmd::ResetStats => engine.reset_statistics(),
                    LinkCmd::Stop => break,
                }

                publish(&engine);
            }

            running_main.store(false, Ordering::SeqCst);
            info!("링크 종료: {}", engine.statistics().summary());
        });

        let link = Self {
            cmd_tx,
            stats,
            in_progress,
            connected,
            running,
        };

        Ok((link, events))
    }

    async fn command(&self, cmd: LinkCmd) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::ChannelError)
    }

    /// 페이로드 경로로 받은 프레임 전달
    pub async fn on_payload_write(&self, frame: Bytes) -> Result<()> {
        self.command(LinkCmd::Payload(frame)).await
    }

    /// 컨트롤 경로로 받은 프레임 전달
    pub async fn on_control_write(&self, frame: Bytes) -> Result<()> {
        self.command(LinkCmd::Control(frame)).await
    }

    /// 연결 상태 변경 전달
    pub async fn on_connection_changed(&self, connected: bool) -> Result<()> {
        self.command(LinkCmd::Connection(connected)).await
    }

    /// 송신 시작 (첫 청크 전송까지만 기다림)
    pub async fn send_data(&self, payload: Bytes) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(LinkCmd::Send(payload, reply_tx)).await?;
        reply_rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 진행 중인 전송 취소, 해제된 세션이 있었으면 true
    pub async fn cancel_current_transfer(&self, reason: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command(LinkCmd::Cancel(reason.to_string(), reply_tx))
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// 통계 리셋
    pub async fn reset_statistics(&self) -> Result<()> {
        self.command(LinkCmd::ResetStats).await
    }

    /// 정지
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(LinkCmd::Stop).await;
    }

    /// 마지막으로 처리된 명령 기준 통계
    pub fn statistics(&self) -> TransferStats {
        self.stats.read().clone()
    }

    pub fn is_transfer_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 메모리 전송 계층의 출력을 상대 링크 입력으로 연결
///
/// 어느 한쪽 채널이 닫히거나 상대 링크가 멈추면 종료된다.
pub fn connect(wire: Wire, peer: Link) -> JoinHandle<()> {
    let Wire {
        mut payload,
        mut control,
    } = wire;

    tokio::spawn(async move {
        loop {
            let delivered = tokio::select! {
                Some(frame) = payload.recv() => peer.on_payload_write(frame).await,
                Some(frame) = control.recv() => peer.on_control_write(frame).await,
                else => break,
            };

            if delivered.is_err() {
                break;
            }
        }
    })
}
