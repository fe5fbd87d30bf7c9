//! UDP 데이터그램 위의 전송 계층
//!
//! BLE 스택 없이 두 프로세스 사이에서 프로토콜을 돌려보기 위한 것.
//! 데이터그램 첫 바이트가 경로(페이로드/컨트롤)를 구분한다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::link::Link;
use crate::transport::Transport;
use crate::{Error, Result};

/// 상대에게 주소만 알리는 데이터그램
const HELLO_TAG: u8 = 0x00;
const PAYLOAD_TAG: u8 = 0x01;
const CONTROL_TAG: u8 = 0x02;

/// UDP 전송 계층
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: RwLock<Option<SocketAddr>>,
    mtu: usize,
}

impl UdpTransport {
    /// 소켓 바인딩
    pub async fn bind(addr: SocketAddr, mtu: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(Arc::new(socket), mtu))
    }

    pub fn new(socket: Arc<UdpSocket>, mtu: usize) -> Self {
        Self {
            socket,
            peer: RwLock::new(None),
            mtu,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.write() = Some(addr);
    }

    /// 상대에게 이쪽 주소를 알림
    pub async fn hello(&self) -> Result<()> {
        let peer = self.peer().ok_or(Error::NotConnected)?;
        self.socket.send_to(&[HELLO_TAG], peer).await?;
        Ok(())
    }

    fn send_tagged(&self, tag: u8, frame: &[u8]) -> Result<()> {
        if frame.len() > self.mtu {
            return Err(Error::FrameTooLarge {
                len: frame.len(),
                mtu: self.mtu,
            });
        }

        let peer = self.peer().ok_or(Error::NotConnected)?;
        let mut datagram = Vec::with_capacity(frame.len() + 1);
        datagram.push(tag);
        datagram.extend_from_slice(frame);

        self.socket.try_send_to(&datagram, peer)?;
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send_payload(&self, frame: &[u8]) -> Result<()> {
        self.send_tagged(PAYLOAD_TAG, frame)
    }

    fn send_control(&self, frame: &[u8]) -> Result<()> {
        self.send_tagged(CONTROL_TAG, frame)
    }

    fn max_payload_size(&self) -> usize {
        self.mtu
    }
}

/// 소켓에서 받은 데이터그램을 링크로 전달하는 태스크
///
/// 처음 보는 주소에서 데이터그램이 오면 그 주소를 상대로 삼고 연결을 알린다.
/// 이미 상대가 있었다면 먼저 연결 끊김을 알려 진행 중인 세션을 해제한다.
pub fn run_udp_bridge(transport: Arc<UdpTransport>, link: Link) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];

        while link.is_running() {
            let (len, addr) = match tokio::time::timeout(
                Duration::from_millis(100),
                transport.socket.recv_from(&mut buf),
            )
            .await
            {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    warn!("수신 에러: {}", e);
                    continue;
                }
                Err(_) => continue,
            };

            let current = transport.peer();
            if current != Some(addr) {
                // 이전 상대의 세션은 연결 끊김으로 정리한 뒤 교체한다
                if let Some(previous) = current {
                    info!("상대 변경: {} -> {}", previous, addr);
                    if link.on_connection_changed(false).await.is_err() {
                        break;
                    }
                } else {
                    info!("상대 연결: {}", addr);
                }

                transport.set_peer(addr);
                if link.on_connection_changed(true).await.is_err() {
                    break;
                }
            }

            if len == 0 {
                continue;
            }

            let frame = Bytes::copy_from_slice(&buf[1..len]);
            let delivered = match buf[0] {
                HELLO_TAG => Ok(()),
                PAYLOAD_TAG => link.on_payload_write(frame).await,
                CONTROL_TAG => link.on_control_write(frame).await,
                other => {
                    warn!("알 수 없는 데이터그램 태그: 0x{:02X}", other);
                    Ok(())
                }
            };

            if delivered.is_err() {
                break;
            }
        }
    })
}
