//! CBP Peripheral - Chunked BLE Protocol 수신측
//!
//! UDP 데이터그램을 BLE 링크 대신 사용해 central이 보낸 페이로드를 받는다.
//!
//! 사용법:
//!   cargo run --release --bin cbp-peripheral -- [OPTIONS]
//!
//! 예시:
//!   # 받은 페이로드를 파일로 저장
//!   cargo run --release --bin cbp-peripheral -- --bind 0.0.0.0:9100 --output received.bin
//!
//!   # 받은 데이터를 그대로 돌려보냄
//!   cargo run --release --bin cbp-peripheral -- --echo

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cbp::udp::{run_udp_bridge, UdpTransport};
use cbp::{Config, Event, Link, DEFAULT_MTU_SIZE};

/// peripheral 실행 옵션
struct PeripheralOptions {
    bind_addr: SocketAddr,
    output_path: Option<PathBuf>,
    count: Option<usize>,
    echo: bool,
    mtu: usize,
    max_size: Option<usize>,
    per_chunk_ack: bool,
    unreliable: bool,
}

impl Default for PeripheralOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            output_path: None,
            count: None,
            echo: false,
            mtu: DEFAULT_MTU_SIZE,
            max_size: None,
            per_chunk_ack: true,
            unreliable: false,
        }
    }
}

impl PeripheralOptions {
    fn protocol_config(&self) -> Config {
        let base = if self.unreliable {
            Config::unreliable_link()
        } else {
            Config::default()
        };
        let sized = Config::for_mtu(self.mtu);

        let mut config = Config {
            chunk_payload_size: sized.chunk_payload_size,
            max_chunks_per_transfer: sized.max_chunks_per_transfer,
            per_chunk_ack: self.per_chunk_ack,
            ..base
        };
        if let Some(max_size) = self.max_size {
            config.max_total_data_size = max_size;
            config.max_chunks_per_transfer = config.chunks_for(max_size);
        }
        config
    }
}

fn parse_args() -> PeripheralOptions {
    let args: Vec<String> = std::env::args().collect();
    let mut options = PeripheralOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    options.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    options.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    options.count = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    options.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--max-size" => {
                if i + 1 < args.len() {
                    options.max_size = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--echo" | "-e" => options.echo = true,
            "--no-chunk-ack" => options.per_chunk_ack = false,
            "--unreliable" => options.unreliable = true,
            "--help" | "-h" => {
                println!(
                    r#"CBP Peripheral - Chunked BLE Protocol 수신측

청크 단위 CRC 검증 + ACK 기반 재전송으로 페이로드를 받는다
- 순서와 무관한 오프셋 기반 조립
- 전체 CRC 검증 후에만 전달

사용법:
  cargo run --release --bin cbp-peripheral -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9100)
  -o, --output <PATH>     받은 페이로드 저장 경로 (여러 개면 마지막 것)
  -n, --count <N>         N개 수신 후 종료
  -e, --echo              받은 페이로드를 central로 되돌려 보냄
  --mtu <SIZE>            링크 MTU 바이트 (기본: 185)
  --max-size <SIZE>       최대 전송 크기 바이트 (기본: 65536)
  --no-chunk-ack          청크별 ACK 없이 동작 (central과 같아야 함)
  --unreliable            손실 링크용 타임아웃/재시도 설정
  -h, --help              이 도움말 출력

환경 변수:
  RUST_LOG                로그 필터 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    options
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args();
    let config = options.protocol_config();

    info!("CBP Peripheral starting...");
    info!("MTU: {} bytes", options.mtu);
    info!("Chunk payload: {} bytes", config.chunk_payload_size);
    info!("Max transfer: {} bytes", config.max_total_data_size);
    info!("Per-chunk ACK: {}", config.per_chunk_ack);

    let transport = Arc::new(UdpTransport::bind(options.bind_addr, options.mtu).await?);
    info!("Listening on {}", transport.local_addr()?);

    let (link, mut events) = Link::start(config, transport.clone())?;
    let bridge = run_udp_bridge(transport.clone(), link.clone());

    info!("Waiting for central...");

    let mut received = 0usize;
    let done = |received: usize| options.count.map_or(false, |n| received >= n);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };

                match event {
                    Event::ConnectionChanged(connected) => {
                        info!("Connection: {}", if connected { "up" } else { "down" });
                    }
                    Event::Progress { current, total, direction } if direction.is_receiving() => {
                        if current == 1 || current == total || current % 50 == 0 {
                            info!("Receiving: {}/{} chunks", current, total);
                        }
                    }
                    Event::Progress { .. } => {}
                    Event::DataReceived(data) => {
                        received += 1;
                        info!("Payload #{} received: {} bytes", received, data.len());

                        if let Some(path) = &options.output_path {
                            std::fs::write(path, &data)?;
                            info!("Saved to {:?}", path);
                        }

                        if options.echo {
                            if let Err(e) = link.send_data(data).await {
                                warn!("Echo failed: {}", e);
                            }
                        } else if done(received) {
                            break;
                        }
                    }
                    Event::SendCompleted { bytes } => {
                        info!("Echo delivered: {} bytes", bytes);
                        if done(received) {
                            break;
                        }
                    }
                    Event::TransferFailed { direction, reason } => {
                        warn!("{:?} transfer failed: {:?}", direction, reason);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    info!("Payloads received: {}", received);
    info!("{}", link.statistics().summary());

    link.stop().await;
    let _ = bridge.await;
    Ok(())
}
