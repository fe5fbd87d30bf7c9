//! CBP Central - Chunked BLE Protocol 송신측
//!
//! 파일(또는 테스트 데이터)을 peripheral로 보내고 결과와 통계를 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin cbp-central -- [OPTIONS]
//!
//! 예시:
//!   # 파일 전송
//!   cargo run --release --bin cbp-central -- --peer 127.0.0.1:9100 --file config.json
//!
//!   # 20KB 테스트 데이터를 보내고 echo 검증
//!   cargo run --release --bin cbp-central -- --size 20000 --expect-echo

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cbp::udp::{run_udp_bridge, UdpTransport};
use cbp::{Config, Event, Link, DEFAULT_MTU_SIZE};

/// central 실행 옵션
struct CentralOptions {
    bind_addr: SocketAddr,
    peer_addr: SocketAddr,
    file_path: Option<PathBuf>,
    size: usize,
    mtu: usize,
    timeout: Duration,
    expect_echo: bool,
    per_chunk_ack: bool,
    unreliable: bool,
}

impl Default for CentralOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            file_path: None,
            size: 4096,
            mtu: DEFAULT_MTU_SIZE,
            timeout: Duration::from_secs(30),
            expect_echo: false,
            per_chunk_ack: true,
            unreliable: false,
        }
    }
}

impl CentralOptions {
    fn protocol_config(&self) -> Config {
        let base = if self.unreliable {
            Config::unreliable_link()
        } else {
            Config::default()
        };
        let sized = Config::for_mtu(self.mtu);

        Config {
            chunk_payload_size: sized.chunk_payload_size,
            max_chunks_per_transfer: sized.max_chunks_per_transfer,
            per_chunk_ack: self.per_chunk_ack,
            ..base
        }
    }
}

fn parse_args() -> CentralOptions {
    let args: Vec<String> = std::env::args().collect();
    let mut options = CentralOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    options.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    options.peer_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    options.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    options.size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    options.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--timeout" | "-t" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    options.timeout = Duration::from_secs(secs);
                    i += 1;
                }
            }
            "--expect-echo" => options.expect_echo = true,
            "--no-chunk-ack" => options.per_chunk_ack = false,
            "--unreliable" => options.unreliable = true,
            "--help" | "-h" => {
                println!(
                    r#"CBP Central - Chunked BLE Protocol 송신측

페이로드를 MTU 크기 청크로 나눠 하나씩 보내고 ACK를 기다린다
- 청크 CRC 실패 또는 ACK 타임아웃 시 재전송
- peripheral의 전체 CRC 검증 결과로 완료 판단

사용법:
  cargo run --release --bin cbp-central -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:0)
  -p, --peer <ADDR>       peripheral 주소 (기본: 127.0.0.1:9100)
  -f, --file <PATH>       전송할 파일 경로
  -s, --size <SIZE>       파일이 없을 때 테스트 데이터 크기 (기본: 4096)
  -t, --timeout <SECS>    전체 대기 시간 (기본: 30)
  --mtu <SIZE>            링크 MTU 바이트 (기본: 185)
  --expect-echo           peripheral의 echo를 기다려 원본과 비교
  --no-chunk-ack          청크별 ACK 없이 동작 (peripheral과 같아야 함)
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

    // 전송할 데이터 준비
    let data = if let Some(path) = &options.file_path {
        info!("Loading file: {:?}", path);
        std::fs::read(path)?
    } else {
        info!("Using test data ({} bytes)", options.size);
        (0..options.size).map(|i| (i % 251) as u8).collect()
    };
    let payload = Bytes::from(data);

    info!("CBP Central starting...");
    info!("Peer address: {}", options.peer_addr);
    info!("Data size: {} bytes", payload.len());
    info!(
        "Chunks: {} x {} bytes",
        config.chunks_for(payload.len()),
        config.chunk_payload_size
    );

    let transport = Arc::new(UdpTransport::bind(options.bind_addr, options.mtu).await?);
    transport.set_peer(options.peer_addr);
    transport.hello().await?;
    info!("Bound to local address: {}", transport.local_addr()?);

    let (link, mut events) = Link::start(config, transport.clone())?;
    let bridge = run_udp_bridge(transport.clone(), link.clone());
    link.on_connection_changed(true).await?;

    let start = Instant::now();
    link.send_data(payload.clone()).await?;

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    let mut delivered = false;
    let mut failure = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };

                match event {
                    Event::Progress { current, total, direction } if !direction.is_receiving() => {
                        if current == 1 || current == total || current % 50 == 0 {
                            info!("Sending: {}/{} chunks", current, total);
                        }
                    }
                    Event::SendCompleted { bytes } => {
                        let elapsed = start.elapsed();
                        info!("Transfer complete!");
                        info!("  Bytes: {}", bytes);
                        info!("  Time: {:.2}s", elapsed.as_secs_f64());
                        info!(
                            "  Throughput: {:.2} KB/s",
                            bytes as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1024.0
                        );
                        delivered = true;
                        if !options.expect_echo {
                            break;
                        }
                    }
                    Event::DataReceived(echo) => {
                        if echo == payload {
                            info!("Echo verified: {} bytes", echo.len());
                        } else {
                            failure = Some(format!(
                                "echo mismatch: sent {} bytes, got {} bytes",
                                payload.len(),
                                echo.len()
                            ));
                        }
                        break;
                    }
                    Event::TransferFailed { direction, reason } => {
                        warn!("{:?} transfer failed: {:?}", direction, reason);
                        failure = Some(format!("{:?} transfer failed: {:?}", direction, reason));
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut deadline => {
                failure = Some(format!("no result within {:?}", options.timeout));
                break;
            }
        }
    }

    info!("{}", link.statistics().summary());
    link.stop().await;
    let _ = bridge.await;

    match failure {
        Some(reason) => Err(reason.into()),
        None if delivered => Ok(()),
        None => Err("link closed before the transfer finished".into()),
    }
}
