//! # netsend
//!
//! 프로토콜 교차 파일 전송 및 네트워크 진단 엔진
//!
//! ## 핵심 특징
//! - **전송 선택**: TCP, UDP, UDP-Lite, SCTP, DCCP, TIPC 를 하나의 연결 루틴으로 처리
//! - **I/O 방식**: read/write, mmap, sendfile, splice 중 하나를 선택
//! - **소켓 옵션 레지스트리**: 요청된 setsockopt 만 선언 순서대로 적용
//! - **RTT 프로브**: 편차 필터로 이상치를 버리고 최소 RTT 를 보고
//! - **통계**: 바이트/비트, 2진/SI 접두어 처리량 보고

pub mod config;
pub mod congestion;
pub mod error;
pub mod fabric;
pub mod receiver;
pub mod resolve;
pub mod rtt;
pub mod sched;
pub mod sender;
pub mod session;
pub mod sockopt;
pub mod stats;
pub mod strategy;
pub mod transport;

pub use config::{
    AddressFamily, IoStrategy, MemAdvice, ReportConfig, RttProbeSpec, TransferConfig, Transport,
    WorkMode,
};
pub use congestion::CongestionAlgorithm;
pub use error::{Error, ExitClass, Result};
pub use receiver::Receiver;
pub use rtt::RttEstimate;
pub use sender::Sender;
pub use session::SessionHeader;
pub use sockopt::SocketOptionRegistry;
pub use stats::TransferStats;
pub use strategy::{Strategy, TransferStrategy};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 포트
pub const DEFAULT_PORT: &str = "6666";

/// read/write 방식 기본 버퍼 크기 (바이트)
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// 매직 넘버 (세션 헤더 식별용)
pub const MAGIC_NUMBER: u32 = 0x4e534e44; // "NSND"
