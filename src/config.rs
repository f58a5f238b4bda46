//! 전송 설정
//!
//! 커맨드라인에서 한 번 만들어진 뒤 참조로만 전달된다.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::congestion::CongestionAlgorithm;
use crate::fabric::FabricSocketType;
use crate::sockopt::SocketOptionRegistry;
use crate::{Error, Result, DEFAULT_PORT};

/// SOCK_DCCP (linux/net.h)
pub const SOCK_DCCP: libc::c_int = 6;
/// IPPROTO_DCCP (linux/in.h)
pub const IPPROTO_DCCP: libc::c_int = 33;
/// IPPROTO_UDPLITE (linux/in.h)
pub const IPPROTO_UDPLITE: libc::c_int = 136;

/// 전송 프로토콜
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    UdpLite,
    Sctp,
    Dccp,
    /// 비 IP 패브릭 전송 (TIPC)
    Fabric(FabricSocketType),
}

impl Transport {
    /// 프로토콜 이름
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::UdpLite => "udplite",
            Transport::Sctp => "sctp",
            Transport::Dccp => "dccp",
            Transport::Fabric(_) => "tipc",
        }
    }

    /// socket(2) 타입
    pub fn socktype(&self) -> libc::c_int {
        match self {
            Transport::Tcp | Transport::Sctp => libc::SOCK_STREAM,
            Transport::Udp | Transport::UdpLite => libc::SOCK_DGRAM,
            Transport::Dccp => SOCK_DCCP,
            Transport::Fabric(kind) => kind.raw(),
        }
    }

    /// socket(2) 프로토콜 번호
    pub fn protocol(&self) -> libc::c_int {
        match self {
            Transport::Tcp => libc::IPPROTO_TCP,
            Transport::Udp => libc::IPPROTO_UDP,
            Transport::UdpLite => IPPROTO_UDPLITE,
            Transport::Sctp => libc::IPPROTO_SCTP,
            Transport::Dccp => IPPROTO_DCCP,
            Transport::Fabric(_) => 0,
        }
    }

    /// 연결 개념이 없는 데이터그램 전송인지 (스트림 끝을 따로 알려야 함)
    pub fn is_connectionless(&self) -> bool {
        matches!(self, Transport::Udp | Transport::UdpLite)
    }

    /// 세션 헤더용 식별자
    pub fn wire_id(&self) -> u8 {
        match self {
            Transport::Tcp => 1,
            Transport::Udp => 2,
            Transport::UdpLite => 3,
            Transport::Sctp => 4,
            Transport::Dccp => 5,
            Transport::Fabric(_) => 6,
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    /// 대소문자 무시 정확 일치. `tipc` 는 스트림 소켓 타입으로 시작한다.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            "udplite" => Ok(Transport::UdpLite),
            "sctp" => Ok(Transport::Sctp),
            "dccp" => Ok(Transport::Dccp),
            "tipc" => Ok(Transport::Fabric(FabricSocketType::Stream)),
            _ => Err(Error::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 주소 패밀리 선호
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Unspecified,
    Inet,
    Inet6,
    Fabric,
}

impl AddressFamily {
    pub fn raw(&self) -> libc::c_int {
        match self {
            AddressFamily::Unspecified => libc::AF_UNSPEC,
            AddressFamily::Inet => libc::AF_INET,
            AddressFamily::Inet6 => libc::AF_INET6,
            AddressFamily::Fabric => crate::fabric::AF_TIPC,
        }
    }

    /// 사용자가 명시한 패밀리와 후보 패밀리가 충돌하는지
    pub fn conflicts_with(&self, candidate: AddressFamily) -> bool {
        *self != AddressFamily::Unspecified && *self != candidate
    }
}

/// I/O 전송 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStrategy {
    /// sendfile(2) 커널 복사
    #[default]
    Sendfile,
    /// mmap + 단일 write
    Mmap,
    /// read/write 버퍼 복사
    Rw,
    /// 수신 전용 read
    Read,
    /// 파이프 경유 splice(2)
    Splice,
}

impl IoStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            IoStrategy::Sendfile => "sendfile",
            IoStrategy::Mmap => "mmap",
            IoStrategy::Rw => "rw",
            IoStrategy::Read => "read",
            IoStrategy::Splice => "splice",
        }
    }
}

impl FromStr for IoStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sendfile" => Ok(IoStrategy::Sendfile),
            "mmap" => Ok(IoStrategy::Mmap),
            "rw" => Ok(IoStrategy::Rw),
            "read" => Ok(IoStrategy::Read),
            "splice" => Ok(IoStrategy::Splice),
            _ => Err(Error::InvalidConfig(format!("IO 함수 \"{}\" 은(는) 지원하지 않음", s))),
        }
    }
}

/// 메모리 접근 패턴 힌트
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAdvice {
    Normal,
    Sequential,
    Random,
    WillNeed,
    DontNeed,
    NoReuse,
}

impl FromStr for MemAdvice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(MemAdvice::Normal),
            "sequential" => Ok(MemAdvice::Sequential),
            "random" => Ok(MemAdvice::Random),
            "willneed" => Ok(MemAdvice::WillNeed),
            "dontneed" => Ok(MemAdvice::DontNeed),
            "noreuse" => Ok(MemAdvice::NoReuse),
            _ => Err(Error::InvalidConfig(format!("메모리 힌트 \"{}\" 은(는) 지원하지 않음", s))),
        }
    }
}

/// 동작 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkMode {
    #[default]
    Transmit,
    Receive,
}

/// 통계 단위
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatUnit {
    #[default]
    Byte,
    Bit,
}

/// 통계 접두어 체계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatPrefix {
    /// 2^10 단위 (KiB, MiB, ...)
    #[default]
    Binary,
    /// 10^3 단위 (KB, MB, ...)
    Si,
}

/// 통계 출력 설정
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportConfig {
    /// 사람이 읽는 통계 출력
    pub statistics: bool,
    /// 기계 파싱용 한 줄 출력
    pub machine: bool,
    pub unit: StatUnit,
    pub prefix: StatPrefix,
}

impl ReportConfig {
    pub fn enabled(&self) -> bool {
        self.statistics || self.machine
    }
}

/// RTT 프로브 최대 반복 횟수
pub const MAX_RTT_ITERATIONS: u32 = 100;

/// RTT 프로브 최대 페이로드 (바이트)
pub const MAX_RTT_DATA_SIZE: u32 = 1 << 20;

/// 기본 편차 필터 (퍼센트)
pub const DEFAULT_RTT_FILTER: u32 = 10;

/// RTT 프로브 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttProbeSpec {
    /// 반복 횟수 (1 ~ 100)
    pub iterations: u32,
    /// 프로브 페이로드 크기 (> 0)
    pub data_size: u32,
    /// 편차 필터 (0 ~ 50, 퍼센트)
    pub deviation_filter: u32,
    /// 강제 최소 RTT (밀리초, 0이면 측정값 사용)
    pub force_ms: u64,
}

impl Default for RttProbeSpec {
    fn default() -> Self {
        Self {
            iterations: 10,
            data_size: 500,
            deviation_filter: DEFAULT_RTT_FILTER,
            force_ms: 0,
        }
    }
}

impl RttProbeSpec {
    /// `10n,500d,10m,25f` 형식 파싱. 빠진 항목은 기본값.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidRttSpec {
            input: input.to_string(),
            reason,
        };

        let mut spec = Self::default();
        for token in input.split(',') {
            let token = token.trim();
            let split = token
                .find(|c: char| !(c.is_ascii_digit() || c == '-'))
                .ok_or_else(|| invalid(format!("{} 에 항목 문자가 없음", token)))?;
            let (number, what) = token.split_at(split);
            if what.len() != 1 {
                return Err(invalid(format!("항목은 쉼표로 구분해야 함: {}", token)));
            }
            let value: i64 = number
                .parse()
                .map_err(|_| invalid(format!("{} 은(는) 숫자가 아님", number)))?;

            match what {
                "n" => {
                    if !(1..=i64::from(MAX_RTT_ITERATIONS)).contains(&value) {
                        return Err(invalid(format!(
                            "반복 횟수 {} 범위 밖 (1 ~ {})",
                            value, MAX_RTT_ITERATIONS
                        )));
                    }
                    spec.iterations = value as u32;
                }
                "d" => {
                    if value <= 0 || value > i64::from(MAX_RTT_DATA_SIZE) {
                        return Err(invalid(format!(
                            "데이터 크기 {} 범위 밖 (1 ~ {})",
                            value, MAX_RTT_DATA_SIZE
                        )));
                    }
                    spec.data_size = value as u32;
                }
                "m" => {
                    if !(0..=50).contains(&value) {
                        return Err(invalid(format!("필터 배수 {} 범위 밖 (0 ~ 50)", value)));
                    }
                    spec.deviation_filter = value as u32;
                }
                "f" => {
                    if value < 0 {
                        return Err(invalid(format!("{}ms 은(는) 유효한 RTT 가 아님", value)));
                    }
                    spec.force_ms = value as u64;
                }
                other => {
                    return Err(invalid(format!("{} 항목은 지원하지 않음", other)));
                }
            }
        }

        Ok(spec)
    }
}

/// 전송 설정
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub mode: WorkMode,
    pub transport: Transport,
    pub family: AddressFamily,

    /// 송신: 대상 호스트, 수신: 멀티캐스트 그룹 (선택)
    pub host: Option<String>,

    /// 포트 (서비스 이름)
    pub service: String,

    /// 송신 입력 파일 (None 또는 "-" 이면 표준 입력)
    pub input: Option<PathBuf>,

    /// 수신 출력 파일 (None 이면 표준 출력)
    pub output: Option<PathBuf>,

    /// 수신 데이터를 표준 입력으로 받을 명령 (`sh -c`)
    pub exec: Option<String>,

    pub io: IoStrategy,

    /// 버퍼 크기 (0이면 방식별 기본값)
    pub buffer_size: usize,

    pub mem_advice: Option<MemAdvice>,

    /// TCP 혼잡 제어 알고리즘
    pub congestion: Option<CongestionAlgorithm>,

    /// UDP-Lite 체크섬 범위
    pub checksum_coverage: Option<u16>,

    pub socket_options: SocketOptionRegistry,

    pub rtt: Option<RttProbeSpec>,

    pub report: ReportConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: WorkMode::Transmit,
            transport: Transport::Tcp,
            family: AddressFamily::Unspecified,
            host: None,
            service: DEFAULT_PORT.to_string(),
            input: None,
            output: None,
            exec: None,
            io: IoStrategy::Sendfile,
            buffer_size: 0,
            mem_advice: None,
            congestion: None,
            checksum_coverage: None,
            socket_options: SocketOptionRegistry::default(),
            rtt: None,
            report: ReportConfig::default(),
        }
    }
}

impl TransferConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 로그용 대상 호스트 이름
    pub fn host_name(&self) -> &str {
        self.host.as_deref().unwrap_or("<any>")
    }

    /// 표준 입력을 읽어야 하는지
    pub fn reads_stdin(&self) -> bool {
        match &self.input {
            None => true,
            Some(path) => path.as_os_str() == "-",
        }
    }

    /// 모드 간 일관성 검사
    pub fn validate(&self) -> Result<()> {
        if self.mode == WorkMode::Transmit && self.host.is_none() {
            return Err(Error::InvalidConfig("송신 모드에는 호스트가 필요함".into()));
        }
        if self.exec.is_some() && self.mode == WorkMode::Transmit {
            return Err(Error::InvalidConfig("명령 실행은 수신 모드에서만 사용 가능".into()));
        }
        if self.checksum_coverage.is_some() && self.transport != Transport::UdpLite {
            return Err(Error::InvalidConfig(
                "체크섬 범위는 udplite 에서만 사용 가능".into(),
            ));
        }
        if self.congestion.is_some() && self.transport != Transport::Tcp {
            tracing::warn!(
                "congestion control only applies to tcp, ignored for {}",
                self.transport
            );
        }
        Ok(())
    }
}
