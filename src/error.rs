//! 에러 타입 정의

use thiserror::Error;

/// 프로세스 종료 분류
///
/// 외부 도구가 "잘못된 인자", "상대방 도달 불가", "내부 버그"를 구분할 수 있도록
/// 에러마다 하나의 분류가 매핑된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// 메모리 할당 실패
    Memory,
    /// 옵션/사용법 에러
    Option,
    /// 기타 (파일 접근 등)
    Misc,
    /// 네트워크 에러
    Network,
    /// 내부 에러 (프로그래밍 오류)
    Internal,
}

impl ExitClass {
    /// 프로세스 종료 코드
    pub fn code(self) -> i32 {
        match self {
            ExitClass::Memory => 1,
            ExitClass::Option => 2,
            ExitClass::Misc => 3,
            ExitClass::Network => 4,
            ExitClass::Internal => 7,
        }
    }
}

/// netsend 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("지원하지 않는 프로토콜: \"{0}\"")]
    UnsupportedProtocol(String),

    #[error("지원하지 않는 소켓 옵션: \"{name}\" (지원: {known})")]
    UnknownSocketOption { name: String, known: String },

    #[error("소켓 옵션 {name} 값 \"{value}\" 은(는) 지원하지 않음")]
    InvalidOptionValue { name: String, value: String },

    #[error("혼잡 제어 알고리즘 \"{0}\" 은(는) 지원하지 않음")]
    UnknownCongestion(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("RTT 프로브 문자열 \"{input}\" 오류: {reason}")]
    InvalidRttSpec { input: String, reason: String },

    #[error("메모리 부족: {size} 바이트 할당 실패")]
    OutOfMemory { size: usize },

    #[error("입력 파일 {path} 접근 실패: {source}")]
    InputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("출력 파일 {path} 접근 실패: {source}")]
    OutputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("명령 \"{command}\" 실행 실패: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("주소 해석 실패 ({host}:{service}): {reason}")]
    Resolve {
        host: String,
        service: String,
        reason: String,
    },

    #[error("사용 가능한 소켓 없음: {host}")]
    NoSuitableSocket { host: String },

    #[error("{host} 연결 실패: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("소켓 옵션 {name} 설정 실패: {source}")]
    SocketOption {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{call} 실패: {source}")]
    KernelCopy {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("불완전 전송 ({call}): {moved} / {expected} 바이트")]
    ShortTransfer {
        call: &'static str,
        moved: u64,
        expected: u64,
    },

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("유효하지 않은 세션 헤더: {0}")]
    InvalidHeader(String),

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("내부 에러: {0}")]
    Internal(String),
}

impl Error {
    /// 종료 분류 반환
    pub fn exit_class(&self) -> ExitClass {
        match self {
            Error::UnsupportedProtocol(_)
            | Error::UnknownSocketOption { .. }
            | Error::InvalidOptionValue { .. }
            | Error::UnknownCongestion(_)
            | Error::InvalidConfig(_)
            | Error::InvalidRttSpec { .. } => ExitClass::Option,

            Error::OutOfMemory { .. } => ExitClass::Memory,

            Error::Io(_)
            | Error::InputFile { .. }
            | Error::OutputFile { .. }
            | Error::Exec { .. } => ExitClass::Misc,

            Error::Resolve { .. }
            | Error::NoSuitableSocket { .. }
            | Error::Connect { .. }
            | Error::SocketOption { .. }
            | Error::KernelCopy { .. }
            | Error::ShortTransfer { .. }
            | Error::InvalidMagicNumber { .. }
            | Error::InvalidVersion { .. }
            | Error::CrcMismatch { .. }
            | Error::InvalidHeader(_)
            | Error::ConnectionClosed => ExitClass::Network,

            Error::Serialization(_) | Error::Internal(_) => ExitClass::Internal,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
