//! 소켓 옵션 레지스트리
//!
//! 사용자가 고를 수 있는 setsockopt(2) 옵션의 고정 테이블.
//! 명시적으로 요청된 항목만 선언 순서대로 적용하고, 나머지는 OS 기본값을 유지한다.

use std::io;

use libc::c_int;
use tracing::{debug, warn};

use crate::congestion::CongestionAlgorithm;
use crate::config::IPPROTO_UDPLITE;
use crate::{Error, Result};

/// SCTP_DISABLE_FRAGMENTS (linux/sctp.h)
pub const SCTP_DISABLE_FRAGMENTS: c_int = 8;
/// UDPLITE_SEND_CSCOV (linux/udp.h)
pub const UDPLITE_SEND_CSCOV: c_int = 10;

/// 옵션 값 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// on/off, int 크기로 전달
    Bool,
    /// 정수, int 크기로 전달
    Int,
    /// 문자열 (예: 혼잡 제어 알고리즘 이름)
    Str,
    /// 밀리초, timeval 로 전달
    Millis,
}

/// 옵션 값
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i32),
    Str(String),
    Millis(u64),
}

impl OptionValue {
    fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Str(_) => OptionKind::Str,
            OptionValue::Millis(_) => OptionKind::Millis,
        }
    }
}

/// 옵션 하나의 서술자
#[derive(Debug, Clone)]
pub struct SocketOptionDescriptor {
    pub name: &'static str,
    pub level: c_int,
    pub code: c_int,
    pub kind: OptionKind,
    pub value: OptionValue,
    /// 사용자가 명시적으로 요청했는지
    pub requested: bool,
}

impl SocketOptionDescriptor {
    fn new(
        name: &'static str,
        level: c_int,
        code: c_int,
        kind: OptionKind,
        value: OptionValue,
    ) -> Self {
        Self {
            name,
            level,
            code,
            kind,
            value,
            requested: false,
        }
    }

    fn boolean(name: &'static str, level: c_int, code: c_int) -> Self {
        Self::new(name, level, code, OptionKind::Bool, OptionValue::Bool(false))
    }

    fn int(name: &'static str, level: c_int, code: c_int, value: i32) -> Self {
        Self::new(name, level, code, OptionKind::Int, OptionValue::Int(value))
    }

    fn millis(name: &'static str, level: c_int, code: c_int) -> Self {
        Self::new(name, level, code, OptionKind::Millis, OptionValue::Millis(0))
    }

    /// 문자열 값을 종류에 맞게 파싱
    fn parse_value(&self, raw: &str) -> Result<OptionValue> {
        let invalid = || Error::InvalidOptionValue {
            name: self.name.to_string(),
            value: raw.to_string(),
        };

        match self.kind {
            OptionKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "on" | "1" => Ok(OptionValue::Bool(true)),
                "off" | "0" => Ok(OptionValue::Bool(false)),
                _ => Err(invalid()),
            },
            OptionKind::Int => raw.trim().parse().map(OptionValue::Int).map_err(|_| invalid()),
            OptionKind::Millis => raw.trim().parse().map(OptionValue::Millis).map_err(|_| invalid()),
            OptionKind::Str => {
                if self.code == libc::TCP_CONGESTION && self.level == libc::SOL_TCP {
                    let algorithm = CongestionAlgorithm::select(raw)?;
                    Ok(OptionValue::Str(algorithm.name().to_string()))
                } else if raw.is_empty() {
                    Err(invalid())
                } else {
                    Ok(OptionValue::Str(raw.to_string()))
                }
            }
        }
    }
}

/// setsockopt(2) 를 받아주는 대상
///
/// 실제 소켓과 테스트용 목 소켓이 같은 적용 경로를 쓴다.
pub trait OptionSink {
    fn set_option(&self, level: c_int, code: c_int, value: &OptionValue) -> io::Result<()>;
}

/// 적용 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// 성공한 옵션 수
    pub applied: usize,
    /// 실패한 옵션 이름
    pub failed: Vec<&'static str>,
}

/// 소켓 옵션 레지스트리
#[derive(Debug, Clone)]
pub struct SocketOptionRegistry {
    entries: Vec<SocketOptionDescriptor>,
}

impl Default for SocketOptionRegistry {
    fn default() -> Self {
        use libc::{SOL_SOCKET, SOL_TCP};

        let entries = vec![
            SocketOptionDescriptor::boolean("SO_KEEPALIVE", SOL_SOCKET, libc::SO_KEEPALIVE),
            SocketOptionDescriptor::boolean("SO_REUSEADDR", SOL_SOCKET, libc::SO_REUSEADDR),
            SocketOptionDescriptor::boolean("SO_BROADCAST", SOL_SOCKET, libc::SO_BROADCAST),
            SocketOptionDescriptor::boolean("TCP_NODELAY", SOL_TCP, libc::TCP_NODELAY),
            SocketOptionDescriptor::new(
                "TCP_CONGESTION",
                SOL_TCP,
                libc::TCP_CONGESTION,
                OptionKind::Str,
                OptionValue::Str(String::new()),
            ),
            SocketOptionDescriptor::boolean("TCP_CORK", SOL_TCP, libc::TCP_CORK),
            SocketOptionDescriptor::boolean(
                "SCTP_DISABLE_FRAGMENTS",
                libc::IPPROTO_SCTP,
                SCTP_DISABLE_FRAGMENTS,
            ),
            SocketOptionDescriptor::int("SO_SNDBUF", SOL_SOCKET, libc::SO_SNDBUF, 0),
            SocketOptionDescriptor::int("SO_RCVBUF", SOL_SOCKET, libc::SO_RCVBUF, 0),
            SocketOptionDescriptor::int("SO_SNDLOWAT", SOL_SOCKET, libc::SO_SNDLOWAT, 0),
            SocketOptionDescriptor::int("SO_RCVLOWAT", SOL_SOCKET, libc::SO_RCVLOWAT, 0),
            SocketOptionDescriptor::millis("SO_SNDTIMEO", SOL_SOCKET, libc::SO_SNDTIMEO),
            SocketOptionDescriptor::millis("SO_RCVTIMEO", SOL_SOCKET, libc::SO_RCVTIMEO),
            SocketOptionDescriptor::int(
                "UDPLITE_SEND_CSCOV",
                IPPROTO_UDPLITE,
                UDPLITE_SEND_CSCOV,
                8,
            ),
        ];

        Self { entries }
    }
}

impl SocketOptionRegistry {
    /// 기본 테이블 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 선언 순서대로 순회
    pub fn iter(&self) -> impl Iterator<Item = &SocketOptionDescriptor> {
        self.entries.iter()
    }

    /// 이름으로 조회 (대소문자 무시)
    pub fn get(&self, name: &str) -> Option<&SocketOptionDescriptor> {
        self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// 지원 옵션 이름 목록
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// 요청된 항목만 순회
    pub fn requested(&self) -> impl Iterator<Item = &SocketOptionDescriptor> {
        self.entries.iter().filter(|e| e.requested)
    }

    /// 커맨드라인 문자열 값으로 옵션 요청
    pub fn request(&mut self, name: &str, raw: &str) -> Result<()> {
        let index = self.index_of(name)?;
        let value = self.entries[index].parse_value(raw)?;
        self.set_requested(index, value);
        Ok(())
    }

    /// 이미 파싱된 값으로 옵션 요청
    pub fn request_value(&mut self, name: &str, value: OptionValue) -> Result<()> {
        let index = self.index_of(name)?;
        let entry = &self.entries[index];
        if entry.kind != value.kind() {
            return Err(Error::InvalidOptionValue {
                name: entry.name.to_string(),
                value: format!("{:?}", value),
            });
        }
        self.set_requested(index, value);
        Ok(())
    }

    fn set_requested(&mut self, index: usize, value: OptionValue) {
        let entry = &mut self.entries[index];
        entry.value = value;
        entry.requested = true;
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownSocketOption {
                name: name.to_string(),
                known: self.names().join(", "),
            })
    }

    /// 요청된 옵션 적용 (하나가 실패해도 나머지는 계속 시도)
    pub fn apply<S: OptionSink + ?Sized>(&self, socket: &S) -> ApplyReport {
        let mut report = ApplyReport::default();

        for entry in self.requested() {
            match apply_descriptor(socket, entry) {
                Ok(()) => {
                    debug!("socket option {} set to {:?}", entry.name, entry.value);
                    report.applied += 1;
                }
                Err(e) => {
                    warn!("소켓 옵션 {} 설정 실패: {}", entry.name, e);
                    report.failed.push(entry.name);
                }
            }
        }

        report
    }
}

/// 레지스트리 적용
pub fn apply<S: OptionSink + ?Sized>(socket: &S, registry: &SocketOptionRegistry) -> ApplyReport {
    registry.apply(socket)
}

/// 서술자 하나를 요청 여부와 무관하게 적용
pub fn apply_descriptor<S: OptionSink + ?Sized>(
    socket: &S,
    descriptor: &SocketOptionDescriptor,
) -> io::Result<()> {
    socket.set_option(descriptor.level, descriptor.code, &descriptor.value)
}
