//! 비 IP 패브릭 전송 (TIPC)
//!
//! 주소 해석을 거치지 않고 서비스 이름(type, instance)으로 직접 주소를 만든다.

use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use libc::c_int;

use crate::{Error, Result};

/// AF_TIPC (linux/socket.h)
pub const AF_TIPC: c_int = 30;

const TIPC_ADDR_NAMESEQ: u8 = 1;
const TIPC_ADDR_NAME: u8 = 2;
const TIPC_CLUSTER_SCOPE: i8 = 2;

/// netsend 가 사용하는 TIPC 서비스 타입 (0 ~ 63 은 예약)
pub const NETSEND_SERVICE_TYPE: u32 = 18888;

/// TIPC 소켓 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricSocketType {
    Rdm,
    Dgram,
    Stream,
    SeqPacket,
}

impl FabricSocketType {
    pub fn raw(&self) -> c_int {
        match self {
            FabricSocketType::Rdm => libc::SOCK_RDM,
            FabricSocketType::Dgram => libc::SOCK_DGRAM,
            FabricSocketType::Stream => libc::SOCK_STREAM,
            FabricSocketType::SeqPacket => libc::SOCK_SEQPACKET,
        }
    }

    /// listen/accept 가 가능한 타입인지
    pub fn is_connection_oriented(&self) -> bool {
        matches!(self, FabricSocketType::Stream | FabricSocketType::SeqPacket)
    }
}

impl FromStr for FabricSocketType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.strip_prefix("sock_").unwrap_or(&lower) {
            "rdm" => Ok(FabricSocketType::Rdm),
            "dgram" => Ok(FabricSocketType::Dgram),
            "stream" => Ok(FabricSocketType::Stream),
            "seqpacket" => Ok(FabricSocketType::SeqPacket),
            _ => Err(Error::InvalidConfig(format!(
                "TIPC 소켓 타입 \"{}\" 은(는) 지원하지 않음 (rdm, dgram, stream, seqpacket)",
                s
            ))),
        }
    }
}

/// struct sockaddr_tipc (linux/tipc.h)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockaddrTipc {
    family: libc::sa_family_t,
    addrtype: u8,
    scope: i8,
    /// name: {type, instance, domain} / nameseq: {type, lower, upper}
    addr: [u32; 3],
}

/// TIPC 서비스 주소
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricAddr {
    pub service_type: u32,
    pub instance: u32,
    /// 조회 도메인 (z.c.n, 0 이면 전체)
    pub domain: u32,
}

impl FabricAddr {
    /// 호스트(`z.c.n` 또는 비어 있음)와 서비스(instance 번호)로 주소 생성
    pub fn from_destination(host: Option<&str>, service: &str) -> Result<Self> {
        let instance = service.parse::<u32>().map_err(|_| {
            Error::InvalidConfig(format!("TIPC instance \"{}\" 은(는) 숫자가 아님", service))
        })?;

        let domain = match host {
            None | Some("") | Some("0") => 0,
            Some(h) => parse_domain(h)?,
        };

        Ok(Self {
            service_type: NETSEND_SERVICE_TYPE,
            instance,
            domain,
        })
    }

    fn connect_raw(&self) -> SockaddrTipc {
        SockaddrTipc {
            family: AF_TIPC as libc::sa_family_t,
            addrtype: TIPC_ADDR_NAME,
            scope: 0,
            addr: [self.service_type, self.instance, self.domain],
        }
    }

    fn bind_raw(&self) -> SockaddrTipc {
        SockaddrTipc {
            family: AF_TIPC as libc::sa_family_t,
            addrtype: TIPC_ADDR_NAMESEQ,
            scope: TIPC_CLUSTER_SCOPE,
            addr: [self.service_type, self.instance, self.instance],
        }
    }
}

impl fmt::Display for FabricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tipc:{}.{}@{}.{}.{}",
            self.service_type,
            self.instance,
            self.domain >> 24,
            (self.domain >> 12) & 0xfff,
            self.domain & 0xfff
        )
    }
}

/// `z.c.n` 을 TIPC 네트워크 주소로 변환
fn parse_domain(host: &str) -> Result<u32> {
    let invalid = || Error::InvalidConfig(format!("TIPC 주소 \"{}\" 은(는) z.c.n 형식이 아님", host));

    let parts: Vec<u32> = host
        .split('.')
        .map(|p| p.parse::<u32>().map_err(|_| invalid()))
        .collect::<Result<_>>()?;

    match parts.as_slice() {
        [z, c, n] if *z <= 0xff && *c <= 0xfff && *n <= 0xfff => Ok((z << 24) | (c << 12) | n),
        _ => Err(invalid()),
    }
}

fn sys_result(ret: c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// 서비스 주소로 connect(2)
pub fn connect(fd: RawFd, addr: &FabricAddr) -> io::Result<()> {
    let raw = addr.connect_raw();
    // SAFETY: raw 는 sockaddr_tipc 레이아웃이며 호출 동안 살아 있다.
    let ret = unsafe {
        libc::connect(
            fd,
            &raw as *const SockaddrTipc as *const libc::sockaddr,
            mem::size_of::<SockaddrTipc>() as libc::socklen_t,
        )
    };
    sys_result(ret)
}

/// 서비스 주소에 bind(2) (클러스터 범위 공개)
pub fn bind(fd: RawFd, addr: &FabricAddr) -> io::Result<()> {
    let raw = addr.bind_raw();
    // SAFETY: connect 와 동일
    let ret = unsafe {
        libc::bind(
            fd,
            &raw as *const SockaddrTipc as *const libc::sockaddr,
            mem::size_of::<SockaddrTipc>() as libc::socklen_t,
        )
    };
    sys_result(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_layout() {
        assert_eq!(mem::size_of::<SockaddrTipc>(), 16);
    }

    #[test]
    fn test_destination_parsing() {
        let addr = FabricAddr::from_destination(Some("1.1.10"), "6666").unwrap();
        assert_eq!(addr.instance, 6666);
        assert_eq!(addr.domain, (1 << 24) | (1 << 12) | 10);
        assert_eq!(addr.to_string(), "tipc:18888.6666@1.1.10");

        let any = FabricAddr::from_destination(None, "1").unwrap();
        assert_eq!(any.domain, 0);

        assert!(FabricAddr::from_destination(Some("1.1"), "1").is_err());
        assert!(FabricAddr::from_destination(Some("host"), "1").is_err());
        assert!(FabricAddr::from_destination(None, "http").is_err());
    }

    #[test]
    fn test_socket_type_names() {
        assert_eq!("SOCK_RDM".parse::<FabricSocketType>().unwrap(), FabricSocketType::Rdm);
        assert_eq!("seqpacket".parse::<FabricSocketType>().unwrap(), FabricSocketType::SeqPacket);
        assert!("raw".parse::<FabricSocketType>().is_err());
        assert!(FabricSocketType::Stream.is_connection_oriented());
        assert!(!FabricSocketType::Rdm.is_connection_oriented());
    }
}
