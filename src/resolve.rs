//! 주소 해석
//!
//! getaddrinfo(3) 결과를 RAII 리스트로 감싸고 후보 주소로 변환한다.
//! getaddrinfo 는 SCTP/DCCP/UDP-Lite 를 모르기 때문에 TCP/UDP 로 질의한 뒤
//! 후보마다 요청한 소켓 타입과 프로토콜을 다시 기록한다.

use std::ffi::{CStr, CString};
use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use libc::c_int;
use tracing::{debug, trace};

use crate::config::{AddressFamily, TransferConfig, Transport, WorkMode};
use crate::fabric::FabricAddr;
use crate::{Error, Result};

/// 후보 주소의 실제 엔드포인트
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Ip(SocketAddr),
    Fabric(FabricAddr),
}

impl Endpoint {
    /// IPv4 224.0.0.0/4 또는 IPv6 ff00::/8
    pub fn is_multicast(&self) -> bool {
        match self {
            Endpoint::Ip(addr) => addr.ip().is_multicast(),
            Endpoint::Fabric(_) => false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{}", addr),
            Endpoint::Fabric(addr) => write!(f, "{}", addr),
        }
    }
}

/// 해석된 후보 주소 하나
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub family: AddressFamily,
    pub socktype: c_int,
    pub protocol: c_int,
    pub endpoint: Endpoint,
}

impl ResolvedAddress {
    /// IP 주소로 후보 생성
    pub fn ip(addr: SocketAddr, transport: Transport) -> Self {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        Self {
            family,
            socktype: transport.socktype(),
            protocol: transport.protocol(),
            endpoint: Endpoint::Ip(addr),
        }
    }

    /// 패브릭 주소로 후보 생성 (해석 없이 직접)
    pub fn fabric(addr: FabricAddr, transport: Transport) -> Self {
        Self {
            family: AddressFamily::Fabric,
            socktype: transport.socktype(),
            protocol: transport.protocol(),
            endpoint: Endpoint::Fabric(addr),
        }
    }
}

/// 해석 질의
#[derive(Debug, Clone)]
pub struct ResolveQuery<'a> {
    pub host: Option<&'a str>,
    pub service: &'a str,
    pub family: AddressFamily,
    pub transport: Transport,
    /// 수신 모드 (와일드카드 bind 용 주소)
    pub passive: bool,
}

impl<'a> ResolveQuery<'a> {
    pub fn for_config(config: &'a TransferConfig) -> Self {
        Self {
            host: config.host.as_deref(),
            service: &config.service,
            family: config.family,
            transport: config.transport,
            passive: config.mode == WorkMode::Receive,
        }
    }

    /// getaddrinfo 에 넘길 (socktype, protocol)
    ///
    /// 지원하지 않는 프로토콜은 같은 성격의 TCP/UDP 로 바꾼다.
    fn lookup_hints(&self) -> (c_int, c_int) {
        match self.transport {
            Transport::Sctp | Transport::Dccp => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
            Transport::UdpLite => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
            other => (other.socktype(), other.protocol()),
        }
    }
}

/// 주소 해석기
///
/// 반환되는 후보 목록은 소유권을 가진 값이며 drop 될 때 한 번만 해제된다.
pub trait Resolver {
    type Candidates: AsRef<[ResolvedAddress]>;

    fn resolve(&self, query: &ResolveQuery<'_>) -> Result<Self::Candidates>;
}

/// getaddrinfo(3) 결과 리스트
pub struct AddrInfoList {
    head: *mut libc::addrinfo,
    entries: Vec<ResolvedAddress>,
}

impl AsRef<[ResolvedAddress]> for AddrInfoList {
    fn as_ref(&self) -> &[ResolvedAddress] {
        &self.entries
    }
}

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.head.is_null() {
            // SAFETY: head 는 getaddrinfo 가 돌려준 포인터이며 여기서만 해제한다.
            unsafe { libc::freeaddrinfo(self.head) };
            self.head = ptr::null_mut();
            trace!("address list released");
        }
    }
}

impl fmt::Debug for AddrInfoList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddrInfoList")
            .field("entries", &self.entries)
            .finish()
    }
}

/// 시스템 getaddrinfo 해석기
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    type Candidates = AddrInfoList;

    fn resolve(&self, query: &ResolveQuery<'_>) -> Result<AddrInfoList> {
        let resolve_error = |reason: String| Error::Resolve {
            host: query.host.unwrap_or("<any>").to_string(),
            service: query.service.to_string(),
            reason,
        };

        let host = query
            .host
            .map(CString::new)
            .transpose()
            .map_err(|_| resolve_error("호스트 이름에 NUL 문자".into()))?;
        let service = CString::new(query.service)
            .map_err(|_| resolve_error("서비스 이름에 NUL 문자".into()))?;

        let (socktype, protocol) = query.lookup_hints();

        // SAFETY: addrinfo 는 POD 이며 0 으로 초기화된 값이 유효한 힌트다.
        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = query.family.raw();
        hints.ai_socktype = socktype;
        hints.ai_protocol = protocol;
        // 숫자 주소는 로컬 인터페이스 구성과 무관하게 그대로 쓴다
        let numeric = query.host.map_or(false, |h| h.parse::<IpAddr>().is_ok());
        hints.ai_flags = if query.passive {
            libc::AI_PASSIVE
        } else if numeric {
            libc::AI_NUMERICHOST
        } else {
            libc::AI_ADDRCONFIG
        };

        let mut head: *mut libc::addrinfo = ptr::null_mut();
        // SAFETY: 모든 포인터 인자는 호출 동안 유효하다.
        let ret = unsafe {
            libc::getaddrinfo(
                host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
                service.as_ptr(),
                &hints,
                &mut head,
            )
        };
        if ret != 0 {
            return Err(resolve_error(gai_reason(ret)));
        }

        let mut list = AddrInfoList {
            head,
            entries: Vec::new(),
        };

        let mut cursor = list.head as *const libc::addrinfo;
        while !cursor.is_null() {
            // SAFETY: cursor 는 list.head 에서 시작하는 유효한 연결 리스트 노드다.
            let info = unsafe { &*cursor };
            // SAFETY: ai_addr/ai_addrlen 은 getaddrinfo 가 채운 값이다.
            match unsafe { socket_addr_from_raw(info.ai_addr, info.ai_addrlen) } {
                Some(addr) => {
                    // 질의 때 바꾼 타입/프로토콜을 요청한 값으로 되돌린다
                    list.entries.push(ResolvedAddress::ip(addr, query.transport));
                }
                None => debug!("skipping candidate with family {}", info.ai_family),
            }
            cursor = info.ai_next;
        }

        debug!(
            "resolved {}:{} to {} candidate(s)",
            query.host.unwrap_or("<any>"),
            query.service,
            list.entries.len()
        );
        Ok(list)
    }
}

fn gai_reason(code: c_int) -> String {
    if code == libc::EAI_SYSTEM {
        return std::io::Error::last_os_error().to_string();
    }
    // SAFETY: gai_strerror 는 정적 문자열을 돌려준다.
    unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
        .to_string_lossy()
        .into_owned()
}

/// sockaddr 를 SocketAddr 로 변환
///
/// # Safety
/// `addr` 는 null 이거나 최소 `len` 바이트의 유효한 sockaddr 이어야 한다.
unsafe fn socket_addr_from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }

    match (*addr).sa_family as c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = &*(addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = &*(addr as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
