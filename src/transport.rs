//! 전송 연결 수립
//!
//! 프로토콜마다 반복되던 "해석 → 후보 순회 → 소켓 생성 → 튜닝 → connect" 흐름을
//! 하나의 루틴으로 합치고, 프로토콜별 차이는 [`ProtocolProfile`] 로 넘긴다.
//!
//! ## 후보 처리 순서
//! 1. 사용자 패밀리와 충돌하는 후보는 건너뜀
//! 2. 소켓 생성 실패 시 다음 후보
//! 3. 멀티캐스트 목적지면 TTL/루프백 설정 (UDP, UDP-Lite)
//! 4. UDP-Lite 체크섬 범위, 소켓 옵션 레지스트리 적용
//! 5. connect, 실패 시 다음 후보
//! 6. TCP 혼잡 제어 알고리즘 적용

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};

use libc::c_int;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::{AddressFamily, TransferConfig, Transport, IPPROTO_UDPLITE};
use crate::congestion::{self, CongestionAlgorithm};
use crate::fabric::{self, FabricAddr};
use crate::resolve::{Endpoint, ResolveQuery, ResolvedAddress, Resolver};
use crate::sockopt::{OptionSink, OptionValue, SocketOptionRegistry, UDPLITE_SEND_CSCOV};
use crate::{Error, Result};

/// 멀티캐스트 TTL / hop limit
pub const MULTICAST_HOPS: i32 = 30;

/// 연결 가능한 소켓
pub trait SocketOps: OptionSink {
    fn connect(&self, target: &ResolvedAddress) -> io::Result<()>;
}

/// 후보 주소로 소켓 생성
pub trait SocketFactory {
    type Socket: SocketOps;

    fn open(&self, candidate: &ResolvedAddress) -> io::Result<Self::Socket>;
}

/// 프로토콜별 차이
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolProfile {
    /// 멀티캐스트 목적지 검사 여부
    pub checks_multicast: bool,
    /// UDP-Lite 체크섬 범위
    pub checksum_coverage: Option<u16>,
    /// connect 후 적용할 혼잡 제어 알고리즘
    pub congestion: Option<CongestionAlgorithm>,
}

impl ProtocolProfile {
    pub fn for_config(config: &TransferConfig) -> Self {
        match config.transport {
            Transport::Tcp => Self {
                congestion: config.congestion,
                ..Self::default()
            },
            Transport::Udp => Self {
                checks_multicast: true,
                ..Self::default()
            },
            Transport::UdpLite => Self {
                checks_multicast: true,
                checksum_coverage: config.checksum_coverage,
                ..Self::default()
            },
            Transport::Sctp | Transport::Dccp | Transport::Fabric(_) => Self::default(),
        }
    }
}

/// 연결된 소켓과 선택된 후보
#[derive(Debug)]
pub struct Established<S> {
    pub socket: S,
    pub peer: ResolvedAddress,
}

/// 설정에 맞는 연결된 소켓 하나를 만든다
pub fn establish<R, F>(config: &TransferConfig, resolver: &R, factory: &F) -> Result<Established<F::Socket>>
where
    R: Resolver,
    F: SocketFactory,
{
    let profile = ProtocolProfile::for_config(config);

    if let Transport::Fabric(_) = config.transport {
        let addr = FabricAddr::from_destination(config.host.as_deref(), &config.service)?;
        return establish_fabric(config, ResolvedAddress::fabric(addr, config.transport), factory);
    }

    let candidates = resolver.resolve(&ResolveQuery::for_config(config))?;
    let result = connect_first(config, &profile, candidates.as_ref(), factory);
    drop(candidates);
    result
}

/// 해석 없이 패브릭 주소로 바로 연결
fn establish_fabric<F: SocketFactory>(
    config: &TransferConfig,
    candidate: ResolvedAddress,
    factory: &F,
) -> Result<Established<F::Socket>> {
    let connect_error = |source| Error::Connect {
        host: candidate.endpoint.to_string(),
        source,
    };

    let socket = factory.open(&candidate).map_err(connect_error)?;
    config.socket_options.apply(&socket);
    socket.connect(&candidate).map_err(connect_error)?;

    info!("socket connected to {}", candidate.endpoint);
    Ok(Established {
        socket,
        peer: candidate,
    })
}

fn connect_first<F: SocketFactory>(
    config: &TransferConfig,
    profile: &ProtocolProfile,
    candidates: &[ResolvedAddress],
    factory: &F,
) -> Result<Established<F::Socket>> {
    let mut connect_error: Option<io::Error> = None;

    for candidate in candidates {
        if config.family.conflicts_with(candidate.family) {
            debug!("skipping {} (family {:?})", candidate.endpoint, candidate.family);
            continue;
        }

        let socket = match factory.open(candidate) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("socket 생성 실패 ({}): {}", candidate.endpoint, e);
                continue;
            }
        };
        debug!(
            "socket created - {} (type {}, protocol {})",
            config.transport, candidate.socktype, candidate.protocol
        );

        prepare(&socket, candidate, profile, &config.socket_options)?;

        match socket.connect(candidate) {
            Ok(()) => {
                info!(
                    "socket connected to {} via port {}",
                    config.host_name(),
                    config.service
                );
                tune_connected(&socket, profile);
                return Ok(Established {
                    socket,
                    peer: *candidate,
                });
            }
            Err(e) => {
                warn!("{} 연결 실패: {}", candidate.endpoint, e);
                connect_error = Some(e);
            }
        }
    }

    let host = config.host_name().to_string();
    match connect_error {
        Some(source) => Err(Error::Connect { host, source }),
        None => Err(Error::NoSuitableSocket { host }),
    }
}

/// connect 전 튜닝 (멀티캐스트, 체크섬 범위, 레지스트리 순)
fn prepare<S: OptionSink + ?Sized>(
    socket: &S,
    candidate: &ResolvedAddress,
    profile: &ProtocolProfile,
    registry: &SocketOptionRegistry,
) -> Result<()> {
    if profile.checks_multicast && candidate.endpoint.is_multicast() {
        set_multicast(socket, candidate.family)?;
    }

    if let Some(coverage) = profile.checksum_coverage {
        let value = OptionValue::Int(i32::from(coverage));
        match socket.set_option(IPPROTO_UDPLITE, UDPLITE_SEND_CSCOV, &value) {
            Ok(()) => debug!("UDPLITE_SEND_CSCOV set to {}", coverage),
            Err(e) => warn!("UDPLITE_SEND_CSCOV 설정 실패: {}", e),
        }
    }

    let report = registry.apply(socket);
    if report.applied > 0 || !report.failed.is_empty() {
        debug!(
            "socket options applied: {}, failed: {:?}",
            report.applied, report.failed
        );
    }
    Ok(())
}

/// 멀티캐스트 TTL / 루프백 설정 (실패 시 중단)
pub fn set_multicast<S: OptionSink + ?Sized>(socket: &S, family: AddressFamily) -> Result<()> {
    let (level, hops, hops_name, lo, lo_name) = match family {
        AddressFamily::Inet6 => (
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            "IPV6_MULTICAST_HOPS",
            libc::IPV6_MULTICAST_LOOP,
            "IPV6_MULTICAST_LOOP",
        ),
        AddressFamily::Inet => (
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_TTL,
            "IP_MULTICAST_TTL",
            libc::IP_MULTICAST_LOOP,
            "IP_MULTICAST_LOOP",
        ),
        other => {
            return Err(Error::Internal(format!(
                "멀티캐스트 검사에 IP 가 아닌 패밀리 {:?}",
                other
            )))
        }
    };

    socket
        .set_option(level, hops, &OptionValue::Int(MULTICAST_HOPS))
        .map_err(|source| Error::SocketOption {
            name: hops_name,
            source,
        })?;
    socket
        .set_option(level, lo, &OptionValue::Int(1))
        .map_err(|source| Error::SocketOption { name: lo_name, source })?;

    debug!("set {} {} and {}", hops_name, MULTICAST_HOPS, lo_name);
    Ok(())
}

/// connect 후 튜닝 (실패는 경고만)
fn tune_connected<S: OptionSink + ?Sized>(socket: &S, profile: &ProtocolProfile) {
    if let Some(algorithm) = profile.congestion {
        if let Err(e) = congestion::apply(socket, algorithm) {
            warn!("혼잡 제어 알고리즘 {} 설정 실패: {}", algorithm, e);
        }
    }
}

/// 실제 소켓
#[derive(Debug)]
pub struct NetSocket {
    inner: Socket,
}

impl NetSocket {
    /// 후보 주소의 패밀리/타입/프로토콜로 socket(2)
    pub fn open(candidate: &ResolvedAddress) -> io::Result<Self> {
        let protocol = match candidate.protocol {
            0 => None,
            p => Some(Protocol::from(p)),
        };
        let inner = Socket::new(
            Domain::from(candidate.family.raw()),
            Type::from(candidate.socktype),
            protocol,
        )?;
        Ok(Self { inner })
    }

    pub fn inner(&self) -> &Socket {
        &self.inner
    }

    pub fn into_inner(self) -> Socket {
        self.inner
    }

    /// 협상된 (송신, 수신) 소켓 버퍼 크기
    pub fn buffer_sizes(&self) -> io::Result<(usize, usize)> {
        Ok((self.inner.send_buffer_size()?, self.inner.recv_buffer_size()?))
    }

    /// 후보 주소에 bind(2)
    pub fn bind(&self, local: &ResolvedAddress) -> io::Result<()> {
        match &local.endpoint {
            Endpoint::Ip(addr) => self.inner.bind(&SockAddr::from(*addr)),
            Endpoint::Fabric(addr) => fabric::bind(self.inner.as_raw_fd(), addr),
        }
    }
}

impl From<Socket> for NetSocket {
    fn from(inner: Socket) -> Self {
        Self { inner }
    }
}

impl SocketOps for NetSocket {
    fn connect(&self, target: &ResolvedAddress) -> io::Result<()> {
        match &target.endpoint {
            Endpoint::Ip(addr) => self.inner.connect(&SockAddr::from(*addr)),
            Endpoint::Fabric(addr) => fabric::connect(self.inner.as_raw_fd(), addr),
        }
    }
}

impl OptionSink for NetSocket {
    fn set_option(&self, level: c_int, code: c_int, value: &OptionValue) -> io::Result<()> {
        let fd = self.inner.as_raw_fd();
        match value {
            OptionValue::Bool(on) => setsockopt(fd, level, code, &c_int::from(*on)),
            OptionValue::Int(v) => setsockopt(fd, level, code, v),
            OptionValue::Millis(ms) => {
                let tv = libc::timeval {
                    tv_sec: (*ms / 1000) as libc::time_t,
                    tv_usec: ((*ms % 1000) * 1000) as libc::suseconds_t,
                };
                setsockopt(fd, level, code, &tv)
            }
            OptionValue::Str(s) => setsockopt_raw(fd, level, code, s.as_ptr().cast(), s.len()),
        }
    }
}

fn setsockopt<T>(fd: RawFd, level: c_int, code: c_int, value: &T) -> io::Result<()> {
    setsockopt_raw(
        fd,
        level,
        code,
        (value as *const T).cast(),
        std::mem::size_of::<T>(),
    )
}

fn setsockopt_raw(
    fd: RawFd,
    level: c_int,
    code: c_int,
    value: *const libc::c_void,
    len: usize,
) -> io::Result<()> {
    // SAFETY: value 는 len 바이트의 유효한 메모리를 가리킨다.
    let ret = unsafe { libc::setsockopt(fd, level, code, value, len as libc::socklen_t) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Read for NetSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for NetSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsRawFd for NetSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsFd for NetSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// 실제 소켓 생성기
#[derive(Debug, Clone, Copy, Default)]
pub struct NetSocketFactory;

impl SocketFactory for NetSocketFactory {
    type Socket = NetSocket;

    fn open(&self, candidate: &ResolvedAddress) -> io::Result<NetSocket> {
        NetSocket::open(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::net::SocketAddr;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Open(Endpoint),
        Option(c_int, c_int),
        Connect(Endpoint),
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct MockList {
        entries: Vec<ResolvedAddress>,
        released: Rc<Cell<usize>>,
    }

    impl AsRef<[ResolvedAddress]> for MockList {
        fn as_ref(&self) -> &[ResolvedAddress] {
            &self.entries
        }
    }

    impl Drop for MockList {
        fn drop(&mut self) {
            self.released.set(self.released.get() + 1);
        }
    }

    struct MockResolver {
        entries: Vec<ResolvedAddress>,
        released: Rc<Cell<usize>>,
        calls: Cell<usize>,
    }

    impl MockResolver {
        fn new(entries: Vec<ResolvedAddress>) -> Self {
            Self {
                entries,
                released: Rc::new(Cell::new(0)),
                calls: Cell::new(0),
            }
        }
    }

    impl Resolver for MockResolver {
        type Candidates = MockList;

        fn resolve(&self, _query: &ResolveQuery<'_>) -> Result<MockList> {
            self.calls.set(self.calls.get() + 1);
            Ok(MockList {
                entries: self.entries.clone(),
                released: Rc::clone(&self.released),
            })
        }
    }

    #[derive(Debug)]
    struct MockSocket {
        log: Log,
        connect_fail: Vec<Endpoint>,
    }

    impl OptionSink for MockSocket {
        fn set_option(&self, level: c_int, code: c_int, _value: &OptionValue) -> io::Result<()> {
            self.log.borrow_mut().push(Event::Option(level, code));
            Ok(())
        }
    }

    impl SocketOps for MockSocket {
        fn connect(&self, target: &ResolvedAddress) -> io::Result<()> {
            self.log.borrow_mut().push(Event::Connect(target.endpoint));
            if self.connect_fail.contains(&target.endpoint) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        log: Log,
        open_fail: Vec<Endpoint>,
        connect_fail: Vec<Endpoint>,
    }

    impl SocketFactory for MockFactory {
        type Socket = MockSocket;

        fn open(&self, candidate: &ResolvedAddress) -> io::Result<MockSocket> {
            self.log.borrow_mut().push(Event::Open(candidate.endpoint));
            if self.open_fail.contains(&candidate.endpoint) {
                return Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
            }
            Ok(MockSocket {
                log: Rc::clone(&self.log),
                connect_fail: self.connect_fail.clone(),
            })
        }
    }

    fn ip(s: &str) -> Endpoint {
        Endpoint::Ip(s.parse::<SocketAddr>().unwrap())
    }

    fn candidate(s: &str, transport: Transport) -> ResolvedAddress {
        ResolvedAddress::ip(s.parse().unwrap(), transport)
    }

    fn config(transport: Transport) -> TransferConfig {
        let mut config = TransferConfig::new();
        config.transport = transport;
        config.host = Some("peer.example".into());
        config
    }

    #[test]
    fn test_list_released_once_on_every_path() {
        let a = "10.0.0.1:6666";
        let b = "10.0.0.2:6666";

        // 모두 실패
        let resolver = MockResolver::new(vec![candidate(a, Transport::Tcp), candidate(b, Transport::Tcp)]);
        let factory = MockFactory {
            connect_fail: vec![ip(a), ip(b)],
            ..Default::default()
        };
        let err = establish(&config(Transport::Tcp), &resolver, &factory).unwrap_err();
        assert!(matches!(err, Error::Connect { ref host, .. } if host == "peer.example"));
        assert_eq!(resolver.released.get(), 1);

        // 하나 실패
        let resolver = MockResolver::new(vec![candidate(a, Transport::Tcp), candidate(b, Transport::Tcp)]);
        let factory = MockFactory {
            connect_fail: vec![ip(a)],
            ..Default::default()
        };
        let established = establish(&config(Transport::Tcp), &resolver, &factory).unwrap();
        assert_eq!(established.peer.endpoint, ip(b));
        assert_eq!(resolver.released.get(), 1);

        // 후보 없음
        let resolver = MockResolver::new(vec![]);
        let err = establish(&config(Transport::Tcp), &resolver, &MockFactory::default()).unwrap_err();
        assert!(matches!(err, Error::NoSuitableSocket { .. }));
        assert_eq!(err.exit_class(), crate::ExitClass::Network);
        assert_eq!(resolver.released.get(), 1);
    }

    #[test]
    fn test_multicast_before_registry_v4_and_v6() {
        for (addr, level, hops, lo) in [
            ("239.1.1.1:6666", libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, libc::IP_MULTICAST_LOOP),
            ("[ff02::1]:6666", libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, libc::IPV6_MULTICAST_LOOP),
        ] {
            let mut config = config(Transport::Udp);
            config.socket_options.request("SO_RCVBUF", "65536").unwrap();

            let resolver = MockResolver::new(vec![candidate(addr, Transport::Udp)]);
            let factory = MockFactory::default();
            establish(&config, &resolver, &factory).unwrap();

            let log = factory.log.borrow();
            assert_eq!(
                *log,
                vec![
                    Event::Open(ip(addr)),
                    Event::Option(level, hops),
                    Event::Option(level, lo),
                    Event::Option(libc::SOL_SOCKET, libc::SO_RCVBUF),
                    Event::Connect(ip(addr)),
                ]
            );
        }
    }

    #[test]
    fn test_stream_transport_skips_multicast_check() {
        let resolver = MockResolver::new(vec![candidate("239.1.1.1:6666", Transport::Sctp)]);
        let factory = MockFactory::default();
        establish(&config(Transport::Sctp), &resolver, &factory).unwrap();

        assert!(!factory
            .log
            .borrow()
            .iter()
            .any(|e| matches!(e, Event::Option(..))));
    }

    #[test]
    fn test_family_preference_and_open_failure() {
        let v4 = "10.0.0.1:6666";
        let v6a = "[fd00::1]:6666";
        let v6b = "[fd00::2]:6666";

        let mut config = config(Transport::Tcp);
        config.family = AddressFamily::Inet6;
        let resolver = MockResolver::new(vec![
            candidate(v4, Transport::Tcp),
            candidate(v6a, Transport::Tcp),
            candidate(v6b, Transport::Tcp),
        ]);
        let factory = MockFactory {
            open_fail: vec![ip(v6a)],
            ..Default::default()
        };

        let established = establish(&config, &resolver, &factory).unwrap();
        assert_eq!(established.peer.endpoint, ip(v6b));

        let log = factory.log.borrow();
        assert!(!log.contains(&Event::Open(ip(v4))));
        assert!(log.contains(&Event::Open(ip(v6a))));
        assert!(!log.contains(&Event::Connect(ip(v6a))));
    }

    #[test]
    fn test_checksum_coverage_before_registry() {
        let addr = "10.0.0.1:6666";
        let mut config = config(Transport::UdpLite);
        config.checksum_coverage = Some(16);
        config.socket_options.request("SO_SNDBUF", "4096").unwrap();

        let resolver = MockResolver::new(vec![candidate(addr, Transport::UdpLite)]);
        let factory = MockFactory::default();
        establish(&config, &resolver, &factory).unwrap();

        let log = factory.log.borrow();
        assert_eq!(log[1], Event::Option(IPPROTO_UDPLITE, UDPLITE_SEND_CSCOV));
        assert_eq!(log[2], Event::Option(libc::SOL_SOCKET, libc::SO_SNDBUF));
    }

    #[test]
    fn test_congestion_after_connect() {
        let addr = "10.0.0.1:6666";
        let mut config = config(Transport::Tcp);
        config.congestion = Some(CongestionAlgorithm::select("cubic").unwrap());

        let resolver = MockResolver::new(vec![candidate(addr, Transport::Tcp)]);
        let factory = MockFactory::default();
        establish(&config, &resolver, &factory).unwrap();

        let log = factory.log.borrow();
        assert_eq!(log.last(), Some(&Event::Option(libc::SOL_TCP, libc::TCP_CONGESTION)));
        assert_eq!(log[log.len() - 2], Event::Connect(ip(addr)));
    }

    #[test]
    fn test_fabric_bypasses_resolver() {
        let mut config = config(Transport::Fabric(crate::fabric::FabricSocketType::Rdm));
        config.host = Some("1.1.1".into());

        let resolver = MockResolver::new(vec![]);
        let factory = MockFactory::default();
        let established = establish(&config, &resolver, &factory).unwrap();

        assert_eq!(resolver.calls.get(), 0);
        assert_eq!(established.peer.family, AddressFamily::Fabric);
        assert_eq!(established.peer.socktype, libc::SOCK_RDM);
    }

    #[test]
    fn test_profile_per_transport() {
        assert!(ProtocolProfile::for_config(&config(Transport::Udp)).checks_multicast);
        assert!(ProtocolProfile::for_config(&config(Transport::UdpLite)).checks_multicast);
        assert!(!ProtocolProfile::for_config(&config(Transport::Tcp)).checks_multicast);

        let mut udp = config(Transport::Udp);
        udp.congestion = Some(CongestionAlgorithm::select("reno").unwrap());
        assert_eq!(ProtocolProfile::for_config(&udp).congestion, None);
    }

    #[test]
    fn test_real_socket_options() {
        let candidate = candidate("127.0.0.1:0", Transport::Tcp);
        let socket = NetSocket::open(&candidate).unwrap();
        socket
            .set_option(libc::SOL_TCP, libc::TCP_NODELAY, &OptionValue::Bool(true))
            .unwrap();
        socket
            .set_option(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &OptionValue::Millis(1500))
            .unwrap();
        assert!(socket.inner().nodelay().unwrap());
        assert_eq!(
            socket.inner().read_timeout().unwrap(),
            Some(std::time::Duration::from_millis(1500))
        );
    }
}
