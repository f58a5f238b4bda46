//! 수신자
//!
//! 한 번의 실행에 정확히 한 피어만 받는다.
//! - 스트림 전송: listen(1) 후 accept
//! - 데이터그램 전송: 첫 데이터그램의 발신지로 connect
//! - 세션 헤더, RTT 에코 후 read/write 로 출력에 기록
//! - `exec` 가 있으면 출력 대신 명령의 표준 입력으로 기록

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{AddressFamily, TransferConfig, Transport};
use crate::fabric::FabricAddr;
use crate::resolve::{Endpoint, ResolveQuery, ResolvedAddress, Resolver, SystemResolver};
use crate::rtt;
use crate::session::{self, SessionHeader};
use crate::stats::TransferStats;
use crate::strategy::{Buffered, Strategy, TransferStrategy};
use crate::transport::NetSocket;
use crate::{Error, Result};

/// 데이터그램 수신 유휴 타임아웃
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// 데이터그램이 잘리지 않는 최소 버퍼
const MIN_DATAGRAM_BUFFER: usize = 65536;

/// 수신 출력
#[derive(Debug)]
pub enum Output {
    File(File),
    Stdout(io::Stdout),
    Command { child: Child, stdin: ChildStdin },
}

impl Output {
    /// 설정의 출력 열기 (명령 > 파일 > 표준 출력)
    pub fn create(config: &TransferConfig) -> Result<Self> {
        if let Some(command) = &config.exec {
            if config.output.is_some() {
                warn!("명령 실행 지정됨, 출력 파일 무시");
            }
            return Self::spawn(command);
        }
        match &config.output {
            Some(path) if path.as_os_str() != "-" => File::create(path)
                .map(Output::File)
                .map_err(|source| Error::OutputFile {
                    path: path.display().to_string(),
                    source,
                }),
            _ => Ok(Output::Stdout(io::stdout())),
        }
    }

    /// `sh -c <command>` 실행, 표준 입력을 파이프로 연결
    pub fn spawn(command: &str) -> Result<Self> {
        let exec_error = |source| Error::Exec {
            command: command.to_string(),
            source,
        };
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(exec_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("child stdin not piped".into()))?;
        info!("spawned \"{}\" (pid {})", command, child.id());
        Ok(Output::Command { child, stdin })
    }

    /// 출력 마무리. 명령이면 입력을 닫고 종료를 기다린다
    pub fn finish(self) -> Result<()> {
        match self {
            Output::Command { mut child, stdin } => {
                drop(stdin);
                let status = child.wait()?;
                if status.success() {
                    debug!("command exited: {}", status);
                } else {
                    warn!("명령 비정상 종료: {}", status);
                }
                Ok(())
            }
            mut other => Ok(other.flush()?),
        }
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::File(f) => f.write(buf),
            Output::Stdout(s) => s.write(buf),
            Output::Command { stdin, .. } => stdin.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::File(f) => f.flush(),
            Output::Stdout(s) => s.flush(),
            Output::Command { stdin, .. } => stdin.flush(),
        }
    }
}

impl AsFd for Output {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Output::File(f) => f.as_fd(),
            Output::Stdout(s) => s.as_fd(),
            Output::Command { stdin, .. } => stdin.as_fd(),
        }
    }
}

/// 바인드된 수신 소켓
#[derive(Debug)]
pub struct Listener {
    socket: NetSocket,
    local: ResolvedAddress,
    transport: Transport,
}

impl Listener {
    /// 실제 바인드된 주소 (포트 0 으로 바인드한 경우 확인용)
    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        Ok(self.socket.inner().local_addr()?.as_socket())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.local.endpoint
    }
}

/// 세션 데이터만 읽는 리더
///
/// 알린 크기에 도달하면 EOF, 데이터그램 유휴 타임아웃도 EOF 로 본다.
struct SessionReader<'s> {
    socket: &'s mut NetSocket,
    remaining: Option<u64>,
    datagram: bool,
}

impl Read for SessionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = match self.remaining {
            Some(0) => return Ok(0),
            Some(left) => buf.len().min(usize::try_from(left).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        // 데이터그램은 잘리지 않도록 버퍼 전체로 읽는다
        let want = if self.datagram { buf.len() } else { limit };

        match self.socket.read(&mut buf[..want]) {
            Ok(n) => {
                if let Some(left) = self.remaining.as_mut() {
                    *left = left.saturating_sub(n as u64);
                }
                Ok(n)
            }
            Err(e) if self.datagram && matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                warn!("{:?} 동안 데이터 없음, 수신 종료", IDLE_TIMEOUT);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

impl AsFd for SessionReader<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

/// 수신자
pub struct Receiver<'a> {
    config: &'a TransferConfig,
    stats: TransferStats,
}

impl<'a> Receiver<'a> {
    pub fn new(config: &'a TransferConfig) -> Self {
        Self {
            config,
            stats: TransferStats::new(),
        }
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn into_stats(self) -> TransferStats {
        self.stats
    }

    /// 바인드, 피어 수락, 수신까지
    pub fn run(&mut self) -> Result<u64> {
        let listener = self.bind()?;
        self.receive_on(listener)
    }

    /// 설정된 포트에 바인드
    pub fn bind(&self) -> Result<Listener> {
        let config = self.config;
        config.validate()?;

        if let Transport::Fabric(kind) = config.transport {
            if !kind.is_connection_oriented() {
                return Err(Error::InvalidConfig(format!(
                    "수신 모드는 TIPC {:?} 소켓을 지원하지 않음 (stream, seqpacket)",
                    kind
                )));
            }
            let addr = FabricAddr::from_destination(None, &config.service)?;
            return self.bind_candidate(&ResolvedAddress::fabric(addr, config.transport));
        }

        let candidates = SystemResolver.resolve(&ResolveQuery::for_config(config))?;
        let mut ordered: Vec<ResolvedAddress> = candidates.as_ref().to_vec();
        drop(candidates);

        // 패밀리 지정이 없으면 IPv6 와일드카드(듀얼 스택) 우선
        if config.family == AddressFamily::Unspecified {
            ordered.sort_by_key(|c| c.family != AddressFamily::Inet6);
        }

        let mut last_error = None;
        for candidate in ordered.iter().filter(|c| !config.family.conflicts_with(c.family)) {
            match self.bind_candidate(candidate) {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    warn!("{} 바인드 실패: {}", candidate.endpoint, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::NoSuitableSocket {
            host: config.host_name().to_string(),
        }))
    }

    fn bind_candidate(&self, candidate: &ResolvedAddress) -> Result<Listener> {
        let config = self.config;
        if candidate.endpoint.is_multicast() && !config.transport.is_connectionless() {
            return Err(Error::InvalidConfig(format!(
                "멀티캐스트 그룹은 udp/udplite 에서만 사용 가능 ({})",
                config.transport
            )));
        }
        let socket = NetSocket::open(candidate)?;

        if let Endpoint::Ip(SocketAddr::V6(addr)) = candidate.endpoint {
            if addr.ip().is_unspecified() {
                if let Err(e) = socket.inner().set_only_v6(false) {
                    debug!("dual-stack unavailable: {}", e);
                }
            }
        }

        config.socket_options.apply(&socket);
        socket.bind(candidate)?;

        if candidate.endpoint.is_multicast() {
            join_group(&socket, candidate)?;
        }

        if !config.transport.is_connectionless() {
            socket.inner().listen(1)?;
        }

        info!("receive mode: bound to {} ({})", candidate.endpoint, config.transport);
        Ok(Listener {
            socket,
            local: *candidate,
            transport: config.transport,
        })
    }

    /// 피어 하나 수락
    pub fn accept(&self, listener: Listener) -> Result<NetSocket> {
        if !listener.transport.is_connectionless() {
            let (socket, peer) = listener.socket.inner().accept()?;
            info!("accepted peer {:?}", peer.as_socket());
            return Ok(NetSocket::from(socket));
        }

        let socket = listener.socket;
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        let (_, peer) = loop {
            match socket.inner().peek_from(&mut probe) {
                Ok(found) => break found,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        socket.inner().connect(&peer)?;
        socket.inner().set_read_timeout(Some(IDLE_TIMEOUT))?;
        info!("datagram peer {:?}", peer.as_socket());
        Ok(socket)
    }

    /// 수락부터 수신 완료까지
    pub fn receive_on(&mut self, listener: Listener) -> Result<u64> {
        let datagram = listener.transport.is_connectionless();
        let mut socket = self.accept(listener)?;

        match socket.buffer_sizes() {
            Ok((send, recv)) => {
                self.stats.send_buffer = Some(send);
                self.stats.recv_buffer = Some(recv);
            }
            Err(e) => debug!("socket buffer sizes unavailable: {}", e),
        }

        let header = session::recv_header(&mut socket)?;
        if header.rtt_iterations > 0 {
            rtt::echo(&mut socket, header.rtt_iterations, header.rtt_data_size)?;
        }

        let mut output = Output::create(self.config)?;
        let received = self.receive(&header, &mut socket, &mut output, datagram);
        // 실패해도 자식은 회수
        let finished = output.finish();
        let bytes = received?;
        finished?;
        Ok(bytes)
    }

    fn receive(
        &mut self,
        header: &SessionHeader,
        socket: &mut NetSocket,
        output: &mut Output,
        datagram: bool,
    ) -> Result<u64> {
        let strategy = match Strategy::select(self.config, false) {
            Strategy::Buffered(b) if datagram && b.buffer_size < MIN_DATAGRAM_BUFFER => {
                Strategy::Buffered(Buffered::new(MIN_DATAGRAM_BUFFER, b.advice))
            }
            other => other,
        };
        debug!("io strategy: {}", strategy.name());

        let mut reader = SessionReader {
            socket,
            remaining: header.known_size(),
            datagram,
        };

        self.stats.start();
        let bytes = strategy.transfer(&mut reader, output, &mut self.stats)?;
        self.stats.finish(bytes);
        output.flush()?;

        if let Some(expected) = header.known_size() {
            if bytes != expected {
                warn!("수신 불완전: {} / {} 바이트", bytes, expected);
            }
        }
        info!("received {} bytes", bytes);
        Ok(bytes)
    }
}

/// 멀티캐스트 그룹 가입
fn join_group(socket: &NetSocket, group: &ResolvedAddress) -> Result<()> {
    let Endpoint::Ip(addr) = group.endpoint else {
        return Ok(());
    };
    let result = match addr.ip() {
        IpAddr::V4(ip) => socket
            .inner()
            .join_multicast_v4(&ip, &std::net::Ipv4Addr::UNSPECIFIED)
            .map_err(|source| Error::SocketOption {
                name: "IP_ADD_MEMBERSHIP",
                source,
            }),
        IpAddr::V6(ip) => socket
            .inner()
            .join_multicast_v6(&ip, 0)
            .map_err(|source| Error::SocketOption {
                name: "IPV6_ADD_MEMBERSHIP",
                source,
            }),
    };
    if result.is_ok() {
        info!("joined multicast group {}", addr.ip());
    }
    result
}
