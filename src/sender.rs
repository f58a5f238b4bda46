//! 송신자
//!
//! - 입력 파일(또는 표준 입력) 열기
//! - 연결 수립 후 세션 헤더, RTT 프로브
//! - 선택된 I/O 방식으로 전송
//! - 데이터그램 전송이면 길이 0 데이터그램으로 끝 알림

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd};

use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::resolve::SystemResolver;
use crate::rtt::{self, PROBE_TIMEOUT};
use crate::session::{self, SessionHeader};
use crate::stats::TransferStats;
use crate::strategy::{regular_file_size, Strategy, TransferStrategy};
use crate::transport::{self, NetSocket, NetSocketFactory};
use crate::{Error, Result};

/// 송신 입력
#[derive(Debug)]
pub enum Input {
    File(File),
    Stdin(io::Stdin),
}

impl Input {
    /// 설정의 입력 열기 (없거나 "-" 이면 표준 입력)
    pub fn open(config: &TransferConfig) -> Result<Self> {
        match &config.input {
            Some(path) if !config.reads_stdin() => File::open(path)
                .map(Input::File)
                .map_err(|source| Error::InputFile {
                    path: path.display().to_string(),
                    source,
                }),
            _ => Ok(Input::Stdin(io::stdin())),
        }
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::File(f) => f.read(buf),
            Input::Stdin(s) => s.read(buf),
        }
    }
}

impl AsFd for Input {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Input::File(f) => f.as_fd(),
            Input::Stdin(s) => s.as_fd(),
        }
    }
}

/// 송신자
pub struct Sender<'a> {
    config: &'a TransferConfig,
    stats: TransferStats,
}

impl<'a> Sender<'a> {
    /// 새 송신자 생성
    pub fn new(config: &'a TransferConfig) -> Self {
        Self {
            config,
            stats: TransferStats::new(),
        }
    }

    /// 전송 통계
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn into_stats(self) -> TransferStats {
        self.stats
    }

    /// 입력을 열고 연결해서 전송
    pub fn run(&mut self) -> Result<u64> {
        self.config.validate()?;
        let input = Input::open(self.config)?;
        info!(
            "transmit mode (file: {} - hostname: {})",
            self.config
                .input
                .as_ref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string()),
            self.config.host_name()
        );

        let established = transport::establish(self.config, &SystemResolver, &NetSocketFactory)?;
        self.send(input, established.socket)
    }

    /// 이미 연결된 소켓으로 전송
    pub fn send(&mut self, mut input: Input, mut socket: NetSocket) -> Result<u64> {
        let file_size = regular_file_size(input.as_fd())?;

        match socket.buffer_sizes() {
            Ok((send, recv)) => {
                self.stats.send_buffer = Some(send);
                self.stats.recv_buffer = Some(recv);
            }
            Err(e) => debug!("socket buffer sizes unavailable: {}", e),
        }

        let mut header = SessionHeader::new(self.config.transport, file_size);
        if let Some(spec) = &self.config.rtt {
            header = header.with_rtt(spec.iterations, spec.data_size);
        }
        session::send_header(&mut socket, &header)?;

        if let Some(spec) = &self.config.rtt {
            let previous = socket.inner().read_timeout()?;
            socket.inner().set_read_timeout(Some(PROBE_TIMEOUT))?;
            let estimate = rtt::probe(&mut socket, spec)?;
            socket.inner().set_read_timeout(previous)?;
            info!("rtt estimate: {:?}", estimate);
            self.stats.rtt = Some(estimate);
        }

        let strategy = Strategy::select(self.config, file_size.is_some());
        info!("io strategy: {}", strategy.name());

        self.stats.start();
        let bytes = strategy.transfer(&mut input, &mut socket, &mut self.stats)?;
        self.stats.finish(bytes);

        if let Some(expected) = file_size {
            if bytes != expected {
                warn!("전송 불완전: {} / {} 바이트", bytes, expected);
            }
        }

        if self.config.transport.is_connectionless() {
            if let Err(e) = socket.write(&[]) {
                warn!("스트림 끝 데이터그램 전송 실패: {}", e);
            }
        }

        info!("transmitted {} bytes", bytes);
        Ok(bytes)
    }
}
