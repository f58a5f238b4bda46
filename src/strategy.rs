//! I/O 전송 방식
//!
//! 네 가지 방식이 같은 계약(`transfer(source, sink) -> 전송 바이트`)을 따른다.
//!
//! | 방식 | 부분 쓰기 | 실패 처리 |
//! |------|-----------|-----------|
//! | [`Buffered`] | 다 쓸 때까지 반복 | EINTR 외 쓰기 에러 시 보낸 만큼 반환 |
//! | [`Mapped`] | 재시도 없음 | 짧은 쓰기는 에러 로그 후 반환 |
//! | [`KernelCopy`] | 재시도 없음 | 짧은 전송은 에러 |
//! | [`Splice`] | 파이프 경유 반복 | 짧은 전송은 에러 |

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use memmap2::MmapOptions;
use tracing::{debug, error, warn};

use crate::config::{IoStrategy, MemAdvice, TransferConfig, WorkMode};
use crate::stats::TransferStats;
use crate::{Error, Result, DEFAULT_BUFFER_SIZE};

/// UDP 데이터그램 하나에 실을 수 있는 최대 페이로드 (IPv4)
pub const MAX_DATAGRAM_PAYLOAD: usize = 65507;

/// 전송 방식 공통 계약
pub trait TransferStrategy {
    /// 로그용 이름
    fn name(&self) -> &'static str;

    /// source 의 바이트를 sink 로 옮기고 옮긴 바이트 수를 반환
    fn transfer<R, W>(&self, source: &mut R, sink: &mut W, stats: &mut TransferStats) -> Result<u64>
    where
        R: Read + AsFd,
        W: Write + AsFd;
}

/// 일반 파일이면 크기, 아니면 None
pub fn regular_file_size(fd: BorrowedFd<'_>) -> io::Result<Option<u64>> {
    // SAFETY: stat 은 POD 이며 fstat 이 채운다.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd 는 호출 동안 유효하다.
    let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if st.st_mode & libc::S_IFMT == libc::S_IFREG {
        Ok(Some(st.st_size as u64))
    } else {
        Ok(None)
    }
}

/// 0 으로 채운 버퍼를 실패 가능한 할당으로 만든다
pub fn zeroed_buffer(size: usize) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| Error::OutOfMemory { size })?;
    buf.resize(size, 0);
    Ok(buf)
}

fn fadvise_flag(advice: MemAdvice) -> libc::c_int {
    match advice {
        MemAdvice::Normal => libc::POSIX_FADV_NORMAL,
        MemAdvice::Sequential => libc::POSIX_FADV_SEQUENTIAL,
        MemAdvice::Random => libc::POSIX_FADV_RANDOM,
        MemAdvice::WillNeed => libc::POSIX_FADV_WILLNEED,
        MemAdvice::DontNeed => libc::POSIX_FADV_DONTNEED,
        MemAdvice::NoReuse => libc::POSIX_FADV_NOREUSE,
    }
}

/// 매핑에는 NOREUSE 가 없어 WILLNEED 로 대신한다
fn madvise_flag(advice: MemAdvice) -> libc::c_int {
    match advice {
        MemAdvice::Normal => libc::POSIX_MADV_NORMAL,
        MemAdvice::Sequential => libc::POSIX_MADV_SEQUENTIAL,
        MemAdvice::Random => libc::POSIX_MADV_RANDOM,
        MemAdvice::WillNeed | MemAdvice::NoReuse => libc::POSIX_MADV_WILLNEED,
        MemAdvice::DontNeed => libc::POSIX_MADV_DONTNEED,
    }
}

/// read/write 버퍼 복사
#[derive(Debug, Clone, Copy)]
pub struct Buffered {
    pub buffer_size: usize,
    pub advice: Option<MemAdvice>,
}

impl Buffered {
    /// buffer_size 0 이면 기본값
    pub fn new(buffer_size: usize, advice: Option<MemAdvice>) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        Self { buffer_size, advice }
    }

    /// 소스에 파일 접근 힌트 적용 (실패는 경고만)
    fn advise(&self, source: BorrowedFd<'_>) {
        let Some(advice) = self.advice else {
            return;
        };
        // 소켓이나 파이프에는 파일 힌트가 의미 없다 (ESPIPE)
        if !matches!(regular_file_size(source), Ok(Some(_))) {
            debug!("source is not a regular file, posix_fadvise skipped");
            return;
        }
        // SAFETY: fd 는 호출 동안 유효하다.
        let ret = unsafe { libc::posix_fadvise(source.as_raw_fd(), 0, 0, fadvise_flag(advice)) };
        if ret != 0 {
            warn!("posix_fadvise 실패: {}", io::Error::from_raw_os_error(ret));
        } else {
            debug!("posix_fadvise {:?} applied", advice);
        }
    }

    /// sink 가 fd 를 갖지 않아도 되는 복사 루프
    pub fn copy<R, W>(&self, source: &mut R, sink: &mut W, stats: &mut TransferStats) -> Result<u64>
    where
        R: Read + AsFd,
        W: Write + ?Sized,
    {
        let mut buf = zeroed_buffer(self.buffer_size)?;

        self.advise(source.as_fd());

        let mut total: u64 = 0;
        loop {
            let read = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            stats.read_call_cnt += 1;

            let mut chunk = &buf[..read];
            while !chunk.is_empty() {
                match sink.write(chunk) {
                    Ok(0) => {
                        warn!("write 가 0 바이트를 반환, {} 바이트에서 중단", total);
                        return Ok(total);
                    }
                    Ok(n) => {
                        chunk = &chunk[n..];
                        total += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("write 실패, {} 바이트에서 중단: {}", total, e);
                        return Ok(total);
                    }
                }
            }
        }

        Ok(total)
    }
}

impl Default for Buffered {
    fn default() -> Self {
        Self::new(0, None)
    }
}

impl TransferStrategy for Buffered {
    fn name(&self) -> &'static str {
        "rw"
    }

    fn transfer<R, W>(&self, source: &mut R, sink: &mut W, stats: &mut TransferStats) -> Result<u64>
    where
        R: Read + AsFd,
        W: Write + AsFd,
    {
        self.copy(source, sink, stats)
    }
}

/// 파일 전체를 매핑하고 한 번에 write
#[derive(Debug, Clone, Copy, Default)]
pub struct Mapped {
    pub advice: Option<MemAdvice>,
}

impl TransferStrategy for Mapped {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn transfer<R, W>(&self, source: &mut R, sink: &mut W, stats: &mut TransferStats) -> Result<u64>
    where
        R: Read + AsFd,
        W: Write + AsFd,
    {
        let fd = source.as_fd();
        let size = regular_file_size(fd)?
            .ok_or_else(|| Error::Internal("mmap 방식에 일반 파일이 아닌 입력".into()))?;
        if size == 0 {
            return Ok(0);
        }
        let len = usize::try_from(size).map_err(|_| Error::OutOfMemory { size: usize::MAX })?;

        // SAFETY: 읽기 전용 매핑이며 전송 동안 파일을 자르지 않는다고 가정한다.
        let mmap = match unsafe { MmapOptions::new().len(len).map(fd.as_raw_fd()) } {
            Ok(mmap) => mmap,
            Err(e) => {
                error!("mmap 실패 ({} 바이트): {}", len, e);
                return Ok(0);
            }
        };
        stats.read_call_cnt += 1;

        if let Some(advice) = self.advice {
            // SAFETY: 매핑 범위 전체에 대한 힌트
            let ret = unsafe {
                libc::posix_madvise(mmap.as_ptr() as *mut libc::c_void, len, madvise_flag(advice))
            };
            if ret != 0 {
                warn!("posix_madvise 실패: {}", io::Error::from_raw_os_error(ret));
            }
        }

        let written = loop {
            match sink.write(&mmap) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("매핑 write 실패: {}", e);
                    break 0;
                }
            }
        };
        if written != len {
            error!("write 한 번에 매핑을 모두 보내지 못함: {} / {} 바이트", written, len);
        }

        Ok(written as u64)
    }
}

/// 커널 복사 함수 (out_fd, in_fd, offset, count) -> 옮긴 바이트
pub type CopyPrimitive = fn(RawFd, RawFd, &mut libc::off_t, usize) -> io::Result<usize>;

fn sendfile_primitive(out_fd: RawFd, in_fd: RawFd, offset: &mut libc::off_t, count: usize) -> io::Result<usize> {
    // SAFETY: 두 fd 는 호출 동안 유효하며 offset 은 유효한 포인터다.
    let ret = unsafe { libc::sendfile(out_fd, in_fd, offset, count) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// sendfile(2) 한 번으로 파일 전체 전송
#[derive(Clone, Copy)]
pub struct KernelCopy {
    call: &'static str,
    primitive: CopyPrimitive,
}

impl KernelCopy {
    pub fn sendfile() -> Self {
        Self {
            call: "sendfile",
            primitive: sendfile_primitive,
        }
    }

    /// 다른 복사 함수 사용
    pub fn with_primitive(call: &'static str, primitive: CopyPrimitive) -> Self {
        Self { call, primitive }
    }
}

impl std::fmt::Debug for KernelCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCopy").field("call", &self.call).finish()
    }
}

impl TransferStrategy for KernelCopy {
    fn name(&self) -> &'static str {
        self.call
    }

    fn transfer<R, W>(&self, source: &mut R, sink: &mut W, _stats: &mut TransferStats) -> Result<u64>
    where
        R: Read + AsFd,
        W: Write + AsFd,
    {
        let in_fd = source.as_fd();
        let size = regular_file_size(in_fd)?
            .ok_or_else(|| Error::Internal(format!("{} 방식에 일반 파일이 아닌 입력", self.call)))?;

        let mut offset: libc::off_t = 0;
        let moved = (self.primitive)(sink.as_fd().as_raw_fd(), in_fd.as_raw_fd(), &mut offset, size as usize)
            .map_err(|source| Error::KernelCopy {
                call: self.call,
                source,
            })?;

        if moved as u64 != size {
            return Err(Error::ShortTransfer {
                call: self.call,
                moved: moved as u64,
                expected: size,
            });
        }
        Ok(moved as u64)
    }
}

/// 파이프를 거치는 splice(2)
#[derive(Debug, Clone, Copy)]
pub struct Splice {
    /// 한 번에 옮길 최대 바이트
    pub chunk: usize,
}

impl Default for Splice {
    fn default() -> Self {
        Self { chunk: 64 * 1024 }
    }
}

fn splice_once(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
    loop {
        // SAFETY: 두 fd 는 유효하며 offset 은 현재 위치를 사용한다.
        let ret = unsafe {
            libc::splice(
                from,
                std::ptr::null_mut(),
                to,
                std::ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_MORE,
            )
        };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds 는 두 개의 fd 를 담을 수 있다.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 가 성공하면 두 fd 의 소유권은 여기로 넘어온다.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

impl TransferStrategy for Splice {
    fn name(&self) -> &'static str {
        "splice"
    }

    fn transfer<R, W>(&self, source: &mut R, sink: &mut W, _stats: &mut TransferStats) -> Result<u64>
    where
        R: Read + AsFd,
        W: Write + AsFd,
    {
        let in_fd = source.as_fd();
        let size = regular_file_size(in_fd)?
            .ok_or_else(|| Error::Internal("splice 방식에 일반 파일이 아닌 입력".into()))?;
        let out_fd = sink.as_fd().as_raw_fd();
        let kernel_error = |source| Error::KernelCopy { call: "splice", source };

        let (pipe_rd, pipe_wr) = pipe().map_err(kernel_error)?;

        let mut moved: u64 = 0;
        while moved < size {
            let want = (size - moved).min(self.chunk as u64) as usize;
            let filled = splice_once(in_fd.as_raw_fd(), pipe_wr.as_raw_fd(), want).map_err(kernel_error)?;
            if filled == 0 {
                break;
            }

            let mut pending = filled;
            while pending > 0 {
                let sent = splice_once(pipe_rd.as_raw_fd(), out_fd, pending).map_err(kernel_error)?;
                if sent == 0 {
                    return Err(Error::ShortTransfer {
                        call: "splice",
                        moved,
                        expected: size,
                    });
                }
                pending -= sent;
                moved += sent as u64;
            }
        }

        if moved != size {
            return Err(Error::ShortTransfer {
                call: "splice",
                moved,
                expected: size,
            });
        }
        Ok(moved)
    }
}

/// 설정 시점에 한 번 고르는 전송 방식
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    Buffered(Buffered),
    Mapped(Mapped),
    KernelCopy(KernelCopy),
    Splice(Splice),
}

impl Strategy {
    /// 모드와 입력 종류에 맞는 방식 선택
    ///
    /// 수신 모드와 일반 파일이 아닌 입력(표준 입력, 파이프)은 항상 read/write 로 바꾼다.
    /// 데이터그램 전송은 write 한 번이 데이터그램 하나이므로 버퍼를
    /// [`MAX_DATAGRAM_PAYLOAD`] 이하로 제한한 read/write 만 쓴다.
    /// 송신 모드의 `read` 는 기본값(sendfile)으로 취급한다.
    pub fn select(config: &TransferConfig, source_is_regular: bool) -> Self {
        let buffered = Strategy::Buffered(Buffered::new(config.buffer_size, config.mem_advice));

        if config.mode == WorkMode::Receive {
            if !matches!(config.io, IoStrategy::Read | IoStrategy::Rw) {
                debug!("receive mode uses read/write instead of {}", config.io.name());
            }
            return buffered;
        }

        if config.transport.is_connectionless() {
            if config.io != IoStrategy::Rw {
                debug!("{} over {} replaced by rw", config.io.name(), config.transport);
            }
            let size = Buffered::new(config.buffer_size, config.mem_advice).buffer_size;
            if size > MAX_DATAGRAM_PAYLOAD {
                warn!("buffer size {} exceeds datagram payload, using {}", size, MAX_DATAGRAM_PAYLOAD);
            }
            return Strategy::Buffered(Buffered::new(size.min(MAX_DATAGRAM_PAYLOAD), config.mem_advice));
        }

        if !source_is_regular && config.io != IoStrategy::Rw {
            debug!("input is not a regular file, {} replaced by rw", config.io.name());
            return buffered;
        }

        match config.io {
            IoStrategy::Rw => buffered,
            IoStrategy::Mmap => Strategy::Mapped(Mapped {
                advice: config.mem_advice,
            }),
            IoStrategy::Sendfile | IoStrategy::Read => Strategy::KernelCopy(KernelCopy::sendfile()),
            IoStrategy::Splice => Strategy::Splice(Splice::default()),
        }
    }
}

impl TransferStrategy for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Buffered(s) => s.name(),
            Strategy::Mapped(s) => s.name(),
            Strategy::KernelCopy(s) => s.name(),
            Strategy::Splice(s) => s.name(),
        }
    }

    fn transfer<R, W>(&self, source: &mut R, sink: &mut W, stats: &mut TransferStats) -> Result<u64>
    where
        R: Read + AsFd,
        W: Write + AsFd,
    {
        match self {
            Strategy::Buffered(s) => s.transfer(source, sink, stats),
            Strategy::Mapped(s) => s.transfer(source, sink, stats),
            Strategy::KernelCopy(s) => s.transfer(source, sink, stats),
            Strategy::Splice(s) => s.transfer(source, sink, stats),
        }
    }
}
