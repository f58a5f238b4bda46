//! 세션 헤더
//!
//! 연결 직후 송신 측이 한 번 보내는 고정 크기 헤더.
//! 수신 측은 이것으로 전송 크기와 RTT 프로브 여부를 안다.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Transport, MAX_RTT_DATA_SIZE, MAX_RTT_ITERATIONS};
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 인코딩된 헤더 크기 (바이트)
pub const HEADER_LEN: usize = 27;

/// 크기를 모르는 스트림 입력
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// 데이터 뒤에 길이 0 데이터그램으로 끝을 알림
pub const FLAG_EOS_DATAGRAM: u8 = 0x01;

/// 세션 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub magic: u32,
    pub version: u8,
    /// [`Transport::wire_id`]
    pub transport: u8,
    pub flags: u8,
    /// 파일 크기 ([`UNKNOWN_SIZE`] 이면 모름)
    pub file_size: u64,
    /// RTT 프로브 횟수 (0 이면 없음)
    pub rtt_iterations: u32,
    pub rtt_data_size: u32,
    /// crc 를 0 으로 두고 인코딩한 헤더의 CRC-32
    pub crc: u32,
}

impl SessionHeader {
    pub fn new(transport: Transport, file_size: Option<u64>) -> Self {
        let flags = if transport.is_connectionless() {
            FLAG_EOS_DATAGRAM
        } else {
            0
        };
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            transport: transport.wire_id(),
            flags,
            file_size: file_size.unwrap_or(UNKNOWN_SIZE),
            rtt_iterations: 0,
            rtt_data_size: 0,
            crc: 0,
        }
    }

    /// RTT 프로브 정보 설정
    pub fn with_rtt(mut self, iterations: u32, data_size: u32) -> Self {
        self.rtt_iterations = iterations;
        self.rtt_data_size = data_size;
        self
    }

    /// 알려진 파일 크기
    pub fn known_size(&self) -> Option<u64> {
        (self.file_size != UNKNOWN_SIZE).then_some(self.file_size)
    }

    fn checksum(&self) -> Result<u32> {
        let unsealed = Self { crc: 0, ..*self };
        Ok(crc32fast::hash(&bincode::serialize(&unsealed)?))
    }

    /// CRC 를 채워 인코딩
    pub fn encode(&self) -> Result<Vec<u8>> {
        let sealed = Self {
            crc: self.checksum()?,
            ..*self
        };
        Ok(bincode::serialize(&sealed)?)
    }

    /// 디코딩 후 매직/버전/CRC 검증
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header: Self = bincode::deserialize(bytes)?;

        if header.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }

        let expected = header.checksum()?;
        if header.crc != expected {
            return Err(Error::CrcMismatch {
                expected,
                got: header.crc,
            });
        }

        // 0 이면 프로브 없음
        if header.rtt_iterations > MAX_RTT_ITERATIONS {
            return Err(Error::InvalidHeader(format!(
                "RTT 반복 횟수 {} 범위 밖 (0 ~ {})",
                header.rtt_iterations, MAX_RTT_ITERATIONS
            )));
        }
        if header.rtt_iterations > 0 && !(1..=MAX_RTT_DATA_SIZE).contains(&header.rtt_data_size) {
            return Err(Error::InvalidHeader(format!(
                "RTT 데이터 크기 {} 범위 밖 (1 ~ {})",
                header.rtt_data_size, MAX_RTT_DATA_SIZE
            )));
        }
        Ok(header)
    }
}

/// 헤더 송신
pub fn send_header<W: Write>(socket: &mut W, header: &SessionHeader) -> Result<()> {
    let bytes = header.encode()?;
    socket.write_all(&bytes)?;
    debug!(
        "session header sent (size {:?}, rtt {}x{})",
        header.known_size(),
        header.rtt_iterations,
        header.rtt_data_size
    );
    Ok(())
}

/// 헤더 수신
pub fn recv_header<R: Read>(socket: &mut R) -> Result<SessionHeader> {
    let mut buf = [0u8; HEADER_LEN];
    socket.read_exact(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => Error::Io(e),
    })?;
    let header = SessionHeader::decode(&buf)?;
    debug!("session header received: {:?}", header);
    Ok(header)
}
