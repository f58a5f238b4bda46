//! RTT 프로브
//!
//! 연결된 소켓으로 고정 크기 프로브를 보내고 에코를 기다려 왕복 시간을 잰다.
//! 최소값을 기준으로 편차 필터를 넘는 샘플은 이상치로 버린다.
//! 보고값은 평균이 아니라 경로의 기본 지연(최소 RTT)이다.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, trace, warn};

use crate::config::RttProbeSpec;
use crate::strategy::zeroed_buffer;
use crate::Result;

/// 프로브 에코 대기 시간
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// 프로브 앞머리의 순번 태그 크기
const SEQ_LEN: usize = 4;

/// 편차 필터
#[derive(Debug, Clone)]
pub struct RttFilter {
    /// 허용 편차 (퍼센트)
    deviation_filter: u32,
    minimum: Option<Duration>,
    retained: Vec<Duration>,
    discarded: u32,
}

impl RttFilter {
    pub fn new(deviation_filter: u32) -> Self {
        Self {
            deviation_filter,
            minimum: None,
            retained: Vec::new(),
            discarded: 0,
        }
    }

    /// 현재 기준 최소값
    pub fn minimum(&self) -> Option<Duration> {
        self.minimum
    }

    /// 샘플 추가. 버려지면 false.
    pub fn push(&mut self, sample: Duration) -> bool {
        if let Some(min) = self.minimum {
            let limit = min.as_nanos() * (100 + u128::from(self.deviation_filter)) / 100;
            if sample.as_nanos() > limit {
                trace!("rtt sample {:?} discarded (limit {}ns)", sample, limit);
                self.discarded += 1;
                return false;
            }
        }

        if self.minimum.map_or(true, |min| sample < min) {
            self.minimum = Some(sample);
        }
        self.retained.push(sample);
        true
    }

    /// 응답 없는 프로브
    pub fn push_timeout(&mut self) {
        self.discarded += 1;
    }

    /// 최종 추정값. `force_ms` 가 0 이 아니면 측정값 대신 사용.
    pub fn finish(self, force_ms: u64) -> RttEstimate {
        let mean = if self.retained.is_empty() {
            None
        } else {
            let total: Duration = self.retained.iter().sum();
            Some(total / self.retained.len() as u32)
        };

        let forced = force_ms > 0;
        let minimum = if forced {
            Some(Duration::from_millis(force_ms))
        } else {
            self.minimum
        };

        RttEstimate {
            minimum,
            mean,
            retained: self.retained.len() as u32,
            discarded: self.discarded,
            forced,
        }
    }
}

/// RTT 추정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimate {
    /// 보고할 최소 RTT (샘플이 하나도 없으면 None)
    pub minimum: Option<Duration>,
    /// 남은 샘플 평균
    pub mean: Option<Duration>,
    pub retained: u32,
    pub discarded: u32,
    /// 사용자가 강제한 값인지
    pub forced: bool,
}

/// 송신 측 프로브
///
/// 소켓의 읽기 타임아웃은 호출자가 [`PROBE_TIMEOUT`] 으로 맞춰 둔다.
pub fn probe<S: Read + Write>(socket: &mut S, spec: &RttProbeSpec) -> Result<RttEstimate> {
    let size = spec.data_size as usize;
    let mut payload = zeroed_buffer(size)?;
    let mut echo = zeroed_buffer(size)?;
    let mut filter = RttFilter::new(spec.deviation_filter);
    let mut rng = rand::thread_rng();
    // 타임아웃으로 끊긴 에코의 이미 받은 바이트 수
    let mut filled = 0usize;

    for seq in 0..spec.iterations {
        rng.fill_bytes(&mut payload);
        if size >= SEQ_LEN {
            payload[..SEQ_LEN].copy_from_slice(&seq.to_le_bytes());
        }

        let start = Instant::now();
        socket.write_all(&payload)?;

        match read_echo(socket, &mut echo, &mut filled, seq) {
            Ok(()) => {
                let sample = start.elapsed();
                if echo != payload {
                    warn!("rtt probe {} echo mismatch", seq);
                    filter.push_timeout();
                    continue;
                }
                let kept = filter.push(sample);
                debug!("rtt probe {}: {:?}{}", seq, sample, if kept { "" } else { " (discarded)" });
            }
            Err(e) if is_timeout(&e) => {
                warn!("rtt probe {} 응답 없음 ({:?})", seq, PROBE_TIMEOUT);
                filter.push_timeout();
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(filter.finish(spec.force_ms))
}

/// 현재 순번의 에코를 읽는다 (지연 도착한 이전 에코는 건너뜀)
///
/// 타임아웃 시 받은 만큼은 `filled` 에 남겨 두고, 다음 호출이 이어서 채운다.
/// 그래서 스트림 전송에서 에코 경계가 어긋나지 않는다.
fn read_echo<S: Read>(socket: &mut S, echo: &mut [u8], filled: &mut usize, seq: u32) -> io::Result<()> {
    loop {
        while *filled < echo.len() {
            match socket.read(&mut echo[*filled..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => *filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        *filled = 0;

        if echo.len() < SEQ_LEN {
            return Ok(());
        }
        let mut tag = [0u8; SEQ_LEN];
        tag.copy_from_slice(&echo[..SEQ_LEN]);
        if u32::from_le_bytes(tag) >= seq {
            return Ok(());
        }
        trace!("stale rtt echo {} skipped", u32::from_le_bytes(tag));
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// 수신 측 에코. 받은 프로브를 그대로 돌려보낸다.
pub fn echo<S: Read + Write>(socket: &mut S, iterations: u32, data_size: u32) -> Result<u32> {
    let mut buf = zeroed_buffer(data_size as usize)?;
    for _ in 0..iterations {
        socket.read_exact(&mut buf)?;
        socket.write_all(&buf)?;
    }
    debug!("echoed {} rtt probe(s) of {} bytes", iterations, data_size);
    Ok(iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_filter_discards_outlier() {
        let mut filter = RttFilter::new(10);
        for sample in [50, 200, 48, 47] {
            filter.push(ms(sample));
        }
        let estimate = filter.finish(0);

        assert_eq!(estimate.minimum, Some(ms(47)));
        assert_eq!(estimate.retained, 3);
        assert_eq!(estimate.discarded, 1);
        assert!(!estimate.forced);
    }

    #[test]
    fn test_filter_boundary() {
        let mut filter = RttFilter::new(10);
        assert!(filter.push(ms(100)));
        assert!(filter.push(ms(110)));
        assert!(!filter.push(Duration::from_micros(110_001)));
    }

    #[test]
    fn test_force_overrides_measurement() {
        let mut filter = RttFilter::new(10);
        for sample in [3, 4, 900] {
            filter.push(ms(sample));
        }
        assert_eq!(filter.finish(25).minimum, Some(ms(25)));

        let empty = RttFilter::new(0).finish(25);
        assert_eq!(empty.minimum, Some(ms(25)));
        assert!(empty.forced);
    }

    #[test]
    fn test_zero_filter_keeps_only_new_minimums() {
        let mut filter = RttFilter::new(0);
        assert!(filter.push(ms(10)));
        assert!(!filter.push(ms(11)));
        assert!(filter.push(ms(10)));
        assert!(filter.push(ms(9)));
        assert_eq!(filter.minimum(), Some(ms(9)));
    }

    /// 쓴 데이터를 그대로 읽어 주는 루프백
    #[derive(Default)]
    struct Loopback {
        pending: VecDeque<u8>,
        writes: usize,
        drop_write: Option<usize>,
        /// 한 번만: 이 바이트 수만 주고 다음 read 는 타임아웃
        stall_after: Option<usize>,
        stalled: bool,
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            if self.drop_write != Some(self.writes) {
                self.pending.extend(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() || self.stalled {
                self.stalled = false;
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let mut n = buf.len().min(self.pending.len());
            if let Some(limit) = self.stall_after.take() {
                n = n.min(limit);
                self.stalled = true;
            }
            for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    #[test]
    fn test_probe_over_loopback() {
        let spec = RttProbeSpec {
            iterations: 5,
            data_size: 64,
            deviation_filter: 50,
            force_ms: 0,
        };
        let mut socket = Loopback::default();
        let estimate = probe(&mut socket, &spec).unwrap();

        assert_eq!(estimate.retained + estimate.discarded, 5);
        assert!(estimate.minimum.is_some());
        assert!(socket.pending.is_empty());
    }

    #[test]
    fn test_lost_probe_counted_as_discarded() {
        let spec = RttProbeSpec {
            iterations: 3,
            data_size: 16,
            deviation_filter: 50,
            force_ms: 0,
        };
        let mut socket = Loopback {
            drop_write: Some(2),
            ..Default::default()
        };
        let estimate = probe(&mut socket, &spec).unwrap();

        assert!(estimate.discarded >= 1);
        assert!(estimate.retained >= 1);
    }

    #[test]
    fn test_partial_echo_keeps_stream_aligned() {
        let spec = RttProbeSpec {
            iterations: 3,
            data_size: 16,
            deviation_filter: 50,
            force_ms: 0,
        };
        let mut socket = Loopback {
            stall_after: Some(5),
            ..Default::default()
        };
        let estimate = probe(&mut socket, &spec).unwrap();

        // 첫 프로브만 타임아웃, 이후 에코는 제자리에서 읽힌다
        assert!(estimate.discarded >= 1);
        assert!(estimate.retained >= 1);
        assert_eq!(estimate.retained + estimate.discarded, 3);
        assert!(socket.pending.is_empty());
    }

    #[test]
    fn test_echo_returns_payload() {
        let mut socket = Loopback::default();
        socket.pending.extend([1u8, 2, 3, 4, 5, 6]);
        assert_eq!(echo(&mut socket, 2, 3).unwrap(), 2);
        assert_eq!(socket.pending.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
    }
}
