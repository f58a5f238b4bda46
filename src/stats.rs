//! 전송 통계
//!
//! 전송 중에는 한 스레드만 갱신하고, 끝난 뒤 보고서로 변환한다.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::config::{ReportConfig, StatPrefix, StatUnit};
use crate::rtt::RttEstimate;

/// 전체 전송 통계
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// read(2) 호출 횟수 (버퍼 복사 방식)
    pub read_call_cnt: u64,

    /// 협상된 송신 소켓 버퍼 크기
    pub send_buffer: Option<usize>,

    /// 협상된 수신 소켓 버퍼 크기
    pub recv_buffer: Option<usize>,

    /// 시작 시간
    pub start_time: Option<Instant>,

    /// 종료 시간
    pub end_time: Option<Instant>,

    /// 총 전송 바이트
    pub total_bytes: u64,

    /// RTT 프로브 결과
    pub rtt: Option<RttEstimate>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 첫 바이트 직전
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// 마지막 바이트 직후
    pub fn finish(&mut self, bytes: u64) {
        self.end_time = Some(Instant::now());
        self.total_bytes = bytes;
    }

    /// 경과 시간 (시작/종료가 모두 기록된 경우)
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }

    /// 초당 바이트. 경과 시간이 0 이면 None.
    pub fn bytes_per_sec(&self) -> Option<f64> {
        throughput(self.total_bytes, self.elapsed()?)
    }

    /// 설정에 맞는 보고서
    pub fn report(&self, config: &ReportConfig) -> String {
        if config.machine {
            self.machine_report(config)
        } else {
            self.human_report(config)
        }
    }

    /// 사람이 읽는 여러 줄 보고서
    pub fn human_report(&self, config: &ReportConfig) -> String {
        let mut out = String::new();
        let elapsed = self.elapsed();

        let _ = writeln!(out, "# Network statistics");
        let _ = writeln!(out, "  bytes transferred: {}", self.total_bytes);
        let _ = writeln!(out, "  read calls:        {}", self.read_call_cnt);
        if let Some(size) = self.send_buffer {
            let _ = writeln!(out, "  send buffer:       {}", size);
        }
        if let Some(size) = self.recv_buffer {
            let _ = writeln!(out, "  receive buffer:    {}", size);
        }
        match elapsed {
            Some(e) => {
                let _ = writeln!(out, "  elapsed:           {:.6} s", e.as_secs_f64());
            }
            None => {
                let _ = writeln!(out, "  elapsed:           unavailable");
            }
        }

        let rate = elapsed.and_then(|e| throughput(self.total_bytes, e));
        let _ = writeln!(
            out,
            "  throughput:        {}",
            format_throughput(rate, config.unit, config.prefix)
        );

        if let Some(rtt) = &self.rtt {
            let _ = writeln!(out, "# RTT");
            let _ = writeln!(out, "  minimum:           {}", format_duration(rtt.minimum));
            let _ = writeln!(out, "  mean (retained):   {}", format_duration(rtt.mean));
            let _ = writeln!(out, "  samples:           {} retained, {} discarded", rtt.retained, rtt.discarded);
            if rtt.forced {
                let _ = writeln!(out, "  (minimum forced by user)");
            }
        }

        out
    }

    /// 기계 파싱용 한 줄 보고서 (key=value, 공백 구분)
    pub fn machine_report(&self, config: &ReportConfig) -> String {
        let mut out = String::new();
        let rate = self.bytes_per_sec();

        let _ = write!(out, "bytes={}", self.total_bytes);
        let _ = write!(out, " read_calls={}", self.read_call_cnt);
        if let Some(size) = self.send_buffer {
            let _ = write!(out, " send_buffer={}", size);
        }
        if let Some(size) = self.recv_buffer {
            let _ = write!(out, " recv_buffer={}", size);
        }
        match self.elapsed() {
            Some(e) => {
                let _ = write!(out, " elapsed_us={}", e.as_micros());
            }
            None => out.push_str(" elapsed_us=na"),
        }

        let unit_key = match config.unit {
            StatUnit::Byte => "bytes_per_sec",
            StatUnit::Bit => "bits_per_sec",
        };
        match rate {
            Some(r) => {
                let scaled = match config.unit {
                    StatUnit::Byte => r,
                    StatUnit::Bit => r * 8.0,
                };
                let _ = write!(out, " {}={:.0}", unit_key, scaled);
            }
            None => {
                let _ = write!(out, " {}=na", unit_key);
            }
        }

        if let Some(rtt) = &self.rtt {
            match rtt.minimum {
                Some(min) => {
                    let _ = write!(out, " rtt_min_us={}", min.as_micros());
                }
                None => out.push_str(" rtt_min_us=na"),
            }
            let _ = write!(
                out,
                " rtt_retained={} rtt_discarded={} rtt_forced={}",
                rtt.retained, rtt.discarded, rtt.forced as u8
            );
        }

        out
    }
}

/// 초당 바이트 (경과 시간 0 이면 None)
pub fn throughput(bytes: u64, elapsed: Duration) -> Option<f64> {
    if elapsed.is_zero() {
        return None;
    }
    Some(bytes as f64 / elapsed.as_secs_f64())
}

const BINARY_BYTE: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
const BINARY_BIT: [&str; 5] = ["bit", "Kibit", "Mibit", "Gibit", "Tibit"];
const SI_BYTE: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
const SI_BIT: [&str; 5] = ["bit", "Kbit", "Mbit", "Gbit", "Tbit"];

/// 단위/접두어에 맞춰 (값, 단위 이름)으로 변환
pub fn scale(bytes_per_sec: f64, unit: StatUnit, prefix: StatPrefix) -> (f64, &'static str) {
    let (mut value, names) = match (unit, prefix) {
        (StatUnit::Byte, StatPrefix::Binary) => (bytes_per_sec, &BINARY_BYTE),
        (StatUnit::Bit, StatPrefix::Binary) => (bytes_per_sec * 8.0, &BINARY_BIT),
        (StatUnit::Byte, StatPrefix::Si) => (bytes_per_sec, &SI_BYTE),
        (StatUnit::Bit, StatPrefix::Si) => (bytes_per_sec * 8.0, &SI_BIT),
    };
    let base = match prefix {
        StatPrefix::Binary => 1024.0,
        StatPrefix::Si => 1000.0,
    };

    let mut index = 0;
    while value >= base && index < names.len() - 1 {
        value /= base;
        index += 1;
    }
    (value, names[index])
}

/// "1.00 MiB/s" 형식. 처리율을 모르면 "unavailable".
pub fn format_throughput(bytes_per_sec: Option<f64>, unit: StatUnit, prefix: StatPrefix) -> String {
    match bytes_per_sec {
        Some(rate) if rate.is_finite() => {
            let (value, name) = scale(rate, unit, prefix);
            format!("{:.2} {}/s", value, name)
        }
        _ => "unavailable".to_string(),
    }
}

fn format_duration(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:.3} ms", d.as_secs_f64() * 1000.0),
        None => "unavailable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with(bytes: u64, elapsed: Duration) -> TransferStats {
        let start = Instant::now();
        TransferStats {
            total_bytes: bytes,
            start_time: Some(start),
            end_time: Some(start + elapsed),
            ..Default::default()
        }
    }

    #[test]
    fn test_binary_mebibyte() {
        let stats = stats_with(1_048_576, Duration::from_secs(1));
        let rate = stats.bytes_per_sec();
        assert_eq!(
            format_throughput(rate, StatUnit::Byte, StatPrefix::Binary),
            "1.00 MiB/s"
        );
    }

    #[test]
    fn test_si_scaling_differs() {
        let rate = Some(1_048_576.0);
        let binary = scale(1_048_576.0, StatUnit::Byte, StatPrefix::Binary);
        let si = scale(1_048_576.0, StatUnit::Byte, StatPrefix::Si);

        assert_eq!(binary, (1.0, "MiB"));
        assert_eq!(si.1, "MB");
        assert!((si.0 - 1.048576).abs() < 1e-9);
        assert_ne!(binary.0, si.0);
        assert_eq!(format_throughput(rate, StatUnit::Byte, StatPrefix::Si), "1.05 MB/s");
    }

    #[test]
    fn test_bits() {
        let (value, name) = scale(1_000_000.0, StatUnit::Bit, StatPrefix::Si);
        assert_eq!(name, "Mbit");
        assert!((value - 8.0).abs() < 1e-9);

        let (value, name) = scale(128.0, StatUnit::Bit, StatPrefix::Binary);
        assert_eq!(name, "Kibit");
        assert!((value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_values_stay_in_base_unit() {
        assert_eq!(scale(512.0, StatUnit::Byte, StatPrefix::Binary), (512.0, "B"));
    }

    #[test]
    fn test_zero_elapsed_unavailable() {
        let stats = stats_with(4096, Duration::ZERO);
        assert_eq!(stats.bytes_per_sec(), None);

        let config = ReportConfig::default();
        assert!(stats.human_report(&config).contains("throughput:        unavailable"));
        assert!(stats.machine_report(&config).contains("bytes_per_sec=na"));
    }

    #[test]
    fn test_never_started() {
        let stats = TransferStats::new();
        assert_eq!(stats.elapsed(), None);
        assert!(stats.machine_report(&ReportConfig::default()).contains("elapsed_us=na"));
    }

    #[test]
    fn test_machine_report_single_line() {
        let mut stats = stats_with(2048, Duration::from_secs(2));
        stats.read_call_cnt = 3;
        stats.rtt = Some(RttEstimate {
            minimum: Some(Duration::from_millis(25)),
            mean: None,
            retained: 0,
            discarded: 0,
            forced: true,
        });

        let config = ReportConfig {
            machine: true,
            unit: StatUnit::Bit,
            ..Default::default()
        };
        let line = stats.report(&config);

        assert!(!line.contains('\n'));
        assert!(line.contains("bytes=2048"));
        assert!(line.contains("read_calls=3"));
        assert!(line.contains("bits_per_sec=8192"));
        assert!(line.contains("rtt_min_us=25000"));
        assert!(line.contains("rtt_forced=1"));
    }
}
