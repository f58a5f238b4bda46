//! TCP 혼잡 제어 알고리즘 선택
//!
//! 사용자 입력을 알려진 알고리즘 이름에 매핑하고,
//! 레지스트리의 문자열 옵션 경로(TCP_CONGESTION)로 적용한다.

use std::fmt;
use std::io;

use tracing::info;

use crate::sockopt::{self, OptionSink, OptionValue, SocketOptionRegistry};
use crate::{Error, Result};

/// 알려진 알고리즘 이름 (커널 모듈 이름)
pub const KNOWN_ALGORITHMS: &[&str] = &[
    "bic",
    "cubic",
    "highspeed",
    "htcp",
    "hybla",
    "illinois",
    "lp",
    "reno",
    "scalable",
    "vegas",
    "veno",
    "westwood",
    "yeah",
];

/// 선택된 혼잡 제어 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionAlgorithm(&'static str);

impl CongestionAlgorithm {
    /// 대소문자 무시, 유일한 접두어 허용
    ///
    /// 정확히 일치하는 이름이 우선이고, 그 외에는 입력이 정확히 하나의 이름의
    /// 접두어여야 한다. 일치가 없거나 둘 이상이면 설정 에러.
    pub fn select(input: &str) -> Result<Self> {
        let wanted = input.trim().to_ascii_lowercase();
        if wanted.is_empty() {
            return Err(Error::UnknownCongestion(input.to_string()));
        }

        if let Some(&exact) = KNOWN_ALGORITHMS.iter().find(|&&name| name == wanted) {
            return Ok(Self(exact));
        }

        let mut matches = KNOWN_ALGORITHMS
            .iter()
            .filter(|name| name.starts_with(wanted.as_str()));

        match (matches.next(), matches.next()) {
            (Some(&name), None) => Ok(Self(name)),
            _ => Err(Error::UnknownCongestion(input.to_string())),
        }
    }

    /// 커널에 전달할 이름
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for CongestionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// 연결된 TCP 소켓에 알고리즘 적용
pub fn apply<S: OptionSink + ?Sized>(socket: &S, algorithm: CongestionAlgorithm) -> io::Result<()> {
    let mut registry = SocketOptionRegistry::default();
    registry
        .request_value("TCP_CONGESTION", OptionValue::Str(algorithm.name().to_string()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let descriptor = registry
        .get("TCP_CONGESTION")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "TCP_CONGESTION"))?;

    sockopt::apply_descriptor(socket, descriptor)?;
    info!("congestion control set to {}", algorithm);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockopt::tests::RecordingSink;

    #[test]
    fn test_exact_match_case_insensitive() {
        assert_eq!(CongestionAlgorithm::select("CUBIC").unwrap().name(), "cubic");
        assert_eq!(CongestionAlgorithm::select("Reno").unwrap().name(), "reno");
    }

    #[test]
    fn test_unambiguous_prefix() {
        assert_eq!(CongestionAlgorithm::select("hi").unwrap().name(), "highspeed");
        assert_eq!(CongestionAlgorithm::select("ht").unwrap().name(), "htcp");
        assert_eq!(CongestionAlgorithm::select("W").unwrap().name(), "westwood");
        assert_eq!(CongestionAlgorithm::select("veg").unwrap().name(), "vegas");
    }

    #[test]
    fn test_ambiguous_prefix_rejected() {
        // highspeed, htcp, hybla
        assert!(CongestionAlgorithm::select("h").is_err());
        // vegas, veno
        assert!(CongestionAlgorithm::select("ve").is_err());
    }

    #[test]
    fn test_unknown_names_input() {
        let err = CongestionAlgorithm::select("tahoe").unwrap_err();
        assert!(matches!(err, Error::UnknownCongestion(ref s) if s == "tahoe"));
        assert_eq!(err.exit_class(), crate::ExitClass::Option);
        assert!(CongestionAlgorithm::select("").is_err());
        assert!(CongestionAlgorithm::select("cubicx").is_err());
    }

    #[test]
    fn test_apply_uses_string_option() {
        let sink = RecordingSink::default();
        let algorithm = CongestionAlgorithm::select("bic").unwrap();

        apply(&sink, algorithm).unwrap();

        let calls = sink.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, libc::SOL_TCP);
        assert_eq!(calls[0].1, libc::TCP_CONGESTION);
        assert_eq!(calls[0].2, OptionValue::Str("bic".into()));
    }
}
