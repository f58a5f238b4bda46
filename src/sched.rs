//! 프로세스 스케줄링 조정
//!
//! 전송 전에 한 번 적용하며 실패해도 전송은 계속한다.

use std::io;
use std::str::FromStr;

use tracing::{info, warn};

use crate::{Error, Result};

/// 스케줄링 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Other,
    Fifo,
    RoundRobin,
    Batch,
}

impl SchedPolicy {
    pub fn raw(&self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Batch => libc::SCHED_BATCH,
        }
    }
}

impl FromStr for SchedPolicy {
    type Err = Error;

    /// `SCHED_FIFO` 또는 `fifo` (대소문자 무시)
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.strip_prefix("sched_").unwrap_or(&lower) {
            "other" => Ok(SchedPolicy::Other),
            "fifo" => Ok(SchedPolicy::Fifo),
            "rr" => Ok(SchedPolicy::RoundRobin),
            "batch" => Ok(SchedPolicy::Batch),
            _ => Err(Error::InvalidConfig(format!(
                "스케줄링 정책 \"{}\" 은(는) 지원하지 않음 (SCHED_OTHER, SCHED_FIFO, SCHED_RR, SCHED_BATCH)",
                s
            ))),
        }
    }
}

/// 정책 내 우선순위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPriority {
    Max,
    Min,
}

impl FromStr for SchedPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(SchedPriority::Max),
            "min" => Ok(SchedPriority::Min),
            _ => Err(Error::InvalidConfig(format!(
                "스케줄링 우선순위 \"{}\" 은(는) 지원하지 않음 (MAX, MIN)",
                s
            ))),
        }
    }
}

/// 정책의 실제 우선순위 값
pub fn priority_value(policy: SchedPolicy, priority: SchedPriority) -> io::Result<i32> {
    // SAFETY: 단순 조회 syscall
    let value = unsafe {
        match priority {
            SchedPriority::Max => libc::sched_get_priority_max(policy.raw()),
            SchedPriority::Min => libc::sched_get_priority_min(policy.raw()),
        }
    };
    if value < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(value)
    }
}

/// 프로세스 조정 요청
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessTuning {
    pub scheduler: Option<(SchedPolicy, SchedPriority)>,
    /// nice 증가분
    pub nice: Option<i32>,
}

impl ProcessTuning {
    /// 요청된 항목 적용 (실패는 경고만)
    pub fn apply(&self) {
        if let Some((policy, priority)) = self.scheduler {
            match set_scheduler(policy, priority) {
                Ok(value) => info!("scheduler set to {:?} priority {}", policy, value),
                Err(e) => warn!("sched_setscheduler 실패: {}", e),
            }
        }

        if let Some(inc) = self.nice {
            match set_nice(inc) {
                Ok(value) => info!("nice value now {}", value),
                Err(e) => warn!("nice 실패: {}", e),
            }
        }
    }
}

fn set_scheduler(policy: SchedPolicy, priority: SchedPriority) -> io::Result<i32> {
    let value = priority_value(policy, priority)?;
    let param = libc::sched_param {
        sched_priority: value,
    };
    // SAFETY: param 은 호출 동안 유효하다.
    if unsafe { libc::sched_setscheduler(0, policy.raw(), &param) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn set_nice(inc: i32) -> io::Result<i32> {
    // nice(2) 는 -1 을 정상값으로도 돌려주므로 errno 로 구분한다
    // SAFETY: 현재 스레드의 errno 위치
    unsafe { *libc::__errno_location() = 0 };
    // SAFETY: 단순 syscall
    let value = unsafe { libc::nice(inc) };
    if value == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(0) {
            return Err(err);
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_names() {
        assert_eq!("SCHED_FIFO".parse::<SchedPolicy>().unwrap(), SchedPolicy::Fifo);
        assert_eq!("sched_rr".parse::<SchedPolicy>().unwrap(), SchedPolicy::RoundRobin);
        assert_eq!("batch".parse::<SchedPolicy>().unwrap(), SchedPolicy::Batch);
        let err = "SCHED_IDLE".parse::<SchedPolicy>().unwrap_err();
        assert!(err.to_string().contains("SCHED_IDLE"));
    }

    #[test]
    fn test_priority_range() {
        let max = priority_value(SchedPolicy::Fifo, SchedPriority::Max).unwrap();
        let min = priority_value(SchedPolicy::Fifo, SchedPriority::Min).unwrap();
        assert!(max > min);
        assert_eq!(priority_value(SchedPolicy::Other, SchedPriority::Max).unwrap(), 0);
        assert!("mid".parse::<SchedPriority>().is_err());
    }

    #[test]
    fn test_nice_zero_is_noop() {
        assert!(set_nice(0).is_ok());
    }
}
