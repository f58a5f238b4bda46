//! netsend - 파일 전송 및 네트워크 진단 도구
//!
//! 사용법:
//!   netsend [OPTIONS] -t <input-file> <hostname>
//!   netsend [OPTIONS] -r [output-file] [multicast-group]
//!
//! 예시:
//!   # 수신 (표준 출력으로)
//!   netsend -r
//!
//!   # 수신 데이터를 압축해 저장
//!   netsend -r -E 'gzip > data.gz'
//!
//!   # TCP + sendfile 송신, 통계 출력
//!   netsend -T -t data.bin 192.168.1.10
//!
//!   # UDP-Lite, 체크섬 범위 8, RTT 프로브
//!   netsend -m udplite -U 8 -u rw -R 20n,1000d -t data.bin host

use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use netsend::config::{StatPrefix, StatUnit};
use netsend::fabric::FabricSocketType;
use netsend::sched::{ProcessTuning, SchedPolicy, SchedPriority};
use netsend::{
    AddressFamily, CongestionAlgorithm, Error, ExitClass, IoStrategy, MemAdvice, Receiver, Result,
    RttProbeSpec, Sender, TransferConfig, TransferStats, Transport, WorkMode,
};

#[derive(Parser, Debug)]
#[command(name = "netsend", version, about = "high performance file transfer and diagnostic tool")]
struct Cli {
    /// 송신 모드: <input-file> <hostname> ("-" 는 표준 입력)
    #[arg(short = 't', conflicts_with = "receive", required_unless_present = "receive")]
    transmit: bool,

    /// 수신 모드: [output-file] [multicast-group]
    #[arg(short = 'r')]
    receive: bool,

    /// 모드별 위치 인자
    #[arg(value_name = "ARGS", num_args = 0..=2)]
    args: Vec<String>,

    /// 수신 데이터를 표준 입력으로 받을 명령 (수신 모드)
    #[arg(short = 'E', value_name = "COMMAND", requires = "receive")]
    exec: Option<String>,

    /// 프로토콜 (tcp, udp, udplite, sctp, dccp, tipc)
    #[arg(short = 'm', default_value = "tcp")]
    protocol: String,

    /// TIPC 소켓 타입 (rdm, dgram, stream, seqpacket)
    #[arg(long = "tipc-type", value_name = "TYPE")]
    tipc_type: Option<String>,

    /// 포트
    #[arg(short = 'p', default_value = netsend::DEFAULT_PORT)]
    port: String,

    /// I/O 방식 (sendfile, mmap, rw, read, splice)
    #[arg(short = 'u', value_name = "IO_CALL")]
    io: Option<String>,

    /// 버퍼 크기 (바이트)
    #[arg(short = 'N', value_parser = clap::value_parser!(u64).range(1..))]
    buffer_size: Option<u64>,

    /// 소켓 옵션: NAME VALUE (반복 가능)
    #[arg(short = 'o', num_args = 2, value_names = ["NAME", "VALUE"], action = ArgAction::Append)]
    sockopt: Vec<String>,

    /// 메모리 접근 힌트 (normal, sequential, random, willneed, dontneed, noreuse)
    #[arg(short = 'a')]
    mem_advice: Option<String>,

    /// TCP 혼잡 제어 알고리즘
    #[arg(short = 'c')]
    congestion: Option<String>,

    /// UDP-Lite 체크섬 범위
    #[arg(short = 'U')]
    checksum_coverage: Option<u16>,

    /// 스케줄링 정책과 우선순위: POLICY PRIORITY
    #[arg(short = 'P', num_args = 2, value_names = ["POLICY", "PRIORITY"])]
    sched: Option<Vec<String>>,

    /// nice 값 변경
    #[arg(short = 'C', allow_negative_numbers = true)]
    nice: Option<i32>,

    /// TCP_NODELAY
    #[arg(short = 'D')]
    nodelay: bool,

    /// SO_REUSEADDR
    #[arg(short = 'e')]
    reuseaddr: bool,

    /// IPv4 만 사용
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// IPv6 만 사용
    #[arg(short = '6')]
    ipv6: bool,

    /// RTT 프로브 (예: 10n,500d,10m,0f)
    #[arg(short = 'R', value_name = "SPEC")]
    rtt: Option<String>,

    /// 통계 출력
    #[arg(short = 'T')]
    statistics: bool,

    /// 비트 단위
    #[arg(short = '8')]
    bits: bool,

    /// SI 접두어 (1000 단위)
    #[arg(short = 'I')]
    si: bool,

    /// 기계 파싱용 출력
    #[arg(short = 'M')]
    machine: bool,

    /// 로그 상세도 (-v, -vv, -vvv)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn build(&self) -> Result<(TransferConfig, ProcessTuning)> {
        let mut config = TransferConfig::new();

        config.mode = if self.receive {
            WorkMode::Receive
        } else {
            WorkMode::Transmit
        };

        match config.mode {
            WorkMode::Transmit => {
                let [input, host] = self.args.as_slice() else {
                    return Err(Error::InvalidConfig(
                        "송신 모드는 <input-file> <hostname> 이 필요함".into(),
                    ));
                };
                config.input = Some(PathBuf::from(input));
                config.host = Some(host.clone());
            }
            WorkMode::Receive => {
                config.output = self.args.first().map(PathBuf::from);
                config.host = self.args.get(1).cloned();
                config.exec = self.exec.clone();
            }
        }

        config.transport = self.protocol.parse()?;
        if let Some(kind) = &self.tipc_type {
            let kind: FabricSocketType = kind.parse()?;
            match config.transport {
                Transport::Fabric(_) => config.transport = Transport::Fabric(kind),
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "--tipc-type 은 tipc 에서만 사용 가능 ({})",
                        other
                    )))
                }
            }
        }

        config.family = match (self.ipv4, self.ipv6, config.transport) {
            (_, _, Transport::Fabric(_)) => AddressFamily::Fabric,
            (true, _, _) => AddressFamily::Inet,
            (_, true, _) => AddressFamily::Inet6,
            _ => AddressFamily::Unspecified,
        };

        config.service = self.port.clone();
        if let Some(io) = &self.io {
            config.io = io.parse::<IoStrategy>()?;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = usize::try_from(size)
                .map_err(|_| Error::InvalidConfig(format!("버퍼 크기 {} 이(가) 너무 큼", size)))?;
        }
        if let Some(advice) = &self.mem_advice {
            config.mem_advice = Some(advice.parse::<MemAdvice>()?);
        }
        if let Some(name) = &self.congestion {
            config.congestion = Some(CongestionAlgorithm::select(name)?);
        }
        config.checksum_coverage = self.checksum_coverage;

        for pair in self.sockopt.chunks(2) {
            if let [name, value] = pair {
                config.socket_options.request(name, value)?;
            }
        }
        if self.nodelay {
            config.socket_options.request("TCP_NODELAY", "on")?;
        }
        if self.reuseaddr {
            config.socket_options.request("SO_REUSEADDR", "on")?;
        }

        if let Some(spec) = &self.rtt {
            config.rtt = Some(RttProbeSpec::parse(spec)?);
        }

        config.report.statistics = self.statistics;
        config.report.machine = self.machine;
        if self.bits {
            config.report.unit = StatUnit::Bit;
        }
        if self.si {
            config.report.prefix = StatPrefix::Si;
        }

        let mut tuning = ProcessTuning {
            nice: self.nice,
            ..Default::default()
        };
        if let Some(sched) = &self.sched {
            if let [policy, priority] = sched.as_slice() {
                tuning.scheduler = Some((policy.parse::<SchedPolicy>()?, priority.parse::<SchedPriority>()?));
            }
        }

        config.validate()?;
        Ok((config, tuning))
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let (config, tuning) = cli.build()?;
    debug!("configuration: {:?}", config);

    tuning.apply();

    let stats: TransferStats = match config.mode {
        WorkMode::Transmit => {
            let mut sender = Sender::new(&config);
            sender.run()?;
            sender.into_stats()
        }
        WorkMode::Receive => {
            let mut receiver = Receiver::new(&config);
            receiver.run()?;
            receiver.into_stats()
        }
    };

    if config.report.enabled() {
        eprint!("{}", stats.report(&config.report));
        if config.report.machine {
            eprintln!();
        }
    }
    Ok(())
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitClass::Option.code()
            } else {
                0
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    init_tracing(cli.verbose);

    if let Err(e) = run(&cli) {
        error!("{}", e);
        process::exit(e.exit_class().code());
    }
}
