//! 루프백 통합 테스트: 127.0.0.1 로 파일을 보내고 그대로 도착하는지 확인

use std::fs;
use std::path::Path;
use std::thread;

use netsend::{
    AddressFamily, IoStrategy, Receiver, RttProbeSpec, Sender, TransferConfig, Transport, WorkMode,
};

fn write_pattern(path: &Path, size: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    fs::write(path, &data).unwrap();
    data
}

struct Outcome {
    sent: u64,
    received: u64,
    output: Vec<u8>,
    sender_stats: netsend::TransferStats,
}

fn loopback(transport: Transport, io: IoStrategy, size: usize, buffer_size: usize, rtt: Option<RttProbeSpec>) -> (Vec<u8>, Outcome) {
    loopback_into(transport, io, size, buffer_size, rtt, false)
}

/// `through_command` 이면 수신 데이터를 `cat` 명령으로 흘려 파일에 남긴다
fn loopback_into(
    transport: Transport,
    io: IoStrategy,
    size: usize,
    buffer_size: usize,
    rtt: Option<RttProbeSpec>,
    through_command: bool,
) -> (Vec<u8>, Outcome) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");
    let data = write_pattern(&input, size);

    let mut receive_config = TransferConfig::new();
    receive_config.mode = WorkMode::Receive;
    receive_config.transport = transport;
    receive_config.family = AddressFamily::Inet;
    receive_config.service = "0".into();
    if through_command {
        receive_config.exec = Some(format!("cat > '{}'", output.display()));
    } else {
        receive_config.output = Some(output.clone());
    }

    let listener = Receiver::new(&receive_config).bind().unwrap();
    let port = listener.local_addr().unwrap().unwrap().port();

    let handle = thread::spawn(move || {
        let mut receiver = Receiver::new(&receive_config);
        receiver.receive_on(listener).unwrap()
    });

    let mut send_config = TransferConfig::new();
    send_config.transport = transport;
    send_config.family = AddressFamily::Inet;
    send_config.host = Some("127.0.0.1".into());
    send_config.service = port.to_string();
    send_config.input = Some(input);
    send_config.io = io;
    send_config.buffer_size = buffer_size;
    send_config.rtt = rtt;

    let mut sender = Sender::new(&send_config);
    let sent = sender.run().unwrap();
    let sender_stats = sender.into_stats();
    let received = handle.join().unwrap();

    let outcome = Outcome {
        sent,
        received,
        output: fs::read(&output).unwrap(),
        sender_stats,
    };
    (data, outcome)
}

fn assert_intact(data: &[u8], outcome: &Outcome) {
    assert_eq!(outcome.sent, data.len() as u64);
    assert_eq!(outcome.received, data.len() as u64);
    assert_eq!(outcome.output, data);
}

#[test]
fn tcp_sendfile() {
    let (data, outcome) = loopback(Transport::Tcp, IoStrategy::Sendfile, 1024 * 1024 + 17, 0, None);
    assert_intact(&data, &outcome);
    assert!(outcome.sender_stats.elapsed().is_some());
}

#[test]
fn tcp_mmap() {
    let (data, outcome) = loopback(Transport::Tcp, IoStrategy::Mmap, 300 * 1024, 0, None);
    assert_intact(&data, &outcome);
}

#[test]
fn tcp_rw_counts_reads() {
    let (data, outcome) = loopback(Transport::Tcp, IoStrategy::Rw, 100_000, 4096, None);
    assert_intact(&data, &outcome);
    assert_eq!(outcome.sender_stats.read_call_cnt, (100_000 + 4095) / 4096);
}

#[test]
fn tcp_splice() {
    let (data, outcome) = loopback(Transport::Tcp, IoStrategy::Splice, 512 * 1024 + 3, 0, None);
    assert_intact(&data, &outcome);
}

#[test]
fn tcp_empty_file() {
    let (data, outcome) = loopback(Transport::Tcp, IoStrategy::Sendfile, 0, 0, None);
    assert_intact(&data, &outcome);
}

#[test]
fn tcp_with_rtt_probe() {
    let spec = RttProbeSpec {
        iterations: 5,
        data_size: 100,
        deviation_filter: 10,
        force_ms: 0,
    };
    let (data, outcome) = loopback(Transport::Tcp, IoStrategy::Sendfile, 64 * 1024, 0, Some(spec));
    assert_intact(&data, &outcome);

    let rtt = outcome.sender_stats.rtt.unwrap();
    assert_eq!(rtt.retained + rtt.discarded, 5);
    assert!(rtt.minimum.is_some());
}

#[test]
fn tcp_forced_rtt() {
    let spec = RttProbeSpec {
        iterations: 2,
        data_size: 32,
        deviation_filter: 10,
        force_ms: 25,
    };
    let (_, outcome) = loopback(Transport::Tcp, IoStrategy::Rw, 1024, 0, Some(spec));
    let rtt = outcome.sender_stats.rtt.unwrap();
    assert_eq!(rtt.minimum, Some(std::time::Duration::from_millis(25)));
    assert!(rtt.forced);
}

#[test]
fn udp_rw() {
    let (data, outcome) = loopback(Transport::Udp, IoStrategy::Rw, 64 * 1024, 1024, None);
    assert_intact(&data, &outcome);
}

#[test]
fn udp_sendfile_falls_back_to_datagrams() {
    let (data, outcome) = loopback(Transport::Udp, IoStrategy::Sendfile, 64 * 1024, 0, None);
    assert_intact(&data, &outcome);
}

#[test]
fn udp_mmap_falls_back_to_datagrams() {
    let (data, outcome) = loopback(Transport::Udp, IoStrategy::Mmap, 64 * 1024, 0, None);
    assert_intact(&data, &outcome);
}

#[test]
fn udp_oversized_buffer_is_capped() {
    let (data, outcome) = loopback(Transport::Udp, IoStrategy::Rw, 130 * 1024, 1 << 20, None);
    assert_intact(&data, &outcome);
}

#[test]
fn tcp_into_command() {
    let (data, outcome) = loopback_into(Transport::Tcp, IoStrategy::Sendfile, 256 * 1024 + 9, 0, None, true);
    assert_intact(&data, &outcome);
}
