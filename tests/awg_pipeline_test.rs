//! Pulse sequence compilation and transfer to a mock AWG.

use std::sync::Arc;

use lab_instr::instrument::Awg5014;
use lab_instr::pulses::{Awg5014Context, Pulse, TimeUnit, Waveform};
use lab_instr::transport::MockTransport;

fn pulses() -> Vec<Pulse> {
    vec![
        Pulse {
            index: 0,
            channel: "Ch1_A".to_string(),
            start: 0.0,
            duration: 0.01,
            waveform: Waveform::Analog(vec![0.25; 10]),
        },
        Pulse {
            index: 1,
            channel: "Ch2_M1".to_string(),
            start: 0.0,
            duration: 0.01,
            waveform: Waveform::Logic(vec![1; 10]),
        },
    ]
}

#[tokio::test]
async fn compile_transfer_select_and_run() {
    let mock = Arc::new(
        MockTransport::new()
            .with_reply("SOUR:FREQ:CW?", "1000000000")
            .with_reply("OUTP1:STAT?", "1")
            .with_reply("OUTP2:STAT?", "1")
            .with_reply("AWGC:RST?", "2"),
    );
    let driver = Awg5014::new(mock.clone());
    let context = Awg5014Context {
        sequence_name: "seq".to_string(),
        time_unit: TimeUnit::Mus,
        ..Awg5014Context::default()
    };

    let report = context
        .compile_and_transfer(&pulses(), None, Some(&driver))
        .await
        .unwrap();

    assert!(report.success);
    let infos = report.infos.unwrap();
    assert_eq!(infos.sequence_names[&1], "seq_Ch1");
    assert_eq!(infos.sequence_names[&2], "seq_Ch2");

    // Both used channels were uploaded as 10 sample buffers.
    let transfers = mock.binary_transfers();
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[0].0, "WLIS:WAV:DATA 'seq_Ch1',0,10,");
    assert_eq!(transfers[1].0, "WLIS:WAV:DATA 'seq_Ch2',0,10,");

    // Ch1: analog at quarter scale, 8192 + round(8191 * 0.25) = 10240.
    let ch1: Vec<u16> = transfers[0]
        .1
        .chunks(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(ch1, vec![10240; 10]);

    // Ch2: analog baseline with marker 1 high, 8192 | 1 << 14 = 24576.
    let ch2: Vec<u16> = transfers[1]
        .1
        .chunks(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(ch2, vec![24576; 10]);

    // Used channels were selected, unused ones cleared, playback started.
    let log = mock.log();
    assert!(log.contains(&"SOURCE1:WAVEFORM \"seq_Ch1\"".to_string()));
    assert!(log.contains(&"SOURCE2:WAVEFORM \"seq_Ch2\"".to_string()));
    assert!(log.contains(&"SOURCE3:WAVEFORM \"\"".to_string()));
    assert!(log.contains(&"SOURCE4:WAVEFORM \"\"".to_string()));
    assert_eq!(mock.count_sent("OUTP1:STAT ON"), 1);
    assert_eq!(mock.count_sent("OUTP2:STAT ON"), 1);
    assert_eq!(mock.count_sent("AWGC:RUN:IMM"), 1);
}

#[tokio::test]
async fn dry_run_touches_no_hardware() {
    let context = Awg5014Context {
        sequence_name: "seq".to_string(),
        time_unit: TimeUnit::Mus,
        ..Awg5014Context::default()
    };

    let report = context
        .compile_and_transfer(&pulses(), None, None)
        .await
        .unwrap();

    assert!(report.success);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn out_of_range_samples_are_reported_per_channel() {
    let context = Awg5014Context {
        sequence_name: "seq".to_string(),
        time_unit: TimeUnit::Mus,
        ..Awg5014Context::default()
    };
    let bad = vec![Pulse {
        index: 0,
        channel: "Ch1_A".to_string(),
        start: 0.0,
        duration: 0.01,
        waveform: Waveform::Analog(vec![1.5; 10]),
    }];

    let report = context.compile_and_transfer(&bad, None, None).await.unwrap();

    assert!(!report.success);
    assert!(report.errors.contains_key("Ch1_A"));
}
