//! The byte-level pipeline against real child processes (sh, gzip).
//!
//! No btrfs here: these tests exercise the stage pool, the copier, and the
//! shaping filters with ordinary tools, which is exactly how the pipeline
//! composes them at run time.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use snapsync::cancel::CancelToken;
use snapsync::pipeline::{Stage, StagePool, classify_stage_results, copy_stream};

#[test]
fn chained_children_round_trip_through_gzip() {
    // producer | gzip | gzip -d, joined by the in-process copier at the end.
    let mut producer = Command::new("sh")
        .args(["-c", "seq 1 2000"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let producer_out = producer.stdout.take().unwrap();

    let mut compress = Command::new("gzip")
        .arg("-c")
        .stdin(Stdio::from(producer_out))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let compress_out = compress.stdout.take().unwrap();

    let mut decompress = Command::new("gzip")
        .arg("-dc")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let decompress_in = decompress.stdin.take().unwrap();
    let mut decompress_out = decompress.stdout.take().unwrap();

    let reader = std::thread::spawn(move || {
        let mut out = String::new();
        decompress_out.read_to_string(&mut out).unwrap();
        out
    });

    let mut pool = StagePool::new();
    pool.push(Stage::new("send", producer));
    pool.push(Stage::new("compress", compress));

    let copied = copy_stream(
        compress_out,
        decompress_in,
        None,
        &CancelToken::new(),
        |_| {},
    )
    .unwrap();
    assert!(copied > 0);

    pool.push(Stage::new("receive", decompress));
    let results = pool.settle(Duration::from_secs(10));
    assert!(classify_stage_results(&results).is_none(), "{results:?}");

    let expected: String = (1..=2000).map(|i| format!("{i}\n")).collect();
    assert_eq!(reader.join().unwrap(), expected);
}

#[test]
fn sink_failure_is_classified_from_stderr() {
    let mut producer = Command::new("sh")
        .args(["-c", "yes fail-feed | head -c 1000000"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let producer_out = producer.stdout.take().unwrap();

    let mut sink = Command::new("sh")
        .args(["-c", "echo 'ERROR: writing: No space left on device' >&2; exit 1"])
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let sink_in = sink.stdin.take().unwrap();

    let mut pool = StagePool::new();
    pool.push(Stage::new("send", producer));
    pool.push(Stage::new("receive", sink));

    // The copy breaks when the sink dies.
    let copied = copy_stream(producer_out, sink_in, None, &CancelToken::new(), |_| {});
    let results = pool.settle(Duration::from_secs(10));
    let error = classify_stage_results(&results).expect("sink failed");
    assert_eq!(
        error.kind,
        snapsync::pipeline::TransferErrorKind::InsufficientSpace
    );
    // Depending on timing the copier either saw EPIPE or finished first.
    drop(copied);
}

#[test]
fn digest_observer_sees_the_exact_byte_stream() {
    use sha2::{Digest, Sha256};
    let payload = vec![42u8; 123_456];
    let mut hasher = Sha256::new();
    let mut out = Vec::new();
    let n = copy_stream(
        payload.as_slice(),
        &mut out,
        Some(10 * 1024 * 1024),
        &CancelToken::new(),
        |chunk| hasher.update(chunk),
    )
    .unwrap();
    assert_eq!(n, payload.len() as u64);
    let streamed = format!("{:x}", hasher.finalize());
    let direct = format!("{:x}", Sha256::digest(&payload));
    assert_eq!(streamed, direct);
}
