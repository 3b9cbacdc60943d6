//! End-to-end tests for the ingestion pipeline.

use flate2::write::GzEncoder;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracestore::store::{Compression, StoreConfig};
use tracestore::{
    ingest, IngestConfig, MalformedPolicy, StoreReader, StoreStatus, TraceStoreError,
};

/// Builds one input line with `packets` packets alternating direction.
fn trace_line(url: &str, packets: usize) -> String {
    let trace: Vec<_> = (0..packets)
        .map(|i| {
            let direction = if i % 3 == 2 { -1 } else { 1 };
            json!([i as f64 * 0.25, 40 + i, direction])
        })
        .collect();
    json!({"url": url, "protocol": "tcp", "region": "us-east", "trace": trace}).to_string()
}

fn write_input(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut contents = lines.join("\n");
    contents.push('\n');
    std::fs::write(&path, contents).unwrap();
    path
}

fn urls_with_prefix<'a>(urls: &'a [String], prefix: &str) -> Vec<&'a str> {
    urls.iter()
        .filter(|url| url.starts_with(prefix))
        .map(String::as_str)
        .collect()
}

#[test]
fn test_two_files_small_chunks() {
    let temp_dir = TempDir::new().unwrap();
    let a = write_input(
        temp_dir.path(),
        "a.jsonl",
        &[trace_line("a-first", 3), trace_line("a-second", 5)],
    );
    let b = write_input(temp_dir.path(), "b.jsonl", &[trace_line("b-only", 1)]);
    let store_path = temp_dir.path().join("out.trs");

    let config = IngestConfig::new(&store_path, vec![a, b])
        .with_chunk_size(2)
        .with_queue_size(1);
    let report = ingest(&config).unwrap();

    assert_eq!(report.rows, 3);
    assert_eq!(report.chunks, 2);
    assert_eq!(report.readers.len(), 2);
    assert_eq!(report.readers[0].records, 2);
    assert_eq!(report.readers[1].records, 1);
    assert_eq!(report.store.status, StoreStatus::Complete);

    let store = StoreReader::open(&store_path).unwrap();
    store.verify().unwrap();
    assert_eq!(store.status(), StoreStatus::Complete);
    assert_eq!(store.len(), 3);

    let rows = store.read_rows().unwrap();
    let urls: Vec<String> = rows.iter().map(|r| r.label.url.clone()).collect();
    assert_eq!(urls_with_prefix(&urls, "a-"), vec!["a-first", "a-second"]);
    assert_eq!(urls_with_prefix(&urls, "b-"), vec!["b-only"]);

    let first = rows.iter().find(|r| r.label.url == "a-first").unwrap();
    assert_eq!(first.sizes, vec![40, 41, -42]);
    assert_eq!(first.timestamps, vec![0.0, 0.25, 0.5]);
    assert_eq!(first.label.protocol, "tcp");
    assert_eq!(first.label.region, "us-east");

    let second = rows.iter().find(|r| r.label.url == "a-second").unwrap();
    assert_eq!(second.sizes.len(), 5);
    assert_eq!(second.timestamps.len(), 5);
}

#[test]
fn test_many_readers_preserve_per_file_order() {
    let temp_dir = TempDir::new().unwrap();
    let files = 8;
    let records_per_file = 50;

    let inputs: Vec<PathBuf> = (0..files)
        .map(|f| {
            let lines: Vec<String> = (0..records_per_file)
                .map(|i| trace_line(&format!("f{}-{:03}", f, i), 1 + (i + f) % 7))
                .collect();
            write_input(temp_dir.path(), &format!("in{}.jsonl", f), &lines)
        })
        .collect();
    let store_path = temp_dir.path().join("many.trs");

    let config = IngestConfig::new(&store_path, inputs)
        .with_chunk_size(7)
        .with_queue_size(2);
    let report = ingest(&config).unwrap();
    assert_eq!(report.rows, (files * records_per_file) as u64);

    let store = StoreReader::open(&store_path).unwrap();
    let rows = store.read_rows().unwrap();
    assert_eq!(rows.len(), files * records_per_file);

    let urls: Vec<String> = rows.iter().map(|r| r.label.url.clone()).collect();
    for f in 0..files {
        let expected: Vec<String> = (0..records_per_file)
            .map(|i| format!("f{}-{:03}", f, i))
            .collect();
        let actual = urls_with_prefix(&urls, &format!("f{}-", f));
        assert_eq!(actual, expected, "order broken for file {}", f);
    }

    let packets: usize = rows.iter().map(|r| r.sizes.len()).sum();
    let expected_packets: usize = (0..files)
        .flat_map(|f| (0..records_per_file).map(move |i| 1 + (i + f) % 7))
        .sum();
    assert_eq!(packets, expected_packets);
    for row in &rows {
        assert_eq!(row.sizes.len(), row.timestamps.len());
    }
}

#[test]
fn test_empty_inputs_produce_empty_store() {
    let temp_dir = TempDir::new().unwrap();
    let a = write_input(temp_dir.path(), "a.jsonl", &[]);
    let b = write_input(temp_dir.path(), "b.jsonl", &[]);
    let store_path = temp_dir.path().join("empty.trs");

    let report = ingest(&IngestConfig::new(&store_path, vec![a, b])).unwrap();
    assert_eq!(report.rows, 0);
    assert_eq!(report.chunks, 0);

    let store = StoreReader::open(&store_path).unwrap();
    assert!(store.is_empty());
    assert_eq!(store.status(), StoreStatus::Complete);
}

#[test]
fn test_existing_store_is_replaced() {
    let temp_dir = TempDir::new().unwrap();
    let store_path = temp_dir.path().join("out.trs");
    std::fs::write(&store_path, vec![0xAB; 4096]).unwrap();
    let a = write_input(temp_dir.path(), "a.jsonl", &[trace_line("x", 2)]);

    ingest(&IngestConfig::new(&store_path, vec![a])).unwrap();

    let store = StoreReader::open(&store_path).unwrap();
    assert_eq!(store.len(), 1);
    store.verify().unwrap();
}

#[test]
fn test_malformed_line_aborts_pipeline() {
    let temp_dir = TempDir::new().unwrap();
    let good: Vec<String> = (0..20).map(|i| trace_line(&format!("good{}", i), 2)).collect();
    let a = write_input(temp_dir.path(), "a.jsonl", &good);
    let b = write_input(
        temp_dir.path(),
        "b.jsonl",
        &[trace_line("b0", 1), "{\"url\": \"truncated".to_string()],
    );
    let store_path = temp_dir.path().join("out.trs");

    let config = IngestConfig::new(&store_path, vec![a, b.clone()])
        .with_chunk_size(3)
        .with_queue_size(1);
    let err = ingest(&config).unwrap_err();

    match err {
        TraceStoreError::ReaderFailed { path, source } => {
            assert_eq!(path, b);
            assert!(matches!(*source, TraceStoreError::Parse { line: 2, .. }));
        }
        other => panic!("expected reader failure, got {:?}", other),
    }

    // The aborted store keeps only whole committed chunks.
    let store = StoreReader::open(&store_path).unwrap();
    assert_eq!(store.status(), StoreStatus::Aborted);
    store.verify().unwrap();
    let rows = store.read_rows().unwrap();
    assert!(rows.len() <= 21);
    for row in &rows {
        assert_eq!(row.sizes.len(), row.timestamps.len());
    }
}

#[test]
fn test_skip_policy_continues_past_malformed_lines() {
    let temp_dir = TempDir::new().unwrap();
    let a = write_input(
        temp_dir.path(),
        "a.jsonl",
        &[
            trace_line("a0", 2),
            "garbage".to_string(),
            json!({"url": "empty", "protocol": "tcp", "region": "eu", "trace": []}).to_string(),
            json!({"url": "half", "protocol": "tcp", "region": "eu", "trace": [[0.0, 1.5, 1]]})
                .to_string(),
            trace_line("a1", 3),
        ],
    );
    let store_path = temp_dir.path().join("out.trs");

    let config = IngestConfig::new(&store_path, vec![a])
        .with_malformed_policy(MalformedPolicy::Skip);
    let report = ingest(&config).unwrap();

    assert_eq!(report.rows, 2);
    assert_eq!(report.skipped(), 3);

    let rows = StoreReader::open(&store_path).unwrap().read_rows().unwrap();
    let urls: Vec<&str> = rows.iter().map(|r| r.label.url.as_str()).collect();
    assert_eq!(urls, vec!["a0", "a1"]);
}

#[test]
fn test_invalid_config_creates_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let a = write_input(temp_dir.path(), "a.jsonl", &[trace_line("x", 1)]);
    let store_path = temp_dir.path().join("out.trs");

    for config in [
        IngestConfig::new(&store_path, vec![a.clone()]).with_chunk_size(0),
        IngestConfig::new(&store_path, vec![a.clone()]).with_queue_size(0),
        IngestConfig::new(&store_path, vec![]),
    ] {
        assert!(matches!(
            ingest(&config),
            Err(TraceStoreError::InvalidConfig(_))
        ));
    }
    assert!(!store_path.exists());
}

#[test]
fn test_store_path_aliasing_an_input_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let input = write_input(
        temp_dir.path(),
        "in.jsonl",
        &[trace_line("keep0", 2), trace_line("keep1", 3)],
    );
    let before = std::fs::read(&input).unwrap();
    std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
    let store_path = temp_dir.path().join("sub").join("..").join("in.jsonl");

    let err = ingest(&IngestConfig::new(&store_path, vec![input.clone()])).unwrap_err();
    assert!(matches!(err, TraceStoreError::InvalidConfig(_)));
    assert_eq!(std::fs::read(&input).unwrap(), before);
}

#[test]
fn test_invalid_utf8_line_follows_policy() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bytes.jsonl");
    let mut contents = Vec::new();
    contents.extend_from_slice(trace_line("a", 1).as_bytes());
    contents.extend_from_slice(b"\n\xff\xfe garbage\n");
    contents.extend_from_slice(trace_line("b", 2).as_bytes());
    contents.push(b'\n');
    std::fs::write(&path, contents).unwrap();
    let store_path = temp_dir.path().join("out.trs");

    let skip = IngestConfig::new(&store_path, vec![path.clone()])
        .with_malformed_policy(MalformedPolicy::Skip);
    let report = ingest(&skip).unwrap();
    assert_eq!(report.rows, 2);
    assert_eq!(report.skipped(), 1);

    let err = ingest(&IngestConfig::new(&store_path, vec![path.clone()])).unwrap_err();
    match err {
        TraceStoreError::ReaderFailed { source, .. } => match *source {
            TraceStoreError::Parse { path: failed, line, .. } => {
                assert_eq!(failed, path);
                assert_eq!(line, 2);
            }
            other => panic!("expected parse error, got {:?}", other),
        },
        other => panic!("expected reader failure, got {:?}", other),
    }
    assert_eq!(
        StoreReader::open(&store_path).unwrap().status(),
        StoreStatus::Aborted
    );
}

#[test]
fn test_unopenable_store_fails_before_reading() {
    let temp_dir = TempDir::new().unwrap();
    let a = write_input(temp_dir.path(), "a.jsonl", &[trace_line("x", 1)]);
    let store_path = temp_dir.path().join("no-such-dir").join("out.trs");

    let err = ingest(&IngestConfig::new(&store_path, vec![a])).unwrap_err();
    assert!(matches!(err, TraceStoreError::IoError(_)));
    assert!(!store_path.exists());
}

#[test]
fn test_gzip_and_plain_inputs_mix() {
    let temp_dir = TempDir::new().unwrap();
    let plain = write_input(temp_dir.path(), "plain.jsonl", &[trace_line("plain", 2)]);

    let gz_path = temp_dir.path().join("packed.jsonl.gz");
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    for i in 0..4 {
        writeln!(encoder, "{}", trace_line(&format!("gz{}", i), 3)).unwrap();
    }
    std::fs::write(&gz_path, encoder.finish().unwrap()).unwrap();

    let store_path = temp_dir.path().join("out.trs");
    let report = ingest(&IngestConfig::new(&store_path, vec![plain, gz_path])).unwrap();
    assert_eq!(report.rows, 5);

    let rows = StoreReader::open(&store_path).unwrap().read_rows().unwrap();
    let urls: Vec<String> = rows.iter().map(|r| r.label.url.clone()).collect();
    assert_eq!(urls_with_prefix(&urls, "gz"), vec!["gz0", "gz1", "gz2", "gz3"]);
}

#[test]
fn test_uncompressed_store_and_label_truncation() {
    let temp_dir = TempDir::new().unwrap();
    let long_url = format!("https://{}.example/", "a".repeat(150));
    let line = json!({
        "url": long_url,
        "protocol": "quic-draft-29-extra",
        "region": "südamerika",
        "trace": [[1.0, 1200, 1], [1.5, 52, -1]]
    })
    .to_string();
    let a = write_input(temp_dir.path(), "a.jsonl", &[line]);
    let store_path = temp_dir.path().join("raw.trs");

    let config = IngestConfig::new(&store_path, vec![a])
        .with_store_config(StoreConfig::default().with_compression(Compression::None));
    ingest(&config).unwrap();

    let store = StoreReader::open(&store_path).unwrap();
    assert_eq!(store.header().compression, Compression::None);
    let rows = store.read_rows().unwrap();
    assert_eq!(rows[0].label.url.len(), 100);
    assert!(long_url.starts_with(&rows[0].label.url));
    assert_eq!(rows[0].label.protocol, "quic-draft");
    assert_eq!(rows[0].label.region, "s?damer");
    assert_eq!(rows[0].sizes, vec![1200, -52]);
}
