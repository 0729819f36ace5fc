use std::io::Write;

use replica_wal::{
    GroupConfig,
    SearchMode,
    SearchOptions,
    Wal,
    WalConfig,
    WalError,
    WalFrame,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Entry {
    Step { height: u64, n: u32 },
}

fn config(head_size_limit: u64) -> WalConfig {
    WalConfig::default()
        .with_group(GroupConfig::default().with_head_size_limit(head_size_limit))
}

/// Writes `per_height` entries for each height in `1..=heights`, each height
/// preceded by its marker the way the consensus engine does it.
fn fill(wal: &Wal<Entry>, heights: u64, per_height: u32) {
    for height in 1..=heights {
        wal.write_meta_sync(height).unwrap();
        for n in 0..per_height {
            wal.write(&Entry::Step { height, n }).unwrap();
        }
    }
    wal.flush_and_sync().unwrap();
}

fn entries_until_next_marker(mut rd: replica_wal::SearchReader) -> Vec<Entry> {
    let mut out = Vec::new();
    while let Some(frame) = rd.read_frame::<Entry>().unwrap() {
        match frame {
            WalFrame::Meta(_) => break,
            WalFrame::Message(m) => out.push(m.msg),
        }
    }
    out
}

#[rstest::rstest]
#[test_log::test]
fn finds_every_height(
    #[values(SearchMode::Backwards, SearchMode::Binary)] mode: SearchMode,
    #[values(0, 512)] head_size_limit: u64,
) {
    let dir = tempfile::tempdir().unwrap();
    let wal = Wal::<Entry>::open(dir.path().join("wal"), config(head_size_limit)).unwrap();
    fill(&wal, 30, 5);
    if head_size_limit > 0 {
        assert!(wal.group_info().max_index > 3, "expected rotation");
    }

    for height in 1..=30 {
        let options = SearchOptions {
            mode,
            ..Default::default()
        };
        let rd = wal
            .search_for_height(height, options)
            .unwrap()
            .unwrap_or_else(|| panic!("height {height} not found"));
        let entries = entries_until_next_marker(rd);
        let expected: Vec<_> = (0..5).map(|n| Entry::Step { height, n }).collect();
        assert_eq!(entries, expected, "height {height}");
    }
}

#[test]
fn missing_height_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let wal = Wal::<Entry>::open(dir.path().join("wal"), config(256)).unwrap();
    fill(&wal, 5, 3);
    assert!(wal
        .search_for_height(6, SearchOptions::default())
        .unwrap()
        .is_none());
}

#[test]
fn fresh_log_starts_at_height_zero() {
    let dir = tempfile::tempdir().unwrap();
    let wal = Wal::<Entry>::open(dir.path().join("wal"), config(0)).unwrap();
    let mut rd = wal
        .search_for_height(0, SearchOptions::default())
        .unwrap()
        .unwrap();
    assert!(rd.read_frame::<Entry>().unwrap().is_none());

    // Reopening an existing log does not add a second marker.
    drop(wal);
    let wal = Wal::<Entry>::open(dir.path().join("wal"), config(0)).unwrap();
    let contents = std::fs::read_to_string(dir.path().join("wal")).unwrap();
    assert_eq!(contents, "#{\"h\":0}\n");
    drop(wal);
}

#[test]
fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = Wal::<Entry>::open(dir.path().join("wal"), config(300)).unwrap();
        fill(&wal, 4, 4);
    }
    let wal = Wal::<Entry>::open(dir.path().join("wal"), config(300)).unwrap();
    let rd = wal
        .search_for_height(4, SearchOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(entries_until_next_marker(rd).len(), 4);
}

#[test]
fn corruption_before_the_target_can_be_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal");
    {
        let wal = Wal::<Entry>::open(&path, config(0)).unwrap();
        wal.write_meta_sync(1).unwrap();
        wal.write_sync(&Entry::Step { height: 1, n: 0 }).unwrap();
    }
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(b"not*base64\n")
        .unwrap();
    let wal = Wal::<Entry>::open(&path, config(0)).unwrap();
    wal.write_meta_sync(2).unwrap();
    wal.write_sync(&Entry::Step { height: 2, n: 0 }).unwrap();

    let strict = wal.search_for_height(2, SearchOptions::default());
    assert!(matches!(strict, Err(WalError::DataCorruption(_))));

    let lenient = SearchOptions {
        ignore_data_corruption: true,
        ..Default::default()
    };
    let rd = wal.search_for_height(2, lenient).unwrap().unwrap();
    assert_eq!(
        entries_until_next_marker(rd),
        [Entry::Step { height: 2, n: 0 }]
    );
}

#[test]
fn oversized_write_fails_without_touching_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let wal = Wal::<String>::open(
        dir.path().join("wal"),
        WalConfig::default().with_max_msg_size(64),
    )
    .unwrap();
    let before = wal.group_info().total_size;
    let err = wal.write_sync(&"x".repeat(1_000)).unwrap_err();
    assert!(err.to_string().starts_with("msg is too big"), "{err}");
    assert_eq!(wal.group_info().total_size, before);
}

#[tokio::test(start_paused = true)]
async fn flush_task_makes_buffered_writes_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal");
    let wal = Wal::<Entry>::open(&path, WalConfig::default()).unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = wal.spawn_flush_task(cancel.clone());

    wal.write(&Entry::Step { height: 1, n: 0 }).unwrap();
    let len_before = std::fs::metadata(&path).unwrap().len();

    tokio::time::sleep(replica_wal::DEFAULT_FLUSH_INTERVAL * 2).await;
    let len_after = std::fs::metadata(&path).unwrap().len();
    assert!(len_after > len_before);

    cancel.cancel();
    handle.await.unwrap();
}
