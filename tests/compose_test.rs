//! Placement properties of the composer, exercised through the public API.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blitzbackup::classify::{Classification, FileClassifier};
use blitzbackup::common::{FileKind, FileMetadata};
use blitzbackup::storage::Folder;
use blitzbackup::{
    BackupError, BackupPusher, ComposeConfig, ComposeFileInfo, ComposerKind, ComposerMaker, MemoryFolder,
    TarBallComposer,
};
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

// ---------- helpers ----------

fn config(streams: usize, name: &str) -> ComposeConfig {
    ComposeConfig { parallelism: streams, backup_name: Some(name.into()), ..Default::default() }
}

fn write_files(dir: &Path, sizes: &[usize]) -> Vec<String> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, size)| {
            let rel = format!("base/1/{}", 16384 + i);
            let path = dir.join(&rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, vec![(i % 251) as u8; *size]).unwrap();
            rel
        })
        .collect()
}

fn classify_all(dir: &Path, rels: &[String]) -> Vec<ComposeFileInfo> {
    let classifier = FileClassifier::new(None, ComposeConfig::default().path_rules().unwrap(), 8192, true);
    rels.iter()
        .map(|rel| match classifier.classify(&dir.join(rel), rel) {
            Classification::Ready(info) => info,
            other => panic!("{rel}: {other:?}"),
        })
        .collect()
}

// ---------- tests ----------

#[test]
fn every_file_lands_in_exactly_one_stream() {
    let data = tempdir().unwrap();
    let sizes: Vec<usize> = (0..40).map(|i| 100 + i * 37).collect();
    let rels = write_files(data.path(), &sizes);

    let folder = Arc::new(MemoryFolder::new());
    let mut composer = ComposerMaker::make(ComposerKind::Plain, &config(3, "base_a"), folder.clone()).unwrap();
    for info in classify_all(data.path(), &rels) {
        composer.add_file(info).unwrap();
    }
    // Classified, then gone before its worker could open it.
    let mut header = tar::Header::new_gnu();
    header.set_size(10);
    let ghost = ComposeFileInfo::new(
        data.path().join("base/1/99999"),
        "base/1/99999".into(),
        FileMetadata { size: 10, mode: 0o600, mtime: 0, kind: FileKind::Regular },
        false,
        false,
        header,
    );
    composer.add_file(ghost).unwrap();

    let sets = composer.pack_tarballs().unwrap();
    assert_eq!(sets.len(), 3);
    let placed: Vec<&String> = sets.values().flatten().collect();
    let unique: BTreeSet<&String> = placed.iter().copied().collect();
    assert_eq!(placed.len(), unique.len(), "a file was placed twice");
    let expected: BTreeSet<&String> = rels.iter().collect();
    assert_eq!(unique, expected);
    assert_eq!(composer.summary().unwrap().excluded, vec!["base/1/99999".to_string()]);

    // Round-robin: counts differ by at most one.
    let counts: Vec<usize> = sets.values().map(Vec::len).collect();
    assert!(counts.iter().max().unwrap() - counts.iter().min().unwrap() <= 1, "{counts:?}");
    assert_eq!(composer.get_files().len(), rels.len());
    for name in sets.keys() {
        assert!(folder.exists(&composer.backup().stream_key(name)).unwrap());
    }
}

#[test]
fn weight_balanced_keeps_streams_within_twice_the_average() {
    let data = tempdir().unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let sizes: Vec<usize> = (0..200).map(|_| rng.gen_range(1..=1000)).collect();
    let rels = write_files(data.path(), &sizes);

    // Relations without statistics weigh their size.
    let stats = data.path().join("stats.json");
    fs::write(&stats, br#"{"relations": {}}"#).unwrap();
    let cfg = ComposeConfig { statistics_file: Some(stats), ..config(4, "base_w") };

    let folder = Arc::new(MemoryFolder::new());
    let mut composer = ComposerMaker::make(ComposerKind::WeightBalanced, &cfg, folder).unwrap();
    for info in classify_all(data.path(), &rels) {
        composer.add_file(info).unwrap();
    }
    let loads = composer.loads().to_vec();
    composer.pack_tarballs().unwrap();

    let total: u64 = sizes.iter().map(|s| *s as u64).sum();
    assert_eq!(loads.iter().sum::<u64>(), total);
    let max = *loads.iter().max().unwrap();
    assert!(max <= 2 * total / 4, "loads {loads:?}, total {total}");
}

#[test]
fn pack_is_idempotent_and_closes_the_composer() {
    let data = tempdir().unwrap();
    let rels = write_files(data.path(), &[10, 20, 30]);
    let folder = Arc::new(MemoryFolder::new());
    let mut composer = ComposerMaker::make(ComposerKind::Plain, &config(2, "base_i"), folder).unwrap();
    let mut infos = classify_all(data.path(), &rels);
    let late = infos.pop().unwrap();
    for info in infos {
        composer.add_file(info).unwrap();
    }

    let first = composer.pack_tarballs().unwrap();
    let second = composer.pack_tarballs().unwrap();
    assert_eq!(first, second);
    assert!(matches!(composer.add_file(late), Err(BackupError::ComposerState(_))));
}

#[test]
fn failed_stream_leaves_nothing_behind() {
    let data = tempdir().unwrap();
    write_files(data.path(), &[5000, 6000, 7000, 8000]);

    let folder = Arc::new(MemoryFolder::new());
    folder.reject_puts_containing("part_002");
    let err = BackupPusher::new(folder.clone(), config(3, "base_f")).push(data.path()).unwrap_err();
    assert!(matches!(err, BackupError::StreamFailed { ref stream, .. } if stream == "part_002.tar.zst"), "{err}");

    let keys = folder.keys();
    assert!(keys.is_empty(), "left behind: {keys:?}");
}

#[cfg(unix)]
#[test]
fn stream_failing_mid_run_stops_the_producer() {
    let data = tempdir().unwrap();
    let rels = write_files(data.path(), &[100]);
    let good = classify_all(data.path(), &rels).pop().unwrap();

    // A directory opens like a file but fails once its body is read.
    fs::create_dir_all(data.path().join("base/1/broken")).unwrap();
    let mut header = tar::Header::new_gnu();
    header.set_size(10);
    let broken = ComposeFileInfo::new(
        data.path().join("base/1/broken"),
        "base/1/broken".into(),
        FileMetadata { size: 10, mode: 0o600, mtime: 0, kind: FileKind::Regular },
        false,
        false,
        header,
    );

    let folder = Arc::new(MemoryFolder::new());
    let mut composer = ComposerMaker::make(ComposerKind::Plain, &config(2, "base_m"), folder.clone()).unwrap();
    composer.add_file(broken).unwrap();

    let mut failure = None;
    for i in 0..500 {
        let mut next = good.clone();
        next.archive_path = format!("base/1/copy_{i}");
        match composer.add_file(next) {
            Ok(()) => thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let err = failure.expect("the producer kept going after a stream failed");
    assert!(matches!(err, BackupError::StreamFailed { ref stream, .. } if stream == "part_001.tar.zst"), "{err}");

    for _ in 0..2 {
        let again = composer.pack_tarballs().unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
    }
    let keys = folder.keys();
    assert!(keys.is_empty(), "left behind: {keys:?}");
}

#[test]
fn dropping_an_open_composer_uploads_nothing() {
    let data = tempdir().unwrap();
    let rels = write_files(data.path(), &[100, 200]);
    let folder = Arc::new(MemoryFolder::new());
    {
        let mut composer = ComposerMaker::make(ComposerKind::Plain, &config(2, "base_d"), folder.clone()).unwrap();
        for info in classify_all(data.path(), &rels) {
            composer.add_file(info).unwrap();
        }
    }
    assert!(folder.keys().is_empty());
}
