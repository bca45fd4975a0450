// Archival tests - prepare_files_to_archive() and archive_files()

use std::collections::BTreeSet;

use anyhow::Error;

use staf_api_types::{PhysicalFileStatus, StafConfiguration};

use super::*;
use crate::archive::{AddressMode, ArchiveError, PhysicalFileKind};

fn five_files(setup: &TestSetup) -> Result<Vec<PathBuf>, Error> {
    let dir = setup.source_dir();
    let mut files = Vec::new();
    for i in 0..6 {
        let path = write_test_file(&dir, &format!("file{}.dat", i), 2000 + i * 100, i as u8)?;
        files.push(path);
    }
    // one of the six files vanishes before preparation
    std::fs::remove_file(&files[3])?;
    Ok(files)
}

#[test]
fn test_archive_direct_files() -> Result<(), Error> {
    let setup = TestSetup::new("test_archive_direct_files", test_config())?;
    let files = five_files(&setup)?;

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;

    assert_eq!(list.len(), 5);
    for file in list.iter() {
        assert_eq!(file.status, PhysicalFileStatus::ReadyToStore);
        assert!(matches!(file.kind, PhysicalFileKind::Direct(_)));
    }

    let stored = controller.archive_files(&mut list, NODE, false)?;
    assert_eq!(stored, 5);
    assert!(list.iter().all(|f| f.status == PhysicalFileStatus::Stored));

    let raw = controller.get_raw_files_archived(&list);
    assert_eq!(raw.len(), 5);
    assert!(!raw.contains_key(&files[3]));

    let urls: BTreeSet<String> = raw.values().map(|a| a.encode()).collect();
    assert_eq!(urls.len(), 5);
    for address in raw.values() {
        assert_eq!(address.mode, AddressMode::Direct);
        assert_eq!(address.node, NODE);
        assert_eq!(address.archive, "ARCH1");
    }

    let stats = setup.remote.stats();
    assert_eq!(stats.open_calls, 1);
    assert_eq!(stats.close_calls, 1);
    assert_eq!(stats.put_calls, 1);
    assert_eq!(setup.remote.list_remote_files("ARCH1")?.len(), 5);

    Ok(())
}

#[test]
fn test_archive_split_files() -> Result<(), Error> {
    let config = StafConfiguration {
        min_file_size: 1,
        max_file_size: 100,
        ..test_config()
    };
    let setup = TestSetup::new("test_archive_split_files", config)?;
    let files = five_files(&setup)?;

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;

    assert_eq!(list.len(), 5);
    let units: usize = list.iter().map(|f| f.transfer_units().len()).sum();
    assert_eq!(units, 20);

    let stored = controller.archive_files(&mut list, NODE, false)?;
    assert_eq!(stored, 5);

    // 20 parts, 10 files per flow
    let stats = setup.remote.stats();
    assert_eq!(stats.put_calls, 2);
    assert_eq!(stats.put_files, 20);
    assert_eq!(stats.open_calls, 1);

    let raw = controller.get_raw_files_archived(&list);
    assert_eq!(raw.len(), 5);
    for address in raw.values() {
        assert_eq!(address.mode, AddressMode::Split { parts: 4 });
        assert!(address.encode().ends_with("?parts=4"));
    }

    // part files are removed once stored
    let tmp = controller.workspace().tmp_dir(NODE);
    assert!(std::fs::read_dir(&tmp)?.next().is_none());

    Ok(())
}

#[test]
fn test_size_limits() -> Result<(), Error> {
    let setup = TestSetup::new("test_size_limits", test_config())?;
    let dir = setup.source_dir();

    let files = vec![
        write_test_file(&dir, "min.dat", 1000, 1)?,
        write_test_file(&dir, "max.dat", 10000, 2)?,
        write_test_file(&dir, "big.dat", 10001, 3)?,
    ];

    let controller = setup.archival()?;
    let list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;
    assert_eq!(list.len(), 3);

    let direct = list
        .iter()
        .filter(|f| matches!(f.kind, PhysicalFileKind::Direct(_)))
        .count();
    assert_eq!(direct, 2);

    let split = list
        .iter()
        .find_map(|f| match &f.kind {
            PhysicalFileKind::Split(split) => Some(split),
            _ => None,
        })
        .ok_or_else(|| anyhow::format_err!("missing split file"))?;
    assert_eq!(split.parts.len(), 4);
    assert_eq!(split.parts.iter().map(|p| p.length).sum::<u64>(), 10001);
    assert_eq!(split.parts[3].length, 2501);

    Ok(())
}

#[test]
fn test_service_class() -> Result<(), Error> {
    let config = StafConfiguration {
        service_class_threshold: 2200,
        max_archiving_stream_files: 3,
        ..test_config()
    };
    let setup = TestSetup::new("test_service_class", config)?;
    let files = five_files(&setup)?;

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;
    controller.archive_files(&mut list, NODE, true)?;

    // flows: (2000, 2100, 2200) and (2400, 2500)
    let stats = setup.remote.stats();
    assert_eq!(stats.service_classes, vec!["CS1", "CS3"]);

    Ok(())
}

#[test]
fn test_partial_split_failure() -> Result<(), Error> {
    let config = StafConfiguration {
        min_file_size: 1,
        max_file_size: 100,
        ..test_config()
    };
    let setup = TestSetup::new("test_partial_split_failure", config)?;
    let dir = setup.source_dir();
    let files = vec![
        write_test_file(&dir, "a.dat", 4000, 1)?,
        write_test_file(&dir, "b.dat", 4000, 2)?,
    ];

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;

    // refuse one part of the first file
    let rejected = list[0].transfer_units()[2].remote_path.clone();
    setup.remote.reject_remote_path(&rejected);

    let stored = controller.archive_files(&mut list, NODE, false)?;
    assert_eq!(stored, 1);
    assert_eq!(list[0].status, PhysicalFileStatus::Failed);
    assert_eq!(list[1].status, PhysicalFileStatus::Stored);

    let raw = controller.get_raw_files_archived(&list);
    assert_eq!(raw.len(), 1);
    assert!(raw.contains_key(&files[1]));
    assert!(!raw.contains_key(&files[0]));

    Ok(())
}

#[test]
fn test_transfer_failure() -> Result<(), Error> {
    let setup = TestSetup::new("test_transfer_failure", test_config())?;
    let files = five_files(&setup)?;

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;

    setup.remote.fail_bulk_put(true);

    let err = match controller.archive_files(&mut list, NODE, false) {
        Ok(_) => anyhow::bail!("archive_files should fail"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::Transport(_))
    ));
    assert!(list.iter().all(|f| f.status == PhysicalFileStatus::Failed));
    assert!(controller.get_raw_files_archived(&list).is_empty());

    // connection got closed anyways
    assert_eq!(setup.remote.stats().close_calls, 1);

    Ok(())
}

#[test]
fn test_open_retries() -> Result<(), Error> {
    let setup = TestSetup::new("test_open_retries", test_config())?;
    let files = five_files(&setup)?;

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;

    // max-attempts defaults to 3
    setup.remote.fail_open(2);
    assert_eq!(controller.archive_files(&mut list, NODE, false)?, 5);
    assert_eq!(setup.remote.stats().open_calls, 3);

    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;
    setup.remote.reset_stats();
    setup.remote.fail_open(3);
    assert!(controller.archive_files(&mut list, NODE, false).is_err());
    assert_eq!(setup.remote.stats().open_calls, 3);
    assert_eq!(setup.remote.stats().put_calls, 0);
    assert!(list.iter().all(|f| f.status == PhysicalFileStatus::Failed));

    Ok(())
}

#[test]
fn test_nothing_to_archive() -> Result<(), Error> {
    let setup = TestSetup::new("test_nothing_to_archive", test_config())?;
    let files = five_files(&setup)?;

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;

    // other node, nothing to do
    assert_eq!(controller.archive_files(&mut list, "/other", false)?, 0);
    assert_eq!(setup.remote.stats().open_calls, 0);
    assert!(list.iter().all(|f| f.status == PhysicalFileStatus::ReadyToStore));

    assert_eq!(controller.archive_files(&mut [], NODE, false)?, 0);
    assert_eq!(setup.remote.stats().open_calls, 0);

    Ok(())
}

#[test]
fn test_invalid_config() -> Result<(), Error> {
    let config = StafConfiguration {
        min_file_size: 10,
        max_file_size: 5,
        ..test_config()
    };
    let setup = TestSetup::new("test_invalid_config", config)?;
    match setup.archival() {
        Ok(_) => anyhow::bail!("invalid configuration accepted"),
        Err(err) => assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::Configuration(_))
        )),
    }

    Ok(())
}
