// Restoration tests - prepare_files_to_restore() and restore_files()

use anyhow::{format_err, Error};

use staf_api_types::{PhysicalFileStatus, StafConfiguration};

use super::*;
use crate::archive::AddressMode;

struct Archived {
    setup: TestSetup,
    direct: (PathBuf, ArchiveAddress),
    entry: (PathBuf, ArchiveAddress),
    split: (PathBuf, ArchiveAddress),
}

// Store one direct file, one container (two entries) and one file split
// into 9 parts.
fn archive_test_files(name: &str) -> Result<Archived, Error> {
    let config = StafConfiguration {
        split_parts: 9,
        ..test_config()
    };
    let setup = TestSetup::new(name, config)?;
    let dir = setup.source_dir();

    let direct = write_test_file(&dir, "direct.dat", 2000, 1)?;
    let small1 = write_test_file(&dir, "small1.txt", 800, 2)?;
    let small2 = write_test_file(&dir, "small2.txt", 800, 3)?;
    let big = write_test_file(&dir, "big.dat", 20000, 4)?;

    let sources = vec![direct.clone(), small1, small2.clone(), big.clone()];

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&sources), 1000)?;
    assert!(list.iter().all(|f| f.status == PhysicalFileStatus::ReadyToStore));
    assert_eq!(controller.archive_files(&mut list, NODE, false)?, 3);

    let raw = controller.get_raw_files_archived(&list);
    assert_eq!(raw.len(), 4);

    let address = |path: &PathBuf| {
        raw.get(path)
            .cloned()
            .map(|address| (path.clone(), address))
            .ok_or_else(|| format_err!("{:?} not archived", path))
    };

    let archived = Archived {
        direct: address(&direct)?,
        entry: address(&small2)?,
        split: address(&big)?,
        setup,
    };

    archived.setup.remote.reset_stats();

    Ok(archived)
}

#[test]
fn test_restore_all_modes() -> Result<(), Error> {
    let archived = archive_test_files("test_restore_all_modes")?;
    let setup = &archived.setup;

    assert_eq!(archived.split.1.mode, AddressMode::Split { parts: 9 });

    let addresses = vec![
        archived.direct.1.clone(),
        archived.entry.1.clone(),
        archived.split.1.clone(),
    ];

    let mut restore = setup.restoration()?;
    let requests = restore.prepare_files_to_restore(&addresses);
    assert_eq!(requests.len(), 3);

    let mut listener = RecordingListener::default();
    restore.restore_files(&requests, &setup.restore_dir(), &mut listener)?;

    assert!(listener.errors.is_empty());
    assert_eq!(listener.retrieved.len(), 3);

    let stats = setup.remote.stats();
    assert_eq!(stats.open_calls, 1);
    assert_eq!(stats.get_calls, 1);
    // 1 direct, 1 container, 9 parts
    assert_eq!(stats.get_files, 11);

    for (source, address) in [&archived.direct, &archived.entry, &archived.split] {
        let (_, path) = listener
            .retrieved
            .iter()
            .find(|(a, _)| a == address)
            .ok_or_else(|| format_err!("no result for {}", address))?;
        assert_eq!(std::fs::read(path)?, std::fs::read(source)?);
    }

    // the entry keeps its name
    assert!(setup.restore_dir().join("small2.txt").is_file());

    // no staging leftovers
    let mut names: Vec<String> = std::fs::read_dir(setup.restore_dir())?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    names.sort();
    assert_eq!(names.len(), 3);

    Ok(())
}

#[test]
fn test_restore_twice() -> Result<(), Error> {
    let archived = archive_test_files("test_restore_twice")?;
    let setup = &archived.setup;

    let addresses = vec![archived.direct.1.clone(), archived.direct.1.clone()];

    let mut restore = setup.restoration()?;
    let requests = restore.prepare_files_to_restore(&addresses);
    assert_eq!(requests.len(), 1);

    let mut listener = RecordingListener::default();
    restore.restore_files(&requests, &setup.restore_dir(), &mut listener)?;
    restore.restore_files(&requests, &setup.restore_dir(), &mut listener)?;

    assert_eq!(listener.retrieved.len(), 4);

    let name = &archived.direct.1.file_name;
    let restore_dir = setup.restore_dir();
    for path in [
        restore_dir.join(name),
        restore_dir.join(format!("{}_1", name)),
        restore_dir.join(format!("{}_2", name)),
        restore_dir.join(format!("{}_3", name)),
    ] {
        assert_eq!(std::fs::read(&path)?, std::fs::read(&archived.direct.0)?);
    }

    Ok(())
}

#[test]
fn test_restore_missing_objects() -> Result<(), Error> {
    let archived = archive_test_files("test_restore_missing_objects")?;
    let setup = &archived.setup;

    // lose the direct file and one part of the split file
    let direct = archived.direct.1.physical_key().remote_path();
    std::fs::remove_file(setup.remote.remote_file_path("ARCH1", &direct))?;
    let part = crate::archive::remote_path(
        NODE,
        &crate::archive::split_part_name(&archived.split.1.file_name, 5),
    );
    std::fs::remove_file(setup.remote.remote_file_path("ARCH1", &part))?;

    let missing_entry = ArchiveAddress::new(
        "ARCH1",
        NODE,
        archived.entry.1.file_name.clone(),
        AddressMode::Container {
            entry: String::from("nothere.txt"),
        },
    )?;

    let addresses = vec![
        archived.direct.1.clone(),
        archived.entry.1.clone(),
        archived.split.1.clone(),
        missing_entry.clone(),
    ];

    let mut restore = setup.restoration()?;
    let requests = restore.prepare_files_to_restore(&addresses);

    let mut listener = RecordingListener::default();
    restore.restore_files(&requests, &setup.restore_dir(), &mut listener)?;

    assert_eq!(listener.retrieved.len(), 1);
    assert_eq!(listener.retrieved[0].0, archived.entry.1);

    assert_eq!(listener.errors.len(), 3);
    for address in [&archived.direct.1, &archived.split.1, &missing_entry] {
        let (_, msg) = listener
            .errors
            .iter()
            .find(|(a, _)| a == address)
            .ok_or_else(|| format_err!("no error for {}", address))?;
        assert!(msg.contains("is missing"), "unexpected error: {}", msg);
    }

    // no partial split file
    assert!(!setup
        .restore_dir()
        .join(&archived.split.1.file_name)
        .exists());

    Ok(())
}

#[test]
fn test_restore_transfer_failure() -> Result<(), Error> {
    let archived = archive_test_files("test_restore_transfer_failure")?;
    let setup = &archived.setup;

    let addresses = vec![archived.direct.1.clone(), archived.split.1.clone()];

    let mut restore = setup.restoration()?;
    let requests = restore.prepare_files_to_restore(&addresses);

    setup.remote.fail_bulk_get(true);

    let mut listener = RecordingListener::default();
    assert!(restore
        .restore_files(&requests, &setup.restore_dir(), &mut listener)
        .is_err());

    assert!(listener.retrieved.is_empty());
    assert_eq!(listener.errors.len(), 2);
    assert_eq!(setup.remote.stats().close_calls, 1);

    Ok(())
}

#[test]
fn test_restore_bad_destination() -> Result<(), Error> {
    let archived = archive_test_files("test_restore_bad_destination")?;
    let setup = &archived.setup;

    let destination = setup.testdir.join("not-a-dir");
    std::fs::write(&destination, b"data")?;

    let addresses = vec![archived.direct.1.clone(), archived.entry.1.clone()];

    let mut restore = setup.restoration()?;
    let requests = restore.prepare_files_to_restore(&addresses);

    let mut listener = RecordingListener::default();
    assert!(restore
        .restore_files(&requests, &destination, &mut listener)
        .is_err());
    assert_eq!(listener.errors.len(), 2);
    assert_eq!(setup.remote.stats().open_calls, 0);

    Ok(())
}

#[test]
fn test_restore_other_archive() -> Result<(), Error> {
    let archived = archive_test_files("test_restore_other_archive")?;
    let setup = &archived.setup;

    let mut other = archived.direct.1.clone();
    other.archive = String::from("OTHER");

    let mut restore = setup.restoration()?;
    let requests = restore.prepare_files_to_restore(&[other.clone()]);

    let mut listener = RecordingListener::default();
    restore.restore_files(&requests, &setup.restore_dir(), &mut listener)?;

    assert!(listener.retrieved.is_empty());
    assert_eq!(listener.errors.len(), 1);
    assert_eq!(listener.errors[0].0, other);
    assert_eq!(setup.remote.stats().open_calls, 0);

    Ok(())
}

#[test]
fn test_restore_single_bulk_get() -> Result<(), Error> {
    let config = StafConfiguration {
        max_restitution_stream_files: 1,
        ..test_config()
    };
    let setup = TestSetup::new("test_restore_single_bulk_get", config)?;
    let dir = setup.source_dir();
    let files = vec![
        write_test_file(&dir, "one.dat", 2000, 1)?,
        write_test_file(&dir, "two.dat", 3000, 2)?,
    ];

    let mut controller = setup.archival()?;
    let mut list = controller.prepare_files_to_archive(&files_by_node(&files), 1000)?;
    assert_eq!(controller.archive_files(&mut list, NODE, false)?, 2);
    let raw = controller.get_raw_files_archived(&list);
    setup.remote.reset_stats();

    let addresses: Vec<ArchiveAddress> = raw.values().cloned().collect();
    let mut restore = setup.restoration()?;
    let requests = restore.prepare_files_to_restore(&addresses);
    let mut listener = RecordingListener::default();
    restore.restore_files(&requests, &setup.restore_dir(), &mut listener)?;

    assert_eq!(listener.retrieved.len(), 2);
    let stats = setup.remote.stats();
    assert_eq!(stats.get_calls, 1);
    assert_eq!(stats.get_files, 2);

    Ok(())
}
