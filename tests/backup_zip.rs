#[path = "../src/backup.rs"]
mod backup;

mod common;

use common::{temp_dir, Sidecar};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("schoold-backup-src");
    let workspace2 = temp_dir("schoold-backup-dst");
    let out_dir = temp_dir("schoold-backup-out");

    let db_src = workspace.join("school.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let bundle_path = out_dir.join("workspace.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 2);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains(backup::BUNDLE_FORMAT_V1));
    assert!(manifest.contains(&export.db_sha256));
    archive
        .by_name("db/school.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);

    let restored = std::fs::read(workspace2.join("school.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn checksum_mismatch_is_rejected_and_leaves_the_workspace_alone() {
    let out_dir = temp_dir("schoold-backup-tamper");
    let workspace = temp_dir("schoold-backup-tamper-dst");
    std::fs::write(workspace.join("school.sqlite3"), b"keep-me").expect("write existing db");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(
            json!({
                "format": backup::BUNDLE_FORMAT_V1,
                "version": 1,
                "dbSha256": "0".repeat(64)
            })
            .to_string()
            .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/school.sqlite3", opts).expect("db entry");
        zip.write_all(b"not-what-the-manifest-says").expect("write db");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("tampered bundle must be rejected");
    assert!(err.to_string().contains("checksum mismatch"), "{}", err);
    let kept = std::fs::read(workspace.join("school.sqlite3")).expect("read existing db");
    assert_eq!(kept, b"keep-me");
    assert!(!workspace.join("school.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bundle_without_checksum_is_rejected() {
    let out_dir = temp_dir("schoold-backup-nosha");
    let workspace = temp_dir("schoold-backup-nosha-dst");
    std::fs::write(workspace.join("school.sqlite3"), b"keep-me").expect("write existing db");

    let bundle_path = out_dir.join("unsigned.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(
            json!({ "format": backup::BUNDLE_FORMAT_V1, "version": 1 })
                .to_string()
                .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/school.sqlite3", opts).expect("db entry");
        zip.write_all(b"tampered garbage").expect("write db");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("bundle without dbSha256 must be rejected");
    assert!(err.to_string().contains("dbSha256"), "{}", err);
    let kept = std::fs::read(workspace.join("school.sqlite3")).expect("read existing db");
    assert_eq!(kept, b"keep-me");
    assert!(!workspace.join("school.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn raw_sqlite_import_is_supported() {
    let out_dir = temp_dir("schoold-backup-raw");
    let workspace = temp_dir("schoold-backup-raw-dst");

    let raw_file = out_dir.join("copy.sqlite3");
    {
        let conn = rusqlite::Connection::open(&raw_file).expect("create sqlite file");
        conn.execute_batch("CREATE TABLE notes(body TEXT); INSERT INTO notes VALUES('term one');")
            .expect("seed sqlite file");
    }
    let bytes = std::fs::read(&raw_file).expect("read sqlite file");

    let import = backup::import_workspace_bundle(&raw_file, &workspace).expect("import sqlite");
    assert_eq!(import.bundle_format_detected, backup::RAW_SQLITE_FORMAT);

    let restored = std::fs::read(workspace.join("school.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);
    assert!(!workspace.join("school.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_database_file_is_rejected_and_leaves_the_workspace_alone() {
    let out_dir = temp_dir("schoold-backup-garbage");
    let workspace = temp_dir("schoold-backup-garbage-dst");
    std::fs::write(workspace.join("school.sqlite3"), b"keep-me").expect("write existing db");

    let notes = out_dir.join("notes.txt");
    std::fs::write(&notes, b"this is not a database").expect("write notes");

    let err = backup::import_workspace_bundle(&notes, &workspace)
        .expect_err("plain text must be rejected");
    assert!(err.to_string().contains("neither"), "{}", err);
    let kept = std::fs::read(workspace.join("school.sqlite3")).expect("read existing db");
    assert_eq!(kept, b"keep-me");
    assert!(!workspace.join("school.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn rejected_import_keeps_the_open_workspace_usable() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-backup-ipc-reject");
    sc.ok(
        "academicYears.create",
        json!({ "name": "2024", "startDate": "2024-01-08", "endDate": "2024-11-29" }),
    );
    let notes = temp_dir("schoold-backup-ipc-notes").join("notes.txt");
    std::fs::write(&notes, b"this is not a database").expect("write notes");

    let code = sc.err_code(
        "backup.importWorkspaceBundle",
        json!({ "inPath": notes.to_string_lossy() }),
    );
    assert_eq!(code, "import_failed");

    let years = sc.ok("academicYears.list", json!({}));
    assert_eq!(years["academicYears"][0]["name"], "2024");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bundle_restores_a_live_workspace_over_ipc() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-backup-ipc");
    let bundle = temp_dir("schoold-backup-ipc-out").join("school.zip");
    let year = sc.ok(
        "academicYears.create",
        json!({ "name": "2024", "startDate": "2024-01-08", "endDate": "2024-11-29" }),
    );
    assert!(year["academicYearId"].is_string());

    let export = sc.ok(
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(export["bundleFormat"], backup::BUNDLE_FORMAT_V1);

    let restored_dir = temp_dir("schoold-backup-ipc-restored");
    let import = sc.ok(
        "backup.importWorkspaceBundle",
        json!({
            "inPath": bundle.to_string_lossy(),
            "workspacePath": restored_dir.to_string_lossy()
        }),
    );
    assert_eq!(import["bundleFormatDetected"], backup::BUNDLE_FORMAT_V1);

    let years = sc.ok("academicYears.list", json!({}));
    assert_eq!(years["academicYears"][0]["name"], "2024");

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(restored_dir);
}
