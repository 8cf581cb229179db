//! End-to-end reconciliation: a real library directory, the SQLite store
//! and the scan cycle repairing out-of-band changes.

use std::fs;
use std::path::Path;
use tempfile::TempDir;

use cardvault::{CardLibrary, LibraryConfig};

fn write_card(root: &Path, id: &str, name: &str, tags: &[&str], description: &str) {
    let path = root.join(id);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let payload = serde_json::json!({
        "name": name,
        "description": description,
        "tags": tags,
    });
    fs::write(&path, serde_json::to_string_pretty(&payload).unwrap()).unwrap();
}

fn open_library(root: &Path) -> CardLibrary {
    let mut config = LibraryConfig::new(root);
    config.watch = false;
    CardLibrary::open(config).unwrap()
}

#[test]
fn test_fresh_open_imports_and_indexes() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Fox.json", "Fox", &["a"], "a sly fox");
    write_card(dir.path(), "Cats/Tom.json", "Tom", &["a", "b"], "a cat");

    let library = open_library(dir.path());

    let cards = library.cards();
    assert_eq!(cards.len(), 2);
    assert_eq!(library.global_tags(), vec!["a", "b"]);

    let counts = library.category_counts();
    assert_eq!(counts.get(""), Some(&1));
    assert_eq!(counts.get("Cats"), Some(&1));
    assert_eq!(library.visible_folders(), vec!["Cats"]);

    // The first-run import hashes eagerly.
    let record = library.store().get("Fox.json").unwrap().unwrap();
    assert_eq!(record.file_hash.len(), 64);
    assert!(record.token_count > 0);
}

#[test]
fn test_reopen_skips_import_and_keeps_records() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Fox.json", "Fox", &[], "a fox");

    {
        let library = open_library(dir.path());
        library.set_favorite("Fox.json", true).unwrap();
    }

    let library = open_library(dir.path());
    assert_eq!(library.store().count().unwrap(), 1);
    assert!(library.card("Fox.json").unwrap().favorite);
}

#[test]
fn test_scan_reconciles_out_of_band_changes() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Fox.json", "Fox", &["a"], "a sly fox");
    write_card(dir.path(), "Cats/Tom.json", "Tom", &["b"], "a cat");

    let library = open_library(dir.path());
    library.set_favorite("Cats/Tom.json", true).unwrap();

    // Out-of-band: one file added, one rewritten (different size), one
    // removed, as if the user touched the folder in a file manager.
    write_card(dir.path(), "Cats/New.json", "Newcomer", &["c"], "brand new");
    write_card(
        dir.path(),
        "Cats/Tom.json",
        "Tom",
        &["b", "d"],
        "a cat with a much longer life story than before",
    );
    fs::remove_file(dir.path().join("Fox.json")).unwrap();

    let changed = library.scan_now("test").unwrap();
    assert!(changed);

    // Store repaired...
    assert!(library.store().get("Fox.json").unwrap().is_none());
    assert!(library.store().get("Cats/New.json").unwrap().is_some());
    let tom = library.store().get("Cats/Tom.json").unwrap().unwrap();
    assert_eq!(tom.tags, vec!["b", "d"]);
    // ...the rewritten file's hash is cleared (stale, recomputed on
    // demand), and the favorite flag survived the update.
    assert_eq!(tom.file_hash, "");
    assert!(tom.favorite);

    // ...and the cache was rebuilt before scan_now returned.
    assert!(library.card("Fox.json").is_none());
    assert_eq!(library.card("Cats/New.json").unwrap().name, "Newcomer");
    assert_eq!(library.cards().len(), 2);
}

#[test]
fn test_quiet_scan_reports_no_changes() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Fox.json", "Fox", &[], "a fox with plenty to say");

    let library = open_library(dir.path());
    assert!(!library.scan_now("first").unwrap());
    assert!(!library.scan_now("second").unwrap());
}

#[test]
fn test_token_backfill_keeps_existing_hash() {
    let dir = TempDir::new().unwrap();
    write_card(
        dir.path(),
        "Fox.json",
        "Fox",
        &[],
        "a description comfortably longer than the backfill size floor",
    );

    let library = open_library(dir.path());

    // Regress the record to the shape an older build left behind: token
    // count missing, hash present, file untouched.
    let mut record = library.store().get("Fox.json").unwrap().unwrap();
    record.token_count = 0;
    record.file_hash = "abc123".to_string();
    library.store().upsert(&record).unwrap();

    assert!(library.scan_now("backfill").unwrap());

    let fixed = library.store().get("Fox.json").unwrap().unwrap();
    assert!(fixed.token_count > 0);
    assert_eq!(fixed.file_hash, "abc123");
}

#[test]
fn test_scan_prunes_deleted_folder() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Keep.json", "Keep", &[], "still here");
    write_card(dir.path(), "Cats/Tom.json", "Tom", &[], "doomed");
    write_card(dir.path(), "Cats/Sub/Kit.json", "Kit", &[], "also doomed");

    let library = open_library(dir.path());
    assert_eq!(library.store().count().unwrap(), 3);

    fs::remove_dir_all(dir.path().join("Cats")).unwrap();
    assert!(library.scan_now("prune").unwrap());

    assert_eq!(library.store().count().unwrap(), 1);
    assert_eq!(library.cards().len(), 1);
    assert!(library.card("Keep.json").is_some());
}

#[test]
fn test_scan_skips_files_that_are_not_cards() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Fox.json", "Fox", &[], "fine");
    fs::write(dir.path().join("Broken.json"), "{ not valid json").unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored entirely").unwrap();

    let library = open_library(dir.path());
    assert_eq!(library.store().count().unwrap(), 1);

    // The broken file keeps getting skipped, never deleted.
    assert!(!library.scan_now("broken").unwrap());
    assert!(dir.path().join("Broken.json").exists());
}

#[test]
fn test_force_reload_reflects_direct_store_writes() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Fox.json", "Fox", &[], "a fox");

    let library = open_library(dir.path());
    assert_eq!(library.cards().len(), 1);

    let mut record = library.store().get("Fox.json").unwrap().unwrap();
    record.id = "Late.json".to_string();
    record.name = "Late".to_string();
    library.store().upsert(&record).unwrap();

    library.force_reload("test");
    assert_eq!(library.cards().len(), 2);
    assert_eq!(library.card("Late.json").unwrap().name, "Late");
}

#[test]
fn test_refresh_card_after_notified_write() {
    let dir = TempDir::new().unwrap();
    write_card(dir.path(), "Fox.json", "Fox", &["a"], "a fox");

    let library = open_library(dir.path());

    // The mutation layer rewrote the file and tells the core about it.
    write_card(dir.path(), "Fox.json", "Fennec", &["a", "desert"], "smaller ears, hotter sand");
    let updated = library.refresh_card("Fox.json").unwrap().unwrap();

    assert_eq!(updated.name, "Fennec");
    assert_eq!(updated.tags, vec!["a", "desert"]);

    let record = library.store().get("Fox.json").unwrap().unwrap();
    assert_eq!(record.name, "Fennec");
    assert_eq!(record.file_hash.len(), 64);
    assert!(library.global_tags().contains(&"desert".to_string()));

    // A refresh leaves nothing for the next scan to repair.
    assert!(!library.scan_now("after-refresh").unwrap());
}
