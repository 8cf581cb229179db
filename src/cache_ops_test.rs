//! Incremental cache operations: counts, re-keying, tags, favorites.

use std::path::Path;
use std::sync::Arc;

use crate::cache::{Card, CardPatch, MetadataCache, VersionEntry};
use crate::paths;
use crate::store::CardRecord;

fn cache() -> MetadataCache {
    MetadataCache::new(Path::new("/nonexistent-library"))
}

fn card(id: &str, tags: &[&str], mtime: f64) -> Card {
    let record = CardRecord {
        id: id.to_string(),
        name: id.rsplit('/').next().unwrap().to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        category: paths::parent_category(id).to_string(),
        last_modified: mtime,
        file_size: 10,
        token_count: 5,
        ..Default::default()
    };
    Card::from_record(&record)
}

fn bundle(dir: &str, version_ids: &[&str], mtime: f64) -> Card {
    let mut leader = card(version_ids[0], &[], mtime);
    leader.is_bundle = true;
    leader.bundle_dir = dir.to_string();
    leader.category = paths::parent_category(dir).to_string();
    leader.versions = version_ids
        .iter()
        .map(|id| VersionEntry {
            id: id.to_string(),
            filename: id.rsplit('/').next().unwrap().to_string(),
            last_modified: mtime,
            version: String::new(),
        })
        .collect();
    leader
}

#[test]
fn test_add_card_counts_root_and_categories() {
    let cache = cache();
    cache.add_card(card("Fox.png", &["a"], 100.0));
    cache.add_card(card("Cats/Tom.png", &["a", "b"], 100.0));

    assert_eq!(cache.snapshot().len(), 2);
    assert_eq!(cache.global_tags(), vec!["a", "b"]);

    let counts = cache.category_counts();
    assert_eq!(counts.get(""), Some(&1));
    assert_eq!(counts.get("Cats"), Some(&1));
}

#[test]
fn test_counts_roll_up_to_ancestors() {
    let cache = cache();
    cache.add_card(card("a/b/c/deep.png", &[], 1.0));
    cache.add_card(card("a/b/shallow.png", &[], 1.0));

    let counts = cache.category_counts();
    assert_eq!(counts.get("a"), Some(&2));
    assert_eq!(counts.get("a/b"), Some(&2));
    assert_eq!(counts.get("a/b/c"), Some(&1));
    assert_eq!(counts.get(""), None);
}

#[test]
fn test_update_fields_patches_and_regenerates_urls() {
    let cache = cache();
    cache.add_card(card("Fox.png", &[], 100.0));

    let updated = cache
        .update_fields(
            "Fox.png",
            &CardPatch {
                name: Some("Renard".to_string()),
                last_modified: Some(250.9),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(updated.name, "Renard");
    assert_eq!(updated.image_url, "/cards_file/Fox.png?t=250");
    assert_eq!(updated.thumb_url, "/api/thumbnail/Fox.png?t=250");

    // The list slot references the patched entry, not a stale copy.
    let listed = cache.get("Fox.png").unwrap();
    assert_eq!(listed.name, "Renard");
}

#[test]
fn test_update_fields_category_change_moves_counts() {
    let cache = cache();
    cache.add_card(card("Cats/Tom.png", &[], 1.0));

    cache
        .update_fields(
            "Cats/Tom.png",
            &CardPatch {
                category: Some("Dogs".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let counts = cache.category_counts();
    assert_eq!(counts.get("Cats"), Some(&0));
    assert_eq!(counts.get("Dogs"), Some(&1));
}

#[test]
fn test_update_fields_unknown_id_is_noop() {
    let cache = cache();
    cache.add_card(card("Fox.png", &[], 1.0));

    assert!(cache
        .update_fields("Ghost.png", &CardPatch::default())
        .is_none());
    assert_eq!(cache.snapshot().len(), 1);
}

#[test]
fn test_move_card_rekeys_and_adjusts_counts() {
    let cache = cache();
    cache.add_card(card("Cats/Tom.png", &[], 100.0));

    let moved = cache.move_card(
        "Cats/Tom.png",
        "Dogs/Tom.png",
        "Cats",
        "Dogs",
        "Tom.png",
        Path::new("/nonexistent-library/Dogs/Tom.png"),
    );
    assert!(moved);

    assert!(cache.get("Cats/Tom.png").is_none());
    let card = cache.get("Dogs/Tom.png").unwrap();
    assert_eq!(card.category, "Dogs");
    // Stat failed for the nonexistent path, so the old mtime survives.
    assert_eq!(card.last_modified, 100.0);
    assert_eq!(card.image_url, "/cards_file/Dogs/Tom.png?t=100");

    let counts = cache.category_counts();
    assert_eq!(counts.get("Cats"), Some(&0));
    assert_eq!(counts.get("Dogs"), Some(&1));
}

#[test]
fn test_move_card_refuses_bundle_version_alias() {
    let cache = cache();
    cache.add_card(bundle(
        "Cats/Tom",
        &["Cats/Tom/Tom_v2.png", "Cats/Tom/Tom.png"],
        200.0,
    ));

    // The non-leading version id aliases the bundle; a card move must not
    // tear it apart.
    assert!(!cache.move_card(
        "Cats/Tom/Tom.png",
        "Cats/Tom.png",
        "Cats/Tom",
        "Cats",
        "Tom.png",
        Path::new("/nonexistent-library/Cats/Tom.png"),
    ));
    assert!(cache.get("Cats/Tom/Tom.png").is_some());
}

#[test]
fn test_move_folder_rekeys_everything_without_loss() {
    let cache = cache();
    cache.add_card(card("A/x.png", &[], 1.0));
    cache.add_card(card("A/sub/y.png", &[], 1.0));
    cache.add_card(card("B/z.png", &[], 1.0));

    let before_total: i64 = {
        let counts = cache.category_counts();
        *counts.get("A").unwrap() + *counts.get("B").unwrap()
    };

    assert!(cache.move_folder("A", "C"));

    assert!(cache.get("A/x.png").is_none());
    assert!(cache.get("A/sub/y.png").is_none());
    assert_eq!(cache.get("C/x.png").unwrap().category, "C");
    assert_eq!(cache.get("C/sub/y.png").unwrap().category, "C/sub");
    assert_eq!(cache.get("B/z.png").unwrap().category, "B");
    assert_eq!(cache.snapshot().len(), 3);

    let counts = cache.category_counts();
    assert_eq!(counts.get("C"), Some(&2));
    assert_eq!(counts.get("C/sub"), Some(&1));
    assert!(counts.get("A").is_none());
    let after_total = *counts.get("C").unwrap() + *counts.get("B").unwrap();
    assert_eq!(before_total, after_total);
}

#[test]
fn test_move_folder_does_not_touch_similar_prefixes() {
    let cache = cache();
    cache.add_card(card("Art/x.png", &[], 1.0));
    cache.add_card(card("Artwork/y.png", &[], 1.0));

    cache.move_folder("Art", "Sketches");

    assert!(cache.get("Sketches/x.png").is_some());
    assert!(cache.get("Artwork/y.png").is_some());
}

#[test]
fn test_move_bundle_rekeys_all_version_aliases() {
    let cache = cache();
    cache.add_card(card("Cats/Whiskers.png", &[], 1.0));
    cache.add_card(bundle(
        "Cats/Tom",
        &["Cats/Tom/Tom_v2.png", "Cats/Tom/Tom.png"],
        200.0,
    ));

    assert!(cache.move_bundle("Cats/Tom", "Archive/Tom", "Cats", "Archive"));

    assert!(cache.get("Cats/Tom/Tom.png").is_none());
    let via_alias = cache.get("Archive/Tom/Tom.png").unwrap();
    let via_leader = cache.get("Archive/Tom/Tom_v2.png").unwrap();
    assert!(Arc::ptr_eq(&via_alias, &via_leader));
    assert_eq!(via_leader.bundle_dir, "Archive/Tom");
    assert_eq!(via_leader.category, "Archive");
    assert_eq!(via_leader.versions[0].id, "Archive/Tom/Tom_v2.png");
    assert_eq!(via_leader.versions[1].id, "Archive/Tom/Tom.png");

    assert_eq!(
        cache.bundle_leader("Archive/Tom"),
        Some("Archive/Tom/Tom_v2.png".to_string())
    );
    assert!(cache.bundle_leader("Cats/Tom").is_none());

    let counts = cache.category_counts();
    assert_eq!(counts.get("Cats"), Some(&1));
    assert_eq!(counts.get("Archive"), Some(&1));
    // One display entity moved, two aliases re-keyed, list length stable.
    assert_eq!(cache.snapshot().len(), 2);
}

#[test]
fn test_delete_card_and_absent_delete() {
    let cache = cache();
    cache.add_card(card("Fox.png", &[], 1.0));
    cache.add_card(card("Cats/Tom.png", &[], 1.0));

    assert!(cache.delete_card("Cats/Tom.png"));
    assert!(cache.get("Cats/Tom.png").is_none());
    assert_eq!(cache.snapshot().len(), 1);
    assert_eq!(cache.category_counts().get("Cats"), Some(&0));

    // Deleting something that is not there is a silent no-op.
    assert!(!cache.delete_card("Ghost.png"));
    assert_eq!(cache.snapshot().len(), 1);
}

#[test]
fn test_delete_bundle_decrements_once() {
    let cache = cache();
    cache.add_card(card("Cats/Whiskers.png", &[], 1.0));
    cache.add_card(bundle(
        "Cats/Tom",
        &["Cats/Tom/Tom_v2.png", "Cats/Tom/Tom.png"],
        200.0,
    ));
    assert_eq!(cache.category_counts().get("Cats"), Some(&2));

    assert!(cache.delete_bundle("Cats/Tom"));

    assert!(cache.get("Cats/Tom/Tom_v2.png").is_none());
    assert!(cache.get("Cats/Tom/Tom.png").is_none());
    assert!(cache.bundle_leader("Cats/Tom").is_none());
    assert_eq!(cache.snapshot().len(), 1);
    assert_eq!(cache.category_counts().get("Cats"), Some(&1));

    assert!(!cache.delete_bundle("Cats/Tom"));
}

#[test]
fn test_update_tags_grows_global_pool() {
    let cache = cache();
    cache.add_card(card("Fox.png", &["a"], 1.0));
    cache.add_card(card("Cats/Tom.png", &["b"], 1.0));

    assert!(cache.update_tags("Fox.png", &["c".to_string(), "a".to_string()]));
    assert_eq!(cache.get("Fox.png").unwrap().tags, vec!["c", "a"]);
    // The pool is a union; removed tags linger until the next rebuild.
    assert_eq!(cache.global_tags(), vec!["a", "b", "c"]);

    assert!(!cache.update_tags("Ghost.png", &[]));
}

#[test]
fn test_toggle_favorite() {
    let cache = cache();
    cache.add_card(card("Fox.png", &[], 1.0));

    assert!(cache.toggle_favorite("Fox.png", true));
    assert!(cache.get("Fox.png").unwrap().favorite);
    assert!(cache.toggle_favorite("Fox.png", false));
    assert!(!cache.get("Fox.png").unwrap().favorite);
    assert!(!cache.toggle_favorite("Ghost.png", true));
}

#[test]
fn test_snapshot_is_stable_while_mutating() {
    let cache = cache();
    cache.add_card(card("Fox.png", &[], 100.0));

    let before = cache.snapshot();
    cache.update_fields(
        "Fox.png",
        &CardPatch {
            name: Some("changed".to_string()),
            ..Default::default()
        },
    );

    // The old snapshot still sees the pre-mutation card; a new one sees
    // the patched entry.
    assert_eq!(before[0].name, "Fox.png");
    assert_eq!(cache.snapshot()[0].name, "changed");
}
