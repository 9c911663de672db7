//! Materialization: copy-on-write promotion and upward propagation.

mod common;

use canopy_core::{InodeNumber, PathComponent};
use common::{TestMount, TreeSpec};

fn name(s: &str) -> PathComponent {
    s.parse().unwrap()
}

fn fixture() -> Vec<TreeSpec> {
    vec![
        TreeSpec::File("a", b"alpha\n"),
        TreeSpec::Dir("d", vec![TreeSpec::File("c", b"charlie\n")]),
    ]
}

#[tokio::test]
async fn write_materializes_up_the_parent_chain() {
    let tm = TestMount::with_tree(fixture()).await;

    let root = tm.resolve_tree("").await;
    let d = tm.resolve_tree("d").await;
    assert!(!root.is_materialized().await);
    assert!(!d.is_materialized().await);

    tm.write("d/c", b"changed\n").await;
    assert_eq!(tm.read("d/c").await, b"changed\n");

    // The file, its parent, and the root are all materialized now.
    let c = tm.resolve_file("d/c").await;
    assert!(c.is_materialized().await);
    assert!(d.is_materialized().await);
    assert!(root.is_materialized().await);

    // Overlay coverage: every materialized inode has a record, and the
    // root's persisted listing marks "d" materialized with its number.
    let overlay = tm.mount.overlay();
    assert!(overlay.has_file(c.core().number()));
    assert!(overlay.has_dir(d.core().number()));
    let root_record = overlay
        .load_dir(InodeNumber::ROOT)
        .unwrap()
        .expect("root must have an overlay record");
    let d_entry = &root_record.entries[&name("d")];
    assert_eq!(d_entry.inode_number, Some(d.core().number()));
    assert!(d_entry.hash.is_none(), "materialized entries drop their hash");

    // The sibling "a" is untouched and keeps its source-control hash.
    let a_entry = &root_record.entries[&name("a")];
    assert!(a_entry.hash.is_some());
}

#[tokio::test]
async fn read_does_not_materialize() {
    let tm = TestMount::with_tree(fixture()).await;
    assert_eq!(tm.read("d/c").await, b"charlie\n");
    assert!(!tm.resolve_tree("d").await.is_materialized().await);
    assert!(!tm.resolve_tree("").await.is_materialized().await);
    assert!(!tm.mount.overlay().has_dir(InodeNumber::ROOT));
}

#[tokio::test]
async fn materialization_is_idempotent() {
    let tm = TestMount::with_tree(fixture()).await;
    tm.write("d/c", b"one\n").await;
    tm.write("d/c", b"two\n").await;
    assert_eq!(tm.read("d/c").await, b"two\n");
    assert!(tm.resolve_tree("").await.is_materialized().await);
}

#[tokio::test]
async fn truncate_to_zero_materializes_without_blob_fetch() {
    let tm = TestMount::with_tree(fixture()).await;
    let a = tm.resolve_file("a").await;
    let blob_hash = a.content_hash().await.expect("a starts unmodified");

    a.truncate(0).await.unwrap();
    assert!(a.is_materialized().await);
    assert_eq!(tm.read("a").await, b"");
    // Truncation to zero never needed the old bytes.
    assert_eq!(tm.store.blob_fetch_count(blob_hash), 0);
}

#[tokio::test]
async fn chmod_materializes_and_updates_parent_entry() {
    let tm = TestMount::with_tree(fixture()).await;
    let a = tm.resolve_file("a").await;
    a.set_mode(0o600).await.unwrap();

    assert!(a.is_materialized().await);
    assert_eq!(a.mode().await & 0o7777, 0o600);
    let root_record = tm
        .mount
        .overlay()
        .load_dir(InodeNumber::ROOT)
        .unwrap()
        .expect("root materialized by chmod");
    assert_eq!(root_record.entries[&name("a")].mode & 0o7777, 0o600);
}

#[tokio::test]
async fn overlay_survives_inode_reload() {
    let tm = TestMount::with_tree(fixture()).await;
    tm.write("d/c", b"persisted\n").await;

    let d_ino = tm.inode_number("d").await;
    // Drop kernel references so the subtree unloads, then resolve again.
    let c_ino = tm.inode_number("d/c").await;
    tm.mount.forget(c_ino, 0).await;
    tm.mount.forget(d_ino, 0).await;

    // Even if the inode stayed loaded, the overlay holds the truth; a
    // fresh mount over the same overlay sees the modification.
    assert_eq!(tm.read("d/c").await, b"persisted\n");
}
