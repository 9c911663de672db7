//! Rename: the multi-lock protocol, validation, and journaling.

mod common;

use canopy_core::JournalChange;
use canopy_fuse::FsError;
use common::{TestMount, TreeSpec};

fn fixture() -> Vec<TreeSpec> {
    vec![
        TreeSpec::File("a", b"alpha\n"),
        TreeSpec::File("b", b"bravo\n"),
        TreeSpec::Dir("d", vec![TreeSpec::File("c", b"charlie\n")]),
        TreeSpec::Dir("e", vec![]),
    ]
}

#[tokio::test]
async fn rename_across_parents() {
    let tm = TestMount::with_tree(fixture()).await;
    let c_ino = tm.inode_number("d/c").await;

    tm.rename("d", "c", "e", "f").await.unwrap();

    // Both parents became materialized by the rename.
    assert!(tm.resolve_tree("d").await.is_materialized().await);
    assert!(tm.resolve_tree("e").await.is_materialized().await);

    // The entry moved and kept its inode number.
    assert!(!tm.listing("d").await.contains(&"c".to_string()));
    assert_eq!(tm.listing("e").await, ["f"]);
    assert_eq!(tm.inode_number("e/f").await, c_ino);
    assert_eq!(tm.read("e/f").await, b"charlie\n");
    assert!(matches!(tm.resolve("d/c").await.unwrap_err(), FsError::NotFound));

    // Exactly one rename delta.
    let renames: Vec<_> = tm
        .mount
        .journal()
        .snapshot()
        .into_iter()
        .filter(|d| matches!(d.change, JournalChange::Renamed { .. }))
        .collect();
    assert_eq!(renames.len(), 1);
    match &renames[0].change {
        JournalChange::Renamed { from, to } => {
            assert_eq!(from.as_str(), "d/c");
            assert_eq!(to.as_str(), "e/f");
        }
        other => panic!("unexpected delta {other:?}"),
    }
}

#[tokio::test]
async fn rename_within_one_directory() {
    let tm = TestMount::with_tree(fixture()).await;
    let before_ino = tm.inode_number("a").await;
    tm.rename("", "a", "", "a2").await.unwrap();
    assert_eq!(tm.inode_number("a2").await, before_ino);
    assert!(matches!(tm.resolve("a").await.unwrap_err(), FsError::NotFound));
}

#[tokio::test]
async fn rename_back_restores_both_listings() {
    let tm = TestMount::with_tree(fixture()).await;
    let root_before = tm.listing("").await;
    let d_before = tm.listing("d").await;

    tm.rename("d", "c", "", "c-moved").await.unwrap();
    tm.rename("", "c-moved", "d", "c").await.unwrap();

    assert_eq!(tm.listing("").await, root_before);
    assert_eq!(tm.listing("d").await, d_before);
    assert_eq!(tm.read("d/c").await, b"charlie\n");
}

#[tokio::test]
async fn rename_replaces_existing_file() {
    let tm = TestMount::with_tree(fixture()).await;
    tm.rename("", "a", "", "b").await.unwrap();
    assert_eq!(tm.read("b").await, b"alpha\n");
    assert!(matches!(tm.resolve("a").await.unwrap_err(), FsError::NotFound));
}

#[tokio::test]
async fn rename_validation_errors() {
    let tm = TestMount::with_tree(fixture()).await;

    // Source missing.
    assert!(matches!(
        tm.rename("", "ghost", "", "x").await.unwrap_err(),
        FsError::NotFound
    ));
    // File over directory.
    assert!(matches!(
        tm.rename("", "a", "", "d").await.unwrap_err(),
        FsError::IsDir
    ));
    // Directory over file.
    assert!(matches!(
        tm.rename("", "d", "", "a").await.unwrap_err(),
        FsError::NotDir
    ));
    // Directory over non-empty directory.
    let tm2 = TestMount::with_tree(vec![
        TreeSpec::Dir("d", vec![TreeSpec::File("c", b"x")]),
        TreeSpec::Dir("e", vec![TreeSpec::File("f", b"y")]),
    ])
    .await;
    assert!(matches!(
        tm2.rename("", "d", "", "e").await.unwrap_err(),
        FsError::NotEmpty
    ));
}

#[tokio::test]
async fn rename_into_own_descendant_is_refused() {
    let tm = TestMount::with_tree(vec![TreeSpec::Dir(
        "d",
        vec![TreeSpec::Dir("inner", vec![])],
    )])
    .await;
    let root_before = tm.listing("").await;
    let d_before = tm.listing("d").await;

    let err = tm.rename("", "d", "d/inner", "dd").await.unwrap_err();
    assert!(matches!(err, FsError::Invalid));

    // Nothing moved.
    assert_eq!(tm.listing("").await, root_before);
    assert_eq!(tm.listing("d").await, d_before);
}

#[tokio::test]
async fn rename_into_deep_descendant_is_refused() {
    // The destination parent is several levels below the source, so the
    // ancestor walk has to follow the whole intermediate chain.
    let tm = TestMount::with_tree(vec![TreeSpec::Dir(
        "d",
        vec![TreeSpec::Dir(
            "a",
            vec![TreeSpec::Dir("b", vec![TreeSpec::Dir("c", vec![])])],
        )],
    )])
    .await;
    let root_before = tm.listing("").await;

    let err = tm.rename("", "d", "d/a/b/c", "dd").await.unwrap_err();
    assert!(matches!(err, FsError::Invalid));

    assert_eq!(tm.listing("").await, root_before);
    assert_eq!(tm.listing("d/a/b/c").await, Vec::<String>::new());
}

#[tokio::test]
async fn rename_directory_over_empty_directory() {
    let tm = TestMount::with_tree(fixture()).await;
    tm.rename("", "d", "", "e").await.unwrap();
    assert_eq!(tm.listing("e").await, ["c"]);
    assert!(matches!(tm.resolve("d").await.unwrap_err(), FsError::NotFound));
}

#[tokio::test]
async fn rename_onto_itself_is_a_noop() {
    let tm = TestMount::with_tree(fixture()).await;
    let journal_before = tm.mount.journal().len();
    tm.rename("", "a", "", "a").await.unwrap();
    assert_eq!(tm.read("a").await, b"alpha\n");
    assert_eq!(tm.mount.journal().len(), journal_before);
}
