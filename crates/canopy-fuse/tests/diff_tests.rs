//! Diff: live tree vs source-control tree, with ignore rules.

mod common;

use canopy_fuse::DiffCollector;
use common::{TestMount, TreeSpec};

fn fixture() -> Vec<TreeSpec> {
    vec![
        TreeSpec::File("a", b"alpha\n"),
        TreeSpec::Dir(
            "d",
            vec![
                TreeSpec::File("c", b"charlie\n"),
                TreeSpec::Dir("deep", vec![TreeSpec::File("x", b"x\n")]),
            ],
        ),
    ]
}

#[tokio::test]
async fn unmodified_mount_has_empty_diff() {
    let tm = TestMount::with_tree(fixture()).await;
    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();
    let results = collector.results();
    assert!(results.untracked.is_empty());
    assert!(results.modified.is_empty());
    assert!(results.removed.is_empty());
    assert!(results.errors.is_empty());
}

#[tokio::test]
async fn unmodified_subtrees_are_pruned() {
    let tm = TestMount::with_tree(fixture()).await;

    // Load the subtree without modifying it, then diff.
    tm.read("d/c").await;
    let d_hash = tm.resolve_tree("d").await.tree_hash().await.unwrap();
    let fetches_before = tm.store.tree_fetch_count(d_hash);

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();

    // The root short-circuits on its own hash; "d" was never refetched.
    assert_eq!(tm.store.tree_fetch_count(d_hash), fetches_before);
    assert!(collector.results().modified.is_empty());
}

#[tokio::test]
async fn modified_and_untracked_and_removed() {
    let tm = TestMount::with_tree(fixture()).await;

    tm.write("d/c", b"edited\n").await;
    tm.create("", "untracked.txt").await;
    tm.unlink("", "a").await.unwrap();

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();
    let results = collector.results();

    assert_eq!(
        results.modified.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        ["d/c"]
    );
    assert_eq!(
        results.untracked.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        ["untracked.txt"]
    );
    assert_eq!(
        results.removed.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        ["a"]
    );
}

#[tokio::test]
async fn reverted_edit_diffs_clean() {
    let tm = TestMount::with_tree(fixture()).await;

    // Materialize with different bytes, then put the original back: the
    // file stays materialized but its contents match the blob again.
    tm.write("a", b"other\n").await;
    tm.write("a", b"alpha\n").await;

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();
    assert!(collector.results().modified.is_empty());
}

#[tokio::test]
async fn removed_directory_reports_every_contained_file() {
    let tm = TestMount::with_tree(fixture()).await;

    // Remove the whole "d" subtree locally.
    tm.unlink("d/deep", "x").await.unwrap();
    tm.rmdir("d", "deep").await.unwrap();
    tm.unlink("d", "c").await.unwrap();
    tm.rmdir("", "d").await.unwrap();

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();
    let removed: Vec<_> = collector
        .results()
        .removed
        .iter()
        .map(|p| p.as_str().to_string())
        .collect();
    assert_eq!(removed, ["d/c", "d/deep/x"]);
}

#[tokio::test]
async fn gitignore_rules_hide_untracked_files() {
    let tm = TestMount::with_tree(fixture()).await;

    let root = tm.resolve_tree("").await;
    let ignore = root
        .create(&tm.name(".gitignore"), 0o644, &tm.ctx())
        .await
        .unwrap();
    ignore.write(0, b"*.log\n").await.unwrap();

    tm.create("", "build.log").await;
    tm.create("d", "inner.log").await;
    tm.create("", "kept.txt").await;

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();
    let results = collector.results();
    let untracked: Vec<_> = results.untracked.iter().map(|p| p.as_str()).collect();
    assert!(untracked.contains(&".gitignore"));
    assert!(untracked.contains(&"kept.txt"));
    assert!(!untracked.iter().any(|p| p.ends_with(".log")));
    assert!(results.ignored.is_empty(), "ignored files are skipped unless requested");
}

#[tokio::test]
async fn list_ignored_reports_ignored_files() {
    let tm = TestMount::with_tree(fixture()).await;

    let root = tm.resolve_tree("").await;
    let ignore = root
        .create(&tm.name(".gitignore"), 0o644, &tm.ctx())
        .await
        .unwrap();
    ignore.write(0, b"*.log\n").await.unwrap();
    tm.create("", "build.log").await;

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, true)
        .await
        .unwrap();
    let results = collector.results();
    assert_eq!(
        results.ignored.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        ["build.log"]
    );
}

#[tokio::test]
async fn deeper_gitignore_overrides_parent() {
    let tm = TestMount::with_tree(fixture()).await;

    let root = tm.resolve_tree("").await;
    root.create(&tm.name(".gitignore"), 0o644, &tm.ctx())
        .await
        .unwrap()
        .write(0, b"*.gen\n")
        .await
        .unwrap();
    let d = tm.resolve_tree("d").await;
    d.create(&tm.name(".gitignore"), 0o644, &tm.ctx())
        .await
        .unwrap()
        .write(0, b"!special.gen\n")
        .await
        .unwrap();

    tm.create("", "top.gen").await;
    tm.create("d", "special.gen").await;

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();
    let untracked: Vec<_> = collector
        .results()
        .untracked
        .iter()
        .map(|p| p.as_str().to_string())
        .collect();
    assert!(untracked.contains(&"d/special.gen".to_string()));
    assert!(!untracked.contains(&"top.gen".to_string()));
}

#[tokio::test]
async fn mode_change_is_a_modification() {
    let tm = TestMount::with_tree(fixture()).await;
    let a = tm.resolve_file("a").await;
    a.set_mode(0o755).await.unwrap();

    let collector = DiffCollector::new();
    tm.mount
        .diff(tm.root_tree, &collector, false)
        .await
        .unwrap();
    assert_eq!(
        collector
            .results()
            .modified
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>(),
        ["a"]
    );
}

#[tokio::test]
async fn diff_against_nothing_reports_everything_untracked() {
    let tm = TestMount::with_tree(vec![TreeSpec::File("solo", b"s\n")]).await;
    let collector = DiffCollector::new();
    tm.mount.diff(None, &collector, false).await.unwrap();
    assert_eq!(
        collector
            .results()
            .untracked
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>(),
        ["solo"]
    );
}
