//! Create/remove/lookup behavior of the projected tree.

mod common;

use canopy_core::{InodeNumber, JournalChange};
use canopy_fuse::{FsError, RequestContext, RESERVED_NAME};
use common::{TestMount, TreeSpec};
use std::time::Duration;

fn base_fixture() -> Vec<TreeSpec> {
    vec![
        TreeSpec::File("a", b"alpha\n"),
        TreeSpec::Dir(
            "d",
            vec![
                TreeSpec::File("b", b"bravo\n"),
                TreeSpec::File("c", b"charlie\n"),
            ],
        ),
    ]
}

#[tokio::test]
async fn lazy_load_of_initial_tree() {
    let tm = TestMount::with_tree(base_fixture()).await;

    // Root was loaded once at mount time; nlink counts entries + "." + "..".
    let attr = tm.mount.root().getattr().await;
    assert_eq!(attr.nlink, 4);
    assert_eq!(attr.ino, InodeNumber::ROOT.get());

    let root_hash = tm.resolve_tree("").await.tree_hash().await;
    assert!(root_hash.is_some(), "fresh root should be unmodified");

    // Looking up "d" loads the subtree; "d/c" then resolves inside it.
    let d = tm.resolve_tree("d").await;
    let d_tree_hash = d.tree_hash().await.expect("d should be unmodified");
    let c = tm.resolve("d/c").await.unwrap();
    assert!(c.as_file().is_some());
    assert_eq!(tm.read("d/c").await, b"charlie\n");

    // Repeated lookups reuse the loaded inode: the object store sees one
    // fetch per unique tree hash.
    tm.resolve("d").await.unwrap();
    tm.resolve("d/c").await.unwrap();
    assert_eq!(tm.store.tree_fetch_count(d_tree_hash), 1);
    assert_eq!(tm.store.tree_fetch_count(tm.root_tree.unwrap()), 1);
}

#[tokio::test]
async fn lookup_missing_entry_is_not_found() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let err = tm.resolve("nope").await.unwrap_err();
    assert!(matches!(err, FsError::NotFound));
}

#[tokio::test]
async fn negative_lookup_is_cacheable() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let ctx = RequestContext::kernel();

    let reply = tm
        .dispatcher
        .lookup(&ctx, InodeNumber::ROOT.get(), "nope")
        .await
        .expect("negative lookup must not error");
    assert!(reply.is_negative());
    assert_eq!(reply.ino, 0);
    assert_eq!(reply.entry_ttl, Duration::MAX);
}

#[tokio::test]
async fn create_then_unlink_restores_listing() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let before = tm.listing("d").await;

    tm.create("d", "new.txt").await;
    assert!(tm.listing("d").await.contains(&"new.txt".to_string()));

    tm.unlink("d", "new.txt").await.unwrap();
    assert_eq!(tm.listing("d").await, before);

    let deltas = tm.mount.journal().snapshot();
    assert!(matches!(deltas[0].change, JournalChange::Created(ref p) if p.as_str() == "d/new.txt"));
    assert!(matches!(deltas[1].change, JournalChange::Removed(ref p) if p.as_str() == "d/new.txt"));
}

#[tokio::test]
async fn mkdir_then_rmdir_restores_listing() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let before = tm.listing("").await;

    let sub = tm.mkdir("", "newdir").await;
    assert!(sub.is_materialized().await);
    assert!(tm.mount.overlay().has_dir(sub.core().number()));

    tm.rmdir("", "newdir").await.unwrap();
    assert_eq!(tm.listing("").await, before);
}

#[tokio::test]
async fn create_existing_name_fails() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let root = tm.resolve_tree("").await;
    let ctx = tm.ctx();

    // mkdir over an existing name is a normal user error.
    let err = root.mkdir(&tm.name("a"), 0o755, &ctx).await.unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists));

    // create over an existing name is an internal bug (the kernel layer
    // deduplicates), surfaced as EIO.
    let err = root.create(&tm.name("a"), 0o644, &ctx).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EIO);
}

#[tokio::test]
async fn unlink_requires_a_file_and_rmdir_a_directory() {
    let tm = TestMount::with_tree(base_fixture()).await;
    assert!(matches!(tm.unlink("", "d").await.unwrap_err(), FsError::IsDir));
    assert!(matches!(tm.rmdir("", "a").await.unwrap_err(), FsError::NotDir));
    assert!(matches!(
        tm.rmdir("", "d").await.unwrap_err(),
        FsError::NotEmpty
    ));
}

#[tokio::test]
async fn mknod_is_restricted_to_sockets() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let root = tm.resolve_tree("").await;
    let ctx = tm.ctx();

    let err = root
        .mknod(&tm.name("dev"), libc::S_IFBLK as u32 | 0o644, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NotPermitted));

    let sock = root
        .mknod(&tm.name("sock"), libc::S_IFSOCK as u32 | 0o600, &ctx)
        .await
        .unwrap();
    assert_eq!(
        sock.mode().await & libc::S_IFMT as u32,
        libc::S_IFSOCK as u32
    );
}

#[tokio::test]
async fn hard_links_are_refused() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let ctx = RequestContext::kernel();
    let ino = tm.inode_number("a").await;
    let err = tm
        .dispatcher
        .link(&ctx, ino.get(), "a-link")
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EPERM);
}

#[tokio::test]
async fn symlink_round_trip() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let root = tm.resolve_tree("").await;
    let link = root
        .symlink(&tm.name("link"), b"d/c", &tm.ctx())
        .await
        .unwrap();
    assert_eq!(link.readlink().await.unwrap(), b"d/c");

    // readlink on a regular file is invalid.
    let file = tm.resolve_file("a").await;
    assert!(matches!(file.readlink().await.unwrap_err(), FsError::Invalid));
}

#[tokio::test]
async fn reserved_directory_is_projected_and_protected() {
    let tm = TestMount::with_tree(base_fixture()).await;

    // The reserved name resolves from the root without an entry existing.
    let reserved = tm.resolve(RESERVED_NAME).await.unwrap();
    assert_eq!(reserved.number(), InodeNumber::RESERVED);

    // It never appears in the listing and cannot be shadowed.
    assert!(!tm.listing("").await.contains(&RESERVED_NAME.to_string()));
    let root = tm.resolve_tree("").await;
    let err = root
        .mkdir(&tm.name(RESERVED_NAME), 0o755, &tm.ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists));

    // Nothing directly under it can be removed, even entries we put there.
    let reserved = reserved.as_tree().unwrap();
    reserved
        .create(&tm.name("pinned"), 0o644, &tm.ctx())
        .await
        .unwrap();
    let err = reserved
        .unlink(&tm.name("pinned"), &tm.ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NotPermitted));
}

#[tokio::test]
async fn forget_unloads_idle_inodes() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let ctx = RequestContext::kernel();

    let reply = tm
        .dispatcher
        .lookup(&ctx, InodeNumber::ROOT.get(), "d")
        .await
        .unwrap();
    let d_ino = InodeNumber(reply.ino);
    assert!(tm.mount.is_loaded(d_ino));

    // One kernel reference; forgetting it makes the inode eligible for
    // unload once our own references are gone.
    tm.dispatcher.forget(reply.ino, 1).await;
    assert!(!tm.mount.is_loaded(d_ino));

    // The path still resolves afterwards (reloaded on demand) and keeps
    // its inode number.
    assert_eq!(tm.inode_number("d").await, d_ino);
}

#[tokio::test]
async fn forget_keeps_directories_with_loaded_children() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let ctx = RequestContext::kernel();

    let d_reply = tm
        .dispatcher
        .lookup(&ctx, InodeNumber::ROOT.get(), "d")
        .await
        .unwrap();
    let c_reply = tm.dispatcher.lookup(&ctx, d_reply.ino, "c").await.unwrap();

    // The kernel dropped the directory dentry but still references the
    // child; the child's back edge is non-owning, so the directory must
    // stay resident.
    tm.dispatcher.forget(d_reply.ino, 1).await;
    assert!(tm.mount.is_loaded(InodeNumber(d_reply.ino)));
    assert!(tm.mount.is_loaded(InodeNumber(c_reply.ino)));

    // The child still works through its parent chain.
    assert_eq!(tm.read("d/c").await, b"charlie\n");

    // Once the child is forgotten too, it unloads.
    tm.dispatcher.forget(c_reply.ino, 1).await;
    assert!(!tm.mount.is_loaded(InodeNumber(c_reply.ino)));
}

#[tokio::test]
async fn readdir_lists_dot_entries_first() {
    let tm = TestMount::with_tree(base_fixture()).await;
    let ctx = RequestContext::kernel();
    let fh = tm
        .dispatcher
        .opendir(&ctx, InodeNumber::ROOT.get())
        .await
        .unwrap();
    let entries = tm.dispatcher.readdir(&ctx, fh, 0).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, [".", "..", "a", "d"]);
    tm.dispatcher.releasedir(fh).await;
}
