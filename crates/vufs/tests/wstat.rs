mod common;

use common::*;
use std::os::unix::fs::PermissionsExt;
use vufs::{Data, Fcall};

#[tokio::test]
async fn rename_moves_the_sidecar_too() {
    let (server, root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "a.txt", 0o644, OREAD).await;

    let mut st = null_stat();
    st.name = "b.txt".to_owned();
    rpc_ok(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;

    let renamed = stat(&mut c, 2).await;
    assert_eq!(renamed.name, "b.txt");

    assert!(root.path().join("b.txt").exists());
    assert!(root.path().join("b.txt.vufs").exists());
    assert!(!root.path().join("a.txt").exists());
    assert!(!root.path().join("a.txt.vufs").exists());

    // the tree agrees with the disk
    walk(&mut c, 1, 3, &["b.txt"]).await;
    let ename = rpc_err(
        &mut c,
        1,
        Fcall::Twalk {
            fid: 1,
            newfid: 4,
            wnames: vec!["a.txt".to_owned()],
        },
    )
    .await;
    assert_eq!(ename, "'a.txt' not found");
}

#[tokio::test]
async fn rename_refuses_collisions_and_sidecar_names() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "a.txt", 0o644, OREAD).await;
    create(&mut c, 1, 3, "b.txt", 0o644, OREAD).await;

    let mut st = null_stat();
    st.name = "b.txt".to_owned();
    let ename = rpc_err(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;
    assert_eq!(ename, "already exists");

    let mut st = null_stat();
    st.name = "evil.vufs".to_owned();
    let ename = rpc_err(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;
    assert_eq!(ename, "invalid file name");
}

#[tokio::test]
async fn chmod_reaches_the_host_file() {
    let (server, root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "t.txt", 0o644, OREAD).await;

    let mut st = null_stat();
    st.mode = 0o600;
    rpc_ok(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;

    assert_eq!(stat(&mut c, 2).await.mode, 0o600);
    let host = std::fs::metadata(root.path().join("t.txt")).unwrap();
    assert_eq!(host.permissions().mode() & 0o777, 0o600);
}

#[tokio::test]
async fn truncate_sets_the_length() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "t.txt", 0o644, OWRITE).await;
    rpc_ok(
        &mut c,
        1,
        Fcall::Twrite {
            fid: 2,
            offset: 0,
            data: Data(b"Hello World!".to_vec()),
        },
    )
    .await;

    let mut st = null_stat();
    st.length = 5;
    rpc_ok(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;

    assert_eq!(stat(&mut c, 2).await.length, 5);
    assert_eq!(read(&mut c, 2, 0, 100).await, b"Hello");

    let mut st = null_stat();
    st.length = 0;
    rpc_ok(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;
    assert!(read(&mut c, 2, 0, 100).await.is_empty());
}

#[tokio::test]
async fn directories_cannot_be_truncated() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    walk(&mut c, 1, 2, &[]).await;
    let mut st = null_stat();
    st.length = 0;
    let ename = rpc_err(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;
    assert_eq!(ename, "can't truncate a directory");
}

#[tokio::test]
async fn ownership_change_rewrites_the_sidecar() {
    let (server, root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "t.txt", 0o644, OREAD).await;

    let mut st = null_stat();
    st.uid = "glenda".to_owned();
    rpc_ok(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;

    let after = stat(&mut c, 2).await;
    assert_eq!(after.uid, "glenda");
    // unset gid keeps its old value
    assert_eq!(after.gid, "adm");

    let sidecar = std::fs::read_to_string(root.path().join("t.txt.vufs")).unwrap();
    assert_eq!(sidecar, "glenda:adm\n");
}

#[tokio::test]
async fn times_can_be_set_together_or_alone() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "t.txt", 0o644, OREAD).await;

    let mut st = null_stat();
    st.mtime = 12345;
    rpc_ok(&mut c, 1, Fcall::Twstat { fid: 2, stat: st }).await;

    let after = stat(&mut c, 2).await;
    assert_eq!(after.mtime, 12345);
}

#[tokio::test]
async fn a_null_wstat_changes_nothing() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "t.txt", 0o644, OREAD).await;
    let before = stat(&mut c, 2).await;

    rpc_ok(
        &mut c,
        1,
        Fcall::Twstat {
            fid: 2,
            stat: null_stat(),
        },
    )
    .await;

    let after = stat(&mut c, 2).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn rename_requires_write_on_the_parent() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    create(&mut c, 1, 2, "d", DMDIR | 0o755, OREAD).await;
    clunk(&mut c, 2).await;
    walk(&mut c, 1, 3, &["d"]).await;
    rpc_ok(
        &mut c,
        1,
        Fcall::Tcreate {
            fid: 3,
            name: "f".to_owned(),
            perm: 0o644,
            mode: OREAD,
        },
    )
    .await;

    walk(&mut c, 1, 4, &["d"]).await;
    let mut lock = null_stat();
    lock.mode = 0o555;
    rpc_ok(&mut c, 1, Fcall::Twstat { fid: 4, stat: lock }).await;

    let mut st = null_stat();
    st.name = "g".to_owned();
    let ename = rpc_err(&mut c, 1, Fcall::Twstat { fid: 3, stat: st }).await;
    assert_eq!(ename, "permission denied");
}
