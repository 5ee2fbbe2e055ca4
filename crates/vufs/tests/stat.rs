mod common;

use common::*;
use vufs::{Data, Fcall, QidType, DEFAULT_USER};

#[tokio::test]
async fn a_fresh_root_belongs_to_adm() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    let st = stat(&mut c, 1).await;
    assert_eq!(st.name, "/");
    // directories, by convention, have length 0
    assert_eq!(st.length, 0);
    assert_eq!(st.uid, DEFAULT_USER);
    assert_eq!(st.gid, DEFAULT_USER);
    assert_eq!(st.muid, DEFAULT_USER);
    assert_eq!(st.mode, DMDIR | 0o777);
    assert!(st.qid.typ.contains(QidType::DIR));
}

#[tokio::test]
async fn write_updates_length_and_modifier() {
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

    let st = stat(&mut c, 2).await;
    assert_eq!(st.length, 12);
    assert_eq!(st.muid, "mark");
    assert_ne!(st.mtime, 0);
}

#[tokio::test]
async fn seeded_files_keep_their_sidecar_owner() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("whatever.txt"), b"whatever").unwrap();
    std::fs::write(root.path().join("whatever.txt.vufs"), b"mark:mark\n").unwrap();

    let fs = vufs::srv::VuFs::new(root.path()).await.unwrap();
    let server = fs.serve("127.0.0.1:0").await.unwrap();
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    walk(&mut c, 1, 2, &["whatever.txt"]).await;
    let st = stat(&mut c, 2).await;
    assert_eq!(st.uid, "mark");
    assert_eq!(st.gid, "mark");
    assert_eq!(st.length, 8);
}

#[tokio::test]
async fn stat_needs_a_known_fid() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    let ename = rpc_err(&mut c, 1, Fcall::Tstat { fid: 7 }).await;
    assert_eq!(ename, "fid not found");
}
