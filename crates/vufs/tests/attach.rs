mod common;

use common::*;
use vufs::{Fcall, QidType, MAX_MSIZE, NOFID, NOTAG, P92000};

async fn negotiate(c: &mut tokio::net::TcpStream) {
    rpc_ok(
        c,
        NOTAG,
        Fcall::Tversion {
            msize: MAX_MSIZE,
            version: P92000.to_owned(),
        },
    )
    .await;
}

#[tokio::test]
async fn attach_binds_the_root() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    negotiate(&mut c).await;

    let rx = rpc_ok(
        &mut c,
        1,
        Fcall::Tattach {
            fid: 1,
            afid: NOFID,
            uname: "mark".to_owned(),
            aname: "/".to_owned(),
        },
    )
    .await;

    match rx {
        Fcall::Rattach { qid } => assert!(qid.typ.contains(QidType::DIR)),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn attach_is_root_only() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    negotiate(&mut c).await;

    let ename = rpc_err(
        &mut c,
        1,
        Fcall::Tattach {
            fid: 1,
            afid: NOFID,
            uname: "mark".to_owned(),
            aname: "/usr".to_owned(),
        },
    )
    .await;
    assert_eq!(ename, "can only attach to root directory");
}

#[tokio::test]
async fn attach_rejects_an_auth_fid() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    negotiate(&mut c).await;

    let ename = rpc_err(
        &mut c,
        1,
        Fcall::Tattach {
            fid: 1,
            afid: 5,
            uname: "mark".to_owned(),
            aname: "/".to_owned(),
        },
    )
    .await;
    assert_eq!(ename, "authentication not supported");
}

#[tokio::test]
async fn attach_requires_an_unused_fid() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    attach(&mut c, 1, "mark").await;

    let ename = rpc_err(
        &mut c,
        2,
        Fcall::Tattach {
            fid: 1,
            afid: NOFID,
            uname: "mark".to_owned(),
            aname: "/".to_owned(),
        },
    )
    .await;
    assert_eq!(ename, "fid already in use on this connection");
}

#[tokio::test]
async fn auth_is_never_supported() {
    let (server, _root) = start_server().await;
    let mut c = connect(&server).await;
    negotiate(&mut c).await;

    let ename = rpc_err(
        &mut c,
        1,
        Fcall::Tauth {
            afid: 1,
            uname: "mark".to_owned(),
            aname: "/".to_owned(),
        },
    )
    .await;
    assert_eq!(ename, "not supported");
}
