//! Shared harness: a live server on an ephemeral port and a tiny client
//! speaking the crate's own codec over a raw TCP stream.
#![allow(dead_code)]

use std::io::Cursor;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use vufs::serialize::{self, Decodable};
use vufs::srv::{Server, VuFs};
use vufs::{dm, om, Fcall, Msg, MsgType, Qid, Stat, MAX_MSIZE, NOFID, NOTAG, P92000};

/// Start a server over a fresh export root.
pub async fn start_server() -> (Server, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let fs = VuFs::new(root.path()).await.unwrap();
    let server = fs.serve("127.0.0.1:0").await.unwrap();
    (server, root)
}

pub async fn connect(server: &Server) -> TcpStream {
    TcpStream::connect(server.local_addr()).await.unwrap()
}

pub async fn write_fcall(c: &mut TcpStream, msg: &Msg) {
    let mut body = Vec::new();
    serialize::write_msg(&mut body, msg).unwrap();

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
    frame.extend_from_slice(&body);
    c.write_all(&frame).await.unwrap();
}

pub async fn read_fcall(c: &mut TcpStream) -> Msg {
    let mut len = [0u8; 4];
    c.read_exact(&mut len).await.unwrap();
    let n = u32::from_le_bytes(len) as usize - 4;

    let mut body = vec![0u8; n];
    c.read_exact(&mut body).await.unwrap();
    serialize::read_frame(&body).unwrap()
}

/// Send a raw, possibly malformed body and return the reply.
pub async fn write_raw_frame(c: &mut TcpStream, body: &[u8]) -> Msg {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
    frame.extend_from_slice(body);
    c.write_all(&frame).await.unwrap();
    read_fcall(c).await
}

pub async fn rpc(c: &mut TcpStream, tag: u16, body: Fcall) -> Msg {
    write_fcall(c, &Msg { tag, body }).await;
    read_fcall(c).await
}

/// Round-trip a request and require the matching R-message.
pub async fn rpc_ok(c: &mut TcpStream, tag: u16, body: Fcall) -> Fcall {
    let treq = MsgType::from(&body) as u8;
    let rx = rpc(c, tag, body).await;

    assert_eq!(rx.tag, tag, "wrong tag in reply");
    if let Fcall::Rerror { ename } = &rx.body {
        panic!("got Rerror: '{}'", ename);
    }
    assert_eq!(
        MsgType::from(&rx.body) as u8,
        treq + 1,
        "bad response type for request {}",
        treq
    );
    rx.body
}

/// Round-trip a request and require an `Rerror`, returning the ename.
pub async fn rpc_err(c: &mut TcpStream, tag: u16, body: Fcall) -> String {
    let rx = rpc(c, tag, body).await;
    assert_eq!(rx.tag, tag, "wrong tag in reply");
    match rx.body {
        Fcall::Rerror { ename } => ename,
        other => panic!("expected Rerror, got {:?}", other),
    }
}

/// Negotiate the version and attach `fid` to the root as `uname`.
pub async fn attach(c: &mut TcpStream, fid: u32, uname: &str) {
    let rx = rpc_ok(
        c,
        NOTAG,
        Fcall::Tversion {
            msize: MAX_MSIZE,
            version: P92000.to_owned(),
        },
    )
    .await;
    match rx {
        Fcall::Rversion { version, .. } => assert_eq!(version, P92000),
        _ => unreachable!(),
    }

    rpc_ok(
        c,
        1,
        Fcall::Tattach {
            fid,
            afid: NOFID,
            uname: uname.to_owned(),
            aname: "/".to_owned(),
        },
    )
    .await;
}

/// Walk `rootfid` to `newfid` with zero names, then create there.
pub async fn create(
    c: &mut TcpStream,
    rootfid: u32,
    newfid: u32,
    name: &str,
    perm: u32,
    mode: u8,
) -> Qid {
    rpc_ok(
        c,
        1,
        Fcall::Twalk {
            fid: rootfid,
            newfid,
            wnames: Vec::new(),
        },
    )
    .await;

    match rpc_ok(
        c,
        1,
        Fcall::Tcreate {
            fid: newfid,
            name: name.to_owned(),
            perm,
            mode,
        },
    )
    .await
    {
        Fcall::Rcreate { qid, .. } => qid,
        _ => unreachable!(),
    }
}

pub async fn walk(c: &mut TcpStream, fid: u32, newfid: u32, wnames: &[&str]) -> Vec<Qid> {
    match rpc_ok(
        c,
        1,
        Fcall::Twalk {
            fid,
            newfid,
            wnames: wnames.iter().map(|s| s.to_string()).collect(),
        },
    )
    .await
    {
        Fcall::Rwalk { wqids } => wqids,
        _ => unreachable!(),
    }
}

pub async fn open(c: &mut TcpStream, fid: u32, mode: u8) -> Qid {
    match rpc_ok(c, 1, Fcall::Topen { fid, mode }).await {
        Fcall::Ropen { qid, .. } => qid,
        _ => unreachable!(),
    }
}

pub async fn clunk(c: &mut TcpStream, fid: u32) {
    rpc_ok(c, 1, Fcall::Tclunk { fid }).await;
}

pub async fn stat(c: &mut TcpStream, fid: u32) -> Stat {
    match rpc_ok(c, 1, Fcall::Tstat { fid }).await {
        Fcall::Rstat { stat } => stat,
        _ => unreachable!(),
    }
}

pub async fn read(c: &mut TcpStream, fid: u32, offset: u64, count: u32) -> Vec<u8> {
    match rpc_ok(c, 1, Fcall::Tread { fid, offset, count }).await {
        Fcall::Rread { data } => data.0,
        _ => unreachable!(),
    }
}

/// Split a directory-read payload into its packed stat entries.
pub fn parse_dir(data: &[u8]) -> Vec<Stat> {
    let mut cursor = Cursor::new(data);
    let mut entries = Vec::new();
    while (cursor.position() as usize) < data.len() {
        entries.push(Stat::decode(&mut cursor).unwrap());
    }
    entries
}

/// A `Twstat` stat that changes nothing.
pub fn null_stat() -> Stat {
    Stat::null()
}

// Re-export the bits tests reach for constantly.
pub use vufs::{Data, VERSION_UNKNOWN};
pub const OREAD: u8 = om::READ;
pub const OWRITE: u8 = om::WRITE;
pub const ORDWR: u8 = om::RDWR;
pub const DMDIR: u32 = dm::DIR;
