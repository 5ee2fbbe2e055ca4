//! Asynchronous server side of the protocol.
//!
//! # Protocol
//! 9P2000
//!
//! Three long-running activities cooperate: an accept loop, one reader per
//! connection, and a single dispatcher worker that owns the tree, every
//! fid table and every host handle. The worker drains one shared message
//! channel, so handlers never race and need no locks.

use {
    crate::{
        error::Error,
        fcall::*,
        ownership, serialize,
        tree::{Node, NodeId, Tree},
        users::Vusers,
        utils::Result,
    },
    bytes::{buf::BufMut, BytesMut},
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{
        collections::{BTreeMap, HashMap},
        io::{self, SeekFrom},
        net::SocketAddr,
        os::unix::fs::{MetadataExt, PermissionsExt},
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpListener, TcpStream,
        },
        sync::{mpsc, watch},
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{length_delimited::LengthDelimitedCodec, FramedWrite},
};

const SESSION_RESET: &str = "new session started, dropping this request";
const SESSION_STOPPED: &str = "file system stopped";

/// A client's handle to a file: the bound node, the user inherited from
/// attach, and the open state.
#[derive(Clone, Debug)]
struct Fid {
    node: NodeId,
    uid: String,
    open: bool,
    /// The mode byte of the open or create that last opened this fid.
    mode: u8,
}

type ConnId = u64;

/// State for one accepted client.
struct Conn {
    /// Message size in force, clamped at `MAX_MSIZE`.
    msize: u32,
    fids: HashMap<u32, Fid>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

/// What a reader task forwards to the dispatcher.
enum Event {
    Msg { conn: ConnId, msg: Msg },
    /// The frame arrived but its body would not decode; answer `Rerror`
    /// with the frame's tag.
    Malformed { conn: ConnId, tag: u16, ename: String },
    Closed { conn: ConnId },
}

/// The file server: the exported tree plus the virtual user registry.
pub struct VuFs {
    root: PathBuf,
    tree: Tree,
    users: Vusers,
}

/// Handle to a running server.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl Server {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, fail anything still queued with a session-stopped
    /// error, and wait for the worker to exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let _ = self.accept.await;
        let _ = self.worker.await;
        Ok(())
    }

    /// Run until stopped.
    pub async fn join(self) -> Result<()> {
        let _ = self.accept.await;
        let _ = self.worker.await;
        Ok(())
    }
}

impl VuFs {
    /// Load the user registry and walk the export root into the tree.
    ///
    /// The registry is loaded first so a fresh export gets its
    /// `adm/users` file before the tree is built.
    pub async fn new(root: impl Into<PathBuf>) -> Result<VuFs> {
        let root = root.into();
        let users = Vusers::load(&root).await?;
        let tree = Tree::load(&root).await?;
        Ok(VuFs { root, tree, users })
    }

    /// Bind `addr` and start serving. Returns once the listener is ready.
    pub async fn serve(self, addr: &str) -> Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("exporting {} on {}", self.root.display(), local_addr);

        let (conn_tx, conn_rx) = mpsc::channel(1);
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept = tokio::spawn(accept_loop(listener, conn_tx, shutdown.subscribe()));
        let worker = tokio::spawn(self.run(conn_rx, msg_rx, msg_tx, shutdown_rx));

        Ok(Server {
            local_addr,
            shutdown,
            accept,
            worker,
        })
    }

    /// The dispatcher: the only task that touches the tree and the fid
    /// tables.
    async fn run(
        mut self,
        mut conn_rx: mpsc::Receiver<TcpStream>,
        mut msg_rx: mpsc::Receiver<Event>,
        msg_tx: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut conns: HashMap<ConnId, Conn> = HashMap::new();
        let mut next_conn: ConnId = 0;
        let mut scratch = BytesMut::with_capacity(4096);

        loop {
            tokio::select! {
                Some(stream) = conn_rx.recv() => {
                    let (readhalf, writehalf) = stream.into_split();
                    let id = next_conn;
                    next_conn += 1;
                    conns.insert(id, Conn {
                        msize: MAX_MSIZE,
                        fids: HashMap::new(),
                        writer: frame_codec().new_write(writehalf),
                    });
                    tokio::spawn(read_loop(id, readhalf, msg_tx.clone()));
                }
                Some(event) = msg_rx.recv() => {
                    self.dispatch(event, &mut conns, &mut msg_rx, &mut scratch).await;
                }
                _ = shutdown.changed() => break,
                else => break,
            }
        }

        // Fail whatever is still queued, then drop the connections.
        msg_rx.close();
        while let Some(event) = msg_rx.recv().await {
            match event {
                Event::Msg { conn, msg } => {
                    reply_error(&mut conns, conn, msg.tag, SESSION_STOPPED, &mut scratch).await;
                }
                Event::Malformed { conn, tag, .. } => {
                    reply_error(&mut conns, conn, tag, SESSION_STOPPED, &mut scratch).await;
                }
                Event::Closed { conn } => self.drop_conn(&mut conns, conn),
            }
        }
        info!("file system stopped");
    }

    async fn dispatch(
        &mut self,
        event: Event,
        conns: &mut HashMap<ConnId, Conn>,
        msg_rx: &mut mpsc::Receiver<Event>,
        scratch: &mut BytesMut,
    ) {
        match event {
            Event::Closed { conn } => self.drop_conn(conns, conn),
            Event::Malformed { conn, tag, ename } => {
                reply_error(conns, conn, tag, &ename, scratch).await;
            }
            Event::Msg { conn, msg } => {
                debug!("\t← [{}] {:?}", conn, msg);

                // A version request restarts the session: everything
                // already queued is answered with a session-reset error
                // before the version reply goes out.
                if let Fcall::Tversion { ref version, .. } = msg.body {
                    if negotiated_version(version) == P92000 {
                        while let Ok(queued) = msg_rx.try_recv() {
                            match queued {
                                Event::Msg { conn: c, msg: m } => {
                                    reply_error(conns, c, m.tag, SESSION_RESET, scratch).await;
                                }
                                Event::Malformed { conn: c, tag, .. } => {
                                    reply_error(conns, c, tag, SESSION_RESET, scratch).await;
                                }
                                Event::Closed { conn: c } => self.drop_conn(conns, c),
                            }
                        }
                    }
                }

                let result = match conns.get_mut(&conn) {
                    Some(c) if MsgType::from(&msg.body).is_t() => self.handle(c, &msg.body).await,
                    Some(_) => Err("bad fcall type".into()),
                    None => return,
                };

                let body = result.unwrap_or_else(|e| {
                    debug!("{:?}: error: {}", MsgType::from(&msg.body), e);
                    Fcall::Rerror { ename: e.ename() }
                });
                let reply = Msg {
                    tag: msg.tag,
                    body,
                };
                debug!("\t→ [{}] {:?}", conn, reply);

                let sent = match conns.get_mut(&conn) {
                    Some(c) => send_msg(c, &reply, scratch).await,
                    None => return,
                };
                if sent.is_err() {
                    self.drop_conn(conns, conn);
                }
            }
        }
    }

    /// Release every fid a dying connection still holds.
    fn drop_conn(&mut self, conns: &mut HashMap<ConnId, Conn>, id: ConnId) {
        if let Some(mut conn) = conns.remove(&id) {
            for (_, fid) in conn.fids.drain() {
                self.release(&fid);
            }
        }
    }

    /// Drop an open fid's claim on its node, closing the shared handle
    /// with the last claim.
    fn release(&mut self, fid: &Fid) {
        if !fid.open {
            return;
        }
        if let Some(node) = self.tree.get_mut(fid.node) {
            node.refcnt = node.refcnt.saturating_sub(1);
            if node.refcnt == 0 {
                node.handle = None;
            }
        }
    }

    async fn handle(&mut self, conn: &mut Conn, body: &Fcall) -> Result<Fcall> {
        match *body {
            Fcall::Tversion { msize, ref version } => self.rversion(conn, msize, version),
            Fcall::Tauth { .. } => Err("not supported".into()),
            Fcall::Tattach {
                fid,
                afid,
                ref uname,
                ref aname,
            } => self.rattach(conn, fid, afid, uname, aname),
            Fcall::Tflush { .. } => Ok(Fcall::Rflush),
            Fcall::Twalk {
                fid,
                newfid,
                ref wnames,
            } => self.rwalk(conn, fid, newfid, wnames),
            Fcall::Topen { fid, mode } => self.ropen(conn, fid, mode).await,
            Fcall::Tcreate {
                fid,
                ref name,
                perm,
                mode,
            } => self.rcreate(conn, fid, name, perm, mode).await,
            Fcall::Tread { fid, offset, count } => self.rread(conn, fid, offset, count).await,
            Fcall::Twrite {
                fid,
                offset,
                ref data,
            } => self.rwrite(conn, fid, offset, data).await,
            Fcall::Tclunk { fid } => self.rclunk(conn, fid),
            Fcall::Tremove { fid } => self.rremove(conn, fid).await,
            Fcall::Tstat { fid } => self.rstat(conn, fid),
            Fcall::Twstat { fid, ref stat } => self.rwstat(conn, fid, stat).await,
            _ => Err("bad fcall type".into()),
        }
    }

    fn rversion(&mut self, conn: &mut Conn, msize: u32, version: &str) -> Result<Fcall> {
        let version = negotiated_version(version);
        let msize = msize.min(MAX_MSIZE);
        conn.msize = msize;

        // Restarting the session destroys every fid on this connection.
        if version == P92000 {
            let fids: Vec<Fid> = conn.fids.drain().map(|(_, fid)| fid).collect();
            for fid in &fids {
                self.release(fid);
            }
        }

        Ok(Fcall::Rversion {
            msize,
            version: version.to_owned(),
        })
    }

    fn rattach(
        &mut self,
        conn: &mut Conn,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
    ) -> Result<Fcall> {
        // To simplify things, clients may only attach to the root of the
        // file server.
        if aname != "/" {
            return Err("can only attach to root directory".into());
        }

        if afid != NOFID {
            return Err("authentication not supported".into());
        }

        if conn.fids.contains_key(&fid) {
            return Err("fid already in use on this connection".into());
        }

        let root = self.tree.root();
        let qid = self.tree.get(root).ok_or("fid not found")?.qid;
        conn.fids.insert(
            fid,
            Fid {
                node: root,
                uid: uname.to_owned(),
                open: false,
                mode: 0,
            },
        );

        Ok(Fcall::Rattach { qid })
    }

    fn rwalk(&mut self, conn: &mut Conn, fid: u32, newfid: u32, wnames: &[String]) -> Result<Fcall> {
        let entry = conn.fids.get(&fid).ok_or("fid not found")?.clone();
        let node = self.tree.get(entry.node).ok_or("fid not found")?;

        if !wnames.is_empty() && !node.is_dir() {
            return Err("not a directory".into());
        }

        if entry.open {
            return Err("already open".into());
        }

        if newfid != fid && conn.fids.contains_key(&newfid) {
            return Err("already in use".into());
        }

        if wnames.is_empty() {
            conn.fids.insert(newfid, entry);
            return Ok(Fcall::Rwalk { wqids: Vec::new() });
        }

        let mut cur = entry.node;
        let mut wqids = Vec::new();
        for (i, wname) in wnames.iter().enumerate() {
            if wname == ".." {
                cur = self.tree.get(cur).ok_or("fid not found")?.parent;
            } else {
                let child = match self.tree.lookup(cur, wname) {
                    Some(child) => child,
                    None if i == 0 => return Err(format!("'{}' not found", wname).into()),
                    // Return the qids we walked, but don't bind newfid.
                    None => return Ok(Fcall::Rwalk { wqids }),
                };

                let cnode = self.tree.get(child).ok_or("fid not found")?;
                if cnode.is_dir() && !self.check_perm(cnode, &entry.uid, dm::EXEC) {
                    if i == 0 {
                        return Err("permission denied".into());
                    }
                    return Ok(Fcall::Rwalk { wqids });
                }
                cur = child;
            }

            wqids.push(self.tree.get(cur).ok_or("fid not found")?.qid);
        }

        conn.fids.insert(
            newfid,
            Fid {
                node: cur,
                uid: entry.uid,
                open: false,
                mode: 0,
            },
        );

        Ok(Fcall::Rwalk { wqids })
    }

    async fn ropen(&mut self, conn: &mut Conn, fid: u32, mode: u8) -> Result<Fcall> {
        let entry = conn.fids.get(&fid).ok_or("fid not found")?.clone();
        let node_id = entry.node;

        {
            let node = self.tree.get(node_id).ok_or("fid not found")?;
            check_mode(if node.is_dir() { dm::DIR } else { 0 }, mode)?;

            let wanted = match mode & 3 {
                om::WRITE => dm::WRITE,
                om::RDWR => dm::READ | dm::WRITE,
                om::EXEC => dm::EXEC,
                _ => dm::READ,
            };
            if !self.check_perm(node, &entry.uid, wanted) {
                return Err("permission denied".into());
            }
        }

        // Open the backing file once; every fid on this node shares the
        // handle, read/write for files so one handle serves any mode.
        let (qid, opened) = {
            let node = self.tree.get(node_id).ok_or("fid not found")?;
            let opened = if node.handle.is_none() {
                Some(if node.is_dir() {
                    fs::File::open(&node.ospath).await?
                } else {
                    fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&node.ospath)
                        .await?
                })
            } else {
                None
            };
            (node.qid, opened)
        };

        let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
        if let Some(fp) = opened {
            node.handle = Some(fp);
        }
        node.refcnt += 1;

        if let Some(entry) = conn.fids.get_mut(&fid) {
            entry.open = true;
            entry.mode = mode;
        }

        Ok(Fcall::Ropen { qid, iounit: 0 })
    }

    async fn rcreate(
        &mut self,
        conn: &mut Conn,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<Fcall> {
        let entry = conn.fids.get(&fid).ok_or("fid not found")?.clone();
        let parent_id = entry.node;
        let parent = self.tree.get(parent_id).ok_or("fid not found")?;

        if !parent.is_dir() {
            return Err("not a directory".into());
        }

        if !ownership::valid_filename(name) {
            return Err("invalid file name".into());
        }

        // User must have permission to write to the parent directory.
        if !self.check_perm(parent, &entry.uid, dm::WRITE) {
            return Err("permission denied".into());
        }

        if parent.children.contains_key(name) {
            return Err("already exists".into());
        }

        check_mode(perm, mode)?;

        let ospath = parent.ospath.join(name);
        let parent_gid = parent.gid.clone();
        // The child cannot grant permissions the parent denies.
        let is_dir = perm & dm::DIR != 0;
        let eperm = if is_dir {
            perm & (!0o777 | (parent.mode & 0o777))
        } else {
            perm & (!0o666 | (parent.mode & 0o666))
        };

        let fp = if is_dir {
            let mut builder = fs::DirBuilder::new();
            #[cfg(unix)]
            builder.mode(eperm & 0o777);
            builder.create(&ospath).await?;
            match fs::File::open(&ospath).await {
                Ok(fp) => fp,
                Err(e) => {
                    let _ = fs::remove_dir(&ospath).await;
                    return Err(e.into());
                }
            }
        } else {
            let mut opts = fs::OpenOptions::new();
            opts.read(true).write(true).create_new(true);
            #[cfg(unix)]
            opts.mode(eperm & 0o777);
            opts.open(&ospath).await?
        };

        // Owner of the new file is the user that attached; group comes
        // from the parent directory.
        if let Err(e) = ownership::write_ownership(&ospath, &entry.uid, &parent_gid).await {
            drop(fp);
            let _ = remove_path(&ospath, is_dir).await;
            return Err(e.into());
        }

        // The inode is the qid path, so the new file must be stat'ed.
        let meta = match fp.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                drop(fp);
                let _ = remove_path(&ospath, is_dir).await;
                let _ = ownership::remove_ownership(&ospath).await;
                return Err(e.into());
            }
        };

        let now = now_sec();
        let qid = Qid {
            typ: QidType::from_bits_truncate((perm >> 24) as u8),
            version: now_millis(),
            path: meta.ino(),
        };
        let node = Node {
            qid,
            mode: eperm,
            atime: now,
            mtime: now,
            length: 0,
            name: name.to_owned(),
            uid: entry.uid.clone(),
            gid: parent_gid,
            muid: entry.uid.clone(),
            parent: parent_id,
            children: BTreeMap::new(),
            ospath,
            handle: Some(fp),
            refcnt: 1,
        };
        let id = self.tree.attach(node);

        conn.fids.insert(
            fid,
            Fid {
                node: id,
                uid: entry.uid,
                open: true,
                mode,
            },
        );

        Ok(Fcall::Rcreate { qid, iounit: 0 })
    }

    async fn rread(&mut self, conn: &mut Conn, fid: u32, offset: u64, count: u32) -> Result<Fcall> {
        let entry = conn.fids.get(&fid).ok_or("fid not found")?.clone();

        if !entry.open {
            return Err("not open".into());
        }

        if count > conn.msize {
            return Err("invalid count".into());
        }

        let node_id = entry.node;
        let node = self.tree.get(node_id).ok_or("fid not found")?;

        let data = if node.is_dir() {
            // Children are packed as stat entries in name order; the
            // window may only start and end on entry boundaries.
            let mut data = Vec::new();
            let count = count as u64;
            let mut bytesread: u64 = 0;
            for child_id in node.children.values() {
                let child = match self.tree.get(*child_id) {
                    Some(child) => child,
                    None => continue,
                };
                let mut entry_bytes = Vec::new();
                serialize::Encodable::encode(&child.stat(), &mut entry_bytes)?;
                let n = entry_bytes.len() as u64;

                if bytesread >= offset && bytesread + n <= offset + count {
                    if data.is_empty() && bytesread != offset {
                        return Err("invalid offset".into());
                    }
                    data.extend_from_slice(&entry_bytes);
                }
                bytesread += n;
                if bytesread >= offset + count {
                    break;
                }
            }
            data
        } else {
            if offset >= node.length {
                let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
                node.atime = now_sec();
                return Ok(Fcall::Rread { data: Data(Vec::new()) });
            }

            let want = (node.length - offset).min(count as u64) as usize;
            let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
            let handle = node.handle.as_mut().ok_or("not open")?;
            handle.seek(SeekFrom::Start(offset)).await?;

            let mut buf = vec![0; want];
            let mut read = 0;
            while read < want {
                let n = handle.read(&mut buf[read..]).await?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            buf.truncate(read);
            buf
        };

        let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
        node.atime = now_sec();

        Ok(Fcall::Rread { data: Data(data) })
    }

    async fn rwrite(&mut self, conn: &mut Conn, fid: u32, offset: u64, data: &Data) -> Result<Fcall> {
        let entry = conn.fids.get(&fid).ok_or("fid not found")?.clone();

        if !entry.open {
            return Err("not open".into());
        }

        let m = entry.mode & 3;
        if m != om::WRITE && m != om::RDWR {
            return Err("not opened for writing".into());
        }

        let node = self.tree.get_mut(entry.node).ok_or("fid not found")?;
        if node.is_dir() {
            return Err("can't write to a directory".into());
        }

        let handle = node.handle.as_mut().ok_or("not open")?;
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.write_all(&data.0).await?;

        let meta = handle.metadata().await?;
        node.length = meta.len();
        let now = now_sec();
        node.atime = now;
        node.mtime = now;
        node.muid = entry.uid;

        Ok(Fcall::Rwrite {
            count: data.0.len() as u32,
        })
    }

    fn rclunk(&mut self, conn: &mut Conn, fid: u32) -> Result<Fcall> {
        let entry = conn.fids.remove(&fid).ok_or("fid not found")?;
        self.release(&entry);
        Ok(Fcall::Rclunk)
    }

    async fn rremove(&mut self, conn: &mut Conn, fid: u32) -> Result<Fcall> {
        // The fid is clunked whether or not the remove succeeds.
        let entry = conn.fids.remove(&fid).ok_or("fid not found")?;
        let node_id = entry.node;

        let (parent_id, ospath, is_dir) = {
            let node = self.tree.get(node_id).ok_or("fid not found")?;
            (node.parent, node.ospath.clone(), node.is_dir())
        };
        let parent = self.tree.get(parent_id).ok_or("fid not found")?;
        if !self.check_perm(parent, &entry.uid, dm::WRITE) {
            return Err("permission denied".into());
        }

        if let Some(node) = self.tree.get_mut(node_id) {
            node.handle = None;
            node.refcnt = 0;
        }

        remove_path(&ospath, is_dir).await?;
        ownership::remove_ownership(&ospath).await?;
        self.tree.remove(node_id);

        Ok(Fcall::Rremove)
    }

    fn rstat(&mut self, conn: &mut Conn, fid: u32) -> Result<Fcall> {
        let entry = conn.fids.get(&fid).ok_or("fid not found")?;
        let node = self.tree.get(entry.node).ok_or("fid not found")?;
        Ok(Fcall::Rstat { stat: node.stat() })
    }

    async fn rwstat(&mut self, conn: &mut Conn, fid: u32, stat: &Stat) -> Result<Fcall> {
        let entry = conn.fids.get(&fid).ok_or("fid not found")?.clone();
        let node_id = entry.node;

        if stat.mode != !0u32 {
            let mode = stat.mode & 0o777;
            let ospath = {
                let node = self.tree.get(node_id).ok_or("fid not found")?;
                node.ospath.clone()
            };
            fs::set_permissions(&ospath, PermissionsExt::from_mode(mode)).await?;
            let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
            node.mode = (node.mode & !0o777) | mode;
        }

        if !stat.name.is_empty() {
            let (parent_id, oldpath) = {
                let node = self.tree.get(node_id).ok_or("fid not found")?;
                (node.parent, node.ospath.clone())
            };
            let parent = self.tree.get(parent_id).ok_or("fid not found")?;

            if !self.check_perm(parent, &entry.uid, dm::WRITE) {
                return Err("permission denied".into());
            }
            if !ownership::valid_filename(&stat.name) {
                return Err("invalid file name".into());
            }
            if parent.children.contains_key(&stat.name) {
                return Err("already exists".into());
            }

            let newpath = parent.ospath.join(&stat.name);
            fs::rename(&oldpath, &newpath).await?;
            if let Err(e) = ownership::rename_ownership(&oldpath, &newpath).await {
                // Roll the data file back so disk and tree agree.
                let _ = fs::rename(&newpath, &oldpath).await;
                return Err(e.into());
            }
            self.tree.rename(node_id, &stat.name, newpath);
        }

        if stat.length != !0u64 {
            let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
            if node.is_dir() {
                return Err("can't truncate a directory".into());
            }
            match node.handle.as_mut() {
                Some(handle) => handle.set_len(stat.length).await?,
                None => {
                    fs::OpenOptions::new()
                        .write(true)
                        .open(&node.ospath)
                        .await?
                        .set_len(stat.length)
                        .await?;
                }
            }
            node.length = stat.length;
        }

        // When either time is provided the other defaults to the stored
        // value, and both are applied.
        if stat.atime != !0u32 || stat.mtime != !0u32 {
            let (ospath, atime, mtime) = {
                let node = self.tree.get(node_id).ok_or("fid not found")?;
                (
                    node.ospath.clone(),
                    if stat.atime == !0u32 { node.atime } else { stat.atime },
                    if stat.mtime == !0u32 { node.mtime } else { stat.mtime },
                )
            };

            let at = filetime::FileTime::from_unix_time(atime as i64, 0);
            let mt = filetime::FileTime::from_unix_time(mtime as i64, 0);
            tokio::task::spawn_blocking(move || filetime::set_file_times(ospath, at, mt))
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))??;

            let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
            node.atime = atime;
            node.mtime = mtime;
        }

        // The only place the server changes ownership in its own
        // namespace: rewrite the sidecar.
        if !stat.uid.is_empty() || !stat.gid.is_empty() {
            let (ospath, uid, gid) = {
                let node = self.tree.get(node_id).ok_or("fid not found")?;
                (
                    node.ospath.clone(),
                    if stat.uid.is_empty() { node.uid.clone() } else { stat.uid.clone() },
                    if stat.gid.is_empty() { node.gid.clone() } else { stat.gid.clone() },
                )
            };
            ownership::write_ownership(&ospath, &uid, &gid).await?;
            let node = self.tree.get_mut(node_id).ok_or("fid not found")?;
            node.uid = uid;
            node.gid = gid;
        }

        Ok(Fcall::Rwstat)
    }

    /// Grant `perm` (one or more of DMREAD/DMWRITE/DMEXEC) on a node for
    /// a user: other bits first, then owner bits, then group bits.
    fn check_perm(&self, node: &Node, uid: &str, perm: u32) -> bool {
        if uid.is_empty() {
            return false;
        }

        let perm = perm & 7;

        // other permissions
        let mut fperm = node.mode & 7;
        if fperm & perm == perm {
            return true;
        }

        // uid permissions
        if node.uid == uid {
            fperm |= (node.mode >> 6) & 7;
        }
        if fperm & perm == perm {
            return true;
        }

        // group permissions
        if self.users.is_member(uid, &node.gid) {
            fperm |= (node.mode >> 3) & 7;
        }
        fperm & perm == perm
    }
}

/// Only plain reads and writes are supported; for directories the only
/// valid mode is OREAD.
fn check_mode(perm: u32, mode: u8) -> Result<()> {
    if perm & dm::DIR != 0 && mode != om::READ {
        return Err("invalid mode for a directory".into());
    }
    if mode & om::TRUNC != 0 {
        return Err("OTRUNC not supported".into());
    }
    if mode & om::RCLOSE != 0 {
        return Err("ORCLOSE not supported".into());
    }
    if mode & om::DIRECT != 0 {
        return Err("ODIRECT not supported".into());
    }
    Ok(())
}

/// Truncate the proposed version at the first `.` and compare.
fn negotiated_version(version: &str) -> &str {
    let ver = match version.find('.') {
        Some(i) if i > 0 => &version[..i],
        _ => version,
    };
    if ver == P92000 {
        P92000
    } else {
        VERSION_UNKNOWN
    }
}

async fn remove_path(path: &std::path::Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        fs::remove_dir(path).await
    } else {
        fs::remove_file(path).await
    }
}

fn frame_codec() -> tokio_util::codec::length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .max_frame_length(MAX_MSIZE as usize)
        .little_endian();
    builder
}

async fn accept_loop(
    listener: TcpListener,
    conn_tx: mpsc::Sender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    info!("accepted: {:?}", peer);
                    if conn_tx.send(stream).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("accept: {}", e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn read_loop(conn: ConnId, readhalf: OwnedReadHalf, tx: mpsc::Sender<Event>) {
    let mut framed = frame_codec().new_read(readhalf);

    while let Some(frame) = framed.next().await {
        let event = match frame {
            Ok(bytes) => match serialize::read_frame(&bytes) {
                Ok(msg) => Event::Msg { conn, msg },
                Err(e) => Event::Malformed {
                    conn,
                    tag: frame_tag(&bytes),
                    ename: e.to_string(),
                },
            },
            Err(e) => {
                error!("[{}] read: {}", conn, e);
                break;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }

    let _ = tx.send(Event::Closed { conn }).await;
}

/// The tag of a frame whose body would not decode: type[1] tag[2].
fn frame_tag(frame: &[u8]) -> u16 {
    if frame.len() >= 3 {
        u16::from_le_bytes([frame[1], frame[2]])
    } else {
        NOTAG
    }
}

async fn send_msg(conn: &mut Conn, msg: &Msg, scratch: &mut BytesMut) -> io::Result<()> {
    scratch.clear();
    {
        let mut writer = (&mut *scratch).writer();
        serialize::write_msg(&mut writer, msg)?;
    }
    conn.writer.send(scratch.split().freeze()).await
}

async fn reply_error(
    conns: &mut HashMap<ConnId, Conn>,
    conn: ConnId,
    tag: u16,
    ename: &str,
    scratch: &mut BytesMut,
) {
    let reply = Msg {
        tag,
        body: Fcall::Rerror {
            ename: ename.to_owned(),
        },
    };
    debug!("\t→ [{}] {:?}", conn, reply);
    if let Some(c) = conns.get_mut(&conn) {
        if send_msg(c, &reply, scratch).await.is_err() {
            conns.remove(&conn);
        }
    }
}

fn now_sec() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}
