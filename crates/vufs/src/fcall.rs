//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::mem::{size_of, size_of_val};

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with Rversion when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
pub const NOFID: u32 = !0;

/// Special uid value meaning "no uid specified"
pub const NOUID: u32 = !0;

/// Ample room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Largest message size the server will negotiate
pub const MAX_MSIZE: u32 = 131072;

/// Maximum number of path elements in a single `Twalk`
pub const MAXWELEM: usize = 16;

/// Largest wire size of a single stat entry
pub const STATMAX: usize = 65535;

/// Default listen endpoint
pub const DEFAULT_PORT: &str = ":5001";

/// Owner and group assigned when no sidecar exists
pub const DEFAULT_USER: &str = "adm";

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 32;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;
    /// Or'ed in, bypass the cache
    pub const DIRECT: u8 = 128;
}

/// Open mode bits that do not fit in the mode byte
pub mod omx {
    pub const EXCL: u32 = 0x1000;
    pub const LOCK: u32 = 0x2000;
    pub const APPEND: u32 = 0x4000;
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for symbolic links
    pub const SYMLINK: u32 = 0x02000000;
    /// Mode bit for device files
    pub const DEVICE: u32 = 0x00800000;
    /// Mode bit for named pipes
    pub const NAMEDPIPE: u32 = 0x00200000;
    /// Mode bit for sockets
    pub const SOCKET: u32 = 0x00100000;
    /// Mode bit for setuid
    pub const SETUID: u32 = 0x00080000;
    /// Mode bit for setgid
    pub const SETGID: u32 = 0x00040000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in `Qid.typ`
    ///
    /// QidType can be constructed from the high byte of a mode word via
    /// `from_bits_truncate`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bit for symbolic links"]
        const SYMLINK   = 0x02;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<::std::fs::FileType> for QidType {
    fn from(typ: ::std::fs::FileType) -> Self {
        let mut qid_type = QidType::FILE;

        if typ.is_dir() {
            qid_type.insert(QidType::DIR)
        }

        if typ.is_symlink() {
            qid_type.insert(QidType::SYMLINK)
        }

        qid_type
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    pub fn size(&self) -> u32 {
        (size_of::<u8>() + size_of::<u32>() + size_of::<u64>()) as u32
    }
}

/// Plan 9 namespace metadata, the 9P2000 directory entry
///
/// On the wire a stat entry is prefixed by a 16-bit size of its own
/// remaining contents.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions and flags
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Stat {
    /// The value of the entry's own 16-bit size field: everything after
    /// the field itself.
    pub fn size(&self) -> u16 {
        (size_of_val(&self.typ)
            + size_of_val(&self.dev)
            + self.qid.size() as usize
            + size_of_val(&self.mode)
            + size_of_val(&self.atime)
            + size_of_val(&self.mtime)
            + size_of_val(&self.length)
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }

    /// Total wire size of the entry, including the size field.
    pub fn wire_size(&self) -> u16 {
        self.size() + size_of::<u16>() as u16
    }

    /// The "don't touch" stat used by `Twstat`: every integer field is
    /// all ones and every string is empty.
    pub fn null() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::from_bits_truncate(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }
}

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        Tversion        = 100,
        Rversion,
        Tauth           = 102,
        Rauth,
        Tattach         = 104,
        Rattach,
        //Terror        = 106,  // Illegal, never used
        Rerror          = 107,
        Tflush          = 108,
        Rflush,
        Twalk           = 110,
        Rwalk,
        Topen           = 112,
        Ropen,
        Tcreate         = 114,
        Rcreate,
        Tread           = 116,
        Rread,
        Twrite          = 118,
        Rwrite,
        Tclunk          = 120,
        Rclunk,
        Tremove         = 122,
        Rremove,
        Tstat           = 124,
        Rstat,
        Twstat          = 126,
        Rwstat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        use crate::MsgType::*;

        matches!(
            *self,
            Rversion
                | Rauth
                | Rattach
                | Rerror
                | Rflush
                | Rwalk
                | Ropen
                | Rcreate
                | Rread
                | Rwrite
                | Rclunk
                | Rremove
                | Rstat
                | Rwstat
        )
    }
}

impl<'a> From<&'a Fcall> for MsgType {
    fn from(fcall: &'a Fcall) -> MsgType {
        match *fcall {
            Fcall::Tversion { .. } => MsgType::Tversion,
            Fcall::Rversion { .. } => MsgType::Rversion,
            Fcall::Tauth { .. } => MsgType::Tauth,
            Fcall::Rauth { .. } => MsgType::Rauth,
            Fcall::Tattach { .. } => MsgType::Tattach,
            Fcall::Rattach { .. } => MsgType::Rattach,
            Fcall::Rerror { .. } => MsgType::Rerror,
            Fcall::Tflush { .. } => MsgType::Tflush,
            Fcall::Rflush => MsgType::Rflush,
            Fcall::Twalk { .. } => MsgType::Twalk,
            Fcall::Rwalk { .. } => MsgType::Rwalk,
            Fcall::Topen { .. } => MsgType::Topen,
            Fcall::Ropen { .. } => MsgType::Ropen,
            Fcall::Tcreate { .. } => MsgType::Tcreate,
            Fcall::Rcreate { .. } => MsgType::Rcreate,
            Fcall::Tread { .. } => MsgType::Tread,
            Fcall::Rread { .. } => MsgType::Rread,
            Fcall::Twrite { .. } => MsgType::Twrite,
            Fcall::Rwrite { .. } => MsgType::Rwrite,
            Fcall::Tclunk { .. } => MsgType::Tclunk,
            Fcall::Rclunk => MsgType::Rclunk,
            Fcall::Tremove { .. } => MsgType::Tremove,
            Fcall::Rremove => MsgType::Rremove,
            Fcall::Tstat { .. } => MsgType::Tstat,
            Fcall::Rstat { .. } => MsgType::Rstat,
            Fcall::Twstat { .. } => MsgType::Twstat,
            Fcall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// Data type used in `Rread` and `Twrite`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
    },
    Rauth {
        aqid: Qid,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    Rattach {
        qid: Qid,
    },
    Rerror {
        ename: String,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<Qid>,
    },
    Topen {
        fid: u32,
        mode: u8,
    },
    Ropen {
        qid: Qid,
        iounit: u32,
    },
    Tcreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    Rcreate {
        qid: Qid,
        iounit: u32,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Data,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
    Tstat {
        fid: u32,
    },
    Rstat {
        stat: Stat,
    },
    Twstat {
        fid: u32,
        stat: Stat,
    },
    Rwstat,
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}
