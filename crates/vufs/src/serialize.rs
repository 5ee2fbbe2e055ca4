//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return Err(io_err!(InvalidInput, "string too long"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Fcall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            Tversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Rversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Tauth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            Rauth { ref aqid } => buf << aqid,
            Tattach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            Rattach { ref qid } => buf << qid,
            Rerror { ref ename } => buf << ename,
            Tflush { ref oldtag } => buf << oldtag,
            Rflush => buf,
            Twalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            Rwalk { ref wqids } => buf << wqids,
            Topen { ref fid, ref mode } => buf << fid << mode,
            Ropen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tcreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            Rcreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tread {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            Rread { ref data } => buf << data,
            Twrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            Rwrite { ref count } => buf << count,
            Tclunk { ref fid } => buf << fid,
            Rclunk => buf,
            Tremove { ref fid } => buf << fid,
            Rremove => buf,
            Tstat { ref fid } => buf << fid,
            // stat entries travel inside a counted byte blob, so the
            // entry's own size field appears twice on the wire
            Rstat { ref stat } => buf << &stat.wire_size() << stat,
            Twstat { ref fid, ref stat } => buf << fid << &stat.wire_size() << stat,
            Rwstat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: QidType::from_bits_truncate(decode!(*r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let body = read_exact(r, size as usize).map_err(|_| io_err!(InvalidData, "malformed Dir"))?;

        let mut buf = Cursor::new(body);
        let stat = parse_stat(&mut buf).map_err(|_| io_err!(InvalidData, "malformed Dir"))?;

        if buf.position() != size as u64 {
            return Err(io_err!(InvalidData, "malformed Dir"));
        }

        Ok(stat)
    }
}

fn parse_stat<R: ReadBytesExt>(mut buf: R) -> Result<Stat> {
    Ok(Stat {
        typ: decode!(buf),
        dev: decode!(buf),
        qid: decode!(buf),
        mode: decode!(buf),
        atime: decode!(buf),
        mtime: decode!(buf),
        length: decode!(buf),
        name: decode!(buf),
        uid: decode!(buf),
        gid: decode!(buf),
        muid: decode!(buf),
    })
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Decode a counted stat blob: the 16-bit outer length, then the entry.
fn decode_counted_stat<R: ReadBytesExt>(r: &mut R) -> Result<Stat> {
    let count: u16 = Decodable::decode(r)?;
    let stat: Stat = Decodable::decode(r)?;
    if stat.wire_size() != count {
        return Err(io_err!(InvalidData, "malformed Dir"));
    }
    Ok(stat)
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(Tversion) => Fcall::Tversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Rversion) => Fcall::Rversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Tauth) => Fcall::Tauth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rauth) => Fcall::Rauth { aqid: decode!(buf) },
            Some(Tattach) => Fcall::Tattach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rattach) => Fcall::Rattach { qid: decode!(buf) },
            Some(Rerror) => Fcall::Rerror {
                ename: decode!(buf),
            },
            Some(Tflush) => Fcall::Tflush {
                oldtag: decode!(buf),
            },
            Some(Rflush) => Fcall::Rflush,
            Some(Twalk) => Fcall::Twalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(Rwalk) => Fcall::Rwalk {
                wqids: decode!(buf),
            },
            Some(Topen) => Fcall::Topen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(Ropen) => Fcall::Ropen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tcreate) => Fcall::Tcreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(Rcreate) => Fcall::Rcreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tread) => Fcall::Tread {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(Rread) => Fcall::Rread { data: decode!(buf) },
            Some(Twrite) => Fcall::Twrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(Rwrite) => Fcall::Rwrite {
                count: decode!(buf),
            },
            Some(Tclunk) => Fcall::Tclunk { fid: decode!(buf) },
            Some(Rclunk) => Fcall::Rclunk,
            Some(Tremove) => Fcall::Tremove { fid: decode!(buf) },
            Some(Rremove) => Fcall::Rremove,
            Some(Tstat) => Fcall::Tstat { fid: decode!(buf) },
            Some(Rstat) => Fcall::Rstat {
                stat: decode_counted_stat(&mut buf)?,
            },
            Some(Twstat) => {
                let fid = decode!(buf);
                Fcall::Twstat {
                    fid,
                    stat: decode_counted_stat(&mut buf)?,
                }
            }
            Some(Rwstat) => Fcall::Rwstat,
            None => return Err(io_err!(InvalidData, "bad fcall type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Decode one de-framed message body (type, tag, body), requiring the
/// whole frame to be consumed.
pub fn read_frame(frame: &[u8]) -> Result<Msg> {
    let mut buf = Cursor::new(frame);
    let msg = match read_msg(&mut buf) {
        Ok(msg) => msg,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(io_err!(InvalidData, "malformed Fcall"));
        }
        Err(e) => return Err(e),
    };

    if buf.position() != frame.len() as u64 {
        return Err(io_err!(InvalidData, "malformed Fcall"));
    }

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(expected: Msg) {
        let mut buf = Vec::new();
        let _ = expected.encode(&mut buf).unwrap();
        let actual = read_frame(&buf).unwrap();
        assert_eq!(expected, actual);
    }

    fn sample_stat() -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: Qid {
                typ: QidType::FILE,
                version: 7,
                path: 42,
            },
            mode: 0o644,
            atime: 1234,
            mtime: 5678,
            length: 11,
            name: "t.txt".to_owned(),
            uid: "mark".to_owned(),
            gid: "adm".to_owned(),
            muid: "mark".to_owned(),
        }
    }

    #[test]
    fn version_round_trip() {
        round_trip(Msg {
            tag: NOTAG,
            body: Fcall::Tversion {
                msize: MAX_MSIZE,
                version: P92000.to_owned(),
            },
        });
        round_trip(Msg {
            tag: NOTAG,
            body: Fcall::Rversion {
                msize: MAX_MSIZE,
                version: VERSION_UNKNOWN.to_owned(),
            },
        });
    }

    #[test]
    fn walk_round_trip() {
        round_trip(Msg {
            tag: 1,
            body: Fcall::Twalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["usr".to_owned(), "mark".to_owned()],
            },
        });
        round_trip(Msg {
            tag: 1,
            body: Fcall::Rwalk {
                wqids: vec![
                    Qid {
                        typ: QidType::DIR,
                        version: 0,
                        path: 3,
                    },
                    Qid {
                        typ: QidType::DIR,
                        version: 0,
                        path: 4,
                    },
                ],
            },
        });
    }

    #[test]
    fn io_round_trip() {
        round_trip(Msg {
            tag: 9,
            body: Fcall::Twrite {
                fid: 2,
                offset: 0,
                data: Data(b"Hello World!".to_vec()),
            },
        });
        round_trip(Msg {
            tag: 9,
            body: Fcall::Rread {
                data: Data(vec![0u8, 1, 2, 3]),
            },
        });
    }

    #[test]
    fn stat_round_trip() {
        round_trip(Msg {
            tag: 3,
            body: Fcall::Rstat { stat: sample_stat() },
        });
        round_trip(Msg {
            tag: 3,
            body: Fcall::Twstat {
                fid: 5,
                stat: Stat::null(),
            },
        });
    }

    #[test]
    fn error_round_trip() {
        round_trip(Msg {
            tag: 2,
            body: Fcall::Rerror {
                ename: "permission denied".to_owned(),
            },
        });
    }

    #[test]
    fn stat_size_matches_encoding() {
        let stat = sample_stat();
        let mut buf = Vec::new();
        stat.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), stat.wire_size() as usize);
        assert_eq!(buf.len(), stat.size() as usize + 2);
    }

    #[test]
    fn long_string_is_rejected() {
        let msg = Msg {
            tag: 0,
            body: Fcall::Rerror {
                ename: "x".repeat(u16::MAX as usize + 1),
            },
        };
        let mut buf = Vec::new();
        let err = msg.encode(&mut buf).unwrap_err();
        assert_eq!(err.to_string(), "string too long");
    }

    #[test]
    fn unknown_type_is_rejected() {
        // type 250 is not a 9P2000 opcode
        let err = read_frame(&[250, 0, 0]).unwrap_err();
        assert_eq!(err.to_string(), "bad fcall type");
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let msg = Msg {
            tag: 4,
            body: Fcall::Tclunk { fid: 1 },
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        buf.push(0xff);
        let err = read_frame(&buf).unwrap_err();
        assert_eq!(err.to_string(), "malformed Fcall");
    }

    #[test]
    fn truncated_stat_is_rejected() {
        let stat = sample_stat();
        let msg = Msg {
            tag: 4,
            body: Fcall::Twstat { fid: 1, stat },
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        // corrupt the outer count so the blob no longer matches the entry;
        // it sits right after type[1] tag[2] fid[4]
        buf[7] ^= 0xff;
        assert!(read_frame(&buf).is_err());
    }
}
