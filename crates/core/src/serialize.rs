//! Binary serialization of compiled function trees (`.bric` files).
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic  [0xB5 'B' 'r' 'i' 'C']
//! u8     major version        (mismatch is fatal)
//! u8     minor version        (mismatch is accepted)
//! func   root function
//! ```
//!
//! A function serializes as its prototype header (arity, flags, upvalue
//! count, stack and cache sizes, optional name, defaults) followed by its
//! code (u64 bytecode length, raw bytes, tagged constant pool). Natives
//! serialize only their prototype header; host handles serialize as null
//! placeholders. Line tables are not part of the format.

use crate::proto::{Code, Const, FuncProto, NativeProto, UpvalueDesc};
use std::fmt;

/// Magic bytes opening every `.bric` file.
pub const MAGIC: [u8; 5] = [0xB5, b'B', b'r', b'i', b'C'];

/// Bumped when the format changes incompatibly.
pub const BYTECODE_MAJOR: u8 = 1;
/// Bumped for backward-compatible additions.
pub const BYTECODE_MINOR: u8 = 0;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_NUM: u8 = 2;
const TAG_STR_SHORT: u8 = 3;
const TAG_STR_LONG: u8 = 4;
const TAG_FUNC: u8 = 5;
const TAG_NATIVE: u8 = 6;

const FLAG_VARARG: u8 = 1 << 0;
const FLAG_GENERATOR: u8 = 1 << 1;

/// Error while reading a `.bric` stream.
#[derive(Debug, PartialEq, Eq)]
pub enum SerializeError {
    /// Input ended before the structure was complete.
    ShortRead,
    /// The magic bytes did not match.
    BadMagic,
    /// Major version differs from [`BYTECODE_MAJOR`].
    VersionMismatch { found: u8 },
    /// Unknown constant tag byte.
    BadTag(u8),
    /// Bytes remained after the root function.
    TrailingBytes(usize),
    /// A declared length does not fit the remaining input.
    BadLength(u64),
    /// Text that should be UTF-8 was not.
    BadString,
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::ShortRead => write!(f, "unexpected end of bytecode stream"),
            SerializeError::BadMagic => write!(f, "not a compiled Brio file (bad magic)"),
            SerializeError::VersionMismatch { found } => write!(
                f,
                "incompatible bytecode version {} (supported: {})",
                found, BYTECODE_MAJOR
            ),
            SerializeError::BadTag(t) => write!(f, "unknown constant tag {:#04x}", t),
            SerializeError::TrailingBytes(n) => {
                write!(f, "{} trailing bytes after root function", n)
            }
            SerializeError::BadLength(n) => write!(f, "declared length {} exceeds input", n),
            SerializeError::BadString => write!(f, "malformed string constant"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// Whether the error should be reported as a version problem rather than
/// a corrupt stream.
impl SerializeError {
    pub fn is_version(&self) -> bool {
        matches!(
            self,
            SerializeError::BadMagic | SerializeError::VersionMismatch { .. }
        )
    }
}

/// Serialize a compiled function tree into a `.bric` byte vector.
pub fn serialize(proto: &FuncProto) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + proto.code.bytes.len());
    out.extend_from_slice(&MAGIC);
    out.push(BYTECODE_MAJOR);
    out.push(BYTECODE_MINOR);
    write_func(&mut out, proto);
    out
}

/// Deserialize a `.bric` byte stream back into a function tree.
///
/// The whole input must be consumed; trailing bytes are an error.
pub fn deserialize(bytes: &[u8]) -> Result<FuncProto, SerializeError> {
    let mut r = Reader { bytes, pos: 0 };
    let magic = r.take(MAGIC.len())?;
    if magic != MAGIC {
        return Err(SerializeError::BadMagic);
    }
    let major = r.u8()?;
    let _minor = r.u8()?;
    if major != BYTECODE_MAJOR {
        return Err(SerializeError::VersionMismatch { found: major });
    }
    let proto = read_func(&mut r)?;
    if r.pos != r.bytes.len() {
        return Err(SerializeError::TrailingBytes(r.bytes.len() - r.pos));
    }
    Ok(proto)
}

fn write_proto_header(
    out: &mut Vec<u8>,
    name: Option<&str>,
    arity: u8,
    vararg: bool,
    generator: bool,
    defaults: &[Const],
) {
    out.push(arity);
    let mut flags = 0u8;
    if vararg {
        flags |= FLAG_VARARG;
    }
    if generator {
        flags |= FLAG_GENERATOR;
    }
    out.push(flags);
    match name {
        Some(n) => {
            out.push(1);
            write_str(out, n);
        }
        None => out.push(0),
    }
    out.push(defaults.len() as u8);
    for d in defaults {
        write_const(out, d);
    }
}

fn write_func(out: &mut Vec<u8>, proto: &FuncProto) {
    write_proto_header(
        out,
        proto.name.as_deref(),
        proto.arity,
        proto.vararg,
        proto.is_generator,
        &proto.defaults,
    );
    out.push(proto.upvalues.len() as u8);
    for up in &proto.upvalues {
        out.push(u8::from(up.is_local));
        out.push(up.index);
    }
    out.extend_from_slice(&proto.max_stack.to_be_bytes());
    out.extend_from_slice(&proto.cache_count.to_be_bytes());

    // Code record: u64 bytecode length, raw bytes, constant pool.
    out.extend_from_slice(&(proto.code.bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(&proto.code.bytes);
    out.extend_from_slice(&(proto.code.consts.len() as u16).to_be_bytes());
    for c in &proto.code.consts {
        write_const(out, c);
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    if s.len() <= u8::MAX as usize {
        out.push(TAG_STR_SHORT);
        out.push(s.len() as u8);
    } else {
        out.push(TAG_STR_LONG);
        out.extend_from_slice(&(s.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(s.as_bytes());
}

fn write_const(out: &mut Vec<u8>, c: &Const) {
    match c {
        // Handles are runtime-only; their slot survives as null.
        Const::Null | Const::Handle => out.push(TAG_NULL),
        Const::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Const::Num(n) => {
            out.push(TAG_NUM);
            out.extend_from_slice(&n.to_bits().to_be_bytes());
        }
        Const::Str(s) => write_str(out, s),
        Const::Func(p) => {
            out.push(TAG_FUNC);
            write_func(out, p);
        }
        Const::Native(p) => {
            out.push(TAG_NATIVE);
            write_proto_header(out, Some(&p.name), p.arity, p.vararg, false, &p.defaults);
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SerializeError> {
        if self.pos + n > self.bytes.len() {
            return Err(SerializeError::ShortRead);
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SerializeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, SerializeError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    fn len_checked(&self, n: u64) -> Result<usize, SerializeError> {
        let n_usize = usize::try_from(n).map_err(|_| SerializeError::BadLength(n))?;
        if self.pos + n_usize > self.bytes.len() {
            return Err(SerializeError::BadLength(n));
        }
        Ok(n_usize)
    }

    fn str_body(&mut self, len: u64) -> Result<String, SerializeError> {
        let n = self.len_checked(len)?;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| SerializeError::BadString)
    }
}

struct ProtoHeader {
    name: Option<String>,
    arity: u8,
    vararg: bool,
    generator: bool,
    defaults: Vec<Const>,
}

fn read_proto_header(r: &mut Reader) -> Result<ProtoHeader, SerializeError> {
    let arity = r.u8()?;
    let flags = r.u8()?;
    let name = if r.u8()? != 0 {
        match read_const(r)? {
            Const::Str(s) => Some(s),
            _ => return Err(SerializeError::BadString),
        }
    } else {
        None
    };
    let ndefaults = r.u8()?;
    let mut defaults = Vec::with_capacity(ndefaults as usize);
    for _ in 0..ndefaults {
        defaults.push(read_const(r)?);
    }
    Ok(ProtoHeader {
        name,
        arity,
        vararg: flags & FLAG_VARARG != 0,
        generator: flags & FLAG_GENERATOR != 0,
        defaults,
    })
}

fn read_func(r: &mut Reader) -> Result<FuncProto, SerializeError> {
    let header = read_proto_header(r)?;
    let nupvals = r.u8()?;
    let mut upvalues = Vec::with_capacity(nupvals as usize);
    for _ in 0..nupvals {
        let is_local = r.u8()? != 0;
        let index = r.u8()?;
        upvalues.push(UpvalueDesc { is_local, index });
    }
    let max_stack = r.u16()?;
    let cache_count = r.u16()?;

    let code_len = r.u64()?;
    let n = r.len_checked(code_len)?;
    let bytes = r.take(n)?.to_vec();
    let nconsts = r.u16()?;
    let mut consts = Vec::with_capacity(nconsts as usize);
    for _ in 0..nconsts {
        consts.push(read_const(r)?);
    }

    Ok(FuncProto {
        name: header.name,
        arity: header.arity,
        vararg: header.vararg,
        defaults: header.defaults,
        upvalues,
        max_stack,
        cache_count,
        is_generator: header.generator,
        code: Code { bytes, consts, lines: Vec::new() },
    })
}

fn read_const(r: &mut Reader) -> Result<Const, SerializeError> {
    let tag = r.u8()?;
    match tag {
        TAG_NULL => Ok(Const::Null),
        TAG_BOOL => Ok(Const::Bool(r.u8()? != 0)),
        TAG_NUM => Ok(Const::Num(f64::from_bits(r.u64()?))),
        TAG_STR_SHORT => {
            let len = r.u8()?;
            Ok(Const::Str(r.str_body(len as u64)?))
        }
        TAG_STR_LONG => {
            let len = r.u64()?;
            Ok(Const::Str(r.str_body(len)?))
        }
        TAG_FUNC => Ok(Const::Func(Box::new(read_func(r)?))),
        TAG_NATIVE => {
            let h = read_proto_header(r)?;
            Ok(Const::Native(NativeProto {
                name: h.name.unwrap_or_default(),
                arity: h.arity,
                vararg: h.vararg,
                defaults: h.defaults,
            }))
        }
        other => Err(SerializeError::BadTag(other)),
    }
}
