//! Binary chunk serialization (dump) and deserialization (load).
//!
//! A chunk is a serialized Module: header with signature, version and
//! sanity probes, then each function's code, constants, and upvalue
//! descriptors. Sizes use a variable-length encoding with the high bit
//! set on the final byte.

use crate::module::{Constant, Module, UnlinkedCodeBlock, UpvalueDesc};
use crate::opcode::Instruction;
use std::fmt;

const SIGNATURE: &[u8; 5] = b"\x1bMond";
const VERSION: u8 = 1;
const FORMAT: u8 = 0;
/// Corruption probe (detects text-mode and endianness mangling).
const SANITY_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
const SANITY_NUM: f64 = 370.5;

const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

const UPVAL_LOCAL: u8 = 1;
const UPVAL_UPVAL: u8 = 0;

/// Errors raised while loading a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    BadSignature,
    BadVersion(u8),
    BadFormat(u8),
    CorruptHeader,
    Truncated,
    BadConstantTag(u8),
    BadUpvalueTag(u8),
    BadOpcode(u8),
    BadEntryIndex(u32),
    SizeOverflow,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::BadSignature => write!(f, "not a Mond chunk (bad signature)"),
            ChunkError::BadVersion(v) => write!(f, "unsupported chunk version {v}"),
            ChunkError::BadFormat(v) => write!(f, "unsupported chunk format {v}"),
            ChunkError::CorruptHeader => write!(f, "corrupt chunk header"),
            ChunkError::Truncated => write!(f, "truncated chunk"),
            ChunkError::BadConstantTag(t) => write!(f, "bad constant tag {t}"),
            ChunkError::BadUpvalueTag(t) => write!(f, "bad upvalue tag {t}"),
            ChunkError::BadOpcode(op) => write!(f, "bad opcode {op}"),
            ChunkError::BadEntryIndex(i) => write!(f, "entry index {i} out of range"),
            ChunkError::SizeOverflow => write!(f, "size field overflow"),
        }
    }
}

impl std::error::Error for ChunkError {}

// ---- Dumper ----

/// Serialize a module to chunk bytes.
pub fn dump(module: &Module) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SIGNATURE);
    out.push(VERSION);
    out.push(FORMAT);
    out.extend_from_slice(SANITY_DATA);
    out.extend_from_slice(&SANITY_NUM.to_le_bytes());

    write_size(&mut out, module.functions.len());
    write_size(&mut out, module.entry as usize);
    for f in &module.functions {
        write_function(&mut out, f);
    }
    out
}

fn write_size(out: &mut Vec<u8>, mut n: usize) {
    let mut buf = [0u8; 10];
    let mut i = 0;
    loop {
        buf[i] = (n & 0x7f) as u8;
        n >>= 7;
        i += 1;
        if n == 0 {
            break;
        }
    }
    for j in (1..i).rev() {
        out.push(buf[j]);
    }
    out.push(buf[0] | 0x80);
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_size(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn write_function(out: &mut Vec<u8>, f: &UnlinkedCodeBlock) {
    out.push(f.num_params);
    out.push(f.is_vararg as u8);
    out.push(f.max_frame_size);

    write_size(out, f.code.len());
    for inst in &f.code {
        out.extend_from_slice(&inst.0.to_le_bytes());
    }

    write_size(out, f.constants.len());
    for k in &f.constants {
        match k {
            Constant::Nil => out.push(TAG_NIL),
            Constant::Bool(false) => out.push(TAG_FALSE),
            Constant::Bool(true) => out.push(TAG_TRUE),
            Constant::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::String(bytes) => {
                out.push(TAG_STRING);
                write_bytes(out, bytes);
            }
        }
    }

    write_size(out, f.upvalues.len());
    for uv in &f.upvalues {
        match uv {
            UpvalueDesc::FromParentLocal(i) => {
                out.push(UPVAL_LOCAL);
                out.push(*i);
            }
            UpvalueDesc::FromParentUpvalue(i) => {
                out.push(UPVAL_UPVAL);
                out.push(*i);
            }
        }
    }

    write_size(out, f.lines.len());
    for &line in &f.lines {
        write_size(out, line as usize);
    }

    match &f.source {
        Some(s) => {
            out.push(1);
            write_bytes(out, s.as_bytes());
        }
        None => out.push(0),
    }
}

// ---- Loader ----

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, ChunkError> {
        let b = *self.data.get(self.pos).ok_or(ChunkError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        let end = self.pos.checked_add(n).ok_or(ChunkError::Truncated)?;
        if end > self.data.len() {
            return Err(ChunkError::Truncated);
        }
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn size(&mut self) -> Result<usize, ChunkError> {
        let mut n: usize = 0;
        loop {
            let b = self.byte()?;
            n = n
                .checked_mul(128)
                .and_then(|v| v.checked_add((b & 0x7f) as usize))
                .ok_or(ChunkError::SizeOverflow)?;
            if b & 0x80 != 0 {
                return Ok(n);
            }
        }
    }

    fn u32(&mut self) -> Result<u32, ChunkError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, ChunkError> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Deserialize a module from chunk bytes, validating header and content.
pub fn load(data: &[u8]) -> Result<Module, ChunkError> {
    let mut r = Reader { data, pos: 0 };

    if r.bytes(SIGNATURE.len())? != SIGNATURE {
        return Err(ChunkError::BadSignature);
    }
    let version = r.byte()?;
    if version != VERSION {
        return Err(ChunkError::BadVersion(version));
    }
    let format = r.byte()?;
    if format != FORMAT {
        return Err(ChunkError::BadFormat(format));
    }
    if r.bytes(SANITY_DATA.len())? != SANITY_DATA {
        return Err(ChunkError::CorruptHeader);
    }
    if r.f64()?.to_bits() != SANITY_NUM.to_bits() {
        return Err(ChunkError::CorruptHeader);
    }

    let nfuncs = r.size()?;
    let entry = r.size()? as u32;
    if entry as usize >= nfuncs {
        return Err(ChunkError::BadEntryIndex(entry));
    }
    let mut functions = Vec::with_capacity(nfuncs.min(1024));
    for _ in 0..nfuncs {
        functions.push(read_function(&mut r)?);
    }
    Ok(Module { functions, entry })
}

fn read_function(r: &mut Reader<'_>) -> Result<UnlinkedCodeBlock, ChunkError> {
    let num_params = r.byte()?;
    let is_vararg = r.byte()? != 0;
    let max_frame_size = r.byte()?;

    let code_len = r.size()?;
    let mut code = Vec::with_capacity(code_len.min(1 << 20));
    for _ in 0..code_len {
        let raw = r.u32()?;
        let inst = Instruction(raw);
        if crate::opcode::OpCode::from_u8(inst.raw_opcode()).is_none() {
            return Err(ChunkError::BadOpcode(inst.raw_opcode()));
        }
        code.push(inst);
    }

    let nconsts = r.size()?;
    let mut constants = Vec::with_capacity(nconsts.min(1 << 16));
    for _ in 0..nconsts {
        let tag = r.byte()?;
        constants.push(match tag {
            TAG_NIL => Constant::Nil,
            TAG_FALSE => Constant::Bool(false),
            TAG_TRUE => Constant::Bool(true),
            TAG_NUMBER => Constant::Number(r.f64()?),
            TAG_STRING => {
                let len = r.size()?;
                Constant::String(r.bytes(len)?.to_vec())
            }
            t => return Err(ChunkError::BadConstantTag(t)),
        });
    }

    let nupvals = r.size()?;
    let mut upvalues = Vec::with_capacity(nupvals.min(256));
    for _ in 0..nupvals {
        let tag = r.byte()?;
        let idx = r.byte()?;
        upvalues.push(match tag {
            UPVAL_LOCAL => UpvalueDesc::FromParentLocal(idx),
            UPVAL_UPVAL => UpvalueDesc::FromParentUpvalue(idx),
            t => return Err(ChunkError::BadUpvalueTag(t)),
        });
    }

    let nlines = r.size()?;
    let mut lines = Vec::with_capacity(nlines.min(1 << 20));
    for _ in 0..nlines {
        lines.push(r.size()? as u32);
    }

    let source = if r.byte()? != 0 {
        let len = r.size()?;
        Some(String::from_utf8_lossy(r.bytes(len)?).into_owned())
    } else {
        None
    };

    Ok(UnlinkedCodeBlock {
        code,
        constants,
        upvalues,
        num_params,
        is_vararg,
        max_frame_size,
        lines,
        source,
    })
}
