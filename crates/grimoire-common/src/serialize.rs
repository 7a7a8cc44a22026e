//! Bytecode image serialization.
//!
//! Little-endian layout; every variable-length section is preceded by its
//! count:
//!
//! ```text
//! header      u32[4] = [n_iconst, n_fconst, n_sconst, n_opcodes]
//! iconsts     i32 × n_iconst
//! fconsts     f32 × n_fconst
//! sconsts     (u32 len, u32 code-point × len) × n_sconst
//! opcodes     u32 × n_opcodes
//! events      u32 n, (string, u32 pc) × n
//! globals     u32 × 4 per-kind counts
//! variables   u32 n, (string, u32 index, u8 mask) × n
//! primitives  u32 n, (u16 lib, string, signature) × n
//! classes     u32 n, (string, u32 nfields, (string, u8 kind) × nfields) × n
//! debug       u32 n, (string, u32 pos, u32 len) × n
//! ```
//!
//! `sconsts` entries are wide-char sequences (one u32 Unicode scalar per
//! char); all other strings are u32-length-prefixed UTF-8.

use thiserror::Error;

use crate::bytecode::{
    Bytecode, ClassDef, EventDef, FieldDef, FunctionInfo, GlobalCounts, Kind, PrimitiveDef,
    Signature, VariableDef,
};
use crate::instruction::Instruction;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerializeError {
    #[error("unexpected end of image")]
    UnexpectedEof,
    #[error("invalid utf-8 in string table")]
    InvalidUtf8,
    #[error("invalid unicode scalar {0:#x} in string constant")]
    InvalidScalar(u32),
    #[error("invalid kind byte {0}")]
    InvalidKind(u8),
}

pub struct ByteWriter {
    data: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn write_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn write_f32(&mut self, v: f32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    fn write_wide_string(&mut self, s: &str) {
        let count = s.chars().count() as u32;
        self.write_u32(count);
        for c in s.chars() {
            self.write_u32(c as u32);
        }
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, SerializeError> {
        let v = *self.data.get(self.pos).ok_or(SerializeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16, SerializeError> {
        let end = self.pos + 2;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(SerializeError::UnexpectedEof)?;
        self.pos = end;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, SerializeError> {
        let end = self.pos + 4;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(SerializeError::UnexpectedEof)?;
        self.pos = end;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, SerializeError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_f32(&mut self) -> Result<f32, SerializeError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_string(&mut self) -> Result<String, SerializeError> {
        let len = self.read_u32()? as usize;
        let end = self.pos + len;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(SerializeError::UnexpectedEof)?;
        self.pos = end;
        String::from_utf8(bytes.to_vec()).map_err(|_| SerializeError::InvalidUtf8)
    }

    fn read_wide_string(&mut self) -> Result<String, SerializeError> {
        let count = self.read_u32()? as usize;
        let mut s = String::with_capacity(count);
        for _ in 0..count {
            let raw = self.read_u32()?;
            let c = char::from_u32(raw).ok_or(SerializeError::InvalidScalar(raw))?;
            s.push(c);
        }
        Ok(s)
    }

    fn read_kind(&mut self) -> Result<Kind, SerializeError> {
        let raw = self.read_u8()?;
        Kind::from_u8(raw).ok_or(SerializeError::InvalidKind(raw))
    }
}

pub fn encode(bc: &Bytecode) -> Vec<u8> {
    let mut w = ByteWriter::new();

    w.write_u32(bc.iconsts.len() as u32);
    w.write_u32(bc.fconsts.len() as u32);
    w.write_u32(bc.sconsts.len() as u32);
    w.write_u32(bc.code.len() as u32);

    for &v in &bc.iconsts {
        w.write_i32(v);
    }
    for &v in &bc.fconsts {
        w.write_f32(v);
    }
    for s in &bc.sconsts {
        w.write_wide_string(s);
    }
    for inst in &bc.code {
        w.write_u32(inst.0);
    }

    w.write_u32(bc.events.len() as u32);
    for ev in &bc.events {
        w.write_string(&ev.name);
        w.write_u32(ev.pc);
    }

    w.write_u32(bc.globals.ints);
    w.write_u32(bc.globals.floats);
    w.write_u32(bc.globals.strs);
    w.write_u32(bc.globals.objs);

    // Sorted for a deterministic image.
    let mut vars: Vec<(&String, &VariableDef)> = bc.variables.iter().collect();
    vars.sort_by(|a, b| a.0.cmp(b.0));
    w.write_u32(vars.len() as u32);
    for (name, def) in vars {
        w.write_string(name);
        w.write_u32(def.index);
        w.write_u8(def.mask);
    }

    w.write_u32(bc.primitives.len() as u32);
    for prim in &bc.primitives {
        w.write_u16(prim.library);
        w.write_string(&prim.name);
        w.write_u32(prim.signature.params.len() as u32);
        for &k in &prim.signature.params {
            w.write_u8(k as u8);
        }
        match prim.signature.ret {
            Some(k) => {
                w.write_u8(1);
                w.write_u8(k as u8);
            }
            None => w.write_u8(0),
        }
    }

    w.write_u32(bc.classes.len() as u32);
    for class in &bc.classes {
        w.write_string(&class.name);
        w.write_u32(class.fields.len() as u32);
        for field in &class.fields {
            w.write_string(&field.name);
            w.write_u8(field.kind as u8);
        }
    }

    w.write_u32(bc.debug.len() as u32);
    for info in &bc.debug {
        w.write_string(&info.name);
        w.write_u32(info.pos);
        w.write_u32(info.len);
    }

    w.into_bytes()
}

pub fn decode(data: &[u8]) -> Result<Bytecode, SerializeError> {
    let mut r = ByteReader::new(data);
    let mut bc = Bytecode::new();

    let n_iconst = r.read_u32()? as usize;
    let n_fconst = r.read_u32()? as usize;
    let n_sconst = r.read_u32()? as usize;
    let n_opcode = r.read_u32()? as usize;

    bc.iconsts.reserve(n_iconst);
    for _ in 0..n_iconst {
        bc.iconsts.push(r.read_i32()?);
    }
    bc.fconsts.reserve(n_fconst);
    for _ in 0..n_fconst {
        bc.fconsts.push(r.read_f32()?);
    }
    bc.sconsts.reserve(n_sconst);
    for _ in 0..n_sconst {
        bc.sconsts.push(r.read_wide_string()?);
    }
    bc.code.reserve(n_opcode);
    for _ in 0..n_opcode {
        bc.code.push(Instruction(r.read_u32()?));
    }

    let n_events = r.read_u32()? as usize;
    for _ in 0..n_events {
        let name = r.read_string()?;
        let pc = r.read_u32()?;
        bc.events.push(EventDef { name, pc });
    }

    bc.globals = GlobalCounts {
        ints: r.read_u32()?,
        floats: r.read_u32()?,
        strs: r.read_u32()?,
        objs: r.read_u32()?,
    };

    let n_vars = r.read_u32()? as usize;
    for _ in 0..n_vars {
        let name = r.read_string()?;
        let index = r.read_u32()?;
        let mask = r.read_u8()?;
        bc.variables.insert(name, VariableDef { index, mask });
    }

    let n_prims = r.read_u32()? as usize;
    for _ in 0..n_prims {
        let library = r.read_u16()?;
        let name = r.read_string()?;
        let n_params = r.read_u32()? as usize;
        let mut params = Vec::with_capacity(n_params);
        for _ in 0..n_params {
            params.push(r.read_kind()?);
        }
        let ret = if r.read_u8()? != 0 {
            Some(r.read_kind()?)
        } else {
            None
        };
        bc.primitives.push(PrimitiveDef {
            library,
            name,
            signature: Signature { params, ret },
        });
    }

    let n_classes = r.read_u32()? as usize;
    for _ in 0..n_classes {
        let name = r.read_string()?;
        let n_fields = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            let fname = r.read_string()?;
            let kind = r.read_kind()?;
            fields.push(FieldDef { name: fname, kind });
        }
        bc.classes.push(ClassDef { name, fields });
    }

    let n_debug = r.read_u32()? as usize;
    for _ in 0..n_debug {
        let name = r.read_string()?;
        let pos = r.read_u32()?;
        let len = r.read_u32()?;
        bc.debug.push(FunctionInfo { name, pos, len });
    }

    Ok(bc)
}
