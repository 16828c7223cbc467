//! Minimal x86-64 byte emitter for stencil construction.
//!
//! Only the handful of encodings the templates need: 64-bit immediate
//! moves (the hole carriers), register moves, indirect call/jmp,
//! rel32 branches, RIP-relative loads, and the prologue/epilogue
//! push/pop set. Relocation fields are filled with the placeholder
//! byte and recorded; local branches are resolved immediately.

use crate::stencil::{
    CondBrLatePatchRecord, RelocType, RelocationRecord, SharedObjectId, SymKind, PLACEHOLDER_BYTE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn low(self) -> u8 {
        (self as u8) & 7
    }

    fn ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// Condition codes for jcc rel32 (0F 80+cc).
#[derive(Clone, Copy, Debug)]
pub enum Cond {
    /// ZF set.
    Eq,
    /// ZF clear.
    Ne,
    /// SF set (negative).
    Sign,
}

impl Cond {
    fn cc(self) -> u8 {
        match self {
            Cond::Eq => 0x4,
            Cond::Ne => 0x5,
            Cond::Sign => 0x8,
        }
    }
}

/// An unresolved branch within the section being emitted.
#[must_use]
pub struct LocalFixup(usize);

pub struct Asm {
    pub code: Vec<u8>,
    pub relos: Vec<RelocationRecord>,
    pub cond_brs: Vec<CondBrLatePatchRecord>,
}

impl Asm {
    pub fn new() -> Self {
        Asm {
            code: Vec::new(),
            relos: Vec::new(),
            cond_brs: Vec::new(),
        }
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    // ---- Moves ----

    /// movabs reg, imm64
    pub fn mov_reg_imm64(&mut self, reg: Reg, v: u64) {
        let rex = 0x48 | (reg.ext() as u8);
        self.emit(&[rex, 0xB8 + reg.low()]);
        self.emit(&v.to_le_bytes());
    }

    /// movabs reg, <reloc>; the imm64 field becomes a relocation.
    pub fn mov_reg_imm64_reloc(&mut self, reg: Reg, sym: SymKind, addend: i64) -> usize {
        let rex = 0x48 | (reg.ext() as u8);
        self.emit(&[rex, 0xB8 + reg.low()]);
        let field = self.here();
        self.relos.push(RelocationRecord {
            offset: field,
            ty: RelocType::Abs64,
            sym,
            addend,
        });
        self.emit(&[PLACEHOLDER_BYTE; 8]);
        field
    }

    /// mov dst, src (64-bit)
    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        let rex = 0x48 | ((src.ext() as u8) << 2) | (dst.ext() as u8);
        let modrm = 0xC0 | (src.low() << 3) | dst.low();
        self.emit(&[rex, 0x89, modrm]);
    }

    /// mov rax, [rax]
    pub fn mov_rax_deref_rax(&mut self) {
        self.emit(&[0x48, 0x8B, 0x00]);
    }

    /// mov rax, [rax + rdx*8]
    pub fn mov_rax_index_rdx8(&mut self) {
        self.emit(&[0x48, 0x8B, 0x04, 0xD0]);
    }

    /// mov rax, [rip + disp32] with a PC-relative relocation to a
    /// shared constant data object (addend is relative to the object).
    pub fn mov_rax_rip_shared(&mut self, id: SharedObjectId, byte_offset: i64) {
        self.emit(&[0x48, 0x8B, 0x05]);
        let field = self.here();
        self.relos.push(RelocationRecord {
            offset: field,
            ty: RelocType::Pc32,
            sym: SymKind::SharedConstantDataObject(id),
            addend: byte_offset - 4,
        });
        self.emit(&[PLACEHOLDER_BYTE; 4]);
    }

    /// mov rax, imm32 (sign-extended)
    pub fn mov_rax_imm32(&mut self, v: i32) {
        self.emit(&[0x48, 0xC7, 0xC0]);
        self.emit(&v.to_le_bytes());
    }

    // ---- Calls and jumps ----

    /// call rax
    pub fn call_rax(&mut self) {
        self.emit(&[0xFF, 0xD0]);
    }

    /// jmp rax
    pub fn jmp_rax(&mut self) {
        self.emit(&[0xFF, 0xE0]);
    }

    /// test rax, rax
    pub fn test_rax(&mut self) {
        self.emit(&[0x48, 0x85, 0xC0]);
    }

    /// cmp rax, imm8
    pub fn cmp_rax_imm8(&mut self, v: i8) {
        self.emit(&[0x48, 0x83, 0xF8, v as u8]);
    }

    /// cmp rax, rcx
    pub fn cmp_rax_rcx(&mut self) {
        self.emit(&[0x48, 0x39, 0xC8]);
    }

    /// jcc rel32 to a local label (resolve with `bind`).
    pub fn jcc_local(&mut self, cond: Cond) -> LocalFixup {
        self.emit(&[0x0F, 0x80 + cond.cc()]);
        let field = self.here();
        self.emit(&[0; 4]);
        LocalFixup(field)
    }

    /// jmp rel32 to a local label.
    pub fn jmp_local(&mut self) -> LocalFixup {
        self.emit(&[0xE9]);
        let field = self.here();
        self.emit(&[0; 4]);
        LocalFixup(field)
    }

    /// Resolve a local branch to the current position.
    pub fn bind(&mut self, fixup: LocalFixup) {
        let target = self.here() as i64;
        let rel = target - (fixup.0 as i64 + 4);
        let v = i32::try_from(rel).expect("local branch in range");
        self.code[fixup.0..fixup.0 + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// jcc rel32 with a section-level relocation.
    pub fn jcc_reloc(&mut self, cond: Cond, sym: SymKind, addend: i64) {
        self.emit(&[0x0F, 0x80 + cond.cc()]);
        let field = self.here();
        self.relos.push(RelocationRecord {
            offset: field,
            ty: RelocType::Pc32,
            sym,
            addend,
        });
        self.emit(&[PLACEHOLDER_BYTE; 4]);
    }

    /// jmp rel32 with a section-level relocation.
    pub fn jmp_reloc(&mut self, sym: SymKind, addend: i64) {
        self.emit(&[0xE9]);
        let field = self.here();
        self.relos.push(RelocationRecord {
            offset: field,
            ty: RelocType::Pc32,
            sym,
            addend,
        });
        self.emit(&[PLACEHOLDER_BYTE; 4]);
    }

    /// jcc rel32 whose target is another bytecode, filled by the
    /// driver's late-patch pass.
    pub fn jcc_condbr(&mut self, cond: Cond) {
        self.emit(&[0x0F, 0x80 + cond.cc()]);
        let field = self.here();
        self.cond_brs.push(CondBrLatePatchRecord {
            offset: field,
            is_64bit: false,
        });
        self.emit(&[PLACEHOLDER_BYTE; 4]);
    }

    /// jmp rel32 whose target is another bytecode (late patch).
    pub fn jmp_condbr(&mut self) {
        self.emit(&[0xE9]);
        let field = self.here();
        self.cond_brs.push(CondBrLatePatchRecord {
            offset: field,
            is_64bit: false,
        });
        self.emit(&[PLACEHOLDER_BYTE; 4]);
    }

    // ---- Prologue / epilogue ----

    pub fn push_reg(&mut self, reg: Reg) {
        if reg.ext() {
            self.emit(&[0x41, 0x50 + reg.low()]);
        } else {
            self.emit(&[0x50 + reg.low()]);
        }
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        if reg.ext() {
            self.emit(&[0x41, 0x58 + reg.low()]);
        } else {
            self.emit(&[0x58 + reg.low()]);
        }
    }

    pub fn ret(&mut self) {
        self.emit(&[0xC3]);
    }

    /// The shared frame-exit sequence: restore callee-saved registers
    /// and return whatever status is in rax.
    pub fn epilogue(&mut self) {
        self.pop_reg(Reg::R15);
        self.pop_reg(Reg::R14);
        self.pop_reg(Reg::R13);
        self.pop_reg(Reg::Rbx);
        self.pop_reg(Reg::Rbp);
        self.ret();
    }
}

impl Default for Asm {
    fn default() -> Self {
        Self::new()
    }
}
