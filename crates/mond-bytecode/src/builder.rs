//! Programmatic bytecode construction.
//!
//! The engine consumes parsed modules; in-tree users (tests, tools)
//! construct them with this builder, which handles constant-pool
//! deduplication, jump backpatching, frame-size tracking, and
//! allocation-site numbering.

use crate::module::{constants_equal, Constant, Module, UnlinkedCodeBlock, UpvalueDesc};
use crate::opcode::{Instruction, OpCode};
use crate::operands::{operand_layout, OperandKind};

pub struct FunctionBuilder {
    code: Vec<Instruction>,
    constants: Vec<Constant>,
    upvalues: Vec<UpvalueDesc>,
    num_params: u8,
    is_vararg: bool,
    max_frame_size: u8,
    lines: Vec<u32>,
    current_line: u32,
    alloc_sites: u8,
    source: Option<String>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        FunctionBuilder {
            code: Vec::new(),
            constants: Vec::new(),
            upvalues: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_frame_size: 2,
            lines: Vec::new(),
            current_line: 0,
            alloc_sites: 0,
            source: None,
        }
    }

    pub fn params(&mut self, n: u8) -> &mut Self {
        self.num_params = n;
        self.touch(n);
        self
    }

    pub fn vararg(&mut self) -> &mut Self {
        self.is_vararg = true;
        self
    }

    pub fn source(&mut self, name: &str) -> &mut Self {
        self.source = Some(name.to_string());
        self
    }

    /// Set the source line for subsequently emitted instructions.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    /// Declare an upvalue captured from the parent frame's register.
    pub fn upvalue_from_local(&mut self, reg: u8) -> u8 {
        self.upvalues.push(UpvalueDesc::FromParentLocal(reg));
        (self.upvalues.len() - 1) as u8
    }

    /// Declare an upvalue shared from the parent closure.
    pub fn upvalue_from_upvalue(&mut self, idx: u8) -> u8 {
        self.upvalues.push(UpvalueDesc::FromParentUpvalue(idx));
        (self.upvalues.len() - 1) as u8
    }

    /// Add a constant to the pool, returning its index. Deduplicates.
    pub fn constant(&mut self, k: Constant) -> u16 {
        for (i, existing) in self.constants.iter().enumerate() {
            if constants_equal(existing, &k) {
                return i as u16;
            }
        }
        let idx = self.constants.len() as u16;
        self.constants.push(k);
        idx
    }

    pub fn number(&mut self, n: f64) -> u16 {
        self.constant(Constant::Number(n))
    }

    pub fn string(&mut self, s: &str) -> u16 {
        self.constant(Constant::String(s.as_bytes().to_vec()))
    }

    fn touch(&mut self, reg: u8) {
        let needed = reg.saturating_add(1);
        if needed > self.max_frame_size {
            self.max_frame_size = needed;
        }
    }

    /// Make the frame at least `n` registers wide (for multi-value
    /// windows the per-instruction tracking cannot see).
    pub fn ensure_frame(&mut self, n: u8) -> &mut Self {
        if n > self.max_frame_size {
            self.max_frame_size = n;
        }
        self
    }

    /// Emit an instruction, tracking touched registers.
    pub fn emit(&mut self, inst: Instruction) -> usize {
        let op = inst.opcode();
        for slot in operand_layout(op) {
            if slot.kind == OperandKind::Register {
                let r = match slot.field {
                    crate::operands::Field::A => inst.a(),
                    crate::operands::Field::B => inst.b(),
                    crate::operands::Field::C => inst.c(),
                    _ => 0,
                };
                self.touch(r);
            }
        }
        // Range-consuming instructions reach past their named operands.
        let a = inst.a();
        match op {
            OpCode::Call => self.touch(a.saturating_add(inst.b().max(inst.c()))),
            OpCode::TailCall | OpCode::Return | OpCode::SetList | OpCode::LoadNil => {
                self.touch(a.saturating_add(inst.b()))
            }
            OpCode::Concat => self.touch(a.saturating_add(inst.b())),
            OpCode::VarArg => self.touch(a.saturating_add(inst.c())),
            OpCode::ForPrep | OpCode::ForLoop => self.touch(a.saturating_add(3)),
            _ => {}
        }
        let pc = self.code.len();
        self.code.push(inst);
        self.lines.push(self.current_line);
        pc
    }

    // ---- Common emit helpers ----

    pub fn move_(&mut self, a: u8, b: u8) -> usize {
        self.emit(Instruction::abc(OpCode::Move, a, b, 0, false))
    }

    pub fn load_k(&mut self, a: u8, k: u16) -> usize {
        self.emit(Instruction::abx(OpCode::LoadK, a, k))
    }

    pub fn load_number(&mut self, a: u8, n: f64) -> usize {
        let k = self.number(n);
        self.load_k(a, k)
    }

    pub fn load_string(&mut self, a: u8, s: &str) -> usize {
        let k = self.string(s);
        self.load_k(a, k)
    }

    pub fn load_nil(&mut self, a: u8, count_minus_one: u8) -> usize {
        self.emit(Instruction::abc(OpCode::LoadNil, a, count_minus_one, 0, false))
    }

    pub fn load_true(&mut self, a: u8) -> usize {
        self.emit(Instruction::abc(OpCode::LoadTrue, a, 0, 0, false))
    }

    pub fn load_false(&mut self, a: u8) -> usize {
        self.emit(Instruction::abc(OpCode::LoadFalse, a, 0, 0, false))
    }

    /// Allocate a table; the allocation-site ordinal is assigned here.
    pub fn new_table(&mut self, a: u8, array_hint: u8) -> usize {
        let site = self.alloc_sites;
        self.alloc_sites = self.alloc_sites.saturating_add(1);
        self.emit(Instruction::abc(OpCode::NewTable, a, array_hint, site, false))
    }

    pub fn get_global(&mut self, a: u8, name: &str) -> usize {
        let k = self.string(name);
        self.emit(Instruction::abx(OpCode::GetGlobal, a, k))
    }

    pub fn set_global(&mut self, name: &str, a: u8) -> usize {
        let k = self.string(name);
        self.emit(Instruction::abx(OpCode::SetGlobal, a, k))
    }

    pub fn get_field(&mut self, a: u8, b: u8, key: &str) -> usize {
        let k = self.string(key);
        self.emit(Instruction::abc(OpCode::GetField, a, b, k as u8, false))
    }

    pub fn set_field(&mut self, a: u8, key: &str, c_reg: u8) -> usize {
        let k = self.string(key);
        self.emit(Instruction::abc(OpCode::SetField, a, k as u8, c_reg, false))
    }

    pub fn set_field_k(&mut self, a: u8, key: &str, kc: u16) -> usize {
        let k = self.string(key);
        self.emit(Instruction::abc(OpCode::SetField, a, k as u8, kc as u8, true))
    }

    pub fn call(&mut self, a: u8, nargs_plus_1: u8, nresults_plus_1: u8) -> usize {
        self.emit(Instruction::abc(OpCode::Call, a, nargs_plus_1, nresults_plus_1, false))
    }

    pub fn tail_call(&mut self, a: u8, nargs_plus_1: u8) -> usize {
        self.emit(Instruction::abc(OpCode::TailCall, a, nargs_plus_1, 0, false))
    }

    pub fn return_(&mut self, a: u8, nvals_plus_1: u8) -> usize {
        self.emit(Instruction::abc(OpCode::Return, a, nvals_plus_1, 0, false))
    }

    /// Emit a jump with an unresolved displacement; patch later.
    pub fn jmp(&mut self) -> usize {
        self.emit(Instruction::sj(OpCode::Jmp, 0))
    }

    /// Emit a jump directly to a known earlier pc.
    pub fn jmp_to(&mut self, target: usize) -> usize {
        let pc = self.code.len();
        let disp = target as i32 - (pc as i32 + 1);
        self.emit(Instruction::sj(OpCode::Jmp, disp))
    }

    /// Patch a previously emitted Jmp to land on `target`.
    pub fn patch_jmp(&mut self, jmp_pc: usize, target: usize) {
        let disp = target as i32 - (jmp_pc as i32 + 1);
        self.code[jmp_pc].set_sj(disp);
    }

    /// Patch a ForPrep/ForLoop displacement to land on `target`.
    pub fn patch_sbx(&mut self, pc: usize, target: usize) {
        let disp = target as i32 - (pc as i32 + 1);
        self.code[pc].set_sbx(disp);
    }

    /// The pc of the next instruction to be emitted.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn finish(self) -> UnlinkedCodeBlock {
        UnlinkedCodeBlock {
            code: self.code,
            constants: self.constants,
            upvalues: self.upvalues,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_frame_size: self.max_frame_size,
            lines: self.lines,
            source: self.source,
        }
    }
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ModuleBuilder {
    functions: Vec<UnlinkedCodeBlock>,
    entry: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            functions: Vec::new(),
            entry: 0,
        }
    }

    /// Add a function, returning its module index (for Closure operands).
    pub fn add_function(&mut self, f: UnlinkedCodeBlock) -> u32 {
        self.functions.push(f);
        (self.functions.len() - 1) as u32
    }

    pub fn entry(&mut self, idx: u32) -> &mut Self {
        self.entry = idx;
        self
    }

    pub fn finish(self) -> Module {
        Module {
            functions: self.functions,
            entry: self.entry,
        }
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
