//! x86-64 instruction encoding.
//!
//! Appends bytes to an internal buffer. The caller (lower.rs) decides
//! *what* to emit; this module only knows *how* to encode each
//! instruction form: REX prefixes, ModRM/SIB bytes, displacements.

/// x86-64 general-purpose register identifier (hardware number 0–15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
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

impl Gpr {
    /// Low 3 bits for ModRM/SIB fields.
    fn low3(self) -> u8 {
        self as u8 & 0x7
    }

    /// True for r8–r15 (needs a REX extension bit).
    fn ext(self) -> bool {
        self as u8 >= 8
    }
}

/// System V argument registers, in order.
pub const ARG_REGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Condition encodings for `setcc` / `jcc` (the low nibble of the opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CondCode {
    B = 0x2,  // below (unsigned <)
    Ae = 0x3, // above or equal (unsigned >=)
    E = 0x4,  // equal
    Ne = 0x5, // not equal
    Be = 0x6, // below or equal (unsigned <=)
    A = 0x7,  // above (unsigned >)
    L = 0xC,  // less (signed <)
    Ge = 0xD, // greater or equal (signed >=)
    Le = 0xE, // less or equal (signed <=)
    G = 0xF,  // greater (signed >)
}

/// Two-operand ALU forms encoded as `op r/m, r` (dst = dst op src).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluRmOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

impl AluRmOp {
    fn opcode(self) -> u8 {
        match self {
            AluRmOp::Add => 0x01,
            AluRmOp::Sub => 0x29,
            AluRmOp::And => 0x21,
            AluRmOp::Or => 0x09,
            AluRmOp::Xor => 0x31,
        }
    }
}

/// A byte position holding a rel32 field that still needs its target.
#[derive(Debug, Clone, Copy)]
pub struct PatchPoint {
    /// Byte index of the 4-byte displacement within `code`.
    pub(crate) pos: usize,
}

/// Low-level x86-64 encoder over a growable byte buffer.
pub struct Encoder {
    pub(crate) code: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            code: Vec::with_capacity(4096),
        }
    }

    /// Current byte offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn imm32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn imm64(&mut self, v: i64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a REX prefix if any bit is set (or unconditionally for W).
    ///
    /// REX = 0100WRXB: W = 64-bit operand, R extends ModRM.reg,
    /// X extends SIB.index, B extends ModRM.rm / SIB.base.
    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let byte = 0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | (b as u8);
        if byte != 0x40 {
            self.byte(byte);
        }
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.byte(md << 6 | (reg & 7) << 3 | (rm & 7));
    }

    fn sib(&mut self, scale: u8, index: u8, base: u8) {
        self.byte(scale << 6 | (index & 7) << 3 | (base & 7));
    }

    // ---- Register-register moves and ALU ----

    /// `MOV r/m, r` — register to register (`89 /r`).
    pub fn mov_rr(&mut self, w64: bool, dst: Gpr, src: Gpr) {
        self.rex(w64, src.ext(), false, dst.ext());
        self.byte(0x89);
        self.modrm(0b11, src.low3(), dst.low3());
    }

    /// `MOV r32, imm32` (`B8+rd id`) — zero-extends into the full register.
    pub fn mov_ri32(&mut self, dst: Gpr, imm: i32) {
        self.rex(false, false, false, dst.ext());
        self.byte(0xB8 + dst.low3());
        self.imm32(imm);
    }

    /// Load a 64-bit immediate: `C7 /0 id` (sign-extended imm32) when it
    /// fits, otherwise the full `movabs` (`B8+rd io`).
    pub fn mov_ri64(&mut self, dst: Gpr, imm: i64) {
        if imm == imm as i32 as i64 {
            self.rex(true, false, false, dst.ext());
            self.byte(0xC7);
            self.modrm(0b11, 0, dst.low3());
            self.imm32(imm as i32);
        } else {
            self.rex(true, false, false, dst.ext());
            self.byte(0xB8 + dst.low3());
            self.imm64(imm);
        }
    }

    /// Two-operand ALU: `dst = dst op src` (`op /r`).
    pub fn alu_rr(&mut self, op: AluRmOp, w64: bool, dst: Gpr, src: Gpr) {
        self.rex(w64, src.ext(), false, dst.ext());
        self.byte(op.opcode());
        self.modrm(0b11, src.low3(), dst.low3());
    }

    /// `IMUL r, r/m` (`0F AF /r`) — dst = dst * src.
    pub fn imul_rr(&mut self, w64: bool, dst: Gpr, src: Gpr) {
        self.rex(w64, dst.ext(), false, src.ext());
        self.byte(0x0F);
        self.byte(0xAF);
        self.modrm(0b11, dst.low3(), src.low3());
    }

    /// `CMP r/m, r` (`39 /r`) — compares lhs against rhs, sets flags.
    pub fn cmp_rr(&mut self, w64: bool, lhs: Gpr, rhs: Gpr) {
        self.rex(w64, rhs.ext(), false, lhs.ext());
        self.byte(0x39);
        self.modrm(0b11, rhs.low3(), lhs.low3());
    }

    /// `TEST r/m, r` (`85 /r`).
    pub fn test_rr(&mut self, w64: bool, lhs: Gpr, rhs: Gpr) {
        self.rex(w64, rhs.ext(), false, lhs.ext());
        self.byte(0x85);
        self.modrm(0b11, rhs.low3(), lhs.low3());
    }

    /// `SETcc r/m8` (`0F 90+cc /0`) on the low byte of `dst`.
    ///
    /// A REX prefix is forced for dst >= 8; for rsp/rbp/rsi/rdi it would
    /// also be needed, but callers only pass a scratch (r11).
    pub fn setcc(&mut self, cc: CondCode, dst: Gpr) {
        self.rex(false, false, false, dst.ext());
        self.byte(0x0F);
        self.byte(0x90 + cc as u8);
        self.modrm(0b11, 0, dst.low3());
    }

    /// `MOVZX r32, r/m8` (`0F B6 /r`).
    pub fn movzx_r32_r8(&mut self, dst: Gpr, src: Gpr) {
        self.rex(false, dst.ext(), false, src.ext());
        self.byte(0x0F);
        self.byte(0xB6);
        self.modrm(0b11, dst.low3(), src.low3());
    }

    /// Three-operand add via `LEA r, [base + index]` (`8D /r`).
    ///
    /// With a 32-bit destination the address sum is truncated to 32
    /// bits, which is exactly wrapping i32 addition.
    pub fn lea_rr(&mut self, w64: bool, dst: Gpr, base: Gpr, index: Gpr) {
        debug_assert!(index != Gpr::Rsp, "rsp cannot be an SIB index");
        self.rex(w64, dst.ext(), index.ext(), base.ext());
        self.byte(0x8D);
        // rbp/r13 as base with mod=00 would mean disp32-no-base; use a
        // zero disp8 instead.
        if base.low3() == 5 {
            self.modrm(0b01, dst.low3(), 0b100);
            self.sib(0, index.low3(), base.low3());
            self.byte(0);
        } else {
            self.modrm(0b00, dst.low3(), 0b100);
            self.sib(0, index.low3(), base.low3());
        }
    }

    // ---- Memory ----

    /// `MOV r32, [base + index]` (`8B /r` with SIB).
    pub fn load32_bi(&mut self, dst: Gpr, base: Gpr, index: Gpr) {
        debug_assert!(index != Gpr::Rsp, "rsp cannot be an SIB index");
        self.rex(false, dst.ext(), index.ext(), base.ext());
        self.byte(0x8B);
        if base.low3() == 5 {
            self.modrm(0b01, dst.low3(), 0b100);
            self.sib(0, index.low3(), base.low3());
            self.byte(0);
        } else {
            self.modrm(0b00, dst.low3(), 0b100);
            self.sib(0, index.low3(), base.low3());
        }
    }

    /// `MOV [base + index], r32` (`89 /r` with SIB).
    pub fn store32_bi(&mut self, base: Gpr, index: Gpr, src: Gpr) {
        debug_assert!(index != Gpr::Rsp, "rsp cannot be an SIB index");
        self.rex(false, src.ext(), index.ext(), base.ext());
        self.byte(0x89);
        if base.low3() == 5 {
            self.modrm(0b01, src.low3(), 0b100);
            self.sib(0, index.low3(), base.low3());
            self.byte(0);
        } else {
            self.modrm(0b00, src.low3(), 0b100);
            self.sib(0, index.low3(), base.low3());
        }
    }

    /// `MOV r, [rbp + disp32]` (`8B /r`, mod=10 rm=101).
    pub fn load_rbp(&mut self, w64: bool, dst: Gpr, disp: i32) {
        self.rex(w64, dst.ext(), false, false);
        self.byte(0x8B);
        self.modrm(0b10, dst.low3(), 0b101);
        self.imm32(disp);
    }

    /// `MOV [rbp + disp32], r` (`89 /r`, mod=10 rm=101).
    pub fn store_rbp(&mut self, w64: bool, disp: i32, src: Gpr) {
        self.rex(w64, src.ext(), false, false);
        self.byte(0x89);
        self.modrm(0b10, src.low3(), 0b101);
        self.imm32(disp);
    }

    /// `MOV r, [rip + disp32]` (`8B /r`, mod=00 rm=101). Returns the
    /// patch point of the displacement.
    pub fn load_rip(&mut self, w64: bool, dst: Gpr) -> PatchPoint {
        self.rex(w64, dst.ext(), false, false);
        self.byte(0x8B);
        self.modrm(0b00, dst.low3(), 0b101);
        let pos = self.offset();
        self.imm32(0);
        PatchPoint { pos }
    }

    // ---- Stack / frame ----

    /// `PUSH r64` (`50+rd`).
    pub fn push_r(&mut self, r: Gpr) {
        self.rex(false, false, false, r.ext());
        self.byte(0x50 + r.low3());
    }

    /// `POP r64` (`58+rd`).
    pub fn pop_r(&mut self, r: Gpr) {
        self.rex(false, false, false, r.ext());
        self.byte(0x58 + r.low3());
    }

    /// `SUB rsp, imm32` (`81 /5 id`).
    pub fn sub_rsp(&mut self, imm: i32) {
        self.rex(true, false, false, false);
        self.byte(0x81);
        self.modrm(0b11, 5, Gpr::Rsp.low3());
        self.imm32(imm);
    }

    /// `LEA rsp, [rbp + disp32]` (`8D /r`) — frame unwinding.
    pub fn lea_rsp_rbp(&mut self, disp: i32) {
        self.rex(true, false, false, false);
        self.byte(0x8D);
        self.modrm(0b10, Gpr::Rsp.low3(), 0b101);
        self.imm32(disp);
    }

    // ---- Control flow ----

    /// `CALL rel32` (`E8 cd`). Returns the patch point.
    pub fn call_rel32(&mut self) -> PatchPoint {
        self.byte(0xE8);
        let pos = self.offset();
        self.imm32(0);
        PatchPoint { pos }
    }

    /// `CALL r64` (`FF /2`).
    pub fn call_r(&mut self, r: Gpr) {
        self.rex(false, false, false, r.ext());
        self.byte(0xFF);
        self.modrm(0b11, 2, r.low3());
    }

    /// `JMP rel32` (`E9 cd`). Returns the patch point.
    pub fn jmp_rel32(&mut self) -> PatchPoint {
        self.byte(0xE9);
        let pos = self.offset();
        self.imm32(0);
        PatchPoint { pos }
    }

    /// `Jcc rel32` (`0F 80+cc cd`). Returns the patch point.
    pub fn jcc_rel32(&mut self, cc: CondCode) -> PatchPoint {
        self.byte(0x0F);
        self.byte(0x80 + cc as u8);
        let pos = self.offset();
        self.imm32(0);
        PatchPoint { pos }
    }

    /// `JZ rel32` (`0F 84 cd`).
    pub fn jz_rel32(&mut self) -> PatchPoint {
        self.jcc_rel32(CondCode::E)
    }

    /// `RET` (`C3`).
    pub fn ret(&mut self) {
        self.byte(0xC3);
    }

    /// `UD2` (`0F 0B`) — guaranteed invalid-opcode trap.
    pub fn ud2(&mut self) {
        self.byte(0x0F);
        self.byte(0x0B);
    }

    /// Append raw bytes (constant pool data).
    pub fn emit_raw(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Pad with int3 up to the given alignment.
    pub fn pad_to_align(&mut self, align: usize) {
        while self.code.len() % align != 0 {
            self.byte(0xCC);
        }
    }

    /// Resolve a rel32 patch point against an absolute byte offset.
    ///
    /// The displacement is relative to the end of the 4-byte field
    /// (the next instruction).
    pub fn patch_rel32(&mut self, pp: PatchPoint, target: usize) {
        let disp = target as i64 - (pp.pos as i64 + 4);
        let disp = i32::try_from(disp).expect("rel32 displacement out of range");
        self.code[pp.pos..pp.pos + 4].copy_from_slice(&disp.to_le_bytes());
    }

    /// Resolve a rel32 patch point used for RIP-relative data access.
    /// Same arithmetic as `patch_rel32`; named separately for clarity
    /// at call sites.
    pub fn patch_rip_disp(&mut self, pp: PatchPoint, target: usize) {
        self.patch_rel32(pp, target);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(f: impl FnOnce(&mut Encoder)) -> Vec<u8> {
        let mut e = Encoder::new();
        f(&mut e);
        e.code
    }

    #[test]
    fn mov_imm32() {
        assert_eq!(
            enc(|e| e.mov_ri32(Gpr::Rax, 42)),
            vec![0xB8, 0x2A, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            enc(|e| e.mov_ri32(Gpr::R12, 7)),
            vec![0x41, 0xBC, 0x07, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn mov_imm64_forms() {
        // Fits in sign-extended imm32: REX.W C7 /0.
        assert_eq!(
            enc(|e| e.mov_ri64(Gpr::Rax, -1)),
            vec![0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // Full movabs.
        let bytes = enc(|e| e.mov_ri64(Gpr::R10, 0x1122334455667788));
        assert_eq!(&bytes[..2], &[0x49, 0xBA]);
        assert_eq!(&bytes[2..], &0x1122334455667788i64.to_le_bytes());
    }

    #[test]
    fn mov_rr_widths() {
        // mov ebx, eax
        assert_eq!(enc(|e| e.mov_rr(false, Gpr::Rbx, Gpr::Rax)), vec![0x89, 0xC3]);
        // mov r12, rbx
        assert_eq!(
            enc(|e| e.mov_rr(true, Gpr::R12, Gpr::Rbx)),
            vec![0x49, 0x89, 0xDC]
        );
    }

    #[test]
    fn alu_forms() {
        // add ebx, ecx
        assert_eq!(
            enc(|e| e.alu_rr(AluRmOp::Add, false, Gpr::Rbx, Gpr::Rcx)),
            vec![0x01, 0xCB]
        );
        // sub r10d, r11d
        assert_eq!(
            enc(|e| e.alu_rr(AluRmOp::Sub, false, Gpr::R10, Gpr::R11)),
            vec![0x45, 0x29, 0xDA]
        );
        // imul r10d, r11d
        assert_eq!(
            enc(|e| e.imul_rr(false, Gpr::R10, Gpr::R11)),
            vec![0x45, 0x0F, 0xAF, 0xD3]
        );
    }

    #[test]
    fn compare_and_set() {
        // cmp eax, ecx
        assert_eq!(enc(|e| e.cmp_rr(false, Gpr::Rax, Gpr::Rcx)), vec![0x39, 0xC8]);
        // test eax, eax
        assert_eq!(enc(|e| e.test_rr(false, Gpr::Rax, Gpr::Rax)), vec![0x85, 0xC0]);
        // setg r11b
        assert_eq!(
            enc(|e| e.setcc(CondCode::G, Gpr::R11)),
            vec![0x41, 0x0F, 0x9F, 0xC3]
        );
        // movzx eax, r11b
        assert_eq!(
            enc(|e| e.movzx_r32_r8(Gpr::Rax, Gpr::R11)),
            vec![0x41, 0x0F, 0xB6, 0xC3]
        );
    }

    #[test]
    fn lea_and_sib_edge_cases() {
        // lea eax, [rbx + r12]
        assert_eq!(
            enc(|e| e.lea_rr(false, Gpr::Rax, Gpr::Rbx, Gpr::R12)),
            vec![0x42, 0x8D, 0x04, 0x23]
        );
        // r13 as base needs the disp8=0 form.
        assert_eq!(
            enc(|e| e.lea_rr(false, Gpr::Rax, Gpr::R13, Gpr::Rbx)),
            vec![0x41, 0x8D, 0x44, 0x1D, 0x00]
        );
    }

    #[test]
    fn memory_forms() {
        // mov eax, [rbx + r10]
        assert_eq!(
            enc(|e| e.load32_bi(Gpr::Rax, Gpr::Rbx, Gpr::R10)),
            vec![0x42, 0x8B, 0x04, 0x13]
        );
        // mov [rbx + r10], ecx
        assert_eq!(
            enc(|e| e.store32_bi(Gpr::Rbx, Gpr::R10, Gpr::Rcx)),
            vec![0x42, 0x89, 0x0C, 0x13]
        );
        // mov eax, [rbp - 16]
        assert_eq!(
            enc(|e| e.load_rbp(false, Gpr::Rax, -16)),
            vec![0x8B, 0x85, 0xF0, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn prologue_pieces() {
        assert_eq!(enc(|e| e.push_r(Gpr::Rbp)), vec![0x55]);
        assert_eq!(enc(|e| e.push_r(Gpr::R12)), vec![0x41, 0x54]);
        assert_eq!(enc(|e| e.mov_rr(true, Gpr::Rbp, Gpr::Rsp)), vec![0x48, 0x89, 0xE5]);
        assert_eq!(
            enc(|e| e.sub_rsp(32)),
            vec![0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            enc(|e| e.lea_rsp_rbp(-40)),
            vec![0x48, 0x8D, 0xA5, 0xD8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn branch_patching() {
        let mut e = Encoder::new();
        let pp = e.jmp_rel32();
        e.ret();
        let target = e.offset();
        e.ud2();
        e.patch_rel32(pp, target);
        // jmp +1 (skips the ret)
        assert_eq!(e.code[..5], [0xE9, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn backward_branch_is_negative() {
        let mut e = Encoder::new();
        let target = e.offset();
        e.ret(); // 1 byte
        let pp = e.jmp_rel32(); // E9 at 1, disp field at 2..6
        e.patch_rel32(pp, target);
        // next-instruction offset is 6, so the displacement back to 0 is -6
        assert_eq!(e.code[2..6], (-6i32).to_le_bytes());
    }
}
