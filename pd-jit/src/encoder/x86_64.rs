use std::ops::Range;

use super::{
    Arch, InstructionEncoder, apply_displacement, displacement, read_u32, read_u64, write_u32,
    write_u64,
};
use crate::buffer::{BranchTarget, CodeBuffer};
use crate::error::{JitError, JitResult};
use crate::site::{EncodingForm, Label, PatchSite, SiteGeometry};

const OP_JMP_REL32: u8 = 0xE9;
const OP_JMP_REL8: u8 = 0xEB;
const OP_CALL_REL32: u8 = 0xE8;
const OP_MOV_R64_RM: u8 = 0x8B;
const OP_LEA_R64_M: u8 = 0x8D;
const OP_RET: u8 = 0xC3;
const OP_INT3: u8 = 0xCC;
const REX_W: u8 = 0x48;

/// `mov r11, imm64; call r11`
const FAR_CALL_LEN: usize = 13;
const FAR_CALL_IMM_OFFSET: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct X86_64Encoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Overflow = 0x0,
    Below = 0x2,
    Equal = 0x4,
    NotEqual = 0x5,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

fn rel32_from(field_at: usize, target: usize) -> Option<i32> {
    i32::try_from(displacement(field_at + 4, target)).ok()
}

fn rel8_from(field_at: usize, target: usize) -> Option<i8> {
    i8::try_from(displacement(field_at + 1, target)).ok()
}

fn out_of_range(at: usize, target: usize, form: &'static str) -> JitError {
    JitError::DisplacementOutOfRange { at, target, form }
}

fn unsupported_form(site: &PatchSite) -> JitError {
    JitError::Unsupported(match site.form() {
        EncodingForm::Rel32 | EncodingForm::Rel8 => "rel displacement used as a literal",
        EncodingForm::Imm32 => "imm32 field used as a branch",
        EncodingForm::Imm64 => "imm64 field used as an int32",
        EncodingForm::RexLoadOrLea => "instruction site used as a value",
        _ => "arm site on an x86_64 encoder",
    })
}

impl X86_64Encoder {
    fn swap_load_form(
        &self,
        code: &mut [u8],
        site: &PatchSite,
        from: u8,
        to: u8,
    ) -> JitResult<Range<usize>> {
        if site.form() != EncodingForm::RexLoadOrLea {
            return Err(unsupported_form(site));
        }
        site.check_bounds(code.len())?;
        let at = site.offset();
        let rex = code[at];
        if rex & 0xF8 != REX_W {
            return Err(JitError::UnexpectedInstruction {
                at,
                expected: "REX.W prefix",
                found: rex as u32,
            });
        }
        let opcode = code[at + 1];
        if opcode != from && opcode != to {
            return Err(JitError::UnexpectedInstruction {
                at: at + 1,
                expected: "mov or lea opcode",
                found: opcode as u32,
            });
        }
        code[at + 1] = to;
        Ok(at + 1..at + 2)
    }
}

impl InstructionEncoder for X86_64Encoder {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn pointer_width(&self) -> usize {
        8
    }

    fn code_alignment(&self) -> usize {
        8
    }

    fn padding(&self) -> &'static [u8] {
        &[OP_INT3]
    }

    fn resolve_near_branch(
        &self,
        code: &mut [u8],
        base: usize,
        at: usize,
        target: usize,
    ) -> JitResult<()> {
        let rel = rel32_from(base + at, target).ok_or(out_of_range(base + at, target, "rel32"))?;
        write_u32(code, at, rel as u32)?;
        Ok(())
    }

    fn can_relink(&self, code: &[u8], base: usize, site: &PatchSite, target: usize) -> bool {
        if site.check_bounds(code.len()).is_err() {
            return false;
        }
        let field_at = base + site.offset();
        match site.form() {
            EncodingForm::Rel32 => rel32_from(field_at, target).is_some(),
            EncodingForm::Rel8 => rel8_from(field_at, target).is_some(),
            EncodingForm::Imm64 => true,
            _ => false,
        }
    }

    fn relink(
        &self,
        code: &mut [u8],
        base: usize,
        site: &PatchSite,
        target: usize,
    ) -> JitResult<Range<usize>> {
        site.check_bounds(code.len())?;
        let at = site.offset();
        match site.form() {
            EncodingForm::Rel32 => {
                let rel =
                    rel32_from(base + at, target).ok_or(out_of_range(base + at, target, "rel32"))?;
                write_u32(code, at, rel as u32)
            }
            EncodingForm::Rel8 => {
                let rel =
                    rel8_from(base + at, target).ok_or(out_of_range(base + at, target, "rel8"))?;
                code[at] = rel as u8;
                Ok(at..at + 1)
            }
            EncodingForm::Imm64 => write_u64(code, at, target as u64),
            _ => Err(unsupported_form(site)),
        }
    }

    fn read_target(&self, code: &[u8], base: usize, site: &PatchSite) -> JitResult<usize> {
        site.check_bounds(code.len())?;
        let at = site.offset();
        match site.form() {
            EncodingForm::Rel32 => {
                let rel = read_u32(code, at)? as i32;
                apply_displacement(base + at + 4, rel as i64)
            }
            EncodingForm::Rel8 => apply_displacement(base + at + 1, code[at] as i8 as i64),
            EncodingForm::Imm64 => Ok(read_u64(code, at)? as usize),
            _ => Err(unsupported_form(site)),
        }
    }

    fn patch_int32(
        &self,
        code: &mut [u8],
        site: &PatchSite,
        value: i32,
    ) -> JitResult<Range<usize>> {
        if site.form() != EncodingForm::Imm32 {
            return Err(unsupported_form(site));
        }
        site.check_bounds(code.len())?;
        write_u32(code, site.offset(), value as u32)
    }

    fn read_int32(&self, code: &[u8], site: &PatchSite) -> JitResult<i32> {
        if site.form() != EncodingForm::Imm32 {
            return Err(unsupported_form(site));
        }
        Ok(read_u32(code, site.offset())? as i32)
    }

    fn patch_pointer(
        &self,
        code: &mut [u8],
        site: &PatchSite,
        value: usize,
    ) -> JitResult<Range<usize>> {
        if site.form() != EncodingForm::Imm64 {
            return Err(unsupported_form(site));
        }
        site.check_bounds(code.len())?;
        write_u64(code, site.offset(), value as u64)
    }

    fn read_pointer(&self, code: &[u8], site: &PatchSite) -> JitResult<usize> {
        if site.form() != EncodingForm::Imm64 {
            return Err(unsupported_form(site));
        }
        Ok(read_u64(code, site.offset())? as usize)
    }

    fn load_to_lea(&self, code: &mut [u8], site: &PatchSite) -> JitResult<Range<usize>> {
        self.swap_load_form(code, site, OP_MOV_R64_RM, OP_LEA_R64_M)
    }

    fn lea_to_load(&self, code: &mut [u8], site: &PatchSite) -> JitResult<Range<usize>> {
        self.swap_load_form(code, site, OP_LEA_R64_M, OP_MOV_R64_RM)
    }

    fn call_site_for_return(&self, return_offset: usize, near: bool) -> JitResult<PatchSite> {
        let back = if near { 4 } else { FAR_CALL_LEN - FAR_CALL_IMM_OFFSET };
        let offset = return_offset
            .checked_sub(back)
            .ok_or(JitError::InvalidSite {
                offset: return_offset,
                len: back,
                region_size: return_offset,
            })?;
        Ok(if near {
            PatchSite::NearCall(SiteGeometry::new(offset, EncodingForm::Rel32))
        } else {
            PatchSite::Call(SiteGeometry::new(offset, EncodingForm::Imm64))
        })
    }
}

pub fn emit_jmp_rel32(buf: &mut CodeBuffer) -> PatchSite {
    buf.emit_u8(OP_JMP_REL32);
    let at = buf.len();
    buf.emit_u32(0);
    PatchSite::Jump(SiteGeometry::new(at, EncodingForm::Rel32))
}

pub fn emit_jcc_rel32(buf: &mut CodeBuffer, cond: Condition) -> PatchSite {
    buf.emit(&[0x0F, 0x80 | cond as u8]);
    let at = buf.len();
    buf.emit_u32(0);
    PatchSite::Jump(SiteGeometry::new(at, EncodingForm::Rel32))
}

pub fn emit_jmp_rel8(buf: &mut CodeBuffer) -> PatchSite {
    buf.emit_u8(OP_JMP_REL8);
    let at = buf.len();
    buf.emit_u8(0);
    PatchSite::Jump(SiteGeometry::new(at, EncodingForm::Rel8))
}

/// Binds an unlinked jump to a label in the same buffer. The displacement is
/// relative on both ends, so no relocation is needed.
pub fn link_jump(buf: &mut CodeBuffer, site: PatchSite, label: Label) -> JitResult<()> {
    if buf.is_oom() {
        return Ok(());
    }
    let encoder = X86_64Encoder;
    encoder.relink(buf.code_mut(), 0, &site, label.offset())?;
    Ok(())
}

pub fn emit_jmp_to(buf: &mut CodeBuffer, target: BranchTarget) -> PatchSite {
    let site = emit_jmp_rel32(buf);
    buf.record_near_branch(site.offset(), target);
    site
}

pub fn emit_near_call(buf: &mut CodeBuffer, target: BranchTarget) -> PatchSite {
    buf.emit_u8(OP_CALL_REL32);
    let at = buf.len();
    buf.emit_u32(0);
    buf.record_near_branch(at, target);
    PatchSite::NearCall(SiteGeometry::new(at, EncodingForm::Rel32))
}

pub fn emit_far_call(buf: &mut CodeBuffer, target: usize) -> PatchSite {
    buf.emit(&[0x49, 0xBB]);
    let at = buf.len();
    buf.emit_u64(target as u64);
    buf.emit(&[0x41, 0xFF, 0xD3]);
    PatchSite::Call(SiteGeometry::new(at, EncodingForm::Imm64))
}

pub fn emit_mov_imm32(buf: &mut CodeBuffer, dst: Reg, value: i32) -> PatchSite {
    buf.emit_u8(0xB8 + dst as u8);
    let at = buf.len();
    buf.emit_u32(value as u32);
    PatchSite::DataLabel32(SiteGeometry::new(at, EncodingForm::Imm32))
}

pub fn emit_add_eax_imm32(buf: &mut CodeBuffer, value: i32) -> PatchSite {
    buf.emit_u8(0x05);
    let at = buf.len();
    buf.emit_u32(value as u32);
    PatchSite::DataLabel32(SiteGeometry::new(at, EncodingForm::Imm32))
}

pub fn emit_mov_imm64(buf: &mut CodeBuffer, dst: Reg, value: u64) -> PatchSite {
    buf.emit(&[REX_W, 0xB8 + dst as u8]);
    let at = buf.len();
    buf.emit_u64(value);
    PatchSite::PointerLabel(SiteGeometry::new(at, EncodingForm::Imm64))
}

/// Loads the absolute address of `label`, fixed up when the buffer is finalized.
pub fn emit_mov_label_address(buf: &mut CodeBuffer, dst: Reg, label: Label) -> PatchSite {
    let site = emit_mov_imm64(buf, dst, label.offset() as u64);
    buf.record_absolute_pointer(site.offset());
    site
}

/// `mov dst, [base + disp32]`, patchable into `lea dst, [base + disp32]`.
pub fn emit_load_ptr(buf: &mut CodeBuffer, dst: Reg, base: Reg, disp: i32) -> PatchSite {
    let at = buf.len();
    let modrm = 0b10_000_000 | ((dst as u8) << 3) | base as u8;
    buf.emit(&[REX_W, OP_MOV_R64_RM, modrm]);
    if base == Reg::Rsp {
        buf.emit_u8(0x24);
    }
    buf.emit_u32(disp as u32);
    PatchSite::Instruction(SiteGeometry::new(at, EncodingForm::RexLoadOrLea))
}

pub fn emit_ret(buf: &mut CodeBuffer) {
    buf.emit_u8(OP_RET);
}

pub fn emit_nop(buf: &mut CodeBuffer) {
    buf.emit_u8(0x90);
}
