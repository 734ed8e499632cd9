use std::ops::Range;

use super::{Arch, InstructionEncoder, displacement, read_u32, write_u32};
use crate::buffer::{BranchTarget, CodeBuffer, PoolValue};
use crate::error::{JitError, JitResult};
use crate::site::{EncodingForm, Label, PatchSite, SiteGeometry};

pub const INVALID_BRANCH_TARGET: u32 = 0xffff_ffff;

const COND_AL: u32 = 0xE000_0000;
const COND_MASK: u32 = 0xF000_0000;
const LDR_PC_REL: u32 = 0x051F_0000;
const LDR_PC_REL_MASK: u32 = 0x0F7F_0000;
const DT_UP: u32 = 1 << 23;
const IMM12_MASK: u32 = 0xFFF;
const B: u32 = 0x0A00_0000;
const BL: u32 = 0x0B00_0000;
const BRANCH_MASK: u32 = 0x0E00_0000;
const BRANCH_OFFSET_MASK: u32 = 0x00FF_FFFF;
const BKPT: u32 = 0xE120_0070;
const BLX_IP: u32 = 0xE12F_FF3C;
const BX_LR: u32 = 0xE12F_FF1E;
const LOAD_IMM: u32 = 0x0590_0000;
const ADD_IMM: u32 = 0x0280_0000;
const LOAD_OR_ADD_MASK: u32 = 0x0FF0_0F00;
const LOAD_OR_ADD_KEEP: u32 = 0xF00F_F0FF;

/// The PC reads two instructions ahead of the one executing.
const PC_BIAS: usize = 8;
const BRANCH_WORDS_MIN: i128 = -(1 << 23);
const BRANCH_WORDS_MAX: i128 = (1 << 23) - 1;

const PADDING: [u8; 4] = BKPT.to_le_bytes();

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArmEncoder {
    /// Rewrite `ldr pc` jumps into `b` when the final target is in range.
    pub branch_shortening: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    Ip = 12,
    Sp = 13,
    Lr = 14,
    Pc = 15,
}

fn is_pool_load(insn: u32) -> bool {
    insn & LDR_PC_REL_MASK == LDR_PC_REL
}

fn is_branch(insn: u32) -> bool {
    insn & BRANCH_MASK == B
}

fn pool_load_template(rd: Reg) -> u32 {
    COND_AL | LDR_PC_REL | DT_UP | ((rd as u32) << 12)
}

fn encode_branch(template: u32, at: usize, target: usize) -> Option<u32> {
    let diff = displacement(at + PC_BIAS, target);
    if diff % 4 != 0 {
        return None;
    }
    let words = diff / 4;
    if !(BRANCH_WORDS_MIN..=BRANCH_WORDS_MAX).contains(&words) {
        return None;
    }
    Some((template & !BRANCH_OFFSET_MASK) | (words as i32 as u32 & BRANCH_OFFSET_MASK))
}

fn decode_branch(at: usize, insn: u32) -> JitResult<usize> {
    let words = ((insn << 8) as i32) >> 8;
    let target = (at + PC_BIAS) as i128 + (words as i128) * 4;
    usize::try_from(target).map_err(|_| JitError::DisplacementOutOfRange {
        at,
        target: 0,
        form: "b/bl",
    })
}

fn pool_word(at: usize, value: usize) -> JitResult<u32> {
    u32::try_from(value).map_err(|_| JitError::DisplacementOutOfRange {
        at,
        target: value,
        form: "pool word",
    })
}

fn unsupported_form(site: &PatchSite) -> JitError {
    JitError::Unsupported(match site.form() {
        EncodingForm::ArmBranch24 => "branch site used as a literal",
        EncodingForm::ArmLoadOrAdd => "instruction site used as a value",
        EncodingForm::ArmPoolLoad => "pool load used as an instruction swap",
        _ => "x86_64 site on an arm encoder",
    })
}

impl ArmEncoder {
    pub fn with_branch_shortening() -> Self {
        Self {
            branch_shortening: true,
        }
    }

    fn pool_load_at(&self, code: &[u8], at: usize) -> JitResult<u32> {
        let insn = read_u32(code, at)?;
        if !is_pool_load(insn) {
            return Err(JitError::UnexpectedInstruction {
                at,
                expected: "ldr [pc, #imm]",
                found: insn,
            });
        }
        Ok(insn)
    }

    fn slot_of(&self, code: &[u8], site: &PatchSite) -> JitResult<usize> {
        if site.form() != EncodingForm::ArmPoolLoad {
            return Err(unsupported_form(site));
        }
        site.check_bounds(code.len())?;
        let slot = self.pool_slot_of_load(code, site.offset())?;
        if slot + 4 > code.len() {
            return Err(JitError::InvalidSite {
                offset: slot,
                len: 4,
                region_size: code.len(),
            });
        }
        Ok(slot)
    }

    fn swap_load_form(
        &self,
        code: &mut [u8],
        site: &PatchSite,
        from: u32,
        to: u32,
    ) -> JitResult<Range<usize>> {
        if site.form() != EncodingForm::ArmLoadOrAdd {
            return Err(unsupported_form(site));
        }
        site.check_bounds(code.len())?;
        let at = site.offset();
        let insn = read_u32(code, at)?;
        let form = insn & LOAD_OR_ADD_MASK;
        if form != from && form != to {
            return Err(JitError::UnexpectedInstruction {
                at,
                expected: "ldr/add with imm8",
                found: insn,
            });
        }
        write_u32(code, at, (insn & LOAD_OR_ADD_KEEP) | to)
    }
}

impl InstructionEncoder for ArmEncoder {
    fn arch(&self) -> Arch {
        Arch::Arm
    }

    fn pointer_width(&self) -> usize {
        4
    }

    fn code_alignment(&self) -> usize {
        8
    }

    fn padding(&self) -> &'static [u8] {
        &PADDING
    }

    fn supports_constant_pool(&self) -> bool {
        true
    }

    fn resolve_near_branch(
        &self,
        code: &mut [u8],
        base: usize,
        at: usize,
        target: usize,
    ) -> JitResult<()> {
        let insn = read_u32(code, at)?;
        if !is_branch(insn) {
            return Err(JitError::UnexpectedInstruction {
                at,
                expected: "b/bl",
                found: insn,
            });
        }
        let encoded = encode_branch(insn, base + at, target).ok_or(
            JitError::DisplacementOutOfRange {
                at: base + at,
                target,
                form: "b/bl",
            },
        )?;
        write_u32(code, at, encoded)?;
        Ok(())
    }

    fn pool_slot_of_load(&self, code: &[u8], at: usize) -> JitResult<usize> {
        let insn = self.pool_load_at(code, at)?;
        let imm = (insn & IMM12_MASK) as usize;
        let pc = at + PC_BIAS;
        if insn & DT_UP != 0 {
            Ok(pc + imm)
        } else {
            pc.checked_sub(imm).ok_or(JitError::InvalidSite {
                offset: at,
                len: 4,
                region_size: code.len(),
            })
        }
    }

    fn bind_pool_load(&self, code: &mut [u8], load_at: usize, slot_at: usize) -> JitResult<()> {
        let insn = self.pool_load_at(code, load_at)?;
        let disp = displacement(load_at + PC_BIAS, slot_at);
        let magnitude = disp.unsigned_abs();
        if magnitude > IMM12_MASK as u128 {
            return Err(JitError::DisplacementOutOfRange {
                at: load_at,
                target: slot_at,
                form: "ldr imm12",
            });
        }
        let up = if disp >= 0 { DT_UP } else { 0 };
        let rewritten = (insn & !(DT_UP | IMM12_MASK)) | up | magnitude as u32;
        write_u32(code, load_at, rewritten)?;
        Ok(())
    }

    fn pool_guard_branch(&self, from: usize, to: usize) -> JitResult<u32> {
        encode_branch(COND_AL | B, from, to).ok_or(JitError::DisplacementOutOfRange {
            at: from,
            target: to,
            form: "b",
        })
    }

    fn shorten_pool_branch(
        &self,
        code: &mut [u8],
        base: usize,
        at: usize,
        target: usize,
    ) -> JitResult<bool> {
        if !self.branch_shortening {
            return Ok(false);
        }
        let insn = self.pool_load_at(code, at)?;
        if (insn >> 12) & 0xF != Reg::Pc as u32 {
            return Ok(false);
        }
        match encode_branch((insn & COND_MASK) | B, base + at, target) {
            Some(branch) => {
                write_u32(code, at, branch)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn can_relink(&self, code: &[u8], base: usize, site: &PatchSite, target: usize) -> bool {
        if site.check_bounds(code.len()).is_err() {
            return false;
        }
        let Ok(insn) = read_u32(code, site.offset()) else {
            return false;
        };
        match site.form() {
            EncodingForm::ArmPoolLoad if is_pool_load(insn) => {
                self.slot_of(code, site).is_ok() && u32::try_from(target).is_ok()
            }
            EncodingForm::ArmPoolLoad | EncodingForm::ArmBranch24 if is_branch(insn) => {
                encode_branch(insn, base + site.offset(), target).is_some()
            }
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
        let insn = read_u32(code, at)?;
        match site.form() {
            EncodingForm::ArmPoolLoad if is_pool_load(insn) => {
                let slot = self.slot_of(code, site)?;
                write_u32(code, slot, pool_word(base + at, target)?)
            }
            EncodingForm::ArmPoolLoad | EncodingForm::ArmBranch24 if is_branch(insn) => {
                let encoded = encode_branch(insn, base + at, target).ok_or(
                    JitError::DisplacementOutOfRange {
                        at: base + at,
                        target,
                        form: "b/bl",
                    },
                )?;
                write_u32(code, at, encoded)
            }
            EncodingForm::ArmPoolLoad | EncodingForm::ArmBranch24 => {
                Err(JitError::UnexpectedInstruction {
                    at,
                    expected: "ldr [pc, #imm] or b/bl",
                    found: insn,
                })
            }
            _ => Err(unsupported_form(site)),
        }
    }

    fn read_target(&self, code: &[u8], base: usize, site: &PatchSite) -> JitResult<usize> {
        site.check_bounds(code.len())?;
        let at = site.offset();
        let insn = read_u32(code, at)?;
        match site.form() {
            EncodingForm::ArmPoolLoad if is_pool_load(insn) => {
                Ok(read_u32(code, self.slot_of(code, site)?)? as usize)
            }
            EncodingForm::ArmPoolLoad | EncodingForm::ArmBranch24 if is_branch(insn) => {
                decode_branch(base + at, insn)
            }
            EncodingForm::ArmPoolLoad | EncodingForm::ArmBranch24 => {
                Err(JitError::UnexpectedInstruction {
                    at,
                    expected: "ldr [pc, #imm] or b/bl",
                    found: insn,
                })
            }
            _ => Err(unsupported_form(site)),
        }
    }

    fn patch_int32(
        &self,
        code: &mut [u8],
        site: &PatchSite,
        value: i32,
    ) -> JitResult<Range<usize>> {
        let slot = self.slot_of(code, site)?;
        write_u32(code, slot, value as u32)
    }

    fn read_int32(&self, code: &[u8], site: &PatchSite) -> JitResult<i32> {
        let slot = self.slot_of(code, site)?;
        Ok(read_u32(code, slot)? as i32)
    }

    fn patch_pointer(
        &self,
        code: &mut [u8],
        site: &PatchSite,
        value: usize,
    ) -> JitResult<Range<usize>> {
        let slot = self.slot_of(code, site)?;
        write_u32(code, slot, pool_word(site.offset(), value)?)
    }

    fn read_pointer(&self, code: &[u8], site: &PatchSite) -> JitResult<usize> {
        let slot = self.slot_of(code, site)?;
        Ok(read_u32(code, slot)? as usize)
    }

    fn load_to_lea(&self, code: &mut [u8], site: &PatchSite) -> JitResult<Range<usize>> {
        self.swap_load_form(code, site, LOAD_IMM, ADD_IMM)
    }

    fn lea_to_load(&self, code: &mut [u8], site: &PatchSite) -> JitResult<Range<usize>> {
        self.swap_load_form(code, site, ADD_IMM, LOAD_IMM)
    }

    fn call_site_for_return(&self, return_offset: usize, near: bool) -> JitResult<PatchSite> {
        // bl, or ldr ip + blx ip
        let back = if near { 4 } else { 8 };
        let offset = return_offset
            .checked_sub(back)
            .ok_or(JitError::InvalidSite {
                offset: return_offset,
                len: back,
                region_size: return_offset,
            })?;
        Ok(if near {
            PatchSite::NearCall(SiteGeometry::new(offset, EncodingForm::ArmBranch24))
        } else {
            PatchSite::Call(SiteGeometry::new(offset, EncodingForm::ArmPoolLoad))
        })
    }
}

fn pool_load_site(buf: &mut CodeBuffer, rd: Reg, value: PoolValue, branch_form: bool) -> SiteGeometry {
    let at = buf.put_pool_load(pool_load_template(rd), value, branch_form);
    SiteGeometry::new(at, EncodingForm::ArmPoolLoad)
}

/// `ldr pc, [pc, #slot]` with an invalid target until linked or relinked.
pub fn emit_jump(buf: &mut CodeBuffer) -> PatchSite {
    let site = pool_load_site(buf, Reg::Pc, PoolValue::Word(INVALID_BRANCH_TARGET), true);
    PatchSite::Jump(site)
}

pub fn emit_jump_to(buf: &mut CodeBuffer, target: BranchTarget) -> JitResult<PatchSite> {
    let value = match target {
        BranchTarget::Label(label) => PoolValue::Label(label),
        BranchTarget::Absolute(address) => PoolValue::Word(pool_word(buf.len(), address)?),
    };
    Ok(PatchSite::Jump(pool_load_site(buf, Reg::Pc, value, true)))
}

pub fn link_jump(buf: &mut CodeBuffer, site: PatchSite, label: Label) -> JitResult<()> {
    buf.set_pool_value(site.offset(), PoolValue::Label(label))
}

/// `b` to itself until linked.
pub fn emit_branch(buf: &mut CodeBuffer) -> PatchSite {
    buf.ensure_space(4);
    let at = buf.len();
    buf.emit_u32(COND_AL | B | 0x00FF_FFFE);
    PatchSite::Jump(SiteGeometry::new(at, EncodingForm::ArmBranch24))
}

pub fn link_branch(buf: &mut CodeBuffer, site: PatchSite, label: Label) -> JitResult<()> {
    if buf.is_oom() {
        return Ok(());
    }
    ArmEncoder::default().resolve_near_branch(buf.code_mut(), 0, site.offset(), label.offset())
}

pub fn emit_near_call(buf: &mut CodeBuffer, target: BranchTarget) -> PatchSite {
    buf.ensure_space(4);
    let at = buf.len();
    buf.emit_u32(COND_AL | BL | 0x00FF_FFFE);
    buf.record_near_branch(at, target);
    PatchSite::NearCall(SiteGeometry::new(at, EncodingForm::ArmBranch24))
}

/// `ldr ip, [pc, #slot]; blx ip`
pub fn emit_far_call(buf: &mut CodeBuffer, target: u32) -> PatchSite {
    buf.ensure_space(8);
    let site = pool_load_site(buf, Reg::Ip, PoolValue::Word(target), false);
    buf.emit_u32(BLX_IP);
    PatchSite::Call(site)
}

pub fn emit_load_imm32(buf: &mut CodeBuffer, rd: Reg, value: i32) -> PatchSite {
    PatchSite::DataLabel32(pool_load_site(buf, rd, PoolValue::Word(value as u32), false))
}

pub fn emit_load_pointer(buf: &mut CodeBuffer, rd: Reg, value: u32) -> PatchSite {
    PatchSite::PointerLabel(pool_load_site(buf, rd, PoolValue::Word(value), false))
}

pub fn emit_load_label_address(buf: &mut CodeBuffer, rd: Reg, label: Label) -> PatchSite {
    PatchSite::PointerLabel(pool_load_site(buf, rd, PoolValue::Label(label), false))
}

/// `ldr rd, [rn, #imm]`, patchable into `add rd, rn, #imm`.
pub fn emit_load_word(buf: &mut CodeBuffer, rd: Reg, rn: Reg, imm: u8) -> PatchSite {
    buf.ensure_space(4);
    let at = buf.len();
    buf.emit_u32(COND_AL | LOAD_IMM | ((rn as u32) << 16) | ((rd as u32) << 12) | imm as u32);
    PatchSite::Instruction(SiteGeometry::new(at, EncodingForm::ArmLoadOrAdd))
}

pub fn emit_bx_lr(buf: &mut CodeBuffer) {
    buf.ensure_space(4);
    buf.emit_u32(BX_LR);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(code: &[u8], at: usize) -> u32 {
        read_u32(code, at).expect("word")
    }

    #[test]
    fn bind_forward_load_sets_up_bit() {
        let encoder = ArmEncoder::default();
        let mut code = [0u8; 32];
        write_u32(&mut code, 0, pool_load_template(Reg::R0) | (3 << 1)).expect("write");
        encoder.bind_pool_load(&mut code, 0, 24).expect("bind");
        assert_eq!(word(&code, 0), 0xE59F_0010);
        assert_eq!(encoder.pool_slot_of_load(&code, 0), Ok(24));
    }

    #[test]
    fn bind_adjacent_slot_uses_down_offset() {
        let encoder = ArmEncoder::default();
        let mut code = [0u8; 8];
        write_u32(&mut code, 0, pool_load_template(Reg::R1)).expect("write");
        encoder.bind_pool_load(&mut code, 0, 4).expect("bind");
        let insn = word(&code, 0);
        assert_eq!(insn & DT_UP, 0);
        assert_eq!(insn & IMM12_MASK, 4);
        assert_eq!(encoder.pool_slot_of_load(&code, 0), Ok(4));
    }

    #[test]
    fn bind_rejects_far_slot() {
        let encoder = ArmEncoder::default();
        let mut code = [0u8; 4];
        write_u32(&mut code, 0, pool_load_template(Reg::R0)).expect("write");
        assert!(encoder.bind_pool_load(&mut code, 0, 8 + 0xfff).is_ok());
        assert!(matches!(
            encoder.bind_pool_load(&mut code, 0, 8 + 0x1000),
            Err(JitError::DisplacementOutOfRange { .. })
        ));
    }

    #[test]
    fn branch_range_is_24_bit_words() {
        let encoder = ArmEncoder::default();
        let mut code = [0u8; 4];
        write_u32(&mut code, 0, COND_AL | BL).expect("write");
        let site = PatchSite::NearCall(SiteGeometry::new(0, EncodingForm::ArmBranch24));
        let base = 0x0400_0000;
        let pc = base + PC_BIAS;
        assert!(encoder.can_relink(&code, base, &site, pc + ((1 << 23) - 1) * 4));
        assert!(!encoder.can_relink(&code, base, &site, pc + (1 << 23) * 4));
        assert!(encoder.can_relink(&code, base, &site, pc - (1 << 23) * 4));
        assert!(!encoder.can_relink(&code, base, &site, pc - (1 << 23) * 4 - 4));
        assert!(!encoder.can_relink(&code, base, &site, pc + 2));
        encoder.relink(&mut code, base, &site, pc - 16).expect("relink");
        assert_eq!(word(&code, 0), COND_AL | BL | 0x00FF_FFFC);
        assert_eq!(encoder.read_target(&code, base, &site), Ok(pc - 16));
    }

    #[test]
    fn load_add_swap_keeps_registers_and_offset() {
        let encoder = ArmEncoder::default();
        let mut buf = CodeBuffer::new(std::sync::Arc::new(encoder));
        let site = emit_load_word(&mut buf, Reg::R0, Reg::R1, 0x24);
        let load = word(buf.code(), 0);
        encoder.load_to_lea(buf.code_mut(), &site).expect("lea");
        assert_eq!(word(buf.code(), 0), 0xE281_0024);
        encoder.lea_to_load(buf.code_mut(), &site).expect("load");
        assert_eq!(word(buf.code(), 0), load);
    }

    #[test]
    fn shortening_only_when_enabled_and_in_range() {
        let mut code = [0u8; 4];
        write_u32(&mut code, 0, pool_load_template(Reg::Pc)).expect("write");
        assert_eq!(
            ArmEncoder::default().shorten_pool_branch(&mut code, 0x1000, 0, 0x2000),
            Ok(false)
        );
        let shortening = ArmEncoder::with_branch_shortening();
        assert_eq!(
            shortening.shorten_pool_branch(&mut code, 0x1000, 0, 0x1000 + 8 + 4 * (1 << 23)),
            Ok(false)
        );
        assert_eq!(
            shortening.shorten_pool_branch(&mut code, 0x1000, 0, 0x2000),
            Ok(true)
        );
        assert_eq!(word(&code, 0), COND_AL | B | ((0x2000 - 0x1008) / 4));
    }

    #[test]
    fn far_call_site_recovered_from_return_address() {
        let encoder = ArmEncoder::default();
        assert_eq!(
            encoder.call_site_for_return(24, false),
            Ok(PatchSite::Call(SiteGeometry::new(16, EncodingForm::ArmPoolLoad)))
        );
        assert_eq!(
            encoder.call_site_for_return(24, true),
            Ok(PatchSite::NearCall(SiteGeometry::new(20, EncodingForm::ArmBranch24)))
        );
    }
}
