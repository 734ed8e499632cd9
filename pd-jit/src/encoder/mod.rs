use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{JitError, JitResult};
use crate::site::PatchSite;

pub mod arm;
pub mod x86_64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Arm,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
        }
    }

    /// The architecture generated code can actually run on in this process.
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "arm") {
            Some(Arch::Arm)
        } else {
            None
        }
    }

    pub fn encoder(self) -> Arc<dyn InstructionEncoder> {
        match self {
            Arch::X86_64 => Arc::new(x86_64::X86_64Encoder),
            Arch::Arm => Arc::new(arm::ArmEncoder::default()),
        }
    }
}

/// Architecture-specific bit packing for code fix-up and repatching.
///
/// Every method operates on a byte view of the code (`code[0]` lives at the
/// absolute address `base`) so the same logic serves a finalizing buffer and a
/// live region opened for writing. Edit methods return the byte range they
/// touched so the caller can synchronize the instruction cache.
pub trait InstructionEncoder: Send + Sync {
    fn arch(&self) -> Arch;

    fn pointer_width(&self) -> usize;

    /// Alignment finalized code is padded to.
    fn code_alignment(&self) -> usize;

    /// Filler used for alignment padding; traps if executed.
    fn padding(&self) -> &'static [u8];

    /// Whether the buffer may place literal pool words for this encoder.
    fn supports_constant_pool(&self) -> bool {
        false
    }

    /// Writes the final displacement of a pc-relative branch or call at `at`.
    fn resolve_near_branch(
        &self,
        code: &mut [u8],
        base: usize,
        at: usize,
        target: usize,
    ) -> JitResult<()>;

    /// Offset of the literal pool word read by the pool load at `at`.
    fn pool_slot_of_load(&self, _code: &[u8], _at: usize) -> JitResult<usize> {
        Err(JitError::Unsupported("literal pool loads"))
    }

    /// Points a pending pool load at its final pool word.
    fn bind_pool_load(&self, _code: &mut [u8], _load_at: usize, _slot_at: usize) -> JitResult<()> {
        Err(JitError::Unsupported("literal pool loads"))
    }

    /// Branch instruction word placed in front of a pool to skip over it.
    fn pool_guard_branch(&self, _from: usize, _to: usize) -> JitResult<u32> {
        Err(JitError::Unsupported("literal pool guards"))
    }

    /// Rewrites a branch-form pool load into a direct branch when the target
    /// is close enough. Returns false when the load must stay.
    fn shorten_pool_branch(
        &self,
        _code: &mut [u8],
        _base: usize,
        _at: usize,
        _target: usize,
    ) -> JitResult<bool> {
        Ok(false)
    }

    fn can_relink(&self, code: &[u8], base: usize, site: &PatchSite, target: usize) -> bool;

    fn relink(
        &self,
        code: &mut [u8],
        base: usize,
        site: &PatchSite,
        target: usize,
    ) -> JitResult<Range<usize>>;

    /// Decodes the absolute address a jump or call site currently reaches.
    fn read_target(&self, code: &[u8], base: usize, site: &PatchSite) -> JitResult<usize>;

    fn patch_int32(&self, code: &mut [u8], site: &PatchSite, value: i32)
    -> JitResult<Range<usize>>;

    fn read_int32(&self, code: &[u8], site: &PatchSite) -> JitResult<i32>;

    fn patch_pointer(
        &self,
        code: &mut [u8],
        site: &PatchSite,
        value: usize,
    ) -> JitResult<Range<usize>>;

    fn read_pointer(&self, code: &[u8], site: &PatchSite) -> JitResult<usize>;

    fn load_to_lea(&self, code: &mut [u8], site: &PatchSite) -> JitResult<Range<usize>>;

    fn lea_to_load(&self, code: &mut [u8], site: &PatchSite) -> JitResult<Range<usize>>;

    /// The call site whose return address is `return_offset`.
    fn call_site_for_return(&self, return_offset: usize, near: bool) -> JitResult<PatchSite>;
}

pub(crate) fn read_u32(code: &[u8], at: usize) -> JitResult<u32> {
    let bytes = field(code, at, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u32(code: &mut [u8], at: usize, value: u32) -> JitResult<Range<usize>> {
    field(code, at, 4)?;
    code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    Ok(at..at + 4)
}

pub(crate) fn read_u64(code: &[u8], at: usize) -> JitResult<u64> {
    let bytes = field(code, at, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

pub(crate) fn write_u64(code: &mut [u8], at: usize, value: u64) -> JitResult<Range<usize>> {
    field(code, at, 8)?;
    code[at..at + 8].copy_from_slice(&value.to_le_bytes());
    Ok(at..at + 8)
}

fn field(code: &[u8], at: usize, len: usize) -> JitResult<&[u8]> {
    code.get(at..at.saturating_add(len))
        .ok_or(JitError::InvalidSite {
            offset: at,
            len,
            region_size: code.len(),
        })
}

/// Signed distance from `from` to `to` in bytes.
pub(crate) fn displacement(from: usize, to: usize) -> i128 {
    to as i128 - from as i128
}

pub(crate) fn apply_displacement(from: usize, disp: i64) -> JitResult<usize> {
    let target = from as i128 + disp as i128;
    usize::try_from(target).map_err(|_| JitError::DisplacementOutOfRange {
        at: from,
        target: 0,
        form: "decoded",
    })
}
