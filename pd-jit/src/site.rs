use std::ops::Range;

use serde::Serialize;

use crate::error::{JitError, JitResult};

/// Buffer-relative position of an emitted instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label(pub(crate) usize);

impl Label {
    pub fn at(offset: usize) -> Self {
        Self(offset)
    }

    pub fn offset(self) -> usize {
        self.0
    }
}

/// Absolute address immediately following a call instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReturnAddress(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SiteKind {
    Jump,
    Call,
    NearCall,
    DataLabel32,
    PointerLabel,
    Instruction,
}

/// How the editable bytes of a site are encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EncodingForm {
    /// x86 32-bit displacement, relative to the end of the field.
    Rel32,
    /// x86 8-bit displacement, relative to the end of the field.
    Rel8,
    /// x86 32-bit immediate.
    Imm32,
    /// x86 64-bit immediate (`mov r64, imm64`).
    Imm64,
    /// x86 `REX.W 8B` load or `REX.W 8D` lea; the offset names the REX prefix.
    RexLoadOrLea,
    /// ARM `ldr rd, [pc, #imm12]`; the value lives in the literal pool word.
    ArmPoolLoad,
    /// ARM `b`/`bl` with a signed 24-bit word offset.
    ArmBranch24,
    /// ARM `ldr rd, [rn, #imm8]` or `add rd, rn, #imm8`.
    ArmLoadOrAdd,
}

impl EncodingForm {
    pub fn width(self) -> usize {
        match self {
            EncodingForm::Rel32 | EncodingForm::Imm32 => 4,
            EncodingForm::Rel8 => 1,
            EncodingForm::Imm64 => 8,
            EncodingForm::RexLoadOrLea => 2,
            EncodingForm::ArmPoolLoad | EncodingForm::ArmBranch24 | EncodingForm::ArmLoadOrAdd => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SiteGeometry {
    pub offset: usize,
    pub form: EncodingForm,
}

impl SiteGeometry {
    pub fn new(offset: usize, form: EncodingForm) -> Self {
        Self { offset, form }
    }

    pub fn width(&self) -> usize {
        self.form.width()
    }

    pub fn bytes(&self) -> Range<usize> {
        self.offset..self.offset + self.width()
    }
}

/// A stable handle to one editable location in generated code.
///
/// Offsets are relative to the start of the code they were emitted into, so a
/// site stays valid when the code is copied into its final region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PatchSite {
    Jump(SiteGeometry),
    Call(SiteGeometry),
    NearCall(SiteGeometry),
    DataLabel32(SiteGeometry),
    PointerLabel(SiteGeometry),
    Instruction(SiteGeometry),
}

impl PatchSite {
    pub fn kind(&self) -> SiteKind {
        match self {
            PatchSite::Jump(_) => SiteKind::Jump,
            PatchSite::Call(_) => SiteKind::Call,
            PatchSite::NearCall(_) => SiteKind::NearCall,
            PatchSite::DataLabel32(_) => SiteKind::DataLabel32,
            PatchSite::PointerLabel(_) => SiteKind::PointerLabel,
            PatchSite::Instruction(_) => SiteKind::Instruction,
        }
    }

    pub fn geometry(&self) -> SiteGeometry {
        match *self {
            PatchSite::Jump(g)
            | PatchSite::Call(g)
            | PatchSite::NearCall(g)
            | PatchSite::DataLabel32(g)
            | PatchSite::PointerLabel(g)
            | PatchSite::Instruction(g) => g,
        }
    }

    pub fn offset(&self) -> usize {
        self.geometry().offset
    }

    pub fn form(&self) -> EncodingForm {
        self.geometry().form
    }

    pub fn expect_kind(&self, expected: SiteKind) -> JitResult<()> {
        let found = self.kind();
        if found != expected {
            return Err(JitError::WrongSiteKind { expected, found });
        }
        Ok(())
    }

    pub fn check_bounds(&self, code_len: usize) -> JitResult<()> {
        let bytes = self.geometry().bytes();
        if bytes.end > code_len {
            return Err(JitError::InvalidSite {
                offset: bytes.start,
                len: bytes.len(),
                region_size: code_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mismatch_is_reported() {
        let site = PatchSite::NearCall(SiteGeometry::new(4, EncodingForm::Rel32));
        assert_eq!(
            site.expect_kind(SiteKind::Jump),
            Err(JitError::WrongSiteKind {
                expected: SiteKind::Jump,
                found: SiteKind::NearCall,
            })
        );
        assert!(site.expect_kind(SiteKind::NearCall).is_ok());
    }

    #[test]
    fn bounds_cover_whole_field() {
        let site = PatchSite::PointerLabel(SiteGeometry::new(2, EncodingForm::Imm64));
        assert!(site.check_bounds(10).is_ok());
        assert!(matches!(
            site.check_bounds(9),
            Err(JitError::InvalidSite { offset: 2, len: 8, region_size: 9 })
        ));
    }
}
