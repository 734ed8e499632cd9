use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::encoder::InstructionEncoder;
use crate::error::{JitError, JitResult};
use crate::logging::Category;
use crate::memory::{ExecutableRegion, WriteGuard};
use crate::site::{PatchSite, ReturnAddress, SiteKind};

/// The sanctioned way to edit published code.
///
/// Creating a `RepatchBuffer` opens a write window on the region and holds the
/// region's patch lock; any number of edits may be batched inside it. The
/// region returns to executable when the buffer is finished or dropped, on
/// error paths included.
pub struct RepatchBuffer<'a> {
    guard: WriteGuard<'a>,
    encoder: Arc<dyn InstructionEncoder>,
    edits: usize,
}

impl<'a> RepatchBuffer<'a> {
    pub fn new(region: &'a ExecutableRegion) -> JitResult<Self> {
        let guard = region.make_writable()?;
        Ok(Self {
            encoder: Arc::clone(region.encoder()),
            guard,
            edits: 0,
        })
    }

    pub fn base(&self) -> usize {
        self.guard.base()
    }

    /// Number of edits applied so far.
    pub fn edits(&self) -> usize {
        self.edits
    }

    /// Whether `site` can reach `target` with its current encoding. Nothing is
    /// written either way.
    pub fn can_relink(&self, site: &PatchSite, target: usize) -> bool {
        self.encoder
            .can_relink(self.guard.code(), self.guard.base(), site, target)
    }

    pub fn relink_jump(&mut self, site: &PatchSite, target: usize) -> JitResult<()> {
        self.relink_checked(site, SiteKind::Jump, target)
    }

    pub fn relink_call(&mut self, site: &PatchSite, target: usize) -> JitResult<()> {
        self.relink_checked(site, SiteKind::Call, target)
    }

    pub fn relink_near_call(&mut self, site: &PatchSite, target: usize) -> JitResult<()> {
        self.relink_checked(site, SiteKind::NearCall, target)
    }

    pub fn repatch_int32(&mut self, site: &PatchSite, value: i32) -> JitResult<()> {
        site.expect_kind(SiteKind::DataLabel32)?;
        let touched = self.encoder.patch_int32(self.guard.code_mut(), site, value)?;
        self.commit("patched int32", touched);
        Ok(())
    }

    pub fn repatch_pointer(&mut self, site: &PatchSite, value: usize) -> JitResult<()> {
        site.expect_kind(SiteKind::PointerLabel)?;
        let touched = self
            .encoder
            .patch_pointer(self.guard.code_mut(), site, value)?;
        self.commit("patched pointer", touched);
        Ok(())
    }

    pub fn repatch_load_ptr_to_lea(&mut self, site: &PatchSite) -> JitResult<()> {
        site.expect_kind(SiteKind::Instruction)?;
        let touched = self.encoder.load_to_lea(self.guard.code_mut(), site)?;
        self.commit("converted load to lea", touched);
        Ok(())
    }

    pub fn repatch_lea_to_load_ptr(&mut self, site: &PatchSite) -> JitResult<()> {
        site.expect_kind(SiteKind::Instruction)?;
        let touched = self.encoder.lea_to_load(self.guard.code_mut(), site)?;
        self.commit("converted lea to load", touched);
        Ok(())
    }

    /// Relinks the far call that returns to `return_address`.
    pub fn relink_caller_to_trampoline(
        &mut self,
        return_address: ReturnAddress,
        target: usize,
    ) -> JitResult<()> {
        let site = self.caller_site(return_address, false)?;
        self.relink_checked(&site, SiteKind::Call, target)
    }

    /// Relinks the near call that returns to `return_address`.
    pub fn relink_near_caller_to_trampoline(
        &mut self,
        return_address: ReturnAddress,
        target: usize,
    ) -> JitResult<()> {
        let site = self.caller_site(return_address, true)?;
        self.relink_checked(&site, SiteKind::NearCall, target)
    }

    pub fn jump_target(&self, site: &PatchSite) -> JitResult<usize> {
        site.expect_kind(SiteKind::Jump)?;
        self.encoder
            .read_target(self.guard.code(), self.guard.base(), site)
    }

    pub fn call_target(&self, site: &PatchSite) -> JitResult<usize> {
        if site.kind() != SiteKind::NearCall {
            site.expect_kind(SiteKind::Call)?;
        }
        self.encoder
            .read_target(self.guard.code(), self.guard.base(), site)
    }

    pub fn read_int32(&self, site: &PatchSite) -> JitResult<i32> {
        site.expect_kind(SiteKind::DataLabel32)?;
        self.encoder.read_int32(self.guard.code(), site)
    }

    pub fn read_pointer(&self, site: &PatchSite) -> JitResult<usize> {
        site.expect_kind(SiteKind::PointerLabel)?;
        self.encoder.read_pointer(self.guard.code(), site)
    }

    /// Restores executable protection, reporting a failure the drop path
    /// could only log.
    pub fn finish(self) -> JitResult<()> {
        self.guard.make_executable()
    }

    fn caller_site(&self, return_address: ReturnAddress, near: bool) -> JitResult<PatchSite> {
        let code_len = self.guard.code().len();
        let offset = return_address
            .0
            .checked_sub(self.guard.base())
            .filter(|offset| *offset <= code_len)
            .ok_or(JitError::InvalidSite {
                offset: return_address.0,
                len: 0,
                region_size: code_len,
            })?;
        self.encoder.call_site_for_return(offset, near)
    }

    fn relink_checked(&mut self, site: &PatchSite, kind: SiteKind, target: usize) -> JitResult<()> {
        site.expect_kind(kind)?;
        site.check_bounds(self.guard.code().len())?;
        if !self.can_relink(site, target) {
            return Err(JitError::NotRelinkable {
                kind,
                site: self.guard.base() + site.offset(),
                target,
            });
        }
        let base = self.guard.base();
        let touched = self
            .encoder
            .relink(self.guard.code_mut(), base, site, target)?;
        self.commit("relinked", touched);
        Ok(())
    }

    fn commit(&mut self, what: &str, touched: Range<usize>) {
        self.guard.flush(touched.clone());
        self.edits += 1;
        debug!(
            "{} {what} at 0x{:x} ({} bytes)",
            Category::Patch,
            self.guard.base() + touched.start,
            touched.len()
        );
    }
}
