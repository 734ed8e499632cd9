use std::mem;
use std::sync::Arc;

use tracing::debug;

use crate::encoder::arm::INVALID_BRANCH_TARGET;
use crate::encoder::{InstructionEncoder, read_u32, read_u64, write_u32, write_u64};
use crate::error::{JitError, JitResult};
use crate::logging::Category;
use crate::site::Label;

/// Pending pool loads encode `index << 1` in a 12-bit field.
pub const MAX_POOL_ENTRIES: usize = 256;
const MAX_POOL_DISTANCE: usize = 0xfff;
/// Guard branch plus alignment padding in front of a flushed pool.
const POOL_GUARD_MARGIN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchTarget {
    Label(Label),
    Absolute(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationKind {
    /// pc-relative branch or call; the displacement depends on the final base.
    NearBranch(BranchTarget),
    /// Literal pool load whose pool word holds a buffer offset. A branch-form
    /// load may be rewritten as a direct branch once its target is known.
    LiteralPoolLoad { branch_form: bool },
    /// Pointer-width field holding a buffer offset, rebased at finalize.
    AbsolutePointer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub kind: RelocationKind,
}

/// Value of a literal pool word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolValue {
    /// Used as is.
    Word(u32),
    /// Address of a label in this buffer, known at finalize.
    Label(Label),
    /// Invalid target sentinel, left in place unless linked later.
    Unlinked,
}

#[derive(Clone, Copy, Debug)]
struct PoolEntry {
    load_offset: usize,
    value: PoolValue,
    deferred: bool,
    branch_form: bool,
}

impl PoolEntry {
    fn word(&self) -> u32 {
        match self.value {
            PoolValue::Word(word) => word,
            PoolValue::Label(label) => label.offset() as u32,
            PoolValue::Unlinked => INVALID_BRANCH_TARGET,
        }
    }

    fn is_deferred(&self) -> bool {
        self.deferred || !matches!(self.value, PoolValue::Word(_))
    }
}

/// Code fixed up for the address it will be copied to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedCode {
    pub base: usize,
    pub code: Vec<u8>,
    pub relocations_resolved: usize,
    pub sentinels_skipped: usize,
    pub branches_shortened: usize,
}

impl FinalizedCode {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn address_of(&self, label: Label) -> usize {
        self.base + label.offset()
    }
}

/// Growable buffer of emitted machine code plus the deferred relocations and
/// literal pool entries that can only be settled once the final address is
/// known.
pub struct CodeBuffer {
    encoder: Arc<dyn InstructionEncoder>,
    code: Vec<u8>,
    relocations: Vec<Relocation>,
    pool: Vec<PoolEntry>,
    limit: Option<usize>,
    oom: bool,
    finalized: bool,
}

impl std::fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("arch", &self.encoder.arch())
            .field("len", &self.code.len())
            .field("relocations", &self.relocations.len())
            .field("pending_pool", &self.pool.len())
            .field("oom", &self.oom)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl CodeBuffer {
    pub fn new(encoder: Arc<dyn InstructionEncoder>) -> Self {
        Self {
            encoder,
            code: Vec::new(),
            relocations: Vec::new(),
            pool: Vec::new(),
            limit: None,
            oom: false,
            finalized: false,
        }
    }

    /// A buffer that flags out-of-memory instead of growing past `limit` bytes.
    pub fn with_limit(encoder: Arc<dyn InstructionEncoder>, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(encoder)
        }
    }

    pub fn encoder(&self) -> &Arc<dyn InstructionEncoder> {
        &self.encoder
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn label(&self) -> Label {
        Label(self.code.len())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut [u8] {
        &mut self.code
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn pending_pool_entries(&self) -> usize {
        self.pool.len()
    }

    pub fn mark_oom(&mut self) {
        self.oom = true;
    }

    pub fn is_oom(&self) -> bool {
        self.oom
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        if self.oom || self.finalized {
            return;
        }
        let wanted = self.code.len() + bytes.len();
        if self.limit.is_some_and(|limit| wanted > limit)
            || self.code.try_reserve(bytes.len()).is_err()
        {
            self.oom = true;
            return;
        }
        self.code.extend_from_slice(bytes);
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.emit(&[value]);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    pub fn record_near_branch(&mut self, offset: usize, target: BranchTarget) {
        self.relocations.push(Relocation {
            offset,
            kind: RelocationKind::NearBranch(target),
        });
    }

    pub fn record_absolute_pointer(&mut self, offset: usize) {
        self.relocations.push(Relocation {
            offset,
            kind: RelocationKind::AbsolutePointer,
        });
    }

    /// Marks the pool load at `offset` as reading a buffer offset that must be
    /// rebased at finalize. `is_branch_form` loads feed the program counter
    /// and may be shortened into a direct branch.
    pub fn record_deferred_load(&mut self, offset: usize, is_branch_form: bool) -> JitResult<()> {
        self.require_constant_pool()?;
        if let Some(entry) = self.pending_entry(offset) {
            entry.deferred = true;
            entry.branch_form |= is_branch_form;
            return Ok(());
        }
        self.encoder.pool_slot_of_load(&self.code, offset)?;
        self.record_pool_load(offset, is_branch_form);
        Ok(())
    }

    fn require_constant_pool(&self) -> JitResult<()> {
        if self.encoder.supports_constant_pool() {
            Ok(())
        } else {
            Err(JitError::Unsupported("literal pool loads"))
        }
    }

    fn record_pool_load(&mut self, offset: usize, branch_form: bool) {
        let existing = self.relocations.iter().position(|reloc| {
            reloc.offset == offset && matches!(reloc.kind, RelocationKind::LiteralPoolLoad { .. })
        });
        match existing {
            Some(index) => {
                if let RelocationKind::LiteralPoolLoad { branch_form: form } =
                    &mut self.relocations[index].kind
                {
                    *form |= branch_form;
                }
            }
            None => self.relocations.push(Relocation {
                offset,
                kind: RelocationKind::LiteralPoolLoad { branch_form },
            }),
        }
    }

    fn pending_entry(&mut self, load_offset: usize) -> Option<&mut PoolEntry> {
        self.pool
            .iter_mut()
            .find(|entry| entry.load_offset == load_offset)
    }

    /// Emits a literal pool load whose pool word is placed at the next flush.
    /// Returns the offset of the load instruction.
    pub fn put_pool_load(&mut self, insn: u32, value: PoolValue, branch_form: bool) -> usize {
        self.ensure_space(4);
        let load_offset = self.code.len();
        let index = self.pool.len() as u32;
        self.emit_u32(insn | (index << 1));
        if !self.oom {
            self.pool.push(PoolEntry {
                load_offset,
                value,
                deferred: false,
                branch_form,
            });
        }
        load_offset
    }

    /// Replaces the word a pool load reads, whether or not the pool was flushed.
    pub fn set_pool_value(&mut self, load_offset: usize, value: PoolValue) -> JitResult<()> {
        if self.oom {
            return Ok(());
        }
        self.require_constant_pool()?;
        if let Some(entry) = self.pending_entry(load_offset) {
            entry.value = value;
            return Ok(());
        }
        let slot = self.encoder.pool_slot_of_load(&self.code, load_offset)?;
        let entry = PoolEntry {
            load_offset,
            value,
            deferred: false,
            branch_form: false,
        };
        write_u32(&mut self.code, slot, entry.word())?;
        if entry.is_deferred() {
            self.record_pool_load(load_offset, false);
        } else {
            self.relocations.retain(|reloc| {
                !(reloc.offset == load_offset
                    && matches!(reloc.kind, RelocationKind::LiteralPoolLoad { .. }))
            });
        }
        Ok(())
    }

    /// Flushes the pending pool first if emitting `bytes` more would leave
    /// the oldest pending load unable to reach its pool word.
    pub fn ensure_space(&mut self, bytes: usize) {
        let Some(first) = self.pool.first() else {
            return;
        };
        let pool_bytes = 4 * (self.pool.len() + 1);
        let reach = self.code.len() + bytes + pool_bytes + POOL_GUARD_MARGIN - first.load_offset;
        if self.pool.len() >= MAX_POOL_ENTRIES || reach > MAX_POOL_DISTANCE {
            debug!(
                "{} forcing constant pool flush of {} entries at offset {}",
                Category::Memory,
                self.pool.len(),
                self.code.len()
            );
            if let Err(err) = self.flush_constant_pool(true) {
                debug!("{} constant pool flush failed: {err}", Category::Memory);
                self.oom = true;
            }
        }
    }

    /// Places every pending pool word at the current position and points the
    /// pending loads at them. With `jump_over`, a branch skipping the pool is
    /// emitted first so execution can fall through.
    pub fn flush_constant_pool(&mut self, jump_over: bool) -> JitResult<()> {
        if self.pool.is_empty() {
            return Ok(());
        }
        self.require_constant_pool()?;
        let entries = mem::take(&mut self.pool);
        let guard_at = self.code.len();
        if jump_over {
            self.emit_u32(0);
        }
        self.pad_to(8);
        let mut slots = Vec::with_capacity(entries.len());
        for entry in &entries {
            slots.push(self.code.len());
            self.emit_u32(entry.word());
        }
        if self.oom {
            return Ok(());
        }
        for (entry, slot) in entries.iter().zip(slots) {
            self.encoder
                .bind_pool_load(&mut self.code, entry.load_offset, slot)?;
            if entry.is_deferred() {
                self.record_pool_load(entry.load_offset, entry.branch_form);
            }
        }
        if jump_over {
            let guard = self.encoder.pool_guard_branch(guard_at, self.code.len())?;
            write_u32(&mut self.code, guard_at, guard)?;
        }
        Ok(())
    }

    fn pad_to(&mut self, alignment: usize) {
        let padding = self.encoder.padding();
        while !self.oom && self.code.len() % alignment != 0 {
            self.emit(padding);
        }
    }

    /// Upper bound on the finalized size, used to reserve executable memory
    /// before the final address is known.
    pub fn size_for_copy(&self) -> usize {
        let alignment = self.encoder.code_alignment().max(8);
        self.code.len() + 4 * self.pool.len() + 2 * alignment
    }

    /// Settles every deferred relocation against `base` and hands the code
    /// over. The buffer is consumed by the first call, successful or not.
    pub fn finalize(&mut self, base: usize) -> JitResult<FinalizedCode> {
        if self.finalized {
            return Err(JitError::AlreadyFinalized);
        }
        let flushed = if self.oom {
            Ok(())
        } else {
            let alignment = self.encoder.code_alignment();
            self.flush_constant_pool(false)
                .map(|()| self.pad_to(alignment))
        };
        self.finalized = true;
        self.pool.clear();
        let mut code = mem::take(&mut self.code);
        let relocations = mem::take(&mut self.relocations);
        flushed?;
        if self.oom {
            return Err(JitError::OutOfMemory);
        }

        let mut finalized = FinalizedCode {
            base,
            code: Vec::new(),
            relocations_resolved: 0,
            sentinels_skipped: 0,
            branches_shortened: 0,
        };
        let mut shortenable = Vec::new();
        for reloc in &relocations {
            if reloc.offset >= code.len() {
                return Err(JitError::UnresolvedRelocation(reloc.offset));
            }
            match reloc.kind {
                RelocationKind::NearBranch(target) => {
                    let address = match target {
                        BranchTarget::Label(label) if label.offset() <= code.len() => {
                            base + label.offset()
                        }
                        BranchTarget::Label(_) => {
                            return Err(JitError::UnresolvedRelocation(reloc.offset));
                        }
                        BranchTarget::Absolute(address) => address,
                    };
                    self.encoder
                        .resolve_near_branch(&mut code, base, reloc.offset, address)?;
                    finalized.relocations_resolved += 1;
                }
                RelocationKind::LiteralPoolLoad { branch_form } => {
                    let slot = self.encoder.pool_slot_of_load(&code, reloc.offset)?;
                    match self.rebase_pointer(&mut code, base, slot)? {
                        Some(target) => {
                            finalized.relocations_resolved += 1;
                            if branch_form {
                                shortenable.push((reloc.offset, target));
                            }
                        }
                        None => finalized.sentinels_skipped += 1,
                    }
                }
                RelocationKind::AbsolutePointer => {
                    match self.rebase_pointer(&mut code, base, reloc.offset)? {
                        Some(_) => finalized.relocations_resolved += 1,
                        None => finalized.sentinels_skipped += 1,
                    }
                }
            }
        }
        for (at, target) in shortenable {
            if self
                .encoder
                .shorten_pool_branch(&mut code, base, at, target)?
            {
                finalized.branches_shortened += 1;
            }
        }
        debug!(
            "{} finalized {} bytes of {} code at 0x{base:x} ({} relocations, {} unlinked)",
            Category::Memory,
            code.len(),
            self.encoder.arch().name(),
            finalized.relocations_resolved,
            finalized.sentinels_skipped
        );
        finalized.code = code;
        Ok(finalized)
    }

    /// Rebases the buffer offset stored at `at`. Returns the absolute
    /// address written, or `None` when the field holds the sentinel.
    fn rebase_pointer(&self, code: &mut [u8], base: usize, at: usize) -> JitResult<Option<usize>> {
        let wide = self.encoder.pointer_width() == 8;
        let (value, sentinel) = if wide {
            (read_u64(code, at)?, u64::MAX)
        } else {
            (read_u32(code, at)? as u64, INVALID_BRANCH_TARGET as u64)
        };
        if value == sentinel {
            return Ok(None);
        }
        if value > code.len() as u64 {
            return Err(JitError::UnresolvedRelocation(at));
        }
        let address = base + value as usize;
        if wide {
            write_u64(code, at, address as u64)?;
        } else {
            let word = u32::try_from(address).map_err(|_| JitError::DisplacementOutOfRange {
                at,
                target: address,
                form: "pointer",
            })?;
            write_u32(code, at, word)?;
        }
        Ok(Some(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Arch;

    #[test]
    fn emission_past_limit_flags_oom() {
        let mut buf = CodeBuffer::with_limit(Arch::X86_64.encoder(), 4);
        buf.emit_u32(0x9090_9090);
        assert!(!buf.is_oom());
        buf.emit_u8(0xC3);
        assert!(buf.is_oom());
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.finalize(0x1000), Err(JitError::OutOfMemory));
        assert_eq!(buf.finalize(0x1000), Err(JitError::AlreadyFinalized));
    }

    #[test]
    fn finalize_pads_to_alignment() {
        let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
        buf.emit(&[0x90, 0x90, 0xC3]);
        let reserved = buf.size_for_copy();
        let finalized = buf.finalize(0x4000).expect("finalize");
        assert_eq!(finalized.code, vec![0x90, 0x90, 0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
        assert!(finalized.len() <= reserved);
        assert!(buf.is_finalized());
    }

    #[test]
    fn label_beyond_code_is_unresolved() {
        let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
        buf.emit(&[0xE8, 0, 0, 0, 0]);
        buf.record_near_branch(1, BranchTarget::Label(Label::at(64)));
        assert_eq!(buf.finalize(0), Err(JitError::UnresolvedRelocation(1)));
    }

    #[test]
    fn pool_relocations_rejected_without_pool_support() {
        let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
        buf.put_pool_load(0, PoolValue::Word(1), false);
        assert_eq!(
            buf.finalize(0),
            Err(JitError::Unsupported("literal pool loads"))
        );
    }
}
