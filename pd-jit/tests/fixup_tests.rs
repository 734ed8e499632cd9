mod common;

use std::sync::Arc;

use jit::encoder::arm::{self, ArmEncoder, INVALID_BRANCH_TARGET};
use jit::encoder::x86_64::{self, Condition, Reg};
use jit::{
    Arch, BranchTarget, CodeBuffer, InstructionEncoder, JitError, Label, PoolValue,
    RelocationKind,
};
use proptest::prelude::*;

use common::{qword, rel32, word};

#[test]
fn near_call_displacement_is_relative_to_final_base() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let body = Label::at(6);
    let call = x86_64::emit_near_call(&mut buf, BranchTarget::Label(body));
    x86_64::emit_ret(&mut buf);
    assert_eq!(buf.label(), body);
    x86_64::emit_mov_imm32(&mut buf, Reg::Rax, 3);
    x86_64::emit_ret(&mut buf);

    let finalized = buf.finalize(0x10_000).expect("finalize should succeed");
    assert_eq!(call.offset(), 1);
    assert_eq!(rel32(&finalized.code, 1), 1);
    assert_eq!(finalized.relocations_resolved, 1);
    assert_eq!(finalized.address_of(body), 0x10_006);
}

#[test]
fn near_call_to_absolute_target() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    x86_64::emit_nop(&mut buf);
    x86_64::emit_near_call(&mut buf, BranchTarget::Absolute(0x2000));
    let finalized = buf.finalize(0x1000).expect("finalize should succeed");
    // Field at 2, end of instruction at 0x1006.
    assert_eq!(rel32(&finalized.code, 2), 0x2000 - 0x1006);
}

#[test]
fn absolute_pointer_is_rebased() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let site = x86_64::emit_mov_label_address(&mut buf, Reg::Rcx, Label::at(10));
    x86_64::emit_ret(&mut buf);
    assert_eq!(
        buf.relocations()[0].kind,
        RelocationKind::AbsolutePointer
    );

    let finalized = buf.finalize(0x7000).expect("finalize should succeed");
    assert_eq!(qword(&finalized.code, site.offset()), 0x700A);
    assert_eq!(finalized.relocations_resolved, 1);
}

#[test]
fn pointer_sentinel_is_left_alone() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let site = x86_64::emit_mov_imm64(&mut buf, Reg::Rax, u64::MAX);
    buf.record_absolute_pointer(site.offset());
    x86_64::emit_ret(&mut buf);

    let finalized = buf.finalize(0x7000).expect("finalize should succeed");
    assert_eq!(qword(&finalized.code, site.offset()), u64::MAX);
    assert_eq!(finalized.sentinels_skipped, 1);
    assert_eq!(finalized.relocations_resolved, 0);
}

#[test]
fn linked_jump_needs_no_relocation() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let exit = x86_64::emit_jmp_rel32(&mut buf);
    x86_64::emit_nop(&mut buf);
    let done = buf.label();
    x86_64::emit_ret(&mut buf);
    x86_64::link_jump(&mut buf, exit, done).expect("link should succeed");
    assert!(buf.relocations().is_empty());

    let finalized = buf.finalize(0x9000).expect("finalize should succeed");
    assert_eq!(finalized.code[0], 0xE9);
    assert_eq!(rel32(&finalized.code, 1), 1);
}

#[test]
fn conditional_jump_links_and_relinks() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let branch = x86_64::emit_jcc_rel32(&mut buf, Condition::NotEqual);
    x86_64::emit_ret(&mut buf);
    let taken = buf.label();
    x86_64::emit_ret(&mut buf);
    x86_64::link_jump(&mut buf, branch, taken).expect("link should succeed");

    let mut finalized = buf.finalize(0x3000).expect("finalize should succeed");
    assert_eq!(&finalized.code[..2], &[0x0F, 0x85]);
    assert_eq!(branch.offset(), 2);
    assert_eq!(rel32(&finalized.code, 2), 1);

    let encoder = Arch::X86_64.encoder();
    assert_eq!(
        encoder.read_target(&finalized.code, 0x3000, &branch),
        Ok(0x3007)
    );
    encoder
        .relink(&mut finalized.code, 0x3000, &branch, 0x3006)
        .expect("relink should succeed");
    assert_eq!(rel32(&finalized.code, 2), 0);
    assert_eq!(finalized.code[1], 0x85);
}

#[test]
fn pool_operations_need_an_encoder_with_a_pool() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let site = x86_64::emit_mov_imm32(&mut buf, Reg::Rax, 1);
    assert_eq!(
        buf.record_deferred_load(site.offset(), false),
        Err(JitError::Unsupported("literal pool loads"))
    );
    assert_eq!(
        buf.set_pool_value(site.offset(), PoolValue::Word(2)),
        Err(JitError::Unsupported("literal pool loads"))
    );
    assert!(buf.relocations().is_empty());
    assert!(!Arch::X86_64.encoder().supports_constant_pool());
    assert!(Arch::Arm.encoder().supports_constant_pool());
}

#[test]
fn finalize_consumes_the_buffer() {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    x86_64::emit_ret(&mut buf);
    buf.finalize(0x1000).expect("finalize should succeed");
    assert!(buf.is_empty());
    assert_eq!(buf.finalize(0x1000), Err(JitError::AlreadyFinalized));

    // Emission after finalize is ignored.
    x86_64::emit_ret(&mut buf);
    assert!(buf.is_empty());
}

#[test]
fn out_of_memory_buffer_cannot_finalize() {
    let mut buf = CodeBuffer::with_limit(Arch::X86_64.encoder(), 8);
    x86_64::emit_mov_imm64(&mut buf, Reg::Rax, 1);
    assert!(buf.is_oom());
    x86_64::emit_ret(&mut buf);
    assert_eq!(buf.finalize(0x1000), Err(JitError::OutOfMemory));

    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    x86_64::emit_ret(&mut buf);
    buf.mark_oom();
    assert_eq!(buf.finalize(0x1000), Err(JitError::OutOfMemory));
}

#[test]
fn arm_pool_load_binds_forward() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    let site = arm::emit_load_imm32(&mut buf, arm::Reg::R0, 0x1234);
    arm::emit_bx_lr(&mut buf);
    assert_eq!(buf.pending_pool_entries(), 1);

    let finalized = buf.finalize(0x10_000).expect("finalize should succeed");
    assert_eq!(site.offset(), 0);
    assert_eq!(word(&finalized.code, 0), 0xE59F_0000);
    assert_eq!(word(&finalized.code, 4), 0xE12F_FF1E);
    assert_eq!(word(&finalized.code, 8), 0x1234);
    // Padded with bkpt.
    assert_eq!(finalized.len(), 16);
    assert_eq!(word(&finalized.code, 12), 0xE120_0070);
}

#[test]
fn arm_pool_load_binds_backward_with_down_offset() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    arm::emit_bx_lr(&mut buf);
    let site = arm::emit_load_imm32(&mut buf, arm::Reg::R1, -1);
    buf.flush_constant_pool(false).expect("flush should succeed");

    let encoder = ArmEncoder::default();
    assert_eq!(word(buf.code(), site.offset()), 0xE51F_1004);
    assert_eq!(encoder.pool_slot_of_load(buf.code(), site.offset()), Ok(8));
    assert_eq!(word(buf.code(), 8), u32::MAX);
}

#[test]
fn arm_pool_value_can_change_after_flush() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    let site = arm::emit_load_imm32(&mut buf, arm::Reg::R2, 1);
    arm::emit_bx_lr(&mut buf);
    buf.flush_constant_pool(false).expect("flush should succeed");

    buf.set_pool_value(site.offset(), PoolValue::Word(5))
        .expect("set should succeed");
    assert_eq!(word(buf.code(), 8), 5);
    assert!(buf.relocations().is_empty());

    let target = buf.label();
    arm::emit_bx_lr(&mut buf);
    buf.set_pool_value(site.offset(), PoolValue::Label(target))
        .expect("set should succeed");
    assert_eq!(
        buf.relocations()[0].kind,
        RelocationKind::LiteralPoolLoad { branch_form: false }
    );
    let finalized = buf.finalize(0x3000).expect("finalize should succeed");
    assert_eq!(word(&finalized.code, 8), 0x3000 + target.offset() as u32);
}

#[test]
fn arm_pool_flushes_before_going_out_of_reach() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    arm::emit_load_pointer(&mut buf, arm::Reg::R0, 0xCAFE_F00D);
    let mut emitted = 0;
    while buf.pending_pool_entries() > 0 && emitted < 2048 {
        arm::emit_bx_lr(&mut buf);
        emitted += 1;
    }
    assert_eq!(buf.pending_pool_entries(), 0);
    assert!(!buf.is_oom());

    // Guard branch at 4076 skips the pool word at 4080.
    assert_eq!(word(buf.code(), 4076), 0xEA00_0000);
    assert_eq!(word(buf.code(), 4080), 0xCAFE_F00D);
    assert_eq!(word(buf.code(), 0), 0xE59F_0FE8);
    assert_eq!(word(buf.code(), 4084), 0xE12F_FF1E);
}

#[test]
fn arm_label_jump_is_rebased() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    let jump = arm::emit_jump(&mut buf);
    arm::emit_bx_lr(&mut buf);
    let target = buf.label();
    arm::emit_bx_lr(&mut buf);
    arm::link_jump(&mut buf, jump, target).expect("link should succeed");

    let finalized = buf.finalize(0x20_000).expect("finalize should succeed");
    assert_eq!(word(&finalized.code, 0), 0xE59F_F008);
    assert_eq!(word(&finalized.code, 16), 0x20_008);
    assert_eq!(finalized.relocations_resolved, 1);
    assert_eq!(finalized.branches_shortened, 0);
}

#[test]
fn arm_unlinked_jump_keeps_sentinel() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    let jump = arm::emit_jump(&mut buf);
    buf.record_deferred_load(jump.offset(), true)
        .expect("deferred load should be accepted");
    arm::emit_bx_lr(&mut buf);

    let finalized = buf.finalize(0x20_000).expect("finalize should succeed");
    assert_eq!(word(&finalized.code, 8), INVALID_BRANCH_TARGET);
    assert_eq!(finalized.sentinels_skipped, 1);
    assert_eq!(finalized.relocations_resolved, 0);
}

#[test]
fn arm_label_jump_shortens_to_branch() {
    let mut buf = CodeBuffer::new(Arc::new(ArmEncoder::with_branch_shortening()));
    let jump = arm::emit_jump(&mut buf);
    arm::emit_bx_lr(&mut buf);
    let target = buf.label();
    arm::emit_bx_lr(&mut buf);
    arm::link_jump(&mut buf, jump, target).expect("link should succeed");

    let finalized = buf.finalize(0x20_000).expect("finalize should succeed");
    assert_eq!(word(&finalized.code, 0), 0xEA00_0000);
    assert_eq!(finalized.branches_shortened, 1);
}

#[test]
fn arm_rejects_deferred_load_on_other_instructions() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    arm::emit_bx_lr(&mut buf);
    assert_eq!(
        buf.record_deferred_load(0, false),
        Err(JitError::UnexpectedInstruction {
            at: 0,
            expected: "ldr [pc, #imm]",
            found: 0xE12F_FF1E,
        })
    );
}

#[test]
fn arm_branch_out_of_range_fails_finalize() {
    let mut buf = CodeBuffer::new(Arch::Arm.encoder());
    arm::emit_near_call(&mut buf, BranchTarget::Absolute(0x1000_0000));
    assert!(matches!(
        buf.finalize(0),
        Err(JitError::DisplacementOutOfRange { form: "b/bl", .. })
    ));
}

proptest! {
    #[test]
    fn rel32_call_reaches_label(
        base in (0usize..1 << 30).prop_map(|base| base & !7),
        padding in 0usize..512,
    ) {
        let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
        let target = Label::at(5 + padding);
        let call = x86_64::emit_near_call(&mut buf, BranchTarget::Label(target));
        for _ in 0..padding {
            x86_64::emit_nop(&mut buf);
        }
        x86_64::emit_ret(&mut buf);

        let finalized = buf.finalize(base).expect("finalize should succeed");
        prop_assert_eq!(rel32(&finalized.code, 1), padding as i32);
        let encoder = Arch::X86_64.encoder();
        prop_assert_eq!(
            encoder.read_target(&finalized.code, base, &call),
            Ok(base + target.offset())
        );
    }

    #[test]
    fn arm_bl_resolves_or_reports_range(
        base in (0usize..1 << 28).prop_map(|base| base & !7),
        target in (0usize..1 << 28).prop_map(|target| target & !3),
    ) {
        let mut buf = CodeBuffer::new(Arch::Arm.encoder());
        let call = arm::emit_near_call(&mut buf, BranchTarget::Absolute(target));
        let diff = target as i64 - (base as i64 + 8);
        let in_range = (-(1i64 << 25)..=(1i64 << 25) - 4).contains(&diff);

        match buf.finalize(base) {
            Ok(finalized) => {
                prop_assert!(in_range);
                let encoder = Arch::Arm.encoder();
                prop_assert_eq!(
                    encoder.read_target(&finalized.code, base, &call),
                    Ok(target)
                );
            }
            Err(err) => {
                prop_assert!(!in_range);
                let is_range_error =
                    matches!(err, JitError::DisplacementOutOfRange { .. });
                prop_assert!(is_range_error);
            }
        }
    }
}
