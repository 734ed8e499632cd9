mod common;

use jit::encoder::x86_64::{self, Reg};
use jit::{
    Arch, BranchTarget, CodeBuffer, ExecutableAllocator, JitCode, JitError, Label, PatchSite,
    Protection, ProtectionTransitions, RepatchBuffer, ReturnAddress, SiteKind, page_size,
};

struct Published {
    code: JitCode,
    jump: PatchSite,
    near_call: PatchSite,
    far_call: PatchSite,
    value: PatchSite,
    pointer: PatchSite,
    load: PatchSite,
}

/// jmp rel32; call rel32; mov eax, imm32; mov rdx, imm64; mov rax, [rbx+16];
/// far call; ret
fn publish_sites(allocator: &ExecutableAllocator) -> Published {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let jump = x86_64::emit_jmp_rel32(&mut buf);
    let near_call = x86_64::emit_near_call(&mut buf, BranchTarget::Label(Label::at(0)));
    let value = x86_64::emit_mov_imm32(&mut buf, Reg::Rax, 17);
    let pointer = x86_64::emit_mov_imm64(&mut buf, Reg::Rdx, 0xDEAD_BEEF);
    let load = x86_64::emit_load_ptr(&mut buf, Reg::Rax, Reg::Rbx, 16);
    let far_call = x86_64::emit_far_call(&mut buf, 0x1234_5678);
    x86_64::emit_ret(&mut buf);
    let region = allocator.publish(&mut buf).expect("publish should succeed");
    Published {
        code: JitCode::new(region, Label::at(0)),
        jump,
        near_call,
        far_call,
        value,
        pointer,
        load,
    }
}

#[test]
fn relinks_jumps_and_calls() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);
    let start = published.code.region().start();

    let mut patch = published.code.repatch().expect("open should succeed");
    assert_eq!(patch.base(), start);
    assert_eq!(patch.call_target(&published.near_call), Ok(start));

    patch
        .relink_jump(&published.jump, start + 40)
        .expect("relink should succeed");
    patch
        .relink_near_call(&published.near_call, start + 8)
        .expect("relink should succeed");
    patch
        .relink_call(&published.far_call, 0xABCD_0000)
        .expect("relink should succeed");
    assert_eq!(patch.jump_target(&published.jump), Ok(start + 40));
    assert_eq!(patch.call_target(&published.near_call), Ok(start + 8));
    assert_eq!(patch.call_target(&published.far_call), Ok(0xABCD_0000));
    assert_eq!(patch.edits(), 3);
    patch.finish().expect("finish should succeed");

    let code = published.code.region().read_code();
    assert_eq!(code[0], 0xE9);
    // jmp field ends at 5.
    assert_eq!(common::rel32(&code, 1), 35);
}

#[test]
fn patches_immediates_and_pointers() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);

    let mut patch = published.code.repatch().expect("open should succeed");
    assert_eq!(patch.read_int32(&published.value), Ok(17));
    assert_eq!(patch.read_pointer(&published.pointer), Ok(0xDEAD_BEEF));
    patch
        .repatch_int32(&published.value, -9)
        .expect("patch should succeed");
    patch
        .repatch_pointer(&published.pointer, 0x7FFF_1000)
        .expect("patch should succeed");
    assert_eq!(patch.read_int32(&published.value), Ok(-9));
    assert_eq!(patch.read_pointer(&published.pointer), Ok(0x7FFF_1000));
}

#[test]
fn swaps_load_and_lea() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);
    let opcode_at = published.load.offset() + 1;
    assert_eq!(published.code.region().read_code()[opcode_at], 0x8B);

    let mut patch = published.code.repatch().expect("open should succeed");
    patch
        .repatch_load_ptr_to_lea(&published.load)
        .expect("swap should succeed");
    drop(patch);
    assert_eq!(published.code.region().read_code()[opcode_at], 0x8D);

    let mut patch = published.code.repatch().expect("open should succeed");
    patch
        .repatch_lea_to_load_ptr(&published.load)
        .expect("swap should succeed");
    patch.finish().expect("finish should succeed");
    assert_eq!(published.code.region().read_code()[opcode_at], 0x8B);
}

#[test]
fn wrong_site_kind_is_rejected() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);
    let mut patch = published.code.repatch().expect("open should succeed");
    assert_eq!(
        patch.relink_jump(&published.value, 0),
        Err(JitError::WrongSiteKind {
            expected: SiteKind::Jump,
            found: SiteKind::DataLabel32,
        })
    );
    assert_eq!(
        patch.repatch_int32(&published.pointer, 1),
        Err(JitError::WrongSiteKind {
            expected: SiteKind::DataLabel32,
            found: SiteKind::PointerLabel,
        })
    );
    assert_eq!(patch.edits(), 0);
}

#[cfg(target_pointer_width = "64")]
#[test]
fn near_call_out_of_reach_is_refused_without_writing() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);
    let start = published.code.region().start();
    let field_end = start + published.near_call.offset() + 4;
    let farthest = field_end + i32::MAX as usize;
    let before = published.code.region().read_code();

    let mut patch = published.code.repatch().expect("open should succeed");
    assert!(patch.can_relink(&published.near_call, farthest));
    assert!(!patch.can_relink(&published.near_call, farthest + 2));
    assert_eq!(
        patch.relink_near_call(&published.near_call, farthest + 2),
        Err(JitError::NotRelinkable {
            kind: SiteKind::NearCall,
            site: start + published.near_call.offset(),
            target: farthest + 2,
        })
    );
    drop(patch);
    assert_eq!(published.code.region().read_code(), before);
}

#[test]
fn relinks_callers_by_return_address() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);
    let start = published.code.region().start();
    let near_return = ReturnAddress(start + published.near_call.offset() + 4);
    let far_return = ReturnAddress(start + published.far_call.offset() + 11);

    let mut patch = published.code.repatch().expect("open should succeed");
    patch
        .relink_near_caller_to_trampoline(near_return, start + 24)
        .expect("relink should succeed");
    patch
        .relink_caller_to_trampoline(far_return, 0x5555_0000)
        .expect("relink should succeed");
    assert_eq!(patch.call_target(&published.near_call), Ok(start + 24));
    assert_eq!(patch.call_target(&published.far_call), Ok(0x5555_0000));

    assert!(matches!(
        patch.relink_caller_to_trampoline(ReturnAddress(start + 4096 * 64), 0),
        Err(JitError::InvalidSite { .. })
    ));
}

#[test]
fn protection_transitions_are_paired() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);
    let region = published.code.region();
    assert_eq!(region.protection(), Protection::Executable);

    for round in 1..=3 {
        let mut patch = RepatchBuffer::new(region).expect("open should succeed");
        patch
            .repatch_int32(&published.value, round)
            .expect("patch should succeed");
        if round % 2 == 0 {
            patch.finish().expect("finish should succeed");
        }
        // Odd rounds restore protection on drop.
    }
    assert_eq!(region.protection(), Protection::Executable);
    assert_eq!(
        region.transitions(),
        ProtectionTransitions {
            to_writable: 3,
            to_executable: 3,
        }
    );
}

#[test]
fn failed_edit_still_restores_protection() {
    let allocator = ExecutableAllocator::default();
    let published = publish_sites(&allocator);
    let region = published.code.region();

    let result = (|| -> Result<(), JitError> {
        let mut patch = published.code.repatch()?;
        patch.repatch_int32(&published.value, 3)?;
        patch.relink_jump(&published.value, 0)?;
        patch.finish()
    })();
    assert!(matches!(result, Err(JitError::WrongSiteKind { .. })));
    assert_eq!(region.protection(), Protection::Executable);
    assert_eq!(region.transitions().to_writable, 1);
    assert_eq!(region.transitions().to_executable, 1);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn patched_code_runs_with_new_values() {
    use x86_64::{emit_add_eax_imm32, emit_jmp_rel32, emit_mov_imm32, emit_ret, link_jump};

    if !common::host_can_execute() {
        return;
    }
    let allocator = ExecutableAllocator::default();
    let constant = common::publish_constant(&allocator, 11);
    assert_eq!(common::call_i32(constant.entry_address()), 11);
    let site = *constant.site("value").expect("value site");
    let mut patch = constant.repatch().expect("open should succeed");
    patch.repatch_int32(&site, 99).expect("patch should succeed");
    patch.finish().expect("finish should succeed");
    assert_eq!(common::call_i32(constant.entry_address()), 99);

    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let answer = emit_mov_imm32(&mut buf, Reg::Rax, 42);
    let exit = emit_jmp_rel32(&mut buf);
    let bonus = buf.label();
    emit_add_eax_imm32(&mut buf, 1000);
    let done = buf.label();
    emit_ret(&mut buf);
    link_jump(&mut buf, exit, done).expect("link should succeed");
    let region = allocator.publish(&mut buf).expect("publish should succeed");
    let code = JitCode::new(region, Label::at(0)).with_label("bonus", bonus);
    assert_eq!(common::call_i32(code.entry_address()), 42);

    let bonus_address = code.label_address("bonus").expect("bonus label");
    let mut patch = code.repatch().expect("open should succeed");
    patch.repatch_int32(&answer, 7).expect("patch should succeed");
    patch.relink_jump(&exit, bonus_address).expect("relink should succeed");
    patch.finish().expect("finish should succeed");
    assert_eq!(common::call_i32(code.entry_address()), 1007);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn neighbour_code_runs_while_another_region_is_patched() {
    if !common::host_can_execute() {
        return;
    }
    let allocator = ExecutableAllocator::default();
    let patched = common::publish_constant(&allocator, 1);
    let _gap = allocator.allocate(page_size()).expect("allocate should succeed");
    let neighbour = common::publish_constant(&allocator, 2);
    let site = *patched.site("value").expect("value site");

    let mut patch = patched.repatch().expect("open should succeed");
    patch.repatch_int32(&site, 5).expect("patch should succeed");
    assert_eq!(common::call_i32(neighbour.entry_address()), 2);
    patch.finish().expect("finish should succeed");

    assert_eq!(common::call_i32(patched.entry_address()), 5);
    assert_eq!(common::call_i32(neighbour.entry_address()), 2);
}
