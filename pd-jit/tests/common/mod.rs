#![allow(dead_code)]

use jit::encoder::x86_64::{Reg, emit_mov_imm32, emit_ret};
use jit::{Arch, CodeBuffer, ExecutableAllocator, JitCode, Label};

pub fn host_can_execute() -> bool {
    cfg!(target_arch = "x86_64") && (cfg!(unix) || cfg!(target_os = "windows"))
}

/// Publishes `mov eax, value; ret` and names the immediate "value".
pub fn publish_constant(allocator: &ExecutableAllocator, value: i32) -> JitCode {
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let site = emit_mov_imm32(&mut buf, Reg::Rax, value);
    emit_ret(&mut buf);
    let region = allocator.publish(&mut buf).expect("publish should succeed");
    JitCode::new(region, Label::at(0)).with_site("value", site)
}

pub fn word(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(code[at..at + 4].try_into().expect("four bytes"))
}

pub fn rel32(code: &[u8], at: usize) -> i32 {
    word(code, at) as i32
}

pub fn qword(code: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(code[at..at + 8].try_into().expect("eight bytes"))
}

#[cfg(target_arch = "x86_64")]
pub fn call_i32(address: usize) -> i32 {
    type Entry = extern "C" fn() -> i32;
    let entry = unsafe { std::mem::transmute::<usize, Entry>(address) };
    entry()
}

/// Permission column of the `/proc/self/maps` entry holding `address`.
#[cfg(target_os = "linux")]
pub fn page_permissions(address: usize) -> String {
    let maps = std::fs::read_to_string("/proc/self/maps").expect("maps should be readable");
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let start = usize::from_str_radix(start, 16).expect("hex start");
        let end = usize::from_str_radix(end, 16).expect("hex end");
        if (start..end).contains(&address) {
            return perms.to_string();
        }
    }
    panic!("0x{address:x} is not mapped");
}
