use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::OnceLock;

use super::Protection;
use crate::error::{JitError, JitResult, last_os_error};

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(target_os = "windows")]
fn query_page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

#[cfg(not(any(unix, target_os = "windows")))]
fn query_page_size() -> usize {
    4096
}

/// Maps `len` bytes read-write, or read-write-execute when `rwx` is set.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn reserve(len: usize, rwx: bool) -> JitResult<NonNull<u8>> {
    let mut prot = libc::PROT_READ | libc::PROT_WRITE;
    if rwx {
        prot |= libc::PROT_EXEC;
    }
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(last_os_error("mmap"));
    }
    NonNull::new(ptr as *mut u8).ok_or(JitError::OutOfMemory)
}

/// MAP_JIT pages are always RWX; writability is toggled per thread.
#[cfg(target_os = "macos")]
pub fn reserve(len: usize, _rwx: bool) -> JitResult<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(last_os_error("mmap(MAP_JIT)"));
    }
    NonNull::new(ptr as *mut u8).ok_or(JitError::OutOfMemory)
}

#[cfg(target_os = "windows")]
pub fn reserve(len: usize, rwx: bool) -> JitResult<NonNull<u8>> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE, VirtualAlloc,
    };

    let protect = if rwx {
        PAGE_EXECUTE_READWRITE
    } else {
        PAGE_READWRITE
    };
    let ptr = unsafe {
        VirtualAlloc(std::ptr::null_mut(), len, MEM_COMMIT | MEM_RESERVE, protect) as *mut u8
    };
    NonNull::new(ptr).ok_or_else(|| last_os_error("VirtualAlloc"))
}

#[cfg(not(any(unix, target_os = "windows")))]
pub fn reserve(_len: usize, _rwx: bool) -> JitResult<NonNull<u8>> {
    Err(JitError::Unsupported(
        "executable memory on this platform",
    ))
}

#[cfg(unix)]
pub fn release(ptr: NonNull<u8>, len: usize) -> JitResult<()> {
    let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut _, len) };
    if rc != 0 {
        return Err(last_os_error("munmap"));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
pub fn release(ptr: NonNull<u8>, _len: usize) -> JitResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    let ok = unsafe { VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(last_os_error("VirtualFree"));
    }
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
pub fn release(_ptr: NonNull<u8>, _len: usize) -> JitResult<()> {
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
pub fn protect(ptr: NonNull<u8>, len: usize, protection: Protection) -> JitResult<()> {
    let prot = match protection {
        Protection::Writable => libc::PROT_READ | libc::PROT_WRITE,
        Protection::Executable => libc::PROT_READ | libc::PROT_EXEC,
    };
    let rc = unsafe { libc::mprotect(ptr.as_ptr() as *mut _, len, prot) };
    if rc != 0 {
        return Err(last_os_error(match protection {
            Protection::Writable => "mprotect(PROT_READ|PROT_WRITE)",
            Protection::Executable => "mprotect(PROT_READ|PROT_EXEC)",
        }));
    }
    Ok(())
}

/// MAP_JIT pages keep their RWX mapping; writes are gated per thread through
/// [`enter_thread_write`].
#[cfg(target_os = "macos")]
pub fn protect(_ptr: NonNull<u8>, _len: usize, _protection: Protection) -> JitResult<()> {
    Ok(())
}

#[cfg(target_os = "windows")]
pub fn protect(ptr: NonNull<u8>, len: usize, protection: Protection) -> JitResult<()> {
    use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualProtect};

    let flags = match protection {
        Protection::Writable => PAGE_READWRITE,
        Protection::Executable => PAGE_EXECUTE_READ,
    };
    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr.as_ptr() as *mut _, len, flags, &mut old_protect) };
    if ok == 0 {
        return Err(last_os_error("VirtualProtect"));
    }
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
pub fn protect(_ptr: NonNull<u8>, _len: usize, _protection: Protection) -> JitResult<()> {
    Err(JitError::Unsupported("memory protection on this platform"))
}

thread_local! {
    static WRITE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Opens a write window on the calling thread. The outermost window lifts the
/// thread's MAP_JIT write protection on macOS.
pub fn enter_thread_write() {
    WRITE_DEPTH.with(|depth| {
        if depth.get() == 0 {
            set_thread_jit_writable(true);
        }
        depth.set(depth.get() + 1);
    });
}

pub fn leave_thread_write() {
    WRITE_DEPTH.with(|depth| {
        match depth.get() {
            0 => {}
            1 => {
                depth.set(0);
                set_thread_jit_writable(false);
            }
            n => depth.set(n - 1),
        }
    });
}

/// Write windows currently open on the calling thread.
pub fn thread_write_depth() -> usize {
    WRITE_DEPTH.with(Cell::get)
}

#[cfg(target_os = "macos")]
fn set_thread_jit_writable(writable: bool) {
    unsafe {
        if pthread_jit_write_protect_supported_np() != 0 {
            pthread_jit_write_protect_np(if writable { 0 } else { 1 });
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn set_thread_jit_writable(_writable: bool) {}

/// Makes freshly written instructions visible to instruction fetch.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn flush_icache(_ptr: *const u8, _len: usize) {}

#[cfg(all(
    not(any(target_arch = "x86", target_arch = "x86_64")),
    target_os = "linux"
))]
pub fn flush_icache(ptr: *const u8, len: usize) {
    unsafe {
        __clear_cache(
            ptr as *mut libc::c_char,
            ptr.add(len) as *mut libc::c_char,
        );
    }
}

#[cfg(all(
    not(any(target_arch = "x86", target_arch = "x86_64")),
    target_os = "macos"
))]
pub fn flush_icache(ptr: *const u8, len: usize) {
    unsafe { sys_icache_invalidate(ptr as *mut libc::c_void, len) };
}

#[cfg(all(
    not(any(target_arch = "x86", target_arch = "x86_64")),
    target_os = "windows"
))]
pub fn flush_icache(ptr: *const u8, len: usize) {
    use windows_sys::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess,
    };

    unsafe { FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len) };
}

#[cfg(all(
    not(any(target_arch = "x86", target_arch = "x86_64")),
    not(any(target_os = "linux", target_os = "macos", target_os = "windows"))
))]
pub fn flush_icache(_ptr: *const u8, _len: usize) {}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    #[cfg(not(target_arch = "x86_64"))]
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(
    not(any(target_arch = "x86", target_arch = "x86_64")),
    target_os = "linux"
))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
