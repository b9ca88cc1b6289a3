//! In-process heap tracer.
//!
//! Built as a `cdylib`, this crate interposes on the C heap allocation
//! primitives when loaded via `LD_PRELOAD` (the exported `malloc`, `free`,
//! … symbols shadow libc's) or when injected into a running process through
//! [`heapscope_inject`]. Every allocation event is appended to a line
//! oriented text stream consumed offline by the heapscope analyzer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

mod inject;
pub mod tracer;
pub mod tree;
pub mod unwind;
pub mod writer;

use libc::{c_char, c_int, c_void, size_t};

/// A lazily resolved pointer to the real implementation of a hooked symbol.
struct RealFn {
    name: &'static [u8],
    ptr: AtomicUsize,
}

impl RealFn {
    const fn new(name: &'static [u8]) -> RealFn {
        RealFn {
            name,
            ptr: AtomicUsize::new(0),
        }
    }

    fn is_resolved(&self) -> bool {
        self.ptr.load(Ordering::Acquire) != 0
    }

    fn get(&self) -> usize {
        self.ptr.load(Ordering::Acquire)
    }

    /// Resolve via the next object in the lookup chain. Failure to find a
    /// mandatory allocator symbol leaves no sane way to continue.
    fn resolve(&self) {
        if self.lookup().is_none() {
            let name = std::str::from_utf8(&self.name[..self.name.len() - 1]).unwrap_or("?");
            eprintln!("heapscope: could not find original function {}", name);
            unsafe { libc::abort() };
        }
    }

    fn resolve_optional(&self) {
        self.lookup();
    }

    fn lookup(&self) -> Option<usize> {
        let name = self.name.as_ptr() as *const c_char;
        let mut ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, name) };
        if ptr.is_null() {
            // when injected via dlopen this library is not part of the
            // global lookup scope and RTLD_NEXT has nothing after it; the
            // default lookup then lands in the C library
            ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name) };
        }
        if ptr.is_null() {
            return None;
        }
        self.ptr.store(ptr as usize, Ordering::Release);
        Some(ptr as usize)
    }
}

static REAL_MALLOC: RealFn = RealFn::new(b"malloc\0");
static REAL_FREE: RealFn = RealFn::new(b"free\0");
static REAL_CALLOC: RealFn = RealFn::new(b"calloc\0");
static REAL_REALLOC: RealFn = RealFn::new(b"realloc\0");
static REAL_POSIX_MEMALIGN: RealFn = RealFn::new(b"posix_memalign\0");
static REAL_ALIGNED_ALLOC: RealFn = RealFn::new(b"aligned_alloc\0");
static REAL_VALLOC: RealFn = RealFn::new(b"valloc\0");
static REAL_CFREE: RealFn = RealFn::new(b"cfree\0");
static REAL_DLOPEN: RealFn = RealFn::new(b"dlopen\0");
static REAL_DLCLOSE: RealFn = RealFn::new(b"dlclose\0");

static INIT_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Fixed pool serving `calloc` before symbol resolution has finished: the
/// dynamic linker's own `dlsym` allocates through `calloc`. Pointers from
/// this pool must stay recognizable forever, `free` treats them as no-ops.
struct DummyPool {
    buf: UnsafeCell<[u8; DummyPool::MAX_SIZE]>,
    offset: AtomicUsize,
}

unsafe impl Sync for DummyPool {}

impl DummyPool {
    const MAX_SIZE: usize = 1024;

    fn alloc(&self, num: size_t, size: size_t) -> *mut c_void {
        let len = num * size;
        let offset = self.offset.fetch_add(len, Ordering::SeqCst);
        if offset + len >= DummyPool::MAX_SIZE {
            eprintln!(
                "heapscope: failed to initialize, bootstrap calloc pool exhausted: {} requested, {} available",
                offset + len,
                DummyPool::MAX_SIZE
            );
            unsafe { libc::abort() };
        }
        // the pool is static zeroed memory that is never reused, so the
        // calloc zeroing contract holds without a memset
        unsafe { (self.buf.get() as *mut u8).add(offset) as *mut c_void }
    }

    fn contains(&self, ptr: *mut c_void) -> bool {
        let start = self.buf.get() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + DummyPool::MAX_SIZE
    }
}

static DUMMY_POOL: DummyPool = DummyPool {
    buf: UnsafeCell::new([0; DummyPool::MAX_SIZE]),
    offset: AtomicUsize::new(0),
};

fn resolve_real_functions() {
    // calloc first: resolving it may recurse into the calloc hook, which is
    // then served from the bootstrap pool. malloc and free follow before
    // anything else so that nested allocations from the dynamic linker hit
    // resolved symbols.
    REAL_CALLOC.resolve();
    REAL_MALLOC.resolve();
    REAL_FREE.resolve();
    REAL_DLOPEN.resolve();
    REAL_DLCLOSE.resolve();
    REAL_REALLOC.resolve();
    REAL_POSIX_MEMALIGN.resolve();
    REAL_ALIGNED_ALLOC.resolve();
    REAL_VALLOC.resolve();
    REAL_CFREE.resolve_optional();
}

fn clear_environment() {
    // prevent tracing of child processes
    std::env::remove_var("LD_PRELOAD");
    std::env::remove_var("HEAPSCOPE_OUTPUT");
}

/// First-hook initialization: resolve the real symbols, then bring up the
/// tracer with the output path from the environment.
fn init() {
    if INIT_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        // another thread is initializing, wait for the symbols to appear
        while !INITIALIZED.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        return;
    }
    resolve_real_functions();
    INITIALIZED.store(true, Ordering::Release);

    let output = std::env::var("HEAPSCOPE_OUTPUT").unwrap_or_default();
    tracer::init(&output, Some(clear_environment), None, None);
}

#[cfg(not(test))]
unsafe fn real_malloc(size: size_t) -> *mut c_void {
    let f: unsafe extern "C" fn(size_t) -> *mut c_void = std::mem::transmute(REAL_MALLOC.get());
    f(size)
}

#[cfg(not(test))]
unsafe fn real_free(ptr: *mut c_void) {
    let f: unsafe extern "C" fn(*mut c_void) = std::mem::transmute(REAL_FREE.get());
    f(ptr)
}

#[cfg(not(test))]
unsafe fn real_calloc(num: size_t, size: size_t) -> *mut c_void {
    let f: unsafe extern "C" fn(size_t, size_t) -> *mut c_void =
        std::mem::transmute(REAL_CALLOC.get());
    f(num, size)
}

#[cfg(not(test))]
unsafe fn real_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let f: unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void =
        std::mem::transmute(REAL_REALLOC.get());
    f(ptr, size)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    if !REAL_MALLOC.is_resolved() {
        init();
    }
    let ptr = real_malloc(size);
    tracer::malloc(ptr, size);
    ptr
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if !REAL_FREE.is_resolved() {
        init();
    }

    if DUMMY_POOL.contains(ptr) {
        return;
    }

    // notify before delegating, so the allocator cannot hand the same
    // address to another thread between the free and its notification
    tracer::free(ptr);

    real_free(ptr);
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn calloc(num: size_t, size: size_t) -> *mut c_void {
    if !REAL_CALLOC.is_resolved() {
        if INIT_IN_PROGRESS.load(Ordering::Acquire) {
            return DUMMY_POOL.alloc(num, size);
        }
        init();
    }

    let ptr = real_calloc(num, size);
    if !ptr.is_null() {
        tracer::malloc(ptr, num * size);
    }
    ptr
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if !REAL_REALLOC.is_resolved() {
        init();
    }

    let ret = real_realloc(ptr, size);
    if !ret.is_null() {
        tracer::realloc(ptr, size, ret);
    }
    ret
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    if !REAL_POSIX_MEMALIGN.is_resolved() {
        init();
    }

    let f: unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int =
        std::mem::transmute(REAL_POSIX_MEMALIGN.get());
    let ret = f(memptr, alignment, size);
    if ret == 0 {
        tracer::malloc(*memptr, size);
    }
    ret
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    if !REAL_ALIGNED_ALLOC.is_resolved() {
        init();
    }

    let f: unsafe extern "C" fn(size_t, size_t) -> *mut c_void =
        std::mem::transmute(REAL_ALIGNED_ALLOC.get());
    let ptr = f(alignment, size);
    if !ptr.is_null() {
        tracer::malloc(ptr, size);
    }
    ptr
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    if !REAL_VALLOC.is_resolved() {
        init();
    }

    let f: unsafe extern "C" fn(size_t) -> *mut c_void = std::mem::transmute(REAL_VALLOC.get());
    let ptr = f(size);
    if !ptr.is_null() {
        tracer::malloc(ptr, size);
    }
    ptr
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    if !INITIALIZED.load(Ordering::Acquire) {
        init();
    }
    if REAL_CFREE.get() == 0 {
        eprintln!("heapscope: could not find original function cfree");
        libc::abort();
    }

    if DUMMY_POOL.contains(ptr) {
        return;
    }
    if !ptr.is_null() {
        tracer::free(ptr);
    }

    let f: unsafe extern "C" fn(*mut c_void) = std::mem::transmute(REAL_CFREE.get());
    f(ptr)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn dlopen(filename: *const c_char, flag: c_int) -> *mut c_void {
    if !REAL_DLOPEN.is_resolved() {
        init();
    }

    let f: unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void =
        std::mem::transmute(REAL_DLOPEN.get());
    let ret = f(filename, flag);
    if !ret.is_null() {
        tracer::invalidate_module_cache();
        inject::reapply_after_dlopen();
    }
    ret
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    if !REAL_DLCLOSE.is_resolved() {
        init();
    }

    let f: unsafe extern "C" fn(*mut c_void) -> c_int = std::mem::transmute(REAL_DLCLOSE.get());
    let ret = f(handle);
    if ret == 0 {
        tracer::invalidate_module_cache();
    }
    ret
}

/// Explicit initialization for programs that link the tracer directly
/// instead of relying on the preload machinery.
///
/// # Safety
/// `output` must be null or a valid nul-terminated string.
#[no_mangle]
pub unsafe extern "C" fn heapscope_init(output: *const c_char) {
    let path = if output.is_null() {
        String::new()
    } else {
        std::ffi::CStr::from_ptr(output)
            .to_string_lossy()
            .into_owned()
    };
    resolve_real_functions();
    INITIALIZED.store(true, Ordering::Release);
    tracer::init(&path, Some(clear_environment), None, None);
}

/// Stop tracing and close the output file. The process keeps running with
/// every hook degraded to a plain passthrough.
#[no_mangle]
pub extern "C" fn heapscope_stop() {
    tracer::stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_pool_recognizes_its_pointers() {
        let ptr = DUMMY_POOL.alloc(2, 8);
        assert!(DUMMY_POOL.contains(ptr));
        assert!(!DUMMY_POOL.contains(std::ptr::null_mut()));
        let unrelated = Box::into_raw(Box::new(0u64)) as *mut c_void;
        assert!(!DUMMY_POOL.contains(unrelated));
        unsafe { drop(Box::from_raw(unrelated as *mut u64)) };
    }

    #[test]
    fn dummy_pool_allocations_are_zeroed_and_disjoint() {
        let first = DUMMY_POOL.alloc(1, 16) as *mut u8;
        let second = DUMMY_POOL.alloc(1, 16) as *mut u8;
        assert_ne!(first, second);
        unsafe {
            for i in 0..16 {
                assert_eq!(*first.add(i), 0);
            }
        }
    }
}
