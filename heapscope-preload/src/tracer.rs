use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use crate::tree::TraceTree;
use crate::writer::LineWriter;

/// Version stamped into the `v` header line. The analyzer refuses files
/// written by a newer tracer.
pub const VERSION: u32 = 0x010200;
/// Data layout revision of the line protocol.
pub const FILE_FORMAT_VERSION: u32 = 3;

/// Set once the atexit handler fired; shutdown then leaks the tracer state
/// on purpose so that deallocations from static destructors are still
/// observed.
static ATEXIT: AtomicBool = AtomicBool::new(false);

/// Set by an explicit stop before atexit; forces a full teardown.
static FORCE_CLEANUP: AtomicBool = AtomicBool::new(false);

static DEBUG: AtomicBool = AtomicBool::new(false);

macro_rules! debug_log {
    ($($arg:tt)*) => {
        if DEBUG.load(Ordering::Relaxed) {
            eprintln!("heapscope debug: {}", format_args!($($arg)*));
        }
    };
}

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// Per-thread guard preventing infinite recursion when a hook ends up
/// calling back into an allocation function, e.g. through the dynamic
/// linker. This is the sole re-entrancy protection of the tracer.
pub struct RecursionGuard {
    was_active: bool,
}

impl RecursionGuard {
    pub fn new() -> RecursionGuard {
        let was_active = IN_HANDLER.with(|flag| flag.replace(true));
        RecursionGuard { was_active }
    }

    pub fn is_active() -> bool {
        IN_HANDLER.with(|flag| flag.get())
    }

    fn set_active(active: bool) {
        IN_HANDLER.with(|flag| flag.set(active));
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        IN_HANDLER.with(|flag| flag.set(self.was_active));
    }
}

/// The shared state is guarded by a spinlock rather than a mutex: teardown
/// ordering of a poisoned or destructed mutex during process exit is
/// undefined, a plain atomic bool keeps working until the very end.
static LOCKED: AtomicBool = AtomicBool::new(false);

struct StateCell(UnsafeCell<Option<TracerData>>);

// Only ever dereferenced while LOCKED is held.
unsafe impl Sync for StateCell {}

static STATE: StateCell = StateCell(UnsafeCell::new(None));

struct TracerData {
    writer: LineWriter,
    tree: TraceTree,
    /// dlopen/dlclose mark this dirty; the next allocation re-snapshots the
    /// loaded modules so the interpret pass never sees an unknown IP.
    module_cache_dirty: bool,
    start: Instant,
    statm_fd: libc::c_int,
    timer_stop: Arc<AtomicBool>,
    timer: Option<std::thread::JoinHandle<()>>,
    stop_callback: Option<fn()>,
}

/// Lock token over the tracer state; the spinlock is released on drop.
pub struct Tracer {
    _not_send: std::marker::PhantomData<*mut ()>,
}

impl Tracer {
    pub fn lock() -> Tracer {
        while LOCKED.swap(true, Ordering::Acquire) {
            std::thread::sleep(Duration::from_micros(1));
        }
        Tracer {
            _not_send: std::marker::PhantomData,
        }
    }

    /// Acquire the lock unless `keep_trying` turns false while spinning.
    /// The timer thread uses this so it never blocks shutdown.
    pub fn try_lock_while(keep_trying: impl Fn() -> bool) -> Option<Tracer> {
        while LOCKED.swap(true, Ordering::Acquire) {
            if !keep_trying() {
                return None;
            }
            std::thread::sleep(Duration::from_micros(1));
        }
        Some(Tracer {
            _not_send: std::marker::PhantomData,
        })
    }

    fn data(&mut self) -> Option<&mut TracerData> {
        unsafe { (*STATE.0.get()).as_mut() }
    }

    pub fn initialize(
        &mut self,
        output: &str,
        init_before: Option<fn()>,
        init_after: Option<fn(&mut LineWriter)>,
        stop_callback: Option<fn()>,
    ) {
        if std::env::var_os("HEAPSCOPE_DEBUG").is_some() {
            DEBUG.store(true, Ordering::Relaxed);
        }
        debug_log!("initializing: {}", output);
        if self.data().is_some() {
            debug_log!("already initialized");
            return;
        }

        if let Some(callback) = init_before {
            callback();
        }

        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            // do not trace forked child processes
            unsafe {
                libc::pthread_atfork(Some(prepare_fork), Some(parent_fork), Some(child_fork));
                libc::atexit(atexit_handler);
            }
        });

        let fd = create_output_fd(output);
        if fd < 0 {
            if let Some(callback) = stop_callback {
                callback();
            }
            return;
        }

        let mut writer = LineWriter::new(fd);
        writer.write_hex_line(b'v', &[VERSION as u64, FILE_FORMAT_VERSION as u64]);
        write_exe(&mut writer);
        write_command_line(&mut writer);
        write_system_info(&mut writer);

        let timer_stop = Arc::new(AtomicBool::new(false));
        let timer = spawn_timer_thread(timer_stop.clone());

        let statm_fd = unsafe {
            libc::open(
                b"/proc/self/statm\0".as_ptr() as *const libc::c_char,
                libc::O_RDONLY,
            )
        };
        if statm_fd < 0 {
            eprintln!("heapscope: WARNING: failed to open /proc/self/statm for reading.");
        }

        unsafe {
            *STATE.0.get() = Some(TracerData {
                writer,
                tree: TraceTree::new(),
                module_cache_dirty: true,
                start: Instant::now(),
                statm_fd,
                timer_stop,
                timer,
                stop_callback,
            });
        }

        if let Some(callback) = init_after {
            if let Some(data) = self.data() {
                callback(&mut data.writer);
            }
        }

        debug_log!("initialization done");
    }

    pub fn shutdown(&mut self) {
        if self.data().is_none() {
            return;
        }
        debug_log!("shutdown()");

        self.write_timestamp();
        self.write_rss();
        if let Some(data) = self.data() {
            data.writer.flush();
        }

        // Keep the state alive on the atexit path: deallocations from static
        // destructors running after us must not crash, and leaking here is
        // how they stay observable.
        if !ATEXIT.load(Ordering::SeqCst) || FORCE_CLEANUP.load(Ordering::SeqCst) {
            let data = unsafe { (*STATE.0.get()).take() };
            if let Some(mut data) = data {
                data.timer_stop.store(true, Ordering::SeqCst);
                if let Some(handle) = data.timer.take() {
                    let _ = handle.join();
                }
                data.writer.close();
                if data.statm_fd >= 0 {
                    unsafe { libc::close(data.statm_fd) };
                }
                if let Some(callback) = data.stop_callback {
                    callback();
                }
            }
        }
        debug_log!("shutdown() done");
    }

    pub fn invalidate_module_cache(&mut self) {
        if let Some(data) = self.data() {
            data.module_cache_dirty = true;
        }
    }

    pub fn write_timestamp(&mut self) {
        let Some(data) = self.data() else { return };
        if !data.writer.can_write() {
            return;
        }
        let elapsed = data.start.elapsed().as_millis() as u64;
        if !data.writer.write_hex_line(b'c', &[elapsed]) {
            self.write_error();
        }
    }

    pub fn write_rss(&mut self) {
        let Some(data) = self.data() else { return };
        if !data.writer.can_write() || data.statm_fd < 0 {
            return;
        }
        let Some(rss) = read_statm_rss(data.statm_fd) else {
            eprintln!("heapscope: WARNING: failed to read RSS value from /proc/self/statm.");
            unsafe { libc::close(data.statm_fd) };
            data.statm_fd = -1;
            return;
        };
        if !data.writer.write_hex_line(b'R', &[rss]) {
            self.write_error();
        }
    }

    pub fn handle_malloc(&mut self, ptr: *mut libc::c_void, size: usize, ips: &[usize]) {
        if self.data().map_or(true, |data| !data.writer.can_write()) {
            return;
        }
        self.update_module_cache();
        let Some(data) = self.data() else { return };
        let index = data.tree.index(ips, &mut data.writer);
        if !data
            .writer
            .write_hex_line(b'+', &[size as u64, index as u64, ptr as u64])
        {
            self.write_error();
        }
    }

    /// A realloc hands the buffer over from `ptr_in` to `ptr_out`: one
    /// transfer event keeps the free and the allocation adjacent in the
    /// stream and marks both sides as exempt from temporary detection.
    pub fn handle_realloc(
        &mut self,
        ptr_in: *mut libc::c_void,
        size: usize,
        ptr_out: *mut libc::c_void,
        ips: &[usize],
    ) {
        if self.data().map_or(true, |data| !data.writer.can_write()) {
            return;
        }
        self.update_module_cache();
        let Some(data) = self.data() else { return };
        let index = data.tree.index(ips, &mut data.writer);
        if !data.writer.write_hex_line(
            b'~',
            &[size as u64, index as u64, ptr_in as u64, ptr_out as u64],
        ) {
            self.write_error();
        }
    }

    pub fn handle_free(&mut self, ptr: *mut libc::c_void) {
        let Some(data) = self.data() else { return };
        if !data.writer.can_write() {
            return;
        }
        if !data.writer.write_hex_line(b'-', &[ptr as u64]) {
            self.write_error();
        }
    }

    fn update_module_cache(&mut self) {
        let Some(data) = self.data() else { return };
        if !data.writer.can_write() || !data.module_cache_dirty {
            return;
        }
        debug_log!("updating module cache");
        // a lone dash resets the consumer's module table, so unloads are
        // reflected before the fresh snapshot
        let mut ok = data.writer.write_raw(b"m -\n");
        if ok {
            let failed = unsafe {
                libc::dl_iterate_phdr(
                    Some(module_snapshot_callback),
                    &mut data.writer as *mut LineWriter as *mut libc::c_void,
                )
            };
            data.module_cache_dirty = false;
            ok = failed == 0;
        }
        if !ok {
            self.write_error();
        }
    }

    fn write_error(&mut self) {
        debug_log!(
            "write error {}",
            std::io::Error::last_os_error()
        );
        if let Some(data) = self.data() {
            data.writer.disable();
        }
        self.shutdown();
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        LOCKED.store(false, Ordering::Release);
    }
}

/// Public tracer API, called from the hook layer.
pub fn init(
    output: &str,
    init_before: Option<fn()>,
    init_after: Option<fn(&mut LineWriter)>,
    stop_callback: Option<fn()>,
) {
    let _guard = RecursionGuard::new();
    let mut tracer = Tracer::lock();
    tracer.initialize(output, init_before, init_after, stop_callback);
}

pub fn stop() {
    let _guard = RecursionGuard::new();
    let mut tracer = Tracer::lock();
    if !ATEXIT.load(Ordering::SeqCst) {
        FORCE_CLEANUP.store(true, Ordering::SeqCst);
    }
    tracer.shutdown();
}

pub fn malloc(ptr: *mut libc::c_void, size: usize) {
    if ptr.is_null() || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();

    let mut trace = crate::unwind::Trace::new();
    trace.fill(2);

    let mut tracer = Tracer::lock();
    tracer.handle_malloc(ptr, size, trace.ips());
}

pub fn free(ptr: *mut libc::c_void) {
    if ptr.is_null() || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();

    let mut tracer = Tracer::lock();
    tracer.handle_free(ptr);
}

pub fn realloc(ptr_in: *mut libc::c_void, size: usize, ptr_out: *mut libc::c_void) {
    if ptr_out.is_null() || RecursionGuard::is_active() {
        return;
    }
    let _guard = RecursionGuard::new();

    let mut trace = crate::unwind::Trace::new();
    trace.fill(2);

    let mut tracer = Tracer::lock();
    if ptr_in.is_null() {
        // realloc(NULL, n) is a plain malloc(n)
        tracer.handle_malloc(ptr_out, size, trace.ips());
    } else {
        tracer.handle_realloc(ptr_in, size, ptr_out, trace.ips());
    }
}

pub fn invalidate_module_cache() {
    let _guard = RecursionGuard::new();
    let mut tracer = Tracer::lock();
    tracer.invalidate_module_cache();
}

extern "C" fn atexit_handler() {
    if FORCE_CLEANUP.load(Ordering::SeqCst) {
        return;
    }
    debug_log!("atexit()");
    ATEXIT.store(true, Ordering::SeqCst);
    stop();
}

extern "C" fn prepare_fork() {
    // no tracking while inside fork
    RecursionGuard::set_active(true);
}

extern "C" fn parent_fork() {
    RecursionGuard::set_active(false);
}

extern "C" fn child_fork() {
    // the child drops the tracer state entirely; two processes must never
    // write into one output file. The state is leaked, not destroyed: the
    // writer fd and timer handle still belong to the parent.
    unsafe {
        let stale = (*STATE.0.get()).take();
        std::mem::forget(stale);
    }
    RecursionGuard::set_active(true);
}

unsafe extern "C" fn module_snapshot_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let writer = &mut *(data as *mut LineWriter);
    let info = &*info;

    let mut load_segments = 0;
    for i in 0..info.dlpi_phnum {
        let phdr = &*info.dlpi_phdr.add(i as usize);
        if phdr.p_type == libc::PT_LOAD {
            load_segments += 1;
        }
    }
    if load_segments == 0 {
        return 0;
    }

    // the dynamic linker reports the main executable with an empty name;
    // the interpret pass substitutes the path from the `x` header line
    let name = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        b"x" as &[u8]
    } else {
        std::ffi::CStr::from_ptr(info.dlpi_name).to_bytes()
    };

    let mut ok = writer.write_raw(b"m ")
        && writer.write_raw(name)
        && writer.write_raw(b" ")
        && writer.write_hex(info.dlpi_addr as u64);
    for i in 0..info.dlpi_phnum {
        let phdr = &*info.dlpi_phdr.add(i as usize);
        if phdr.p_type == libc::PT_LOAD {
            ok = ok
                && writer.write_raw(b" ")
                && writer.write_hex(phdr.p_vaddr as u64)
                && writer.write_raw(b" ")
                && writer.write_hex(phdr.p_memsz as u64);
        }
    }
    ok = ok && writer.write_raw(b"\n");

    if ok {
        0
    } else {
        1
    }
}

fn spawn_timer_thread(stop_flag: Arc<AtomicBool>) -> Option<std::thread::JoinHandle<()>> {
    // Mask every signal before spawning: the host application may assume a
    // single specific thread handles its signals, and the mask is inherited.
    unsafe {
        let mut new_mask: libc::sigset_t = std::mem::zeroed();
        let mut previous_mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut new_mask);
        if libc::pthread_sigmask(libc::SIG_SETMASK, &new_mask, &mut previous_mask) != 0 {
            eprintln!("heapscope: WARNING: failed to block signals, disabling timer thread.");
            return None;
        }

        let handle = std::thread::Builder::new()
            .name("heapscope-timer".into())
            .spawn(move || {
                RecursionGuard::set_active(true);
                debug_log!("timer thread started");
                while !stop_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(10));
                    let keep_trying = || !stop_flag.load(Ordering::SeqCst);
                    if let Some(mut tracer) = Tracer::try_lock_while(keep_trying) {
                        if !stop_flag.load(Ordering::SeqCst) {
                            tracer.write_timestamp();
                            tracer.write_rss();
                        }
                    }
                }
            })
            .ok();

        if libc::pthread_sigmask(libc::SIG_SETMASK, &previous_mask, std::ptr::null_mut()) != 0 {
            eprintln!("heapscope: WARNING: failed to restore the signal mask.");
        }

        handle
    }
}

fn create_output_fd(output: &str) -> libc::c_int {
    let mut name = if output.is_empty() {
        // env var is not set when linked directly into an executable
        "heapscope.$$".to_string()
    } else {
        output.to_string()
    };

    match name.as_str() {
        "-" | "stdout" => return unsafe { libc::dup(libc::STDOUT_FILENO) },
        "stderr" => return unsafe { libc::dup(libc::STDERR_FILENO) },
        _ => {}
    }

    if name.contains("$$") {
        let pid = unsafe { libc::getpid() };
        name = name.replace("$$", &pid.to_string());
    }

    let Ok(path) = std::ffi::CString::new(name.clone()) else {
        return -1;
    };
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            0o644,
        )
    };
    if fd < 0 {
        eprintln!(
            "heapscope: ERROR: failed to open output file {}: {}",
            name,
            std::io::Error::last_os_error()
        );
    }
    debug_log!("will write to {}", name);
    fd
}

fn write_exe(writer: &mut LineWriter) {
    let mut buf = [0u8; 1024];
    let size = unsafe {
        libc::readlink(
            b"/proc/self/exe\0".as_ptr() as *const libc::c_char,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len() - 1,
        )
    };
    if size > 0 {
        writer.write_raw(b"x ");
        writer.write_raw(&buf[..size as usize]);
        writer.write_raw(b"\n");
    }
}

fn write_command_line(writer: &mut LineWriter) {
    let mut buf = [0u8; 4096];
    let fd = unsafe {
        libc::open(
            b"/proc/self/cmdline\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY,
        )
    };
    if fd < 0 {
        return;
    }
    let read = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    unsafe { libc::close(fd) };
    if read <= 0 {
        return;
    }

    writer.write_raw(b"X");
    for arg in buf[..read as usize].split(|&byte| byte == 0) {
        if arg.is_empty() {
            continue;
        }
        writer.write_raw(b" ");
        writer.write_raw(arg);
    }
    writer.write_raw(b"\n");
}

fn write_system_info(writer: &mut LineWriter) {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    writer.write_hex_line(b'I', &[page_size.max(0) as u64, pages.max(0) as u64]);
}

/// Parse the resident set size, in pages, out of `/proc/self/statm`.
fn read_statm_rss(fd: libc::c_int) -> Option<u64> {
    let mut buf = [0u8; 128];
    let read = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        )
    };
    if read <= 0 {
        return None;
    }
    let mut fields = buf[..read as usize].split(|&byte| byte == b' ');
    let _vsize = fields.next()?;
    let rss = fields.next()?;
    let mut value = 0u64;
    for &byte in rss {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (byte - b'0') as u64;
    }
    Some(value)
}
