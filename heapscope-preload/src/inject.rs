//! Symbol overloading after runtime injection.
//!
//! Instead of relying on the preload order, [`heapscope_inject`] walks the
//! dynamic linker's program-header list and rewrites the PLT/GOT relocation
//! entries of every loaded object so that the recognized allocator symbols
//! point at the hooks of this library. Shutdown rewrites the captured
//! originals back. The injection library itself and the dynamic linker are
//! skipped. Target pages are made writable with a page-aligned `mprotect`;
//! the original protections are not restored.

#![allow(clippy::missing_safety_doc)]

use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_char, c_int, c_void};

static INJECTED: AtomicBool = AtomicBool::new(false);

/// dlopen of a new object leaves its relocations unhooked; the dlopen hook
/// calls this to extend the injection to the new object.
pub(crate) fn reapply_after_dlopen() {
    #[cfg(not(test))]
    if INJECTED.load(Ordering::SeqCst) {
        overwrite_symbols(false);
    }
}

#[cfg(target_pointer_width = "64")]
mod elf {
    pub type Addr = u64;
    pub type Xword = u64;
    pub type Sxword = i64;

    #[repr(C)]
    pub struct Dyn {
        pub d_tag: Sxword,
        pub d_val: Xword,
    }

    #[repr(C)]
    pub struct Rel {
        pub r_offset: Addr,
        pub r_info: Xword,
    }

    #[repr(C)]
    pub struct Rela {
        pub r_offset: Addr,
        pub r_info: Xword,
        pub r_addend: Sxword,
    }

    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: Addr,
        pub st_size: Xword,
    }

    pub fn r_sym(info: Xword) -> usize {
        (info >> 32) as usize
    }
}

#[cfg(target_pointer_width = "32")]
mod elf {
    pub type Addr = u32;
    pub type Xword = u32;
    pub type Sxword = i32;

    #[repr(C)]
    pub struct Dyn {
        pub d_tag: Sxword,
        pub d_val: Xword,
    }

    #[repr(C)]
    pub struct Rel {
        pub r_offset: Addr,
        pub r_info: Xword,
    }

    #[repr(C)]
    pub struct Rela {
        pub r_offset: Addr,
        pub r_info: Xword,
        pub r_addend: Sxword,
    }

    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_value: Addr,
        pub st_size: Xword,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
    }

    pub fn r_sym(info: Xword) -> usize {
        (info >> 8) as usize
    }
}

const DT_NULL: elf::Sxword = 0;
const DT_PLTRELSZ: elf::Sxword = 2;
const DT_STRTAB: elf::Sxword = 5;
const DT_SYMTAB: elf::Sxword = 6;
const DT_RELA: elf::Sxword = 7;
const DT_RELASZ: elf::Sxword = 8;
const DT_REL: elf::Sxword = 17;
const DT_RELSZ: elf::Sxword = 18;
const DT_JMPREL: elf::Sxword = 23;

/// One relocation table: a base pointer from the address tag and a byte
/// length from the size tag.
struct ElfTable {
    addr_tag: elf::Sxword,
    size_tag: elf::Sxword,
    table: usize,
    size: usize,
}

impl ElfTable {
    fn new(addr_tag: elf::Sxword, size_tag: elf::Sxword) -> ElfTable {
        ElfTable {
            addr_tag,
            size_tag,
            table: 0,
            size: 0,
        }
    }

    fn consume(&mut self, dyn_entry: &elf::Dyn) -> bool {
        if dyn_entry.d_tag == self.addr_tag {
            self.table = dyn_entry.d_val as usize;
            true
        } else if dyn_entry.d_tag == self.size_tag {
            self.size = dyn_entry.d_val as usize;
            true
        } else {
            false
        }
    }
}

#[cfg(not(test))]
mod hooks {
    use super::*;

    /// `(symbol name, replacement, original)` for every symbol the injection
    /// rewrites. Originals must have been resolved before this is called.
    pub(super) fn table() -> [(&'static [u8], usize, Option<usize>); 8] {
        let real = |real_fn: &crate::RealFn| {
            let ptr = real_fn.get();
            (ptr != 0).then_some(ptr)
        };
        [
            (b"malloc", crate::malloc as usize, real(&crate::REAL_MALLOC)),
            (b"free", crate::free as usize, real(&crate::REAL_FREE)),
            (b"calloc", crate::calloc as usize, real(&crate::REAL_CALLOC)),
            (
                b"realloc",
                crate::realloc as usize,
                real(&crate::REAL_REALLOC),
            ),
            (
                b"posix_memalign",
                crate::posix_memalign as usize,
                real(&crate::REAL_POSIX_MEMALIGN),
            ),
            (b"cfree", crate::cfree as usize, real(&crate::REAL_CFREE)),
            (b"dlopen", crate::dlopen as usize, real(&crate::REAL_DLOPEN)),
            (
                b"dlclose",
                crate::dlclose as usize,
                real(&crate::REAL_DLCLOSE),
            ),
        ]
    }
}

#[cfg(not(test))]
unsafe fn apply(symname: *const c_char, addr: usize, restore: bool) {
    let name = std::ffi::CStr::from_ptr(symname).to_bytes();
    for (hook_name, hook, original) in hooks::table() {
        if name != hook_name {
            continue;
        }
        let Some(original) = original else {
            return;
        };

        // some shared objects map their GOT read-only
        let page = addr & !(0x1000 - 1);
        libc::mprotect(page as *mut c_void, 0x1000, libc::PROT_READ | libc::PROT_WRITE);

        let slot = addr as *mut usize;
        *slot = if restore { original } else { hook };
        return;
    }
}

#[cfg(not(test))]
unsafe fn overwrite_table(
    entries: &ElfTable,
    entry_size: usize,
    strings: &ElfTable,
    symbols: &ElfTable,
    base: usize,
    restore: bool,
) {
    if entries.table == 0 || entries.size == 0 {
        return;
    }
    let count = entries.size / entry_size;
    for i in 0..count {
        // Rel and Rela share the leading offset and info fields
        let rel = &*((entries.table + i * entry_size) as *const elf::Rel);
        let sym_index = elf::r_sym(rel.r_info);
        let sym = &*((symbols.table + sym_index * std::mem::size_of::<elf::Sym>()) as *const elf::Sym);
        let symname = (strings.table + sym.st_name as usize) as *const c_char;
        apply(symname, base + rel.r_offset as usize, restore);
    }
}

#[cfg(not(test))]
unsafe fn overwrite_dynamic_section(dyn_ptr: *const elf::Dyn, base: usize, restore: bool) {
    let mut symbols = ElfTable::new(DT_SYMTAB, DT_NULL);
    let mut strings = ElfTable::new(DT_STRTAB, DT_NULL);
    let mut rels = ElfTable::new(DT_REL, DT_RELSZ);
    let mut relas = ElfTable::new(DT_RELA, DT_RELASZ);
    let mut jmprels = ElfTable::new(DT_JMPREL, DT_PLTRELSZ);

    let mut entry = dyn_ptr;
    while (*entry).d_tag != DT_NULL {
        let dyn_entry = &*entry;
        let _ = symbols.consume(dyn_entry)
            || strings.consume(dyn_entry)
            || rels.consume(dyn_entry)
            || relas.consume(dyn_entry)
            || jmprels.consume(dyn_entry);
        entry = entry.add(1);
    }
    if symbols.table == 0 || strings.table == 0 {
        return;
    }

    overwrite_table(
        &rels,
        std::mem::size_of::<elf::Rel>(),
        &strings,
        &symbols,
        base,
        restore,
    );
    overwrite_table(
        &relas,
        std::mem::size_of::<elf::Rela>(),
        &strings,
        &symbols,
        base,
        restore,
    );
    overwrite_table(
        &jmprels,
        std::mem::size_of::<elf::Rela>(),
        &strings,
        &symbols,
        base,
        restore,
    );
}

#[cfg(not(test))]
unsafe extern "C" fn iterate_phdrs_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let info = &*info;
    if !info.dlpi_name.is_null() {
        let name = std::ffi::CStr::from_ptr(info.dlpi_name).to_bytes();
        // never rewrite our own relocations, and leave the dynamic linker
        // and the vdso alone
        if contains(name, b"heapscope_preload")
            || contains(name, b"/ld-linux")
            || contains(name, b"linux-vdso")
        {
            return 0;
        }
    }

    let restore = !data.is_null();
    for i in 0..info.dlpi_phnum {
        let phdr = &*info.dlpi_phdr.add(i as usize);
        if phdr.p_type == libc::PT_DYNAMIC {
            overwrite_dynamic_section(
                (info.dlpi_addr as usize + phdr.p_vaddr as usize) as *const elf::Dyn,
                info.dlpi_addr as usize,
                restore,
            );
        }
    }
    0
}

#[cfg(not(test))]
fn overwrite_symbols(restore: bool) {
    let mut flag: c_int = restore as c_int;
    let data = if restore {
        &mut flag as *mut c_int as *mut c_void
    } else {
        std::ptr::null_mut()
    };
    unsafe {
        libc::dl_iterate_phdr(Some(iterate_phdrs_callback), data);
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len().max(1))
        .any(|window| window == needle)
}

#[cfg(not(test))]
fn inject_init() {
    crate::resolve_real_functions();
    INJECTED.store(true, Ordering::SeqCst);
    overwrite_symbols(false);
}

#[cfg(not(test))]
fn write_attached_marker(writer: &mut crate::writer::LineWriter) {
    writer.write_raw(b"A\n");
}

#[cfg(not(test))]
fn restore_symbols() {
    INJECTED.store(false, Ordering::SeqCst);
    overwrite_symbols(true);
}

/// Entry point for runtime injection: hook the allocator symbols of every
/// loaded object and start tracing into `output`.
///
/// # Safety
/// `output` must be null or a valid nul-terminated string.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn heapscope_inject(output: *const c_char) {
    let path = if output.is_null() {
        String::new()
    } else {
        std::ffi::CStr::from_ptr(output)
            .to_string_lossy()
            .into_owned()
    };
    crate::tracer::init(
        &path,
        Some(inject_init),
        Some(write_attached_marker),
        Some(restore_symbols),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_table_consumes_matching_tags() {
        let mut table = ElfTable::new(DT_JMPREL, DT_PLTRELSZ);
        assert!(table.consume(&elf::Dyn {
            d_tag: DT_JMPREL,
            d_val: 0x1000,
        }));
        assert!(table.consume(&elf::Dyn {
            d_tag: DT_PLTRELSZ,
            d_val: 0x30,
        }));
        assert!(!table.consume(&elf::Dyn {
            d_tag: DT_STRTAB,
            d_val: 0x2000,
        }));
        assert_eq!(table.table, 0x1000);
        assert_eq!(table.size, 0x30);
    }

    #[test]
    fn substring_search() {
        assert!(contains(b"/usr/lib/libheapscope_preload.so", b"heapscope_preload"));
        assert!(!contains(b"/usr/lib/libc.so.6", b"heapscope_preload"));
    }

    #[test]
    fn symbol_index_extraction() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(elf::r_sym((5u64 << 32) | 7), 5);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(elf::r_sym((5 << 8) | 7), 5);
    }
}
