//! The interpret pass: a line-protocol transformer between the raw tracer
//! stream and the stream the analyzer parses.
//!
//! Raw `t` lines carry instruction pointer addresses; this pass interns
//! each address once (`s` + `i` lines) and rewrites the trace lines to
//! reference the interned index. Raw `+`/`-`/`~` events carry sizes and
//! pointers; this pass interns `(size, trace)` pairs (`a` lines) and
//! rewrites the events to reference the info index. Everything else passes
//! through unchanged.
//!
//! An address resolves to its containing module, tracked from the `m`
//! records, and is named `<module basename>+0x<offset>`. Resolving
//! function/file/line through debug information is a separate concern and
//! deliberately not part of this pass; consumers render frames without a
//! file as unresolved.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::core::indices::TraceIndex;
use crate::core::pointer_map::{AllocationInfoSet, PointerMap};
use crate::core::reader::LineReader;

struct Module {
    address_start: u64,
    address_end: u64,
    module_index: u64,
    base_address: u64,
    name: String,
}

#[derive(Default)]
struct Interpreter {
    modules: Vec<Module>,
    modules_dirty: bool,
    interned_strings: HashMap<String, u64>,
    encountered_ips: HashMap<u64, u64>,
    exe: String,
}

impl Interpreter {
    fn intern(&mut self, string: &str, output: &mut dyn Write) -> Result<u64> {
        if string.is_empty() {
            return Ok(0);
        }
        if let Some(&id) = self.interned_strings.get(string) {
            return Ok(id);
        }
        let id = self.interned_strings.len() as u64 + 1;
        self.interned_strings.insert(string.to_string(), id);
        writeln!(output, "s {}", string)?;
        Ok(id)
    }

    fn add_module(
        &mut self,
        module_index: u64,
        name: &str,
        base_address: u64,
        address_start: u64,
        address_end: u64,
    ) {
        self.modules.push(Module {
            address_start,
            address_end,
            module_index,
            base_address,
            name: name.to_string(),
        });
        self.modules_dirty = true;
    }

    fn clear_modules(&mut self) {
        self.modules.clear();
        self.modules_dirty = true;
    }

    /// Intern an instruction pointer address, emitting its `s`/`i` lines on
    /// first sight. Returns the 1-based IP index.
    fn add_ip(&mut self, address: u64, output: &mut dyn Write) -> Result<u64> {
        if address == 0 {
            return Ok(0);
        }
        if let Some(&id) = self.encountered_ips.get(&address) {
            return Ok(id);
        }
        let id = self.encountered_ips.len() as u64 + 1;
        self.encountered_ips.insert(address, id);

        if self.modules_dirty {
            self.modules
                .sort_by_key(|module| (module.address_start, module.address_end));
            self.modules_dirty = false;
        }

        let pos = self
            .modules
            .partition_point(|module| module.address_end < address);
        let resolved = self
            .modules
            .get(pos)
            .filter(|module| module.address_start <= address && address <= module.address_end)
            .map(|module| {
                let offset = address - module.base_address;
                (
                    module.module_index,
                    format!("{}+0x{:x}", basename(&module.name), offset),
                )
            });

        match resolved {
            Some((module_index, function)) => {
                let function_index = self.intern(&function, output)?;
                writeln!(
                    output,
                    "i {:x} {:x} {:x}",
                    address, module_index, function_index
                )?;
            }
            None => {
                writeln!(output, "i {:x} 0", address)?;
            }
        }
        Ok(id)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Run the transformation from `input` to `output` until end of stream.
pub fn run(input: &mut dyn BufRead, output: &mut dyn Write) -> Result<()> {
    let mut reader = LineReader::new();
    let mut interpreter = Interpreter::default();

    let mut allocation_infos = AllocationInfoSet::new();
    let mut pointers = PointerMap::new();

    let mut allocations = 0u64;
    let mut leaked_allocations = 0u64;
    let mut temporary_allocations = 0u64;
    let mut last_ptr = 0u64;

    while reader.next_line(input).context("read raw trace")? {
        match reader.mode() {
            b'x' => {
                // the executable path, substituted for the linker's empty
                // module name below; consumed here, the analyzer does not
                // know this tag
                interpreter.exe = String::from_utf8_lossy(reader.remainder()).into_owned();
            }
            b'm' => {
                let Some(file_name) = reader.read_token() else {
                    log::warn!("failed to parse line: {}", reader.line());
                    continue;
                };
                let file_name = String::from_utf8_lossy(file_name).into_owned();
                if file_name == "-" {
                    interpreter.clear_modules();
                    continue;
                }
                let file_name = if file_name == "x" {
                    interpreter.exe.clone()
                } else {
                    file_name
                };
                let module_index = interpreter.intern(&file_name, output)?;
                let Some(base_address) = reader.read_hex() else {
                    log::warn!("failed to parse line: {}", reader.line());
                    continue;
                };
                while let (Some(vaddr), Some(mem_size)) = (reader.read_hex(), reader.read_hex()) {
                    interpreter.add_module(
                        module_index,
                        &file_name,
                        base_address,
                        base_address + vaddr,
                        base_address + vaddr + mem_size,
                    );
                }
            }
            b't' => {
                let (Some(address), Some(parent_index)) = (reader.read_hex(), reader.read_hex())
                else {
                    log::warn!("failed to parse line: {}", reader.line());
                    continue;
                };
                let ip_id = interpreter.add_ip(address, output)?;
                writeln!(output, "t {:x} {:x}", ip_id, parent_index)?;
            }
            b'+' => {
                let (Some(size), Some(trace), Some(ptr)) =
                    (reader.read_hex(), reader.read_hex_u32(), reader.read_hex())
                else {
                    log::warn!("failed to parse line: {}", reader.line());
                    continue;
                };
                allocations += 1;
                leaked_allocations += 1;
                let (index, is_new) = allocation_infos.add(size, TraceIndex(trace));
                if is_new {
                    writeln!(output, "a {:x} {:x}", size, trace)?;
                }
                pointers.add_pointer(ptr, index);
                last_ptr = ptr;
                writeln!(output, "+ {:x}", index)?;
            }
            b'-' => {
                let Some(ptr) = reader.read_hex() else {
                    log::warn!("failed to parse line: {}", reader.line());
                    continue;
                };
                let temporary = last_ptr == ptr;
                last_ptr = 0;
                let Some(index) = pointers.take_pointer(ptr) else {
                    // unknown pointer, happens when attached at runtime
                    continue;
                };
                writeln!(output, "- {:x}", index)?;
                if temporary {
                    temporary_allocations += 1;
                }
                leaked_allocations -= 1;
            }
            b'~' => {
                // realloc: free the old allocation and record the new one
                // as a single ownership transfer
                let (Some(size), Some(trace), Some(old_ptr), Some(new_ptr)) = (
                    reader.read_hex(),
                    reader.read_hex_u32(),
                    reader.read_hex(),
                    reader.read_hex(),
                ) else {
                    log::warn!("failed to parse line: {}", reader.line());
                    continue;
                };
                allocations += 1;
                last_ptr = 0;
                let (new_index, is_new) = allocation_infos.add(size, TraceIndex(trace));
                if is_new {
                    writeln!(output, "a {:x} {:x}", size, trace)?;
                }
                match pointers.take_pointer(old_ptr) {
                    Some(old_index) => {
                        pointers.add_pointer(new_ptr, new_index);
                        writeln!(output, "~ {:x} {:x}", old_index, new_index)?;
                    }
                    None => {
                        // the old side predates the trace; degrade to a
                        // plain allocation
                        leaked_allocations += 1;
                        pointers.add_pointer(new_ptr, new_index);
                        writeln!(output, "+ {:x}", new_index)?;
                    }
                }
            }
            _ => {
                writeln!(output, "{}", reader.line())?;
            }
        }
    }

    log::debug!(
        "heapscope stats: allocations {} leaked {} temporary {}",
        allocations,
        leaked_allocations,
        temporary_allocations
    );

    Ok(())
}
