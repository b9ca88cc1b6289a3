//! The preload launcher: run a command with the tracer library preloaded,
//! stream its raw trace through the interpret pass and gzip the result.
//!
//! The tracer writes into a FIFO so the raw stream never hits the disk;
//! this process sits on the read side and interprets on the fly:
//!
//! ```text
//!   traced child --raw--> fifo --interpret--> gzip --> heapscope.PID.gz
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::interpret;

/// A configuration bundle for the launcher.
pub struct Config {
    /// Where to write the interpreted, gzipped trace. `$$` expands to the
    /// child's PID; the default is `heapscope.<pid>.gz`.
    pub out_path: Option<String>,
    /// Pass tracer diagnostics through to stderr.
    pub debug: bool,
    /// The command to run under the tracer.
    pub command: Vec<String>,
}

/// Run `config.command` with the tracer preloaded and record its heap
/// profile. Returns the child's exit code.
pub fn record(config: Config) -> Result<i32> {
    let program = config
        .command
        .first()
        .ok_or_else(|| anyhow!("no command to record"))?;

    let preload_lib = find_preload_library()?;
    log::debug!("preloading {}", preload_lib.display());

    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
    let fifo_path = scratch.path().join("heapscope_fifo");
    nix::unistd::mkfifo(
        &fifo_path,
        nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
    )
    .context("Failed to create trace fifo")?;

    let mut child = Command::new(program)
        .args(&config.command[1..])
        .env("LD_PRELOAD", &preload_lib)
        .env("HEAPSCOPE_OUTPUT", &fifo_path)
        .envs(config.debug.then_some(("HEAPSCOPE_DEBUG", "1")))
        .spawn()
        .with_context(|| format!("Failed to run {}", program))?;

    let out_path = output_path(config.out_path.as_deref(), child.id());
    eprintln!("heapscope output will be written to {}", out_path.display());

    // a second interrupt is forwarded to us as well; the child owns the
    // terminal, we just keep draining until it exits
    ctrlc::set_handler(|| {
        eprintln!("heapscope: waiting for the traced process to exit");
    })
    .context("Error setting Ctrl-C handler")?;

    // blocks until the tracer in the child opens the write side
    let fifo = File::open(&fifo_path).context("Failed to open trace fifo")?;
    let mut raw = BufReader::new(fifo);

    let out_file = File::create(&out_path)
        .with_context(|| format!("Failed to create output file {}", out_path.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(out_file), Compression::default());
    interpret::run(&mut raw, &mut encoder).context("Failed to interpret the trace stream")?;
    encoder
        .finish()
        .context("Failed to finish the compressed output")?
        .into_inner()
        .context("Failed to flush the output file")?;

    let status = child.wait().context("Failed to wait for the child")?;
    eprintln!(
        "Heap profile of PID {} written to {}",
        child.id(),
        out_path.display()
    );

    Ok(exit_code(status))
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

fn output_path(template: Option<&str>, pid: u32) -> PathBuf {
    match template {
        Some(template) => PathBuf::from(template.replace("$$", &pid.to_string())),
        None => PathBuf::from(format!("heapscope.{}.gz", pid)),
    }
}

/// Locate the preload library: an explicit override via
/// `HEAPSCOPE_PRELOAD_LIB`, or next to this executable the way cargo and
/// the install layout place it.
fn find_preload_library() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("HEAPSCOPE_PRELOAD_LIB") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        bail!(
            "HEAPSCOPE_PRELOAD_LIB points at {}, which does not exist",
            path.display()
        );
    }

    let exe = std::env::current_exe().context("Failed to locate this executable")?;
    let exe_dir = exe.parent().unwrap_or(Path::new("."));
    let candidates = [
        exe_dir.join("libheapscope_preload.so"),
        exe_dir.join("../lib/libheapscope_preload.so"),
        exe_dir.join("../../target/release/libheapscope_preload.so"),
    ];
    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }
    bail!(
        "could not find libheapscope_preload.so next to {}; \
         set HEAPSCOPE_PRELOAD_LIB to its location",
        exe.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_expands_pid() {
        assert_eq!(
            output_path(Some("trace.$$.gz"), 1234),
            PathBuf::from("trace.1234.gz")
        );
        assert_eq!(
            output_path(Some("fixed.gz"), 1234),
            PathBuf::from("fixed.gz")
        );
        assert_eq!(output_path(None, 42), PathBuf::from("heapscope.42.gz"));
    }

    #[test]
    fn preload_override_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libheapscope_preload.so");
        std::fs::write(&lib, b"").unwrap();

        std::env::set_var("HEAPSCOPE_PRELOAD_LIB", &lib);
        assert_eq!(find_preload_library().unwrap(), lib);

        std::env::set_var("HEAPSCOPE_PRELOAD_LIB", dir.path().join("missing.so"));
        assert!(find_preload_library().is_err());
        std::env::remove_var("HEAPSCOPE_PRELOAD_LIB");
    }
}
