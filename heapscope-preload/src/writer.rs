use std::io;

/// Buffer capacity equals the pipe-atomic write unit, so whole lines flushed
/// by concurrent writers never interleave on a pipe.
pub const BUFFER_CAPACITY: usize = 4096;

/// Buffered line writer over a raw file descriptor.
///
/// The stdio family is off limits here: `printf` and friends may allocate on
/// some C runtimes, and the hooks that feed this writer run inside the
/// allocator itself. Hex conversion is hand-rolled and the only syscall is a
/// single retry-on-EINTR `write` per flush.
pub struct LineWriter {
    fd: libc::c_int,
    len: usize,
    buf: Box<[u8; BUFFER_CAPACITY]>,
}

impl LineWriter {
    pub fn new(fd: libc::c_int) -> LineWriter {
        LineWriter {
            fd,
            len: 0,
            buf: Box::new([0u8; BUFFER_CAPACITY]),
        }
    }

    pub fn can_write(&self) -> bool {
        self.fd != -1
    }

    /// Append raw bytes, flushing first if they do not fit. Payloads larger
    /// than the whole buffer are written through directly.
    pub fn write_raw(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.available() {
            if !self.flush() {
                return false;
            }
            if bytes.len() > BUFFER_CAPACITY {
                return write_all(self.fd, bytes);
            }
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Append one lowercase hex number without leading zeros.
    pub fn write_hex(&mut self, value: u64) -> bool {
        if hex_len(value) > self.available() && !self.flush() {
            return false;
        }
        self.len += write_hex_into(&mut self.buf[self.len..], value);
        true
    }

    /// Emit `<tag> <h1> <h2> … \n` with space-separated lowercase hex fields.
    ///
    /// The worst case line must fit into an empty buffer; that bound is a
    /// compile-time property of the callers, not of the input data.
    pub fn write_hex_line(&mut self, tag: u8, args: &[u64]) -> bool {
        // tag + newline + per-arg separator and up to 16 hex chars
        let max_len = 2 + args.len() * 17;
        assert!(max_len <= BUFFER_CAPACITY, "line cannot fit into buffer");
        if max_len > self.available() && !self.flush() {
            return false;
        }

        let start = self.len;
        self.buf[self.len] = tag;
        self.len += 1;
        for &arg in args {
            self.buf[self.len] = b' ';
            self.len += 1;
            self.len += write_hex_into(&mut self.buf[self.len..], arg);
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
        debug_assert!(self.len - start <= max_len);
        true
    }

    pub fn flush(&mut self) -> bool {
        if !self.can_write() {
            return false;
        }
        if self.len == 0 {
            return true;
        }
        if !write_all(self.fd, &self.buf[..self.len]) {
            return false;
        }
        self.len = 0;
        true
    }

    pub fn close(&mut self) {
        if self.fd != -1 {
            self.flush();
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }

    /// Give up on the descriptor without closing it, e.g. after a write
    /// error on a descriptor we do not own.
    pub fn disable(&mut self) {
        self.fd = -1;
    }

    fn available(&self) -> usize {
        BUFFER_CAPACITY - self.len
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_all(fd: libc::c_int, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        let ret = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if ret < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return false;
        }
        bytes = &bytes[ret as usize..];
    }
    true
}

/// Number of hex digits needed for `value`, sized via the leading zero count.
fn hex_len(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        (64 - value.leading_zeros() as usize + 3) / 4
    }
}

/// Write `value` as lowercase hex into `out`, filling right-to-left.
/// Returns the number of bytes written.
fn write_hex_into(out: &mut [u8], mut value: u64) -> usize {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let len = hex_len(value);
    let mut pos = len;
    loop {
        pos -= 1;
        out[pos] = HEX_CHARS[(value % 16) as usize];
        value /= 16;
        if value == 0 {
            break;
        }
    }
    debug_assert_eq!(pos, 0);
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::unix::io::IntoRawFd;

    fn writer_to_tempfile() -> (LineWriter, File) {
        let file = tempfile::tempfile().expect("tempfile");
        let clone = file.try_clone().expect("clone");
        (LineWriter::new(file.into_raw_fd()), clone)
    }

    fn contents(mut file: &File) -> String {
        let mut out = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn hex_matches_format() {
        let mut buf = [0u8; 16];
        for value in [
            0u64,
            1,
            9,
            0xa,
            0x10,
            0xdeadbeef,
            0x123456789abcdef,
            u64::MAX,
        ] {
            let len = write_hex_into(&mut buf, value);
            assert_eq!(
                std::str::from_utf8(&buf[..len]).unwrap(),
                format!("{:x}", value)
            );
        }
    }

    #[test]
    fn hex_lines() {
        let (mut writer, file) = writer_to_tempfile();
        assert!(writer.write_hex_line(b't', &[0xdeadbeef, 0x0]));
        assert!(writer.write_hex_line(b'+', &[0x40, 0x1, 0x7fff12345678]));
        assert!(writer.flush());
        assert_eq!(contents(&file), "t deadbeef 0\n+ 40 1 7fff12345678\n");
    }

    #[test]
    fn raw_and_hex_interleaved() {
        let (mut writer, file) = writer_to_tempfile();
        assert!(writer.write_raw(b"m /lib/libc.so.6"));
        assert!(writer.write_raw(b" "));
        assert!(writer.write_hex(0x7f0000000000));
        assert!(writer.write_raw(b"\n"));
        assert!(writer.flush());
        assert_eq!(contents(&file), "m /lib/libc.so.6 7f0000000000\n");
    }

    #[test]
    fn flushes_when_full() {
        let (mut writer, file) = writer_to_tempfile();
        // each line is 19 bytes, so the buffer must flush at least once
        let line_count = BUFFER_CAPACITY / 19 + 2;
        for i in 0..line_count {
            assert!(writer.write_hex_line(b'c', &[0x1000000000000000 + i as u64]));
        }
        assert!(writer.flush());
        assert_eq!(contents(&file).lines().count(), line_count);
    }

    #[test]
    fn disabled_writer_rejects_writes() {
        let (mut writer, _file) = writer_to_tempfile();
        writer.disable();
        assert!(!writer.can_write());
        assert!(writer.write_raw(b"x")); // buffered
        assert!(!writer.flush());
    }
}
