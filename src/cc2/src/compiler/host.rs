
use std::fs::File;
use std::io::{Read, Write};

/// Open flags of the host VFS, exposed to compiled programs by name.
pub const O_RDONLY: i32 = 0x0000;
pub const O_WRONLY: i32 = 0x0001;
pub const O_CREAT: i32 = 0x0100;
pub const O_TRUNC: i32 = 0x0200;

pub fn flag_const(name: &str) -> Option<i32> {
    match name {
        "O_RDONLY" => Some(O_RDONLY),
        "O_WRONLY" => Some(O_WRONLY),
        "O_CREAT" => Some(O_CREAT),
        "O_TRUNC" => Some(O_TRUNC),
        _ => None,
    }
}

/// The narrow platform interface the compiler consumes. File access is
/// synchronous; `yield_now` is the cooperative hook invoked every few
/// thousand lex/parse iterations so the host can schedule other work.
pub trait Host {
    /// Reads at most `max` bytes of `path`.
    fn read_file(&self, path: &str, max: usize) -> Result<Vec<u8>, std::io::Error>;

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), std::io::Error>;

    fn yield_now(&self) {}
}

/// Host backed by the operating system's filesystem and scheduler.
pub struct OsHost;

impl Host for OsHost {
    fn read_file(&self, path: &str, max: usize) -> Result<Vec<u8>, std::io::Error> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        std::io::Read::by_ref(&mut file).take(max as u64 + 1).read_to_end(&mut data)?;
        Ok(data)
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), std::io::Error> {
        let mut file = File::create(path)?;
        file.write_all(bytes)
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Entry thunks exported by the host kernel's vector page. Their absolute
/// 32-bit addresses are embedded into `call` instructions, so this table is
/// the ABI emitted programs depend on at run time.
static BUILTIN_VECTORS: &[(&str, u32)] = &[
    ("serial_printf", 0x0010_0400),
    ("print", 0x0010_0420),
    ("println", 0x0010_0440),
    ("putchar", 0x0010_0460),
    ("yield", 0x0010_0480),
    ("kmalloc", 0x0010_04a0),
    ("kfree", 0x0010_04c0),
    ("vfs_open", 0x0010_04e0),
    ("vfs_close", 0x0010_0500),
    ("vfs_read", 0x0010_0520),
    ("vfs_write", 0x0010_0540),
    ("vfs_seek", 0x0010_0560),
    ("get_args", 0x0010_0580),
];

/// Builtin-function address table; the final fallback of name lookup.
pub struct Builtins {
    entries: Vec<(String, u32)>,
}

impl Builtins {
    pub fn new() -> Builtins {
        Builtins {
            entries: BUILTIN_VECTORS
                .iter()
                .map(|(name, addr)| (name.to_string(), *addr))
                .collect(),
        }
    }

    pub fn empty() -> Builtins {
        Builtins { entries: Vec::new() }
    }

    pub fn with_entry(mut self, name: &str, addr: u32) -> Builtins {
        self.entries.push((name.to_string(), addr));
        self
    }

    pub fn addr(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, addr)| *addr)
    }
}

impl Default for Builtins {
    fn default() -> Builtins {
        Builtins::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_resolves_the_abi_names() {
        let b = Builtins::new();
        assert!(b.addr("putchar").is_some());
        assert!(b.addr("vfs_seek").is_some());
        assert_eq!(b.addr("not_a_builtin"), None);
    }

    #[test]
    fn custom_entries_extend_the_table() {
        let b = Builtins::empty().with_entry("blit", 0xdead_0000);
        assert_eq!(b.addr("blit"), Some(0xdead_0000));
        assert_eq!(b.addr("putchar"), None);
    }

    #[test]
    fn open_flags_resolve() {
        assert_eq!(flag_const("O_CREAT"), Some(0x100));
        assert_eq!(flag_const("O_APPEND"), None);
    }
}
