
use super::*;

/// A finished compilation: the linked ELF image plus its vital statistics.
pub struct Output {
    pub elf: Vec<u8>,
    pub code_size: usize,
    pub data_size: usize,
    pub entry: u32,
}

/// The compile session. Owns the macro table and builtin address table;
/// every `compile` resets table state, so one session can compile several
/// inputs in sequence (never concurrently).
pub struct Compiler<'h> {
    host: &'h dyn Host,
    builtins: Builtins,
    pub macros: MacroTable,
    pub mode: PreprocessMode,
    pub failures: u32,
}

impl<'h> Compiler<'h> {
    pub fn new(host: &'h dyn Host) -> Compiler<'h> {
        Compiler {
            host,
            builtins: Builtins::new(),
            macros: MacroTable::new(),
            mode: PreprocessMode::Light,
            failures: 0,
        }
    }

    pub fn with_mode(mut self, mode: PreprocessMode) -> Compiler<'h> {
        self.mode = mode;
        self
    }

    pub fn with_builtins(mut self, builtins: Builtins) -> Compiler<'h> {
        self.builtins = builtins;
        self
    }

    fn phase_error(&self, what: &str) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} failed with {} diagnostics", what, self.failures),
        )
    }

    /// Runs the full pipeline over in-memory source: preprocess, parse and
    /// generate code, link call patches, build the ELF image. Later phases
    /// are skipped as soon as the failure count goes non-zero.
    pub fn compile(&mut self, source: &[u8]) -> Result<Output, std::io::Error> {
        self.failures = 0;
        self.macros.reset();

        if source.len() > SRC_MAX {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("source exceeds {} bytes", SRC_MAX),
            ));
        }

        log::debug!("stage preprocess: {} bytes", source.len());
        let mut pp = Preprocessor::new(&mut self.macros, self.host);
        let pre = pp.run(source, self.mode, PRE_MAX);
        self.failures += pp.failures;
        let Some(pre) = pre else {
            self.failures += 1;
            return Err(self.phase_error("preprocess"));
        };
        if self.failures > 0 {
            return Err(self.phase_error("preprocess"));
        }

        log::debug!("stage codegen: {} bytes", pre.len());
        let mut cg = CodeGen::new(&pre, &self.macros, &self.builtins, self.host);
        let ok = cg.run();
        self.failures += cg.failures;
        if !ok || self.failures > 0 {
            return Err(self.phase_error("codegen"));
        }
        let Some(entry_off) = cg.entry_off else {
            self.failures += 1;
            return Err(self.phase_error("codegen"));
        };

        let code = cg.code.into_bytes();
        let data = cg.data.into_bytes();
        log::debug!(
            "stage write: code={} data={} entry=0x{:x}",
            code.len(),
            data.len(),
            CODE_BASE + entry_off as u32
        );
        Ok(Output {
            elf: build_image(&code, &data, entry_off),
            code_size: code.len(),
            data_size: data.len(),
            entry: CODE_BASE + entry_off as u32,
        })
    }

    /// File-to-file compile. The output path is written only after a fully
    /// successful pipeline; a failing compile leaves no partial ELF behind.
    pub fn compile_file(&mut self, in_path: &str, out_path: &str) -> Result<Output, std::io::Error> {
        if !is_valid_path(in_path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bad input path",
            ));
        }
        if !is_valid_path(out_path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bad output path",
            ));
        }
        log::debug!("stage read: '{}'", in_path);
        let source = self.host.read_file(in_path, SRC_MAX)?;
        let output = self.compile(&source)?;
        self.host.write_file(out_path, &output.elf)?;
        log::info!(
            "compiled '{}' -> '{}' code={} entry=0x{:x}",
            in_path,
            out_path,
            output.code_size,
            output.entry
        );
        Ok(output)
    }
}

/// Derives the default output path: a `.cc` suffix becomes `.elf`, anything
/// else gains `.elf`.
pub fn default_out_path(in_path: &str) -> String {
    match in_path.strip_suffix(".cc") {
        Some(stem) => format!("{}.elf", stem),
        None => format!("{}.elf", in_path),
    }
}

/// Repairs a clipped `.el` suffix; a path already ending in `.elf` passes
/// through untouched.
pub fn fix_elf_suffix(path: &str) -> String {
    if path.ends_with(".elf") {
        return path.to_string();
    }
    if path.ends_with(".el") {
        return format!("{}f", path);
    }
    path.to_string()
}

/// Paths must be non-empty printable ASCII shorter than 128 bytes.
pub fn is_valid_path(p: &str) -> bool {
    !p.is_empty() && p.len() < 127 && p.bytes().all(|b| (32..=126).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_out_path_swaps_the_suffix() {
        assert_eq!(default_out_path("prog.cc"), "prog.elf");
        assert_eq!(default_out_path("/bin/tool.cc"), "/bin/tool.elf");
        assert_eq!(default_out_path("notes.txt"), "notes.txt.elf");
    }

    #[test]
    fn elf_suffix_repair() {
        assert_eq!(fix_elf_suffix("a.elf"), "a.elf");
        assert_eq!(fix_elf_suffix("a.el"), "a.elf");
        assert_eq!(fix_elf_suffix("a.cc"), "a.cc");
    }

    #[test]
    fn path_validation() {
        assert!(is_valid_path("/bin/cc2.elf"));
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("bad\npath"));
        assert!(!is_valid_path(&"x".repeat(127)));
    }

    #[test]
    fn oversized_source_is_rejected_at_the_boundary() {
        let host = OsHost;
        let mut compiler = Compiler::new(&host);
        let pad = " ".repeat(SRC_MAX - "int main(){ return 0; }".len());
        let exact = format!("int main(){{ return 0; }}{}", pad);
        assert_eq!(exact.len(), SRC_MAX);
        assert!(compiler.compile(exact.as_bytes()).is_ok());
        let over = format!("{} ", exact);
        assert!(compiler.compile(over.as_bytes()).is_err());
    }
}
