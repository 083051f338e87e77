mod compiler;

pub use compiler::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemHost {
        files: RefCell<HashMap<String, Vec<u8>>>,
    }

    impl MemHost {
        fn new() -> MemHost {
            MemHost {
                files: RefCell::new(HashMap::new()),
            }
        }

        fn put(&self, path: &str, bytes: &[u8]) {
            self.files.borrow_mut().insert(path.to_string(), bytes.to_vec());
        }

        fn get(&self, path: &str) -> Option<Vec<u8>> {
            self.files.borrow().get(path).cloned()
        }
    }

    impl Host for MemHost {
        fn read_file(&self, path: &str, max: usize) -> Result<Vec<u8>, std::io::Error> {
            match self.files.borrow().get(path) {
                Some(data) => Ok(data[..data.len().min(max + 1)].to_vec()),
                None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file")),
            }
        }

        fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), std::io::Error> {
            self.put(path, bytes);
            Ok(())
        }
    }

    fn compile(src: &str) -> Result<Output, std::io::Error> {
        Compiler::new(&OsHost).compile(src.as_bytes())
    }

    #[test]
    fn compiles_hello() {
        let out = compile("int main(){ print(\"hi\"); return 0; }").unwrap();
        let hdr = ElfHeader::from(&out.elf).unwrap();
        assert_eq!(hdr.entry, out.entry);
        assert_eq!(hdr.entry, CODE_BASE); // main is the first function
        assert_eq!(hdr.phnum, 1); // literal fast path leaves the data segment empty
        assert!(out.code_size > 0);
    }

    #[test]
    fn call_sites_carry_resolved_rel32() {
        let out = compile("int three(){ return 3; } int main(){ return three(); }").unwrap();
        // three(): prologue (9) + mov eax,3 (5) + two epilogues (8) = 22
        // bytes; main's call follows its own 9-byte prologue.
        let call = 128 + 22 + 9;
        assert_eq!(out.elf[call], 0xE8);
        let rel = i32::from_le_bytes(out.elf[call + 1..call + 5].try_into().unwrap());
        let site = call + 1 - 128;
        assert_eq!(0i64, site as i64 + 4 + rel as i64); // target is offset 0
    }

    #[test]
    fn recursion_compiles_with_self_calls() {
        let out = compile(
            "int f(int n){ if(n<2) return n; return f(n-1)+f(n-2); } int main(){ return f(10); }",
        )
        .unwrap();
        assert!(out.code_size > 0);
        // f precedes main, so the entry point is past f's prologue.
        assert!(out.entry > CODE_BASE);
    }

    #[test]
    fn loops_and_break_compile() {
        let out = compile(
            "int main(){ int s=0; for(int i=0;i<10;i++){ if(i==5) break; s+=i; } return s; }",
        )
        .unwrap();
        assert!(out.code_size > 0);
    }

    #[test]
    fn struct_pointers_flatten_and_pass() {
        let src = "struct P{int x; int y;};\n\
                   struct P q;\n\
                   int sum(struct P *p){ return p.x + p.y; }\n\
                   int main(){ q.x = 3; q.y = 4; return sum(&q); }";
        let out = compile(src).unwrap();
        // q flattens to 8 bytes of data plus two alias entries.
        assert_eq!(out.data_size, 8);
        assert_eq!(ElfHeader::from(&out.elf).unwrap().phnum, 2);
    }

    #[test]
    fn function_like_macros_expand_in_full_mode() {
        let src = "#define MAX(a, b) ((a)>(b)?(a):(b))\nint main(){ return MAX(3, 7); }";
        let out = Compiler::new(&OsHost)
            .with_mode(PreprocessMode::Full)
            .compile(src.as_bytes())
            .unwrap();
        assert!(out.code_size > 0);
    }

    #[test]
    fn recompilation_is_deterministic() {
        let src = "int g; int inc(){ g += 1; return g; } int main(){ inc(); return inc(); }";
        let a = compile(src).unwrap();
        let b = compile(src).unwrap();
        assert_eq!(a.elf, b.elf);
    }

    #[test]
    fn unresolved_calls_abort_without_output() {
        let host = MemHost::new();
        host.put("bad.cc", b"int main(){ missing(); return 0; }");
        let mut compiler = Compiler::new(&host);
        assert!(compiler.compile_file("bad.cc", "bad.elf").is_err());
        assert!(host.get("bad.elf").is_none());
        assert!(compiler.failures > 0);
    }

    #[test]
    fn missing_main_is_fatal() {
        assert!(compile("int helper(){ return 1; }").is_err());
    }

    #[test]
    fn compile_file_writes_the_elf() {
        let host = MemHost::new();
        host.put("ok.cc", b"int main(){ return 7; }");
        let mut compiler = Compiler::new(&host);
        let out = compiler.compile_file("ok.cc", "ok.elf").unwrap();
        assert_eq!(host.get("ok.elf").unwrap(), out.elf);
    }

    #[test]
    fn local_capacity_boundary() {
        let mut body = String::new();
        for i in 0..MAX_LOCALS {
            body.push_str(&format!("int v{};\n", i));
        }
        let full = format!("int main(){{\n{}return 0;\n}}\n", body);
        assert!(compile(&full).is_ok());

        let over = format!("int main(){{\n{}int v{};\nreturn 0;\n}}\n", body, MAX_LOCALS);
        assert!(compile(&over).is_err());
    }

    #[test]
    fn globals_land_in_the_data_segment() {
        let src = "int counter; char tag[8]; int main(){ counter = 5; tag[0] = 'x'; return counter; }";
        let out = compile(src).unwrap();
        assert_eq!(out.data_size, 12); // 4-byte word + 8-byte byte array
        let data_ph = ProgramHeader::from(&out.elf[84..116]).unwrap();
        assert_eq!(data_ph.vaddr, DATA_BASE);
        assert_eq!(data_ph.size, 12);
    }

    #[test]
    fn string_literals_are_nul_terminated_data() {
        let src = "int main(){ int s = \"ab\"; return s; }";
        let out = compile(src).unwrap();
        assert_eq!(out.data_size, 3);
        let data_off = (128 + out.code_size + 3) & !3;
        assert_eq!(&out.elf[data_off..data_off + 3], b"ab\0");
    }
}
