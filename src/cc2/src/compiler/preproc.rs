
use super::*;

/// Sentinel bytes that encode parameter references inside a function-like
/// macro body. Substitution happens at definition time, so expansion is a
/// single pass over the stored body.
pub const PARAM_SENTINEL_0: u8 = 0x01;
pub const PARAM_SENTINEL_1: u8 = 0x02;

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub name: String,
    /// Body text, sentinel-encoded for function-like macros.
    pub body: Vec<u8>,
    pub is_function: bool,
    pub param_count: usize,
}

/// Fixed-capacity macro table shared by both preprocessor modes and by the
/// compile-time constant folder.
pub struct MacroTable {
    defs: Vec<MacroDef>,
}

impl MacroTable {
    pub fn new() -> MacroTable {
        MacroTable { defs: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.defs.clear();
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.defs.iter().position(|d| d.name == name)
    }

    pub fn get(&self, idx: usize) -> &MacroDef {
        &self.defs[idx]
    }

    /// Defines an object-like macro, replacing any existing definition of
    /// the same name. Past capacity the definition is silently dropped.
    pub fn set(&mut self, name: &str, body: &[u8]) {
        self.set_with(name, body, false, 0);
    }

    pub fn set_with(&mut self, name: &str, body: &[u8], is_function: bool, param_count: usize) {
        let name = clamp(name.as_bytes(), PP_NAME_MAX - 1);
        let name = String::from_utf8_lossy(&name).into_owned();
        let body = clamp(body, PP_BODY_MAX - 1);
        match self.find(&name) {
            Some(idx) => {
                self.defs[idx].body = body;
                self.defs[idx].is_function = is_function;
                self.defs[idx].param_count = param_count;
            }
            None => {
                if self.defs.len() >= PP_MAX_DEFINES {
                    return;
                }
                self.defs.push(MacroDef {
                    name,
                    body,
                    is_function,
                    param_count,
                });
            }
        }
    }
}

impl Default for MacroTable {
    fn default() -> MacroTable {
        MacroTable::new()
    }
}

fn clamp(bytes: &[u8], max: usize) -> Vec<u8> {
    bytes[..bytes.len().min(max)].to_vec()
}

fn trim(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = bytes.len();
    while start < end && matches!(bytes[start], b' ' | b'\t' | b'\r' | b'\n') {
        start += 1;
    }
    while end > start && matches!(bytes[end - 1], b' ' | b'\t' | b'\r' | b'\n') {
        end -= 1;
    }
    &bytes[start..end]
}

/// Which preprocessor to run; selected at call time. Lightweight is the
/// default and the mode the compiler uses on its own sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessMode {
    Light,
    Full,
}

/// Line-oriented, comment-preserving preprocessor over flat byte buffers.
pub struct Preprocessor<'a> {
    macros: &'a mut MacroTable,
    host: &'a dyn Host,
    pub failures: u32,
}

impl<'a> Preprocessor<'a> {
    pub fn new(macros: &'a mut MacroTable, host: &'a dyn Host) -> Preprocessor<'a> {
        Preprocessor {
            macros,
            host,
            failures: 0,
        }
    }

    pub fn run(&mut self, src: &[u8], mode: PreprocessMode, out_max: usize) -> Option<Vec<u8>> {
        match mode {
            PreprocessMode::Light => self.light(src, out_max),
            PreprocessMode::Full => {
                let mut out = Vec::new();
                if self.full_inner(src, &mut out, out_max, 0) {
                    Some(out)
                } else {
                    None
                }
            }
        }
    }

    fn emit(out: &mut Vec<u8>, out_max: usize, c: u8) -> bool {
        if out.len() >= out_max - 1 {
            return false;
        }
        out.push(c);
        true
    }

    fn emit_all(out: &mut Vec<u8>, out_max: usize, text: &[u8]) -> bool {
        text.iter().all(|&c| Self::emit(out, out_max, c))
    }

    /// Copies a quoted literal verbatim, honouring backslash escapes so a
    /// quote inside the literal does not end it.
    fn copy_literal(src: &[u8], i: &mut usize, quote: u8, out: &mut Vec<u8>, out_max: usize) -> bool {
        if !Self::emit(out, out_max, src[*i]) {
            return false;
        }
        *i += 1;
        while *i < src.len() {
            let c = src[*i];
            if !Self::emit(out, out_max, c) {
                return false;
            }
            *i += 1;
            if c == b'\\' && *i < src.len() {
                if !Self::emit(out, out_max, src[*i]) {
                    return false;
                }
                *i += 1;
                continue;
            }
            if c == quote {
                break;
            }
        }
        true
    }

    fn read_ident(src: &[u8], mut i: usize, max: usize) -> (usize, Vec<u8>) {
        let mut name = Vec::new();
        while i < src.len() && ident_body(src[i]) {
            if name.len() < max - 1 {
                name.push(src[i]);
            }
            i += 1;
        }
        (i, name)
    }

    fn skip_blanks(src: &[u8], mut i: usize) -> usize {
        while i < src.len() && (src[i] == b' ' || src[i] == b'\t') {
            i += 1;
        }
        i
    }

    /// Lightweight mode: object-like `#define` only, comments left in place
    /// for the lexer, literals copied verbatim, whole-identifier macro
    /// substitution. Other directives are consumed, keeping the newline.
    pub fn light(&mut self, src: &[u8], out_max: usize) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut i = 0;
        let mut line_start = true;
        while i < src.len() {
            let c = src[i];
            if line_start && c == b'#' {
                i = Self::skip_blanks(src, i + 1);
                if src[i..].starts_with(b"define")
                    && (i + 6 == src.len() || src[i + 6] == b' ' || src[i + 6] == b'\t')
                {
                    i = Self::skip_blanks(src, i + 6);
                    let (next, name) = Self::read_ident(src, i, PP_NAME_MAX);
                    i = next;
                    if !name.is_empty() && src.get(i) != Some(&b'(') {
                        i = Self::skip_blanks(src, i);
                        let mut body = Vec::new();
                        while i < src.len() && src[i] != b'\n' {
                            if body.len() < PP_BODY_MAX - 1 {
                                body.push(src[i]);
                            }
                            i += 1;
                        }
                        let name = String::from_utf8_lossy(&name).into_owned();
                        self.macros.set(&name, trim(&body));
                    } else {
                        while i < src.len() && src[i] != b'\n' {
                            i += 1;
                        }
                    }
                } else {
                    while i < src.len() && src[i] != b'\n' {
                        i += 1;
                    }
                }
                if i < src.len() && src[i] == b'\n' {
                    if !Self::emit(&mut out, out_max, b'\n') {
                        return None;
                    }
                    i += 1;
                }
                line_start = true;
                continue;
            }
            if c == b'"' || c == b'\'' {
                if !Self::copy_literal(src, &mut i, c, &mut out, out_max) {
                    return None;
                }
                line_start = false;
                continue;
            }
            if c == b'/' && src.get(i + 1) == Some(&b'/') {
                while i < src.len() && src[i] != b'\n' {
                    if !Self::emit(&mut out, out_max, src[i]) {
                        return None;
                    }
                    i += 1;
                }
                line_start = false;
                continue;
            }
            if c == b'/' && src.get(i + 1) == Some(&b'*') {
                if !Self::emit_all(&mut out, out_max, b"/*") {
                    return None;
                }
                i += 2;
                while i + 1 < src.len() {
                    if !Self::emit(&mut out, out_max, src[i]) {
                        return None;
                    }
                    if src[i] == b'*' && src[i + 1] == b'/' {
                        i += 1;
                        if !Self::emit(&mut out, out_max, src[i]) {
                            return None;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                line_start = false;
                continue;
            }
            if ident_start(c) {
                let (next, name) = Self::read_ident(src, i, PP_NAME_MAX);
                let name = String::from_utf8_lossy(&name).into_owned();
                if let Some(idx) = self.macros.find(&name) {
                    let def = self.macros.get(idx);
                    if !def.is_function {
                        let body = def.body.clone();
                        if !Self::emit_all(&mut out, out_max, &body) {
                            return None;
                        }
                        i = next;
                        line_start = false;
                        continue;
                    }
                }
                if !Self::emit_all(&mut out, out_max, &src[i..next]) {
                    return None;
                }
                i = next;
                line_start = false;
                continue;
            }
            if !Self::emit(&mut out, out_max, c) {
                return None;
            }
            line_start = c == b'\n';
            i += 1;
        }
        Some(out)
    }

    /// Full mode: adds function-like macros, depth-1 `#include "path"` and
    /// the `#ifndef/#else/#endif` conditional stack.
    fn full_inner(&mut self, src: &[u8], out: &mut Vec<u8>, out_max: usize, depth: usize) -> bool {
        let mut i = 0;
        let mut guard: u64 = 0;
        let mut line_start = true;
        let mut conds: Vec<CondFrame> = Vec::new();

        while i < src.len() {
            guard += 1;
            if guard > GUARD_MAX {
                log::error!(
                    "preprocess watchdog tripped: depth={} src_len={} i={}",
                    depth,
                    src.len(),
                    i
                );
                self.failures += 1;
                return false;
            }
            if guard % YIELD_INTERVAL == 0 {
                self.host.yield_now();
            }
            let skip_now = conds.iter().any(|c| c.skip);

            if line_start && src[i] == b'#' {
                let p = Self::skip_blanks(src, i + 1);
                let (p, dir) = Self::read_ident(src, p, 16);
                match dir.as_slice() {
                    b"define" if !skip_now => self.full_define(src, p),
                    b"ifndef" => {
                        let p = Self::skip_blanks(src, p);
                        let (_, name) = Self::read_ident(src, p, PP_NAME_MAX);
                        let name = String::from_utf8_lossy(&name).into_owned();
                        if conds.len() < PP_COND_MAX {
                            let defined = self.macros.find(&name).is_some();
                            conds.push(CondFrame::open(skip_now, defined));
                        }
                    }
                    b"else" => {
                        if let Some(top) = conds.last_mut() {
                            top.flip();
                        }
                    }
                    b"endif" => {
                        conds.pop();
                    }
                    b"include" if !skip_now => {
                        self.full_include(src, p, out, out_max, depth);
                    }
                    b"undef" if !skip_now => {
                        let p = Self::skip_blanks(src, p);
                        let (_, name) = Self::read_ident(src, p, PP_NAME_MAX);
                        let name = String::from_utf8_lossy(&name).into_owned();
                        if let Some(idx) = self.macros.find(&name) {
                            self.macros.defs.remove(idx);
                        }
                    }
                    _ => {}
                }
                while i < src.len() && src[i] != b'\n' {
                    i += 1;
                }
                if i < src.len() && src[i] == b'\n' {
                    if !Self::emit(out, out_max, b'\n') {
                        return false;
                    }
                    i += 1;
                }
                line_start = true;
                continue;
            }

            if skip_now {
                line_start = src[i] == b'\n';
                i += 1;
                continue;
            }

            if src[i] == b'"' || src[i] == b'\'' {
                let quote = src[i];
                if !Self::copy_literal(src, &mut i, quote, out, out_max) {
                    return false;
                }
                line_start = false;
                continue;
            }

            if ident_start(src[i]) {
                if !self.full_ident(src, &mut i, out, out_max) {
                    return false;
                }
                line_start = false;
                continue;
            }

            if !Self::emit(out, out_max, src[i]) {
                return false;
            }
            line_start = src[i] == b'\n';
            i += 1;
        }
        true
    }

    fn full_define(&mut self, src: &[u8], p: usize) {
        let p = Self::skip_blanks(src, p);
        let (mut p, name) = Self::read_ident(src, p, PP_NAME_MAX);
        let name = String::from_utf8_lossy(&name).into_owned();
        let mut params: Vec<Vec<u8>> = Vec::new();
        let mut is_function = false;
        if src.get(p) == Some(&b'(') {
            is_function = true;
            p += 1;
            while p < src.len() && src[p] != b')' && src[p] != b'\n' {
                p = Self::skip_blanks(src, p);
                let (next, pname) = Self::read_ident(src, p, PP_PARAM_NAME_MAX);
                p = next;
                if !pname.is_empty() && params.len() < PP_PARAM_MAX {
                    params.push(pname);
                }
                p = Self::skip_blanks(src, p);
                if src.get(p) == Some(&b',') {
                    p += 1;
                }
            }
            if src.get(p) == Some(&b')') {
                p += 1;
            }
        }
        let mut p = Self::skip_blanks(src, p);
        let mut body = Vec::new();
        while p < src.len() && src[p] != b'\n' && src[p] != b'\r' {
            if body.len() < PP_BODY_MAX - 1 {
                body.push(src[p]);
            }
            p += 1;
        }
        while body.last() == Some(&b' ') || body.last() == Some(&b'\t') {
            body.pop();
        }
        if name.is_empty() {
            return;
        }
        if is_function && !params.is_empty() && params.len() <= 2 {
            let encoded = encode_params(&body, &params);
            self.macros.set_with(&name, &encoded, true, params.len());
        } else {
            self.macros.set_with(&name, &body, is_function, params.len());
        }
    }

    fn full_include(&mut self, src: &[u8], p: usize, out: &mut Vec<u8>, out_max: usize, depth: usize) {
        let mut p = Self::skip_blanks(src, p);
        if src.get(p) == Some(&b'"') {
            p += 1;
        }
        let mut path = String::new();
        while p < src.len() && src[p] != b'"' && src[p] != b'\n' && path.len() < 127 {
            path.push(src[p] as char);
            p += 1;
        }
        if path.is_empty() {
            return;
        }
        if depth >= PP_INCLUDE_DEPTH_MAX {
            log::error!("include depth limit reached: {}", path);
            self.failures += 1;
            return;
        }
        match self.host.read_file(&path, PP_FILE_MAX) {
            Ok(data) => {
                // An overflow in the included body surfaces on the caller's
                // side through the shared output cursor.
                if !self.full_inner(&data, out, out_max, depth + 1) {
                    self.failures += 1;
                }
            }
            Err(err) => {
                log::error!("include open failed: {}: {}", path, err);
                self.failures += 1;
            }
        }
    }

    fn full_ident(&mut self, src: &[u8], i: &mut usize, out: &mut Vec<u8>, out_max: usize) -> bool {
        let (j, name) = Self::read_ident(src, *i, PP_NAME_MAX);
        let name = String::from_utf8_lossy(&name).into_owned();
        let Some(idx) = self.macros.find(&name) else {
            if !Self::emit_all(out, out_max, &src[*i..j]) {
                return false;
            }
            *i = j;
            return true;
        };
        let def = self.macros.get(idx);
        if !def.is_function {
            let body = def.body.clone();
            if !Self::emit_all(out, out_max, &body) {
                return false;
            }
            *i = j;
            return true;
        }

        // Function-like expansion: one or two comma-separated argument
        // substrings, no nested parenthesis accounting. Arguments must be
        // simple; anything else leaves the identifier untouched.
        let body = def.body.clone();
        let param_count = def.param_count;
        let mut p = Self::skip_blanks(src, j);
        let mut args: Vec<&[u8]> = Vec::new();
        let mut expand_ok = src.get(p) == Some(&b'(') && param_count <= 2;
        if expand_ok {
            p += 1;
            let a0s = Self::skip_blanks(src, p);
            let mut q = a0s;
            while q < src.len() && src[q] != b',' && src[q] != b')' {
                q += 1;
            }
            args.push(trim(&src[a0s..q]));
            if src.get(q) == Some(&b',') {
                let a1s = Self::skip_blanks(src, q + 1);
                q = a1s;
                while q < src.len() && src[q] != b')' {
                    q += 1;
                }
                args.push(trim(&src[a1s..q]));
            }
            if src.get(q) == Some(&b')') {
                p = q + 1;
            } else {
                expand_ok = false;
            }
        }
        if !expand_ok {
            if !Self::emit_all(out, out_max, &src[*i..j]) {
                return false;
            }
            *i = j;
            return true;
        }
        for &b in &body {
            let substituted: &[u8] = match b {
                PARAM_SENTINEL_0 if !args.is_empty() => args[0],
                PARAM_SENTINEL_1 if args.len() > 1 => args[1],
                _ => {
                    if !Self::emit(out, out_max, b) {
                        return false;
                    }
                    continue;
                }
            };
            if !Self::emit_all(out, out_max, substituted) {
                return false;
            }
        }
        *i = p;
        true
    }
}

#[derive(Debug)]
struct CondFrame {
    skip: bool,
    taken: bool,
    parent_skip: bool,
}

impl CondFrame {
    fn open(parent_skip: bool, name_defined: bool) -> CondFrame {
        if parent_skip || name_defined {
            CondFrame {
                skip: true,
                taken: false,
                parent_skip,
            }
        } else {
            CondFrame {
                skip: false,
                taken: true,
                parent_skip,
            }
        }
    }

    /// `#else` flips once per block; a skipping parent wins regardless.
    fn flip(&mut self) {
        if self.parent_skip || self.taken {
            self.skip = true;
        } else {
            self.skip = false;
            self.taken = true;
        }
    }
}

/// Replaces exact-name parameter references inside a macro body with the
/// sentinel bytes, scanning identifier-wise.
fn encode_params(body: &[u8], params: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < body.len() && out.len() < PP_BODY_MAX - 1 {
        if ident_start(body[i]) {
            let mut j = i;
            while j < body.len() && ident_body(body[j]) {
                j += 1;
            }
            let tok = &body[i..j];
            match params.iter().position(|p| p.as_slice() == tok) {
                Some(0) => out.push(PARAM_SENTINEL_0),
                Some(1) => out.push(PARAM_SENTINEL_1),
                _ => out.extend_from_slice(tok),
            }
            i = j;
            continue;
        }
        out.push(body[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFiles;
    impl Host for NoFiles {
        fn read_file(&self, _path: &str, _max: usize) -> Result<Vec<u8>, std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no files"))
        }
        fn write_file(&self, _path: &str, _bytes: &[u8]) -> Result<(), std::io::Error> {
            Ok(())
        }
    }

    struct OneFile(&'static str, &'static [u8]);
    impl Host for OneFile {
        fn read_file(&self, path: &str, _max: usize) -> Result<Vec<u8>, std::io::Error> {
            if path == self.0 {
                Ok(self.1.to_vec())
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
            }
        }
        fn write_file(&self, _path: &str, _bytes: &[u8]) -> Result<(), std::io::Error> {
            Ok(())
        }
    }

    fn light(src: &str) -> String {
        let mut table = MacroTable::new();
        let mut pp = Preprocessor::new(&mut table, &NoFiles);
        String::from_utf8(pp.light(src.as_bytes(), PRE_MAX).unwrap()).unwrap()
    }

    fn full(src: &str) -> String {
        full_with(src, &NoFiles)
    }

    fn full_with(src: &str, host: &dyn Host) -> String {
        let mut table = MacroTable::new();
        let mut pp = Preprocessor::new(&mut table, host);
        String::from_utf8(pp.run(src.as_bytes(), PreprocessMode::Full, PRE_MAX).unwrap()).unwrap()
    }

    #[test]
    fn light_substitutes_object_macros() {
        assert_eq!(light("#define N 4\nint x = N;\n"), "\nint x = N;\n".replace('N', "4"));
    }

    #[test]
    fn light_is_identity_without_directives() {
        let src = "int x = 1; /* keep */ // also kept\nchar *s = \"# not a directive\";\n";
        assert_eq!(light(src), src);
    }

    #[test]
    fn light_leaves_literals_alone() {
        let out = light("#define A 9\nchar *s = \"A 'A'\"; int c = 'A'; int v = A;\n");
        assert_eq!(out, "\nchar *s = \"A 'A'\"; int c = 'A'; int v = 9;\n");
    }

    #[test]
    fn light_matches_whole_identifiers_only() {
        let out = light("#define N 4\nint NN = N;\n");
        assert_eq!(out, "\nint NN = 4;\n");
    }

    #[test]
    fn light_ignores_other_directives() {
        let out = light("#ifndef X\nint a;\n#endif\n");
        assert_eq!(out, "\nint a;\n\n");
    }

    #[test]
    fn redefinition_replaces_in_place() {
        let mut table = MacroTable::new();
        table.set("A", b"1");
        table.set("B", b"2");
        table.set("A", b"3");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(table.find("A").unwrap()).body, b"3");
    }

    #[test]
    fn full_expands_function_like_macros() {
        let out = full("#define MAX(a, b) ((a)>(b)?(a):(b))\nreturn MAX(3, 7);\n");
        assert_eq!(out, "\nreturn ((3)>(7)?(3):(7));\n");
    }

    #[test]
    fn full_encodes_params_at_definition() {
        let mut table = MacroTable::new();
        let mut pp = Preprocessor::new(&mut table, &NoFiles);
        pp.run(b"#define PAIR(x, y) x + y + xy\n", PreprocessMode::Full, PRE_MAX)
            .unwrap();
        let def = table.get(table.find("PAIR").unwrap());
        assert!(def.is_function);
        assert_eq!(def.param_count, 2);
        assert_eq!(def.body, vec![1, b' ', b'+', b' ', 2, b' ', b'+', b' ', b'x', b'y']);
    }

    #[test]
    fn full_leaves_unparenthesised_uses_alone() {
        let out = full("#define INC(a) (a + 1)\nint f = INC;\n");
        assert_eq!(out, "\nint f = INC;\n");
    }

    #[test]
    fn ifndef_skips_defined_blocks() {
        let out = full("#define GUARD 1\n#ifndef GUARD\nint hidden;\n#else\nint shown;\n#endif\n");
        assert_eq!(out, "\n\n\nint shown;\n\n");
    }

    #[test]
    fn ifndef_takes_undefined_blocks() {
        let out = full("#ifndef GUARD\nint shown;\n#else\nint hidden;\n#endif\n");
        assert_eq!(out, "\nint shown;\n\n\n");
    }

    #[test]
    fn nested_parent_skip_propagates() {
        let out = full("#define A 1\n#ifndef A\n#ifndef B\nint x;\n#else\nint y;\n#endif\n#endif\nint z;\n");
        assert!(!out.contains("int x"));
        assert!(!out.contains("int y"));
        assert!(out.contains("int z"));
    }

    #[test]
    fn include_splices_the_file() {
        let host = OneFile("defs.h", b"#define W 7\n");
        let out = full_with("#include \"defs.h\"\nint x = W;\n", &host);
        assert_eq!(out, "\n\nint x = W;\n".replace('W', "7"));
    }

    #[test]
    fn missing_include_counts_a_failure_and_continues() {
        let mut table = MacroTable::new();
        let mut pp = Preprocessor::new(&mut table, &NoFiles);
        let out = pp
            .run(b"#include \"gone.h\"\nint x;\n", PreprocessMode::Full, PRE_MAX)
            .unwrap();
        assert_eq!(pp.failures, 1);
        assert!(String::from_utf8(out).unwrap().contains("int x;"));
    }

    #[test]
    fn undef_removes_a_definition() {
        let out = full("#define A 5\n#undef A\nint x = A;\n");
        assert!(out.contains("int x = A;"));
    }

    #[test]
    fn overflow_reports_none() {
        let mut table = MacroTable::new();
        let mut pp = Preprocessor::new(&mut table, &NoFiles);
        assert!(pp.light(b"abcdefgh", 4).is_none());
    }
}
