
use super::*;

/// One parse/codegen session over a preprocessed buffer. Owns every table
/// and buffer of the compilation; a fresh session per compile replaces any
/// notion of shared module state.
pub struct CodeGen<'a> {
    pub(crate) lx: Lexer<'a>,
    pub(crate) cur: Token,
    pub code: CodeBuf,
    pub data: DataSegment,
    pub structs: StructTable,
    pub globals: GlobalTable,
    pub funcs: FunctionTable,
    pub(crate) call_patches: Vec<CallPatch>,
    pub(crate) macros: &'a MacroTable,
    pub(crate) builtins: &'a Builtins,
    pub(crate) host: &'a dyn Host,
    pub failures: u32,
    guard: u64,

    // Per-function state, reset at every definition.
    pub(crate) locals: LocalFrame,
    pub(crate) arrays: LocalArrays,
    pub(crate) scopes: ScopeStack,
    pub(crate) max_offset: i32,
    pub(crate) cur_fn: String,

    // Scratch-buffer bookkeeping for call arguments and `for` post code.
    pub(crate) arg_depth: usize,
    pub(crate) in_scratch: bool,
    pub(crate) scratch_patches: Vec<CallPatch>,

    pub entry_off: Option<usize>,
}

impl<'a> CodeGen<'a> {
    pub fn new(
        src: &'a [u8],
        macros: &'a MacroTable,
        builtins: &'a Builtins,
        host: &'a dyn Host,
    ) -> CodeGen<'a> {
        CodeGen {
            lx: Lexer::new(src),
            cur: Token::new(),
            code: CodeBuf::new(CODE_MAX),
            data: DataSegment::new(DATA_MAX),
            structs: StructTable::new(),
            globals: GlobalTable::new(),
            funcs: FunctionTable::new(),
            call_patches: Vec::new(),
            macros,
            builtins,
            host,
            failures: 0,
            guard: 0,
            locals: LocalFrame::new(),
            arrays: LocalArrays::new(),
            scopes: ScopeStack::new(),
            max_offset: 0,
            cur_fn: String::new(),
            arg_depth: 0,
            in_scratch: false,
            scratch_patches: Vec::new(),
            entry_off: None,
        }
    }

    pub(crate) fn advance(&mut self) {
        self.lx.next(&mut self.cur);
    }

    pub(crate) fn line(&self) -> u32 {
        self.lx.line()
    }

    /// Counted failure; always returns false so productions can bail with
    /// `return self.fail(...)`.
    pub(crate) fn fail(&mut self, msg: String) -> bool {
        if self.cur_fn.is_empty() {
            log::error!(
                "line {}: {} (token={} text='{}')",
                self.lx.line(),
                msg,
                self.cur.kind.name(),
                self.cur.text
            );
        } else {
            log::error!(
                "line {}: {} in '{}' (token={} text='{}')",
                self.lx.line(),
                msg,
                self.cur_fn,
                self.cur.kind.name(),
                self.cur.text
            );
        }
        self.failures += 1;
        false
    }

    pub(crate) fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.cur.kind != kind {
            return self.fail(format!("expected {}", what));
        }
        self.advance();
        true
    }

    /// Watchdog tick with the cooperative yield hook.
    pub(crate) fn tick(&mut self) -> bool {
        self.guard += 1;
        if self.guard > GUARD_MAX {
            return self.fail("watchdog tripped, aborting runaway parse".to_string());
        }
        if self.guard % YIELD_INTERVAL == 0 {
            self.host.yield_now();
        }
        true
    }

    pub(crate) fn save(&self) -> (LexMark, Token) {
        (self.lx.mark(), self.cur.clone())
    }

    pub(crate) fn restore(&mut self, state: (LexMark, Token)) {
        self.lx.rewind(state.0);
        self.cur = state.1;
    }

    /// Runs `body` with the emit target swapped to a fresh bounded scratch
    /// buffer; returns the scratch image and the call patches recorded
    /// against it (sites scratch-relative).
    pub(crate) fn with_scratch<F>(&mut self, max: usize, body: F) -> (bool, CodeBuf, Vec<CallPatch>)
    where
        F: FnOnce(&mut Self) -> bool,
    {
        let saved_code = std::mem::replace(&mut self.code, CodeBuf::new(max));
        let saved_patches = std::mem::take(&mut self.scratch_patches);
        let saved_flag = std::mem::replace(&mut self.in_scratch, true);
        let ok = body(self);
        let scratch = std::mem::replace(&mut self.code, saved_code);
        let patches = std::mem::replace(&mut self.scratch_patches, saved_patches);
        self.in_scratch = saved_flag;
        (ok, scratch, patches)
    }

    /// Concatenates scratch code into the current target, rebasing the
    /// scratch's pending call patches onto the splice point.
    pub(crate) fn splice(&mut self, scratch: &CodeBuf, patches: Vec<CallPatch>) -> bool {
        let base = self.code.pos();
        for &b in scratch.bytes() {
            if !self.code.emit8(b) {
                return false;
            }
        }
        for p in patches {
            if !self.queue_call_patch(p.name, base + p.site) {
                return false;
            }
        }
        true
    }

    /// Records an unresolved call site. Inside a scratch buffer the site is
    /// buffer-relative and rebased at splice time.
    pub(crate) fn queue_call_patch(&mut self, name: String, site: usize) -> bool {
        if self.in_scratch {
            self.scratch_patches.push(CallPatch { name, site });
            return true;
        }
        if self.call_patches.len() >= MAX_CALL_PATCHES {
            return self.fail(format!("too many pending call patches at '{}'", name));
        }
        self.call_patches.push(CallPatch { name, site });
        true
    }

    /// File-level parse. Productions are attempted in order: global
    /// variable declaration, `typedef` skip, struct definition, function
    /// definition or prototype. A fingerprint check aborts any iteration
    /// that fails to consume input.
    pub fn run(&mut self) -> bool {
        self.advance();
        while self.cur.kind != TokenKind::Eof {
            if !self.tick() {
                return false;
            }
            let fingerprint = (self.lx.pos(), self.cur.kind);

            if self.try_global_decl() {
                if (self.lx.pos(), self.cur.kind) == fingerprint {
                    return self.fail("no progress after global declaration".to_string());
                }
                continue;
            }
            if self.cur.kind == TokenKind::Ident && self.cur.text == "typedef" {
                if !self.skip_typedef() {
                    return false;
                }
            } else if self.cur.kind == TokenKind::Struct {
                if !self.stmt_struct(false) {
                    return false;
                }
            } else if !self.function_def() {
                return false;
            }
            if self.cur.kind == TokenKind::Eof {
                break;
            }
            if (self.lx.pos(), self.cur.kind) == fingerprint {
                return self.fail("no progress in top-level parse".to_string());
            }
        }

        if !self.link_calls() {
            return false;
        }
        if self.funcs.is_empty() {
            return self.fail("no functions in program".to_string());
        }
        match self.funcs.find("main") {
            Some(idx) => {
                self.entry_off = Some(self.funcs.pos(idx));
                log::debug!(
                    "entry: main at 0x{:x}, {} functions, {} code bytes",
                    self.funcs.pos(idx),
                    self.funcs.len(),
                    self.code.pos()
                );
                true
            }
            None => self.fail(format!("main not found among {} functions", self.funcs.len())),
        }
    }

    /// All types are word-sized internally, so `typedef` registers nothing;
    /// tokens are consumed through the balanced terminating `;`.
    fn skip_typedef(&mut self) -> bool {
        self.advance();
        self.skip_balanced_until_semi();
        self.expect(TokenKind::Semi, "';'")
    }

    pub(crate) fn skip_balanced_until_semi(&mut self) {
        let mut paren = 0;
        let mut brack = 0;
        let mut brace = 0;
        while self.cur.kind != TokenKind::Eof {
            if paren == 0 && brack == 0 && brace == 0 && self.cur.kind == TokenKind::Semi {
                break;
            }
            match self.cur.kind {
                TokenKind::LParen => paren += 1,
                TokenKind::RParen if paren > 0 => paren -= 1,
                TokenKind::LBracket => brack += 1,
                TokenKind::RBracket if brack > 0 => brack -= 1,
                TokenKind::LBrace => brace += 1,
                TokenKind::RBrace if brace > 0 => brace -= 1,
                _ => {}
            }
            self.advance();
        }
    }

    /// Speculative file-scope variable declaration; rewinds and reports
    /// false when the shape turns out to be a function or something else.
    fn try_global_decl(&mut self) -> bool {
        let saved = self.save();
        if !(self.cur.kind == TokenKind::IntKw
            || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text)))
        {
            return false;
        }
        let mut elem_size = 4;
        while self.cur.kind == TokenKind::IntKw
            || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
        {
            if self.cur.kind == TokenKind::Ident && is_byte_type(&self.cur.text) {
                elem_size = 1;
            }
            self.advance();
        }
        let mut ptr_depth = 0;
        while self.cur.kind == TokenKind::Star {
            ptr_depth += 1;
            self.advance();
        }
        if self.cur.kind != TokenKind::Ident {
            self.restore(saved);
            return false;
        }
        let name = self.cur.text.clone();
        self.advance();

        if self.cur.kind == TokenKind::LParen {
            // Function or prototype; not ours.
            self.restore(saved);
            return false;
        }

        let mut is_array = false;
        let mut arr_len = 0usize;
        if self.cur.kind == TokenKind::LBracket {
            is_array = true;
            self.advance();
            match self.parse_array_len() {
                Some(len) => arr_len = len,
                None => {
                    self.restore(saved);
                    return false;
                }
            }
        }
        if self.cur.kind == TokenKind::Eq {
            self.advance();
            self.skip_balanced_until_semi();
        }
        if self.cur.kind != TokenKind::Semi {
            self.restore(saved);
            return false;
        }
        self.advance();

        if ptr_depth > 0 {
            elem_size = 4;
        }
        let size = if is_array {
            arr_len.max(1) * elem_size as usize
        } else {
            4
        };
        if self
            .globals
            .add(&name, size, elem_size, is_array, &mut self.data)
            .is_none()
        {
            self.fail(format!("global allocation failed for '{}'", name));
            // The declaration was consumed; report it handled so the driver
            // inspects the failure count rather than reparsing.
        }
        true
    }

    /// Reads an array dimension from the token stream up to `]`. The first
    /// integer literal or foldable constant wins; absent either, the length
    /// defaults to 1.
    pub(crate) fn parse_array_len(&mut self) -> Option<usize> {
        let mut len: i32 = 1;
        let mut got = false;
        while self.cur.kind != TokenKind::RBracket && self.cur.kind != TokenKind::Eof {
            if !got {
                if self.cur.kind == TokenKind::IntLit {
                    len = self.cur.value;
                    got = true;
                } else if self.cur.kind == TokenKind::Ident {
                    if let Some(v) = consts::fold_ident(self.macros, &self.cur.text) {
                        len = v;
                        got = true;
                    }
                }
            }
            self.advance();
        }
        if !self.expect(TokenKind::RBracket, "']'") {
            return None;
        }
        Some(if len <= 0 { 1 } else { len as usize })
    }

    /// Function definition or prototype. The name is the identifier that is
    /// immediately followed by `(`; leading type words, stars and struct
    /// names are consumed on the way.
    pub(crate) fn function_def(&mut self) -> bool {
        self.locals.reset();
        self.arrays.reset();
        self.scopes.reset();
        self.arg_depth = 0;
        self.max_offset = 0;

        let fname = loop {
            match self.cur.kind {
                TokenKind::Eof => {
                    return self.fail("expected function name".to_string());
                }
                TokenKind::Struct => {
                    self.advance();
                    if self.cur.kind == TokenKind::Ident {
                        self.advance();
                    }
                }
                TokenKind::IntKw | TokenKind::Star => self.advance(),
                TokenKind::Ident => {
                    let cand = self.cur.text.clone();
                    self.advance();
                    if self.cur.kind == TokenKind::LParen {
                        break cand;
                    }
                }
                TokenKind::Semi => {
                    self.advance();
                    return true;
                }
                _ => self.advance(),
            }
        };

        let fn_start = self.code.pos();
        if !self.funcs.add(&fname, fn_start) {
            return self.fail("too many functions".to_string());
        }
        self.cur_fn = fname.clone();
        log::debug!("fn {} at 0x{:x}", fname, fn_start);
        if !self.expect(TokenKind::LParen, "'('") {
            return false;
        }

        if self.cur.kind != TokenKind::RParen {
            loop {
                if self.locals.count() == 0
                    && self.cur.kind == TokenKind::Ident
                    && self.cur.text == "void"
                {
                    self.advance();
                    if self.cur.kind == TokenKind::RParen {
                        break;
                    }
                }
                let mut pname = String::new();
                let mut param_si: Option<usize> = None;
                let mut ptr_depth = 0;
                let mut expect_struct_name = false;
                let mut paren = 0;
                let mut brack = 0;
                while self.cur.kind != TokenKind::Eof {
                    if paren == 0
                        && brack == 0
                        && (self.cur.kind == TokenKind::Comma || self.cur.kind == TokenKind::RParen)
                    {
                        break;
                    }
                    match self.cur.kind {
                        TokenKind::Struct => expect_struct_name = true,
                        TokenKind::Ident => {
                            if expect_struct_name {
                                param_si = self.structs.find(&self.cur.text);
                                expect_struct_name = false;
                            } else {
                                pname = self.cur.text.clone();
                            }
                        }
                        TokenKind::Star => ptr_depth += 1,
                        TokenKind::LParen => paren += 1,
                        TokenKind::RParen if paren > 0 => paren -= 1,
                        TokenKind::LBracket => brack += 1,
                        TokenKind::RBracket if brack > 0 => brack -= 1,
                        _ => {}
                    }
                    self.advance();
                }
                if pname.is_empty() {
                    return self.fail("expected parameter name".to_string());
                }
                if self.locals.find(&pname).is_some() {
                    return self.fail(format!("duplicate parameter '{}'", pname));
                }
                let Some(idx) = self.locals.push(&pname) else {
                    return self.fail("too many parameters".to_string());
                };
                if ptr_depth > 0 {
                    self.locals.set_struct_si(idx, param_si);
                }
                if self.cur.kind == TokenKind::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        if !self.expect(TokenKind::RParen, "')'") {
            return false;
        }
        if self.cur.kind == TokenKind::Semi {
            // Prototype; nothing registered beyond the name/offset pair.
            self.advance();
            self.cur_fn.clear();
            return true;
        }
        if !self.expect(TokenKind::LBrace, "'{'") {
            return false;
        }

        let Some(frame_patch) = self.code.prologue() else {
            return self.fail("emit overflow in prologue".to_string());
        };
        if !self.scopes.push(0) {
            return self.fail("scope depth overflow".to_string());
        }

        // Copy incoming cdecl arguments into ordinary local slots.
        let param_count = self.locals.count();
        for i in 0..param_count {
            if !(self.code.load_arg((8 + i * 4) as i32)
                && self.code.store_local(LocalFrame::slot_off(i)))
            {
                return self.fail("emit overflow copying parameters".to_string());
            }
        }
        self.max_offset = self.max_offset.max((param_count * 4) as i32);

        while self.cur.kind != TokenKind::RBrace && self.cur.kind != TokenKind::Eof {
            let fingerprint = (self.lx.pos(), self.cur.kind);
            if !self.statement(StmtCtx::none()) {
                return self.fail(format!("statement failed in function '{}'", fname));
            }
            if (self.lx.pos(), self.cur.kind) == fingerprint {
                return self.fail(format!("no progress in function '{}'", fname));
            }
        }
        if !self.expect(TokenKind::RBrace, "'}'") {
            return false;
        }
        if let Some(restore) = self.scopes.pop() {
            self.locals.truncate(restore);
            self.arrays.pop_to(restore);
        }

        // Generous scratch beyond the high-water mark, rounded to 16.
        let frame_size = (self.max_offset + 64 + 15) & !15;
        self.code.patch_abs32(frame_patch, frame_size);

        if !self.code.epilogue() {
            return self.fail("emit overflow in epilogue".to_string());
        }
        log::debug!("fn {} ends at 0x{:x}", fname, self.code.pos());
        self.cur_fn.clear();
        true
    }

    /// Resolves every pending call against the function table, then the
    /// builtin table. An unresolved call is fatal.
    fn link_calls(&mut self) -> bool {
        for i in 0..self.call_patches.len() {
            let CallPatch { name, site } = self.call_patches[i].clone();
            if let Some(idx) = self.funcs.find(&name) {
                let target = self.funcs.pos(idx);
                self.code.patch_rel32(site, target);
            } else if let Some(addr) = self.builtins.addr(&name) {
                self.code.patch_rel32_abs(site, addr);
            } else {
                return self.fail(format!("unresolved call '{}'", name));
            }
        }
        true
    }
}

/// Break/continue routing for the statement under parse. `breaks` and
/// `conts` travel separately because `switch` captures breaks while leaving
/// continues to the enclosing loop.
pub(crate) struct StmtCtx<'p> {
    pub breaks: Option<&'p mut Vec<usize>>,
    pub conts: Option<&'p mut Vec<usize>>,
    pub in_loop: bool,
}

impl<'p> StmtCtx<'p> {
    pub fn none() -> StmtCtx<'static> {
        StmtCtx {
            breaks: None,
            conts: None,
            in_loop: false,
        }
    }

    pub fn reborrow(&mut self) -> StmtCtx<'_> {
        StmtCtx {
            breaks: self.breaks.as_deref_mut(),
            conts: self.conts.as_deref_mut(),
            in_loop: self.in_loop,
        }
    }
}
