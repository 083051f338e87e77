//! Statement parser and code generator.
//!
//! Structured recursion over the statement grammar, emitting x86-32 into
//! the session code buffer as it parses. Control flow is stitched with
//! rel32 patch sites; `break`/`continue` sites collect on the innermost
//! loop's patch lists.

use super::*;

impl<'a> CodeGen<'a> {
    pub(crate) fn statement(&mut self, mut ctx: StmtCtx) -> bool {
        if !self.tick() {
            return false;
        }
        match self.cur.kind {
            TokenKind::Struct => self.stmt_struct(true),
            TokenKind::IntKw => self.stmt_local_decl(),
            TokenKind::Ident if is_type_word(&self.cur.text) => self.stmt_local_decl(),
            TokenKind::Ident => self.stmt_ident(),
            TokenKind::Return => self.stmt_return(),
            TokenKind::Asm => self.stmt_asm(),
            TokenKind::LBrace => self.stmt_block(ctx),
            TokenKind::If => self.stmt_if(ctx),
            TokenKind::While => self.stmt_while(),
            TokenKind::Do => self.stmt_do(),
            TokenKind::For => self.stmt_for(),
            TokenKind::Switch => self.stmt_switch(ctx),
            TokenKind::Break => {
                let Some(breaks) = ctx.breaks.as_deref_mut() else {
                    return self.fail("break outside loop".to_string());
                };
                self.advance();
                if !self.expect(TokenKind::Semi, "';'") {
                    return false;
                }
                if !self.code.emit8(0xE9) {
                    return false;
                }
                let site = self.code.pos();
                if !self.code.emit32le(0) {
                    return false;
                }
                if breaks.len() >= MAX_PATCHES {
                    return self.fail("too many break patches".to_string());
                }
                breaks.push(site);
                true
            }
            TokenKind::Continue => {
                if !ctx.in_loop {
                    return self.fail("continue outside loop".to_string());
                }
                let Some(conts) = ctx.conts.as_deref_mut() else {
                    return self.fail("continue outside loop".to_string());
                };
                self.advance();
                if !self.expect(TokenKind::Semi, "';'") {
                    return false;
                }
                if !self.code.emit8(0xE9) {
                    return false;
                }
                let site = self.code.pos();
                if !self.code.emit32le(0) {
                    return false;
                }
                if conts.len() >= MAX_PATCHES {
                    return self.fail("too many continue patches".to_string());
                }
                conts.push(site);
                true
            }
            TokenKind::LParen => match self.try_paren_lvalue() {
                Some(matched) => matched,
                None => self.stmt_expr_fallback(),
            },
            TokenKind::Star => self.stmt_store_through(),
            TokenKind::IntLit
            | TokenKind::String
            | TokenKind::Bang
            | TokenKind::Tilde
            | TokenKind::Minus
            | TokenKind::PlusPlus
            | TokenKind::MinusMinus
            | TokenKind::Amp => self.stmt_expr_fallback(),
            _ => self.fail("unsupported statement".to_string()),
        }
    }

    /// Expression statement; a trailing assignment operator consumes one
    /// more expression so update forms in expression position parse.
    fn stmt_expr_fallback(&mut self) -> bool {
        if !self.expr(1) {
            return false;
        }
        if self.cur.kind == TokenKind::Eq || self.cur.kind.is_compound_assign() {
            self.advance();
            if !self.expr(1) {
                return false;
            }
        }
        self.expect(TokenKind::Semi, "';'")
    }

    /// `struct` in statement or file position: a type definition, or a
    /// variable of struct / struct-pointer type.
    pub(crate) fn stmt_struct(&mut self, in_function: bool) -> bool {
        self.advance();
        if self.cur.kind != TokenKind::Ident {
            return self.fail("expected struct name".to_string());
        }
        let type_name = self.cur.text.clone();
        self.advance();

        if self.cur.kind == TokenKind::LBrace {
            return self.struct_definition(&type_name);
        }
        if self.cur.kind == TokenKind::Semi {
            self.advance();
            return true;
        }

        let mut ptr_depth = 0;
        while self.cur.kind == TokenKind::Star {
            ptr_depth += 1;
            self.advance();
        }
        if self.cur.kind != TokenKind::Ident {
            return self.fail("expected struct variable name".to_string());
        }
        let name = self.cur.text.clone();
        self.advance();

        let mut is_array = false;
        let mut arr_len = 1usize;
        if self.cur.kind == TokenKind::LBracket {
            is_array = true;
            self.advance();
            match self.parse_array_len() {
                Some(len) => arr_len = len,
                None => return false,
            }
        }

        let mut has_init = false;
        if self.cur.kind == TokenKind::Eq {
            self.advance();
            if in_function && ptr_depth > 0 && !is_array {
                has_init = true;
                if !self.expr(1) {
                    return false;
                }
            } else {
                self.skip_balanced_until_semi();
            }
        }
        if !self.expect(TokenKind::Semi, "';'") {
            return false;
        }

        let Some(si) = self.structs.find(&type_name) else {
            return self.fail(format!("unknown struct type '{}'", type_name));
        };

        if !in_function {
            return self.global_struct_var(&name, si, ptr_depth, is_array, arr_len);
        }

        if ptr_depth > 0 {
            if is_array {
                return self.fail(format!("unsupported local struct pointer array '{}'", name));
            }
            let base = self.scopes.current_base();
            let idx = match self.locals.find_in_scope(base, &name) {
                Some(idx) => idx,
                None => {
                    let Some(idx) = self.locals.push(&name) else {
                        return self.fail(format!(
                            "too many locals ({} of {})",
                            self.locals.count(),
                            MAX_LOCALS
                        ));
                    };
                    self.max_offset = self.max_offset.max(LocalFrame::slot_off(idx));
                    idx
                }
            };
            self.locals.set_struct_si(idx, Some(si));
            if has_init && !self.code.store_local(LocalFrame::slot_off(idx)) {
                return false;
            }
            return true;
        }
        if is_array {
            return self.fail(format!("unsupported local struct array '{}'", name));
        }

        // Local struct variable: flatten each field into a dotted slot.
        let field_names: Vec<String> = self.structs.def(si).fields.iter().map(|f| f.name.clone()).collect();
        let base = self.scopes.current_base();
        for fname in field_names {
            let full = append_dot_field(&name, &fname);
            if self.locals.find_in_scope(base, &full).is_some() {
                continue;
            }
            let Some(idx) = self.locals.push(&full) else {
                return self.fail(format!(
                    "too many locals ({} of {})",
                    self.locals.count(),
                    MAX_LOCALS
                ));
            };
            self.max_offset = self.max_offset.max(LocalFrame::slot_off(idx));
        }
        true
    }

    fn struct_definition(&mut self, type_name: &str) -> bool {
        let Some(si) = self.structs.add(type_name) else {
            return self.fail("too many structs".to_string());
        };
        self.advance();
        while self.cur.kind != TokenKind::RBrace && self.cur.kind != TokenKind::Eof {
            let mut elem_size = 4;
            match self.cur.kind {
                TokenKind::Struct => {
                    self.advance();
                    if self.cur.kind != TokenKind::Ident {
                        return self.fail("expected struct field type name".to_string());
                    }
                    if let Some(inner) = self.structs.find(&self.cur.text) {
                        if self.structs.size(inner) > 0 {
                            elem_size = self.structs.size(inner);
                        }
                    }
                    self.advance();
                }
                TokenKind::IntKw => {
                    while self.cur.kind == TokenKind::IntKw
                        || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
                    {
                        elem_size = if self.cur.kind == TokenKind::Ident && is_byte_type(&self.cur.text) {
                            1
                        } else {
                            4
                        };
                        self.advance();
                    }
                }
                TokenKind::Ident if is_type_word(&self.cur.text) => {
                    while self.cur.kind == TokenKind::IntKw
                        || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
                    {
                        elem_size = if self.cur.kind == TokenKind::Ident && is_byte_type(&self.cur.text) {
                            1
                        } else {
                            4
                        };
                        self.advance();
                    }
                }
                _ => return self.fail("expected struct field type".to_string()),
            }
            let mut field_ptr = false;
            while self.cur.kind == TokenKind::Star {
                field_ptr = true;
                self.advance();
            }
            if field_ptr {
                elem_size = 4;
            }
            if self.cur.kind != TokenKind::Ident {
                return self.fail("expected struct field name".to_string());
            }
            let fname = self.cur.text.clone();
            self.advance();
            let mut field_is_array = false;
            let mut field_len = 1usize;
            if self.cur.kind == TokenKind::LBracket {
                self.advance();
                match self.parse_array_len() {
                    Some(len) => field_len = len.max(1),
                    None => return false,
                }
                field_is_array = true;
            }
            if !self.expect(TokenKind::Semi, "';'") {
                return false;
            }
            let field_size = if field_is_array {
                elem_size * field_len as i32
            } else {
                elem_size
            };
            if !self.structs.add_field(si, &fname, field_size, elem_size, field_is_array) {
                return self.fail("too many struct fields".to_string());
            }
        }
        self.expect(TokenKind::RBrace, "'}'") && self.expect(TokenKind::Semi, "';'")
    }

    fn global_struct_var(&mut self, name: &str, si: usize, ptr_depth: u32, is_array: bool, arr_len: usize) -> bool {
        if ptr_depth > 0 {
            let Some(gidx) = self.globals.add(name, 4, 4, false, &mut self.data) else {
                return self.fail(format!("global allocation failed for '{}'", name));
            };
            self.globals.set_struct_si(gidx, si);
            return true;
        }
        let struct_size = self.structs.size(si).max(4) as usize;
        if is_array {
            if self
                .globals
                .add(name, struct_size * arr_len, 4, true, &mut self.data)
                .is_none()
            {
                return self.fail(format!("global allocation failed for '{}'", name));
            }
            return true;
        }
        let Some(base_idx) = self.globals.add(name, struct_size, 4, false, &mut self.data) else {
            return self.fail(format!("global allocation failed for '{}'", name));
        };
        let base_off = self.globals.get(base_idx).off;
        let fields: Vec<Field> = self.structs.def(si).fields.clone();
        for f in fields {
            let full = append_dot_field(name, &f.name);
            let size = if f.size <= 0 { 4 } else { f.size } as usize;
            let elem = if f.elem_size <= 0 { 4 } else { f.elem_size };
            if self
                .globals
                .add_alias(&full, base_off + f.off as usize, size, elem, f.is_array)
                .is_none()
            {
                return self.fail(format!("global allocation failed for '{}'", full));
            }
        }
        true
    }

    /// `int name[= expr];` and `T name[N];` local declarations.
    fn stmt_local_decl(&mut self) -> bool {
        while self.cur.kind == TokenKind::IntKw
            || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
        {
            self.advance();
        }
        while self.cur.kind == TokenKind::Star {
            self.advance();
        }
        if self.cur.kind != TokenKind::Ident {
            return self.fail("expected local name".to_string());
        }
        let name = self.cur.text.clone();
        let scope_base = self.scopes.current_base();
        if self
            .arrays
            .find_in_scope(&name, scope_base, self.locals.count())
            .is_some()
        {
            return self.fail(format!("array '{}' redeclared", name));
        }
        let existing = self.locals.find_in_scope(scope_base, &name);
        self.advance();

        if self.cur.kind == TokenKind::LBracket {
            self.advance();
            let Some(len) = self.parse_array_len() else {
                return false;
            };
            if !self.expect(TokenKind::Semi, "';'") {
                return false;
            }
            let base = self.locals.count() + 1;
            if !self.locals.reserve(len) {
                return self.fail(format!(
                    "too many locals ({} + {} of {})",
                    self.locals.count(),
                    len,
                    MAX_LOCALS
                ));
            }
            if !self.arrays.add(&name, base, len) {
                return self.fail("too many local arrays".to_string());
            }
            self.max_offset = self.max_offset.max((self.locals.count() * 4) as i32);
            for slot in base..base + len {
                if !(self.code.mov_eax_imm(0) && self.code.store_local((slot * 4) as i32)) {
                    return false;
                }
            }
            return true;
        }

        let idx = match existing {
            Some(idx) => idx,
            None => {
                let Some(idx) = self.locals.push(&name) else {
                    return self.fail(format!(
                        "too many locals ({} of {})",
                        self.locals.count(),
                        MAX_LOCALS
                    ));
                };
                self.max_offset = self.max_offset.max(LocalFrame::slot_off(idx));
                idx
            }
        };
        self.locals.set_struct_si(idx, None);
        if self.cur.kind == TokenKind::Eq {
            self.advance();
            if !self.expr(1) {
                return false;
            }
        } else if !self.code.mov_eax_imm(0) {
            return false;
        }
        if !self.code.store_local(LocalFrame::slot_off(idx)) {
            return false;
        }
        self.expect(TokenKind::Semi, "';'")
    }

    /// Identifier-led statement: assignment through some lvalue class, a
    /// `print`/`println` fast path, or an expression statement.
    fn stmt_ident(&mut self) -> bool {
        if self.cur.text == "print" || self.cur.text == "println" {
            let saved = self.save();
            let is_println = self.cur.text == "println";
            self.advance();
            if self.cur.kind == TokenKind::LParen {
                return self.stmt_print(is_println);
            }
            self.restore(saved);
        }

        let saved = self.save();
        let mut name = self.cur.text.clone();
        self.advance();

        if self.cur.kind == TokenKind::LBracket {
            return self.stmt_subscript_assign(&name, saved);
        }

        while self.cur.kind == TokenKind::Dot {
            self.advance();
            if self.cur.kind != TokenKind::Ident {
                return self.fail("expected field after '.'".to_string());
            }
            name = append_dot_field(&name, &self.cur.text);
            self.advance();
        }

        if let Some(idx) = self.locals.find(&name) {
            let off = LocalFrame::slot_off(idx);
            return self.lvalue_update_tail(saved, |cg| cg.code.load_local(off), |cg| {
                cg.code.store_local(off)
            });
        }
        if let Some(gidx) = self.globals.find(&name) {
            let addr = self.globals.addr(gidx);
            let byte = self.globals.get(gidx).elem_size == 1;
            return self.lvalue_update_tail(
                saved,
                move |cg| cg.code.load_global(addr, byte),
                move |cg| cg.code.store_global_from_eax(addr, byte),
            );
        }
        if let Some(pf) = resolve_ptr_field(&self.locals, &self.globals, &self.structs, &name) {
            return self.stmt_ptr_field_assign(&name, pf, saved);
        }
        if name.contains('.') {
            return self.fail(format!("unknown dotted lvalue '{}'", name));
        }
        // Not an lvalue: reparse as an expression statement (calls land
        // here).
        self.restore(saved);
        if !self.expr(1) {
            return false;
        }
        self.expect(TokenKind::Semi, "';'")
    }

    /// The update tail shared by word/byte lvalues with direct load/store
    /// forms: `++`/`--`, `=`, compound `op=`, or an expression fallback.
    fn lvalue_update_tail<L, S>(&mut self, saved: (LexMark, Token), load: L, store: S) -> bool
    where
        L: Fn(&mut Self) -> bool,
        S: Fn(&mut Self) -> bool,
    {
        let op = self.cur.kind;
        if matches!(op, TokenKind::PlusPlus | TokenKind::MinusMinus) {
            self.advance();
            if !self.expect(TokenKind::Semi, "';'") {
                return false;
            }
            let adjusted = load(self)
                && if op == TokenKind::PlusPlus {
                    self.code.add_eax_1()
                } else {
                    self.code.sub_eax_1()
                };
            return adjusted && store(self);
        }
        if op == TokenKind::Eq {
            self.advance();
            if !self.expr(1) {
                return false;
            }
            if !store(self) {
                return false;
            }
            return self.expect(TokenKind::Semi, "';'");
        }
        if op.is_compound_assign() {
            self.advance();
            if !(load(self) && self.code.push_eax()) {
                return false;
            }
            if !self.expr(1) {
                return false;
            }
            if !(self.code.pop_ecx() && self.apply_compound(op)) {
                return false;
            }
            if !store(self) {
                return false;
            }
            return self.expect(TokenKind::Semi, "';'");
        }
        self.restore(saved);
        if !self.expr(1) {
            return false;
        }
        self.expect(TokenKind::Semi, "';'")
    }

    /// Assignment through `name[index]` for every array-ish base class.
    fn stmt_subscript_assign(&mut self, name: &str, saved: (LexMark, Token)) -> bool {
        self.advance();
        let local_arr = self.arrays.find(name).cloned();
        let mut global_arr: Option<(u32, i32)> = None;
        let mut global_ptr: Option<u32> = None;
        let mut local_ptr: Option<usize> = None;
        if local_arr.is_none() {
            if let Some(gidx) = self.globals.find(name) {
                let g = self.globals.get(gidx);
                if g.is_array {
                    global_arr = Some((self.globals.addr(gidx), g.elem_size));
                } else {
                    global_ptr = Some(self.globals.addr(gidx));
                }
            } else if let Some(idx) = self.locals.find(name) {
                local_ptr = Some(idx);
            } else {
                return self.fail(format!("unknown subscript base '{}'", name));
            }
        }
        if !self.expr(1) {
            return false;
        }
        if !self.expect(TokenKind::RBracket, "']'") {
            return false;
        }
        let is_ptr = global_ptr.is_some() || local_ptr.is_some();
        let elem_size = if let Some(arr) = &local_arr {
            let off = ((arr.base + arr.len - 1) * 4) as i32;
            if !(self.code.shl_eax_2() && self.code.lea_edx_local(off)) {
                return false;
            }
            4
        } else if let Some((addr, elem)) = global_arr {
            if elem >= 4 && !self.code.shl_eax_2() {
                return false;
            }
            if !(self.code.push_eax()
                && self.code.mov_eax_imm(addr as i32)
                && self.code.mov_edx_eax()
                && self.code.pop_eax())
            {
                return false;
            }
            elem
        } else {
            let loaded = if let Some(addr) = global_ptr {
                self.code.push_eax() && self.code.load_global(addr, false)
            } else {
                self.code.push_eax() && self.code.load_local(LocalFrame::slot_off(local_ptr.unwrap()))
            };
            if !(loaded && self.code.mov_edx_eax() && self.code.pop_eax()) {
                return false;
            }
            1
        };
        if !self.code.add_edx_eax() {
            return false;
        }

        let op = self.cur.kind;
        if is_ptr {
            // Pointer subscripts are byte stores and accept plain `=` only.
            if op != TokenKind::Eq {
                return self.fail(format!("pointer subscript on '{}' supports only '='", name));
            }
            self.advance();
            if !self.code.push_edx() {
                return false;
            }
            if !self.expr(1) {
                return false;
            }
            if !(self.code.pop_edx() && self.code.store_u8_ptr_edx_eax()) {
                return false;
            }
            return self.expect(TokenKind::Semi, "';'");
        }
        self.element_update_tail(saved, elem_size, op)
    }

    /// Update tail for an element address already in `%edx`, honouring the
    /// element width.
    fn element_update_tail(&mut self, saved: (LexMark, Token), elem_size: i32, op: TokenKind) -> bool {
        let byte = elem_size == 1;
        if matches!(op, TokenKind::PlusPlus | TokenKind::MinusMinus) {
            self.advance();
            if !self.expect(TokenKind::Semi, "';'") {
                return false;
            }
            let loaded = if byte {
                self.code.load_eax_u8_ptr_edx()
            } else {
                self.code.load_eax_ptr_edx()
            };
            let adjusted = loaded
                && if op == TokenKind::PlusPlus {
                    self.code.add_eax_1()
                } else {
                    self.code.sub_eax_1()
                };
            if !adjusted {
                return false;
            }
            return if byte {
                self.code.store_u8_ptr_edx_eax()
            } else {
                self.code.store_ptr_edx_eax()
            };
        }
        if op == TokenKind::Eq {
            self.advance();
            if !self.code.push_edx() {
                return false;
            }
            if !self.expr(1) {
                return false;
            }
            if !self.code.pop_edx() {
                return false;
            }
            let stored = if byte {
                self.code.store_u8_ptr_edx_eax()
            } else {
                self.code.store_ptr_edx_eax()
            };
            return stored && self.expect(TokenKind::Semi, "';'");
        }
        if op.is_compound_assign() {
            if !self.code.push_edx() {
                return false;
            }
            let loaded = if byte {
                self.code.load_eax_u8_ptr_edx()
            } else {
                self.code.load_eax_ptr_edx()
            };
            if !(loaded && self.code.push_eax()) {
                return false;
            }
            self.advance();
            if !self.expr(1) {
                return false;
            }
            if !(self.code.pop_ecx() && self.apply_compound(op) && self.code.pop_edx()) {
                return false;
            }
            let stored = if byte {
                self.code.store_u8_ptr_edx_eax()
            } else {
                self.code.store_ptr_edx_eax()
            };
            return stored && self.expect(TokenKind::Semi, "';'");
        }
        self.restore(saved);
        if !self.expr(1) {
            return false;
        }
        self.expect(TokenKind::Semi, "';'")
    }

    fn stmt_ptr_field_assign(&mut self, name: &str, pf: PtrField, saved: (LexMark, Token)) -> bool {
        if pf.has_more {
            return self.fail(format!("unsupported nested dotted lvalue '{}'", name));
        }
        if !self.emit_ptr_field_addr(&pf) {
            return false;
        }
        let mut elem_size = pf.elem_size;
        let mut field_is_array = pf.is_array;
        if self.cur.kind == TokenKind::LBracket {
            if !pf.is_array {
                return self.fail(format!("subscript on non-array field '{}'", name));
            }
            if !self.ptr_field_subscript(pf.elem_size) {
                return false;
            }
            elem_size = pf.elem_size;
            field_is_array = false;
        }
        let op = self.cur.kind;
        if field_is_array && op.is_assign_op() {
            return self.fail(format!("array field '{}' is not assignable", name));
        }
        self.element_update_tail(saved, elem_size, op)
    }

    /// `print`/`println` statement fast path. A string-literal argument
    /// unrolls into `push imm; call putchar` pairs for its first 16 bytes;
    /// an expression argument calls the builtin through its absolute
    /// address.
    fn stmt_print(&mut self, is_println: bool) -> bool {
        let call_name = if is_println { "println" } else { "print" };
        self.advance();
        let Some(putchar_addr) = self.builtins.addr("putchar") else {
            return self.fail("unresolved call 'putchar'".to_string());
        };
        if self.cur.kind == TokenKind::String {
            let text: Vec<u8> = self.cur.text.bytes().take(16).collect();
            for ch in text {
                if !self.code.putchar_imm(ch, putchar_addr) {
                    return false;
                }
            }
            if is_println && !self.code.putchar_imm(b'\n', putchar_addr) {
                return false;
            }
            self.advance();
            return self.expect(TokenKind::RParen, "')'") && self.expect(TokenKind::Semi, "';'");
        }
        let mut has_arg = false;
        if self.cur.kind != TokenKind::RParen {
            if !self.expr(1) {
                return false;
            }
            if !self.code.push_eax() {
                return false;
            }
            has_arg = true;
        }
        if !(self.expect(TokenKind::RParen, "')'") && self.expect(TokenKind::Semi, "';'")) {
            return false;
        }
        let Some(addr) = self.builtins.addr(call_name) else {
            return self.fail(format!("unresolved call '{}'", call_name));
        };
        if !(self.code.mov_eax_imm(addr as i32) && self.code.call_eax()) {
            return false;
        }
        if has_arg && !self.code.add_esp_imm8(4) {
            return false;
        }
        if is_println && !self.code.putchar_imm(b'\n', putchar_addr) {
            return false;
        }
        true
    }

    fn stmt_return(&mut self) -> bool {
        self.advance();
        if self.cur.kind == TokenKind::Semi {
            if !self.code.mov_eax_imm(0) {
                return false;
            }
        } else if !self.expr(1) {
            return false;
        }
        if !self.expect(TokenKind::Semi, "';'") {
            return false;
        }
        self.code.epilogue()
    }

    /// `asm(byte, byte, ...);` emits raw bytes straight into the code
    /// stream, for trap and privileged sequences the dialect cannot express.
    fn stmt_asm(&mut self) -> bool {
        self.advance();
        if !self.expect(TokenKind::LParen, "'('") {
            return false;
        }
        if self.cur.kind != TokenKind::RParen {
            loop {
                if self.cur.kind != TokenKind::IntLit {
                    return self.fail("asm expects integer byte literals".to_string());
                }
                if !self.code.emit8((self.cur.value & 0xff) as u8) {
                    return false;
                }
                self.advance();
                if self.cur.kind == TokenKind::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'") && self.expect(TokenKind::Semi, "';'")
    }

    fn stmt_block(&mut self, mut ctx: StmtCtx) -> bool {
        if !self.scopes.push(self.locals.count()) {
            return self.fail("scope depth overflow".to_string());
        }
        self.advance();
        while self.cur.kind != TokenKind::RBrace && self.cur.kind != TokenKind::Eof {
            if !self.statement(ctx.reborrow()) {
                return false;
            }
        }
        if !self.expect(TokenKind::RBrace, "'}'") {
            return false;
        }
        if let Some(restore) = self.scopes.pop() {
            self.locals.truncate(restore);
            self.arrays.pop_to(restore);
        }
        true
    }

    fn stmt_if(&mut self, mut ctx: StmtCtx) -> bool {
        self.advance();
        if !self.expect(TokenKind::LParen, "'('") {
            return false;
        }
        if !self.expr(1) {
            return false;
        }
        if !self.expect(TokenKind::RParen, "')'") {
            return false;
        }
        if !(self.code.test_eax_eax() && self.code.emit8(0x0F) && self.code.emit8(0x84)) {
            return false;
        }
        let skip_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        if !self.statement(ctx.reborrow()) {
            return false;
        }
        if self.cur.kind == TokenKind::Else {
            if !self.code.emit8(0xE9) {
                return false;
            }
            let end_patch = self.code.pos();
            if !self.code.emit32le(0) {
                return false;
            }
            let else_pos = self.code.pos();
            self.code.patch_rel32(skip_patch, else_pos);
            self.advance();
            if !self.statement(ctx.reborrow()) {
                return false;
            }
            let end_pos = self.code.pos();
            self.code.patch_rel32(end_patch, end_pos);
        } else {
            let end_pos = self.code.pos();
            self.code.patch_rel32(skip_patch, end_pos);
        }
        true
    }

    fn stmt_while(&mut self) -> bool {
        self.advance();
        if !self.expect(TokenKind::LParen, "'('") {
            return false;
        }
        let cond_pos = self.code.pos();
        if !self.expr(1) {
            return false;
        }
        if !self.expect(TokenKind::RParen, "')'") {
            return false;
        }
        if !(self.code.test_eax_eax() && self.code.emit8(0x0F) && self.code.emit8(0x84)) {
            return false;
        }
        let exit_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        let mut breaks = Vec::new();
        let mut conts = Vec::new();
        let body_ctx = StmtCtx {
            breaks: Some(&mut breaks),
            conts: Some(&mut conts),
            in_loop: true,
        };
        if !self.statement(body_ctx) {
            return false;
        }
        if !self.code.emit8(0xE9) {
            return false;
        }
        let back_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        self.code.patch_rel32(back_patch, cond_pos);
        let loop_end = self.code.pos();
        self.code.patch_rel32(exit_patch, loop_end);
        for site in conts {
            self.code.patch_rel32(site, cond_pos);
        }
        for site in breaks {
            self.code.patch_rel32(site, loop_end);
        }
        true
    }

    fn stmt_do(&mut self) -> bool {
        self.advance();
        let body_start = self.code.pos();
        let mut breaks = Vec::new();
        let mut conts = Vec::new();
        let body_ctx = StmtCtx {
            breaks: Some(&mut breaks),
            conts: Some(&mut conts),
            in_loop: true,
        };
        if !self.statement(body_ctx) {
            return false;
        }
        if !(self.expect(TokenKind::While, "'while'") && self.expect(TokenKind::LParen, "'('")) {
            return false;
        }
        let cond_pos = self.code.pos();
        if !self.expr(1) {
            return false;
        }
        if !(self.expect(TokenKind::RParen, "')'") && self.expect(TokenKind::Semi, "';'")) {
            return false;
        }
        if !(self.code.test_eax_eax() && self.code.emit8(0x0F) && self.code.emit8(0x85)) {
            return false;
        }
        let back_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        self.code.patch_rel32(back_patch, body_start);
        let loop_end = self.code.pos();
        for site in conts {
            self.code.patch_rel32(site, cond_pos);
        }
        for site in breaks {
            self.code.patch_rel32(site, loop_end);
        }
        true
    }

    fn stmt_for(&mut self) -> bool {
        self.advance();
        if !self.expect(TokenKind::LParen, "'('") {
            return false;
        }
        if !self.scopes.push(self.locals.count()) {
            return self.fail("scope depth overflow".to_string());
        }

        // init: declaration, comma-list of updates, or empty.
        if self.cur.kind == TokenKind::Semi {
            self.advance();
        } else if self.cur.kind == TokenKind::IntKw
            || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
        {
            while self.cur.kind == TokenKind::IntKw
                || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
            {
                self.advance();
            }
            while self.cur.kind == TokenKind::Star {
                self.advance();
            }
            loop {
                if self.cur.kind != TokenKind::Ident {
                    return self.fail("expected loop variable name".to_string());
                }
                let name = self.cur.text.clone();
                let base = self.scopes.current_base();
                let idx = match self.locals.find_in_scope(base, &name) {
                    Some(idx) => idx,
                    None => {
                        let Some(idx) = self.locals.push(&name) else {
                            return self.fail(format!(
                                "too many locals ({} of {})",
                                self.locals.count(),
                                MAX_LOCALS
                            ));
                        };
                        self.max_offset = self.max_offset.max(LocalFrame::slot_off(idx));
                        idx
                    }
                };
                self.locals.set_struct_si(idx, None);
                self.advance();
                if self.cur.kind == TokenKind::Eq {
                    self.advance();
                    if !self.expr(1) {
                        return false;
                    }
                } else if !self.code.mov_eax_imm(0) {
                    return false;
                }
                if !self.code.store_local(LocalFrame::slot_off(idx)) {
                    return false;
                }
                if self.cur.kind == TokenKind::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
            if !self.expect(TokenKind::Semi, "';'") {
                return false;
            }
        } else {
            loop {
                if self.cur.kind != TokenKind::Ident {
                    return self.fail("expected assignment in loop init".to_string());
                }
                let name = self.cur.text.clone();
                self.advance();
                if !self.local_update(&name) {
                    return false;
                }
                if self.cur.kind == TokenKind::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
            if !self.expect(TokenKind::Semi, "';'") {
                return false;
            }
        }

        let cond_pos = self.code.pos();
        let mut exit_patch = None;
        if self.cur.kind == TokenKind::Semi {
            self.advance();
        } else {
            if !self.expr(1) {
                return false;
            }
            if !self.expect(TokenKind::Semi, "';'") {
                return false;
            }
            if !(self.code.test_eax_eax() && self.code.emit8(0x0F) && self.code.emit8(0x84)) {
                return false;
            }
            exit_patch = Some(self.code.pos());
            if !self.code.emit32le(0) {
                return false;
            }
        }

        // post: captured into a scratch buffer and spliced after the body;
        // `continue` targets the splice point.
        let mut post: Option<(CodeBuf, Vec<CallPatch>)> = None;
        if self.cur.kind != TokenKind::RParen {
            let (ok, scratch, patches) = self.with_scratch(256, |cg| loop {
                if cg.cur.kind != TokenKind::Ident {
                    return cg.fail("expected assignment in loop post".to_string());
                }
                let name = cg.cur.text.clone();
                cg.advance();
                if !cg.local_update(&name) {
                    return false;
                }
                if cg.cur.kind == TokenKind::Comma {
                    cg.advance();
                    continue;
                }
                return true;
            });
            if !ok {
                return false;
            }
            post = Some((scratch, patches));
        }
        if !self.expect(TokenKind::RParen, "')'") {
            return false;
        }

        let mut breaks = Vec::new();
        let mut conts = Vec::new();
        let body_ctx = StmtCtx {
            breaks: Some(&mut breaks),
            conts: Some(&mut conts),
            in_loop: true,
        };
        if !self.statement(body_ctx) {
            return false;
        }

        let post_start = self.code.pos();
        if let Some((scratch, patches)) = post {
            if !self.splice(&scratch, patches) {
                return false;
            }
        }
        if !self.code.emit8(0xE9) {
            return false;
        }
        let back_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        self.code.patch_rel32(back_patch, cond_pos);
        let loop_end = self.code.pos();
        if let Some(site) = exit_patch {
            self.code.patch_rel32(site, loop_end);
        }
        for site in conts {
            self.code.patch_rel32(site, post_start);
        }
        for site in breaks {
            self.code.patch_rel32(site, loop_end);
        }
        if let Some(restore) = self.scopes.pop() {
            self.locals.truncate(restore);
            self.arrays.pop_to(restore);
        }
        true
    }

    /// `switch (e)`: the scrutinee is parked in a hidden local slot, the
    /// body is emitted with case labels recorded, and a compare/jump
    /// dispatch tail follows the body.
    fn stmt_switch(&mut self, mut ctx: StmtCtx) -> bool {
        self.advance();
        if !self.expect(TokenKind::LParen, "'('") {
            return false;
        }
        if !self.expr(1) {
            return false;
        }
        if !self.expect(TokenKind::RParen, "')'") {
            return false;
        }
        if !self.scopes.push(self.locals.count()) {
            return self.fail("scope depth overflow".to_string());
        }
        let Some(slot) = self.locals.push("") else {
            return self.fail("switch scrutinee slot overflow".to_string());
        };
        let slot_off = LocalFrame::slot_off(slot);
        self.max_offset = self.max_offset.max(slot_off);
        if !self.code.store_local(slot_off) {
            return false;
        }

        if !self.expect(TokenKind::LBrace, "'{'") {
            return false;
        }
        if !self.code.emit8(0xE9) {
            return false;
        }
        let entry_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }

        let mut cases: Vec<(i32, usize)> = Vec::new();
        let mut default_target: Option<usize> = None;
        let mut breaks = Vec::new();
        while self.cur.kind != TokenKind::RBrace && self.cur.kind != TokenKind::Eof {
            if self.cur.kind == TokenKind::Case {
                if cases.len() >= MAX_PATCHES {
                    return self.fail("too many switch cases".to_string());
                }
                self.advance();
                let value = if self.cur.kind == TokenKind::IntLit {
                    self.cur.value
                } else if self.cur.kind == TokenKind::Ident
                    && consts::ident_maybe_const(&self.cur.text)
                {
                    match consts::fold_ident(self.macros, &self.cur.text) {
                        Some(v) => v,
                        None => return self.fail("case label expects an integer constant".to_string()),
                    }
                } else {
                    return self.fail("case label expects an integer constant".to_string());
                };
                cases.push((value, self.code.pos()));
                self.advance();
                if !self.expect(TokenKind::Colon, "':'") {
                    return false;
                }
                continue;
            }
            if self.cur.kind == TokenKind::Default {
                self.advance();
                if !self.expect(TokenKind::Colon, "':'") {
                    return false;
                }
                default_target = Some(self.code.pos());
                continue;
            }
            let body_ctx = StmtCtx {
                breaks: Some(&mut breaks),
                conts: ctx.conts.as_deref_mut(),
                in_loop: ctx.in_loop,
            };
            if !self.statement(body_ctx) {
                return false;
            }
        }
        if !self.expect(TokenKind::RBrace, "'}'") {
            return false;
        }

        // Fall through from the last body statement jumps to the end.
        if !self.code.emit8(0xE9) {
            return false;
        }
        let end_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }

        let dispatch_pos = self.code.pos();
        self.code.patch_rel32(entry_patch, dispatch_pos);
        for (value, target) in &cases {
            if !(self.code.load_local(slot_off) && self.code.emit8(0x3D) && self.code.emit32le(*value)) {
                return false;
            }
            if !(self.code.emit8(0x0F) && self.code.emit8(0x84)) {
                return false;
            }
            let site = self.code.pos();
            if !self.code.emit32le(0) {
                return false;
            }
            self.code.patch_rel32(site, *target);
        }
        if !self.code.emit8(0xE9) {
            return false;
        }
        let fall_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }

        let end_pos = self.code.pos();
        self.code.patch_rel32(fall_patch, default_target.unwrap_or(end_pos));
        self.code.patch_rel32(end_patch, end_pos);
        for site in breaks {
            self.code.patch_rel32(site, end_pos);
        }
        if let Some(restore) = self.scopes.pop() {
            self.locals.truncate(restore);
            self.arrays.pop_to(restore);
        }
        true
    }

    /// `(name) = expr;` and friends: a bounded look-ahead routes
    /// parenthesised lvalues through the ordinary update path. `None` means
    /// the look-ahead did not match and the lexer was rewound.
    fn try_paren_lvalue(&mut self) -> Option<bool> {
        let saved = self.save();
        self.advance();
        if self.cur.kind == TokenKind::Ident {
            let mut pname = self.cur.text.clone();
            self.advance();
            let mut ok = true;
            while self.cur.kind == TokenKind::Dot {
                self.advance();
                if self.cur.kind != TokenKind::Ident {
                    ok = false;
                    break;
                }
                pname = append_dot_field(&pname, &self.cur.text);
                self.advance();
            }
            if ok && self.cur.kind == TokenKind::RParen {
                self.advance();
                if self.cur.kind.is_assign_op() {
                    if !self.local_update(&pname) {
                        return Some(self.fail(format!("parenthesised update failed for '{}'", pname)));
                    }
                    return Some(self.expect(TokenKind::Semi, "';'"));
                }
            }
        }
        self.restore(saved);
        None
    }

    /// `*expr = expr;` stores through a computed pointer.
    fn stmt_store_through(&mut self) -> bool {
        self.advance();
        if !self.expr(11) {
            return false;
        }
        if !self.code.push_eax() {
            return false;
        }
        if self.cur.kind != TokenKind::Eq {
            return self.fail("expected '=' after '*pointer'".to_string());
        }
        self.advance();
        if !self.expr(1) {
            return false;
        }
        if !(self.code.pop_edx() && self.code.store_ptr_edx_eax()) {
            return false;
        }
        self.expect(TokenKind::Semi, "';'")
    }

    /// Update of a named local or global: `++`/`--`, `=`, or `op=`. The
    /// operator is the current token. Shared by `for` init/post and the
    /// parenthesised-lvalue statement.
    pub(crate) fn local_update(&mut self, name: &str) -> bool {
        #[derive(Clone, Copy)]
        enum Target {
            Local(i32),
            Global(u32, bool),
        }
        let target = if let Some(idx) = self.locals.find(name) {
            Target::Local(LocalFrame::slot_off(idx))
        } else if let Some(gidx) = self.globals.find(name) {
            Target::Global(self.globals.addr(gidx), self.globals.get(gidx).elem_size == 1)
        } else {
            return self.fail(format!("unknown name '{}'", name));
        };
        let load = |cg: &mut Self| match target {
            Target::Local(off) => cg.code.load_local(off),
            Target::Global(addr, byte) => cg.code.load_global(addr, byte),
        };
        let store = |cg: &mut Self| match target {
            Target::Local(off) => cg.code.store_local(off),
            Target::Global(addr, byte) => cg.code.store_global_from_eax(addr, byte),
        };
        let op = self.cur.kind;
        if matches!(op, TokenKind::PlusPlus | TokenKind::MinusMinus) {
            self.advance();
            let adjusted = load(self)
                && if op == TokenKind::PlusPlus {
                    self.code.add_eax_1()
                } else {
                    self.code.sub_eax_1()
                };
            return adjusted && store(self);
        }
        if op == TokenKind::Eq {
            self.advance();
            if !self.expr(1) {
                return false;
            }
            return store(self);
        }
        if op.is_compound_assign() {
            self.advance();
            if !(load(self) && self.code.push_eax()) {
                return false;
            }
            if !self.expr(1) {
                return false;
            }
            if !(self.code.pop_ecx() && self.apply_compound(op)) {
                return false;
            }
            return store(self);
        }
        self.fail("expected an assignment operator".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Runs the parser over unpreprocessed source with an explicit macro
    // table, so constant names reach the case-label path unsubstituted.
    fn run_with_macros(src: &str, macros: &MacroTable) -> (bool, u32) {
        let builtins = Builtins::new();
        let host = OsHost;
        let mut cg = CodeGen::new(src.as_bytes(), macros, &builtins, &host);
        let ok = cg.run();
        (ok, cg.failures)
    }

    #[test]
    fn case_labels_fold_all_caps_constants() {
        let mut macros = MacroTable::new();
        macros.set("MODE_B", b"2");
        let (ok, failures) = run_with_macros(
            "int main(){ switch(2){ case MODE_B: return 7; } return 1; }",
            &macros,
        );
        assert!(ok);
        assert_eq!(failures, 0);
    }

    #[test]
    fn case_labels_fold_dialect_constants() {
        let macros = MacroTable::new();
        let (ok, failures) = run_with_macros(
            "int main(){ switch(0x100){ case O_CREAT: return 7; } return 1; }",
            &macros,
        );
        assert!(ok);
        assert_eq!(failures, 0);
    }

    #[test]
    fn lowercase_macro_names_are_not_case_labels() {
        let mut macros = MacroTable::new();
        macros.set("lo", b"5");
        let (ok, failures) = run_with_macros(
            "int main(){ switch(1){ case lo: return 0; } return 1; }",
            &macros,
        );
        assert!(!ok);
        assert!(failures > 0);
    }
}
