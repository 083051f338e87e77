//! Expression parser and code generator.
//!
//! Precedence climbing over the ten-level operator table. The value of
//! every sub-expression lands in `%eax`; binary nodes push the left operand,
//! evaluate the right, then pop into `%ecx` and combine.

use super::*;

/// The one lvalue the postfix `++`/`--` discipline may update in place.
/// Tracks which form the primary last parsed; anything else makes a
/// subsequent postfix operator illegal.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PostTarget {
    None,
    Local { off: i32 },
    Global { addr: u32, byte: bool },
}

impl<'a> CodeGen<'a> {
    pub(crate) fn expr(&mut self, min_prec: i32) -> bool {
        let post = match self.expr_primary() {
            Some(post) => post,
            None => return false,
        };

        // Postfix update: save the old value, adjust in place, result keeps
        // the old value.
        while matches!(self.cur.kind, TokenKind::PlusPlus | TokenKind::MinusMinus) {
            let inc = self.cur.kind == TokenKind::PlusPlus;
            let store_ok = match post {
                PostTarget::None => {
                    return self.fail("postfix update on a non-updatable expression".to_string());
                }
                PostTarget::Local { off } => {
                    self.code.push_eax()
                        && self.adjust_eax(inc)
                        && self.code.store_local(off)
                }
                PostTarget::Global { addr, byte } => {
                    self.code.push_eax()
                        && self.adjust_eax(inc)
                        && self.code.store_global_from_eax(addr, byte)
                }
            };
            if !(store_ok && self.code.pop_eax()) {
                return false;
            }
            self.advance();
        }

        loop {
            let op = self.cur.kind;
            let prec = op.precedence();
            if prec == 0 || prec < min_prec {
                break;
            }
            self.advance();
            if !self.code.push_eax() {
                return false;
            }
            if !self.expr(prec + 1) {
                return false;
            }
            if !self.code.pop_ecx() {
                return false;
            }
            if !self.combine(op) {
                return false;
            }
        }

        if min_prec <= 1 && self.cur.kind == TokenKind::Question {
            return self.ternary();
        }
        true
    }

    /// `add eax,1` / `sub eax,1`
    fn adjust_eax(&mut self, inc: bool) -> bool {
        if inc {
            self.code.add_eax_1()
        } else {
            self.code.sub_eax_1()
        }
    }

    fn expr_primary(&mut self) -> Option<PostTarget> {
        match self.cur.kind {
            TokenKind::Amp => {
                if self.expr_addr_of() {
                    Some(PostTarget::None)
                } else {
                    None
                }
            }
            TokenKind::Bang => {
                self.advance();
                let ok = self.expr(11)
                    && self.code.cmp_eax_0()
                    && self.code.sete_al()
                    && self.code.movzx_eax_al();
                ok.then_some(PostTarget::None)
            }
            TokenKind::Tilde => {
                self.advance();
                (self.expr(11) && self.code.not_eax()).then_some(PostTarget::None)
            }
            TokenKind::Minus => {
                self.advance();
                (self.expr(11) && self.code.neg_eax()).then_some(PostTarget::None)
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => self.expr_pre_update(),
            TokenKind::Star => {
                self.advance();
                let ok = self.expr(11) && self.code.mov_edx_eax() && self.code.load_eax_ptr_edx();
                ok.then_some(PostTarget::None)
            }
            TokenKind::IntLit => {
                let v = self.cur.value;
                if !self.code.mov_eax_imm(v) {
                    return None;
                }
                self.advance();
                Some(PostTarget::None)
            }
            TokenKind::String => {
                let Some(off) = self.data.add_string(self.cur.text.as_bytes()) else {
                    self.fail("data segment overflow for string literal".to_string());
                    return None;
                };
                if !self.code.mov_eax_imm((DATA_BASE + off as u32) as i32) {
                    return None;
                }
                self.advance();
                Some(PostTarget::None)
            }
            TokenKind::Ident => self.expr_ident(),
            TokenKind::LParen => {
                if self.expr_paren() {
                    Some(PostTarget::None)
                } else {
                    None
                }
            }
            other => {
                // A bare operator where an operand belongs behaves as a zero
                // operand; anything else is a parse error.
                if other.precedence() > 0 {
                    self.code.mov_eax_imm(0).then_some(PostTarget::None)
                } else {
                    self.fail("unexpected token in expression".to_string());
                    None
                }
            }
        }
    }

    /// `&name`, `&arr`, `&structvar`, `&p.field[i]`: address into `%eax`.
    fn expr_addr_of(&mut self) -> bool {
        self.advance();
        if self.cur.kind != TokenKind::Ident {
            return self.fail("expected identifier after '&'".to_string());
        }
        let mut name = self.cur.text.clone();
        self.advance();
        while self.cur.kind == TokenKind::Dot {
            self.advance();
            if self.cur.kind != TokenKind::Ident {
                return self.fail("expected field after '.'".to_string());
            }
            name = append_dot_field(&name, &self.cur.text);
            self.advance();
        }

        if let Some(idx) = self.locals.find(&name) {
            return self.code.lea_edx_local(LocalFrame::slot_off(idx)) && self.code.mov_eax_edx();
        }
        if let Some(arr) = self.arrays.find(&name) {
            let off = ((arr.base + arr.len - 1) * 4) as i32;
            return self.code.lea_edx_local(off) && self.code.mov_eax_edx();
        }
        if let Some(idx) = self.locals.find_struct_base(&name) {
            return self.code.lea_edx_local(LocalFrame::slot_off(idx)) && self.code.mov_eax_edx();
        }
        if let Some(pf) = resolve_ptr_field(&self.locals, &self.globals, &self.structs, &name) {
            if pf.has_more {
                return self.fail(format!("unsupported nested dotted value '{}'", name));
            }
            if !self.emit_ptr_field_addr(&pf) {
                return false;
            }
            if self.cur.kind == TokenKind::LBracket {
                if !pf.is_array {
                    return self.fail(format!("subscript on non-array field '{}'", name));
                }
                if !self.ptr_field_subscript(pf.elem_size) {
                    return false;
                }
            }
            return self.code.mov_eax_edx();
        }
        if let Some(gidx) = self.globals.find(&name) {
            let addr = self.globals.addr(gidx);
            return self.code.mov_eax_imm(addr as i32);
        }
        self.fail(format!("unknown name '{}'", name))
    }

    /// Pre-increment/decrement: load, adjust, store; the result is the new
    /// value. Only the local form stays eligible for a postfix update.
    fn expr_pre_update(&mut self) -> Option<PostTarget> {
        let inc = self.cur.kind == TokenKind::PlusPlus;
        self.advance();
        if self.cur.kind != TokenKind::Ident {
            self.fail(format!("expected identifier after '{}'", if inc { "++" } else { "--" }));
            return None;
        }
        let mut name = self.cur.text.clone();
        self.advance();
        while self.cur.kind == TokenKind::Dot {
            self.advance();
            if self.cur.kind != TokenKind::Ident {
                self.fail("expected field after '.'".to_string());
                return None;
            }
            name = append_dot_field(&name, &self.cur.text);
            self.advance();
        }
        if let Some(idx) = self.locals.find(&name) {
            let off = LocalFrame::slot_off(idx);
            let ok = self.code.load_local(off) && self.adjust_eax(inc) && self.code.store_local(off);
            return ok.then_some(PostTarget::Local { off });
        }
        let Some(gidx) = self.globals.find(&name) else {
            self.fail(format!("unknown name '{}'", name));
            return None;
        };
        let addr = self.globals.addr(gidx);
        let byte = self.globals.get(gidx).elem_size == 1;
        let ok = self.code.load_global(addr, byte)
            && self.adjust_eax(inc)
            && self.code.store_global_from_eax(addr, byte);
        ok.then_some(PostTarget::None)
    }

    /// Identifier primary: call, subscript, or a (possibly dotted) value
    /// resolved through the lookup order local → local array → global →
    /// struct-pointer field → compile-time constant → builtin address.
    fn expr_ident(&mut self) -> Option<PostTarget> {
        let folded = if consts::ident_maybe_const(&self.cur.text) {
            consts::fold_ident(self.macros, &self.cur.text)
        } else {
            None
        };
        let mut name = self.cur.text.clone();
        self.advance();

        if self.cur.kind == TokenKind::LParen {
            return if self.expr_call(&name) {
                Some(PostTarget::None)
            } else {
                None
            };
        }
        if self.cur.kind == TokenKind::LBracket {
            return if self.expr_subscript_load(&name) {
                Some(PostTarget::None)
            } else {
                None
            };
        }

        while self.cur.kind == TokenKind::Dot {
            self.advance();
            if self.cur.kind != TokenKind::Ident {
                self.fail("expected field after '.'".to_string());
                return None;
            }
            name = append_dot_field(&name, &self.cur.text);
            self.advance();
        }

        if let Some(idx) = self.locals.find(&name) {
            let off = LocalFrame::slot_off(idx);
            return self.code.load_local(off).then_some(PostTarget::Local { off });
        }
        if let Some(arr) = self.arrays.find(&name) {
            // Array names decay to the address of the first element.
            let off = ((arr.base + arr.len - 1) * 4) as i32;
            let ok = self.code.lea_edx_local(off) && self.code.mov_eax_edx();
            return ok.then_some(PostTarget::None);
        }
        if let Some(gidx) = self.globals.find(&name) {
            let addr = self.globals.addr(gidx);
            let g = self.globals.get(gidx);
            if g.is_array {
                return self.code.mov_eax_imm(addr as i32).then_some(PostTarget::None);
            }
            let byte = g.elem_size == 1;
            return self
                .code
                .load_global(addr, byte)
                .then_some(PostTarget::Global { addr, byte });
        }
        if let Some(pf) = resolve_ptr_field(&self.locals, &self.globals, &self.structs, &name) {
            if pf.has_more {
                self.fail(format!("unsupported nested dotted value '{}'", name));
                return None;
            }
            if !self.emit_ptr_field_addr(&pf) {
                return None;
            }
            if self.cur.kind == TokenKind::LBracket {
                if !pf.is_array {
                    self.fail(format!("subscript on non-array field '{}'", name));
                    return None;
                }
                if !self.ptr_field_subscript(pf.elem_size) {
                    return None;
                }
                let ok = if pf.elem_size == 1 {
                    self.code.load_eax_u8_ptr_edx()
                } else {
                    self.code.load_eax_ptr_edx()
                };
                return ok.then_some(PostTarget::None);
            }
            let ok = if pf.is_array {
                // An array field decays to its address.
                self.code.mov_eax_edx()
            } else if pf.elem_size == 1 {
                self.code.load_eax_u8_ptr_edx()
            } else {
                self.code.load_eax_ptr_edx()
            };
            return ok.then_some(PostTarget::None);
        }
        let folded = folded.or_else(|| {
            if consts::ident_maybe_const(&name) {
                consts::fold_ident(self.macros, &name)
            } else {
                None
            }
        });
        if let Some(v) = folded {
            if !self.code.mov_eax_imm(v) {
                return None;
            }
            // A constant used with a subscript consumes the index without
            // emitting an access; the folded value stands.
            if self.cur.kind == TokenKind::LBracket {
                self.advance();
                if !self.expr(1) {
                    return None;
                }
                if !self.expect(TokenKind::RBracket, "']'") {
                    return None;
                }
            }
            return Some(PostTarget::None);
        }
        if let Some(addr) = self.builtins.addr(&name) {
            // Builtin names are first-class values (function pointers).
            return self.code.mov_eax_imm(addr as i32).then_some(PostTarget::None);
        }
        self.fail(format!("unknown name '{}'", name));
        None
    }

    /// Call: arguments compile left-to-right into bounded scratch buffers,
    /// splice in reverse with `push eax` between, then `call rel32` with
    /// cdecl stack cleanup.
    pub(crate) fn expr_call(&mut self, name: &str) -> bool {
        if self.arg_depth >= ARG_STACK_DEPTH {
            return self.fail("argument scratch depth overflow".to_string());
        }
        self.arg_depth += 1;
        let ok = self.expr_call_inner(name);
        self.arg_depth -= 1;
        ok
    }

    fn expr_call_inner(&mut self, name: &str) -> bool {
        self.advance();
        let mut args: Vec<(CodeBuf, Vec<CallPatch>)> = Vec::new();
        while self.cur.kind != TokenKind::RParen {
            if args.len() >= MAX_CALL_ARGS {
                return self.fail(format!("too many call arguments for '{}'", name));
            }
            let (ok, scratch, patches) = self.with_scratch(ARG_CODE_MAX, |cg| cg.expr(1));
            if !ok {
                return false;
            }
            args.push((scratch, patches));
            if self.cur.kind == TokenKind::Comma {
                self.advance();
                continue;
            }
            break;
        }
        if !self.expect(TokenKind::RParen, "')'") {
            return false;
        }

        for (scratch, patches) in args.iter().rev() {
            if !self.splice(scratch, patches.clone()) {
                return false;
            }
            if !self.code.push_eax() {
                return false;
            }
        }
        let nargs = args.len();

        if !self.code.emit8(0xE8) {
            return false;
        }
        let site = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        if self.in_scratch {
            // Sites inside scratch code rebase at splice time, so even
            // known targets resolve through the patch table.
            if !self.queue_call_patch(name.to_string(), site) {
                return false;
            }
        } else if let Some(idx) = self.funcs.find(name) {
            let target = self.funcs.pos(idx);
            self.code.patch_rel32(site, target);
        } else if let Some(addr) = self.builtins.addr(name) {
            self.code.patch_rel32_abs(site, addr);
        } else if !self.queue_call_patch(name.to_string(), site) {
            return false;
        }
        if nargs > 0 && !self.code.add_esp_imm8((nargs * 4) as i32) {
            return false;
        }
        true
    }

    /// Subscript load `name[i]`. Word access for local/global arrays;
    /// byte access through pointers.
    fn expr_subscript_load(&mut self, name: &str) -> bool {
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
        let word = if let Some(arr) = &local_arr {
            let off = ((arr.base + arr.len - 1) * 4) as i32;
            if !(self.code.shl_eax_2() && self.code.lea_edx_local(off)) {
                return false;
            }
            true
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
            elem >= 4
        } else {
            let loaded = if let Some(addr) = global_ptr {
                self.code.push_eax() && self.code.load_global(addr, false)
            } else {
                self.code.push_eax() && self.code.load_local(LocalFrame::slot_off(local_ptr.unwrap()))
            };
            if !(loaded && self.code.mov_edx_eax() && self.code.pop_eax()) {
                return false;
            }
            false
        };
        if !self.code.add_edx_eax() {
            return false;
        }
        if word {
            self.code.load_eax_ptr_edx()
        } else {
            self.code.load_eax_u8_ptr_edx()
        }
    }

    /// Parenthesised expression, with a speculative cast sniff: a type name
    /// between the parentheses is consumed and ignored (all values are
    /// word-sized); otherwise the lexer rewinds and the parenthesis parses
    /// as grouping.
    fn expr_paren(&mut self) -> bool {
        let saved = self.save();
        self.advance();
        if self.cur.kind == TokenKind::Struct
            || self.cur.kind == TokenKind::IntKw
            || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
        {
            let mut cast_ok = true;
            if self.cur.kind == TokenKind::Struct {
                self.advance();
                if self.cur.kind == TokenKind::Ident {
                    self.advance();
                } else {
                    cast_ok = false;
                }
            } else {
                while self.cur.kind == TokenKind::IntKw
                    || (self.cur.kind == TokenKind::Ident && is_type_word(&self.cur.text))
                {
                    self.advance();
                }
            }
            while cast_ok && self.cur.kind == TokenKind::Star {
                self.advance();
            }
            if cast_ok && self.cur.kind == TokenKind::RParen {
                self.advance();
                return self.expr(11);
            }
        }
        self.restore(saved);
        self.advance();
        if !self.expr(1) {
            return false;
        }
        self.expect(TokenKind::RParen, "')'")
    }

    fn ternary(&mut self) -> bool {
        self.advance();
        if !(self.code.test_eax_eax() && self.code.emit8(0x0F) && self.code.emit8(0x84)) {
            return false;
        }
        let false_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        if !self.expr(1) {
            return false;
        }
        if !self.expect(TokenKind::Colon, "':'") {
            return false;
        }
        if !self.code.emit8(0xE9) {
            return false;
        }
        let end_patch = self.code.pos();
        if !self.code.emit32le(0) {
            return false;
        }
        let else_pos = self.code.pos();
        self.code.patch_rel32(false_patch, else_pos);
        if !self.expr(1) {
            return false;
        }
        let end_pos = self.code.pos();
        self.code.patch_rel32(end_patch, end_pos);
        true
    }

    /// `[p] + field_off` into `%edx`.
    pub(crate) fn emit_ptr_field_addr(&mut self, pf: &PtrField) -> bool {
        let loaded = if pf.base_is_global {
            let addr = self.globals.addr(pf.base_idx);
            self.code.load_global(addr, false)
        } else {
            self.code.load_local(LocalFrame::slot_off(pf.base_idx))
        };
        loaded && self.code.mov_edx_eax() && self.code.add_edx_imm(pf.off)
    }

    /// Scaled subscript added onto the address in `%edx`.
    pub(crate) fn ptr_field_subscript(&mut self, elem_size: i32) -> bool {
        if !self.expect(TokenKind::LBracket, "'['") {
            return false;
        }
        if !self.code.push_edx() {
            return false;
        }
        if !self.expr(1) {
            return false;
        }
        if !self.expect(TokenKind::RBracket, "']'") {
            return false;
        }
        self.code.scale_eax(elem_size) && self.code.pop_edx() && self.code.add_edx_eax()
    }

    /// Combines `%ecx` (left) and `%eax` (right) for one binary operator,
    /// leaving the result in `%eax`.
    fn combine(&mut self, op: TokenKind) -> bool {
        match op {
            TokenKind::Plus => self.code.add_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::Minus => self.code.sub_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::Star => self.code.imul_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::Slash => {
                self.code.mov_ebx_eax()
                    && self.code.mov_eax_ecx()
                    && self.code.cdq()
                    && self.code.idiv_ebx()
            }
            TokenKind::Percent => {
                self.code.mov_ebx_eax()
                    && self.code.mov_eax_ecx()
                    && self.code.cdq()
                    && self.code.idiv_ebx()
                    && self.code.mov_eax_edx()
            }
            TokenKind::EqEq
            | TokenKind::Ne
            | TokenKind::Lt
            | TokenKind::Le
            | TokenKind::Gt
            | TokenKind::Ge => {
                let cc = match op {
                    TokenKind::EqEq => 0x94,
                    TokenKind::Ne => 0x95,
                    TokenKind::Lt => 0x9C,
                    TokenKind::Le => 0x9E,
                    TokenKind::Gt => 0x9F,
                    _ => 0x9D,
                };
                self.code.cmp_ecx_eax() && self.code.setcc_al(cc) && self.code.movzx_eax_al()
            }
            TokenKind::Amp => self.code.and_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::Pipe => self.code.or_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::Caret => self.code.xor_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::Shl | TokenKind::Shr => {
                let ok = self.code.mov_edx_eax()
                    && self.code.mov_eax_ecx()
                    && self.code.mov_ecx_edx();
                ok && if op == TokenKind::Shl {
                    self.code.shl_eax_cl()
                } else {
                    self.code.sar_eax_cl()
                }
            }
            TokenKind::AndAnd | TokenKind::OrOr => {
                // Normalise both sides to 0/1 before the bitwise combine;
                // `||` renormalises the union.
                let norm = self.code.cmp_ecx_0()
                    && self.code.setne_cl()
                    && self.code.movzx_ecx_cl()
                    && self.code.cmp_eax_0()
                    && self.code.setne_al()
                    && self.code.movzx_eax_al();
                if !norm {
                    return false;
                }
                if op == TokenKind::AndAnd {
                    self.code.and_eax_ecx()
                } else {
                    self.code.or_eax_ecx()
                        && self.code.cmp_eax_0()
                        && self.code.setne_al()
                        && self.code.movzx_eax_al()
                }
            }
            _ => self.fail(format!("unsupported binary operator {}", op.name())),
        }
    }

    /// Shared compound-assignment arithmetic: lhs in `%ecx`, rhs in `%eax`,
    /// result in `%eax`.
    pub(crate) fn apply_compound(&mut self, op: TokenKind) -> bool {
        match op {
            TokenKind::PlusEq => self.code.add_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::MinusEq => self.code.sub_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::StarEq => self.code.imul_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::SlashEq | TokenKind::PercentEq => {
                let ok = self.code.mov_ebx_eax()
                    && self.code.mov_eax_ecx()
                    && self.code.cdq()
                    && self.code.idiv_ebx();
                ok && (op != TokenKind::PercentEq || self.code.mov_eax_edx())
            }
            TokenKind::AndEq => self.code.and_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::OrEq => self.code.or_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::XorEq => self.code.xor_ecx_eax() && self.code.mov_eax_ecx(),
            TokenKind::ShlEq | TokenKind::ShrEq => {
                let ok = self.code.mov_edx_eax()
                    && self.code.mov_eax_ecx()
                    && self.code.mov_ecx_edx();
                ok && if op == TokenKind::ShlEq {
                    self.code.shl_eax_cl()
                } else {
                    self.code.sar_eax_cl()
                }
            }
            _ => self.fail(format!("unsupported compound operator {}", op.name())),
        }
    }
}
