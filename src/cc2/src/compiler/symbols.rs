
use super::*;

fn clamp_name(name: &str, max: usize) -> String {
    name.chars().take(max - 1).collect()
}

/// Joins `base.field`, clamped to the local-name budget.
pub fn append_dot_field(name: &str, field: &str) -> String {
    let mut out = String::from(name);
    out.push('.');
    out.push_str(field);
    clamp_name(&out, LOCAL_NAME_MAX)
}

/// Splits `base.field[.rest]`; `has_more` reports a second dot.
pub fn split_dotted(name: &str) -> Option<(String, String, bool)> {
    let dot = name.find('.')?;
    let base = &name[..dot];
    let rest = &name[dot + 1..];
    if rest.is_empty() {
        return None;
    }
    let (field, has_more) = match rest.find('.') {
        Some(d) => (&rest[..d], true),
        None => (rest, false),
    };
    if field.is_empty() {
        return None;
    }
    Some((base.to_string(), field.to_string(), has_more))
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub off: i32,
    pub size: i32,
    pub elem_size: i32,
    pub is_array: bool,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Field>,
    pub size: i32,
}

/// Struct metadata table. Two builtin structs are pre-registered at reset so
/// the compiler can bootstrap on its own token and macro records.
pub struct StructTable {
    defs: Vec<StructDef>,
}

impl StructTable {
    pub fn new() -> StructTable {
        let mut table = StructTable { defs: Vec::new() };
        table.reset();
        table
    }

    pub fn reset(&mut self) {
        self.defs.clear();
        let tok = self.add("cc2_token").unwrap();
        self.add_field(tok, "type", 4, 4, false);
        self.add_field(tok, "int_val", 4, 4, false);
        self.add_field(tok, "text", 256, 1, true);
        let def = self.add("cc2_define").unwrap();
        self.add_field(def, "name", PP_NAME_MAX as i32, 1, true);
        self.add_field(def, "body", PP_BODY_MAX as i32, 1, true);
        self.add_field(def, "is_func", 4, 4, false);
        self.add_field(def, "param_count", 4, 4, false);
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.defs.iter().position(|d| d.name == name)
    }

    /// Registers a struct; redefinition clears the previous field list.
    pub fn add(&mut self, name: &str) -> Option<usize> {
        let name = clamp_name(name, STRUCT_NAME_MAX);
        if let Some(si) = self.find(&name) {
            self.defs[si].fields.clear();
            self.defs[si].size = 0;
            return Some(si);
        }
        if self.defs.len() >= MAX_STRUCTS {
            return None;
        }
        self.defs.push(StructDef {
            name,
            fields: Vec::new(),
            size: 0,
        });
        Some(self.defs.len() - 1)
    }

    /// Appends a field at the next naturally aligned offset. Alignment is
    /// the lesser of the element size and 4.
    pub fn add_field(&mut self, si: usize, name: &str, size: i32, elem_size: i32, is_array: bool) -> bool {
        let def = &mut self.defs[si];
        if def.fields.len() >= MAX_STRUCT_FIELDS {
            return false;
        }
        let size = if size <= 0 { 4 } else { size };
        let elem_size = if elem_size <= 0 { 4 } else { elem_size };
        let align = elem_size.min(4).max(1);
        let mut off = def.size;
        while off % align != 0 {
            off += 1;
        }
        def.fields.push(Field {
            name: clamp_name(name, STRUCT_NAME_MAX),
            off,
            size,
            elem_size,
            is_array,
        });
        def.size = off + size;
        true
    }

    pub fn def(&self, si: usize) -> &StructDef {
        &self.defs[si]
    }

    pub fn size(&self, si: usize) -> i32 {
        self.defs[si].size
    }

    pub fn field_index(&self, si: usize, fname: &str) -> Option<usize> {
        self.defs[si].fields.iter().position(|f| f.name == fname)
    }
}

impl Default for StructTable {
    fn default() -> StructTable {
        StructTable::new()
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    /// Byte offset within the data segment.
    pub off: usize,
    pub size: usize,
    pub elem_size: i32,
    pub is_array: bool,
    /// Referenced struct for struct-pointer globals.
    pub struct_si: Option<usize>,
}

/// Global table. Struct variables are flattened: the base entry owns the
/// raw bytes and each field is an alias entry sharing the base offset, so
/// `base.field` resolves through ordinary lookup.
pub struct GlobalTable {
    entries: Vec<Global>,
}

impl GlobalTable {
    pub fn new() -> GlobalTable {
        GlobalTable { entries: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|g| g.name == name)
    }

    pub fn get(&self, idx: usize) -> &Global {
        &self.entries[idx]
    }

    pub fn set_struct_si(&mut self, idx: usize, si: usize) {
        self.entries[idx].struct_si = Some(si);
    }

    /// Allocates backing bytes in the data segment and registers the entry.
    /// Byte-element globals pack; everything else aligns to 4.
    pub fn add(
        &mut self,
        name: &str,
        size: usize,
        elem_size: i32,
        is_array: bool,
        data: &mut DataSegment,
    ) -> Option<usize> {
        let name = clamp_name(name, GLOBAL_NAME_MAX);
        if let Some(idx) = self.find(&name) {
            return Some(idx);
        }
        if self.entries.len() >= MAX_GLOBALS {
            return None;
        }
        let elem_size = if elem_size <= 0 { 4 } else { elem_size };
        let align = if elem_size == 1 { 1 } else { 4 };
        let off = data.alloc_zero(size, align)?;
        self.entries.push(Global {
            name,
            off,
            size,
            elem_size,
            is_array,
            struct_si: None,
        });
        Some(self.entries.len() - 1)
    }

    /// Registers an alias sharing a previously allocated offset.
    pub fn add_alias(&mut self, name: &str, off: usize, size: usize, elem_size: i32, is_array: bool) -> Option<usize> {
        let name = clamp_name(name, GLOBAL_NAME_MAX);
        if let Some(idx) = self.find(&name) {
            return Some(idx);
        }
        if self.entries.len() >= MAX_GLOBALS {
            return None;
        }
        self.entries.push(Global {
            name,
            off,
            size: if size == 0 { elem_size.max(1) as usize } else { size },
            elem_size: if elem_size <= 0 { 4 } else { elem_size },
            is_array,
            struct_si: None,
        });
        Some(self.entries.len() - 1)
    }

    /// Absolute linked address of a global.
    pub fn addr(&self, idx: usize) -> u32 {
        DATA_BASE + self.entries[idx].off as u32
    }
}

impl Default for GlobalTable {
    fn default() -> GlobalTable {
        GlobalTable::new()
    }
}

/// Function name → code-buffer offset of the prologue.
pub struct FunctionTable {
    entries: Vec<(String, usize)>,
}

impl FunctionTable {
    pub fn new() -> FunctionTable {
        FunctionTable { entries: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    pub fn pos(&self, idx: usize) -> usize {
        self.entries[idx].1
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.entries[idx].0
    }

    /// A redefinition updates the recorded offset in place.
    pub fn add(&mut self, name: &str, pos: usize) -> bool {
        let name = clamp_name(name, FN_NAME_MAX);
        if let Some(idx) = self.find(&name) {
            self.entries[idx].1 = pos;
            return true;
        }
        if self.entries.len() >= MAX_FUNCS {
            return false;
        }
        self.entries.push((name, pos));
        true
    }
}

impl Default for FunctionTable {
    fn default() -> FunctionTable {
        FunctionTable::new()
    }
}

/// A call whose rel32 could not be patched at the call site.
#[derive(Debug, Clone)]
pub struct CallPatch {
    pub name: String,
    pub site: usize,
}

/// Per-function local frame. Slot `i` maps to `[ebp - (i+1)*4]`; all locals
/// are 4-byte words. Array reservations occupy unnamed slots. A parallel
/// column remembers the struct index of struct-pointer locals.
pub struct LocalFrame {
    names: Vec<String>,
    struct_si: Vec<Option<usize>>,
}

impl LocalFrame {
    pub fn new() -> LocalFrame {
        LocalFrame {
            names: Vec::new(),
            struct_si: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.names.clear();
        self.struct_si.clear();
    }

    pub fn count(&self) -> usize {
        self.names.len()
    }

    pub fn slot_off(idx: usize) -> i32 {
        ((idx + 1) * 4) as i32
    }

    pub fn push(&mut self, name: &str) -> Option<usize> {
        if self.names.len() >= MAX_LOCALS {
            return None;
        }
        self.names.push(clamp_name(name, LOCAL_NAME_MAX));
        self.struct_si.push(None);
        Some(self.names.len() - 1)
    }

    /// Reserves `len` anonymous slots for a local array body.
    pub fn reserve(&mut self, len: usize) -> bool {
        if self.names.len() + len > MAX_LOCALS {
            return false;
        }
        for _ in 0..len {
            self.names.push(String::new());
            self.struct_si.push(None);
        }
        true
    }

    /// Innermost-first lookup, so shadowed outer locals lose.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.names.iter().rposition(|n| !n.is_empty() && n == name)
    }

    pub fn find_in_scope(&self, scope_base: usize, name: &str) -> Option<usize> {
        self.names[scope_base..]
            .iter()
            .rposition(|n| !n.is_empty() && n == name)
            .map(|i| i + scope_base)
    }

    /// Finds the first flattened field slot of a struct local, i.e. the
    /// lowest slot named `base.something`.
    pub fn find_struct_base(&self, name: &str) -> Option<usize> {
        let prefix = format!("{}.", name);
        self.names.iter().position(|n| n.starts_with(&prefix))
    }

    pub fn truncate(&mut self, count: usize) {
        self.names.truncate(count);
        self.struct_si.truncate(count);
    }

    pub fn struct_si(&self, idx: usize) -> Option<usize> {
        self.struct_si[idx]
    }

    pub fn set_struct_si(&mut self, idx: usize, si: Option<usize>) {
        self.struct_si[idx] = si;
    }
}

impl Default for LocalFrame {
    fn default() -> LocalFrame {
        LocalFrame::new()
    }
}

#[derive(Debug, Clone)]
pub struct LocalArray {
    pub name: String,
    /// 1-based first slot of the array body.
    pub base: usize,
    pub len: usize,
}

/// Local arrays parallel to the frame; addressed by LEA from `%ebp` plus a
/// scaled index off the highest slot.
pub struct LocalArrays {
    entries: Vec<LocalArray>,
}

impl LocalArrays {
    pub fn new() -> LocalArrays {
        LocalArrays { entries: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn find(&self, name: &str) -> Option<&LocalArray> {
        self.entries.iter().rev().find(|a| a.name == name)
    }

    pub fn find_in_scope(&self, name: &str, scope_base: usize, local_count: usize) -> Option<&LocalArray> {
        self.entries
            .iter()
            .rev()
            .find(|a| a.name == name && a.base > scope_base && a.base <= local_count)
    }

    pub fn add(&mut self, name: &str, base: usize, len: usize) -> bool {
        if self.entries.len() >= MAX_LOCAL_ARRAYS {
            return false;
        }
        self.entries.push(LocalArray {
            name: clamp_name(name, LOCAL_NAME_MAX),
            base,
            len,
        });
        true
    }

    /// Drops entries whose body lies above the restored local count.
    pub fn pop_to(&mut self, local_count: usize) {
        while let Some(last) = self.entries.last() {
            if last.base <= local_count {
                break;
            }
            self.entries.pop();
        }
    }
}

impl Default for LocalArrays {
    fn default() -> LocalArrays {
        LocalArrays::new()
    }
}

/// Stack of local-count snapshots; `}` restores the count, implementing
/// lexical shadowing. The parameter layer sits at depth 0.
pub struct ScopeStack {
    starts: Vec<usize>,
}

impl ScopeStack {
    pub fn new() -> ScopeStack {
        ScopeStack { starts: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.starts.clear();
    }

    pub fn push(&mut self, local_count: usize) -> bool {
        if self.starts.len() >= MAX_SCOPES {
            return false;
        }
        self.starts.push(local_count);
        true
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.starts.pop()
    }

    pub fn current_base(&self) -> usize {
        self.starts.last().copied().unwrap_or(0)
    }
}

impl Default for ScopeStack {
    fn default() -> ScopeStack {
        ScopeStack::new()
    }
}

/// Resolved `p.field` access through a struct pointer.
#[derive(Debug, Clone)]
pub struct PtrField {
    pub base_is_global: bool,
    pub base_idx: usize,
    pub off: i32,
    pub elem_size: i32,
    pub is_array: bool,
    pub has_more: bool,
}

/// Resolves a dotted name whose base is a struct-pointer local or global.
/// Nested `p.a.b` is reported through `has_more` and rejected by callers.
pub fn resolve_ptr_field(
    locals: &LocalFrame,
    globals: &GlobalTable,
    structs: &StructTable,
    full_name: &str,
) -> Option<PtrField> {
    let (base, field, has_more) = split_dotted(full_name)?;
    let from_local = locals
        .find(&base)
        .and_then(|idx| locals.struct_si(idx).map(|si| (false, idx, si)));
    let from_global = || {
        globals
            .find(&base)
            .and_then(|idx| globals.get(idx).struct_si.map(|si| (true, idx, si)))
    };
    let (base_is_global, base_idx, si) = from_local.or_else(from_global)?;
    let fi = structs.field_index(si, &field)?;
    let f = &structs.def(si).fields[fi];
    Some(PtrField {
        base_is_global,
        base_idx,
        off: f.off,
        elem_size: if f.elem_size <= 0 { 4 } else { f.elem_size },
        is_array: f.is_array,
        has_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_structs_are_preregistered() {
        let structs = StructTable::new();
        let tok = structs.find("cc2_token").unwrap();
        assert_eq!(structs.size(tok), 264);
        let text = structs.field_index(tok, "text").unwrap();
        assert_eq!(structs.def(tok).fields[text].off, 8);
        assert!(structs.find("cc2_define").is_some());
    }

    #[test]
    fn fields_get_natural_alignment() {
        let mut structs = StructTable::new();
        let si = structs.add("mixed").unwrap();
        structs.add_field(si, "flag", 1, 1, false);
        structs.add_field(si, "word", 4, 4, false);
        structs.add_field(si, "tail", 1, 1, false);
        let def = structs.def(si);
        assert_eq!(def.fields[0].off, 0);
        assert_eq!(def.fields[1].off, 4);
        assert_eq!(def.fields[2].off, 8);
        assert_eq!(def.size, 9);
    }

    #[test]
    fn struct_redefinition_clears_fields() {
        let mut structs = StructTable::new();
        let si = structs.add("p").unwrap();
        structs.add_field(si, "x", 4, 4, false);
        let si2 = structs.add("p").unwrap();
        assert_eq!(si, si2);
        assert!(structs.def(si).fields.is_empty());
    }

    #[test]
    fn globals_pack_bytes_and_align_words() {
        let mut data = DataSegment::new(DATA_MAX);
        let mut globals = GlobalTable::new();
        let buf = globals.add("buf", 3, 1, true, &mut data).unwrap();
        let word = globals.add("word", 4, 4, false, &mut data).unwrap();
        assert_eq!(globals.get(buf).off, 0);
        assert_eq!(globals.get(word).off, 4);
        assert_eq!(globals.addr(word), DATA_BASE + 4);
        assert!(globals.get(word).off + globals.get(word).size <= data.pos());
    }

    #[test]
    fn alias_shares_the_base_offset() {
        let mut data = DataSegment::new(DATA_MAX);
        let mut globals = GlobalTable::new();
        let base = globals.add("v", 8, 4, false, &mut data).unwrap();
        let base_off = globals.get(base).off;
        let alias = globals.add_alias("v.y", base_off + 4, 4, 4, false).unwrap();
        assert_eq!(globals.get(alias).off, base_off + 4);
        assert_eq!(data.pos(), 8);
    }

    #[test]
    fn local_lookup_is_innermost_first() {
        let mut locals = LocalFrame::new();
        let outer = locals.push("x").unwrap();
        locals.push("y").unwrap();
        let inner = locals.push("x").unwrap();
        assert_eq!(locals.find("x"), Some(inner));
        locals.truncate(inner);
        assert_eq!(locals.find("x"), Some(outer));
    }

    #[test]
    fn frame_offsets_follow_the_slot_rule() {
        assert_eq!(LocalFrame::slot_off(0), 4);
        assert_eq!(LocalFrame::slot_off(7), 32);
    }

    #[test]
    fn scope_pop_truncates_arrays() {
        let mut locals = LocalFrame::new();
        let mut arrays = LocalArrays::new();
        let mut scopes = ScopeStack::new();
        locals.push("a").unwrap();
        assert!(scopes.push(locals.count()));
        let base = locals.count() + 1;
        locals.reserve(4);
        arrays.add("arr", base, 4);
        assert!(arrays.find("arr").is_some());
        let restore = scopes.pop().unwrap();
        locals.truncate(restore);
        arrays.pop_to(restore);
        assert!(arrays.find("arr").is_none());
        assert_eq!(locals.count(), 1);
    }

    #[test]
    fn local_capacity_is_enforced() {
        let mut locals = LocalFrame::new();
        for i in 0..MAX_LOCALS {
            assert!(locals.push(&format!("v{}", i)).is_some());
        }
        assert!(locals.push("overflow").is_none());
        assert!(!locals.reserve(1));
    }

    #[test]
    fn ptr_field_resolution_walks_the_struct() {
        let mut structs = StructTable::new();
        let si = structs.add("point").unwrap();
        structs.add_field(si, "x", 4, 4, false);
        structs.add_field(si, "y", 4, 4, false);
        let mut locals = LocalFrame::new();
        let p = locals.push("p").unwrap();
        locals.set_struct_si(p, Some(si));
        let globals = GlobalTable::new();
        let f = resolve_ptr_field(&locals, &globals, &structs, "p.y").unwrap();
        assert!(!f.base_is_global);
        assert_eq!(f.off, 4);
        assert!(!f.has_more);
        let nested = resolve_ptr_field(&locals, &globals, &structs, "p.y.z").unwrap();
        assert!(nested.has_more);
        assert!(resolve_ptr_field(&locals, &globals, &structs, "p.z").is_none());
    }

    #[test]
    fn dotted_name_splitting() {
        assert_eq!(
            split_dotted("a.b"),
            Some(("a".to_string(), "b".to_string(), false))
        );
        assert_eq!(
            split_dotted("a.b.c"),
            Some(("a".to_string(), "b".to_string(), true))
        );
        assert_eq!(split_dotted("abc"), None);
        assert_eq!(split_dotted("a."), None);
    }
}
