
use paste::paste;

use super::*;

/// Capacity-bounded code buffer. The emit cursor advances monotonically
/// except during patches; a failed emit leaves no partial instruction behind
/// the caller's production boundary (the caller abandons the production).
pub struct CodeBuf {
    bytes: Vec<u8>,
    max: usize,
}

macro_rules! ops {
    ($($fn_name:ident => ($mnemonic:literal, [$($byte:expr),+])),* $(,)?) => {
        paste! {
            impl CodeBuf {
                $(
                    #[doc = concat!("`", $mnemonic, "`")]
                    pub fn $fn_name(&mut self) -> bool {
                        self.emit_seq(Self::[<$fn_name:upper>])
                    }
                )*
            }

            impl CodeBuf {
                $(
                    pub const [<$fn_name:upper>]: &'static [u8] = &[$($byte),+];
                )*
            }
        }
    };
}

// Fixed-encoding instructions the code generator relies on. Values travel in
// %eax; %ecx holds the popped left operand of a binary node; %edx holds
// addresses for indirect loads and stores.
ops! {
    push_eax => ("push eax", [0x50]),
    pop_eax => ("pop eax", [0x58]),
    push_edx => ("push edx", [0x52]),
    pop_edx => ("pop edx", [0x5A]),
    pop_ecx => ("pop ecx", [0x59]),
    mov_edx_eax => ("mov edx,eax", [0x89, 0xC2]),
    mov_eax_edx => ("mov eax,edx", [0x89, 0xD0]),
    mov_eax_ecx => ("mov eax,ecx", [0x89, 0xC8]),
    mov_ebx_eax => ("mov ebx,eax", [0x89, 0xC3]),
    mov_ecx_edx => ("mov ecx,edx", [0x89, 0xD1]),
    add_edx_eax => ("add edx,eax", [0x01, 0xC2]),
    add_ecx_eax => ("add ecx,eax", [0x01, 0xC1]),
    sub_ecx_eax => ("sub ecx,eax", [0x29, 0xC1]),
    imul_ecx_eax => ("imul ecx,eax", [0x0F, 0xAF, 0xC8]),
    and_ecx_eax => ("and ecx,eax", [0x21, 0xC1]),
    or_ecx_eax => ("or ecx,eax", [0x09, 0xC1]),
    xor_ecx_eax => ("xor ecx,eax", [0x31, 0xC1]),
    and_eax_ecx => ("and eax,ecx", [0x21, 0xC8]),
    or_eax_ecx => ("or eax,ecx", [0x09, 0xC8]),
    cmp_ecx_eax => ("cmp ecx,eax", [0x39, 0xC1]),
    cmp_eax_0 => ("cmp eax,0", [0x83, 0xF8, 0x00]),
    cmp_ecx_0 => ("cmp ecx,0", [0x83, 0xF9, 0x00]),
    test_eax_eax => ("test eax,eax", [0x85, 0xC0]),
    sete_al => ("sete al", [0x0F, 0x94, 0xC0]),
    setne_al => ("setne al", [0x0F, 0x95, 0xC0]),
    setne_cl => ("setne cl", [0x0F, 0x95, 0xC1]),
    movzx_eax_al => ("movzx eax,al", [0x0F, 0xB6, 0xC0]),
    movzx_ecx_cl => ("movzx ecx,cl", [0x0F, 0xB6, 0xC9]),
    cdq => ("cdq", [0x99]),
    idiv_ebx => ("idiv ebx", [0xF7, 0xFB]),
    not_eax => ("not eax", [0xF7, 0xD0]),
    neg_eax => ("neg eax", [0xF7, 0xD8]),
    add_eax_1 => ("add eax,1", [0x83, 0xC0, 0x01]),
    sub_eax_1 => ("sub eax,1", [0x83, 0xE8, 0x01]),
    shl_eax_cl => ("shl eax,cl", [0xD3, 0xE0]),
    sar_eax_cl => ("sar eax,cl", [0xD3, 0xF8]),
    shl_eax_2 => ("shl eax,2", [0xC1, 0xE0, 0x02]),
    load_eax_ptr_edx => ("mov eax,[edx]", [0x8B, 0x02]),
    load_eax_u8_ptr_edx => ("movzx eax,byte [edx]", [0x0F, 0xB6, 0x02]),
    store_ptr_edx_eax => ("mov [edx],eax", [0x89, 0x02]),
    store_u8_ptr_edx_eax => ("mov [edx],al", [0x88, 0x02]),
    call_eax => ("call eax", [0xFF, 0xD0]),
    epilogue => ("mov esp,ebp; pop ebp; ret", [0x89, 0xEC, 0x5D, 0xC3]),
}

impl CodeBuf {
    pub fn new(max: usize) -> CodeBuf {
        CodeBuf {
            bytes: Vec::new(),
            max,
        }
    }

    pub fn pos(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn emit8(&mut self, v: u8) -> bool {
        if self.bytes.len() >= self.max {
            log::error!("code buffer exhausted at {} bytes", self.max);
            return false;
        }
        self.bytes.push(v);
        true
    }

    pub fn emit32le(&mut self, v: i32) -> bool {
        v.to_le_bytes().iter().all(|&b| self.emit8(b))
    }

    fn emit_seq(&mut self, seq: &[u8]) -> bool {
        seq.iter().all(|&b| self.emit8(b))
    }

    /// `setcc al` for an arbitrary condition byte (`0x94` = sete, `0x9C` =
    /// setl, ...).
    pub fn setcc_al(&mut self, cc: u8) -> bool {
        self.emit8(0x0F) && self.emit8(cc) && self.emit8(0xC0)
    }

    /// `mov eax, imm32`
    pub fn mov_eax_imm(&mut self, v: i32) -> bool {
        self.emit8(0xB8) && self.emit32le(v)
    }

    /// `mov eax, [ebp - off]`, a local slot load.
    pub fn load_local(&mut self, off: i32) -> bool {
        self.emit8(0x8B) && self.emit8(0x85) && self.emit32le(-off)
    }

    /// `mov [ebp - off], eax`
    pub fn store_local(&mut self, off: i32) -> bool {
        self.emit8(0x89) && self.emit8(0x85) && self.emit32le(-off)
    }

    /// `mov eax, [ebp + disp]`, an incoming cdecl argument.
    pub fn load_arg(&mut self, disp: i32) -> bool {
        self.emit8(0x8B) && self.emit8(0x85) && self.emit32le(disp)
    }

    /// `lea edx, [ebp - off]`
    pub fn lea_edx_local(&mut self, off: i32) -> bool {
        self.emit8(0x8D) && self.emit8(0x95) && self.emit32le(-off)
    }

    /// `add esp, imm8`, the cdecl argument-stack cleanup.
    pub fn add_esp_imm8(&mut self, n: i32) -> bool {
        self.emit8(0x83) && self.emit8(0xC4) && self.emit8(n as u8)
    }

    /// `add edx, imm32`; a zero displacement emits nothing.
    pub fn add_edx_imm(&mut self, imm: i32) -> bool {
        if imm == 0 {
            return true;
        }
        self.emit8(0x81) && self.emit8(0xC2) && self.emit32le(imm)
    }

    /// Scales the index in `%eax` by an element size: shifts for 2 and 4,
    /// `imul` for anything larger, nothing for bytes.
    pub fn scale_eax(&mut self, elem_size: i32) -> bool {
        match elem_size {
            i32::MIN..=1 => true,
            2 => self.emit8(0xC1) && self.emit8(0xE0) && self.emit8(0x01),
            4 => self.shl_eax_2(),
            n => self.emit8(0x69) && self.emit8(0xC0) && self.emit32le(n),
        }
    }

    /// Absolute-address word or zero-extended byte load into `%eax`.
    pub fn load_global(&mut self, addr: u32, byte: bool) -> bool {
        if !(self.mov_eax_imm(addr as i32) && self.mov_edx_eax()) {
            return false;
        }
        if byte {
            self.load_eax_u8_ptr_edx()
        } else {
            self.load_eax_ptr_edx()
        }
    }

    /// Stores `%eax` to an absolute address, preserving the value in `%eax`.
    pub fn store_global_from_eax(&mut self, addr: u32, byte: bool) -> bool {
        if !(self.push_eax() && self.mov_eax_imm(addr as i32) && self.mov_edx_eax() && self.pop_eax()) {
            return false;
        }
        if byte {
            self.store_u8_ptr_edx_eax()
        } else {
            self.store_ptr_edx_eax()
        }
    }

    /// Fast path for character output: `push imm; call abs; add esp,4`.
    pub fn putchar_imm(&mut self, ch: u8, putchar_addr: u32) -> bool {
        self.mov_eax_imm(ch as i32)
            && self.push_eax()
            && self.mov_eax_imm(putchar_addr as i32)
            && self.call_eax()
            && self.add_esp_imm8(4)
    }

    /// Function prologue; returns the patch site of the frame immediate.
    pub fn prologue(&mut self) -> Option<usize> {
        if !(self.emit8(0x55) && self.emit8(0x89) && self.emit8(0xE5) && self.emit8(0x81) && self.emit8(0xEC)) {
            return None;
        }
        let site = self.pos();
        if !self.emit32le(0) {
            return None;
        }
        Some(site)
    }

    /// Overwrites the 4 bytes at `site` with an absolute little-endian value
    /// (frame sizes, not displacements).
    pub fn patch_abs32(&mut self, site: usize, value: i32) {
        self.bytes[site..site + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Back-fills a rel32 displacement: `target - (site + 4)`.
    pub fn patch_rel32(&mut self, site: usize, target: usize) {
        let rel = target as i64 - (site as i64 + 4);
        self.bytes[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    /// Back-fills a rel32 against an absolute target (builtin calls):
    /// `target_abs - (CODE_BASE + site + 4)`.
    pub fn patch_rel32_abs(&mut self, site: usize, target_abs: u32) {
        let from = CODE_BASE as i64 + site as i64 + 4;
        let rel = target_abs as i64 - from;
        self.bytes[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    pub fn rel32_at(&self, site: usize) -> i32 {
        i32::from_le_bytes(self.bytes[site..site + 4].try_into().unwrap())
    }

    pub fn byte_at(&self, pos: usize) -> u8 {
        self.bytes[pos]
    }
}

/// Growable-in-place, capacity-bounded data segment image. Globals and
/// string literals are laid out here; word allocations are 4-aligned by
/// zero padding.
pub struct DataSegment {
    bytes: Vec<u8>,
    max: usize,
}

impl DataSegment {
    pub fn new(max: usize) -> DataSegment {
        DataSegment {
            bytes: Vec::new(),
            max,
        }
    }

    pub fn pos(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// Zero-initialised allocation aligned to `align`; returns the segment
    /// offset, or None when the segment is exhausted.
    pub fn alloc_zero(&mut self, size: usize, align: usize) -> Option<usize> {
        let size = size.max(1);
        let align = align.max(1);
        while self.bytes.len() % align != 0 {
            if self.bytes.len() >= self.max {
                return None;
            }
            self.bytes.push(0);
        }
        let off = self.bytes.len();
        if off + size > self.max {
            return None;
        }
        self.bytes.resize(off + size, 0);
        Some(off)
    }

    /// Emits a NUL-terminated string literal slot; returns its offset.
    pub fn add_string(&mut self, s: &[u8]) -> Option<usize> {
        if self.bytes.len() + s.len() + 1 > self.max {
            return None;
        }
        let off = self.bytes.len();
        self.bytes.extend_from_slice(s);
        self.bytes.push(0);
        Some(off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_is_bounds_checked() {
        let mut code = CodeBuf::new(4);
        assert!(code.emit32le(-1));
        assert!(!code.emit8(0x90));
        assert_eq!(code.pos(), 4);
    }

    #[test]
    fn local_slots_encode_negative_ebp_displacements() {
        let mut code = CodeBuf::new(64);
        assert!(code.load_local(8));
        assert_eq!(code.bytes()[..2], [0x8B, 0x85]);
        assert_eq!(code.rel32_at(2), -8);
        assert!(code.store_local(4));
        assert_eq!(code.rel32_at(8), -4);
    }

    #[test]
    fn rel32_patch_math_holds() {
        let mut code = CodeBuf::new(64);
        code.emit8(0xE9);
        let site = code.pos();
        code.emit32le(0);
        for _ in 0..7 {
            code.emit8(0x90);
        }
        let target = code.pos();
        code.patch_rel32(site, target);
        assert_eq!(target as i64, site as i64 + 4 + code.rel32_at(site) as i64);
    }

    #[test]
    fn abs_patch_is_relative_to_linked_address() {
        let mut code = CodeBuf::new(64);
        code.emit8(0xE8);
        let site = code.pos();
        code.emit32le(0);
        code.patch_rel32_abs(site, 0x0010_0460);
        let rel = code.rel32_at(site) as i64;
        assert_eq!(0x0010_0460, CODE_BASE as i64 + site as i64 + 4 + rel);
    }

    #[test]
    fn scale_picks_shift_or_imul() {
        let mut code = CodeBuf::new(64);
        assert!(code.scale_eax(1));
        assert_eq!(code.pos(), 0);
        assert!(code.scale_eax(4));
        assert_eq!(code.bytes(), CodeBuf::SHL_EAX_2);
        let start = code.pos();
        assert!(code.scale_eax(12));
        assert_eq!(code.bytes()[start..start + 2], [0x69, 0xC0]);
    }

    #[test]
    fn opcode_tables_match_helpers() {
        let mut code = CodeBuf::new(64);
        assert!(code.mov_edx_eax());
        assert!(code.load_eax_u8_ptr_edx());
        assert!(code.epilogue());
        let expected: Vec<u8> = [
            CodeBuf::MOV_EDX_EAX,
            CodeBuf::LOAD_EAX_U8_PTR_EDX,
            CodeBuf::EPILOGUE,
        ]
        .concat();
        assert_eq!(code.bytes(), expected);
    }

    #[test]
    fn prologue_reserves_a_frame_patch() {
        let mut code = CodeBuf::new(64);
        let site = code.prologue().unwrap();
        assert_eq!(code.bytes()[..5], [0x55, 0x89, 0xE5, 0x81, 0xEC]);
        code.patch_abs32(site, 0x60);
        assert_eq!(code.rel32_at(site), 0x60);
    }

    #[test]
    fn data_allocations_are_aligned_and_zeroed() {
        let mut data = DataSegment::new(64);
        let s = data.add_string(b"hey").unwrap();
        assert_eq!(s, 0);
        assert_eq!(data.pos(), 4);
        data.add_string(b"x").unwrap();
        let w = data.alloc_zero(4, 4).unwrap();
        assert_eq!(w % 4, 0);
        assert!(data.bytes()[w..w + 4].iter().all(|&b| b == 0));
    }

    #[test]
    fn data_segment_is_bounded() {
        let mut data = DataSegment::new(8);
        assert!(data.alloc_zero(8, 1).is_some());
        assert!(data.alloc_zero(1, 1).is_none());
        assert!(data.add_string(b"").is_none());
    }
}
