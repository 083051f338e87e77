
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::*;

/// File offset of the code image; the 128-byte region in front holds the
/// ELF header and up to two program headers, zero padded.
pub const IMAGE_HEADER_SIZE: usize = 128;
const EHDR_SIZE: u16 = 52;
const PHDR_SIZE: u16 = 32;

/// Segment permission flags of a program header.
///
/// | Flag   | Value | Description |
/// | ------ | ----- | ----------- |
/// | `PF_X` | `0x1` | Execute     |
/// | `PF_W` | `0x2` | Write       |
/// | `PF_R` | `0x4` | Read        |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFlags(pub u32);

impl SegmentFlags {
    pub const EXEC: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const READ: u32 = 0x4;

    pub fn check_flag(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// # ELF32 file header
///
/// The output is a statically linked 32-bit little-endian executable:
///
/// | Offset | Size | Field       | Value |
/// | ------ | ---- | ----------- | ----- |
/// | 0x00   | 4    | magic       | `7F 'E' 'L' 'F'` |
/// | 0x04   | 1    | EI_CLASS    | 1 (32-bit) |
/// | 0x05   | 1    | EI_DATA     | 1 (little-endian) |
/// | 0x06   | 1    | EI_VERSION  | 1 |
/// | 0x10   | 2    | e_type      | 2 (`ET_EXEC`) |
/// | 0x12   | 2    | e_machine   | 3 (`EM_386`) |
/// | 0x14   | 4    | e_version   | 1 |
/// | 0x18   | 4    | e_entry     | `CODE_BASE + main offset` |
/// | 0x1c   | 4    | e_phoff     | 52 |
/// | 0x28   | 2    | e_ehsize    | 52 |
/// | 0x2a   | 2    | e_phentsize | 32 |
/// | 0x2c   | 2    | e_phnum     | 1 or 2 |
///
/// No section headers are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: u32,
    pub phnum: u16,
}

impl ElfHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1]);
        out.resize(16, 0);
        out.write_u16::<LittleEndian>(2).unwrap(); // ET_EXEC
        out.write_u16::<LittleEndian>(3).unwrap(); // EM_386
        out.write_u32::<LittleEndian>(1).unwrap(); // EV_CURRENT
        out.write_u32::<LittleEndian>(self.entry).unwrap();
        out.write_u32::<LittleEndian>(u32::from(EHDR_SIZE)).unwrap(); // e_phoff
        out.write_u32::<LittleEndian>(0).unwrap(); // e_shoff
        out.write_u32::<LittleEndian>(0).unwrap(); // e_flags
        out.write_u16::<LittleEndian>(EHDR_SIZE).unwrap();
        out.write_u16::<LittleEndian>(PHDR_SIZE).unwrap();
        out.write_u16::<LittleEndian>(self.phnum).unwrap();
        out.resize(EHDR_SIZE as usize, 0);
    }

    pub fn from(slice: &[u8]) -> Result<ElfHeader, std::io::Error> {
        let invalid = |msg| std::io::Error::new(std::io::ErrorKind::InvalidData, msg);
        if slice.len() < EHDR_SIZE as usize {
            return Err(invalid("ELF header truncated"));
        }
        if slice[..4] != [0x7f, b'E', b'L', b'F'] {
            return Err(invalid("bad ELF magic"));
        }
        if slice[4] != 1 || slice[5] != 1 || slice[6] != 1 {
            return Err(invalid("not a 32-bit little-endian ELF"));
        }
        let mut cur = Cursor::new(&slice[16..]);
        let e_type = cur.read_u16::<LittleEndian>()?;
        let e_machine = cur.read_u16::<LittleEndian>()?;
        let _version = cur.read_u32::<LittleEndian>()?;
        let entry = cur.read_u32::<LittleEndian>()?;
        let _phoff = cur.read_u32::<LittleEndian>()?;
        let _shoff = cur.read_u32::<LittleEndian>()?;
        let _flags = cur.read_u32::<LittleEndian>()?;
        let _ehsize = cur.read_u16::<LittleEndian>()?;
        let _phentsize = cur.read_u16::<LittleEndian>()?;
        let phnum = cur.read_u16::<LittleEndian>()?;
        if e_type != 2 || e_machine != 3 {
            return Err(invalid("not an x86-32 executable"));
        }
        Ok(ElfHeader { entry, phnum })
    }
}

/// # ELF32 program header
///
/// | Offset | Size | Field    |
/// | ------ | ---- | -------- |
/// | 0x00   | 4    | p_type   |
/// | 0x04   | 4    | p_offset |
/// | 0x08   | 4    | p_vaddr  |
/// | 0x0c   | 4    | p_paddr  |
/// | 0x10   | 4    | p_filesz |
/// | 0x14   | 4    | p_memsz  |
/// | 0x18   | 4    | p_flags  |
/// | 0x1c   | 4    | p_align  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub offset: u32,
    pub vaddr: u32,
    pub size: u32,
    pub flags: SegmentFlags,
}

impl ProgramHeader {
    const PT_LOAD: u32 = 1;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(Self::PT_LOAD).unwrap();
        out.write_u32::<LittleEndian>(self.offset).unwrap();
        out.write_u32::<LittleEndian>(self.vaddr).unwrap();
        out.write_u32::<LittleEndian>(self.vaddr).unwrap(); // p_paddr
        out.write_u32::<LittleEndian>(self.size).unwrap(); // p_filesz
        out.write_u32::<LittleEndian>(self.size).unwrap(); // p_memsz
        out.write_u32::<LittleEndian>(self.flags.0).unwrap();
        out.write_u32::<LittleEndian>(4).unwrap(); // p_align
    }

    pub fn from(slice: &[u8]) -> Result<ProgramHeader, std::io::Error> {
        let mut cur = Cursor::new(slice);
        let p_type = cur.read_u32::<LittleEndian>()?;
        if p_type != Self::PT_LOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not a PT_LOAD segment",
            ));
        }
        let offset = cur.read_u32::<LittleEndian>()?;
        let vaddr = cur.read_u32::<LittleEndian>()?;
        let _paddr = cur.read_u32::<LittleEndian>()?;
        let filesz = cur.read_u32::<LittleEndian>()?;
        let _memsz = cur.read_u32::<LittleEndian>()?;
        let flags = cur.read_u32::<LittleEndian>()?;
        let _align = cur.read_u32::<LittleEndian>()?;
        Ok(ProgramHeader {
            offset,
            vaddr,
            size: filesz,
            flags: SegmentFlags(flags),
        })
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Assembles the whole executable image: 128-byte header region, the code
/// image, zero padding to a 4-byte boundary, then the data image.
pub fn build_image(code: &[u8], data: &[u8], entry_off: usize) -> Vec<u8> {
    let code_offset = IMAGE_HEADER_SIZE;
    let data_offset = align4(code_offset + code.len());
    let phnum = if data.is_empty() { 1 } else { 2 };

    let mut out = Vec::with_capacity(data_offset + data.len());
    ElfHeader {
        entry: CODE_BASE + entry_off as u32,
        phnum,
    }
    .write(&mut out);

    ProgramHeader {
        offset: code_offset as u32,
        vaddr: CODE_BASE,
        size: code.len() as u32,
        flags: SegmentFlags(SegmentFlags::READ | SegmentFlags::EXEC),
    }
    .write(&mut out);
    if phnum > 1 {
        ProgramHeader {
            offset: data_offset as u32,
            vaddr: DATA_BASE,
            size: data.len() as u32,
            flags: SegmentFlags(SegmentFlags::READ | SegmentFlags::WRITE),
        }
        .write(&mut out);
    }

    out.resize(IMAGE_HEADER_SIZE, 0);
    out.extend_from_slice(code);
    out.resize(data_offset, 0);
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let hdr = ElfHeader {
            entry: CODE_BASE + 0x1234,
            phnum: 2,
        };
        let mut bytes = Vec::new();
        hdr.write(&mut bytes);
        assert_eq!(bytes.len(), 52);
        assert_eq!(ElfHeader::from(&bytes).unwrap(), hdr);
    }

    #[test]
    fn program_header_round_trips() {
        let ph = ProgramHeader {
            offset: 128,
            vaddr: CODE_BASE,
            size: 96,
            flags: SegmentFlags(SegmentFlags::READ | SegmentFlags::EXEC),
        };
        let mut bytes = Vec::new();
        ph.write(&mut bytes);
        assert_eq!(bytes.len(), 32);
        assert_eq!(ProgramHeader::from(&bytes).unwrap(), ph);
    }

    #[test]
    fn image_layout_places_code_at_128() {
        let code = vec![0xC3; 10];
        let data = vec![0xAA; 6];
        let image = build_image(&code, &data, 0);
        assert_eq!(&image[128..138], &code[..]);
        let data_offset = (128 + 10 + 3) & !3;
        assert_eq!(&image[data_offset..data_offset + 6], &data[..]);
        // Padding between segments is zero.
        assert!(image[138..data_offset].iter().all(|&b| b == 0));
    }

    #[test]
    fn image_headers_describe_both_segments() {
        let image = build_image(&[0x90; 8], &[1, 2, 3, 4], 4);
        let hdr = ElfHeader::from(&image).unwrap();
        assert_eq!(hdr.entry, CODE_BASE + 4);
        assert_eq!(hdr.phnum, 2);
        let code_ph = ProgramHeader::from(&image[52..84]).unwrap();
        assert_eq!(code_ph.offset, 128);
        assert_eq!(code_ph.vaddr, CODE_BASE);
        assert!(code_ph.flags.check_flag(SegmentFlags::EXEC));
        assert!(!code_ph.flags.check_flag(SegmentFlags::WRITE));
        let data_ph = ProgramHeader::from(&image[84..116]).unwrap();
        assert_eq!(data_ph.vaddr, DATA_BASE);
        assert_eq!(data_ph.size, 4);
        assert!(data_ph.flags.check_flag(SegmentFlags::WRITE));
    }

    #[test]
    fn dataless_images_carry_one_segment() {
        let image = build_image(&[0xC3], &[], 0);
        assert_eq!(ElfHeader::from(&image).unwrap().phnum, 1);
        // The tail pad to the 4-byte boundary is written even with no data
        // segment following it.
        assert_eq!(image.len(), 132);
        assert!(image[129..].iter().all(|&b| b == 0));
    }
}
