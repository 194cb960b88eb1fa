//! ELF64 program loading.
//!
//! Maps PT_LOAD segments of an x86-64 executable into an address
//! space at an optional bias and reports the aux values the new
//! stack advertises. Dynamically-linked binaries name their
//! interpreter through PT_INTERP; the caller loads it at
//! [`INTERP_BIAS`] and enters through its entry point instead.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use vos_error::define_kernel_error;

use crate::fs::VfsNode;
use crate::vm::{AddressSpace, Prot};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;
pub const PT_INTERP: u32 = 3;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;

/// Load bias for the program interpreter.
pub const INTERP_BIAS: u64 = 0x4000_0000;

/// Aux vector keys pushed above the initial stack.
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_ENTRY: u64 = 9;

define_kernel_error! {
    pub enum ElfLoadError(0x02) {
        TruncatedImage = 0x01 => "ELF image truncated",
        BadMagic = 0x02 => "bad ELF magic",
        Not64Bit = 0x03 => "not a 64-bit ELF",
        NotLittleEndian = 0x04 => "not little-endian",
        BadType = 0x05 => "not an executable image",
        WrongMachine = 0x06 => "not an x86-64 image",
        BadProgramHeader = 0x07 => "malformed program header",
        Io = 0x08 => "read failed",
        Map(crate::vm::VmError) = 0x09 => "segment mapping failed",
    }
}

/// Aux values for the initial stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aux {
    pub at_entry: u64,
    pub at_phdr: u64,
    pub at_phent: u64,
    pub at_phnum: u64,
}

/// A loaded image: its aux values plus the interpreter path when the
/// binary asks for one.
#[derive(Debug)]
pub struct LoadedImage {
    pub aux: Aux,
    pub interp: Option<String>,
}

struct Elf64Header {
    e_type: u16,
    e_machine: u16,
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Header {
    const SIZE: usize = 64;

    fn parse(data: &[u8]) -> Result<Self, ElfLoadError> {
        if data.len() < Self::SIZE {
            return Err(ElfLoadError::TruncatedImage);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfLoadError::BadMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfLoadError::Not64Bit);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfLoadError::NotLittleEndian);
        }

        let word16 = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);
        let word64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let header = Self {
            e_type: word16(16),
            e_machine: word16(18),
            e_entry: word64(24),
            e_phoff: word64(32),
            e_phentsize: word16(54),
            e_phnum: word16(56),
        };

        if header.e_type != ET_EXEC && header.e_type != ET_DYN {
            return Err(ElfLoadError::BadType);
        }
        if header.e_machine != EM_X86_64 {
            return Err(ElfLoadError::WrongMachine);
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl ProgramHeader {
    const SIZE: usize = 56;

    fn parse(data: &[u8]) -> Result<Self, ElfLoadError> {
        if data.len() < Self::SIZE {
            return Err(ElfLoadError::BadProgramHeader);
        }
        let word32 = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(raw)
        };
        let word64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Ok(Self {
            p_type: word32(0),
            p_flags: word32(4),
            p_offset: word64(8),
            p_vaddr: word64(16),
            p_filesz: word64(32),
            p_memsz: word64(40),
        })
    }

    fn prot(&self) -> Prot {
        let mut prot = Prot::READ | Prot::USER;
        if self.p_flags & PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if self.p_flags & PF_X != 0 {
            prot |= Prot::EXEC;
        }
        prot
    }
}

fn read_image(node: &VfsNode) -> Result<Vec<u8>, ElfLoadError> {
    let size = node.stat().st_size.max(0) as usize;
    let mut data = vec![0u8; size];
    let got = node
        .asset
        .read(0, &mut data)
        .map_err(|_| ElfLoadError::Io)?;
    data.truncate(got);
    Ok(data)
}

/// Maps every PT_LOAD segment of `node` into `space` at `bias` and
/// returns the aux values (entry biased likewise).
pub fn load(
    space: &mut AddressSpace,
    node: &VfsNode,
    bias: u64,
) -> Result<LoadedImage, ElfLoadError> {
    let image = read_image(node)?;
    let header = Elf64Header::parse(&image)?;

    if header.e_phentsize as usize != ProgramHeader::SIZE {
        return Err(ElfLoadError::BadProgramHeader);
    }

    let mut interp = None;
    let mut lowest_vaddr = u64::MAX;

    for index in 0..header.e_phnum {
        let at = header.e_phoff as usize + index as usize * ProgramHeader::SIZE;
        let end = at + ProgramHeader::SIZE;
        if image.len() < end {
            return Err(ElfLoadError::BadProgramHeader);
        }
        let phdr = ProgramHeader::parse(&image[at..end])?;

        match phdr.p_type {
            PT_LOAD => {
                if phdr.p_memsz == 0 {
                    continue;
                }
                let file_end = phdr
                    .p_offset
                    .checked_add(phdr.p_filesz)
                    .ok_or(ElfLoadError::BadProgramHeader)?;
                if image.len() < file_end as usize {
                    return Err(ElfLoadError::TruncatedImage);
                }

                let vaddr = bias + phdr.p_vaddr;
                space
                    .map_fixed(vaddr, phdr.p_memsz as usize, phdr.prot())
                    .map_err(ElfLoadError::Map)?;
                space
                    .write(
                        vaddr,
                        &image[phdr.p_offset as usize..file_end as usize],
                    )
                    .map_err(ElfLoadError::Map)?;
                // memsz beyond filesz stays zero: frames come zeroed.

                lowest_vaddr = lowest_vaddr.min(phdr.p_vaddr - (phdr.p_vaddr & 0xFFF));
                log::trace!(
                    "[ELF] PT_LOAD {:#x}..{:#x} ({:?})",
                    vaddr,
                    vaddr + phdr.p_memsz,
                    phdr.prot()
                );
            }
            PT_INTERP => {
                let file_end = (phdr.p_offset + phdr.p_filesz) as usize;
                if image.len() < file_end {
                    return Err(ElfLoadError::TruncatedImage);
                }
                let raw = &image[phdr.p_offset as usize..file_end];
                let text = raw.split(|b| *b == 0).next().unwrap_or(raw);
                interp = Some(
                    core::str::from_utf8(text)
                        .map_err(|_| ElfLoadError::BadProgramHeader)?
                        .into(),
                );
            }
            _ => {}
        }
    }

    if lowest_vaddr == u64::MAX {
        return Err(ElfLoadError::BadProgramHeader);
    }

    let aux = Aux {
        at_entry: bias + header.e_entry,
        at_phdr: bias + lowest_vaddr + header.e_phoff,
        at_phent: ProgramHeader::SIZE as u64,
        at_phnum: u64::from(header.e_phnum),
    };

    Ok(LoadedImage { aux, interp })
}

// ============================================================================
// Host-test image builder + tests
// ============================================================================
