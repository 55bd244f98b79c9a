//! Summaries of executable images found in PE32, PIC and TE sections
//!
//! PE images are handed to goblin. TE (terse executable) images only exist in
//! firmware; their header is described in PI specification volume 1,
//! "TE Image Format".

use core::fmt::{self, Display};

use goblin::pe::PE;
use serde::{Deserialize, Serialize};
use strum::Display as StrDisplay;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

pub const TE_SIGNATURE: [u8; 2] = *b"VZ";

#[derive(StrDisplay, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Machine {
    #[strum(serialize = "x86")]
    I386,
    #[strum(serialize = "x86-64")]
    X64,
    #[strum(serialize = "ARM Thumb")]
    Thumb,
    #[strum(serialize = "ARM Thumb-2")]
    ArmNt,
    #[strum(serialize = "AArch64")]
    Aarch64,
    #[strum(serialize = "Itanium")]
    Ia64,
    #[strum(serialize = "EFI byte code")]
    Ebc,
    #[strum(serialize = "RISC-V 64")]
    RiscV64,
    #[strum(serialize = "LoongArch 64")]
    LoongArch64,
    Unknown(u16),
}

impl From<u16> for Machine {
    fn from(m: u16) -> Self {
        match m {
            0x014c => Self::I386,
            0x8664 => Self::X64,
            0x01c2 => Self::Thumb,
            0x01c4 => Self::ArmNt,
            0xaa64 => Self::Aarch64,
            0x0200 => Self::Ia64,
            0x0ebc => Self::Ebc,
            0x5064 => Self::RiscV64,
            0x6264 => Self::LoongArch64,
            m => Self::Unknown(m),
        }
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct TeHeader {
    pub signature: [u8; 2],
    pub machine: u16,
    pub number_of_sections: u8,
    pub subsystem: u8,
    pub stripped_size: u16,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    /// Base relocation and debug directories
    pub data_directory: [DataDirectory; 2],
}

/// What the image decoder reports about an executable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSummary {
    pub machine: Machine,
    pub entry_point: u64,
    pub image_base: u64,
    pub subsystem: u16,
    pub sections: Vec<String>,
}

impl ImageSummary {
    pub fn info(&self) -> Vec<String> {
        let mut v = vec![
            format!("Machine type: {}", self.machine),
            format!("Entry point: {:08x}", self.entry_point),
            format!("Image base: {:08x}", self.image_base),
            format!("Subsystem: {:04x}", self.subsystem),
        ];
        if !self.sections.is_empty() {
            v.push(format!("Sections: {}", self.sections.join(", ")));
        }
        v
    }
}

impl Display for ImageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.machine;
        let e = self.entry_point;
        let b = self.image_base;
        write!(f, "{m}, entry {e:08x}, base {b:08x}")
    }
}

pub fn summarize_pe(data: &[u8]) -> Result<ImageSummary, String> {
    let pe = PE::parse(data).map_err(|e| format!("invalid PE image: {e}"))?;
    let coff = pe.header.coff_header;
    let subsystem = pe
        .header
        .optional_header
        .map(|o| o.windows_fields.subsystem)
        .unwrap_or(0);
    let sections = pe
        .sections
        .iter()
        .map(|s| match s.name() {
            Ok(n) => n.to_string(),
            Err(_) => "?".to_string(),
        })
        .collect();
    Ok(ImageSummary {
        machine: Machine::from(coff.machine),
        entry_point: pe.entry as u64,
        image_base: pe.image_base as u64,
        subsystem,
        sections,
    })
}

pub fn summarize_te(data: &[u8]) -> Result<ImageSummary, String> {
    let (h, _) = TeHeader::read_from_prefix(data)
        .map_err(|_| format!("TE header does not fit in {} bytes", data.len()))?;
    if h.signature != TE_SIGNATURE {
        return Err(format!("invalid TE signature {:02x?}", h.signature));
    }
    // Fields are relative to the original PE image; the stripped part is gone.
    let adjust = (h.stripped_size as u64).wrapping_sub(size_of::<TeHeader>() as u64);
    Ok(ImageSummary {
        machine: Machine::from(h.machine),
        entry_point: h.address_of_entry_point as u64,
        image_base: h.image_base.wrapping_add(adjust),
        subsystem: h.subsystem as u16,
        sections: Vec::new(),
    })
}

#[test]
fn te_header() {
    let mut d = Vec::new();
    d.extend_from_slice(&TE_SIGNATURE);
    d.extend_from_slice(&0x8664u16.to_le_bytes());
    d.push(3);
    d.push(0x0b);
    d.extend_from_slice(&0x0228u16.to_le_bytes());
    d.extend_from_slice(&0x0000_1000u32.to_le_bytes());
    d.extend_from_slice(&0x0000_0260u32.to_le_bytes());
    d.extend_from_slice(&0xffe0_0000u64.to_le_bytes());
    d.extend_from_slice(&[0u8; 16]);
    let s = summarize_te(&d).unwrap();
    assert_eq!(s.machine, Machine::X64);
    assert_eq!(s.entry_point, 0x1000);
    assert_eq!(s.image_base, 0xffe0_0000 + 0x228 - 40);
    assert_eq!(s.subsystem, 0x0b);
}

#[test]
fn garbage_is_not_an_image() {
    assert!(summarize_te(b"MZ").is_err());
    assert!(summarize_te(&[0u8; 64]).is_err());
    assert!(summarize_pe(&[0u8; 64]).is_err());
}
