//! Intel Flash Descriptor (IFD)
//!
//! For reference,
//! see <https://www.intel.com/content/dam/www/public/us/en/documents/datasheets/io-controller-hub-8-datasheet.pdf>
//! and <https://www.intel.com/content/www/us/en/content-details/332690/intel-100-series-chipset-family-platform-controller-hub-pch-datasheet-volume-1.html>
//! and coreboot `util/ifdtool/`.
//!
//! The descriptor starts with a signature at offset 16, followed by the
//! Descriptor Map. The map holds base addresses of the other sections,
//! commonly abbreviated as xxBA. Only the region section matters for
//! decomposing an image:
//!
//! | Index | Region                          |
//! | ----- | ------------------------------- |
//! | 0     | Flash descriptor (this)         |
//! | 1     | BIOS (host) firmware            |
//! | 2     | (CS)ME firmware                 |
//! | 3     | Gigabit ethernet data           |
//! | 4     | Platform data                   |
//! | 5     | Device expansion 1              |
//! | 6     | Secondary BIOS                  |
//! | 7     | Microcode                       |
//! | 8     | Embedded controller (EC)        |
//! | 9     | Device expansion 2              |
//!
//! NOTE: The base addresses are compact values and really mean bits 4..11
//! of 25-bit values, so we need to expand them to get the real addresses.

// We retain the all-uppercase acronyms in the struct definitions.
// Lowercase helpers are provided through implementations.
#![allow(non_snake_case)]

use core::fmt::{self, Display};
use core::ops::Range;

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use strum::Display as StrDisplay;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

// NOTE: This is the LE representation.
pub const MAGIC: u32 = 0x0ff0_a55a;
pub const OFFSET: usize = 16;
/// Regions are given in units of 4K.
const REGION_GRANULARITY: usize = 4096;

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FLMAP0 {
    FCBA: u8,
    #[bits(2)]
    NC: u8,
    #[bits(6)]
    _0: u8,
    FRBA: u8,
    #[bits(3)]
    NR: u8,
    #[bits(5)]
    _1: u8,
}

impl FLMAP0 {
    fn frba(self) -> usize {
        (self.FRBA() as usize) << 4
    }
    fn nr(self) -> usize {
        self.NR() as usize + 1
    }
}

impl Display for FLMAP0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frba = self.frba();
        let nr = self.nr();
        write!(f, "regions: {nr}, base: 0x{frba:08x}")
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct Header {
    pub magic: u32,
    pub flmap0: FLMAP0,
    pub flmap1: u32,
    pub flmap2: u32,
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FlashRegion {
    #[bits(15)]
    base: u32,
    #[bits(1)]
    _0: u8,
    #[bits(15)]
    limit: u32,
    #[bits(1)]
    _1: u8,
}

impl FlashRegion {
    fn ba(self) -> usize {
        self.base() as usize * REGION_GRANULARITY
    }
    fn la(self) -> usize {
        self.limit() as usize * REGION_GRANULARITY + REGION_GRANULARITY - 1
    }

    /// An unused region has its base above its limit, e.g. `0x00007fff`.
    pub fn is_used(self) -> bool {
        self.base() <= self.limit()
    }

    pub fn range(self) -> Range<usize> {
        self.ba()..self.la() + 1
    }
}

impl Display for FlashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.ba();
        let l = self.la();
        let u = if self.is_used() { "" } else { " (unused)" };
        write!(f, "{b:08x} - {l:08x}{u}")
    }
}

const REGION_COUNT: usize = 10;

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct Regions {
    pub flreg: [FlashRegion; REGION_COUNT],
}

#[derive(StrDisplay, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionType {
    #[strum(serialize = "Descriptor")]
    Descriptor,
    #[strum(serialize = "BIOS")]
    Bios,
    #[strum(serialize = "ME")]
    Me,
    #[strum(serialize = "GbE")]
    Gbe,
    #[strum(serialize = "PDR")]
    Pdr,
    #[strum(serialize = "DevExp1")]
    DevExp1,
    #[strum(serialize = "BIOS2")]
    Bios2,
    #[strum(serialize = "Microcode")]
    Microcode,
    #[strum(serialize = "EC")]
    Ec,
    #[strum(serialize = "DevExp2")]
    DevExp2,
}

const REGION_TYPES: [RegionType; REGION_COUNT] = [
    RegionType::Descriptor,
    RegionType::Bios,
    RegionType::Me,
    RegionType::Gbe,
    RegionType::Pdr,
    RegionType::DevExp1,
    RegionType::Bios2,
    RegionType::Microcode,
    RegionType::Ec,
    RegionType::DevExp2,
];

impl Display for Regions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (t, r) in REGION_TYPES.iter().zip(self.flreg.iter()) {
            writeln!(f, "   {:12} {r}", format!("{t}:"))?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum IfdError {
    NoIfd(String),
    Truncated(String),
}

impl Display for IfdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfdError::NoIfd(m) => write!(f, "no flash descriptor: {m}"),
            IfdError::Truncated(m) => write!(f, "flash descriptor truncated: {m}"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IFD {
    pub header: Header,
    pub regions: Regions,
}

impl IFD {
    /// Quick check for the signature, without parsing anything else.
    pub fn is_present(data: &[u8]) -> bool {
        data.get(OFFSET..OFFSET + 4)
            .is_some_and(|m| m == MAGIC.to_le_bytes())
    }

    pub fn parse(data: &[u8]) -> Result<Self, IfdError> {
        let Some(Ok((header, _))) = data.get(OFFSET..).map(Header::read_from_prefix) else {
            return Err(IfdError::Truncated(format!(
                "need {:08x} bytes for the header, got {:08x}",
                OFFSET + size_of::<Header>(),
                data.len()
            )));
        };

        if header.magic != MAGIC {
            return Err(IfdError::NoIfd(format!(
                "IFD magic not as expected, got: {:08x}, wanted: {MAGIC:08x}",
                header.magic
            )));
        }

        let regions_offset = header.flmap0.frba();
        let Some(Ok((regions, _))) = data.get(regions_offset..).map(Regions::read_from_prefix)
        else {
            return Err(IfdError::Truncated(format!(
                "region section at {regions_offset:08x} is out of bounds"
            )));
        };

        Ok(Self { header, regions })
    }

    /// Used regions, in table order.
    pub fn used_regions(&self) -> Vec<(RegionType, Range<usize>)> {
        REGION_TYPES
            .iter()
            .zip(self.regions.flreg.iter())
            .filter(|(_, r)| r.is_used())
            .map(|(t, r)| (*t, r.range()))
            .collect()
    }
}

impl Display for IFD {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== Flash descriptor ==")?;
        writeln!(f, "   {}", self.header.flmap0)?;
        write!(f, "{}", self.regions)
    }
}

#[cfg(test)]
pub(crate) fn test_descriptor(regions: &[(RegionType, Option<(u32, u32)>)]) -> Vec<u8> {
    let mut d = vec![0xffu8; REGION_GRANULARITY];
    d[OFFSET..OFFSET + 4].copy_from_slice(&MAGIC.to_le_bytes());
    // FCBA 0x30, FRBA 0x40
    let flmap0 = FLMAP0::new().with_FCBA(0x03).with_FRBA(0x04).with_NR(4);
    d[20..24].copy_from_slice(&flmap0.into_bits().to_le_bytes());
    d[24..28].copy_from_slice(&0x0000_1006u32.to_le_bytes());
    d[28..32].copy_from_slice(&0x0000_0020u32.to_le_bytes());
    for i in 0..REGION_COUNT {
        let t = REGION_TYPES[i];
        let r = match regions.iter().find(|(rt, _)| *rt == t) {
            Some((_, Some((base, limit)))) => base | (limit << 16),
            _ => 0x0000_7fff,
        };
        d[0x40 + i * 4..0x44 + i * 4].copy_from_slice(&r.to_le_bytes());
    }
    d
}

#[test]
fn regions_from_descriptor() {
    let d = test_descriptor(&[
        (RegionType::Descriptor, Some((0, 0))),
        (RegionType::Bios, Some((1, 3))),
        (RegionType::Me, None),
    ]);
    assert!(IFD::is_present(&d));
    let ifd = IFD::parse(&d).unwrap();
    let r = ifd.used_regions();
    assert_eq!(
        r,
        vec![
            (RegionType::Descriptor, 0..0x1000),
            (RegionType::Bios, 0x1000..0x4000),
        ]
    );
}

#[test]
fn no_descriptor() {
    assert!(matches!(IFD::parse(&[0u8; 64]), Err(IfdError::NoIfd(_))));
    assert!(matches!(IFD::parse(&[0u8; 8]), Err(IfdError::Truncated(_))));
}
