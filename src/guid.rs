//! GUIDs as they are stored in firmware, plus the tables of well-known ones
//!
//! GUIDs are stored in the mixed-endian EFI layout, see
//! <https://uefi.org/specs/PI/1.8/V3_Code_Definitions.html> and Appendix A of
//! the UEFI specification.
//!
//! Lookups go by the canonical uppercase string representation.

use core::fmt::{self, Display};

use phf::phf_map;
use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

#[derive(
    Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[repr(C)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&self.data1.to_le_bytes());
        b[4..6].copy_from_slice(&self.data2.to_le_bytes());
        b[6..8].copy_from_slice(&self.data3.to_le_bytes());
        b[8..16].copy_from_slice(&self.data4);
        b
    }

    /// Human readable name, if the GUID is a known one.
    pub fn label(&self) -> Option<&'static str> {
        GUID_LABELS.get(self.to_string().as_str()).copied()
    }

    /// The label if known, otherwise the plain GUID.
    pub fn name(&self) -> String {
        match self.label() {
            Some(l) => l.to_string(),
            None => self.to_string(),
        }
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Guid {
            data1,
            data2,
            data3,
            data4: d,
        } = self;
        write!(
            f,
            "{data1:08X}-{data2:04X}-{data3:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

// File systems
pub const FFS1: Guid = Guid::new(0x7A9354D9, 0x0468, 0x444A, [0x81, 0xCE, 0x0B, 0xF6, 0x17, 0xD8, 0x90, 0xDF]);
pub const FFS2: Guid = Guid::new(0x8C8CE578, 0x8A3D, 0x4F1C, [0x99, 0x35, 0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3]);
pub const FFS3: Guid = Guid::new(0x5473C07A, 0x3DCB, 0x4DCA, [0xBD, 0x6F, 0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A]);
pub const APPLE_IMMUTABLE_FV: Guid = Guid::new(0x04ADEEAD, 0x61FF, 0x4D31, [0xB6, 0xBA, 0x64, 0xF8, 0xBF, 0x90, 0x1F, 0x5A]);
pub const APPLE_AUTHENTICATION_FV: Guid = Guid::new(0xBD001B8C, 0x6A71, 0x487B, [0xA1, 0x4F, 0x0C, 0x2A, 0x2D, 0xCF, 0x7A, 0x5D]);
pub const APPLE_MICROCODE_VOLUME: Guid = Guid::new(0x153D2197, 0x29BD, 0x44DC, [0xAC, 0x59, 0x88, 0x7F, 0x70, 0xE4, 0x1A, 0x6B]);
pub const INTEL_FS: Guid = Guid::new(0xAD3FFFFF, 0xD28B, 0x44C4, [0x9F, 0x13, 0x9E, 0xA9, 0x8A, 0x97, 0xF9, 0xF0]);
pub const INTEL_FS2: Guid = Guid::new(0xD6A1CD70, 0x4B33, 0x4994, [0xA6, 0xEA, 0x37, 0x5F, 0x2C, 0xCC, 0x54, 0x37]);
pub const SONY_FS: Guid = Guid::new(0x4F494156, 0xAED6, 0x4D64, [0xA5, 0x37, 0xB8, 0xA5, 0x55, 0x7B, 0xCE, 0xEC]);
pub const NVRAM_FV: Guid = Guid::new(0xFFF12B8D, 0x7696, 0x4C8B, [0xA9, 0x85, 0x27, 0x47, 0x07, 0x5B, 0x4F, 0x50]);

// Files
pub const VOLUME_TOP_FILE: Guid = Guid::new(0x1BA0062E, 0xC779, 0x4582, [0x85, 0x66, 0x33, 0x6A, 0xE8, 0xF7, 0x8F, 0x09]);
pub const PEI_APRIORI: Guid = Guid::new(0x1B45CC0A, 0x156A, 0x428A, [0xAF, 0x62, 0x49, 0x86, 0x4D, 0xA0, 0xE6, 0xE6]);
pub const DXE_APRIORI: Guid = Guid::new(0xFC510EE7, 0xFFDC, 0x11D4, [0xBD, 0x41, 0x00, 0x80, 0xC7, 0x3C, 0x88, 0x81]);

// GUID-defined sections
pub const TIANO_SECTION: Guid = Guid::new(0xA31280AD, 0x481E, 0x41B6, [0x95, 0xE8, 0x12, 0x7F, 0x4C, 0x98, 0x47, 0x79]);
pub const LZMA_SECTION: Guid = Guid::new(0xEE4E5898, 0x3914, 0x4259, [0x9D, 0x6E, 0xDC, 0x7B, 0xD7, 0x94, 0x03, 0xCF]);
pub const LZMA_F86_SECTION: Guid = Guid::new(0xD42AE6BD, 0x1352, 0x4BFB, [0x90, 0x9A, 0xCA, 0x72, 0xA6, 0xEA, 0xE8, 0x89]);
pub const CRC32_SECTION: Guid = Guid::new(0xFC1BCDB0, 0x7D31, 0x49AA, [0x93, 0x6A, 0xA4, 0x60, 0x0D, 0x9D, 0xD0, 0x83]);
pub const BROTLI_SECTION: Guid = Guid::new(0x3D532050, 0x5CDA, 0x4FD0, [0x87, 0x9E, 0x0F, 0x7F, 0x63, 0x0D, 0x5A, 0xFB]);
pub const SIGNED_SECTION: Guid = Guid::new(0x0F9D89E8, 0x9259, 0x4F76, [0xA5, 0xAF, 0x0C, 0x89, 0xE3, 0x40, 0x23, 0xDF]);

// Capsules
pub const EFI_CAPSULE: Guid = Guid::new(0x3B6686BD, 0x0D76, 0x4030, [0xB7, 0x0E, 0xB5, 0x51, 0x9E, 0x2F, 0xC5, 0xA0]);
pub const INTEL_CAPSULE: Guid = Guid::new(0x539182B9, 0xABB5, 0x4391, [0xB6, 0x9A, 0xE3, 0xA9, 0x43, 0xF7, 0x2F, 0xCC]);
pub const LENOVO_CAPSULE: Guid = Guid::new(0xE20BAFD3, 0x9914, 0x4F4F, [0x95, 0x37, 0x31, 0x29, 0xE0, 0x90, 0xEB, 0x3C]);
pub const LENOVO2_CAPSULE: Guid = Guid::new(0x25B5FE76, 0x8243, 0x4A5C, [0xA9, 0xBD, 0x7E, 0xE3, 0x24, 0x61, 0x98, 0xB5]);
pub const TOSHIBA_CAPSULE: Guid = Guid::new(0x3BE07062, 0x1D51, 0x45D2, [0x83, 0x2B, 0xF0, 0x93, 0x25, 0x7E, 0xD4, 0x61]);
pub const APTIO_SIGNED_CAPSULE: Guid = Guid::new(0x4A3CA68B, 0x7723, 0x48FB, [0x80, 0x3D, 0x57, 0x8C, 0xC1, 0xFE, 0xC4, 0x4D]);
pub const APTIO_UNSIGNED_CAPSULE: Guid = Guid::new(0x14EEBB90, 0x890A, 0x43DB, [0xAE, 0xD1, 0x5D, 0x3C, 0x45, 0x88, 0xA4, 0x18]);

static GUID_LABELS: phf::Map<&'static str, &'static str> = phf_map! {
    "7A9354D9-0468-444A-81CE-0BF617D890DF" => "EfiFirmwareFileSystemGuid",
    "8C8CE578-8A3D-4F1C-9935-896185C32DD3" => "EfiFirmwareFileSystem2Guid",
    "5473C07A-3DCB-4DCA-BD6F-1E9689E7349A" => "EfiFirmwareFileSystem3Guid",
    "04ADEEAD-61FF-4D31-B6BA-64F8BF901F5A" => "AppleImmutableFvGuid",
    "BD001B8C-6A71-487B-A14F-0C2A2DCF7A5D" => "AppleAuthenticationFvGuid",
    "153D2197-29BD-44DC-AC59-887F70E41A6B" => "AppleMicrocodeVolumeGuid",
    "AD3FFFFF-D28B-44C4-9F13-9EA98A97F9F0" => "IntelFileSystemGuid",
    "D6A1CD70-4B33-4994-A6EA-375F2CCC5437" => "IntelFileSystem2Guid",
    "4F494156-AED6-4D64-A537-B8A5557BCEEC" => "SonyFileSystemGuid",
    "FFF12B8D-7696-4C8B-A985-2747075B4F50" => "EfiSystemNvDataFvGuid",
    "1BA0062E-C779-4582-8566-336AE8F78F09" => "VolumeTopFile",
    "1B45CC0A-156A-428A-AF62-49864DA0E6E6" => "PeiAprioriFile",
    "FC510EE7-FFDC-11D4-BD41-0080C73C8881" => "DxeAprioriFile",
    "D6A2CB7F-6A18-4E2F-B43B-9920A733700A" => "DxeCore",
    "A31280AD-481E-41B6-95E8-127F4C984779" => "TianoCompress",
    "EE4E5898-3914-4259-9D6E-DC7BD79403CF" => "LzmaCompress",
    "D42AE6BD-1352-4BFB-909A-CA72A6EAE889" => "LzmaF86Compress",
    "FC1BCDB0-7D31-49AA-936A-A4600D9DD083" => "Crc32GuidedSection",
    "3D532050-5CDA-4FD0-879E-0F7F630D5AFB" => "BrotliCompress",
    "0F9D89E8-9259-4F76-A5AF-0C89E34023DF" => "FirmwareContentsSigned",
    "3B6686BD-0D76-4030-B70E-B5519E2FC5A0" => "EfiCapsuleGuid",
    "539182B9-ABB5-4391-B69A-E3A943F72FCC" => "IntelCapsuleGuid",
    "E20BAFD3-9914-4F4F-9537-3129E090EB3C" => "LenovoCapsuleGuid",
    "25B5FE76-8243-4A5C-A9BD-7EE3246198B5" => "LenovoCapsuleGuid2",
    "3BE07062-1D51-45D2-832B-F093257ED461" => "ToshibaCapsuleGuid",
    "4A3CA68B-7723-48FB-803D-578CC1FEC44D" => "AptioSignedCapsuleGuid",
    "14EEBB90-890A-43DB-AED1-5D3C4588A418" => "AptioUnsignedCapsuleGuid",
};

/// How the payload of a GUID-defined section is obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuidStrategy {
    /// EFI or Tiano compression, whichever yields a valid section list.
    Tiano,
    Lzma,
    /// LZMA followed by the x86 branch-call-jump decoder.
    LzmaF86,
    /// Payload follows a CRC32 over itself.
    Crc32,
    /// Payload follows a `WIN_CERTIFICATE`.
    Signed,
    /// Known scheme that this crate cannot decode.
    Unsupported(&'static str),
}

static GUIDED_SECTION_STRATEGIES: phf::Map<&'static str, GuidStrategy> = phf_map! {
    "A31280AD-481E-41B6-95E8-127F4C984779" => GuidStrategy::Tiano,
    "EE4E5898-3914-4259-9D6E-DC7BD79403CF" => GuidStrategy::Lzma,
    "D42AE6BD-1352-4BFB-909A-CA72A6EAE889" => GuidStrategy::LzmaF86,
    "FC1BCDB0-7D31-49AA-936A-A4600D9DD083" => GuidStrategy::Crc32,
    "0F9D89E8-9259-4F76-A5AF-0C89E34023DF" => GuidStrategy::Signed,
    "3D532050-5CDA-4FD0-879E-0F7F630D5AFB" => GuidStrategy::Unsupported("Brotli"),
};

pub fn guided_section_strategy(guid: &Guid) -> Option<GuidStrategy> {
    GUIDED_SECTION_STRATEGIES
        .get(guid.to_string().as_str())
        .copied()
}

/// Which FFS revision a file system GUID implies, if any.
pub fn ffs_version_of(guid: &Guid) -> Option<crate::ffs::FfsVersion> {
    use crate::ffs::FfsVersion;
    match *guid {
        FFS1 | FFS2 | APPLE_IMMUTABLE_FV | APPLE_AUTHENTICATION_FV | APPLE_MICROCODE_VOLUME
        | INTEL_FS | INTEL_FS2 | SONY_FS => Some(FfsVersion::Ffs2),
        FFS3 => Some(FfsVersion::Ffs3),
        _ => None,
    }
}

#[test]
fn display_matches_registry_format() {
    assert_eq!(FFS2.to_string(), "8C8CE578-8A3D-4F1C-9935-896185C32DD3");
    assert_eq!(VOLUME_TOP_FILE.label(), Some("VolumeTopFile"));
    assert_eq!(
        FFS3.to_bytes()[..4],
        [0x7a, 0xc0, 0x73, 0x54],
    );
}

#[test]
fn strategy_table() {
    assert_eq!(guided_section_strategy(&CRC32_SECTION), Some(GuidStrategy::Crc32));
    assert_eq!(
        guided_section_strategy(&BROTLI_SECTION),
        Some(GuidStrategy::Unsupported("Brotli"))
    );
    assert_eq!(guided_section_strategy(&FFS2), None);
}
