//! Firmware File System (FFS) on-disk structures
//!
//! For reference, see the Platform Initialization specification, volume 3
//! <https://uefi.org/specs/PI/1.8/V3_Code_Definitions.html>
//! and EDK2 `MdePkg/Include/Pi/PiFirmwareVolume.h`, `PiFirmwareFile.h`.
//!
//! A firmware volume (FV) starts with a header carrying the `_FVH` signature,
//! followed by a block map, an optional extended header and then files.
//! Files are 8-byte aligned and consist of sections, which are 4-byte aligned.
//!
//! | Revision | File header | Section header | Large sizes        |
//! | -------- | ----------- | -------------- | ------------------ |
//! | FFS2     | 24 bytes    | 4 bytes        | no                 |
//! | FFS3     | 24/32 bytes | 4/8 bytes      | yes, via attribute |

use core::fmt::{self, Display};

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use strum::Display as StrDisplay;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::guid::Guid;

pub const FV_SIGNATURE: [u8; 4] = *b"_FVH";
pub const FV_SIGNATURE_OFFSET: usize = 40;

pub const VOLUME_HEADER_SIZE: usize = size_of::<VolumeHeader>();
pub const BLOCK_MAP_ENTRY_SIZE: usize = size_of::<BlockMapEntry>();
pub const FILE_HEADER_SIZE: usize = size_of::<FileHeader>();
pub const FILE_HEADER2_SIZE: usize = FILE_HEADER_SIZE + 8;
pub const SECTION_HEADER_SIZE: usize = size_of::<CommonSectionHeader>();
pub const SECTION_HEADER2_SIZE: usize = SECTION_HEADER_SIZE + 4;

/// Size marker of sections that carry an extended size.
pub const SECTION_SIZE_EXTENDED: u32 = 0x00ff_ffff;

/// Data checksum for files without the checksum attribute, revision 1 volumes
pub const FFS_FIXED_CHECKSUM: u8 = 0x5a;
/// Data checksum for files without the checksum attribute
pub const FFS_FIXED_CHECKSUM2: u8 = 0xaa;

/// The header format revision of a file system, chosen once per volume.
#[derive(StrDisplay, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FfsVersion {
    #[strum(serialize = "FFSv2")]
    Ffs2,
    #[strum(serialize = "FFSv3")]
    Ffs3,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct VolumeHeader {
    pub zero_vector: [u8; 16],
    pub fs_guid: Guid,
    pub fv_length: u64,
    pub signature: [u8; 4],
    pub attributes: VolumeAttributes,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub reserved: u8,
    pub revision: u8,
}

impl Display for VolumeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.fs_guid.name();
        let l = self.fv_length;
        let h = self.header_length;
        let r = self.revision;
        write!(f, "{g}, length {l:08x}, header {h:04x}, revision {r}")
    }
}

/// Attributes for revision 2 volumes, `EFI_FVB_ATTRIBUTES_2`
#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct VolumeAttributes {
    pub read_disabled_cap: bool,
    pub read_enabled_cap: bool,
    pub read_status: bool,
    pub write_disabled_cap: bool,
    pub write_enabled_cap: bool,
    pub write_status: bool,
    pub lock_cap: bool,
    pub lock_status: bool,
    _0: bool,
    pub sticky_write: bool,
    pub memory_mapped: bool,
    pub erase_polarity: bool,
    pub read_lock_cap: bool,
    pub read_lock_status: bool,
    pub write_lock_cap: bool,
    pub write_lock_status: bool,
    /// Power of two
    #[bits(5)]
    pub alignment: u8,
    #[bits(10)]
    _1: u16,
    pub weak_alignment: bool,
}

impl VolumeAttributes {
    pub fn empty_byte(self) -> u8 {
        if self.erase_polarity() { 0xff } else { 0x00 }
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct BlockMapEntry {
    pub num_blocks: u32,
    pub length: u32,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct VolumeExtHeader {
    pub fv_name: Guid,
    pub ext_header_size: u32,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct FileHeader {
    pub name: Guid,
    pub header_checksum: u8,
    pub file_checksum: u8,
    pub file_type: u8,
    pub attributes: FileAttributes,
    pub size: [u8; 3],
    pub state: u8,
}

impl FileHeader {
    pub fn size(&self) -> u32 {
        uint24(self.size)
    }

    pub fn integrity_check(&self) -> u16 {
        u16::from_le_bytes([self.header_checksum, self.file_checksum])
    }
}

/// `EFI_FFS_FILE_ATTRIBUTES`
///
/// Bit 0 means "large file" on FFS3 volumes and "tail present" on revision 1
/// volumes.
#[bitfield(u8)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FileAttributes {
    pub large_file: bool,
    pub data_alignment_2: bool,
    pub fixed: bool,
    #[bits(3)]
    pub data_alignment: u8,
    pub checksum: bool,
    _0: bool,
}

impl FileAttributes {
    /// Required alignment of the file data as a power of two.
    pub fn alignment_power(self, version: FfsVersion) -> u32 {
        const ALIGNMENT: [u32; 8] = [0, 4, 7, 9, 10, 12, 15, 16];
        const ALIGNMENT_2: [u32; 8] = [17, 18, 19, 20, 21, 22, 23, 24];
        let i = self.data_alignment() as usize;
        if version == FfsVersion::Ffs3 && self.data_alignment_2() {
            ALIGNMENT_2[i]
        } else {
            ALIGNMENT[i]
        }
    }
}

/// File state, decided by the highest bit set
#[derive(StrDisplay, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    #[strum(serialize = "Header construction")]
    HeaderConstruction,
    #[strum(serialize = "Header valid")]
    HeaderValid,
    #[strum(serialize = "Data valid")]
    DataValid,
    #[strum(serialize = "Marked for update")]
    MarkedForUpdate,
    #[strum(serialize = "Deleted")]
    Deleted,
    #[strum(serialize = "Header invalid")]
    HeaderInvalid,
    #[strum(serialize = "Empty")]
    Empty,
}

impl FileState {
    /// Decode a state byte; bits are inverted on volumes erasing to 1.
    pub fn from_raw(state: u8, empty_byte: u8) -> Self {
        let s = if empty_byte == 0xff { !state } else { state };
        match s {
            s if s & 0x20 != 0 => Self::HeaderInvalid,
            s if s & 0x10 != 0 => Self::Deleted,
            s if s & 0x08 != 0 => Self::MarkedForUpdate,
            s if s & 0x04 != 0 => Self::DataValid,
            s if s & 0x02 != 0 => Self::HeaderValid,
            s if s & 0x01 != 0 => Self::HeaderConstruction,
            _ => Self::Empty,
        }
    }

    pub fn has_valid_data(self) -> bool {
        matches!(self, Self::DataValid | Self::MarkedForUpdate)
    }
}

/// `EFI_FV_FILETYPE`
#[derive(StrDisplay, Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FileType {
    #[strum(serialize = "All")]
    All = 0x00,
    #[strum(serialize = "Raw")]
    Raw = 0x01,
    #[strum(serialize = "Freeform")]
    Freeform = 0x02,
    #[strum(serialize = "SEC core")]
    SecurityCore = 0x03,
    #[strum(serialize = "PEI core")]
    PeiCore = 0x04,
    #[strum(serialize = "DXE core")]
    DxeCore = 0x05,
    #[strum(serialize = "PEI module")]
    Peim = 0x06,
    #[strum(serialize = "DXE driver")]
    Driver = 0x07,
    #[strum(serialize = "Combined PEI/DXE")]
    CombinedPeimDriver = 0x08,
    #[strum(serialize = "Application")]
    Application = 0x09,
    #[strum(serialize = "MM module")]
    Mm = 0x0a,
    #[strum(serialize = "Volume image")]
    VolumeImage = 0x0b,
    #[strum(serialize = "Combined MM/DXE")]
    CombinedMmDxe = 0x0c,
    #[strum(serialize = "MM core")]
    MmCore = 0x0d,
    #[strum(serialize = "MM standalone module")]
    MmStandalone = 0x0e,
    #[strum(serialize = "MM standalone core")]
    MmCoreStandalone = 0x0f,
    #[strum(serialize = "Pad")]
    Pad = 0xf0,
    #[strum(serialize = "OEM")]
    Oem(u8),
    #[strum(serialize = "Debug")]
    Debug(u8),
    #[strum(serialize = "FFS")]
    Ffs(u8),
    Unknown(u8),
}

impl From<u8> for FileType {
    fn from(t: u8) -> Self {
        match t {
            0x00 => Self::All,
            0x01 => Self::Raw,
            0x02 => Self::Freeform,
            0x03 => Self::SecurityCore,
            0x04 => Self::PeiCore,
            0x05 => Self::DxeCore,
            0x06 => Self::Peim,
            0x07 => Self::Driver,
            0x08 => Self::CombinedPeimDriver,
            0x09 => Self::Application,
            0x0a => Self::Mm,
            0x0b => Self::VolumeImage,
            0x0c => Self::CombinedMmDxe,
            0x0d => Self::MmCore,
            0x0e => Self::MmStandalone,
            0x0f => Self::MmCoreStandalone,
            0xf0 => Self::Pad,
            0xc0..=0xdf => Self::Oem(t),
            0xe0..=0xef => Self::Debug(t),
            0xf1..=0xff => Self::Ffs(t),
            t => Self::Unknown(t),
        }
    }
}

impl From<FileType> for u8 {
    fn from(t: FileType) -> Self {
        match t {
            FileType::All => 0x00,
            FileType::Raw => 0x01,
            FileType::Freeform => 0x02,
            FileType::SecurityCore => 0x03,
            FileType::PeiCore => 0x04,
            FileType::DxeCore => 0x05,
            FileType::Peim => 0x06,
            FileType::Driver => 0x07,
            FileType::CombinedPeimDriver => 0x08,
            FileType::Application => 0x09,
            FileType::Mm => 0x0a,
            FileType::VolumeImage => 0x0b,
            FileType::CombinedMmDxe => 0x0c,
            FileType::MmCore => 0x0d,
            FileType::MmStandalone => 0x0e,
            FileType::MmCoreStandalone => 0x0f,
            FileType::Pad => 0xf0,
            FileType::Oem(t) | FileType::Debug(t) | FileType::Ffs(t) | FileType::Unknown(t) => t,
        }
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct CommonSectionHeader {
    pub size: [u8; 3],
    pub section_type: u8,
}

impl CommonSectionHeader {
    pub fn size(&self) -> u32 {
        uint24(self.size)
    }
}

/// `EFI_SECTION_TYPE`
#[derive(StrDisplay, Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SectionType {
    #[strum(serialize = "Compressed")]
    Compression = 0x01,
    #[strum(serialize = "GUID defined")]
    GuidDefined = 0x02,
    #[strum(serialize = "Disposable")]
    Disposable = 0x03,
    #[strum(serialize = "PE32 image")]
    Pe32 = 0x10,
    #[strum(serialize = "PIC image")]
    Pic = 0x11,
    #[strum(serialize = "TE image")]
    Te = 0x12,
    #[strum(serialize = "DXE dependency")]
    DxeDepex = 0x13,
    #[strum(serialize = "Version")]
    Version = 0x14,
    #[strum(serialize = "UI")]
    UserInterface = 0x15,
    #[strum(serialize = "16-bit image")]
    Compatibility16 = 0x16,
    #[strum(serialize = "Volume image")]
    VolumeImage = 0x17,
    #[strum(serialize = "Freeform subtype GUID")]
    FreeformSubtypeGuid = 0x18,
    #[strum(serialize = "Raw")]
    Raw = 0x19,
    #[strum(serialize = "PEI dependency")]
    PeiDepex = 0x1b,
    #[strum(serialize = "MM dependency")]
    MmDepex = 0x1c,
    #[strum(serialize = "Insyde postcode")]
    InsydePostcode = 0x20,
    #[strum(serialize = "SCT postcode")]
    SctPostcode = 0x21,
    Unknown(u8),
}

impl From<u8> for SectionType {
    fn from(t: u8) -> Self {
        match t {
            0x01 => Self::Compression,
            0x02 => Self::GuidDefined,
            0x03 => Self::Disposable,
            0x10 => Self::Pe32,
            0x11 => Self::Pic,
            0x12 => Self::Te,
            0x13 => Self::DxeDepex,
            0x14 => Self::Version,
            0x15 => Self::UserInterface,
            0x16 => Self::Compatibility16,
            0x17 => Self::VolumeImage,
            0x18 => Self::FreeformSubtypeGuid,
            0x19 => Self::Raw,
            0x1b => Self::PeiDepex,
            0x1c => Self::MmDepex,
            0x20 => Self::InsydePostcode,
            0x21 => Self::SctPostcode,
            t => Self::Unknown(t),
        }
    }
}

impl From<SectionType> for u8 {
    fn from(t: SectionType) -> Self {
        match t {
            SectionType::Compression => 0x01,
            SectionType::GuidDefined => 0x02,
            SectionType::Disposable => 0x03,
            SectionType::Pe32 => 0x10,
            SectionType::Pic => 0x11,
            SectionType::Te => 0x12,
            SectionType::DxeDepex => 0x13,
            SectionType::Version => 0x14,
            SectionType::UserInterface => 0x15,
            SectionType::Compatibility16 => 0x16,
            SectionType::VolumeImage => 0x17,
            SectionType::FreeformSubtypeGuid => 0x18,
            SectionType::Raw => 0x19,
            SectionType::PeiDepex => 0x1b,
            SectionType::MmDepex => 0x1c,
            SectionType::InsydePostcode => 0x20,
            SectionType::SctPostcode => 0x21,
            SectionType::Unknown(t) => t,
        }
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct CompressionSectionHeader {
    pub uncompressed_length: u32,
    pub compression_type: u8,
}

/// Compression types of compression sections
#[derive(StrDisplay, Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionType {
    #[strum(serialize = "none")]
    NotCompressed,
    /// EFI 1.1 or Tiano, they share the type
    #[strum(serialize = "EFI 1.1/Tiano")]
    Standard,
    #[strum(serialize = "LZMA")]
    Customized,
    #[strum(serialize = "unknown")]
    Unknown(u8),
}

impl From<u8> for CompressionType {
    fn from(t: u8) -> Self {
        match t {
            0x00 => Self::NotCompressed,
            0x01 => Self::Standard,
            0x02 => Self::Customized,
            t => Self::Unknown(t),
        }
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct GuidDefinedSectionHeader {
    pub guid: Guid,
    pub data_offset: u16,
    pub attributes: GuidedAttributes,
}

#[bitfield(u16)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct GuidedAttributes {
    pub processing_required: bool,
    pub auth_status_valid: bool,
    #[bits(14)]
    _0: u16,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct FreeformSubtypeGuidSectionHeader {
    pub sub_type_guid: Guid,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct VersionSectionHeader {
    pub build_number: u16,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct PostcodeSectionHeader {
    pub postcode: u32,
}

/// Certificate preceding the payload of signed GUID-defined sections
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct WinCertificate {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
}

pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0ef1;

pub fn uint24(b: [u8; 3]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], 0])
}

pub fn align4(v: usize) -> usize {
    v.saturating_add(3) & !3
}

pub fn align8(v: usize) -> usize {
    v.saturating_add(7) & !7
}

/// Two's complement 8-bit checksum: adding it to the sum of `data` gives 0.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Same as [`checksum8`] over little-endian 16-bit words.
pub fn checksum16(data: &[u8]) -> u16 {
    data.chunks(2)
        .map(|c| match c {
            [l, h] => u16::from_le_bytes([*l, *h]),
            [l] => *l as u16,
            _ => 0,
        })
        .fold(0u16, |acc, w| acc.wrapping_add(w))
        .wrapping_neg()
}

#[test]
fn file_state_respects_erase_polarity() {
    assert_eq!(FileState::from_raw(0xf8, 0xff), FileState::DataValid);
    assert_eq!(FileState::from_raw(0x07, 0x00), FileState::DataValid);
    assert_eq!(FileState::from_raw(0xe8, 0xff), FileState::Deleted);
    assert_eq!(FileState::from_raw(0xff, 0xff), FileState::Empty);
}

#[test]
fn checksums_cancel_out() {
    let mut d = vec![0x12, 0x34, 0x56, 0x78, 0x9a, 0x00];
    d[5] = checksum8(&d[..5]);
    assert_eq!(checksum8(&d), 0);
    let mut d = vec![0x12, 0x34, 0x56, 0x78, 0x00, 0x00];
    let c = checksum16(&d);
    d[4..6].copy_from_slice(&c.to_le_bytes());
    assert_eq!(checksum16(&d), 0);
}

#[test]
fn file_alignment() {
    let a = FileAttributes::new().with_data_alignment(3);
    assert_eq!(a.alignment_power(FfsVersion::Ffs2), 9);
    let a = a.with_data_alignment_2(true);
    assert_eq!(a.alignment_power(FfsVersion::Ffs2), 9);
    assert_eq!(a.alignment_power(FfsVersion::Ffs3), 20);
    assert_eq!(FileType::from(0xf0), FileType::Pad);
    assert_eq!(u8::from(FileType::from(0xc3)), 0xc3);
    assert_eq!(u8::from(SectionType::from(0x1b)), 0x1b);
    assert_eq!(SectionType::from(0x15).to_string(), "UI");
}
