//! Capsule headers wrapping firmware images for update delivery
//!
//! See UEFI specification section 8.5.3 for `EFI_CAPSULE_HEADER`.
//! Toshiba and AMI Aptio capsules use their own header layouts.

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::{buffer::Buffer, guid, guid::Guid};

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct CapsuleHeader {
    pub guid: Guid,
    pub header_size: u32,
    pub flags: u32,
    pub image_size: u32,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct ToshibaCapsuleHeader {
    pub guid: Guid,
    pub header_size: u32,
    pub full_size: u32,
    pub flags: u32,
}

/// AMI Aptio capsules start with a regular capsule header.
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct AptioCapsuleHeader {
    pub capsule: CapsuleHeader,
    pub rom_image_offset: u16,
    pub rom_layout_offset: u16,
    pub instruction_set_offset: u16,
    pub reserved: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapsuleKind {
    Uefi,
    Toshiba,
    AptioSigned,
    AptioUnsigned,
}

/// Location of the image inside a capsule.
#[derive(Clone, Copy, Debug)]
pub struct Capsule {
    pub kind: CapsuleKind,
    pub guid: Guid,
    pub header_size: usize,
    /// Size of header plus image
    pub size: usize,
    pub flags: u32,
}

impl Capsule {
    /// Recognize a capsule header at the start of `data`.
    ///
    /// Returns `None` when no known capsule GUID is present and an error
    /// when the header is inconsistent with the data.
    pub fn detect(data: &Buffer) -> Option<Result<Self, String>> {
        let g: Guid = data.read(0)?;
        let kind = match g {
            guid::EFI_CAPSULE
            | guid::INTEL_CAPSULE
            | guid::LENOVO_CAPSULE
            | guid::LENOVO2_CAPSULE => CapsuleKind::Uefi,
            guid::TOSHIBA_CAPSULE => CapsuleKind::Toshiba,
            guid::APTIO_SIGNED_CAPSULE => CapsuleKind::AptioSigned,
            guid::APTIO_UNSIGNED_CAPSULE => CapsuleKind::AptioUnsigned,
            _ => return None,
        };
        Some(Self::parse(data, kind, g))
    }

    fn parse(data: &Buffer, kind: CapsuleKind, guid: Guid) -> Result<Self, String> {
        let l = data.len();
        let (header_size, size, flags) = match kind {
            CapsuleKind::Uefi => {
                let h: CapsuleHeader = data
                    .read(0)
                    .ok_or_else(|| format!("capsule header does not fit in {l:08x} bytes"))?;
                (h.header_size as usize, h.image_size as usize, h.flags)
            }
            CapsuleKind::Toshiba => {
                let h: ToshibaCapsuleHeader = data
                    .read(0)
                    .ok_or_else(|| format!("capsule header does not fit in {l:08x} bytes"))?;
                (h.header_size as usize, h.full_size as usize, h.flags)
            }
            CapsuleKind::AptioSigned | CapsuleKind::AptioUnsigned => {
                let h: AptioCapsuleHeader = data
                    .read(0)
                    .ok_or_else(|| format!("capsule header does not fit in {l:08x} bytes"))?;
                let c = h.capsule;
                (h.rom_image_offset as usize, c.image_size as usize, c.flags)
            }
        };
        if header_size == 0 || header_size > l {
            return Err(format!("capsule header size {header_size:08x} is invalid"));
        }
        if size < header_size || size > l {
            return Err(format!(
                "capsule image size {size:08x} does not match the data size {l:08x}"
            ));
        }
        Ok(Self {
            kind,
            guid,
            header_size,
            size,
            flags,
        })
    }
}

#[test]
fn uefi_capsule() {
    let mut d = guid::EFI_CAPSULE.to_bytes().to_vec();
    d.extend_from_slice(&28u32.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&36u32.to_le_bytes());
    d.extend_from_slice(&[0xff; 8]);
    let c = Capsule::detect(&Buffer::new(d)).unwrap().unwrap();
    assert_eq!(c.kind, CapsuleKind::Uefi);
    assert_eq!(c.header_size, 28);
    assert_eq!(c.size, 36);
}

#[test]
fn capsule_larger_than_data() {
    let mut d = guid::TOSHIBA_CAPSULE.to_bytes().to_vec();
    d.extend_from_slice(&28u32.to_le_bytes());
    d.extend_from_slice(&0x1000u32.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    assert!(Capsule::detect(&Buffer::new(d)).unwrap().is_err());
    assert!(Capsule::detect(&Buffer::new(vec![0; 64])).is_none());
}
