//! Contents of flash regions other than BIOS
//!
//! Only the bits that identify what is in a region are described here: the
//! MAC address and NVM version of the GbE region and the firmware version
//! following the `$MAN`/`$MN2` manifest signature in the ME region.

use core::fmt::{self, Display};

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

pub const ME_SIGNATURES: [&[u8; 4]; 2] = [b"$MAN", b"$MN2"];
pub const GBE_VERSION_OFFSET: usize = 0x0a;

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct GbeMac {
    pub vendor: [u8; 3],
    pub device: [u8; 3],
}

impl Display for GbeMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.vendor;
        let [d, e, g] = self.device;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[bitfield(u8)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct GbeImageId {
    #[bits(4)]
    pub id: u8,
    #[bits(4)]
    pub minor: u8,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct GbeVersion {
    pub image: GbeImageId,
    pub major: u8,
}

impl Display for GbeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = self.major;
        let minor = self.image.minor();
        let id = self.image.id();
        write!(f, "{major}.{minor} (image id {id})")
    }
}

/// Version record that follows the manifest signature
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct MeVersion {
    pub signature: [u8; 4],
    pub reserved: u32,
    pub major: u16,
    pub minor: u16,
    pub bugfix: u16,
    pub build: u16,
}

impl Display for MeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let MeVersion {
            major,
            minor,
            bugfix,
            build,
            ..
        } = self;
        write!(f, "{major}.{minor}.{bugfix}.{build}")
    }
}

#[test]
fn gbe_fields() {
    use zerocopy::FromBytes;

    let mut d = vec![0u8; 16];
    d[..6].copy_from_slice(&[0x00, 0x1b, 0x21, 0xab, 0xcd, 0xef]);
    d[GBE_VERSION_OFFSET] = 0x32;
    d[GBE_VERSION_OFFSET + 1] = 0x01;
    let (mac, _) = GbeMac::read_from_prefix(&d).unwrap();
    assert_eq!(mac.to_string(), "00:1B:21:AB:CD:EF");
    let (v, _) = GbeVersion::read_from_prefix(&d[GBE_VERSION_OFFSET..]).unwrap();
    assert_eq!(v.to_string(), "1.3 (image id 2)");
}
