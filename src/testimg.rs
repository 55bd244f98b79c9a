//! Builders for small synthetic images used by the unit tests
use crate::{
    ffs::{FileType, SectionType, align8, checksum8, checksum16},
    guid::{self, Guid},
};

pub const TEST_GUID: Guid = Guid::new(
    0x3D17205B,
    0x4C49,
    0x47E2,
    [0x8A, 0x47, 0x37, 0x2F, 0x16, 0xB5, 0x0A, 0x51],
);

pub fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Section with a common header; `extra_header` follows the common header.
pub fn section(t: SectionType, extra_header: &[u8], body: &[u8]) -> Vec<u8> {
    let size = (4 + extra_header.len() + body.len()) as u32;
    let mut s = size.to_le_bytes()[..3].to_vec();
    s.push(u8::from(t));
    s.extend_from_slice(extra_header);
    s.extend_from_slice(body);
    s
}

/// UI section with a NUL terminated name
pub fn ui_section(name: &str) -> Vec<u8> {
    let mut n = utf16(name);
    n.extend_from_slice(&[0, 0]);
    section(SectionType::UserInterface, &[], &n)
}

pub fn guided_section(guid: Guid, attributes: u16, payload: &[u8]) -> Vec<u8> {
    let mut h = guid.to_bytes().to_vec();
    h.extend_from_slice(&24u16.to_le_bytes());
    h.extend_from_slice(&attributes.to_le_bytes());
    section(SectionType::GuidDefined, &h, payload)
}

/// CRC32 GUID-defined section with a valid checksum at offset 24.
pub fn crc32_section(payload: &[u8]) -> Vec<u8> {
    const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut h = guid::CRC32_SECTION.to_bytes().to_vec();
    h.extend_from_slice(&28u16.to_le_bytes());
    h.extend_from_slice(&0x02u16.to_le_bytes());
    h.extend_from_slice(&CRC32.checksum(payload).to_le_bytes());
    section(SectionType::GuidDefined, &h, payload)
}

pub fn compressed_section(compression_type: u8, uncompressed_length: u32, payload: &[u8]) -> Vec<u8> {
    let mut h = uncompressed_length.to_le_bytes().to_vec();
    h.push(compression_type);
    section(SectionType::Compression, &h, payload)
}

fn fix_header_checksum(f: &mut [u8], header_size: usize) {
    let mut h = f[..header_size].to_vec();
    h[16] = 0;
    h[17] = 0;
    h[23] = 0;
    f[16] = checksum8(&h);
}

fn file_header(t: FileType, guid: Guid, attributes: u8, size: u32) -> Vec<u8> {
    let mut f = guid.to_bytes().to_vec();
    f.extend_from_slice(&[0, 0xaa, u8::from(t), attributes]);
    f.extend_from_slice(&size.to_le_bytes()[..3]);
    // data valid, inverted for erase polarity 1
    f.push(0xf8);
    f
}

/// File with a 24-byte header and no checksum attribute.
pub fn file(t: FileType, guid: Guid, body: &[u8]) -> Vec<u8> {
    let mut f = file_header(t, guid, 0, (24 + body.len()) as u32);
    f.extend_from_slice(body);
    fix_header_checksum(&mut f, 24);
    f
}

/// File using the 32-byte header of FFS3 volumes.
pub fn large_file(t: FileType, guid: Guid, body: &[u8]) -> Vec<u8> {
    let mut f = file_header(t, guid, 0x01, 0);
    f.extend_from_slice(&((32 + body.len()) as u64).to_le_bytes());
    f.extend_from_slice(body);
    fix_header_checksum(&mut f, 32);
    f
}

/// File with the integrity check tail of revision 1 volumes.
pub fn file_with_tail(t: FileType, guid: Guid, body: &[u8]) -> Vec<u8> {
    let mut f = file_header(t, guid, 0x01, (24 + body.len() + 2) as u32);
    f[17] = 0x5a;
    f.extend_from_slice(body);
    fix_header_checksum(&mut f, 24);
    let tail = !u16::from_le_bytes([f[16], f[17]]);
    f.extend_from_slice(&tail.to_le_bytes());
    f
}

pub fn pad_file(body_len: usize) -> Vec<u8> {
    file(FileType::Pad, Guid::new(0xffff_ffff, 0xffff, 0xffff, [0xff; 8]), &vec![0xff; body_len])
}

/// Volume builder; files are placed 8-byte aligned after the header.
#[derive(Clone, Debug)]
pub struct Volume {
    fs: Guid,
    revision: u8,
    ext_name: Option<Guid>,
    files: Vec<Vec<u8>>,
    size: Option<usize>,
}

impl Volume {
    pub fn with_fs(fs: Guid) -> Self {
        Self {
            fs,
            revision: 2,
            ext_name: None,
            files: Vec::new(),
            size: None,
        }
    }

    pub fn ffs2() -> Self {
        Self::with_fs(guid::FFS2)
    }

    pub fn ffs3() -> Self {
        Self::with_fs(guid::FFS3)
    }

    pub fn revision(mut self, revision: u8) -> Self {
        self.revision = revision;
        self
    }

    pub fn ext_header(mut self, name: Guid) -> Self {
        self.ext_name = Some(name);
        self
    }

    pub fn file(mut self, file: Vec<u8>) -> Self {
        self.files.push(file);
        self
    }

    /// Total size, the remainder being free space.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut v = vec![0u8; 72];
        if let Some(name) = self.ext_name {
            v.extend_from_slice(&name.to_bytes());
            v.extend_from_slice(&20u32.to_le_bytes());
            v.resize(96, 0xff);
        }
        for f in &self.files {
            v.resize(align8(v.len()), 0xff);
            v.extend_from_slice(f);
        }
        if let Some(s) = self.size {
            v.resize(s.max(v.len()), 0xff);
        }

        let l = v.len() as u64;
        v[16..32].copy_from_slice(&self.fs.to_bytes());
        v[32..40].copy_from_slice(&l.to_le_bytes());
        v[40..44].copy_from_slice(b"_FVH");
        v[44..48].copy_from_slice(&0x800u32.to_le_bytes());
        v[48..50].copy_from_slice(&72u16.to_le_bytes());
        let ext_offset: u16 = if self.ext_name.is_some() { 72 } else { 0 };
        v[52..54].copy_from_slice(&ext_offset.to_le_bytes());
        v[55] = self.revision;
        v[56..60].copy_from_slice(&1u32.to_le_bytes());
        v[60..64].copy_from_slice(&(l as u32).to_le_bytes());
        let c = checksum16(&v[..72]);
        v[50..52].copy_from_slice(&c.to_le_bytes());
        v
    }
}
