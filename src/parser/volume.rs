//! Volumes and the chains they form in raw areas
use std::collections::HashSet;

use crate::{
    ParseError,
    buffer::Buffer,
    ffs::{
        BLOCK_MAP_ENTRY_SIZE, BlockMapEntry, FILE_HEADER_SIZE, FV_SIGNATURE, FV_SIGNATURE_OFFSET,
        FileType, VOLUME_HEADER_SIZE, VolumeExtHeader, VolumeHeader, align8, checksum16,
    },
    guid::{self, Guid},
    tree::{Kind, NodeId, NodeSpec, PaddingType, ParsingData, VolumeType},
};

use super::{FfsParser, file::get_file_size};

/// Offset of the checksum within the volume header
const CHECKSUM_OFFSET: usize = 50;
/// Smallest sane volume: header and a terminated block map
const MIN_VOLUME_SIZE: u64 = (VOLUME_HEADER_SIZE + 2 * BLOCK_MAP_ENTRY_SIZE) as u64;

impl FfsParser {
    /// Decode all volumes in `data`, turning the gaps into padding.
    ///
    /// Creates no nodes and fails with [`ParseError::VolumesNotFound`] when
    /// there is not a single volume.
    pub fn parse_raw_area(&mut self, data: Buffer, parent: NodeId) -> Result<(), ParseError> {
        let Some(first) = self.find_next_volume(&data, 0, parent) else {
            return Err(ParseError::VolumesNotFound);
        };
        let l = data.len();
        let mut prev_end = 0;
        let mut offset = first;
        loop {
            if offset > prev_end {
                self.add_padding(parent, data.mid(prev_end, offset - prev_end));
            }
            let (size, block_map_size) = match self.get_volume_size(&data, offset) {
                Ok(s) => s,
                Err(e) => {
                    let p = self.add_padding(parent, data.tail(offset));
                    self.msg(Some(p), format!("parse_raw_area: {e}"));
                    prev_end = l;
                    break;
                }
            };
            let remaining = l - offset;
            let clamped = size.min(remaining);
            match self.parse_volume_header(data.mid(offset, clamped), parent) {
                Ok(v) => {
                    if size > remaining {
                        self.msg(
                            Some(v),
                            format!(
                                "parse_raw_area: volume size {size:x}h exceeds the remaining {remaining:x}h bytes, truncated"
                            ),
                        );
                    }
                    if block_map_size != size {
                        self.msg(
                            Some(v),
                            format!(
                                "parse_raw_area: volume size {size:x}h differs from the size {block_map_size:x}h given by the block map"
                            ),
                        );
                    }
                    self.parse_volume_body(v);
                }
                Err(e) => {
                    let p = self.add_padding(parent, data.mid(offset, clamped));
                    self.msg(Some(p), format!("parse_raw_area: {e}"));
                }
            }
            prev_end = offset + clamped;
            match self.find_next_volume(&data, prev_end, parent) {
                Some(o) => offset = o,
                None => break,
            }
        }
        if prev_end < l {
            self.add_padding(parent, data.tail(prev_end));
        }
        Ok(())
    }

    /// Offset of the next plausible volume header at or after `offset`.
    pub fn find_next_volume(&mut self, data: &Buffer, offset: usize, parent: NodeId) -> Option<usize> {
        let mut pos = offset + FV_SIGNATURE_OFFSET;
        while let Some(i) = data.find(&FV_SIGNATURE, pos) {
            pos = i + 1;
            let start = i - FV_SIGNATURE_OFFSET;
            let Some(h) = data.read::<VolumeHeader>(start) else {
                continue;
            };
            let len = h.fv_length;
            if !(MIN_VOLUME_SIZE..1 << 32).contains(&len) {
                self.msg(
                    Some(parent),
                    format!(
                        "find_next_volume: volume candidate at {start:08x} skipped, has invalid FvLength {len:x}h"
                    ),
                );
                continue;
            }
            if h.revision != 1 && h.revision != 2 {
                self.msg(
                    Some(parent),
                    format!(
                        "find_next_volume: volume candidate at {start:08x} skipped, has unknown revision {}",
                        h.revision
                    ),
                );
                continue;
            }
            return Some(start);
        }
        None
    }

    /// Declared size and the size given by the block map.
    pub fn get_volume_size(&self, data: &Buffer, offset: usize) -> Result<(usize, usize), ParseError> {
        let h: VolumeHeader = data.read(offset).ok_or_else(|| {
            ParseError::Truncated(format!("volume header at {offset:08x} does not fit"))
        })?;
        if h.signature != FV_SIGNATURE {
            return Err(ParseError::InvalidVolume(format!(
                "no signature at {offset:08x}"
            )));
        }
        let header_end = offset + h.header_length as usize;
        let mut pos = offset + VOLUME_HEADER_SIZE;
        let mut block_map_size = 0u64;
        while pos + BLOCK_MAP_ENTRY_SIZE <= header_end {
            let Some(e) = data.read::<BlockMapEntry>(pos) else {
                break;
            };
            if e.num_blocks == 0 && e.length == 0 {
                break;
            }
            block_map_size += e.num_blocks as u64 * e.length as u64;
            pos += BLOCK_MAP_ENTRY_SIZE;
        }
        Ok((h.fv_length as usize, block_map_size as usize))
    }

    pub fn parse_volume_header(&mut self, volume: Buffer, parent: NodeId) -> Result<NodeId, ParseError> {
        let l = volume.len();
        let h: VolumeHeader = volume.read(0).ok_or_else(|| {
            ParseError::Truncated(format!("volume header does not fit in {l:x}h bytes"))
        })?;
        let header_length = h.header_length as usize;
        if header_length < VOLUME_HEADER_SIZE || header_length > l {
            return Err(ParseError::InvalidVolume(format!(
                "header length {header_length:x}h is invalid for a volume of {l:x}h bytes"
            )));
        }

        let mut problems = Vec::new();
        let mut header_size = header_length;
        let mut fv_name = None;
        if h.revision > 1 && h.ext_header_offset != 0 {
            let ext_offset = h.ext_header_offset as usize;
            match volume.read::<VolumeExtHeader>(ext_offset) {
                Some(ext)
                    if ext.ext_header_size as usize >= size_of::<VolumeExtHeader>()
                        && ext_offset + ext.ext_header_size as usize <= l =>
                {
                    header_size = align8(ext_offset + ext.ext_header_size as usize).min(l);
                    fv_name = Some(ext.fv_name);
                }
                _ => problems.push(format!(
                    "parse_volume_header: extended header at {ext_offset:x}h is invalid"
                )),
            }
        }

        let mut header = volume.mid(0, header_length).as_bytes().to_vec();
        header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
        let expected = checksum16(&header);
        let checksum = h.checksum;
        if checksum != expected {
            problems.push(format!(
                "parse_volume_header: volume header checksum {checksum:04x}h is invalid, should be {expected:04x}h"
            ));
        }

        let attributes = h.attributes;
        if h.revision > 1 && !attributes.weak_alignment() {
            let alignment = 1usize << attributes.alignment();
            if !self.is_compressed(parent, &volume) && volume.start() % alignment != 0 {
                problems.push(format!(
                    "parse_volume_header: unaligned volume, alignment is {alignment:x}h"
                ));
            }
        }

        let ffs_version = guid::ffs_version_of(&h.fs_guid);
        let volume_type = match ffs_version {
            Some(v) => VolumeType::Ffs(v),
            None if h.fs_guid == guid::NVRAM_FV => VolumeType::Nvram,
            None => {
                problems.push(format!(
                    "parse_volume_header: unknown file system {}",
                    h.fs_guid
                ));
                VolumeType::Unknown
            }
        };
        let empty_byte = attributes.empty_byte();

        let mut info = vec![
            "Signature: _FVH".to_string(),
            format!("File system GUID: {}", h.fs_guid),
            format!("Full size: {l:x}h ({l})"),
            format!("Header size: {header_size:x}h ({header_size})"),
            format!("Body size: {:x}h ({})", l - header_size, l - header_size),
            format!("Revision: {}", h.revision),
            format!("Attributes: {:08x}h", attributes.into_bits()),
            format!("Erase polarity: {}", u8::from(attributes.erase_polarity())),
            format!("Checksum: {checksum:04x}h"),
        ];
        if let Some(g) = fv_name {
            info.push(format!("Volume GUID: {g}"));
        }
        let name = match fv_name {
            Some(g) if g.label().is_some() => g.name(),
            _ => h.fs_guid.name(),
        };
        let spec = NodeSpec::new(Kind::Volume(volume_type), name, volume)
            .header(header_size)
            .info(info)
            .parsing(ParsingData::Volume {
                ffs_version,
                empty_byte,
                revision: h.revision,
            });
        let id = self.tree.add_child(parent, spec);
        for p in problems {
            self.msg(Some(id), p);
        }
        Ok(id)
    }

    /// Walk the files of a volume and whatever trails them.
    pub fn parse_volume_body(&mut self, volume: NodeId) {
        let n = self.tree.get(volume);
        let ParsingData::Volume {
            ffs_version: Some(version),
            empty_byte,
            ..
        } = n.parsing
        else {
            // Unknown and NVRAM file systems stay opaque.
            return;
        };
        let body = n.body();
        let l = body.len();

        let mut offset = 0;
        let mut seen: HashSet<Guid> = HashSet::new();
        while offset < l {
            // An erased header has a plausible size in FFS2 volumes over 16 MiB.
            let erased = body.mid(offset, FILE_HEADER_SIZE).is_uniform(empty_byte);
            let size = get_file_size(body.as_bytes(), offset, version);
            if erased || size < FILE_HEADER_SIZE || size > l - offset {
                let rest = body.tail(offset);
                if erased {
                    match rest.as_bytes().iter().position(|&b| b != empty_byte) {
                        None => self.add_free_space(volume, rest),
                        Some(i) => {
                            // Data starts at a file boundary, free space before.
                            let i = i & !7;
                            self.add_free_space(volume, rest.mid(0, i));
                            self.parse_volume_non_uefi_data(rest.tail(i), volume);
                        }
                    }
                } else {
                    self.parse_volume_non_uefi_data(rest, volume);
                }
                break;
            }

            match self.parse_file_header(body.mid(offset, size), volume) {
                Ok(f) => {
                    let file = self.tree.get(f);
                    if let (Kind::File(t), ParsingData::File { guid, .. }) = (file.kind, &file.parsing) {
                        let guid = *guid;
                        if t != FileType::Pad && !seen.insert(guid) {
                            self.msg(
                                Some(f),
                                format!("parse_volume_body: file with duplicate GUID {guid}"),
                            );
                        }
                    }
                }
                Err(e) => {
                    let p = self.add_padding(volume, body.mid(offset, size));
                    self.msg(Some(p), format!("parse_volume_body: {e}"));
                }
            }
            let end = offset + size;
            offset = align8(end);
            if end < l {
                let gap = body.mid(end, offset.min(l) - end);
                if gap.is_uniform(empty_byte) {
                    self.add_free_space(volume, gap);
                } else {
                    self.add_padding(volume, gap);
                }
            }
        }
    }

    pub(crate) fn add_free_space(&mut self, parent: NodeId, data: Buffer) {
        if data.is_empty() {
            return;
        }
        let info = vec![format!("Full size: {:x}h ({})", data.len(), data.len())];
        let kind = Kind::Padding(PaddingType::FreeSpace);
        let spec = NodeSpec::new(kind, "Free space", data).info(info);
        self.tree.add_child(parent, spec);
    }

    /// Data in a volume that is neither a file nor free space. A VTF may still
    /// hide at its end, e.g. behind data placed by a vendor tool.
    pub fn parse_volume_non_uefi_data(&mut self, data: Buffer, volume: NodeId) {
        let version = match self.tree.get(volume).parsing {
            ParsingData::Volume {
                ffs_version: Some(v),
                ..
            } => Some(v),
            _ => None,
        };
        let vtf = guid::VOLUME_TOP_FILE.to_bytes();
        let mut pos = 0;
        let mut vtf_offset = None;
        while let Some(i) = data.find(&vtf, pos) {
            if i % 8 == 0 {
                vtf_offset = Some(i);
                break;
            }
            pos = i + 1;
        }

        if let (Some(i), Some(version)) = (vtf_offset, version) {
            let file = data.tail(i);
            let size = get_file_size(file.as_bytes(), 0, version);
            if size >= FILE_HEADER_SIZE && size <= file.len() {
                if i > 0 {
                    let p = self.add_padding(volume, data.mid(0, i));
                    self.msg(
                        Some(p),
                        "parse_volume_non_uefi_data: non-UEFI data found in volume's free space",
                    );
                }
                match self.parse_file_header(file.mid(0, size), volume) {
                    Ok(_) => {}
                    Err(e) => {
                        let p = self.add_padding(volume, file.mid(0, size));
                        self.msg(Some(p), format!("parse_volume_non_uefi_data: {e}"));
                    }
                }
                if size < file.len() {
                    let p = self.add_padding(volume, file.tail(size));
                    self.msg(Some(p), "parse_volume_non_uefi_data: data after the volume top file");
                }
                return;
            }
        }

        let p = self.add_padding(volume, data);
        self.msg(
            Some(p),
            "parse_volume_non_uefi_data: non-UEFI data found in volume's free space",
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        FfsParser, ParseStatus,
        ffs::{FileType, SectionType},
        guid,
        testimg::{self, Volume},
        tree::{Kind, PaddingType},
    };

    #[test]
    fn bad_header_checksum() {
        let mut img = Volume::ffs2()
            .file(testimg::file(
                FileType::Freeform,
                testimg::TEST_GUID,
                &testimg::section(SectionType::Raw, &[], &[0; 4]),
            ))
            .build();
        img[50] ^= 0x01;
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        assert_eq!(p.messages().len(), 1);
        assert!(p.messages()[0].1.contains("checksum"));
        // the volume is decoded anyway
        let t = p.tree();
        assert!(t.walk().iter().any(|id| t.get(*id).kind == Kind::File(FileType::Freeform)));
    }

    #[test]
    fn free_space_and_trailing_data() {
        let vol = Volume::ffs2()
            .file(testimg::pad_file(8))
            .size(72 + 32 + 64);
        let mut img = vol.build();
        // garbage inside the free space, past a file header's worth of it
        img[72 + 32 + 35] = 0x12;
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        let t = p.tree();
        let image = t.children(t.root())[0];
        let v = t.children(image)[0];
        let kinds: Vec<Kind> = t.children(v).iter().map(|c| t.get(*c).kind).collect();
        assert_eq!(kinds[0], Kind::File(FileType::Pad));
        assert_eq!(kinds[1], Kind::Padding(PaddingType::FreeSpace));
        assert!(matches!(kinds[2], Kind::Padding(_)));
        assert_eq!(t.get(t.children(v)[1]).size(), 32);
        assert_eq!(t.get(t.children(v)[2]).size(), 32);
        assert_eq!(p.messages().len(), 1);
    }

    #[test]
    fn erased_header_in_large_ffs2_volume() {
        // 0xFFFFFF fits into the body, so only the header content tells
        // free space apart from a file.
        let img = Volume::ffs2().file(testimg::pad_file(8)).size(0x100_0100).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        let v = t.children(image)[0];
        let kinds: Vec<Kind> = t.children(v).iter().map(|c| t.get(*c).kind).collect();
        assert_eq!(
            kinds,
            vec![Kind::File(FileType::Pad), Kind::Padding(PaddingType::FreeSpace)]
        );
        assert_eq!(t.get(t.children(v)[1]).size(), 0x100_0100 - 72 - 32);
    }

    #[test]
    fn gap_between_files() {
        // 38 byte file, two bytes to the next 8 byte boundary
        let ui = testimg::ui_section("Test");
        let odd = testimg::file(FileType::Freeform, testimg::TEST_GUID, &ui);
        let img = Volume::ffs2().file(odd).file(testimg::pad_file(8)).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        let v = t.children(image)[0];
        let c = t.children(v);
        assert_eq!(c.len(), 3);
        assert_eq!(t.get(c[1]).kind, Kind::Padding(PaddingType::FreeSpace));
        assert_eq!(t.get(c[1]).size(), 2);
        assert_eq!(t.get(c[1]).absolute_offset, Some(72 + 38));
        assert_eq!(t.get(c[2]).absolute_offset, Some(72 + 40));
    }

    #[test]
    fn duplicate_guids() {
        let f = testimg::file(
            FileType::Freeform,
            testimg::TEST_GUID,
            &testimg::section(SectionType::Raw, &[], &[0; 4]),
        );
        let img = Volume::ffs2().file(f.clone()).file(f).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        assert_eq!(p.messages().len(), 1);
        assert!(p.messages()[0].1.contains("duplicate GUID"));
    }

    #[test]
    fn extended_header_and_ffs3() {
        let img = Volume::ffs3()
            .ext_header(guid::DXE_APRIORI)
            .file(testimg::file(
                FileType::Freeform,
                testimg::TEST_GUID,
                &testimg::section(SectionType::Raw, &[], &[0; 4]),
            ))
            .build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        let v = t.children(image)[0];
        // 56 + 2 * 8 block map, 20 bytes extended header, aligned to 8
        assert_eq!(t.get(v).header_size, 96);
        assert_eq!(t.get(t.children(v)[0]).absolute_offset, Some(96));
    }

    #[test]
    fn nvram_volume_is_opaque() {
        let img = Volume::with_fs(guid::NVRAM_FV).size(0x100).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        let v = t.children(image)[0];
        assert!(t.children(v).is_empty());
    }

    #[test]
    fn implausible_candidate_is_skipped() {
        let mut img = vec![0u8; 0x48];
        img[40..44].copy_from_slice(b"_FVH");
        img[32..40].copy_from_slice(&8u64.to_le_bytes());
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::SignatureNotFound);
        assert_eq!(p.messages().len(), 2, "{:?}", p.messages());
        assert!(p.messages()[0].1.contains("invalid FvLength"));
    }
}
