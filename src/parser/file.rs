//! Files inside volumes
use zerocopy::FromBytes;

use crate::{
    ParseError,
    buffer::Buffer,
    ffs::{
        FFS_FIXED_CHECKSUM, FFS_FIXED_CHECKSUM2, FILE_HEADER_SIZE, FILE_HEADER2_SIZE, FfsVersion,
        FileHeader, FileState, FileType, checksum8,
    },
    guid::{self, Guid},
    tree::{Kind, NodeId, NodeSpec, ParsingData},
};

use super::FfsParser;

/// Size of the integrity check tail of revision 1 files
const FILE_TAIL_SIZE: usize = 2;
/// Offsets of the bytes excluded from the header checksum
const HEADER_CHECKSUM: usize = 16;
const FILE_CHECKSUM: usize = 17;
const STATE: usize = 23;

/// Size of the file at `offset`, or 0 if its header does not fit.
pub fn get_file_size(volume: &[u8], offset: usize, version: FfsVersion) -> usize {
    let Some(Ok((h, _))) = volume.get(offset..).map(FileHeader::read_from_prefix) else {
        return 0;
    };
    if version == FfsVersion::Ffs3 && h.attributes.large_file() {
        let Some(Ok((s, _))) = volume.get(offset + FILE_HEADER_SIZE..).map(u64::read_from_prefix)
        else {
            return 0;
        };
        return usize::try_from(s).unwrap_or(usize::MAX);
    }
    h.size() as usize
}

impl FfsParser {
    pub fn parse_file_header(&mut self, file: Buffer, volume: NodeId) -> Result<NodeId, ParseError> {
        let v = self.tree.get(volume);
        let ParsingData::Volume {
            ffs_version: Some(version),
            empty_byte,
            revision,
        } = v.parsing
        else {
            return Err(ParseError::InvalidFile(
                "parent is not an FFS volume".to_string(),
            ));
        };
        let volume_start = v.data.start();
        // Only files in volumes that are directly in the BIOS region (or the
        // bare UEFI image) count for the VTF.
        let top_level = !v.compressed
            && self
                .tree
                .parent(volume)
                .is_some_and(|p| !matches!(self.tree.get(p).kind, Kind::Section(_)))
            && self.bios.is_some_and(|b| self.tree.is_descendant(volume, b));

        let l = file.len();
        let h: FileHeader = file.read(0).ok_or_else(|| {
            ParseError::Truncated(format!("file header does not fit in {l:x}h bytes"))
        })?;
        let attributes = h.attributes;
        let header_size = if version == FfsVersion::Ffs3 && attributes.large_file() {
            FILE_HEADER2_SIZE
        } else {
            FILE_HEADER_SIZE
        };
        // On revision 1 volumes, the large file bit means "tail present".
        let tail_size = if revision == 1 && attributes.large_file() {
            FILE_TAIL_SIZE
        } else {
            0
        };
        if header_size + tail_size > l {
            return Err(ParseError::Truncated(format!(
                "file of {l:x}h bytes cannot hold its header of {header_size:x}h bytes"
            )));
        }

        let name = h.name;
        let file_type = FileType::from(h.file_type);
        let mut problems = Vec::new();

        let mut header = file.mid(0, header_size).as_bytes().to_vec();
        header[HEADER_CHECKSUM] = 0;
        header[FILE_CHECKSUM] = 0;
        header[STATE] = 0;
        let header_checksum = checksum8(&header);
        if header_checksum != h.header_checksum {
            problems.push(format!(
                "parse_file_header: invalid header checksum {:02x}h, should be {header_checksum:02x}h",
                h.header_checksum
            ));
        }

        let body = file.mid(header_size, l - header_size - tail_size);
        let data_checksum = if attributes.checksum() {
            checksum8(body.as_bytes())
        } else if revision == 1 {
            FFS_FIXED_CHECKSUM
        } else {
            FFS_FIXED_CHECKSUM2
        };
        if data_checksum != h.file_checksum {
            problems.push(format!(
                "parse_file_header: invalid data checksum {:02x}h, should be {data_checksum:02x}h",
                h.file_checksum
            ));
        }

        if tail_size != 0 {
            let tail = file.tail(l - tail_size).read::<u16>(0).unwrap_or(0);
            let expected = !h.integrity_check();
            if tail != expected {
                problems.push(format!(
                    "parse_file_header: invalid tail {tail:04x}h, should be {expected:04x}h"
                ));
            }
        }

        let power = attributes.alignment_power(version);
        let body_offset = file.start() + header_size - volume_start;
        if body_offset % (1usize << power) != 0 {
            problems.push(format!(
                "parse_file_header: unaligned file, alignment is {:x}h",
                1usize << power
            ));
        }

        let state = FileState::from_raw(h.state, empty_byte);
        let body_size = body.len();
        let info = vec![
            format!("File GUID: {name}"),
            format!("Type: {:02x}h ({file_type})", h.file_type),
            format!("Attributes: {:02x}h", attributes.into_bits()),
            format!("Full size: {l:x}h ({l})"),
            format!("Header size: {header_size:x}h ({header_size})"),
            format!("Body size: {body_size:x}h ({body_size})"),
            format!("Tail size: {tail_size:x}h ({tail_size})"),
            format!("State: {:02x}h ({state})", h.state),
            format!("Header checksum: {:02x}h", h.header_checksum),
            format!("Data checksum: {:02x}h", h.file_checksum),
        ];
        let has_sections = !matches!(file_type, FileType::Pad | FileType::Raw | FileType::All);
        let spec = NodeSpec::new(Kind::File(file_type), name.name(), file)
            .header(header_size)
            .tail(tail_size)
            .info(info)
            .parsing(ParsingData::File {
                ffs_version: version,
                empty_byte,
                guid: name,
                has_sections,
            });
        let id = self.tree.add_child(volume, spec);
        for p in problems {
            self.msg(Some(id), p);
        }

        if top_level && file_type != FileType::Pad {
            self.set_vtf_candidate(id, name == guid::VOLUME_TOP_FILE);
        }

        if state.has_valid_data() {
            self.parse_file_body(id);
        }
        Ok(id)
    }

    pub fn parse_file_body(&mut self, file: NodeId) {
        let n = self.tree.get(file);
        let ParsingData::File {
            ffs_version,
            has_sections,
            ..
        } = n.parsing
        else {
            return;
        };
        match n.kind {
            Kind::File(FileType::Pad) => self.parse_pad_file_body(file),
            _ if has_sections => {
                let body = n.body();
                if let Err(e) = self.parse_sections(&body, file, ffs_version, false) {
                    self.msg(Some(file), format!("parse_file_body: {e}"));
                }
            }
            // Raw files are decoded in the second pass.
            _ => {}
        }
    }

    pub fn parse_pad_file_body(&mut self, file: NodeId) {
        let n = self.tree.get(file);
        let ParsingData::File { empty_byte, .. } = n.parsing else {
            return;
        };
        let body = n.body();
        let Some(i) = body.as_bytes().iter().position(|&b| b != empty_byte) else {
            return;
        };
        if i > 0 {
            self.add_free_space(file, body.mid(0, i));
        }
        let p = self.add_padding(file, body.tail(i));
        self.msg(Some(p), "parse_pad_file_body: non-UEFI data found in pad file");
    }

    /// Raw and "all" files are opaque, except for apriori lists.
    pub(crate) fn parse_raw_file_body(&mut self, file: NodeId) {
        let n = self.tree.get(file);
        if let ParsingData::File { guid, .. } = n.parsing
            && is_apriori(&guid)
        {
            let body = n.body();
            self.parse_apriori_raw_section(&body, file);
        }
    }

    /// Render a list of GUIDs giving the dispatch order.
    pub fn parse_apriori_raw_section(&mut self, data: &Buffer, node: NodeId) {
        let l = data.len();
        if l % size_of::<Guid>() != 0 {
            self.msg(
                Some(node),
                format!("parse_apriori_raw_section: apriori list of {l:x}h bytes is not a multiple of 16"),
            );
        }
        let names: Vec<String> = data
            .as_bytes()
            .chunks_exact(size_of::<Guid>())
            .filter_map(|c| Guid::read_from_bytes(c).ok())
            .map(|g| g.name())
            .collect();
        for (i, name) in names.iter().enumerate() {
            self.tree.add_info(node, format!("Apriori {}: {name}", i + 1));
        }
        let file = self
            .tree
            .find_parent_of_kind(node, |k| matches!(k, Kind::File(_)));
        if let Some(f) = file
            && let ParsingData::File { guid, .. } = self.tree.get(f).parsing
        {
            let text = if guid == guid::PEI_APRIORI {
                "PEI apriori file"
            } else {
                "DXE apriori file"
            };
            self.tree.set_text(f, text);
        }
    }
}

pub(crate) fn is_apriori(guid: &Guid) -> bool {
    *guid == guid::PEI_APRIORI || *guid == guid::DXE_APRIORI
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ParseStatus,
        ffs::SectionType,
        testimg::{self, Volume},
        tree::PaddingType,
    };

    fn only_file(p: &FfsParser) -> NodeId {
        let t = p.tree();
        let image = t.children(t.root())[0];
        let v = t.children(image)[0];
        t.children(v)[0]
    }

    #[test]
    fn extended_file_size() {
        let mut h = vec![0u8; 32];
        h[20..23].copy_from_slice(&[0x30, 0, 0]);
        h[24..32].copy_from_slice(&0x0100_0000u64.to_le_bytes());
        assert_eq!(get_file_size(&h, 0, FfsVersion::Ffs3), 0x30);
        assert_eq!(get_file_size(&h, 0, FfsVersion::Ffs2), 0x30);
        // large file attribute
        h[19] = 0x01;
        assert_eq!(get_file_size(&h, 0, FfsVersion::Ffs3), 0x0100_0000);
        assert_eq!(get_file_size(&h, 0, FfsVersion::Ffs2), 0x30);
        assert_eq!(get_file_size(&h[..28], 0, FfsVersion::Ffs3), 0);
        assert_eq!(get_file_size(&h, 16, FfsVersion::Ffs2), 0);
    }

    #[test]
    fn large_file_on_ffs3() {
        let f = testimg::large_file(
            FileType::Freeform,
            testimg::TEST_GUID,
            &testimg::section(SectionType::Raw, &[], &[0; 4]),
        );
        assert_eq!(f.len(), 40);
        let img = Volume::ffs3().file(f).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let f = only_file(&p);
        let t = p.tree();
        assert_eq!(t.get(f).header_size, FILE_HEADER2_SIZE);
        assert_eq!(t.children(f).len(), 1);
    }

    #[test]
    fn bad_data_checksum() {
        let mut f = testimg::file(
            FileType::Freeform,
            testimg::TEST_GUID,
            &testimg::section(SectionType::Raw, &[], &[0; 4]),
        );
        f[FILE_CHECKSUM] = 0x55;
        let img = Volume::ffs2().file(f).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        // the state byte is not part of the header checksum
        assert_eq!(p.messages().len(), 1, "{:?}", p.messages());
        assert!(p.messages()[0].1.contains("data checksum 55h"));
        assert_eq!(p.messages()[0].0, Some(only_file(&p)));
    }

    #[test]
    fn deleted_file_is_a_leaf() {
        let mut f = testimg::file(
            FileType::Freeform,
            testimg::TEST_GUID,
            &testimg::section(SectionType::Raw, &[], &[0; 4]),
        );
        f[STATE] = 0xe8;
        let img = Volume::ffs2().file(f).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let f = only_file(&p);
        let t = p.tree();
        assert!(t.children(f).is_empty());
        assert!(t.get(f).info.iter().any(|i| i.contains("Deleted")));
    }

    #[test]
    fn pad_file_with_data() {
        let mut f = testimg::pad_file(16);
        f[24 + 8] = 0x42;
        let img = Volume::ffs2().file(f).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        let f = only_file(&p);
        let t = p.tree();
        let c = t.children(f);
        assert_eq!(c.len(), 2);
        assert_eq!(t.get(c[0]).kind, Kind::Padding(PaddingType::FreeSpace));
        assert_eq!(t.get(c[0]).size(), 8);
        assert_eq!(t.get(c[1]).kind, Kind::Padding(PaddingType::NonEmpty));
        // pad files are never the top file
        assert_eq!(p.last_vtf(), None);
    }

    #[test]
    fn apriori_list() {
        let mut list = guid::DXE_APRIORI.to_bytes().to_vec();
        list.extend_from_slice(&guid::FFS2.to_bytes());
        let img = Volume::ffs2()
            .file(testimg::file(
                FileType::Freeform,
                guid::PEI_APRIORI,
                &testimg::section(SectionType::Raw, &[], &list),
            ))
            .build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let f = only_file(&p);
        let t = p.tree();
        assert_eq!(t.get(f).text, "PEI apriori file");
        let s = t.children(f)[0];
        let info = &t.get(s).info;
        assert!(info.contains(&"Apriori 1: DxeAprioriFile".to_string()));
        assert!(info.contains(&"Apriori 2: EfiFirmwareFileSystem2Guid".to_string()));
    }

    #[test]
    fn raw_apriori_file() {
        let list = guid::DXE_APRIORI.to_bytes();
        let img = Volume::ffs2()
            .file(testimg::file(FileType::Raw, guid::DXE_APRIORI, &list[..8]))
            .build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        assert!(p.messages()[0].1.contains("not a multiple of 16"));
        assert_eq!(p.tree().get(only_file(&p)).text, "DXE apriori file");
    }

    #[test]
    fn revision_1_tail() {
        let f = testimg::file_with_tail(
            FileType::Freeform,
            testimg::TEST_GUID,
            &testimg::section(SectionType::Raw, &[], &[0; 2]),
        );
        assert_eq!(f.len(), 32);
        let img = Volume::ffs2().revision(1).file(f.clone()).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let file = only_file(&p);
        assert_eq!(p.tree().get(file).tail_size, FILE_TAIL_SIZE);

        let mut bad = f;
        bad[31] ^= 0xff;
        let img = Volume::ffs2().revision(1).file(bad).build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        assert!(p.messages()[0].1.contains("invalid tail"));
    }
}
