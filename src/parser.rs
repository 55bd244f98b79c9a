//! Two-pass decoder turning an image into a [`Tree`]
//!
//! The first pass lays out the structure using size fields only: capsule,
//! descriptor regions, volumes, files and the sections directly inside files.
//! The second pass walks the tree depth-first and decodes section bodies,
//! which may graft further nodes, e.g. from decompressed payloads. Finally,
//! absolute offsets and memory addresses are filled in.
//!
//! Nothing stops a parse session short. Whatever cannot be decoded becomes
//! padding or an opaque node, and a diagnostic is recorded for it.
pub mod file;
pub mod image;
pub mod section;
pub mod volume;

use log::{debug, info};

use crate::{
    ParseError, ParseStatus, ParserConfig,
    buffer::Buffer,
    capsule::Capsule,
    ffs::FileType,
    ifd::IFD,
    tree::{Kind, NodeId, NodeSpec, PaddingType, Tree},
};

pub use file::get_file_size;
pub use section::get_section_size;

/// Diagnostic attached to a node, or to the session as a whole
pub type Message = (Option<NodeId>, String);

/// A parse session; the tree and diagnostics of the last [`Self::parse`]
/// stay available until the next one.
#[derive(Debug)]
pub struct FfsParser {
    config: ParserConfig,
    tree: Tree,
    messages: Vec<Message>,
    /// Last top-level file seen, and whether it carries the VTF GUID
    last_vtf: Option<(NodeId, bool)>,
    capsule_offset_fixup: usize,
    /// Subtree that is mapped below 4GiB
    bios: Option<NodeId>,
}

impl Default for FfsParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl FfsParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            tree: Tree::new(Buffer::new(Vec::new())),
            messages: Vec::new(),
            last_vtf: None,
            capsule_offset_fixup: 0,
            bios: None,
        }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// File used as the anchor for memory addresses
    pub fn last_vtf(&self) -> Option<NodeId> {
        self.last_vtf.map(|(id, _)| id)
    }

    pub fn parse(&mut self, data: &[u8]) -> ParseStatus {
        self.tree = Tree::new(Buffer::new(data.to_vec()));
        self.messages.clear();
        self.last_vtf = None;
        self.capsule_offset_fixup = 0;
        self.bios = None;

        if data.is_empty() {
            return ParseStatus::Fatal("empty input".to_string());
        }

        let root = self.tree.root();
        let found = self.first_pass(root);
        self.second_pass(root);
        self.add_offsets(root, 0, false);
        self.add_memory_addresses();

        match found {
            Err(ParseError::VolumesNotFound) => ParseStatus::SignatureNotFound,
            _ if self.messages.is_empty() => ParseStatus::Success,
            _ => ParseStatus::PartiallyParsed,
        }
    }

    pub(crate) fn msg(&mut self, node: Option<NodeId>, text: impl Into<String>) {
        let text = text.into();
        debug!("{text}");
        self.messages.push((node, text));
    }

    /// Whether nodes created from `data` below `parent` live outside the
    /// input image.
    pub(crate) fn is_compressed(&self, parent: NodeId, data: &Buffer) -> bool {
        let p = self.tree.get(parent);
        p.compressed || !p.data.same_storage(data)
    }

    /// Classify the input and lay out everything that size fields describe.
    fn first_pass(&mut self, root: NodeId) -> Result<(), ParseError> {
        let data = self.tree.get(root).data.clone();

        let (image, parent) = match Capsule::detect(&data) {
            Some(Ok(c)) => {
                info!("{:?} capsule, header {:08x}", c.kind, c.header_size);
                let info = vec![
                    format!("Capsule GUID: {}", c.guid),
                    format!("Full size: {:x}h ({})", c.size, c.size),
                    format!("Header size: {:x}h ({})", c.header_size, c.header_size),
                    format!("Flags: {:08x}h", c.flags),
                ];
                let spec = NodeSpec::new(Kind::Capsule, c.guid.name(), data.mid(0, c.size))
                    .header(c.header_size)
                    .info(info);
                let capsule = self.tree.add_child(root, spec);
                self.capsule_offset_fixup = c.header_size;
                if c.size < data.len() {
                    let p = self.add_padding(root, data.tail(c.size));
                    self.msg(Some(p), "first_pass: data after the end of the capsule");
                }
                (self.tree.get(capsule).body(), capsule)
            }
            Some(Err(e)) => {
                self.msg(Some(root), format!("first_pass: {e}"));
                (data, root)
            }
            None => (data, root),
        };

        if IFD::is_present(image.as_bytes()) {
            info!("Intel image with flash descriptor");
            self.parse_intel_image(image, parent)
        } else {
            info!("UEFI image");
            self.parse_uefi_image(image, parent)
        }
    }

    /// Run body decoders depth-first; children are read after the decoder,
    /// so grafted nodes are visited as well.
    fn second_pass(&mut self, id: NodeId) {
        match self.tree.get(id).kind {
            Kind::Section(_) => self.parse_section_body(id),
            Kind::File(FileType::Raw | FileType::All) => self.parse_raw_file_body(id),
            _ => {}
        }
        let children = self.tree.children(id).to_vec();
        for c in children {
            self.second_pass(c);
        }
    }

    /// Whether nested content below `id` may still be decoded.
    pub(crate) fn check_depth(&mut self, id: NodeId) -> bool {
        let d = self.tree.depth(id);
        if d >= self.config.max_depth {
            self.msg(
                Some(id),
                format!("maximum nesting depth {} reached, content not decoded", self.config.max_depth),
            );
            return false;
        }
        true
    }

    fn add_offsets(&mut self, id: NodeId, parent_offset: usize, in_capsule: bool) {
        let n = self.tree.get(id);
        let raw = if n.compressed {
            None
        } else {
            Some(parent_offset + n.offset)
        };
        let is_capsule = n.kind == Kind::Capsule;
        let fixup = self.capsule_offset_fixup;
        self.tree.get_mut(id).absolute_offset = match raw {
            Some(o) if in_capsule => Some(o.saturating_sub(fixup)),
            o => o,
        };
        let children = self.tree.children(id).to_vec();
        for c in children {
            self.add_offsets(c, raw.unwrap_or(0), in_capsule || is_capsule);
        }
    }

    /// The VTF ends at 4GiB; map the BIOS subtree accordingly.
    fn add_memory_addresses(&mut self) {
        let (Some((vtf, _)), Some(bios)) = (self.last_vtf, self.bios) else {
            return;
        };
        let v = self.tree.get(vtf);
        let Some(vtf_offset) = v.absolute_offset else {
            return;
        };
        let end = (vtf_offset + v.size()) as u64;
        if end > 1 << 32 {
            self.msg(Some(vtf), "add_memory_addresses: VTF ends above 4GiB");
            return;
        }
        let diff = (1u64 << 32) - end;
        let Some(start) = self.tree.get(bios).absolute_offset else {
            return;
        };
        self.set_address(bios, start as u64 + diff);
    }

    fn set_address(&mut self, id: NodeId, address: u64) {
        if self.tree.get(id).compressed || address >= 1 << 32 {
            return;
        }
        self.tree.get_mut(id).address = Some(address);
        let children = self.tree.children(id).to_vec();
        for c in children {
            let o = self.tree.get(c).offset as u64;
            self.set_address(c, address + o);
        }
    }

    /// Record a file as a candidate for the volume top file.
    pub(crate) fn set_vtf_candidate(&mut self, id: NodeId, is_vtf: bool) {
        match self.last_vtf {
            Some((_, true)) if !is_vtf => {}
            _ => self.last_vtf = Some((id, is_vtf)),
        }
    }

    pub fn get_padding_type(&self, data: &[u8]) -> PaddingType {
        if !data.is_empty() && data.len() >= self.config.min_uniform_run {
            if data.iter().all(|&b| b == 0xff) {
                return PaddingType::FreeSpace;
            }
            if data.iter().all(|&b| b == 0x00) {
                return PaddingType::Empty;
            }
        }
        PaddingType::NonEmpty
    }

    /// Add a padding node of whatever kind `data` turns out to be.
    pub(crate) fn add_padding(&mut self, parent: NodeId, data: Buffer) -> NodeId {
        let t = self.get_padding_type(data.as_bytes());
        let name = match t {
            PaddingType::NonEmpty => "Non-UEFI data",
            _ => "Padding",
        };
        let info = vec![format!("Full size: {:x}h ({})", data.len(), data.len())];
        self.tree
            .add_child(parent, NodeSpec::new(Kind::Padding(t), name, data).info(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ffs::SectionType,
        guid,
        ifd::{RegionType, test_descriptor},
        testimg::{self, Volume},
        tree::{ImageType, VolumeType},
    };

    /// Reassemble a node from its header, children (or body) and tail.
    fn flatten(t: &Tree, id: NodeId, out: &mut Vec<u8>) {
        let n = t.get(id);
        let same: Vec<NodeId> = t
            .children(id)
            .iter()
            .copied()
            .filter(|c| t.get(*c).data.same_storage(&n.data))
            .collect();
        out.extend_from_slice(n.header().as_bytes());
        if same.is_empty() {
            out.extend_from_slice(n.body().as_bytes());
        } else {
            for c in same {
                flatten(t, c, out);
            }
        }
        out.extend_from_slice(n.tail().as_bytes());
    }

    fn dump(p: &FfsParser) -> String {
        format!("{:#}", p.tree())
    }

    fn named_file_volume() -> Vec<u8> {
        Volume::ffs2()
            .file(testimg::pad_file(8))
            .file(testimg::file(
                FileType::Driver,
                testimg::TEST_GUID,
                &testimg::ui_section("TestDriver"),
            ))
            .build()
    }

    /// A file and a section that both end off their alignment.
    fn gap_volume() -> Vec<u8> {
        let other = guid::Guid::new(
            0x8c8ce578,
            0x8a3d,
            0x4f1c,
            [0x99, 0x35, 0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3],
        );
        let mut body = testimg::ui_section("Test");
        body.resize(16, 0);
        body.extend_from_slice(&testimg::section(SectionType::Raw, &[], &[1, 2, 3, 4]));
        Volume::ffs2()
            .file(testimg::file(
                FileType::Driver,
                testimg::TEST_GUID,
                &testimg::ui_section("Test"),
            ))
            .file(testimg::file(FileType::Freeform, other, &body))
            .build()
    }

    #[test]
    fn named_file() {
        let img = named_file_volume();
        assert_eq!(img.len(), 154);
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        assert_eq!(t.get(image).kind, Kind::Image(ImageType::Uefi));
        let vol = t.children(image)[0];
        assert_eq!(
            t.get(vol).kind,
            Kind::Volume(VolumeType::Ffs(crate::ffs::FfsVersion::Ffs2))
        );
        let files = t.children(vol);
        assert_eq!(files.len(), 2);
        assert_eq!(t.get(files[0]).kind, Kind::File(FileType::Pad));
        let f = files[1];
        assert_eq!(t.get(f).text, "TestDriver");
        let s = t.children(f);
        assert_eq!(s.len(), 1);
        assert_eq!(t.get(s[0]).kind, Kind::Section(SectionType::UserInterface));
        assert_eq!(t.get(s[0]).text, "TestDriver");

        assert_eq!(p.last_vtf(), Some(f));
        assert_eq!(t.get(f).absolute_offset, Some(104));
        assert_eq!(t.get(s[0]).absolute_offset, Some(128));
        // the volume ends right at 4GiB
        assert_eq!(t.get(vol).address, Some(0x1_0000_0000 - 154));
        assert_eq!(t.get(f).address, Some(0x1_0000_0000 - 50));

        let mut out = Vec::new();
        flatten(t, t.root(), &mut out);
        assert_eq!(out, img);
    }

    #[test]
    fn idempotent() {
        let img = named_file_volume();
        let mut p = FfsParser::default();
        p.parse(&img);
        let first = (dump(&p), p.messages().to_vec());
        p.parse(&img);
        assert_eq!((dump(&p), p.messages().to_vec()), first);
    }

    #[test]
    fn crc32_mismatch() {
        let raw = testimg::section(SectionType::Raw, &[], &[1, 2, 3, 4]);
        let mut guided = testimg::crc32_section(&raw);
        // break the stored CRC
        guided[24] ^= 0xff;
        let img = Volume::ffs2()
            .file(testimg::file(FileType::Freeform, testimg::TEST_GUID, &guided))
            .build();
        assert_eq!(img.len(), 132);
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        let t = p.tree();
        let section = t
            .walk()
            .into_iter()
            .find(|id| t.get(*id).kind == Kind::Section(SectionType::GuidDefined))
            .unwrap();
        assert_eq!(p.messages().len(), 1, "{:?}", p.messages());
        assert_eq!(p.messages()[0].0, Some(section));
        // the payload is still there
        let inner = t.children(section);
        assert_eq!(inner.len(), 1);
        assert_eq!(t.get(inner[0]).kind, Kind::Section(SectionType::Raw));
        assert_eq!(t.get(inner[0]).body().as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn crc32_match_is_silent() {
        let raw = testimg::section(SectionType::Raw, &[], &[1, 2, 3, 4]);
        let img = Volume::ffs2()
            .file(testimg::file(
                FileType::Freeform,
                testimg::TEST_GUID,
                &testimg::crc32_section(&raw),
            ))
            .build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
    }

    #[test]
    fn alignment_gaps_are_covered() {
        let img = gap_volume();
        assert_eq!(img.len(), 160);
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let gaps: Vec<(Kind, usize)> = t
            .walk()
            .into_iter()
            .filter(|id| matches!(t.get(*id).kind, Kind::Padding(_)))
            .map(|id| (t.get(id).kind, t.get(id).size()))
            .collect();
        assert_eq!(
            gaps,
            vec![
                (Kind::Padding(PaddingType::FreeSpace), 2),
                (Kind::Padding(PaddingType::Empty), 2)
            ]
        );
        let mut out = Vec::new();
        flatten(t, t.root(), &mut out);
        assert_eq!(out, img);
    }

    #[test]
    fn truncation() {
        for img in [named_file_volume(), gap_volume()] {
            for cut in [72, 96, 104, 110, 112, 128, 132, 150] {
                let data = &img[..cut];
                let mut p = FfsParser::default();
                let status = p.parse(data);
                assert!(!matches!(status, ParseStatus::Fatal(_)), "cut at {cut}");
                assert!(!p.messages().is_empty(), "cut at {cut}");
                // everything up to the cut is still in the tree
                let mut out = Vec::new();
                flatten(p.tree(), p.tree().root(), &mut out);
                assert_eq!(out, data, "cut at {cut}");
            }
        }
    }

    #[test]
    fn empty_input() {
        let mut p = FfsParser::default();
        assert!(matches!(p.parse(&[]), ParseStatus::Fatal(_)));
        assert_eq!(p.tree().len(), 1);
        assert_eq!(p.last_vtf(), None);
    }

    #[test]
    fn no_signature() {
        let data = vec![0x5au8; 256];
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&data), ParseStatus::SignatureNotFound);
        let t = p.tree();
        let pads: Vec<NodeId> = t
            .walk()
            .into_iter()
            .filter(|id| matches!(t.get(*id).kind, Kind::Padding(_)))
            .collect();
        assert_eq!(pads.len(), 1);
        assert_eq!(t.get(pads[0]).kind, Kind::Padding(PaddingType::NonEmpty));
        assert_eq!(t.get(pads[0]).name, "Non-UEFI data");
        assert_eq!(p.messages().len(), 1);
        assert_eq!(p.last_vtf(), None);
    }

    #[test]
    fn padding_classification() {
        let p = FfsParser::new(ParserConfig {
            min_uniform_run: 4,
            ..Default::default()
        });
        assert_eq!(p.get_padding_type(&[0xff; 8]), PaddingType::FreeSpace);
        assert_eq!(p.get_padding_type(&[0x00; 8]), PaddingType::Empty);
        assert_eq!(p.get_padding_type(&[0xff, 0x00, 0xff, 0xff]), PaddingType::NonEmpty);
        // too short to count as uniform
        assert_eq!(p.get_padding_type(&[0xff; 3]), PaddingType::NonEmpty);
        assert_eq!(p.get_padding_type(&[]), PaddingType::NonEmpty);
    }

    #[test]
    fn padding_between_volumes() {
        let vol = named_file_volume();
        let mut img = vec![0xffu8; 16];
        img.extend_from_slice(&vol);
        img.extend_from_slice(&[0u8; 8]);
        img.extend_from_slice(&vol);
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        let kinds: Vec<Kind> = t.children(image).iter().map(|c| t.get(*c).kind).collect();
        let v = Kind::Volume(VolumeType::Ffs(crate::ffs::FfsVersion::Ffs2));
        assert_eq!(
            kinds,
            vec![
                Kind::Padding(PaddingType::FreeSpace),
                v,
                Kind::Padding(PaddingType::Empty),
                v
            ]
        );
        // the second volume holds the top file
        let second = t.children(image)[3];
        let vtf = p.last_vtf().unwrap();
        assert_eq!(t.parent(vtf), Some(second));
        let mut out = Vec::new();
        flatten(t, t.root(), &mut out);
        assert_eq!(out, img);
    }

    #[test]
    fn capsule_offset_fixup() {
        let vol = named_file_volume();
        let mut img = guid::EFI_CAPSULE.to_bytes().to_vec();
        img.extend_from_slice(&28u32.to_le_bytes());
        img.extend_from_slice(&0u32.to_le_bytes());
        img.extend_from_slice(&((28 + vol.len()) as u32).to_le_bytes());
        img.extend_from_slice(&vol);
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let capsule = t.children(t.root())[0];
        assert_eq!(t.get(capsule).kind, Kind::Capsule);
        assert_eq!(t.get(capsule).absolute_offset, Some(0));
        let image = t.children(capsule)[0];
        let vol = t.children(image)[0];
        assert_eq!(t.get(vol).absolute_offset, Some(0));
        let vtf = p.last_vtf().unwrap();
        assert_eq!(t.get(vtf).absolute_offset, Some(104));
    }

    #[test]
    fn intel_image() {
        let mut img = test_descriptor(&[
            (RegionType::Descriptor, Some((0, 0))),
            (RegionType::Bios, Some((1, 1))),
        ]);
        let mut bios = named_file_volume();
        bios.resize(0x1000, 0xff);
        img.extend_from_slice(&bios);
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        assert_eq!(t.get(image).kind, Kind::Image(ImageType::Intel));
        let regions: Vec<Kind> = t.children(image).iter().map(|c| t.get(*c).kind).collect();
        assert_eq!(
            regions,
            vec![
                Kind::Region(RegionType::Descriptor),
                Kind::Region(RegionType::Bios)
            ]
        );
        let bios = t.children(image)[1];
        assert_eq!(t.get(bios).absolute_offset, Some(0x1000));
        let vol = t.children(bios)[0];
        assert_eq!(t.get(vol).absolute_offset, Some(0x1000));
        // the VTF does not end the BIOS region here, free space follows
        let vtf = p.last_vtf().unwrap();
        assert_eq!(t.get(vtf).absolute_offset, Some(0x1000 + 104));
        assert_eq!(t.get(vtf).address, Some(0x1_0000_0000 - 50));
        assert_eq!(t.get(bios).address, Some(0x1_0000_0000 - 154));
        let mut out = Vec::new();
        flatten(t, t.root(), &mut out);
        assert_eq!(out, img);
    }

    #[test]
    fn top_file_only_from_bios_region() {
        let mut img = test_descriptor(&[
            (RegionType::Descriptor, Some((0, 0))),
            (RegionType::Bios, Some((1, 1))),
            (RegionType::Pdr, Some((2, 2))),
        ]);
        for _ in 0..2 {
            let mut v = named_file_volume();
            v.resize(0x1000, 0xff);
            img.extend_from_slice(&v);
        }
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        // the PDR volume comes last but must not move the anchor
        let vtf = p.last_vtf().unwrap();
        assert_eq!(t.get(vtf).absolute_offset, Some(0x1000 + 104));
        assert!(
            t.find_parent_of_kind(vtf, |k| *k == Kind::Region(RegionType::Bios))
                .is_some()
        );
        assert_eq!(t.get(vtf).address, Some(0x1_0000_0000 - 50));
    }

    #[test]
    fn region_outside_of_image() {
        let mut img = test_descriptor(&[
            (RegionType::Descriptor, Some((0, 0))),
            (RegionType::Bios, Some((1, 1))),
            (RegionType::Me, Some((2, 3))),
        ]);
        let mut bios = named_file_volume();
        bios.resize(0x1000, 0xff);
        img.extend_from_slice(&bios);
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::PartiallyParsed);
        assert_eq!(p.messages().len(), 1);
        assert!(p.messages()[0].1.contains("ME"));
    }
}
