//! Sections
//!
//! Headers are decoded in two modes. A preparse only works out the layout
//! and leaves the tree alone, which is how decompressed candidates are told
//! apart and how a section list is checked before nodes are created for it.
//! Bodies are decoded in the second pass.
use zerocopy::FromBytes;

use crate::{
    ParseError,
    buffer::Buffer,
    decompress::{Algorithm, DecompressError, decompress},
    depex,
    ffs::{
        CommonSectionHeader, CompressionSectionHeader, CompressionType, FfsVersion,
        FreeformSubtypeGuidSectionHeader, GuidDefinedSectionHeader, PostcodeSectionHeader,
        SECTION_HEADER_SIZE, SECTION_HEADER2_SIZE, SECTION_SIZE_EXTENDED, SectionType,
        VersionSectionHeader, WIN_CERT_TYPE_EFI_GUID, WinCertificate, align4,
    },
    guid::{Guid, GuidStrategy, guided_section_strategy},
    pe,
    tree::{Kind, NodeId, NodeSpec, PaddingType, ParsingData, SectionHeaderData},
};

use super::{FfsParser, file::is_apriori};

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
/// Longest UI name in UTF-16 code units
const MAX_UI_NAME: usize = 0x400;

/// Size of the section at `offset`, or 0 if its header does not fit.
pub fn get_section_size(file: &[u8], offset: usize, version: FfsVersion) -> usize {
    let Some(Ok((h, _))) = file.get(offset..).map(CommonSectionHeader::read_from_prefix) else {
        return 0;
    };
    let size = h.size();
    if version == FfsVersion::Ffs3 && size == SECTION_SIZE_EXTENDED {
        let Some(Ok((s, _))) = file.get(offset + SECTION_HEADER_SIZE..).map(u32::read_from_prefix)
        else {
            return 0;
        };
        return s as usize;
    }
    size as usize
}

/// Layout and annotations found by a header decoder
struct SectionHeader {
    header_size: usize,
    data: SectionHeaderData,
    name: String,
    text: String,
    info: Vec<String>,
    problems: Vec<String>,
}

impl SectionHeader {
    fn new(t: SectionType, header_size: usize, data: SectionHeaderData) -> Self {
        Self {
            header_size,
            data,
            name: t.to_string(),
            text: String::new(),
            info: Vec::new(),
            problems: Vec::new(),
        }
    }
}

fn common_header_size(section: &Buffer, version: FfsVersion) -> Result<usize, ParseError> {
    let l = section.len();
    let h: CommonSectionHeader = section.read(0).ok_or_else(|| {
        ParseError::Truncated(format!("section header does not fit in {l:x}h bytes"))
    })?;
    let size = if version == FfsVersion::Ffs3 && h.size() == SECTION_SIZE_EXTENDED {
        SECTION_HEADER2_SIZE
    } else {
        SECTION_HEADER_SIZE
    };
    if size > l {
        return Err(ParseError::Truncated(format!(
            "section header of {size:x}h bytes does not fit in {l:x}h bytes"
        )));
    }
    Ok(size)
}

/// Read the type specific header following the common one.
fn read_after_common<T: FromBytes>(
    section: &Buffer,
    version: FfsVersion,
    what: &str,
) -> Result<(usize, T), ParseError> {
    let common = common_header_size(section, version)?;
    let h = section.read::<T>(common).ok_or_else(|| {
        ParseError::Truncated(format!(
            "{what} section header does not fit in {:x}h bytes",
            section.len()
        ))
    })?;
    Ok((common + size_of::<T>(), h))
}

fn parse_common_section_header(
    section: &Buffer,
    t: SectionType,
    version: FfsVersion,
) -> Result<SectionHeader, ParseError> {
    let size = common_header_size(section, version)?;
    Ok(SectionHeader::new(t, size, SectionHeaderData::Common))
}

fn parse_compressed_section_header(
    section: &Buffer,
    version: FfsVersion,
) -> Result<SectionHeader, ParseError> {
    let (size, h) = read_after_common::<CompressionSectionHeader>(section, version, "compressed")?;
    let uncompressed_length = h.uncompressed_length;
    let compression_type = h.compression_type;
    let t = CompressionType::from(compression_type);
    let mut s = SectionHeader::new(
        SectionType::Compression,
        size,
        SectionHeaderData::Compressed {
            compression_type,
            uncompressed_length,
        },
    );
    s.info = vec![
        format!("Compression type: {compression_type:02x}h ({t})"),
        format!("Decompressed size: {uncompressed_length:x}h ({uncompressed_length})"),
    ];
    Ok(s)
}

fn parse_guided_section_header(
    section: &Buffer,
    version: FfsVersion,
) -> Result<SectionHeader, ParseError> {
    let (min, h) = read_after_common::<GuidDefinedSectionHeader>(section, version, "GUID-defined")?;
    let data_offset = h.data_offset;
    let attributes = h.attributes;
    let mut problems = Vec::new();
    let offset = data_offset as usize;
    let size = if offset < min || offset > section.len() {
        problems.push(format!(
            "parse_guided_section_header: data offset {offset:x}h is invalid"
        ));
        min
    } else {
        offset
    };
    let mut s = SectionHeader::new(
        SectionType::GuidDefined,
        size,
        SectionHeaderData::Guided {
            guid: h.guid,
            data_offset,
            processing_required: attributes.processing_required(),
            auth_status_valid: attributes.auth_status_valid(),
        },
    );
    s.name = h.guid.name();
    s.info = vec![
        format!("Section GUID: {}", h.guid),
        format!("Data offset: {data_offset:x}h"),
        format!("Attributes: {:04x}h", attributes.into_bits()),
    ];
    s.problems = problems;
    Ok(s)
}

fn parse_freeform_guided_section_header(
    section: &Buffer,
    version: FfsVersion,
) -> Result<SectionHeader, ParseError> {
    let (size, h) =
        read_after_common::<FreeformSubtypeGuidSectionHeader>(section, version, "freeform")?;
    let guid = h.sub_type_guid;
    let mut s = SectionHeader::new(
        SectionType::FreeformSubtypeGuid,
        size,
        SectionHeaderData::Freeform { guid },
    );
    s.text = guid.name();
    s.info = vec![format!("Subtype GUID: {guid}")];
    Ok(s)
}

fn parse_version_section_header(
    section: &Buffer,
    version: FfsVersion,
) -> Result<SectionHeader, ParseError> {
    let (size, h) = read_after_common::<VersionSectionHeader>(section, version, "version")?;
    let build_number = h.build_number;
    let mut s = SectionHeader::new(
        SectionType::Version,
        size,
        SectionHeaderData::Version { build_number },
    );
    s.info = vec![format!("Build number: {build_number}")];
    Ok(s)
}

fn parse_postcode_section_header(
    section: &Buffer,
    t: SectionType,
    version: FfsVersion,
) -> Result<SectionHeader, ParseError> {
    let (size, h) = read_after_common::<PostcodeSectionHeader>(section, version, "postcode")?;
    let postcode = h.postcode;
    let mut s = SectionHeader::new(t, size, SectionHeaderData::Postcode { postcode });
    s.info = vec![format!("Postcode: {postcode:x}h")];
    Ok(s)
}

/// Check that `sections` is a well-formed section list, without creating
/// any nodes.
pub(crate) fn preparse_sections(sections: &Buffer, version: FfsVersion) -> Result<(), ParseError> {
    let bytes = sections.as_bytes();
    let l = bytes.len();
    let mut offset = 0;
    while offset < l {
        let size = get_section_size(bytes, offset, version);
        if size < SECTION_HEADER_SIZE || size > l - offset {
            return Err(ParseError::InvalidSection(format!(
                "section at {offset:x}h has invalid size {size:x}h"
            )));
        }
        section_header(&sections.mid(offset, size), version)?;
        offset = align4(offset + size);
    }
    Ok(())
}

fn section_header(
    section: &Buffer,
    version: FfsVersion,
) -> Result<(SectionType, SectionHeader), ParseError> {
    let l = section.len();
    let h: CommonSectionHeader = section.read(0).ok_or_else(|| {
        ParseError::Truncated(format!("section header does not fit in {l:x}h bytes"))
    })?;
    let t = SectionType::from(h.section_type);
    let header = match t {
        SectionType::Compression => parse_compressed_section_header(section, version)?,
        SectionType::GuidDefined => parse_guided_section_header(section, version)?,
        SectionType::FreeformSubtypeGuid => parse_freeform_guided_section_header(section, version)?,
        SectionType::Version => parse_version_section_header(section, version)?,
        SectionType::InsydePostcode | SectionType::SctPostcode => {
            parse_postcode_section_header(section, t, version)?
        }
        _ => parse_common_section_header(section, t, version)?,
    };
    Ok((t, header))
}

/// UTF-16LE string up to the first NUL, its length in code units, and
/// whether the data had an odd number of bytes.
fn utf16_string(data: &[u8]) -> (String, usize, bool) {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    (String::from_utf16_lossy(&units), units.len(), data.len() % 2 != 0)
}

impl FfsParser {
    pub fn parse_sections(
        &mut self,
        sections: &Buffer,
        parent: NodeId,
        version: FfsVersion,
        preparse: bool,
    ) -> Result<(), ParseError> {
        if preparse {
            return preparse_sections(sections, version);
        }
        if let Err(e) = preparse_sections(sections, version) {
            log::debug!("parse_sections: {e}, decoding as far as possible");
        }

        let bytes = sections.as_bytes();
        let l = bytes.len();
        let mut offset = 0;
        while offset < l {
            let size = get_section_size(bytes, offset, version);
            if size < SECTION_HEADER_SIZE || size > l - offset {
                let p = self.add_padding(parent, sections.tail(offset));
                self.msg(Some(p), "parse_sections: non-UEFI data found in sections area");
                break;
            }
            let section = sections.mid(offset, size);
            if let Err(e) = self.parse_section_header(&section, parent, version, false) {
                let p = self.add_padding(parent, section);
                self.msg(Some(p), format!("parse_sections: {e}"));
            }
            let end = offset + size;
            offset = align4(end);
            if end < l {
                self.add_padding(parent, sections.mid(end, offset.min(l) - end));
            }
        }
        Ok(())
    }

    /// Decode a section header; creates a node unless `preparse` is set.
    pub fn parse_section_header(
        &mut self,
        section: &Buffer,
        parent: NodeId,
        version: FfsVersion,
        preparse: bool,
    ) -> Result<Option<NodeId>, ParseError> {
        let (t, h) = section_header(section, version)?;
        if preparse {
            return Ok(None);
        }

        let l = section.len();
        let header_size = h.header_size;
        let body_size = l - header_size;
        let mut info = vec![
            format!("Type: {:02x}h", u8::from(t)),
            format!("Full size: {l:x}h ({l})"),
            format!("Header size: {header_size:x}h ({header_size})"),
            format!("Body size: {body_size:x}h ({body_size})"),
        ];
        info.extend(h.info);
        let spec = NodeSpec::new(Kind::Section(t), h.name, section.clone())
            .header(header_size)
            .text(h.text)
            .info(info)
            .parsing(ParsingData::Section {
                ffs_version: version,
                header: h.data,
            });
        let id = self.tree.add_child(parent, spec);
        if let SectionType::Unknown(b) = t {
            self.msg(
                Some(id),
                format!("parse_section_header: unknown section type {b:02x}h"),
            );
        }
        for p in h.problems {
            self.msg(Some(id), p);
        }
        Ok(Some(id))
    }

    pub(crate) fn parse_section_body(&mut self, id: NodeId) {
        let n = self.tree.get(id);
        let (Kind::Section(t), ParsingData::Section { ffs_version, header }) = (n.kind, &n.parsing)
        else {
            return;
        };
        let (version, header) = (*ffs_version, *header);
        match (t, header) {
            (
                SectionType::Compression,
                SectionHeaderData::Compressed {
                    compression_type,
                    uncompressed_length,
                },
            ) => self.parse_compressed_section_body(id, version, compression_type, uncompressed_length),
            (SectionType::GuidDefined, SectionHeaderData::Guided { guid, .. }) => {
                self.parse_guided_section_body(id, version, guid)
            }
            (SectionType::Version, _) => self.parse_version_section_body(id),
            (SectionType::DxeDepex | SectionType::PeiDepex | SectionType::MmDepex, _) => {
                self.parse_depex_section_body(id)
            }
            (SectionType::UserInterface, _) => self.parse_ui_section_body(id),
            (SectionType::Raw, _) => self.parse_raw_section_body(id),
            (SectionType::Pe32 | SectionType::Pic, _) => self.parse_pe_image_section_body(id),
            (SectionType::Te, _) => self.parse_te_image_section_body(id),
            (SectionType::VolumeImage, _) => self.parse_volume_image_section_body(id),
            _ => {}
        }
    }

    /// Decode sections from a decompressed payload below `id`.
    fn graft_sections(&mut self, id: NodeId, data: Buffer, version: FfsVersion) {
        if let Err(e) = self.parse_sections(&data, id, version, false) {
            self.msg(Some(id), format!("graft_sections: {e}"));
        }
    }

    /// EFI 1.1 and Tiano streams look alike; prefer whichever output is a
    /// valid section list.
    fn decompress_standard(
        &self,
        src: &[u8],
        version: FfsVersion,
    ) -> Result<(Buffer, Algorithm), DecompressError> {
        let max = self.config.max_decompressed_size;
        let efi = decompress(src, Algorithm::Efi, max).map(Buffer::new);
        if let Ok(b) = &efi
            && preparse_sections(b, version).is_ok()
        {
            return Ok((b.clone(), Algorithm::Efi));
        }
        let tiano = decompress(src, Algorithm::Tiano, max).map(Buffer::new);
        match (efi, tiano) {
            (_, Ok(t)) if preparse_sections(&t, version).is_ok() => Ok((t, Algorithm::Tiano)),
            (Ok(e), _) => Ok((e, Algorithm::Efi)),
            (_, Ok(t)) => Ok((t, Algorithm::Tiano)),
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn decompress_with(&self, src: &[u8], algorithm: Algorithm) -> Result<(Buffer, Algorithm), DecompressError> {
        let out = decompress(src, algorithm, self.config.max_decompressed_size)?;
        Ok((Buffer::new(out), algorithm))
    }

    pub fn parse_compressed_section_body(
        &mut self,
        id: NodeId,
        version: FfsVersion,
        compression_type: u8,
        uncompressed_length: u32,
    ) {
        if !self.check_depth(id) {
            return;
        }
        let body = self.tree.get(id).body();
        let result = match CompressionType::from(compression_type) {
            CompressionType::NotCompressed => {
                if let Err(e) = self.parse_sections(&body, id, version, false) {
                    self.msg(Some(id), format!("parse_compressed_section_body: {e}"));
                }
                return;
            }
            CompressionType::Standard => self.decompress_standard(body.as_bytes(), version),
            CompressionType::Customized => self.decompress_with(body.as_bytes(), Algorithm::Lzma),
            CompressionType::Unknown(t) => {
                self.msg(
                    Some(id),
                    format!("parse_compressed_section_body: unknown compression type {t:02x}h, body kept as raw data"),
                );
                return;
            }
        };
        match result {
            Ok((data, algorithm)) => {
                self.tree.add_info(id, format!("Compression algorithm: {algorithm}"));
                let l = data.len();
                if l != uncompressed_length as usize {
                    self.msg(
                        Some(id),
                        format!(
                            "parse_compressed_section_body: decompressed size {l:x}h differs from {uncompressed_length:x}h given in the header"
                        ),
                    );
                }
                self.graft_sections(id, data, version);
            }
            Err(e) => self.msg(
                Some(id),
                format!("parse_compressed_section_body: decompression failed, {e}; body kept as raw data"),
            ),
        }
    }

    pub fn parse_guided_section_body(&mut self, id: NodeId, version: FfsVersion, guid: Guid) {
        if !self.check_depth(id) {
            return;
        }
        let body = self.tree.get(id).body();
        let result = match guided_section_strategy(&guid) {
            Some(GuidStrategy::Tiano) => self.decompress_standard(body.as_bytes(), version),
            Some(GuidStrategy::Lzma) => self.decompress_with(body.as_bytes(), Algorithm::Lzma),
            Some(GuidStrategy::LzmaF86) => self.decompress_with(body.as_bytes(), Algorithm::LzmaF86),
            Some(GuidStrategy::Crc32) => {
                self.check_crc32(id, version);
                if let Err(e) = self.parse_sections(&body, id, version, false) {
                    self.msg(Some(id), format!("parse_guided_section_body: {e}"));
                }
                return;
            }
            Some(GuidStrategy::Signed) => {
                self.parse_signed_section_body(id, version);
                return;
            }
            Some(GuidStrategy::Unsupported(scheme)) => {
                self.msg(
                    Some(id),
                    format!("parse_guided_section_body: {scheme} compression is not supported, body kept as raw data"),
                );
                return;
            }
            None => {
                self.msg(
                    Some(id),
                    format!("parse_guided_section_body: unknown GUID-defined section {guid}, body kept as raw data"),
                );
                return;
            }
        };
        match result {
            Ok((data, algorithm)) => {
                self.tree.add_info(id, format!("Compression algorithm: {algorithm}"));
                self.graft_sections(id, data, version);
            }
            Err(e) => self.msg(
                Some(id),
                format!("parse_guided_section_body: decompression failed, {e}; body kept as raw data"),
            ),
        }
    }

    fn check_crc32(&mut self, id: NodeId, version: FfsVersion) {
        let n = self.tree.get(id);
        let body = n.body();
        // The CRC follows the GUID-defined section header.
        let stored = common_header_size(&n.data, version)
            .ok()
            .and_then(|c| n.data.read::<u32>(c + size_of::<GuidDefinedSectionHeader>()));
        let calculated = CRC32.checksum(body.as_bytes());
        match stored {
            Some(crc) if crc == calculated => {
                self.tree.add_info(id, format!("CRC32: {crc:08x}h, valid"));
            }
            Some(crc) => {
                self.tree.add_info(id, format!("CRC32: {crc:08x}h, invalid"));
                self.msg(
                    Some(id),
                    format!("parse_guided_section_body: CRC32 {crc:08x}h is invalid, should be {calculated:08x}h"),
                );
            }
            None => self.msg(Some(id), "parse_guided_section_body: CRC32 does not fit in the header"),
        }
    }

    fn parse_signed_section_body(&mut self, id: NodeId, version: FfsVersion) {
        let body = self.tree.get(id).body();
        let Some(cert) = body.read::<WinCertificate>(0) else {
            self.msg(Some(id), "parse_signed_section_body: certificate does not fit");
            return;
        };
        let len = cert.length as usize;
        if len < size_of::<WinCertificate>() || len > body.len() {
            self.msg(
                Some(id),
                format!("parse_signed_section_body: invalid certificate length {len:x}h"),
            );
            return;
        }
        let t = cert.certificate_type;
        let info = vec![format!("Certificate type: {t:04x}h, length {len:x}h")];
        let kind = Kind::Padding(PaddingType::NonEmpty);
        let spec = NodeSpec::new(kind, "Certificate", body.mid(0, len)).info(info);
        self.tree.add_child(id, spec);
        if t != WIN_CERT_TYPE_EFI_GUID {
            self.msg(
                Some(id),
                format!("parse_signed_section_body: unexpected certificate type {t:04x}h"),
            );
        }
        if let Err(e) = self.parse_sections(&body.tail(len), id, version, false) {
            self.msg(Some(id), format!("parse_signed_section_body: {e}"));
        }
    }

    pub fn parse_version_section_body(&mut self, id: NodeId) {
        let body = self.tree.get(id).body();
        let (version, _, odd) = utf16_string(body.as_bytes());
        self.tree.add_info(id, format!("Version string: {version}"));
        if odd {
            self.msg(
                Some(id),
                format!("parse_version_section_body: odd string length {:x}h", body.len()),
            );
        }
    }

    pub fn parse_depex_section_body(&mut self, id: NodeId) {
        let body = self.tree.get(id).body();
        let e = depex::parse(body.as_bytes());
        self.tree.add_info(id, format!("Parsed expression: {}", e.text));
        for p in e.problems {
            self.msg(Some(id), format!("parse_depex_section_body: {p}"));
        }
    }

    pub fn parse_ui_section_body(&mut self, id: NodeId) {
        let body = self.tree.get(id).body();
        let (name, units, odd) = utf16_string(body.as_bytes());
        if units == 0 {
            self.msg(Some(id), "parse_ui_section_body: empty name");
        } else if units > MAX_UI_NAME {
            self.msg(
                Some(id),
                format!("parse_ui_section_body: name of {units} characters is too long"),
            );
        }
        if odd {
            self.msg(
                Some(id),
                format!("parse_ui_section_body: odd name length {:x}h", body.len()),
            );
        }
        self.tree.set_text(id, name.clone());
        if let Some(f) = self
            .tree
            .find_parent_of_kind(id, |k| matches!(k, Kind::File(_)))
        {
            self.tree.set_text(f, name);
        }
    }

    pub fn parse_raw_section_body(&mut self, id: NodeId) {
        let body = self.tree.get(id).body();
        let file = self
            .tree
            .find_parent_of_kind(id, |k| matches!(k, Kind::File(_)));
        if let Some(f) = file
            && let ParsingData::File { guid, .. } = self.tree.get(f).parsing
            && is_apriori(&guid)
        {
            self.parse_apriori_raw_section(&body, id);
            return;
        }
        // Volumes may hide in raw sections; most raw sections hold none.
        if self.tree.depth(id) < self.config.max_depth {
            match self.parse_raw_area(body, id) {
                Ok(()) | Err(ParseError::VolumesNotFound) => {}
                Err(e) => self.msg(Some(id), format!("parse_raw_section_body: {e}")),
            }
        }
    }

    pub fn parse_pe_image_section_body(&mut self, id: NodeId) {
        let body = self.tree.get(id).body();
        match pe::summarize_pe(body.as_bytes()) {
            Ok(s) => {
                for i in s.info() {
                    self.tree.add_info(id, i);
                }
            }
            Err(e) => self.msg(Some(id), format!("parse_pe_image_section_body: {e}")),
        }
    }

    pub fn parse_te_image_section_body(&mut self, id: NodeId) {
        let body = self.tree.get(id).body();
        match pe::summarize_te(body.as_bytes()) {
            Ok(s) => {
                for i in s.info() {
                    self.tree.add_info(id, i);
                }
            }
            Err(e) => self.msg(Some(id), format!("parse_te_image_section_body: {e}")),
        }
    }

    pub fn parse_volume_image_section_body(&mut self, id: NodeId) {
        if !self.check_depth(id) {
            return;
        }
        let body = self.tree.get(id).body();
        if let Err(e) = self.parse_raw_area(body, id) {
            self.msg(Some(id), format!("parse_volume_image_section_body: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ParseStatus, ParserConfig,
        depex::Opcode,
        ffs::FileType,
        guid,
        testimg::{self, Volume},
        tree::PaddingType,
    };

    fn parse_file_body(body: &[u8]) -> (FfsParser, ParseStatus, NodeId) {
        parse_file_body_with(FfsParser::default(), body)
    }

    fn parse_file_body_with(mut p: FfsParser, body: &[u8]) -> (FfsParser, ParseStatus, NodeId) {
        let img = Volume::ffs2()
            .file(testimg::file(FileType::Freeform, testimg::TEST_GUID, body))
            .build();
        let status = p.parse(&img);
        let t = p.tree();
        let image = t.children(t.root())[0];
        let v = t.children(image)[0];
        let f = t.children(v)[0];
        (p, status, f)
    }

    #[test]
    fn extended_section_size() {
        let mut h = vec![0xff, 0xff, 0xff, 0x19];
        h.extend_from_slice(&0x20u32.to_le_bytes());
        assert_eq!(get_section_size(&h, 0, FfsVersion::Ffs3), 0x20);
        assert_eq!(get_section_size(&h, 0, FfsVersion::Ffs2), 0xff_ffff);
        assert_eq!(get_section_size(&h[..6], 0, FfsVersion::Ffs3), 0);
        assert_eq!(get_section_size(&h, 6, FfsVersion::Ffs2), 0);
    }

    #[test]
    fn lzma_compressed_section() {
        let ui = testimg::ui_section("Compressed");
        let mut packed = Vec::new();
        lzma_rs::lzma_compress(&mut &ui[..], &mut packed).unwrap();
        let s = testimg::compressed_section(0x02, ui.len() as u32, &packed);
        let (p, status, f) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        assert_eq!(t.get(f).text, "Compressed");
        let c = t.children(f)[0];
        assert_eq!(t.get(c).kind, Kind::Section(SectionType::Compression));
        assert!(t.get(c).absolute_offset.is_some());
        let inner = t.children(c)[0];
        assert_eq!(t.get(inner).kind, Kind::Section(SectionType::UserInterface));
        assert!(t.get(inner).compressed);
        assert_eq!(t.get(inner).absolute_offset, None);
        assert_eq!(t.get(inner).address, None);
        assert_eq!(t.get(inner).data.as_bytes(), &ui[..]);
    }

    #[test]
    fn lzma_guided_section() {
        let raw = testimg::section(SectionType::Raw, &[], b"payload!");
        let mut packed = Vec::new();
        lzma_rs::lzma_compress(&mut &raw[..], &mut packed).unwrap();
        let s = testimg::guided_section(guid::LZMA_SECTION, 0x01, &packed);
        let (p, status, f) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let g = t.children(f)[0];
        assert_eq!(t.get(g).name, "LzmaCompress");
        let inner = t.children(g)[0];
        assert_eq!(t.get(inner).body().as_bytes(), b"payload!");
    }

    #[test]
    fn size_mismatch_after_decompression() {
        let ui = testimg::ui_section("X");
        let mut packed = Vec::new();
        lzma_rs::lzma_compress(&mut &ui[..], &mut packed).unwrap();
        let s = testimg::compressed_section(0x02, 0x1234, &packed);
        let (p, status, _) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        assert_eq!(p.messages().len(), 1);
        assert!(p.messages()[0].1.contains("differs from 1234h"));
    }

    #[test]
    fn corrupt_compressed_data() {
        let s = testimg::compressed_section(0x02, 0x10, &[0x5d, 0, 0, 0x80, 0, 0xff, 0xff]);
        let (p, status, f) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        let t = p.tree();
        let c = t.children(f)[0];
        assert!(t.children(c).is_empty());
        assert_eq!(p.messages()[0].0, Some(c));
    }

    #[test]
    fn uncompressed_compression_section() {
        let inner = testimg::ui_section("Plain");
        let s = testimg::compressed_section(0x00, inner.len() as u32, &inner);
        let (p, status, f) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let c = t.children(f)[0];
        let ui = t.children(c)[0];
        assert!(!t.get(ui).compressed);
        // file at 72, section headers 24 + 9
        assert_eq!(t.get(ui).absolute_offset, Some(72 + 24 + 9));
        assert_eq!(t.get(f).text, "Plain");
    }

    #[test]
    fn unknown_guided_section() {
        let s = testimg::guided_section(testimg::TEST_GUID, 0x01, &[1, 2, 3, 4]);
        let (p, status, f) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        assert_eq!(p.messages().len(), 1);
        assert!(p.messages()[0].1.contains("unknown GUID-defined section"));
        let t = p.tree();
        let g = t.children(f)[0];
        assert!(t.children(g).is_empty());
        assert_eq!(t.get(g).body().as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn brotli_is_known_but_unsupported() {
        let s = testimg::guided_section(guid::BROTLI_SECTION, 0x01, &[0; 8]);
        let (p, _, _) = parse_file_body(&s);
        assert_eq!(p.messages().len(), 1);
        assert!(p.messages()[0].1.contains("Brotli"));
    }

    #[test]
    fn version_and_depex() {
        let mut body = testimg::section(SectionType::Version, &7u16.to_le_bytes(), &testimg::utf16("1.0"));
        body.resize(crate::ffs::align4(body.len()), 0);
        body.extend_from_slice(&testimg::section(
            SectionType::DxeDepex,
            &[],
            &[Opcode::True as u8, Opcode::End as u8],
        ));
        let (p, status, f) = parse_file_body(&body);
        assert_eq!(status, ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let s = t.children(f);
        assert_eq!(s.len(), 2);
        let v = &t.get(s[0]).info;
        assert!(v.contains(&"Build number: 7".to_string()));
        assert!(v.contains(&"Version string: 1.0".to_string()));
        assert!(t.get(s[1]).info.contains(&"Parsed expression: TRUE".to_string()));
    }

    #[test]
    fn bad_depex_and_unknown_type() {
        let mut body = testimg::section(SectionType::PeiDepex, &[], &[0x42, 0x08, 0x00, 0x00]);
        body.extend_from_slice(&testimg::section(SectionType::Unknown(0x42), &[], &[0; 4]));
        let (p, status, f) = parse_file_body(&body);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        let t = p.tree();
        let s = t.children(f);
        assert_eq!(p.messages().len(), 2, "{:?}", p.messages());
        assert_eq!(p.messages()[0].0, Some(s[1]));
        assert!(p.messages()[0].1.contains("unknown section type 42h"));
        assert_eq!(p.messages()[1].0, Some(s[0]));
        assert!(p.messages()[1].1.contains("unknown opcode 42"));
    }

    #[test]
    fn empty_ui_name() {
        let s = testimg::section(SectionType::UserInterface, &[], &[0, 0]);
        let (p, status, _) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        assert!(p.messages()[0].1.contains("empty name"));
    }

    #[test]
    fn garbage_after_sections() {
        let mut body = testimg::section(SectionType::Raw, &[], &[0; 4]);
        body.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let (p, status, f) = parse_file_body(&body);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        let t = p.tree();
        let s = t.children(f);
        assert_eq!(s.len(), 2);
        assert_eq!(t.get(s[1]).kind, Kind::Padding(PaddingType::NonEmpty));
        assert_eq!(t.get(s[1]).size(), 6);
    }

    #[test]
    fn signed_section_keeps_certificate() {
        let mut cert = 24u32.to_le_bytes().to_vec();
        cert.extend_from_slice(&0x0200u16.to_le_bytes());
        cert.extend_from_slice(&crate::ffs::WIN_CERT_TYPE_EFI_GUID.to_le_bytes());
        cert.extend_from_slice(&[0x5a; 16]);
        cert.extend_from_slice(&testimg::section(SectionType::Raw, &[], &[1, 2, 3, 4]));
        let s = testimg::guided_section(guid::SIGNED_SECTION, 0x01, &cert);
        let (p, status, f) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let signed = t.children(f)[0];
        let c = t.children(signed);
        assert_eq!(c.len(), 2);
        assert_eq!(t.get(c[0]).name, "Certificate");
        assert_eq!(t.get(c[0]).size(), 24);
        assert_eq!(t.get(c[1]).kind, Kind::Section(SectionType::Raw));
    }

    #[test]
    fn broken_volume_in_raw_section() {
        let mut inner = Volume::ffs2().file(testimg::pad_file(8)).build();
        inner[50] ^= 0x01;
        let s = testimg::section(SectionType::Raw, &[], &inner);
        let (p, status, f) = parse_file_body(&s);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        let t = p.tree();
        let raw = t.children(f)[0];
        let nested = t.children(raw)[0];
        assert!(matches!(t.get(nested).kind, Kind::Volume(_)));
        assert_eq!(p.messages().len(), 1, "{:?}", p.messages());
        assert_eq!(p.messages()[0].0, Some(nested));
        assert!(p.messages()[0].1.contains("checksum"));
    }

    #[test]
    fn volume_image_section() {
        let inner = Volume::ffs2()
            .file(testimg::file(
                FileType::Driver,
                testimg::TEST_GUID,
                &testimg::ui_section("Inner"),
            ))
            .build();
        let s = testimg::section(SectionType::VolumeImage, &[], &inner);
        let img = Volume::ffs2()
            .file(testimg::file(FileType::VolumeImage, testimg::TEST_GUID, &s))
            .build();
        let mut p = FfsParser::default();
        assert_eq!(p.parse(&img), ParseStatus::Success, "{:?}", p.messages());
        let t = p.tree();
        let image = t.children(t.root())[0];
        let outer = t.children(image)[0];
        let file = t.children(outer)[0];
        let section = t.children(file)[0];
        let nested = t.children(section)[0];
        assert!(matches!(t.get(nested).kind, Kind::Volume(_)));
        assert_eq!(t.get(nested).absolute_offset, Some(72 + 24 + 4));
        let inner_file = t.children(nested)[0];
        assert_eq!(t.get(inner_file).text, "Inner");
        // nested files are no top file candidates
        assert_eq!(p.last_vtf(), Some(file));
    }

    #[test]
    fn depth_limit() {
        let ui = testimg::ui_section("Deep");
        let s = testimg::compressed_section(0x00, ui.len() as u32, &ui);
        let p = FfsParser::new(ParserConfig {
            max_depth: 4,
            ..Default::default()
        });
        let (p, status, f) = parse_file_body_with(p, &s);
        assert_eq!(status, ParseStatus::PartiallyParsed);
        assert!(p.messages()[0].1.contains("maximum nesting depth"));
        let t = p.tree();
        assert!(t.children(t.children(f)[0]).is_empty());
    }
}
