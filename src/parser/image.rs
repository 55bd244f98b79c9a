//! Images and flash regions
use core::ops::Range;

use log::warn;

use crate::{
    EMPTY, ParseError,
    buffer::Buffer,
    ifd::{IFD, RegionType},
    region::{GBE_VERSION_OFFSET, GbeMac, GbeVersion, ME_SIGNATURES, MeVersion},
    tree::{ImageType, Kind, NodeId, NodeSpec},
};

use super::FfsParser;

impl FfsParser {
    /// A plain chain of volumes, with whatever lies around them.
    pub(crate) fn parse_uefi_image(&mut self, image: Buffer, parent: NodeId) -> Result<(), ParseError> {
        let info = vec![format!("Full size: {:x}h ({})", image.len(), image.len())];
        let spec = NodeSpec::new(Kind::Image(ImageType::Uefi), "UEFI image", image.clone()).info(info);
        let node = self.tree.add_child(parent, spec);
        self.bios = Some(node);
        match self.parse_raw_area(image.clone(), node) {
            Err(ParseError::VolumesNotFound) => {
                let p = self.add_padding(node, image);
                self.msg(Some(p), "parse_uefi_image: no volumes found");
                Err(ParseError::VolumesNotFound)
            }
            r => r,
        }
    }

    pub(crate) fn parse_intel_image(&mut self, image: Buffer, parent: NodeId) -> Result<(), ParseError> {
        let ifd = match IFD::parse(image.as_bytes()) {
            Ok(ifd) => ifd,
            Err(e) => {
                self.msg(Some(parent), format!("parse_intel_image: {e}"));
                return self.parse_uefi_image(image, parent);
            }
        };

        let l = image.len();
        let info = vec![
            format!("Full size: {l:x}h ({l})"),
            format!("Descriptor map: {}", ifd.header.flmap0),
        ];
        let spec = NodeSpec::new(Kind::Image(ImageType::Intel), "Intel image", image.clone()).info(info);
        let node = self.tree.add_child(parent, spec);

        let mut regions: Vec<(RegionType, Range<usize>)> = Vec::new();
        for (t, r) in ifd.used_regions() {
            if r.start >= l {
                warn!("{t} region {:08x}..{:08x} is outside of the image", r.start, r.end);
                self.msg(
                    Some(node),
                    format!(
                        "parse_intel_image: {t} region {:08x}..{:08x} is located outside of the image of size {l:08x}, skipped",
                        r.start, r.end
                    ),
                );
                continue;
            }
            if r.end > l {
                self.msg(
                    Some(node),
                    format!(
                        "parse_intel_image: {t} region {:08x}..{:08x} exceeds the image of size {l:08x}, truncated",
                        r.start, r.end
                    ),
                );
            }
            regions.push((t, r.start..r.end.min(l)));
        }
        regions.sort_by_key(|(_, r)| r.start);

        let mut prev_end = 0;
        for (t, r) in regions {
            if r.start < prev_end {
                warn!("{t} region overlaps with the previous one");
                self.msg(
                    Some(node),
                    format!(
                        "parse_intel_image: {t} region {:08x}..{:08x} overlaps with the previous region, skipped",
                        r.start, r.end
                    ),
                );
                continue;
            }
            if r.start > prev_end {
                self.add_padding(node, image.mid(prev_end, r.start - prev_end));
            }
            let data = image.mid(r.start, r.len());
            let result = match t {
                RegionType::Descriptor => {
                    let id = self.parse_general_region(t, data, node);
                    for line in ifd.regions.to_string().lines() {
                        self.tree.add_info(id, line.trim());
                    }
                    Ok(id)
                }
                RegionType::Gbe => self.parse_gbe_region(data, node),
                RegionType::Me => self.parse_me_region(data, node),
                RegionType::Bios | RegionType::Bios2 => self.parse_bios_region(t, data, node),
                RegionType::Pdr => self.parse_pdr_region(data, node),
                _ => Ok(self.parse_general_region(t, data, node)),
            };
            if let Err(e) = result {
                self.msg(Some(node), format!("parse_intel_image: {t} region: {e}"));
            }
            prev_end = r.end;
        }
        if prev_end < l {
            self.add_padding(node, image.tail(prev_end));
        }
        Ok(())
    }

    fn region_spec(t: RegionType, data: Buffer) -> NodeSpec {
        let info = vec![format!("Full size: {:x}h ({})", data.len(), data.len())];
        NodeSpec::new(Kind::Region(t), format!("{t} region"), data).info(info)
    }

    pub fn parse_general_region(&mut self, t: RegionType, data: Buffer, parent: NodeId) -> NodeId {
        self.tree.add_child(parent, Self::region_spec(t, data))
    }

    pub fn parse_gbe_region(&mut self, data: Buffer, parent: NodeId) -> Result<NodeId, ParseError> {
        let (Some(mac), Some(version)) = (
            data.read::<GbeMac>(0),
            data.read::<GbeVersion>(GBE_VERSION_OFFSET),
        ) else {
            return Err(ParseError::Truncated(format!(
                "GbE region of {:x}h bytes is too small",
                data.len()
            )));
        };
        let spec = Self::region_spec(RegionType::Gbe, data).text(mac.to_string());
        let id = self.tree.add_child(parent, spec);
        self.tree.add_info(id, format!("MAC: {mac}"));
        self.tree.add_info(id, format!("Version: {version}"));
        Ok(id)
    }

    pub fn parse_me_region(&mut self, data: Buffer, parent: NodeId) -> Result<NodeId, ParseError> {
        let empty = data.is_uniform(EMPTY);
        let found = ME_SIGNATURES
            .iter()
            .filter_map(|s| data.find(&s[..], 0))
            .min()
            .and_then(|o| data.read::<MeVersion>(o));
        let id = self.tree.add_child(parent, Self::region_spec(RegionType::Me, data));
        if empty {
            self.msg(Some(id), "parse_me_region: ME region is empty");
            return Ok(id);
        }
        match found {
            Some(v) => {
                self.tree.set_text(id, format!("ME {v}"));
                self.tree.add_info(id, format!("Version: {v}"));
            }
            None => self.msg(
                Some(id),
                "parse_me_region: version information not found, the region may be damaged",
            ),
        }
        Ok(id)
    }

    pub fn parse_bios_region(
        &mut self,
        t: RegionType,
        data: Buffer,
        parent: NodeId,
    ) -> Result<NodeId, ParseError> {
        let id = self.tree.add_child(parent, Self::region_spec(t, data.clone()));
        // Only the first BIOS region is mapped below 4GiB.
        if t == RegionType::Bios {
            self.bios = Some(id);
        }
        if let Err(e) = self.parse_raw_area(data, id) {
            self.msg(Some(id), format!("parse_bios_region: {e}"));
        }
        Ok(id)
    }

    pub fn parse_pdr_region(&mut self, data: Buffer, parent: NodeId) -> Result<NodeId, ParseError> {
        let id = self.tree.add_child(parent, Self::region_spec(RegionType::Pdr, data.clone()));
        // Volumes are optional in PDR.
        match self.parse_raw_area(data, id) {
            Ok(()) | Err(ParseError::VolumesNotFound) => Ok(id),
            Err(e) => Err(e),
        }
    }
}
