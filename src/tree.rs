//! Structural tree of a decoded image
//!
//! Nodes live in an arena and are referred to by [`NodeId`] handles, which
//! stay valid for the lifetime of the tree. Each node covers a header, a
//! body and a tail within its [`Buffer`]; children cover (parts of) the body.

use core::fmt::{self, Display};

use strum::Display as StrDisplay;

use crate::{
    buffer::Buffer,
    ffs::{FfsVersion, FileType, SectionType},
    guid::Guid,
    ifd::RegionType,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(StrDisplay, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageType {
    #[strum(serialize = "Intel")]
    Intel,
    #[strum(serialize = "UEFI")]
    Uefi,
}

#[derive(StrDisplay, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaddingType {
    /// All `0x00`
    #[strum(serialize = "Empty (0x00)")]
    Empty,
    /// All `0xFF`, or the empty byte of the volume it is found in
    #[strum(serialize = "Empty (0xFF)")]
    FreeSpace,
    #[strum(serialize = "Non-empty")]
    NonEmpty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeType {
    Ffs(FfsVersion),
    Nvram,
    Unknown,
}

impl Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeType::Ffs(v) => write!(f, "{v}"),
            VolumeType::Nvram => write!(f, "NVRAM"),
            VolumeType::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Root,
    Capsule,
    Image(ImageType),
    Region(RegionType),
    Padding(PaddingType),
    Volume(VolumeType),
    File(FileType),
    Section(SectionType),
}

impl Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Root => write!(f, "Root"),
            Kind::Capsule => write!(f, "Capsule"),
            Kind::Image(t) => write!(f, "Image ({t})"),
            Kind::Region(t) => write!(f, "Region ({t})"),
            Kind::Padding(t) => write!(f, "Padding ({t})"),
            Kind::Volume(t) => write!(f, "Volume ({t})"),
            Kind::File(t) => write!(f, "File ({t})"),
            Kind::Section(t) => write!(f, "Section ({t})"),
        }
    }
}

/// Data kept between the two passes
#[derive(Clone, Debug, Default)]
pub enum ParsingData {
    #[default]
    None,
    Volume {
        ffs_version: Option<FfsVersion>,
        empty_byte: u8,
        revision: u8,
    },
    File {
        ffs_version: FfsVersion,
        empty_byte: u8,
        guid: Guid,
        /// Body is a valid section list
        has_sections: bool,
    },
    Section {
        ffs_version: FfsVersion,
        header: SectionHeaderData,
    },
}

#[derive(Clone, Copy, Debug)]
pub enum SectionHeaderData {
    Common,
    Compressed {
        compression_type: u8,
        uncompressed_length: u32,
    },
    Guided {
        guid: Guid,
        data_offset: u16,
        processing_required: bool,
        auth_status_valid: bool,
    },
    Freeform {
        guid: Guid,
    },
    Version {
        build_number: u16,
    },
    Postcode {
        postcode: u32,
    },
}

/// Attributes of a node to be created
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub kind: Kind,
    pub name: String,
    pub text: String,
    pub info: Vec<String>,
    pub data: Buffer,
    pub header_size: usize,
    pub tail_size: usize,
    pub parsing: ParsingData,
}

impl NodeSpec {
    pub fn new(kind: Kind, name: impl Into<String>, data: Buffer) -> Self {
        Self {
            kind,
            name: name.into(),
            text: String::new(),
            info: Vec::new(),
            data,
            header_size: 0,
            tail_size: 0,
            parsing: ParsingData::None,
        }
    }

    pub fn header(mut self, size: usize) -> Self {
        self.header_size = size;
        self
    }

    pub fn tail(mut self, size: usize) -> Self {
        self.tail_size = size;
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn info(mut self, info: Vec<String>) -> Self {
        self.info = info;
        self
    }

    pub fn parsing(mut self, parsing: ParsingData) -> Self {
        self.parsing = parsing;
        self
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: Kind,
    pub name: String,
    pub text: String,
    pub info: Vec<String>,
    pub data: Buffer,
    pub header_size: usize,
    pub tail_size: usize,
    /// Offset relative to the start of the parent; for the first node in a
    /// decompressed buffer, relative to that buffer.
    pub offset: usize,
    /// Lives in a buffer that is not part of the input image.
    pub compressed: bool,
    /// Set by the offset pass, relative to the start of the input image
    pub absolute_offset: Option<usize>,
    /// Set by the memory address pass
    pub address: Option<u64>,
    pub parsing: ParsingData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn header(&self) -> Buffer {
        self.data.mid(0, self.header_size)
    }

    pub fn body(&self) -> Buffer {
        let body_size = self
            .data
            .len()
            .saturating_sub(self.header_size + self.tail_size);
        self.data.mid(self.header_size, body_size)
    }

    pub fn tail(&self) -> Buffer {
        let s = self.data.len().saturating_sub(self.tail_size);
        self.data.tail(s)
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Create a tree with a root node covering `data`.
    pub fn new(data: Buffer) -> Self {
        let root = Node {
            kind: Kind::Root,
            name: String::new(),
            text: String::new(),
            info: Vec::new(),
            data,
            header_size: 0,
            tail_size: 0,
            offset: 0,
            compressed: false,
            absolute_offset: None,
            address: None,
            parsing: ParsingData::None,
            parent: None,
            children: Vec::new(),
        };
        Self { nodes: vec![root] }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_child(&mut self, parent: NodeId, spec: NodeSpec) -> NodeId {
        let id = NodeId(self.nodes.len());
        let (compressed, offset) = match self.nodes.get(parent.0) {
            Some(p) if p.data.same_storage(&spec.data) => (
                p.compressed,
                spec.data.start().saturating_sub(p.data.start()),
            ),
            Some(_) => (true, spec.data.start()),
            None => (false, 0),
        };
        let NodeSpec {
            kind,
            name,
            text,
            info,
            data,
            header_size,
            tail_size,
            parsing,
        } = spec;
        self.nodes.push(Node {
            kind,
            name,
            text,
            info,
            data,
            header_size,
            tail_size,
            offset,
            compressed,
            absolute_offset: None,
            address: None,
            parsing,
            parent: Some(parent),
            children: Vec::new(),
        });
        if let Some(p) = self.nodes.get_mut(parent.0) {
            p.children.push(id);
        }
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn add_info(&mut self, id: NodeId, info: impl Into<String>) {
        self.nodes[id.0].info.push(info.into());
    }

    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        self.nodes[id.0].text = text.into();
    }

    /// Closest ancestor (or the node itself) matching `pred`.
    pub fn find_parent_of_kind(&self, id: NodeId, pred: impl Fn(&Kind) -> bool) -> Option<NodeId> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if pred(&self.nodes[c.0].kind) {
                return Some(c);
            }
            cur = self.nodes[c.0].parent;
        }
        None
    }

    /// Whether `ancestor` is on the path from `id` up to the root.
    pub fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.nodes[c.0].parent;
        }
        false
    }

    /// Depth of a node, the root being at 0.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut d = 0;
        let mut cur = self.nodes[id.0].parent;
        while let Some(c) = cur {
            d += 1;
            cur = self.nodes[c.0].parent;
        }
        d
    }

    /// All nodes in depth-first pre-order.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        out
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, indent: usize) -> fmt::Result {
        let n = self.get(id);
        let pad = "  ".repeat(indent);
        let k = n.kind;
        let s = n.size();
        let o = match n.absolute_offset {
            Some(o) => format!("{o:08x}"),
            None => "--------".to_string(),
        };
        write!(f, "{pad}{k} {o} {s:08x}")?;
        if !n.name.is_empty() {
            write!(f, " {}", n.name)?;
        }
        if !n.text.is_empty() {
            write!(f, " \"{}\"", n.text)?;
        }
        if let Some(a) = n.address {
            write!(f, " @ {a:08x}")?;
        }
        writeln!(f)?;
        if f.alternate() {
            for i in &n.info {
                writeln!(f, "{pad}  | {i}")?;
            }
        }
        for c in self.children(id) {
            self.fmt_node(f, *c, indent + 1)?;
        }
        Ok(())
    }
}

/// One line per node, indented by depth; `{:#}` adds info lines.
impl Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            return Ok(());
        }
        self.fmt_node(f, self.root(), 0)
    }
}

#[test]
fn arena_links() {
    let data = Buffer::new(vec![0u8; 64]);
    let mut t = Tree::new(data.clone());
    let r = t.root();
    let a = t.add_child(r, NodeSpec::new(Kind::Padding(PaddingType::Empty), "a", data.mid(0, 32)));
    let b = t.add_child(r, NodeSpec::new(Kind::Capsule, "b", data.mid(32, 32)).header(8));
    let c = t.add_child(b, NodeSpec::new(Kind::Padding(PaddingType::Empty), "c", data.mid(40, 24)));
    let other = Buffer::new(vec![1u8; 4]);
    let d = t.add_child(c, NodeSpec::new(Kind::Padding(PaddingType::NonEmpty), "d", other));
    assert_eq!(t.children(r), &[a, b]);
    assert_eq!(t.parent(c), Some(b));
    assert_eq!(t.depth(c), 2);
    assert_eq!(t.walk(), vec![r, a, b, c, d]);
    assert!(!t.get(c).compressed);
    assert_eq!(t.get(b).offset, 32);
    assert_eq!(t.get(c).offset, 8);
    assert!(t.get(d).compressed);
    assert_eq!(t.get(b).body().len(), 24);
    assert_eq!(t.find_parent_of_kind(d, |k| *k == Kind::Capsule), Some(b));
    assert!(t.is_descendant(d, b));
    assert!(t.is_descendant(b, b));
    assert!(!t.is_descendant(a, b));
}
