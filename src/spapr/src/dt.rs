// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory device tree nodes.
//!
//! PHB nodes are emitted straight into a [`vm_fdt::FdtWriter`] at boot. Hot-plugged functions
//! instead get a [`DtNode`] fragment that the guest pulls one tag at a time through
//! ibm,configure-connector, driven by a [`FragmentCursor`].

use vm_fdt::{Error as VmFdtError, FdtWriter};

/// A device tree property with a raw big-endian value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DtProperty {
    /// Property name.
    pub name: String,
    /// Encoded value.
    pub value: Vec<u8>,
}

/// A device tree node with its properties and children.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DtNode {
    /// Node name including the unit address.
    pub name: String,
    /// Properties in insertion order.
    pub properties: Vec<DtProperty>,
    /// Child nodes in insertion order.
    pub children: Vec<DtNode>,
}

impl DtNode {
    pub fn new(name: impl Into<String>) -> Self {
        DtNode {
            name: name.into(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn property(&mut self, name: &str, value: Vec<u8>) {
        self.properties.push(DtProperty {
            name: name.to_string(),
            value,
        });
    }

    pub fn property_null(&mut self, name: &str) {
        self.property(name, Vec::new());
    }

    pub fn property_u32(&mut self, name: &str, value: u32) {
        self.property(name, value.to_be_bytes().to_vec());
    }

    pub fn property_u64(&mut self, name: &str, value: u64) {
        self.property(name, value.to_be_bytes().to_vec());
    }

    pub fn property_array_u32(&mut self, name: &str, values: &[u32]) {
        self.property(name, values.iter().flat_map(|v| v.to_be_bytes()).collect());
    }

    /// NUL terminated string property.
    pub fn property_string(&mut self, name: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.property(name, bytes);
    }

    pub fn add_child(&mut self, child: DtNode) {
        self.children.push(child);
    }

    /// Raw value of the named property.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|prop| prop.name == name)
            .map(|prop| prop.value.as_slice())
    }

    /// The named property decoded as a single big-endian cell.
    pub fn get_u32(&self, name: &str) -> Option<u32> {
        let bytes: [u8; 4] = self.get(name)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// The named property decoded as big-endian cells.
    pub fn get_cells(&self, name: &str) -> Option<Vec<u32>> {
        let value = self.get(name)?;
        if value.len() % 4 != 0 {
            return None;
        }
        Some(
            value
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Emits this node and its subtree into `fdt`.
    pub fn write_to(&self, fdt: &mut FdtWriter) -> Result<(), VmFdtError> {
        let node = fdt.begin_node(&self.name)?;
        for prop in &self.properties {
            fdt.property(&prop.name, &prop.value)?;
        }
        for child in &self.children {
            child.write_to(fdt)?;
        }
        fdt.end_node(node)
    }
}

/// One step of a flattened traversal.
#[derive(Debug, PartialEq, Eq)]
pub enum FdtTag<'a> {
    /// Entering a node.
    BeginNode(&'a str),
    /// A property of the current node.
    Property(&'a DtProperty),
    /// Leaving the current node.
    EndNode,
    /// Nothing left.
    End,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Frame {
    next_prop: usize,
    next_child: usize,
}

/// Resumable pre-order walk over a [`DtNode`] tree.
///
/// The cursor does not borrow the tree, so it can be stored next to it and advanced across
/// separate calls. Properties of a node are yielded before its children.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentCursor {
    started: bool,
    stack: Vec<Frame>,
}

impl FragmentCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes entered and not yet left.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn current<'a>(&self, root: &'a DtNode) -> Option<&'a DtNode> {
        let (_, parents) = self.stack.split_last()?;
        let mut node = root;
        for frame in parents {
            node = node.children.get(frame.next_child.checked_sub(1)?)?;
        }
        Some(node)
    }

    /// Advances the walk over `root` by one tag.
    pub fn next_tag<'a>(&mut self, root: &'a DtNode) -> FdtTag<'a> {
        if !self.started {
            self.started = true;
            self.stack.push(Frame::default());
            return FdtTag::BeginNode(&root.name);
        }

        let Some(node) = self.current(root) else {
            return FdtTag::End;
        };
        let Some(frame) = self.stack.last_mut() else {
            return FdtTag::End;
        };

        if let Some(prop) = node.properties.get(frame.next_prop) {
            frame.next_prop += 1;
            return FdtTag::Property(prop);
        }
        if let Some(child) = node.children.get(frame.next_child) {
            frame.next_child += 1;
            self.stack.push(Frame::default());
            return FdtTag::BeginNode(&child.name);
        }
        self.stack.pop();
        FdtTag::EndNode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> DtNode {
        let mut root = DtNode::new("pci@2");
        root.property_u32("vendor-id", 0x1af4);
        let mut child = DtNode::new("child@0");
        child.property_string("name", "child");
        root.add_child(child);
        root.property_null("used-by-rtas");
        root.add_child(DtNode::new("child@1"));
        root
    }

    #[test]
    fn test_properties() {
        let mut node = DtNode::new("n");
        node.property_u32("a", 0x1234_5678);
        node.property_u64("b", 0x1_0000_0002);
        node.property_array_u32("c", &[1, 2]);
        node.property_string("d", "ab");
        assert_eq!(node.get("a"), Some(&[0x12, 0x34, 0x56, 0x78][..]));
        assert_eq!(node.get_u32("a"), Some(0x1234_5678));
        assert_eq!(node.get_cells("b"), Some(vec![1, 2]));
        assert_eq!(node.get_cells("c"), Some(vec![1, 2]));
        assert_eq!(node.get("d"), Some(&b"ab\0"[..]));
        assert_eq!(node.get_u32("c"), None);
        assert_eq!(node.get_cells("d"), None);
        assert!(node.get("e").is_none());
    }

    #[test]
    fn test_cursor_walk() {
        let root = sample_tree();
        let mut cursor = FragmentCursor::new();
        let mut tags = Vec::new();
        loop {
            match cursor.next_tag(&root) {
                FdtTag::End => break,
                FdtTag::BeginNode(name) => tags.push(format!("begin {name}")),
                FdtTag::Property(prop) => tags.push(format!("prop {}", prop.name)),
                FdtTag::EndNode => tags.push("end".to_string()),
            }
        }
        assert_eq!(
            tags,
            vec![
                "begin pci@2",
                "prop vendor-id",
                "prop used-by-rtas",
                "begin child@0",
                "prop name",
                "end",
                "begin child@1",
                "end",
                "end",
            ]
        );
        assert_eq!(cursor.depth(), 0);
        assert_eq!(cursor.next_tag(&root), FdtTag::End);
    }

    #[test]
    fn test_cursor_depth() {
        let root = sample_tree();
        let mut cursor = FragmentCursor::new();
        cursor.next_tag(&root);
        assert_eq!(cursor.depth(), 1);
        cursor.next_tag(&root);
        cursor.next_tag(&root);
        cursor.next_tag(&root);
        assert_eq!(cursor.depth(), 2);
    }

    #[test]
    fn test_write_to_fdt() {
        let mut fdt = FdtWriter::new().unwrap();
        let root = fdt.begin_node("").unwrap();
        sample_tree().write_to(&mut fdt).unwrap();
        fdt.end_node(root).unwrap();
        let blob = fdt.finish().unwrap();

        let tree = device_tree::DeviceTree::load(&blob).unwrap();
        let node = tree.find("/pci@2").unwrap();
        assert_eq!(node.prop_u32("vendor-id").unwrap(), 0x1af4);
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.children[0].prop_str("name").unwrap(), "child");
    }
}
