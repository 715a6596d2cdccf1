//! Owned hardware XML tree.
//!
//! Parsing goes through `roxmltree`; the document is converted into an
//! owned tree so that discovery can annotate it in place and rank 0 can
//! dump it back out as a snapshot.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::{Result, TopoError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElem {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlElem>,
}

impl XmlElem {
    pub fn new(name: &str) -> XmlElem {
        XmlElem {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.to_owned();
        } else {
            self.attrs.push((name.to_owned(), value.to_owned()));
        }
    }

    /// Required integer attribute; accepts decimal or 0x-prefixed hex.
    pub fn attr_int(&self, name: &str) -> Result<i64> {
        match self.attr(name) {
            Some(s) => parse_int(s),
            None => Err(TopoError::Internal(format!(
                "{} element missing {} attribute",
                self.name, name
            ))),
        }
    }

    pub fn attr_int_default(&self, name: &str, default: i64) -> Result<i64> {
        match self.attr(name) {
            Some(s) => parse_int(s),
            None => Ok(default),
        }
    }

    pub fn attr_float(&self, name: &str) -> Result<f64> {
        match self.attr(name) {
            Some(s) => s.trim().parse::<f64>().map_err(|e| {
                TopoError::Internal(format!("bad float attribute {}={:?}: {}", name, s, e))
            }),
            None => Err(TopoError::Internal(format!(
                "{} element missing {} attribute",
                self.name, name
            ))),
        }
    }

    pub fn attr_float_default(&self, name: &str, default: f64) -> Result<f64> {
        match self.attr(name) {
            Some(s) => s.trim().parse::<f64>().map_err(|e| {
                TopoError::Internal(format!("bad float attribute {}={:?}: {}", name, s, e))
            }),
            None => Ok(default),
        }
    }

    pub fn child(&self, name: &str) -> Option<&XmlElem> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn add_child(&mut self, child: XmlElem) -> &mut XmlElem {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    /// All descendants (self included) with the given element name, in
    /// document order.
    pub fn descendants<'a>(&'a self, name: &str) -> Vec<&'a XmlElem> {
        let mut out = Vec::new();
        self.collect_named(name, &mut out);
        out
    }

    fn collect_named<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlElem>) {
        if self.name == name {
            out.push(self);
        }
        for child in &self.children {
            child.collect_named(name, out);
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}<{}", "", self.name, indent = depth * 2)?;
        for (k, v) in &self.attrs {
            write!(f, " {}=\"{}\"", k, v)?;
        }
        if self.children.is_empty() {
            writeln!(f, "/>")
        } else {
            writeln!(f, ">")?;
            for child in &self.children {
                child.write(f, depth + 1)?;
            }
            writeln!(f, "{:indent$}</{}>", "", self.name, indent = depth * 2)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlDoc {
    pub root: XmlElem,
}

impl XmlDoc {
    pub fn parse(text: &str) -> Result<XmlDoc> {
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| TopoError::Internal(format!("xml parse failed: {}", e)))?;
        Ok(XmlDoc {
            root: convert(doc.root_element()),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<XmlDoc> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            TopoError::Internal(format!(
                "unable to open file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_string())?;
        Ok(())
    }

    /// Locate the pci element with this bus id and return its apu child,
    /// attaching one if the element has none yet. None when the document
    /// does not describe that device.
    pub fn fill_apu(&mut self, bus_id: &str) -> Option<&mut XmlElem> {
        let pci = find_pci(&mut self.root, bus_id)?;
        if let Some(i) = pci.children.iter().position(|c| c.name == "apu") {
            Some(&mut pci.children[i])
        } else {
            Some(pci.add_child(XmlElem::new("apu")))
        }
    }

    /// Locate the pci element for a NIC (by the trailing bus id of its
    /// sysfs pci path) and return the net element with this name under its
    /// nic child, creating both as needed.
    pub fn fill_net(&mut self, pci_path: &str, name: &str) -> Option<&mut XmlElem> {
        let bus_id = pci_path.rsplit('/').next()?;
        let pci = find_pci(&mut self.root, bus_id)?;
        let nic = if let Some(i) = pci.children.iter().position(|c| c.name == "nic") {
            &mut pci.children[i]
        } else {
            pci.add_child(XmlElem::new("nic"))
        };
        if let Some(i) = nic
            .children
            .iter()
            .position(|c| c.name == "net" && c.attr("name") == Some(name))
        {
            Some(&mut nic.children[i])
        } else {
            let mut net = XmlElem::new("net");
            net.set_attr("name", name);
            Some(nic.add_child(net))
        }
    }
}

impl fmt::Display for XmlDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.write(f, 0)
    }
}

fn find_pci<'a>(elem: &'a mut XmlElem, bus_id: &str) -> Option<&'a mut XmlElem> {
    if elem.name == "pci" && elem.attr("busid") == Some(bus_id) {
        return Some(elem);
    }
    for child in elem.children.iter_mut() {
        if let Some(hit) = find_pci(child, bus_id) {
            return Some(hit);
        }
    }
    None
}

fn convert(node: roxmltree::Node) -> XmlElem {
    XmlElem {
        name: node.tag_name().name().to_owned(),
        attrs: node
            .attributes()
            .iter()
            .map(|a| (a.name().to_owned(), a.value().to_owned()))
            .collect(),
        children: node
            .children()
            .filter(|c| c.is_element())
            .map(convert)
            .collect(),
    }
}

/// Integer text in decimal or 0x-prefixed hex.
pub fn parse_int(s: &str) -> Result<i64> {
    let t = s.trim();
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        t.parse::<i64>()
    };
    parsed.map_err(|e| TopoError::Internal(format!("bad integer attribute {:?}: {}", s, e)))
}

/// Guid text: hex, with or without the 0x prefix.
pub fn parse_u64_hex(s: &str) -> Result<u64> {
    let t = s.trim();
    let hex = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    u64::from_str_radix(hex, 16)
        .map_err(|e| TopoError::Internal(format!("bad hex attribute {:?}: {}", s, e)))
}
