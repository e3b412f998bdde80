use std::collections::{HashMap, HashSet};
use crate::hdf5::object_header::{ObjectHeader, MSG_ATTRIBUTE_INFO, MSG_LINK, MSG_LINK_INFO, MSG_SYMBOL_TABLE};
use crate::hdf5::reader::{pad8, Cursor};
use crate::hdf5::{File, H5Error};

const MAX_BTREE_DEPTH: usize = 32;

/// Lists the hard links of a group as (name, object header address), sorted by name.
pub(crate) fn read_links(file: &File, header: &ObjectHeader) -> Result<Vec<(String, u64)>, H5Error> {
    let mut links = vec![];
    if let Some(message) = header.find(MSG_SYMBOL_TABLE) {
        let mut c = Cursor::new(message.data, 0, file.sizes());
        let btree = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined group B-tree".to_string()))?;
        let heap = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined group local heap".to_string()))?;
        let heap = LocalHeap::read(file, heap)?;
        collect_symbol_table(file, btree, &heap, &mut links, &mut HashSet::new(), 0)?;
    } else {
        if let Some(message) = header.find(MSG_LINK_INFO) {
            let mut c = Cursor::new(message.data, 0, file.sizes());
            c.u8()?;
            let flags = c.u8()?;
            if flags & 0x01 != 0 {
                c.u64()?;
            }
            if c.address()?.is_some() {
                return Err(H5Error::Unsupported("dense link storage".to_string()));
            }
        }
        for message in header.all(MSG_LINK) {
            if let Some(link) = parse_link(message.data, file)? {
                links.push(link);
            }
        }
    }
    links.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(links)
}

/// Rejects attributes kept in a fractal heap, which this reader does not walk.
pub(crate) fn check_attribute_storage(file: &File, header: &ObjectHeader) -> Result<(), H5Error> {
    if let Some(message) = header.find(MSG_ATTRIBUTE_INFO) {
        let mut c = Cursor::new(message.data, 0, file.sizes());
        c.u8()?;
        let flags = c.u8()?;
        if flags & 0x01 != 0 {
            c.u16()?;
        }
        if c.address()?.is_some() {
            return Err(H5Error::Unsupported("dense attribute storage".to_string()));
        }
    }
    Ok(())
}

fn parse_link(data: &[u8], file: &File) -> Result<Option<(String, u64)>, H5Error> {
    let mut c = Cursor::new(data, 0, file.sizes());
    let version = c.u8()?;
    if version != 1 {
        return Err(H5Error::Unsupported(format!("link message version {}", version)));
    }
    let flags = c.u8()?;
    let link_type = if flags & 0x08 != 0 { c.u8()? } else { 0 };
    if flags & 0x04 != 0 {
        c.u64()?;
    }
    if flags & 0x10 != 0 {
        c.u8()?;
    }
    let name_len = c.uint(1 << (flags & 0x03))? as usize;
    let name = String::from_utf8_lossy(c.bytes(name_len)?).into_owned();
    if link_type != 0 {
        log::debug!("Skipping non-hard link {} of type {}", name, link_type);
        return Ok(None);
    }
    let address = c.address()?.ok_or_else(|| H5Error::Corrupt(format!("undefined address for link {}", name)))?;
    Ok(Some((name, address)))
}

struct LocalHeap<'a> {
    data: &'a [u8],
}

impl<'a> LocalHeap<'a> {
    fn read(file: &'a File, address: u64) -> Result<Self, H5Error> {
        let mut c = file.cursor(address)?;
        c.signature(b"HEAP")?;
        c.skip(4)?;
        let size = c.length()?;
        c.length()?; // free list head
        let data_address = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined local heap data".to_string()))?;
        Ok(Self { data: file.slice(data_address, size as usize)? })
    }

    fn string_at(&self, offset: u64) -> Result<String, H5Error> {
        let start = offset as usize;
        if start >= self.data.len() {
            return Err(H5Error::Corrupt(format!("local heap offset {} out of range", offset)));
        }
        let tail = &self.data[start..];
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }
}

fn collect_symbol_table(
    file: &File,
    address: u64,
    heap: &LocalHeap,
    out: &mut Vec<(String, u64)>,
    visited: &mut HashSet<u64>,
    depth: usize,
) -> Result<(), H5Error> {
    if depth > MAX_BTREE_DEPTH {
        return Err(H5Error::Corrupt("group B-tree too deep".to_string()));
    }
    if !visited.insert(address) {
        return Err(H5Error::Corrupt(format!("group B-tree node {} reached twice", address)));
    }
    let mut c = file.cursor(address)?;
    c.signature(b"TREE")?;
    let node_type = c.u8()?;
    if node_type != 0 {
        return Err(H5Error::Corrupt(format!("expected group B-tree node, found type {}", node_type)));
    }
    let level = c.u8()?;
    let entries = c.u16()? as usize;
    c.address()?;
    c.address()?;
    for _ in 0..entries {
        c.length()?; // key: heap offset of the largest name in the child
        let child = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined group B-tree child".to_string()))?;
        if level == 0 {
            read_symbol_node(file, child, heap, out)?;
        } else {
            collect_symbol_table(file, child, heap, out, visited, depth + 1)?;
        }
    }
    Ok(())
}

fn read_symbol_node(file: &File, address: u64, heap: &LocalHeap, out: &mut Vec<(String, u64)>) -> Result<(), H5Error> {
    let mut c = file.cursor(address)?;
    c.signature(b"SNOD")?;
    c.skip(2)?;
    let count = c.u16()? as usize;
    for _ in 0..count {
        let name_offset = c.uint(c.sizes().offset)?;
        let header = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined symbol table entry".to_string()))?;
        c.skip(24)?; // cache type, reserved, scratch pad
        out.push((heap.string_at(name_offset)?, header));
    }
    Ok(())
}

/// Resolves variable-length elements through global heap collections.
pub(crate) struct GlobalHeap<'a> {
    file: &'a File,
    collections: HashMap<u64, HashMap<u16, &'a [u8]>>,
}

impl<'a> GlobalHeap<'a> {
    pub fn new(file: &'a File) -> Self {
        Self { file, collections: HashMap::new() }
    }

    pub fn object(&mut self, collection: u64, index: u32) -> Result<&'a [u8], H5Error> {
        if !self.collections.contains_key(&collection) {
            let objects = self.read_collection(collection)?;
            self.collections.insert(collection, objects);
        }
        self.collections
            .get(&collection)
            .and_then(|objects| objects.get(&(index as u16)))
            .copied()
            .ok_or_else(|| H5Error::Corrupt(format!("global heap object {} missing from collection {}", index, collection)))
    }

    fn read_collection(&self, address: u64) -> Result<HashMap<u16, &'a [u8]>, H5Error> {
        let mut c = self.file.cursor(address)?;
        c.signature(b"GCOL")?;
        c.skip(4)?;
        let size = c.length()? as usize;
        let header_len = 8 + self.file.sizes().length;
        let end = (c.position() - header_len)
            .checked_add(size)
            .ok_or_else(|| H5Error::Corrupt(format!("global heap collection at {} overflows", address)))?;
        let mut objects = HashMap::new();
        while c.position() + 8 + self.file.sizes().length <= end {
            let index = c.u16()?;
            if index == 0 {
                break;
            }
            c.skip(6)?; // reference count, reserved
            let len = c.length()? as usize;
            objects.insert(index, c.bytes(len)?);
            c.skip(pad8(len) - len)?;
        }
        Ok(objects)
    }

    /// Decodes one variable-length string element: length, collection address, object index.
    pub fn vlen_string(&mut self, element: &[u8]) -> Result<String, H5Error> {
        let mut c = Cursor::new(element, 0, self.file.sizes());
        let len = c.u32()? as usize;
        let collection = c.address()?;
        let index = c.u32()?;
        let Some(collection) = collection else {
            return Ok(String::new());
        };
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.object(collection, index)?;
        let bytes = &bytes[..len.min(bytes.len())];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
