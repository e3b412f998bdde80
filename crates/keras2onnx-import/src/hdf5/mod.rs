//! A read-only HDF5 reader covering the subset of the format that h5py writes for Keras models:
//! old-style and link-message groups, attributes in object headers, and uncompressed datasets.

mod datatype;
mod group;
mod layout;
mod object_header;
mod reader;
#[cfg(any(test, feature = "fixtures"))]
pub mod writer;

use std::fmt::{Display, Formatter};
use std::path::Path;
use memmap2::Mmap;
pub use datatype::{Datatype, StringPadding};
use datatype::Dataspace;
use group::GlobalHeap;
use layout::Layout;
use object_header::{ObjectHeader, MSG_ATTRIBUTE, MSG_DATASPACE, MSG_DATATYPE, MSG_FILTER_PIPELINE, MSG_LAYOUT};
use reader::{pad8, Cursor, Sizes, Superblock};

#[derive(Debug, thiserror::Error)]
pub enum H5Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("file is not in HDF5 format")]
    NotHdf5,
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),
    #[error("corrupt HDF5 structure: {0}")]
    Corrupt(String),
    #[error("unsupported HDF5 feature: {0}")]
    Unsupported(String),
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Mapped(map) => map,
            Storage::Owned(data) => data,
        }
    }
}

pub struct File {
    storage: Storage,
    superblock: Superblock,
}

impl File {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, H5Error> {
        let file = std::fs::File::open(path)?;
        // The mapping is read-only and outlives every slice handed out, which borrow from `self`.
        let map = unsafe { Mmap::map(&file) }?;
        let superblock = Superblock::locate(&map)?;
        Ok(Self { storage: Storage::Mapped(map), superblock })
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, H5Error> {
        let superblock = Superblock::locate(&data)?;
        Ok(Self { storage: Storage::Owned(data), superblock })
    }

    /// Size of the whole file in bytes.
    pub fn file_size(&self) -> usize {
        self.storage.bytes().len()
    }

    pub(crate) fn sizes(&self) -> Sizes {
        self.superblock.sizes
    }

    fn absolute(&self, address: u64) -> Result<usize, H5Error> {
        let at = address
            .checked_add(self.superblock.base_address)
            .ok_or_else(|| H5Error::Corrupt(format!("address {} overflows", address)))?;
        usize::try_from(at).map_err(|_| H5Error::Corrupt(format!("address {} out of range", address)))
    }

    pub(crate) fn slice(&self, address: u64, len: usize) -> Result<&[u8], H5Error> {
        let start = self.absolute(address)?;
        let data = self.storage.bytes();
        match start.checked_add(len) {
            Some(end) if end <= data.len() => Ok(&data[start..end]),
            _ => Err(H5Error::Truncated(start)),
        }
    }

    pub(crate) fn cursor(&self, address: u64) -> Result<Cursor<'_>, H5Error> {
        let start = self.absolute(address)?;
        let data = self.storage.bytes();
        if start >= data.len() {
            return Err(H5Error::Truncated(start));
        }
        Ok(Cursor::new(data, start, self.sizes()))
    }

    pub fn superblock_version(&self) -> u8 {
        self.superblock.version
    }

    pub fn root(&self) -> Result<Group<'_>, H5Error> {
        let header = ObjectHeader::read(self, self.superblock.root_address)?;
        Ok(Group { file: self, path: String::new(), header })
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() { name.to_string() } else { format!("{}/{}", path, name) }
}

pub struct Group<'a> {
    file: &'a File,
    path: String,
    header: ObjectHeader<'a>,
}

impl<'a> Group<'a> {
    /// Path from the root, without a leading slash. Empty for the root group.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn member_names(&self) -> Result<Vec<String>, H5Error> {
        Ok(group::read_links(self.file, &self.header)?.into_iter().map(|(name, _)| name).collect())
    }

    fn member(&self, name: &str) -> Result<Option<ObjectHeader<'a>>, H5Error> {
        let links = group::read_links(self.file, &self.header)?;
        match links.iter().find(|(n, _)| n == name) {
            Some((_, address)) => Ok(Some(ObjectHeader::read(self.file, *address)?)),
            None => Ok(None),
        }
    }

    /// Walks a slash-separated path, returning the header of the final object.
    fn resolve(&self, path: &str) -> Result<(String, ObjectHeader<'a>), H5Error> {
        let mut full = self.path.clone();
        let mut header = self.header.clone();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            let current = Group { file: self.file, path: full.clone(), header };
            full = join(&full, part);
            header = current.member(part)?.ok_or_else(|| H5Error::NotFound(full.clone()))?;
        }
        Ok((full, header))
    }

    pub fn has_member(&self, path: &str) -> Result<bool, H5Error> {
        match self.resolve(path) {
            Ok(_) => Ok(true),
            Err(H5Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn group(&self, path: &str) -> Result<Group<'a>, H5Error> {
        let (full, header) = self.resolve(path)?;
        if header.is_dataset() {
            return Err(H5Error::TypeMismatch(format!("{} is a dataset, not a group", full)));
        }
        Ok(Group { file: self.file, path: full, header })
    }

    pub fn dataset(&self, path: &str) -> Result<Dataset<'a>, H5Error> {
        let (full, header) = self.resolve(path)?;
        Dataset::from_header(self.file, full, header)
    }

    pub fn attr_names(&self) -> Result<Vec<String>, H5Error> {
        attributes(self.file, &self.header).map(|attrs| attrs.into_iter().map(|a| a.name).collect())
    }

    pub fn attr(&self, name: &str) -> Result<Option<Attribute>, H5Error> {
        Ok(attributes(self.file, &self.header)?.into_iter().find(|a| a.name == name))
    }
}

impl Display for Group<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.path)
    }
}

pub struct Dataset<'a> {
    file: &'a File,
    path: String,
    datatype: Datatype,
    dataspace: Dataspace,
    layout: Layout<'a>,
}

impl<'a> Dataset<'a> {
    fn from_header(file: &'a File, path: String, header: ObjectHeader<'a>) -> Result<Self, H5Error> {
        let layout = header.find(MSG_LAYOUT).ok_or_else(|| H5Error::TypeMismatch(format!("{} is a group, not a dataset", path)))?;
        if header.has(MSG_FILTER_PIPELINE) {
            return Err(H5Error::Unsupported(format!("filtered (compressed) dataset {}", path)));
        }
        let datatype = header.find(MSG_DATATYPE).ok_or_else(|| H5Error::Corrupt(format!("{} has no datatype", path)))?;
        if datatype.is_shared() {
            return Err(H5Error::Unsupported(format!("committed datatype on {}", path)));
        }
        let dataspace = header.find(MSG_DATASPACE).ok_or_else(|| H5Error::Corrupt(format!("{} has no dataspace", path)))?;
        Ok(Self {
            file,
            datatype: Datatype::parse(datatype.data)?,
            dataspace: Dataspace::parse(dataspace.data, file.sizes())?,
            layout: Layout::parse(layout.data, file.sizes())?,
            path,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dataspace.dims.iter().map(|d| *d as usize).collect()
    }

    pub fn datatype(&self) -> &Datatype {
        &self.datatype
    }

    /// Raw element bytes in little-endian order.
    pub fn read_raw(&self) -> Result<Vec<u8>, H5Error> {
        let element_size = self.datatype.size();
        let count = self.dataspace.num_elements()?;
        let mut data = self.layout.read(self.file, &self.dataspace.dims, element_size, count)?;
        if self.datatype.is_big_endian() && element_size > 1 {
            for element in data.chunks_exact_mut(element_size) {
                element.reverse();
            }
        }
        Ok(data)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Strings(Vec<String>),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Unsupported(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    /// Empty for scalar attributes.
    pub shape: Vec<usize>,
    pub value: AttrValue,
}

impl Attribute {
    /// The single string of a scalar (or one-element) string attribute.
    pub fn as_string(&self) -> Option<&str> {
        match &self.value {
            AttrValue::Strings(v) if v.len() == 1 => Some(v[0].as_str()),
            _ => None,
        }
    }

    pub fn strings(&self) -> Option<&[String]> {
        match &self.value {
            AttrValue::Strings(v) => Some(v),
            _ => None,
        }
    }
}

fn attributes(file: &File, header: &ObjectHeader) -> Result<Vec<Attribute>, H5Error> {
    group::check_attribute_storage(file, header)?;
    let mut heap = GlobalHeap::new(file);
    header.all(MSG_ATTRIBUTE).map(|message| parse_attribute(file, message.data, &mut heap)).collect()
}

fn parse_attribute(file: &File, data: &[u8], heap: &mut GlobalHeap) -> Result<Attribute, H5Error> {
    let mut c = Cursor::new(data, 0, file.sizes());
    let version = c.u8()?;
    let flags = c.u8()?;
    let name_size = c.u16()? as usize;
    let datatype_size = c.u16()? as usize;
    let dataspace_size = c.u16()? as usize;
    if version == 3 {
        c.u8()?; // name encoding
    }
    let padded = |n: usize| if version == 1 { pad8(n) } else { n };
    let name_bytes = c.bytes(padded(name_size))?;
    let name_end = name_bytes[..name_size.min(name_bytes.len())].iter().position(|b| *b == 0).unwrap_or(name_size);
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
    if version > 3 || version == 0 {
        return Err(H5Error::Unsupported(format!("attribute message version {} on {}", version, name)));
    }
    if flags & 0x03 != 0 {
        return Err(H5Error::Unsupported(format!("shared datatype or dataspace on attribute {}", name)));
    }
    let datatype = Datatype::parse(&c.bytes(padded(datatype_size))?[..datatype_size])?;
    let dataspace = Dataspace::parse(&c.bytes(padded(dataspace_size))?[..dataspace_size], file.sizes())?;
    let count = dataspace.num_elements()?;
    let raw_size = count
        .checked_mul(datatype.size())
        .ok_or_else(|| H5Error::Corrupt(format!("attribute {} of {} elements overflows", name, count)))?;
    let raw = c.bytes(raw_size)?;
    let value = decode_values(&datatype, raw, count, heap)?;
    Ok(Attribute { name, shape: dataspace.dims.iter().map(|d| *d as usize).collect(), value })
}

fn decode_values(datatype: &Datatype, raw: &[u8], count: usize, heap: &mut GlobalHeap) -> Result<AttrValue, H5Error> {
    let size = datatype.size();
    let elements = raw.chunks_exact(size.max(1)).take(count);
    Ok(match datatype {
        Datatype::String { padding, .. } => AttrValue::Strings(
            elements
                .map(|element| {
                    let end = element.iter().position(|b| *b == 0).unwrap_or(element.len());
                    let s = String::from_utf8_lossy(&element[..end]).into_owned();
                    if *padding == StringPadding::SpacePad { s.trim_end_matches(' ').to_string() } else { s }
                })
                .collect(),
        ),
        Datatype::VarLenString => AttrValue::Strings(elements.map(|e| heap.vlen_string(e)).collect::<Result<_, _>>()?),
        Datatype::FixedPoint { signed, big_endian, .. } => AttrValue::Ints(
            elements
                .map(|element| {
                    let mut bytes = element.to_vec();
                    if *big_endian {
                        bytes.reverse();
                    }
                    let value = bytes.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64);
                    if *signed && (1..8).contains(&size) {
                        let shift = 64 - size * 8;
                        ((value << shift) as i64) >> shift
                    } else {
                        value as i64
                    }
                })
                .collect(),
        ),
        Datatype::Float { big_endian, .. } => {
            let mut out = vec![];
            for element in elements {
                let mut bytes = element.to_vec();
                if *big_endian {
                    bytes.reverse();
                }
                out.push(match size {
                    2 => half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f64(),
                    4 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
                    8 => f64::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]),
                    _ => return Ok(AttrValue::Unsupported(datatype.describe())),
                });
            }
            AttrValue::Floats(out)
        }
        Datatype::Enum { base } => decode_values(base, raw, count, heap)?,
        other => AttrValue::Unsupported(other.describe()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_header::{MSG_ATTRIBUTE_INFO, MSG_CONTINUATION, MSG_LINK, MSG_LINK_INFO};

    // Files in the layout h5py writes with libver="latest": superblock v2/v3, "OHDR" object
    // headers, link messages instead of symbol tables and v3 attribute messages.

    fn message(kind: u16, data: &[u8]) -> Vec<u8> {
        let mut out = vec![kind as u8];
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.push(0);
        out.extend_from_slice(data);
        out
    }

    fn object_header(messages: &[Vec<u8>]) -> Vec<u8> {
        let body = messages.concat();
        let mut out = b"OHDR".to_vec();
        out.extend_from_slice(&[2, 0x01]);
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&[0; 4]);
        out
    }

    fn superblock(version: u8, root: u64, eof: u64) -> Vec<u8> {
        let mut out = reader::SIGNATURE.to_vec();
        out.extend_from_slice(&[version, 8, 8, 0]);
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&u64::MAX.to_le_bytes());
        out.extend_from_slice(&eof.to_le_bytes());
        out.extend_from_slice(&root.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out
    }

    fn float_dataset(values: &[f32]) -> Vec<u8> {
        let mut space = vec![2, 1, 0, 1];
        space.extend_from_slice(&(values.len() as u64).to_le_bytes());
        let mut dtype = vec![0x11, 0x20, 0x1f, 0x00, 4, 0, 0, 0];
        dtype.extend_from_slice(&[0, 0, 32, 0, 23, 8, 0, 23, 127, 0, 0, 0]);
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut layout = vec![4, 0];
        layout.extend_from_slice(&(raw.len() as u16).to_le_bytes());
        layout.extend_from_slice(&raw);
        object_header(&[message(MSG_DATASPACE, &space), message(MSG_DATATYPE, &dtype), message(MSG_LAYOUT, &layout)])
    }

    fn string_attribute(name: &str, value: &str) -> Vec<u8> {
        let mut dtype = vec![0x13, 0, 0, 0];
        dtype.extend_from_slice(&(value.len() as u32).to_le_bytes());
        let space = [2, 0, 0, 0];
        let mut out = vec![3, 0];
        out.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
        out.extend_from_slice(&(dtype.len() as u16).to_le_bytes());
        out.extend_from_slice(&(space.len() as u16).to_le_bytes());
        out.push(0);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(&dtype);
        out.extend_from_slice(&space);
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn hard_link(name: &str, address: u64) -> Vec<u8> {
        let mut out = vec![1, 0, name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&address.to_le_bytes());
        out
    }

    /// Link or attribute info: version, flags, fractal heap address, name index address.
    fn storage_info(heap: Option<u64>) -> Vec<u8> {
        let mut out = vec![0, 0];
        out.extend_from_slice(&heap.unwrap_or(u64::MAX).to_le_bytes());
        out.extend_from_slice(&u64::MAX.to_le_bytes());
        out
    }

    /// A root group linking one dataset, `kernel`, with its `keras_version` attribute kept in a
    /// continuation block.
    fn latest_format_file(version: u8, link_heap: Option<u64>, attribute_heap: Option<u64>) -> Vec<u8> {
        let mut file = vec![0u8; 48];
        let dataset_address = file.len() as u64;
        file.extend_from_slice(&float_dataset(&[1.0, 2.0, 3.0]));

        let continuation_address = file.len() as u64;
        let mut block = b"OCHK".to_vec();
        block.extend_from_slice(&message(MSG_ATTRIBUTE, &string_attribute("keras_version", "2.15.0")));
        block.extend_from_slice(&[0; 4]);
        file.extend_from_slice(&block);

        let root_address = file.len() as u64;
        let mut continuation = continuation_address.to_le_bytes().to_vec();
        continuation.extend_from_slice(&(block.len() as u64).to_le_bytes());
        file.extend_from_slice(&object_header(&[
            message(MSG_LINK_INFO, &storage_info(link_heap)),
            message(MSG_ATTRIBUTE_INFO, &storage_info(attribute_heap)),
            message(MSG_LINK, &hard_link("kernel", dataset_address)),
            message(MSG_CONTINUATION, &continuation),
        ]));
        let eof = file.len() as u64;
        file[..48].copy_from_slice(&superblock(version, root_address, eof));
        file
    }

    #[test]
    fn reads_latest_format_files() {
        for version in [2, 3] {
            let file = File::from_bytes(latest_format_file(version, None, None)).unwrap();
            assert_eq!(file.superblock_version(), version);
            let root = file.root().unwrap();
            assert_eq!(root.member_names().unwrap(), vec!["kernel"]);
            assert_eq!(root.attr("keras_version").unwrap().unwrap().as_string(), Some("2.15.0"));

            let kernel = root.dataset("kernel").unwrap();
            assert_eq!(kernel.shape(), vec![3]);
            assert_eq!(kernel.datatype(), &Datatype::Float { size: 4, big_endian: false });
            let expected: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
            assert_eq!(kernel.read_raw().unwrap(), expected);
        }
    }

    #[test]
    fn dense_storage_is_unsupported() {
        let file = File::from_bytes(latest_format_file(2, Some(0x30), None)).unwrap();
        let root = file.root().unwrap();
        assert!(matches!(root.member_names(), Err(H5Error::Unsupported(_))));
        assert!(matches!(root.dataset("kernel"), Err(H5Error::Unsupported(_))));

        let file = File::from_bytes(latest_format_file(3, None, Some(0x30))).unwrap();
        let root = file.root().unwrap();
        assert_eq!(root.member_names().unwrap(), vec!["kernel"]);
        assert!(matches!(root.attr("keras_version"), Err(H5Error::Unsupported(_))));
    }

    #[test]
    fn oversized_dataset_is_corrupt_not_allocated() {
        let mut file = latest_format_file(2, None, None);
        // the dataspace's only dimension follows "OHDR", version, flags, size and the message header
        let dim_at = 48 + 4 + 2 + 2 + 4 + 4;
        file[dim_at..dim_at + 8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        let file = File::from_bytes(file).unwrap();
        let kernel = file.root().unwrap().dataset("kernel").unwrap();
        assert!(matches!(kernel.read_raw(), Err(H5Error::Corrupt(_))));
    }
}
