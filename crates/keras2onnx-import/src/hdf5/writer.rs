//! Writes small HDF5 files in the layout h5py produces with its default settings: a version 0
//! superblock, version 1 object headers and symbol-table groups. Only used to build test models.

use std::collections::BTreeMap;
use std::path::Path;
use onnx_graph::tensor::TensorData;
use onnx_graph::DType;
use crate::hdf5::reader::{pad8, SIGNATURE};
use crate::hdf5::{Datatype, H5Error, StringPadding};

const UNDEFINED: u64 = u64::MAX;
const SUPERBLOCK_SIZE: usize = 96;
const GROUP_LEAF_K: usize = 4;
const GROUP_INTERNAL_K: usize = 16;
const CHUNK_K: usize = 32;
const GLOBAL_HEAP_MIN_SIZE: usize = 4096;

#[derive(Clone, Debug)]
enum AttrData {
    VarLenString(String),
    FixedStrings { values: Vec<String>, scalar: bool },
    Ints(Vec<i64>),
}

#[derive(Clone, Debug)]
struct DatasetBuilder {
    datatype: Datatype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
    chunk: Option<Vec<usize>>,
}

#[derive(Clone, Debug)]
enum Member {
    Group(GroupBuilder),
    Dataset(DatasetBuilder),
}

#[derive(Clone, Debug, Default)]
pub struct GroupBuilder {
    members: BTreeMap<String, Member>,
    attrs: Vec<(String, AttrData)>,
}

impl GroupBuilder {
    /// Gets or creates the group at a slash-separated path below this one.
    pub fn group(&mut self, path: &str) -> &mut GroupBuilder {
        let mut current = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let member = current.members.entry(part.to_string()).or_insert_with(|| Member::Group(GroupBuilder::default()));
            if let Member::Dataset(_) = member {
                *member = Member::Group(GroupBuilder::default());
            }
            current = match member {
                Member::Group(group) => group,
                Member::Dataset(_) => unreachable!(),
            };
        }
        current
    }

    /// A scalar UTF-8 variable-length string, as h5py stores `str` values.
    pub fn attr_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.set_attr(name, AttrData::VarLenString(value.to_string()))
    }

    /// A scalar fixed-length byte string, as h5py stores `bytes` values.
    pub fn attr_bytes(&mut self, name: &str, value: &str) -> &mut Self {
        self.set_attr(name, AttrData::FixedStrings { values: vec![value.to_string()], scalar: true })
    }

    /// A one-dimensional array of fixed-length byte strings.
    pub fn attr_strings(&mut self, name: &str, values: &[&str]) -> &mut Self {
        let values = values.iter().map(|v| v.to_string()).collect();
        self.set_attr(name, AttrData::FixedStrings { values, scalar: false })
    }

    pub fn attr_i64s(&mut self, name: &str, values: &[i64]) -> &mut Self {
        self.set_attr(name, AttrData::Ints(values.to_vec()))
    }

    fn set_attr(&mut self, name: &str, data: AttrData) -> &mut Self {
        self.attrs.retain(|(n, _)| n != name);
        self.attrs.push((name.to_string(), data));
        self
    }

    pub fn dataset(&mut self, name: &str, data: &TensorData) -> Result<&mut Self, H5Error> {
        self.add_dataset(name, data, None)
    }

    pub fn chunked_dataset(&mut self, name: &str, data: &TensorData, chunk: &[usize]) -> Result<&mut Self, H5Error> {
        self.add_dataset(name, data, Some(chunk.to_vec()))
    }

    /// A dataset with an explicit element type and pre-encoded little-endian bytes.
    pub fn raw_dataset(&mut self, name: &str, datatype: Datatype, shape: &[usize], bytes: Vec<u8>) -> &mut Self {
        let dataset = DatasetBuilder { datatype, shape: shape.to_vec(), bytes, chunk: None };
        self.members.insert(name.to_string(), Member::Dataset(dataset));
        self
    }

    fn add_dataset(&mut self, name: &str, data: &TensorData, chunk: Option<Vec<usize>>) -> Result<&mut Self, H5Error> {
        let datatype = datatype_for(data.dtype())?;
        let shape = data.shape().resolve().map_err(|err| H5Error::Unsupported(err.to_string()))?;
        if let Some(chunk) = &chunk {
            if chunk.len() != shape.len() || chunk.iter().any(|c| *c == 0) {
                return Err(H5Error::Unsupported(format!("chunk shape {:?} for dataset shape {:?}", chunk, shape)));
            }
        }
        let dataset = DatasetBuilder { datatype, shape, bytes: data.value().get_raw_encoding(), chunk };
        self.members.insert(name.to_string(), Member::Dataset(dataset));
        Ok(self)
    }
}

fn datatype_for(dtype: DType) -> Result<Datatype, H5Error> {
    Ok(match dtype {
        DType::F32 => Datatype::Float { size: 4, big_endian: false },
        DType::F64 => Datatype::Float { size: 8, big_endian: false },
        DType::F16 => Datatype::Float { size: 2, big_endian: false },
        DType::I8 => Datatype::FixedPoint { size: 1, signed: true, big_endian: false },
        DType::U8 | DType::Bool => Datatype::FixedPoint { size: 1, signed: false, big_endian: false },
        DType::I32 => Datatype::FixedPoint { size: 4, signed: true, big_endian: false },
        DType::I64 => Datatype::FixedPoint { size: 8, signed: true, big_endian: false },
        DType::BF16 => return Err(H5Error::Unsupported("bfloat16 datasets".to_string())),
    })
}

fn encode_datatype(datatype: &Datatype) -> Result<Vec<u8>, H5Error> {
    let mut out = vec![];
    match datatype {
        Datatype::FixedPoint { size, signed, big_endian } => {
            let bits = (if *signed { 0x08 } else { 0 }) | (if *big_endian { 0x01 } else { 0 });
            out.extend_from_slice(&[0x10, bits, 0, 0]);
            out.extend_from_slice(&(*size as u32).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&((*size * 8) as u16).to_le_bytes());
        }
        Datatype::Float { size, big_endian } => {
            let (sign, exp_loc, exp_size, mant_size, bias): (u8, u8, u8, u8, u32) = match size {
                2 => (15, 10, 5, 10, 15),
                4 => (31, 23, 8, 23, 127),
                8 => (63, 52, 11, 52, 1023),
                _ => return Err(H5Error::Unsupported(format!("{}-byte float", size))),
            };
            let order = if *big_endian { 0x01 } else { 0 };
            out.extend_from_slice(&[0x11, 0x20 | order, sign, 0]);
            out.extend_from_slice(&(*size as u32).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&((*size * 8) as u16).to_le_bytes());
            out.extend_from_slice(&[exp_loc, exp_size, 0, mant_size]);
            out.extend_from_slice(&bias.to_le_bytes());
        }
        Datatype::String { size, padding } => {
            let pad = match padding {
                StringPadding::NullTerminate => 0,
                StringPadding::NullPad => 1,
                StringPadding::SpacePad => 2,
            };
            out.extend_from_slice(&[0x13, pad, 0, 0]);
            out.extend_from_slice(&(*size as u32).to_le_bytes());
        }
        Datatype::VarLenString => {
            // string sequence, null terminated, UTF-8; base type is an unsigned byte
            out.extend_from_slice(&[0x19, 0x01, 0x01, 0]);
            out.extend_from_slice(&16u32.to_le_bytes());
            out.extend_from_slice(&encode_datatype(&Datatype::FixedPoint { size: 1, signed: false, big_endian: false })?);
        }
        other => return Err(H5Error::Unsupported(format!("writing {} datatype", other.describe()))),
    }
    Ok(out)
}

fn encode_dataspace(dims: Option<&[usize]>) -> Vec<u8> {
    let dims = dims.unwrap_or(&[]);
    let mut out = vec![1, dims.len() as u8, 0, 0, 0, 0, 0, 0];
    for d in dims {
        out.extend_from_slice(&(*d as u64).to_le_bytes());
    }
    out
}

#[derive(Default)]
pub struct H5Builder {
    root: GroupBuilder,
}

impl H5Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&mut self) -> &mut GroupBuilder {
        &mut self.root
    }

    pub fn build(&self) -> Result<Vec<u8>, H5Error> {
        let mut out = FileWriter { buf: vec![0; SUPERBLOCK_SIZE] };
        let root = out.write_group(&self.root)?;
        let eof = out.buf.len() as u64;

        let mut sb = Vec::with_capacity(SUPERBLOCK_SIZE);
        sb.extend_from_slice(&SIGNATURE);
        sb.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
        sb.extend_from_slice(&(GROUP_LEAF_K as u16).to_le_bytes());
        sb.extend_from_slice(&(GROUP_INTERNAL_K as u16).to_le_bytes());
        sb.extend_from_slice(&0u32.to_le_bytes());
        for address in [0, UNDEFINED, eof, UNDEFINED] {
            sb.extend_from_slice(&address.to_le_bytes());
        }
        // root group symbol table entry, caching its B-tree and heap
        sb.extend_from_slice(&0u64.to_le_bytes());
        sb.extend_from_slice(&root.header.to_le_bytes());
        sb.extend_from_slice(&1u32.to_le_bytes());
        sb.extend_from_slice(&0u32.to_le_bytes());
        sb.extend_from_slice(&root.btree.to_le_bytes());
        sb.extend_from_slice(&root.heap.to_le_bytes());
        out.buf[..SUPERBLOCK_SIZE].copy_from_slice(&sb);
        Ok(out.buf)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), H5Error> {
        std::fs::write(path, self.build()?)?;
        Ok(())
    }
}

struct WrittenGroup {
    header: u64,
    btree: u64,
    heap: u64,
}

struct FileWriter {
    buf: Vec<u8>,
}

impl FileWriter {
    fn alloc(&mut self, bytes: &[u8]) -> u64 {
        let address = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        self.buf.resize(pad8(self.buf.len()), 0);
        address
    }

    fn object_header(&mut self, messages: &[(u16, Vec<u8>)]) -> Result<u64, H5Error> {
        let mut body = vec![];
        for (kind, data) in messages {
            let size = pad8(data.len());
            if size > u16::MAX as usize {
                return Err(H5Error::Unsupported(format!("{}-byte header message", size)));
            }
            body.extend_from_slice(&kind.to_le_bytes());
            body.extend_from_slice(&(size as u16).to_le_bytes());
            body.extend_from_slice(&[0, 0, 0, 0]);
            body.extend_from_slice(data);
            body.resize(body.len() + size - data.len(), 0);
        }
        let mut header = vec![1, 0];
        header.extend_from_slice(&(messages.len() as u16).to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&(body.len() as u32).to_le_bytes());
        header.extend_from_slice(&[0, 0, 0, 0]);
        header.extend_from_slice(&body);
        Ok(self.alloc(&header))
    }

    fn write_group(&mut self, group: &GroupBuilder) -> Result<WrittenGroup, H5Error> {
        let mut entries = vec![];
        for (name, member) in &group.members {
            let address = match member {
                Member::Group(child) => self.write_group(child)?.header,
                Member::Dataset(dataset) => self.write_dataset(dataset)?,
            };
            entries.push((name.as_str(), address));
        }

        // local heap with the empty string at offset 0
        let mut heap_data = vec![0u8; 8];
        let mut offsets = vec![];
        for (name, _) in &entries {
            offsets.push(heap_data.len() as u64);
            heap_data.extend_from_slice(name.as_bytes());
            heap_data.push(0);
            heap_data.resize(pad8(heap_data.len()), 0);
        }
        let heap_data_address = self.alloc(&heap_data);
        let mut heap = b"HEAP".to_vec();
        heap.extend_from_slice(&[0, 0, 0, 0]);
        heap.extend_from_slice(&(heap_data.len() as u64).to_le_bytes());
        heap.extend_from_slice(&UNDEFINED.to_le_bytes());
        heap.extend_from_slice(&heap_data_address.to_le_bytes());
        let heap = self.alloc(&heap);

        let per_node = 2 * GROUP_LEAF_K;
        let node_count = entries.len().div_ceil(per_node);
        if node_count > 2 * GROUP_INTERNAL_K {
            return Err(H5Error::Unsupported(format!("group with {} members", entries.len())));
        }
        let mut children = vec![];
        for (chunk, chunk_offsets) in entries.chunks(per_node).zip(offsets.chunks(per_node)) {
            let mut node = b"SNOD".to_vec();
            node.extend_from_slice(&[1, 0]);
            node.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
            for ((_, address), offset) in chunk.iter().zip(chunk_offsets) {
                node.extend_from_slice(&offset.to_le_bytes());
                node.extend_from_slice(&address.to_le_bytes());
                node.extend_from_slice(&[0; 24]);
            }
            node.resize(8 + per_node * 40, 0);
            let last_name = chunk_offsets.last().copied().unwrap_or(0);
            children.push((self.alloc(&node), last_name));
        }

        let mut btree = b"TREE".to_vec();
        btree.extend_from_slice(&[0, 0]);
        btree.extend_from_slice(&(children.len() as u16).to_le_bytes());
        btree.extend_from_slice(&UNDEFINED.to_le_bytes());
        btree.extend_from_slice(&UNDEFINED.to_le_bytes());
        btree.extend_from_slice(&0u64.to_le_bytes());
        for (child, key) in &children {
            btree.extend_from_slice(&child.to_le_bytes());
            btree.extend_from_slice(&key.to_le_bytes());
        }
        btree.resize(24 + (4 * GROUP_INTERNAL_K + 1) * 8, 0);
        let btree = self.alloc(&btree);

        let mut symbol_table = btree.to_le_bytes().to_vec();
        symbol_table.extend_from_slice(&heap.to_le_bytes());
        let mut messages = vec![(0x11, symbol_table)];
        for (name, data) in &group.attrs {
            messages.push((0x0C, self.encode_attribute(name, data)?));
        }
        let header = self.object_header(&messages)?;
        Ok(WrittenGroup { header, btree, heap })
    }

    fn encode_attribute(&mut self, name: &str, data: &AttrData) -> Result<Vec<u8>, H5Error> {
        let (datatype, dims, raw) = match data {
            AttrData::VarLenString(value) => {
                let collection = self.global_heap(value.as_bytes());
                let mut raw = (value.len() as u32).to_le_bytes().to_vec();
                raw.extend_from_slice(&collection.to_le_bytes());
                raw.extend_from_slice(&1u32.to_le_bytes());
                (Datatype::VarLenString, None, raw)
            }
            AttrData::FixedStrings { values, scalar } => {
                let size = values.iter().map(|v| v.len()).max().unwrap_or(0).max(1);
                let mut raw = vec![];
                for value in values {
                    raw.extend_from_slice(value.as_bytes());
                    raw.resize(raw.len() + size - value.len(), 0);
                }
                let dims = if *scalar { None } else { Some(vec![values.len()]) };
                (Datatype::String { size, padding: StringPadding::NullPad }, dims, raw)
            }
            AttrData::Ints(values) => {
                let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (Datatype::FixedPoint { size: 8, signed: true, big_endian: false }, Some(vec![values.len()]), raw)
            }
        };
        let datatype = encode_datatype(&datatype)?;
        let dataspace = encode_dataspace(dims.as_deref());
        let mut out = vec![1, 0];
        out.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
        out.extend_from_slice(&(datatype.len() as u16).to_le_bytes());
        out.extend_from_slice(&(dataspace.len() as u16).to_le_bytes());
        let mut name_field = name.as_bytes().to_vec();
        name_field.push(0);
        for field in [name_field.as_slice(), datatype.as_slice(), dataspace.as_slice()] {
            let start = out.len();
            out.extend_from_slice(field);
            out.resize(start + pad8(field.len()), 0);
        }
        out.extend_from_slice(&raw);
        Ok(out)
    }

    /// A global heap collection holding one object at index 1.
    fn global_heap(&mut self, object: &[u8]) -> u64 {
        let used = 16 + 16 + pad8(object.len());
        let size = (used + 16).max(GLOBAL_HEAP_MIN_SIZE);
        let mut out = b"GCOL".to_vec();
        out.extend_from_slice(&[1, 0, 0, 0]);
        out.extend_from_slice(&(size as u64).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&(object.len() as u64).to_le_bytes());
        out.extend_from_slice(object);
        out.resize(used, 0);
        // free space object
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&((size - used) as u64).to_le_bytes());
        out.resize(size, 0);
        self.alloc(&out)
    }

    fn write_dataset(&mut self, dataset: &DatasetBuilder) -> Result<u64, H5Error> {
        let element_size = dataset.datatype.size();
        let expected = dataset.shape.iter().product::<usize>() * element_size;
        if dataset.bytes.len() != expected {
            return Err(H5Error::Corrupt(format!("dataset holds {} bytes, shape needs {}", dataset.bytes.len(), expected)));
        }
        let layout = match &dataset.chunk {
            None => {
                let address = if dataset.bytes.is_empty() { UNDEFINED } else { self.alloc(&dataset.bytes) };
                let mut layout = vec![3, 1];
                layout.extend_from_slice(&address.to_le_bytes());
                layout.extend_from_slice(&(dataset.bytes.len() as u64).to_le_bytes());
                layout
            }
            Some(chunk) => {
                let btree = self.write_chunks(dataset, chunk)?;
                let mut layout = vec![3, 2, chunk.len() as u8 + 1];
                layout.extend_from_slice(&btree.to_le_bytes());
                for c in chunk {
                    layout.extend_from_slice(&(*c as u32).to_le_bytes());
                }
                layout.extend_from_slice(&(element_size as u32).to_le_bytes());
                layout
            }
        };
        let messages = vec![
            (0x01, encode_dataspace(Some(dataset.shape.as_slice()))),
            (0x03, encode_datatype(&dataset.datatype)?),
            // fill value, version 2: late allocation, written on allocation, undefined
            (0x05, vec![2, 2, 0, 0]),
            (0x08, layout),
        ];
        self.object_header(&messages)
    }

    fn write_chunks(&mut self, dataset: &DatasetBuilder, chunk: &[usize]) -> Result<u64, H5Error> {
        let shape = &dataset.shape;
        let element_size = dataset.datatype.size();
        let grid: Vec<usize> = shape.iter().zip(chunk).map(|(d, c)| d.div_ceil(*c)).collect();
        let count = grid.iter().product::<usize>();
        if count > 2 * CHUNK_K {
            return Err(H5Error::Unsupported(format!("{} chunks in one dataset", count)));
        }
        let chunk_bytes = chunk.iter().product::<usize>() * element_size;
        let mut written = vec![];
        for i in 0..count {
            let mut rem = i;
            let mut offset = vec![0; shape.len()];
            for axis in (0..shape.len()).rev() {
                offset[axis] = (rem % grid[axis]) * chunk[axis];
                rem /= grid[axis];
            }
            let data = extract_chunk(&dataset.bytes, shape, chunk, &offset, element_size);
            written.push((offset, self.alloc(&data)));
        }

        let mut node = b"TREE".to_vec();
        node.extend_from_slice(&[1, 0]);
        node.extend_from_slice(&(written.len() as u16).to_le_bytes());
        node.extend_from_slice(&UNDEFINED.to_le_bytes());
        node.extend_from_slice(&UNDEFINED.to_le_bytes());
        let key = |node: &mut Vec<u8>, size: usize, offset: &[usize]| {
            node.extend_from_slice(&(size as u32).to_le_bytes());
            node.extend_from_slice(&0u32.to_le_bytes());
            for o in offset {
                node.extend_from_slice(&(*o as u64).to_le_bytes());
            }
            node.extend_from_slice(&0u64.to_le_bytes());
        };
        for (offset, address) in &written {
            key(&mut node, chunk_bytes, offset);
            node.extend_from_slice(&address.to_le_bytes());
        }
        key(&mut node, 0, shape);
        Ok(self.alloc(&node))
    }
}

fn extract_chunk(data: &[u8], shape: &[usize], chunk: &[usize], offset: &[usize], element_size: usize) -> Vec<u8> {
    let count = chunk.iter().product::<usize>();
    let mut out = vec![0u8; count * element_size];
    let mut index = vec![0usize; chunk.len()];
    for i in 0..count {
        let inside = (0..chunk.len()).all(|axis| offset[axis] + index[axis] < shape[axis]);
        if inside {
            let src = (0..chunk.len()).fold(0, |acc, axis| acc * shape[axis] + offset[axis] + index[axis]);
            out[i * element_size..(i + 1) * element_size].copy_from_slice(&data[src * element_size..(src + 1) * element_size]);
        }
        for axis in (0..chunk.len()).rev() {
            index[axis] += 1;
            if index[axis] < chunk[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdf5::{AttrValue, File};
    use onnx_graph::tensor::{Shape, TensorDataValue};

    fn floats(values: Vec<f32>, shape: Vec<usize>) -> TensorData {
        TensorData::new(TensorDataValue::F32(values), Shape::from(shape)).unwrap()
    }

    #[test]
    fn nested_groups_and_attributes_read_back() {
        let mut builder = H5Builder::new();
        builder.root().attr_str("model_config", "{\"class_name\": \"Sequential\"}").attr_bytes("backend", "tensorflow");
        builder.root().group("model_weights/dense").attr_strings("weight_names", &["dense/kernel:0", "dense/bias:0"]);
        builder.root().group("model_weights").attr_i64s("counts", &[3, -1]);
        builder.root().group("model_weights/dense/dense").dataset("bias:0", &floats(vec![0.5, -0.5], vec![2])).unwrap();

        let file = File::from_bytes(builder.build().unwrap()).unwrap();
        assert_eq!(file.superblock_version(), 0);
        let root = file.root().unwrap();
        assert_eq!(root.attr("model_config").unwrap().unwrap().as_string(), Some("{\"class_name\": \"Sequential\"}"));
        assert_eq!(root.attr("backend").unwrap().unwrap().as_string(), Some("tensorflow"));
        assert!(root.attr("missing").unwrap().is_none());

        let weights = root.group("model_weights").unwrap();
        assert_eq!(weights.attr("counts").unwrap().unwrap().value, AttrValue::Ints(vec![3, -1]));
        let dense = weights.group("dense").unwrap();
        assert_eq!(dense.attr("weight_names").unwrap().unwrap().strings().unwrap(), &["dense/kernel:0".to_string(), "dense/bias:0".to_string()]);

        let bias = root.dataset("model_weights/dense/dense/bias:0").unwrap();
        assert_eq!(bias.shape(), vec![2]);
        assert_eq!(bias.datatype(), &Datatype::Float { size: 4, big_endian: false });
        let raw = bias.read_raw().unwrap();
        assert_eq!(raw, [0.5f32.to_le_bytes(), (-0.5f32).to_le_bytes()].concat());

        assert!(root.has_member("model_weights/dense/dense").unwrap());
        assert!(!root.has_member("model_weights/conv").unwrap());
        assert!(matches!(root.group("model_weights/dense/dense/bias:0"), Err(H5Error::TypeMismatch(_))));
        assert!(matches!(root.dataset("model_weights/dense"), Err(H5Error::TypeMismatch(_))));
    }

    #[test]
    fn large_groups_span_several_symbol_nodes() {
        let mut builder = H5Builder::new();
        let names: Vec<String> = (0..20).map(|i| format!("layer_{:02}", i)).collect();
        for name in &names {
            builder.root().group(name);
        }
        let file = File::from_bytes(builder.build().unwrap()).unwrap();
        assert_eq!(file.root().unwrap().member_names().unwrap(), names);
    }

    #[test]
    fn chunked_datasets_are_reassembled() {
        let values: Vec<f32> = (0..15).map(|i| i as f32).collect();
        let mut builder = H5Builder::new();
        builder.root().chunked_dataset("kernel", &floats(values.clone(), vec![3, 5]), &[2, 2]).unwrap();
        let file = File::from_bytes(builder.build().unwrap()).unwrap();
        let raw = file.root().unwrap().dataset("kernel").unwrap().read_raw().unwrap();
        let expected: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(raw, expected);
    }

    #[test]
    fn file_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("h5-writer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("weights.h5");
        let mut builder = H5Builder::new();
        builder.root().dataset("x", &floats(vec![1.0; 4], vec![2, 2])).unwrap();
        builder.write(&path).unwrap();
        let file = File::open(&path).unwrap();
        assert_eq!(file.root().unwrap().dataset("x").unwrap().shape(), vec![2, 2]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
