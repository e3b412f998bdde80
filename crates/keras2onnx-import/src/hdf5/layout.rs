use std::collections::HashSet;
use crate::hdf5::reader::{Cursor, Sizes};
use crate::hdf5::{File, H5Error};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChunkIndex {
    /// Version 1 B-tree keyed by chunk offset.
    BTree(u64),
    /// A single chunk holding the whole dataset.
    Single(u64),
    /// Chunks stored back to back in row-major chunk order.
    Implicit(u64),
}

/// Where a dataset's raw data lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Layout<'a> {
    Compact(&'a [u8]),
    Contiguous { address: Option<u64>, size: u64 },
    Chunked { index: Option<ChunkIndex>, chunk: Vec<u64> },
}

impl<'a> Layout<'a> {
    pub fn parse(data: &'a [u8], sizes: Sizes) -> Result<Self, H5Error> {
        let mut c = Cursor::new(data, 0, sizes);
        let version = c.u8()?;
        match version {
            1 | 2 => {
                let rank = c.u8()? as usize;
                let class = c.u8()?;
                c.skip(5)?;
                let address = if class != 0 { c.address()? } else { None };
                let dims = (0..rank).map(|_| c.u32().map(|d| d as u64)).collect::<Result<Vec<_>, _>>()?;
                match class {
                    0 => {
                        let size = c.u32()? as usize;
                        Ok(Layout::Compact(c.bytes(size)?))
                    }
                    1 => {
                        let size = dims
                            .iter()
                            .try_fold(1u64, |size, dim| size.checked_mul(*dim))
                            .ok_or_else(|| H5Error::Corrupt(format!("contiguous layout {:?} overflows", dims)))?;
                        Ok(Layout::Contiguous { address, size })
                    }
                    2 => Ok(Layout::Chunked { index: address.map(ChunkIndex::BTree), chunk: chunk_dims(dims)? }),
                    c => Err(H5Error::Unsupported(format!("storage layout class {}", c))),
                }
            }
            3 | 4 => {
                let class = c.u8()?;
                match class {
                    0 => {
                        let size = c.u16()? as usize;
                        Ok(Layout::Compact(c.bytes(size)?))
                    }
                    1 => {
                        let address = c.address()?;
                        let size = c.length()?;
                        Ok(Layout::Contiguous { address, size })
                    }
                    2 if version == 3 => {
                        let rank = c.u8()? as usize;
                        let address = c.address()?;
                        let dims = (0..rank).map(|_| c.u32().map(|d| d as u64)).collect::<Result<Vec<_>, _>>()?;
                        Ok(Layout::Chunked { index: address.map(ChunkIndex::BTree), chunk: chunk_dims(dims)? })
                    }
                    2 => {
                        let flags = c.u8()?;
                        let rank = c.u8()? as usize;
                        let encoded = c.u8()? as usize;
                        let dims = (0..rank).map(|_| c.uint(encoded)).collect::<Result<Vec<_>, _>>()?;
                        let index_type = c.u8()?;
                        let index = match index_type {
                            1 => {
                                if flags & 0x02 != 0 {
                                    c.length()?;
                                    c.u32()?;
                                }
                                c.address()?.map(ChunkIndex::Single)
                            }
                            2 => c.address()?.map(ChunkIndex::Implicit),
                            t => return Err(H5Error::Unsupported(format!("chunk index type {}", t))),
                        };
                        Ok(Layout::Chunked { index, chunk: chunk_dims(dims)? })
                    }
                    c => Err(H5Error::Unsupported(format!("storage layout class {}", c))),
                }
            }
            v => Err(H5Error::Unsupported(format!("data layout version {}", v))),
        }
    }

    /// Reads `count` elements of `element_size` bytes laid out over `shape`.
    pub fn read(&self, file: &'a File, shape: &[u64], element_size: usize, count: usize) -> Result<Vec<u8>, H5Error> {
        let total = count
            .checked_mul(element_size)
            .ok_or_else(|| H5Error::Corrupt(format!("{} elements of {} bytes overflow", count, element_size)))?;
        // Nothing larger than the file can be stored in it, even as a zero fill.
        if total > file.file_size() {
            return Err(H5Error::Corrupt(format!("dataset of {} bytes in a file of {} bytes", total, file.file_size())));
        }
        if total == 0 {
            return Ok(vec![]);
        }
        match self {
            Layout::Compact(data) => {
                if data.len() < total {
                    return Err(H5Error::Corrupt(format!("compact data holds {} of {} bytes", data.len(), total)));
                }
                Ok(data[..total].to_vec())
            }
            // Storage is allocated lazily, so an unwritten dataset reads as its zero fill.
            Layout::Contiguous { address: None, .. } => Ok(vec![0; total]),
            Layout::Contiguous { address: Some(address), .. } => Ok(file.slice(*address, total)?.to_vec()),
            Layout::Chunked { index: None, .. } => Ok(vec![0; total]),
            Layout::Chunked { index: Some(index), chunk } => {
                if chunk.len() != shape.len() {
                    return Err(H5Error::Corrupt(format!("chunk rank {} for dataset rank {}", chunk.len(), shape.len())));
                }
                let chunk_bytes = chunk
                    .iter()
                    .try_fold(element_size, |bytes, dim| usize::try_from(*dim).ok().and_then(|dim| bytes.checked_mul(dim)))
                    .ok_or_else(|| H5Error::Corrupt(format!("chunk {:?} overflows", chunk)))?;
                let mut out = vec![0; total];
                match index {
                    ChunkIndex::Single(address) => {
                        let data = file.slice(*address, chunk_bytes)?;
                        copy_chunk(&mut out, data, shape, chunk, &vec![0; shape.len()], element_size);
                    }
                    ChunkIndex::Implicit(address) => {
                        let grid: Vec<u64> = shape.iter().zip(chunk).map(|(d, c)| d.div_ceil(*c)).collect();
                        // every chunk is at least one element, so the grid is no larger than the dataset
                        let n = grid.iter().product::<u64>();
                        for i in 0..n {
                            let mut rem = i;
                            let mut offset = vec![0; shape.len()];
                            for axis in (0..shape.len()).rev() {
                                offset[axis] = (rem % grid[axis]) * chunk[axis];
                                rem /= grid[axis];
                            }
                            let at = (chunk_bytes as u64)
                                .checked_mul(i)
                                .and_then(|delta| address.checked_add(delta))
                                .ok_or_else(|| H5Error::Corrupt(format!("chunk {} address overflows", i)))?;
                            let data = file.slice(at, chunk_bytes)?;
                            copy_chunk(&mut out, data, shape, chunk, &offset, element_size);
                        }
                    }
                    ChunkIndex::BTree(address) => {
                        let mut chunks = vec![];
                        collect_btree_chunks(file, *address, shape.len(), &mut chunks, &mut HashSet::new(), 0)?;
                        for (offset, chunk_address, size) in chunks {
                            if size as usize != chunk_bytes {
                                return Err(H5Error::Unsupported("filtered chunk".to_string()));
                            }
                            let data = file.slice(chunk_address, chunk_bytes)?;
                            copy_chunk(&mut out, data, shape, chunk, &offset, element_size);
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

/// The stored chunk dimensions end with the element size, which is dropped.
fn chunk_dims(mut dims: Vec<u64>) -> Result<Vec<u64>, H5Error> {
    if dims.pop().is_none() || dims.iter().any(|d| *d == 0) {
        return Err(H5Error::Corrupt("invalid chunk dimensions".to_string()));
    }
    Ok(dims)
}

const MAX_BTREE_DEPTH: usize = 32;

type ChunkEntry = (Vec<u64>, u64, u32);

fn collect_btree_chunks(
    file: &File,
    address: u64,
    rank: usize,
    out: &mut Vec<ChunkEntry>,
    visited: &mut HashSet<u64>,
    depth: usize,
) -> Result<(), H5Error> {
    if depth > MAX_BTREE_DEPTH {
        return Err(H5Error::Corrupt("chunk B-tree too deep".to_string()));
    }
    if !visited.insert(address) {
        return Err(H5Error::Corrupt(format!("chunk B-tree node {} reached twice", address)));
    }
    let mut c = file.cursor(address)?;
    c.signature(b"TREE")?;
    let node_type = c.u8()?;
    if node_type != 1 {
        return Err(H5Error::Corrupt(format!("expected chunk B-tree node, found type {}", node_type)));
    }
    let level = c.u8()?;
    let entries = c.u16()? as usize;
    c.address()?;
    c.address()?;
    for _ in 0..entries {
        let size = c.u32()?;
        let _filter_mask = c.u32()?;
        let offset = (0..rank).map(|_| c.u64()).collect::<Result<Vec<_>, _>>()?;
        c.u64()?;
        let child = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined chunk address".to_string()))?;
        if level == 0 {
            out.push((offset, child, size));
        } else {
            collect_btree_chunks(file, child, rank, out, visited, depth + 1)?;
        }
    }
    Ok(())
}

/// Copies one chunk into the dataset buffer, clipping edge chunks to the dataset bounds.
pub(crate) fn copy_chunk(out: &mut [u8], chunk_data: &[u8], shape: &[u64], chunk: &[u64], offset: &[u64], element_size: usize) {
    let rank = shape.len();
    if rank == 0 {
        let n = element_size.min(chunk_data.len()).min(out.len());
        out[..n].copy_from_slice(&chunk_data[..n]);
        return;
    }
    if offset.iter().zip(shape).any(|(o, d)| o >= d) {
        return;
    }
    let last = rank - 1;
    let row = (chunk[last].min(shape[last] - offset[last])) as usize * element_size;
    let outer: Vec<u64> = (0..last).map(|i| chunk[i].min(shape[i] - offset[i])).collect();
    let mut index = vec![0u64; last];
    loop {
        let mut src = 0u64;
        let mut dst = 0u64;
        for i in 0..last {
            src = src * chunk[i] + index[i];
            dst = dst * shape[i] + offset[i] + index[i];
        }
        let src = (src * chunk[last]) as usize * element_size;
        let dst = (dst * shape[last] + offset[last]) as usize * element_size;
        out[dst..dst + row].copy_from_slice(&chunk_data[src..src + row]);

        let mut axis = last;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < outer[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_chunks_are_clipped() {
        // 3x3 dataset of u8, 2x2 chunks
        let shape = [3, 3];
        let chunk = [2, 2];
        let mut out = vec![0u8; 9];
        copy_chunk(&mut out, &[1, 2, 4, 5], &shape, &chunk, &[0, 0], 1);
        copy_chunk(&mut out, &[3, 0, 6, 0], &shape, &chunk, &[0, 2], 1);
        copy_chunk(&mut out, &[7, 8, 0, 0], &shape, &chunk, &[2, 0], 1);
        copy_chunk(&mut out, &[9, 0, 0, 0], &shape, &chunk, &[2, 2], 1);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn parses_v3_contiguous_layout() {
        let mut message = vec![3, 1];
        message.extend_from_slice(&0x800u64.to_le_bytes());
        message.extend_from_slice(&24u64.to_le_bytes());
        let layout = Layout::parse(&message, Sizes::default()).unwrap();
        assert_eq!(layout, Layout::Contiguous { address: Some(0x800), size: 24 });
    }
}
