use std::collections::{HashSet, VecDeque};
use crate::hdf5::reader::{Cursor, Sizes};
use crate::hdf5::{File, H5Error};

pub(crate) const MSG_NIL: u16 = 0x0000;
pub(crate) const MSG_DATASPACE: u16 = 0x0001;
pub(crate) const MSG_LINK_INFO: u16 = 0x0002;
pub(crate) const MSG_DATATYPE: u16 = 0x0003;
pub(crate) const MSG_LINK: u16 = 0x0006;
pub(crate) const MSG_LAYOUT: u16 = 0x0008;
pub(crate) const MSG_FILTER_PIPELINE: u16 = 0x000B;
pub(crate) const MSG_ATTRIBUTE: u16 = 0x000C;
pub(crate) const MSG_CONTINUATION: u16 = 0x0010;
pub(crate) const MSG_SYMBOL_TABLE: u16 = 0x0011;
pub(crate) const MSG_ATTRIBUTE_INFO: u16 = 0x0015;

/// Bit in a message's flags marking it as stored in the shared message heap.
const MSG_FLAG_SHARED: u8 = 0x02;

#[derive(Clone, Debug)]
pub(crate) struct Message<'a> {
    pub kind: u16,
    pub flags: u8,
    pub data: &'a [u8],
}

impl Message<'_> {
    pub fn is_shared(&self) -> bool {
        self.flags & MSG_FLAG_SHARED != 0
    }
}

/// Every message of one object, with continuation blocks already followed.
#[derive(Clone, Debug)]
pub(crate) struct ObjectHeader<'a> {
    pub address: u64,
    pub messages: Vec<Message<'a>>,
}

impl<'a> ObjectHeader<'a> {
    pub fn read(file: &'a File, address: u64) -> Result<Self, H5Error> {
        let mut c = file.cursor(address)?;
        let mut blocks = VecDeque::new();
        let v2 = c.remaining() >= 4 && c.bytes(4)? == b"OHDR";

        let creation_order = if v2 {
            let version = c.u8()?;
            if version != 2 {
                return Err(H5Error::Unsupported(format!("object header version {}", version)));
            }
            let flags = c.u8()?;
            if flags & 0x20 != 0 {
                c.skip(16)?;
            }
            if flags & 0x10 != 0 {
                c.skip(4)?;
            }
            let size = c.uint(1 << (flags & 0x03))? as usize;
            blocks.push_back(c.bytes(size)?);
            flags & 0x04 != 0
        } else {
            let mut c = file.cursor(address)?;
            let version = c.u8()?;
            if version != 1 {
                return Err(H5Error::Unsupported(format!("object header version {}", version)));
            }
            c.skip(1)?;
            c.u16()?; // message count, continuation messages included
            c.u32()?; // reference count
            let size = c.u32()? as usize;
            c.skip(4)?; // messages are 8-byte aligned
            blocks.push_back(c.bytes(size)?);
            false
        };

        let mut messages = vec![];
        let mut visited = HashSet::new();
        while let Some(block) = blocks.pop_front() {
            let continuations = if v2 {
                parse_v2_block(block, file.sizes(), creation_order, &mut messages)?
            } else {
                parse_v1_block(block, file.sizes(), &mut messages)?
            };
            for (offset, length) in continuations {
                if !visited.insert(offset) {
                    return Err(H5Error::Corrupt(format!("object header continuation loop at {}", offset)));
                }
                let data = file.slice(offset, length as usize)?;
                if v2 {
                    if data.len() < 8 || &data[..4] != b"OCHK" {
                        return Err(H5Error::Corrupt(format!("bad continuation block at {}", offset)));
                    }
                    // trailing checksum
                    blocks.push_back(&data[4..data.len() - 4]);
                } else {
                    blocks.push_back(data);
                }
            }
        }
        Ok(Self { address, messages })
    }

    pub fn find(&self, kind: u16) -> Option<&Message<'a>> {
        self.messages.iter().find(|m| m.kind == kind)
    }

    pub fn all(&self, kind: u16) -> impl Iterator<Item = &Message<'a>> {
        self.messages.iter().filter(move |m| m.kind == kind)
    }

    pub fn has(&self, kind: u16) -> bool {
        self.find(kind).is_some()
    }

    pub fn is_dataset(&self) -> bool {
        self.has(MSG_LAYOUT)
    }
}

fn parse_continuation(data: &[u8], sizes: Sizes) -> Result<(u64, u64), H5Error> {
    let mut c = Cursor::new(data, 0, sizes);
    let offset = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined continuation address".to_string()))?;
    let length = c.length()?;
    Ok((offset, length))
}

fn parse_v1_block<'a>(block: &'a [u8], sizes: Sizes, messages: &mut Vec<Message<'a>>) -> Result<Vec<(u64, u64)>, H5Error> {
    let mut c = Cursor::new(block, 0, sizes);
    let mut continuations = vec![];
    while c.remaining() >= 8 {
        let kind = c.u16()?;
        let size = c.u16()? as usize;
        let flags = c.u8()?;
        c.skip(3)?;
        let data = c.bytes(size)?;
        match kind {
            MSG_NIL => {}
            MSG_CONTINUATION => continuations.push(parse_continuation(data, sizes)?),
            _ => messages.push(Message { kind, flags, data }),
        }
    }
    Ok(continuations)
}

fn parse_v2_block<'a>(block: &'a [u8], sizes: Sizes, creation_order: bool, messages: &mut Vec<Message<'a>>) -> Result<Vec<(u64, u64)>, H5Error> {
    let header_len = if creation_order { 6 } else { 4 };
    let mut c = Cursor::new(block, 0, sizes);
    let mut continuations = vec![];
    // a gap shorter than a message header may trail the last message
    while c.remaining() >= header_len {
        let kind = c.u8()? as u16;
        let size = c.u16()? as usize;
        let flags = c.u8()?;
        if creation_order {
            c.skip(2)?;
        }
        let data = c.bytes(size)?;
        match kind {
            MSG_NIL => {}
            MSG_CONTINUATION => continuations.push(parse_continuation(data, sizes)?),
            _ => messages.push(Message { kind, flags, data }),
        }
    }
    Ok(continuations)
}
