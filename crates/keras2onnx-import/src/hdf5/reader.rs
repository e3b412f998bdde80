use crate::hdf5::H5Error;

pub(crate) const SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

/// Widths of file addresses and lengths, fixed per file by the superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Sizes {
    pub offset: usize,
    pub length: usize,
}

impl Default for Sizes {
    fn default() -> Self {
        Self { offset: 8, length: 8 }
    }
}

pub(crate) fn pad8(len: usize) -> usize {
    len.div_ceil(8) * 8
}

/// Little-endian reader over a byte slice.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    sizes: Sizes,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8], pos: usize, sizes: Sizes) -> Self {
        Self { data, pos, sizes }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], H5Error> {
        let end = self.pos.checked_add(n).ok_or(H5Error::Truncated(self.pos))?;
        if end > self.data.len() {
            return Err(H5Error::Truncated(self.pos));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), H5Error> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, H5Error> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, H5Error> {
        Ok(self.uint(2)? as u16)
    }

    pub fn u32(&mut self) -> Result<u32, H5Error> {
        Ok(self.uint(4)? as u32)
    }

    pub fn u64(&mut self) -> Result<u64, H5Error> {
        self.uint(8)
    }

    pub fn uint(&mut self, n: usize) -> Result<u64, H5Error> {
        if n > 8 {
            return Err(H5Error::Unsupported(format!("{}-byte integer field", n)));
        }
        let bytes = self.bytes(n)?;
        Ok(bytes.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    /// A file address; the all-ones pattern means "undefined".
    pub fn address(&mut self) -> Result<Option<u64>, H5Error> {
        let n = self.sizes.offset;
        let bytes = self.bytes(n)?;
        if bytes.iter().all(|b| *b == 0xff) {
            return Ok(None);
        }
        Ok(Some(bytes.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64)))
    }

    pub fn length(&mut self) -> Result<u64, H5Error> {
        self.uint(self.sizes.length)
    }

    pub fn signature(&mut self, expected: &[u8; 4]) -> Result<(), H5Error> {
        let at = self.pos;
        let found = self.bytes(4)?;
        if found != expected {
            return Err(H5Error::Corrupt(format!(
                "expected {} signature at offset {}",
                String::from_utf8_lossy(expected),
                at
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Superblock {
    pub version: u8,
    pub sizes: Sizes,
    pub base_address: u64,
    pub root_address: u64,
}

impl Superblock {
    /// Finds and parses the superblock. It sits at offset 0 or after a user block whose size is a
    /// power of two of at least 512.
    pub fn locate(data: &[u8]) -> Result<Self, H5Error> {
        let mut at = 0usize;
        loop {
            if at + SIGNATURE.len() > data.len() {
                return Err(H5Error::NotHdf5);
            }
            if data[at..at + SIGNATURE.len()] == SIGNATURE {
                return Self::parse(data, at);
            }
            at = if at == 0 { 512 } else { at * 2 };
        }
    }

    fn parse(data: &[u8], at: usize) -> Result<Self, H5Error> {
        let mut c = Cursor::new(data, at + SIGNATURE.len(), Sizes::default());
        let version = c.u8()?;
        match version {
            0 | 1 => {
                c.skip(4)?; // free-space, root entry, reserved, shared header versions
                let sizes = Sizes { offset: c.u8()? as usize, length: c.u8()? as usize };
                Self::check_sizes(sizes)?;
                c.skip(1)?;
                c.skip(4)?; // group leaf / internal K
                c.skip(4)?; // consistency flags
                if version == 1 {
                    c.skip(4)?;
                }
                let mut c = Cursor::new(data, c.position(), sizes);
                let base_address = c.address()?.unwrap_or(0);
                c.address()?; // free space info
                c.address()?; // end of file
                c.address()?; // driver info
                // root group symbol table entry
                c.address()?; // link name offset
                let root_address = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined root group address".to_string()))?;
                Ok(Self { version, sizes, base_address, root_address })
            }
            2 | 3 => {
                let sizes = Sizes { offset: c.u8()? as usize, length: c.u8()? as usize };
                Self::check_sizes(sizes)?;
                c.skip(1)?; // consistency flags
                let mut c = Cursor::new(data, c.position(), sizes);
                let base_address = c.address()?.unwrap_or(0);
                c.address()?; // superblock extension
                c.address()?; // end of file
                let root_address = c.address()?.ok_or_else(|| H5Error::Corrupt("undefined root group address".to_string()))?;
                Ok(Self { version, sizes, base_address, root_address })
            }
            v => Err(H5Error::Unsupported(format!("superblock version {}", v))),
        }
    }

    fn check_sizes(sizes: Sizes) -> Result<(), H5Error> {
        for size in [sizes.offset, sizes.length] {
            if ![2, 4, 8].contains(&size) {
                return Err(H5Error::Corrupt(format!("invalid field width {}", size)));
            }
        }
        Ok(())
    }
}
