use crate::hdf5::H5Error;
use crate::hdf5::reader::{Cursor, Sizes};

const MAX_NESTING: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringPadding {
    NullTerminate,
    NullPad,
    SpacePad,
}

/// The element type of a dataset or attribute, reduced to what weight files use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datatype {
    FixedPoint { size: usize, signed: bool, big_endian: bool },
    Float { size: usize, big_endian: bool },
    String { size: usize, padding: StringPadding },
    VarLenString,
    VarLenSequence { base: Box<Datatype> },
    Enum { base: Box<Datatype> },
    Other { class: u8, size: usize },
}

impl Datatype {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, H5Error> {
        Self::parse_at(&mut Cursor::new(data, 0, Sizes::default()), 0)
    }

    fn parse_at(c: &mut Cursor, depth: usize) -> Result<Self, H5Error> {
        if depth > MAX_NESTING {
            return Err(H5Error::Corrupt("datatype nested too deeply".to_string()));
        }
        let class_and_version = c.u8()?;
        let class = class_and_version & 0x0f;
        let bits = [c.u8()?, c.u8()?, c.u8()?];
        let size = c.u32()? as usize;
        Ok(match class {
            0 => {
                c.skip(4)?; // bit offset, precision
                Datatype::FixedPoint { size, signed: bits[0] & 0x08 != 0, big_endian: bits[0] & 0x01 != 0 }
            }
            1 => {
                if bits[0] & 0x40 != 0 {
                    return Err(H5Error::Unsupported("VAX floating point order".to_string()));
                }
                c.skip(12)?;
                Datatype::Float { size, big_endian: bits[0] & 0x01 != 0 }
            }
            3 => {
                let padding = match bits[0] & 0x0f {
                    0 => StringPadding::NullTerminate,
                    1 => StringPadding::NullPad,
                    _ => StringPadding::SpacePad,
                };
                Datatype::String { size, padding }
            }
            8 => {
                let base = Self::parse_at(c, depth + 1)?;
                Datatype::Enum { base: Box::new(base) }
            }
            9 => match bits[0] & 0x0f {
                1 => Datatype::VarLenString,
                _ => {
                    let base = Self::parse_at(c, depth + 1)?;
                    Datatype::VarLenSequence { base: Box::new(base) }
                }
            },
            class => Datatype::Other { class, size },
        })
    }

    /// Bytes per element as stored in the file.
    pub fn size(&self) -> usize {
        match self {
            Datatype::FixedPoint { size, .. } | Datatype::Float { size, .. } | Datatype::String { size, .. } => *size,
            Datatype::Other { size, .. } => *size,
            Datatype::Enum { base } => base.size(),
            // length, collection address, object index
            Datatype::VarLenString | Datatype::VarLenSequence { .. } => 16,
        }
    }

    pub fn is_big_endian(&self) -> bool {
        match self {
            Datatype::FixedPoint { big_endian, .. } | Datatype::Float { big_endian, .. } => *big_endian,
            Datatype::Enum { base } => base.is_big_endian(),
            _ => false,
        }
    }

    /// Numpy-style type string, used in error messages and dtype mapping.
    pub fn describe(&self) -> String {
        match self {
            Datatype::FixedPoint { size, signed: true, .. } => format!("int{}", size * 8),
            Datatype::FixedPoint { size, signed: false, .. } => format!("uint{}", size * 8),
            Datatype::Float { size, .. } => format!("float{}", size * 8),
            Datatype::String { size, .. } => format!("S{}", size),
            Datatype::VarLenString => "str".to_string(),
            Datatype::VarLenSequence { base } => format!("vlen<{}>", base.describe()),
            Datatype::Enum { base } => format!("enum<{}>", base.describe()),
            Datatype::Other { class, size } => format!("class{}[{}]", class, size),
        }
    }
}

/// Shape of a dataset or attribute. `dims` is empty for scalars.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Dataspace {
    pub dims: Vec<u64>,
    pub null: bool,
}

impl Dataspace {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self, H5Error> {
        let mut c = Cursor::new(data, 0, sizes);
        let version = c.u8()?;
        let rank = c.u8()? as usize;
        let _flags = c.u8()?;
        let null = match version {
            1 => {
                c.skip(5)?;
                false
            }
            2 => c.u8()? == 2,
            v => return Err(H5Error::Unsupported(format!("dataspace version {}", v))),
        };
        if null && rank != 0 {
            return Err(H5Error::Corrupt(format!("null dataspace with rank {}", rank)));
        }
        let dims = (0..rank).map(|_| c.length()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { dims, null })
    }

    pub fn num_elements(&self) -> Result<usize, H5Error> {
        if self.null {
            return Ok(0);
        }
        self.dims
            .iter()
            .try_fold(1usize, |count, dim| usize::try_from(*dim).ok().and_then(|dim| count.checked_mul(dim)))
            .ok_or_else(|| H5Error::Corrupt(format!("dataspace {:?} overflows", self.dims)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ieee_float() {
        let mut message = vec![0x11, 0x20, 0x1f, 0x00, 4, 0, 0, 0];
        message.extend_from_slice(&[0, 0, 32, 0, 23, 8, 0, 23, 127, 0, 0, 0]);
        let dtype = Datatype::parse(&message).unwrap();
        assert_eq!(dtype, Datatype::Float { size: 4, big_endian: false });
        assert_eq!(dtype.describe(), "float32");
    }

    #[test]
    fn parses_bool_enum_as_its_base() {
        let mut message = vec![0x18, 0x02, 0x00, 0x00, 1, 0, 0, 0];
        message.extend_from_slice(&[0x10, 0x08, 0x00, 0x00, 1, 0, 0, 0, 0, 0, 8, 0]);
        let dtype = Datatype::parse(&message).unwrap();
        assert_eq!(dtype.size(), 1);
        assert_eq!(dtype.describe(), "enum<int8>");
    }

    #[test]
    fn scalar_dataspace_has_one_element() {
        let space = Dataspace::parse(&[1, 0, 0, 0, 0, 0, 0, 0], Sizes::default()).unwrap();
        assert!(space.dims.is_empty());
        assert_eq!(space.num_elements().unwrap(), 1);
        let null = Dataspace::parse(&[2, 0, 0, 2], Sizes::default()).unwrap();
        assert_eq!(null.num_elements().unwrap(), 0);
    }

    #[test]
    fn oversized_dataspace_is_corrupt() {
        let mut message = vec![1, 2, 0, 0, 0, 0, 0, 0];
        message.extend_from_slice(&u64::MAX.to_le_bytes());
        message.extend_from_slice(&4u64.to_le_bytes());
        let space = Dataspace::parse(&message, Sizes::default()).unwrap();
        assert!(matches!(space.num_elements(), Err(H5Error::Corrupt(_))));
        assert!(matches!(Dataspace::parse(&[2, 1, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0], Sizes::default()), Err(H5Error::Corrupt(_))));
    }

    #[test]
    fn self_nesting_enum_is_rejected() {
        let message: Vec<u8> = std::iter::repeat([0x18u8, 0, 0, 0, 1, 0, 0, 0]).take(64).flatten().collect();
        assert!(matches!(Datatype::parse(&message), Err(H5Error::Corrupt(_))));
    }
}
