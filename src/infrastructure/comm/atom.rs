//! Atom Codec
//!
//! Every payload on the wire is a fixed, ordered sequence of typed values
//! ("atoms"). Atoms carry no type tag: the layout is defined by a format
//! descriptor that both sides know in advance for each message type.
//!
//! # Atom Encoding
//!
//! ```text
//! STRING            : u16 byte length (BE) + UTF-8 bytes
//! INT32             : 4 bytes, big-endian
//! BYTE              : 1 byte
//! INT32_ARRAY       : u16 count + count * INT32
//! STRING_ARRAY      : u16 count + count * STRING
//! BOOL_ARRAY        : u16 count + count * (0x00 | 0x01)
//! BYTE_ARRAY_ARRAY  : u16 count + count * (u16 length + bytes)
//! ```

use crate::error::{Error, Result};

/// Kind of a single atom slot in a format descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    String,
    Int32,
    Byte,
    Int32Array,
    StringArray,
    BoolArray,
    ByteArrayArray,
}

/// One typed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    String(String),
    Int32(i32),
    Byte(u8),
    Int32Array(Vec<i32>),
    StringArray(Vec<String>),
    BoolArray(Vec<bool>),
    ByteArrayArray(Vec<Vec<u8>>),
}

impl Atom {
    /// The kind of this atom
    pub fn kind(&self) -> AtomKind {
        match self {
            Self::String(_) => AtomKind::String,
            Self::Int32(_) => AtomKind::Int32,
            Self::Byte(_) => AtomKind::Byte,
            Self::Int32Array(_) => AtomKind::Int32Array,
            Self::StringArray(_) => AtomKind::StringArray,
            Self::BoolArray(_) => AtomKind::BoolArray,
            Self::ByteArrayArray(_) => AtomKind::ByteArrayArray,
        }
    }

    /// Zero value for a kind
    pub fn empty(kind: AtomKind) -> Self {
        match kind {
            AtomKind::String => Self::String(String::new()),
            AtomKind::Int32 => Self::Int32(0),
            AtomKind::Byte => Self::Byte(0),
            AtomKind::Int32Array => Self::Int32Array(Vec::new()),
            AtomKind::StringArray => Self::StringArray(Vec::new()),
            AtomKind::BoolArray => Self::BoolArray(Vec::new()),
            AtomKind::ByteArrayArray => Self::ByteArrayArray(Vec::new()),
        }
    }
}

/// An ordered set of atoms bound to one format descriptor.
///
/// The number of slots and the kind of each slot never change after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomBuffer {
    format: &'static [AtomKind],
    atoms: Vec<Atom>,
}

impl AtomBuffer {
    /// Create a buffer filled with zero values
    pub fn new(format: &'static [AtomKind]) -> Self {
        Self {
            format,
            atoms: format.iter().map(|kind| Atom::empty(*kind)).collect(),
        }
    }

    /// Create a buffer from prepared atoms, checking them against `format`
    pub fn from_atoms(format: &'static [AtomKind], atoms: Vec<Atom>) -> Result<Self> {
        if atoms.len() != format.len() {
            return Err(Error::malformed(format!(
                "expected {} atoms, got {}",
                format.len(),
                atoms.len()
            )));
        }
        for (index, (atom, kind)) in atoms.iter().zip(format).enumerate() {
            if atom.kind() != *kind {
                return Err(Error::malformed(format!(
                    "atom {} is {:?}, format wants {:?}",
                    index,
                    atom.kind(),
                    kind
                )));
            }
        }
        Ok(Self { format, atoms })
    }

    /// Replace the atom at `index`; the kind must match the slot
    pub fn set(&mut self, index: usize, atom: Atom) -> Result<()> {
        let kind = self
            .format
            .get(index)
            .ok_or_else(|| Error::malformed(format!("no atom slot {}", index)))?;
        if atom.kind() != *kind {
            return Err(Error::malformed(format!(
                "atom slot {} holds {:?}, not {:?}",
                index,
                kind,
                atom.kind()
            )));
        }
        self.atoms[index] = atom;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Atom> {
        self.atoms.get(index)
    }

    pub fn format(&self) -> &'static [AtomKind] {
        self.format
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Consume the buffer into a sequential reader
    pub fn into_cursor(self) -> AtomCursor {
        AtomCursor {
            atoms: self.atoms.into_iter(),
            index: 0,
        }
    }
}

/// Sequential, typed access to the atoms of a decoded buffer
pub struct AtomCursor {
    atoms: std::vec::IntoIter<Atom>,
    index: usize,
}

impl AtomCursor {
    fn next_atom(&mut self) -> Result<Atom> {
        let atom = self
            .atoms
            .next()
            .ok_or_else(|| Error::malformed(format!("missing atom {}", self.index)))?;
        self.index += 1;
        Ok(atom)
    }

    fn mismatch(&self, wanted: AtomKind, got: &Atom) -> Error {
        Error::malformed(format!(
            "atom {} is {:?}, expected {:?}",
            self.index - 1,
            got.kind(),
            wanted
        ))
    }

    pub fn string(&mut self) -> Result<String> {
        match self.next_atom()? {
            Atom::String(v) => Ok(v),
            other => Err(self.mismatch(AtomKind::String, &other)),
        }
    }

    pub fn int32(&mut self) -> Result<i32> {
        match self.next_atom()? {
            Atom::Int32(v) => Ok(v),
            other => Err(self.mismatch(AtomKind::Int32, &other)),
        }
    }

    pub fn byte(&mut self) -> Result<u8> {
        match self.next_atom()? {
            Atom::Byte(v) => Ok(v),
            other => Err(self.mismatch(AtomKind::Byte, &other)),
        }
    }

    pub fn int32_array(&mut self) -> Result<Vec<i32>> {
        match self.next_atom()? {
            Atom::Int32Array(v) => Ok(v),
            other => Err(self.mismatch(AtomKind::Int32Array, &other)),
        }
    }

    pub fn string_array(&mut self) -> Result<Vec<String>> {
        match self.next_atom()? {
            Atom::StringArray(v) => Ok(v),
            other => Err(self.mismatch(AtomKind::StringArray, &other)),
        }
    }

    pub fn bool_array(&mut self) -> Result<Vec<bool>> {
        match self.next_atom()? {
            Atom::BoolArray(v) => Ok(v),
            other => Err(self.mismatch(AtomKind::BoolArray, &other)),
        }
    }

    pub fn byte_array_array(&mut self) -> Result<Vec<Vec<u8>>> {
        match self.next_atom()? {
            Atom::ByteArrayArray(v) => Ok(v),
            other => Err(self.mismatch(AtomKind::ByteArrayArray, &other)),
        }
    }
}

/// A value with a fixed atom layout
pub trait Serializable: Sized {
    /// Format descriptor of this value's payload
    const FORMAT: &'static [AtomKind];

    fn to_atoms(&self) -> Result<AtomBuffer>;

    fn from_atoms(atoms: AtomBuffer) -> Result<Self>;

    fn to_payload(&self) -> Result<Vec<u8>> {
        encode(&self.to_atoms()?, Self::FORMAT)
    }

    fn from_payload(bytes: &[u8]) -> Result<Self> {
        Self::from_atoms(decode(bytes, Self::FORMAT)?)
    }
}

/// Encode `buffer` according to `format`
pub fn encode(buffer: &AtomBuffer, format: &[AtomKind]) -> Result<Vec<u8>> {
    if buffer.format != format {
        return Err(Error::malformed("buffer does not match format descriptor"));
    }

    let mut out = Vec::new();
    for atom in &buffer.atoms {
        match atom {
            Atom::String(v) => put_string(&mut out, v)?,
            Atom::Int32(v) => out.extend_from_slice(&v.to_be_bytes()),
            Atom::Byte(v) => out.push(*v),
            Atom::Int32Array(v) => {
                put_len(&mut out, v.len())?;
                for i in v {
                    out.extend_from_slice(&i.to_be_bytes());
                }
            }
            Atom::StringArray(v) => {
                put_len(&mut out, v.len())?;
                for s in v {
                    put_string(&mut out, s)?;
                }
            }
            Atom::BoolArray(v) => {
                put_len(&mut out, v.len())?;
                out.extend(v.iter().map(|b| u8::from(*b)));
            }
            Atom::ByteArrayArray(v) => {
                put_len(&mut out, v.len())?;
                for bytes in v {
                    put_len(&mut out, bytes.len())?;
                    out.extend_from_slice(bytes);
                }
            }
        }
    }
    Ok(out)
}

/// Decode `bytes` according to `format`.
///
/// Fails if the data ends early, if a declared length runs past the end,
/// or if bytes are left over after the last atom.
pub fn decode(bytes: &[u8], format: &'static [AtomKind]) -> Result<AtomBuffer> {
    let mut reader = ByteReader::new(bytes);
    let mut atoms = Vec::with_capacity(format.len());

    for kind in format {
        let atom = match kind {
            AtomKind::String => Atom::String(reader.string()?),
            AtomKind::Int32 => Atom::Int32(reader.i32()?),
            AtomKind::Byte => Atom::Byte(reader.u8()?),
            AtomKind::Int32Array => {
                let count = reader.u16()? as usize;
                reader.ensure(count * 4)?;
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(reader.i32()?);
                }
                Atom::Int32Array(v)
            }
            AtomKind::StringArray => {
                let count = reader.u16()? as usize;
                // every element needs at least its length prefix
                reader.ensure(count * 2)?;
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(reader.string()?);
                }
                Atom::StringArray(v)
            }
            AtomKind::BoolArray => {
                let count = reader.u16()? as usize;
                let raw = reader.take(count)?;
                let mut v = Vec::with_capacity(count);
                for b in raw {
                    match b {
                        0 => v.push(false),
                        1 => v.push(true),
                        other => {
                            return Err(Error::malformed(format!("bad boolean byte {:#04x}", other)))
                        }
                    }
                }
                Atom::BoolArray(v)
            }
            AtomKind::ByteArrayArray => {
                let count = reader.u16()? as usize;
                reader.ensure(count * 2)?;
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = reader.u16()? as usize;
                    v.push(reader.take(len)?.to_vec());
                }
                Atom::ByteArrayArray(v)
            }
        };
        atoms.push(atom);
    }

    if reader.remaining() != 0 {
        return Err(Error::malformed(format!(
            "{} trailing bytes after last atom",
            reader.remaining()
        )));
    }

    Ok(AtomBuffer { format, atoms })
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u16::try_from(len).map_err(|_| Error::PayloadTooLarge(len))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    put_len(out, s.len())?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked reader over a payload
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::malformed(format!(
                "need {} bytes at offset {}, only {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| Error::malformed("string is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED: &[AtomKind] = &[
        AtomKind::String,
        AtomKind::Int32,
        AtomKind::Byte,
        AtomKind::Int32Array,
        AtomKind::StringArray,
        AtomKind::BoolArray,
        AtomKind::ByteArrayArray,
    ];

    fn mixed_buffer() -> AtomBuffer {
        AtomBuffer::from_atoms(
            MIXED,
            vec![
                Atom::String("Rhythmbox".to_string()),
                Atom::Int32(-2),
                Atom::Byte(5),
                Atom::Int32Array(vec![1, 70000]),
                Atom::StringArray(vec!["a".to_string(), "äö".to_string()]),
                Atom::BoolArray(vec![true, false]),
                Atom::ByteArrayArray(vec![vec![], vec![0xFF, 0x00]]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let buffer = AtomBuffer::from_atoms(
            &[AtomKind::String, AtomKind::Int32, AtomKind::Byte],
            vec![Atom::String("ab".into()), Atom::Int32(258), Atom::Byte(7)],
        )
        .unwrap();
        let bytes = encode(&buffer, buffer.format()).unwrap();
        assert_eq!(bytes, vec![0, 2, b'a', b'b', 0, 0, 1, 2, 7]);
    }

    #[test]
    fn test_round_trip_mixed() {
        let buffer = mixed_buffer();
        let bytes = encode(&buffer, MIXED).unwrap();
        let decoded = decode(&bytes, MIXED).unwrap();
        assert_eq!(decoded, buffer);
        assert_eq!(encode(&decoded, MIXED).unwrap(), bytes);
    }

    #[test]
    fn test_every_truncation_fails_cleanly() {
        let bytes = encode(&mixed_buffer(), MIXED).unwrap();
        for cut in 0..bytes.len() {
            let err = decode(&bytes[..cut], MIXED).unwrap_err();
            assert!(matches!(err, Error::MalformedPayload(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&mixed_buffer(), MIXED).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes, MIXED),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_declared_length_past_end() {
        // string claims 300 bytes, 2 present
        let bytes = [0x01, 0x2C, b'h', b'i'];
        assert!(decode(&bytes, &[AtomKind::String]).is_err());

        // int array claims 0xFFFF elements
        let bytes = [0xFF, 0xFF, 0, 0, 0, 1];
        assert!(decode(&bytes, &[AtomKind::Int32Array]).is_err());
    }

    #[test]
    fn test_empty_format_and_payload() {
        let decoded = decode(&[], &[]).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(encode(&decoded, &[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_bad_boolean_and_utf8() {
        assert!(decode(&[0, 1, 2], &[AtomKind::BoolArray]).is_err());
        assert!(decode(&[0, 1, 0xC3], &[AtomKind::String]).is_err());
    }

    #[test]
    fn test_oversized_string_rejected_on_encode() {
        let big = "x".repeat(u16::MAX as usize + 1);
        let buffer = AtomBuffer::from_atoms(&[AtomKind::String], vec![Atom::String(big)]).unwrap();
        assert_eq!(
            encode(&buffer, &[AtomKind::String]),
            Err(Error::PayloadTooLarge(u16::MAX as usize + 1))
        );
    }

    #[test]
    fn test_set_checks_kind() {
        let mut buffer = AtomBuffer::new(&[AtomKind::Int32]);
        assert!(buffer.set(0, Atom::Byte(1)).is_err());
        assert!(buffer.set(1, Atom::Int32(1)).is_err());
        buffer.set(0, Atom::Int32(9)).unwrap();
        assert_eq!(buffer.get(0), Some(&Atom::Int32(9)));
    }

    #[test]
    fn test_wrong_descriptor_on_encode() {
        let buffer = AtomBuffer::new(&[AtomKind::Int32]);
        assert!(encode(&buffer, &[AtomKind::Byte]).is_err());
    }

    #[test]
    fn test_cursor_kind_mismatch() {
        let mut cursor = mixed_buffer().into_cursor();
        assert!(cursor.int32().is_err());
        assert_eq!(cursor.int32().unwrap(), -2);
        assert_eq!(cursor.byte().unwrap(), 5);
    }
}
