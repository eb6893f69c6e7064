use std::convert::TryInto;
use std::str::FromStr;

/// How unsigned integers are written to frames.
///
/// Both peers must agree on the encoding; frame headers do not carry it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VarintEncoding {
    /// Base-128 groups for the low 56 bits, then one full byte for the top 8 bits.
    ///
    /// Byte-identical to LEB128 below `2^63`. At or above it, the ninth byte carries
    /// eight value bits and no continuation flag, which a plain LEB128 decoder misreads.
    Compat,

    /// Standard unbounded LEB128 (up to 10 bytes for a `u64`)
    Leb128,
}

impl Default for VarintEncoding {
    fn default() -> Self {
        VarintEncoding::Compat
    }
}

impl VarintEncoding {
    pub fn as_str(&self) -> &str {
        match self {
            VarintEncoding::Compat => "compat",
            VarintEncoding::Leb128 => "leb128",
        }
    }
}

impl FromStr for VarintEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compat" => Ok(VarintEncoding::Compat),
            "leb128" => Ok(VarintEncoding::Leb128),
            _ => Err(format!("unknown varint encoding '{}'", s)),
        }
    }
}

pub mod compat {
    /// Number of 7-bit groups before the trailing full byte
    pub const GROUPS: usize = 8;

    /// Maximum encoded length of a `u64`
    pub const MAX_LEN: usize = GROUPS + 1;

    pub fn u64_buffer() -> [u8; MAX_LEN] {
        [0; MAX_LEN]
    }

    /// Encodes `value` into `buffer`, returning the written prefix.
    pub fn encode_u64(mut value: u64, buffer: &mut [u8; MAX_LEN]) -> &[u8] {
        let mut n = 0;
        for _ in 0..GROUPS {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            buffer[n] = byte;
            n += 1;
            if value == 0 {
                break;
            }
        }

        // Whatever survived eight groups fits in one plain byte
        if value != 0 {
            buffer[n] = value as u8;
            n += 1;
        }
        &buffer[..n]
    }

    /// Decodes a value from the front of `input`, returning it with the unread tail.
    pub fn decode_u64(input: &[u8]) -> Option<(u64, &[u8])> {
        let mut value = 0u64;
        for (i, byte) in input.iter().enumerate() {
            if i == GROUPS {
                value |= u64::from(*byte) << (7 * GROUPS);
                return Some((value, &input[i + 1..]));
            }
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Some((value, &input[i + 1..]));
            }
        }
        None
    }
}

/// Builds one frame in memory.
pub struct FrameWriter {
    output: Vec<u8>,
    varint: VarintEncoding,
}

impl FrameWriter {
    pub fn sized_for(num_bytes: usize, varint: VarintEncoding) -> Self {
        Self {
            output: Vec::with_capacity(num_bytes),
            varint,
        }
    }

    pub fn write_magic(&mut self, magic: &[u8]) {
        self.output.extend_from_slice(magic);
    }

    pub fn write_u64(&mut self, value: u64) {
        match self.varint {
            VarintEncoding::Compat => {
                let mut buffer = compat::u64_buffer();
                let encoded = compat::encode_u64(value, &mut buffer);
                self.output.extend_from_slice(encoded);
            }
            VarintEncoding::Leb128 => {
                let mut buffer = unsigned_varint::encode::u64_buffer();
                let encoded = unsigned_varint::encode::u64(value, &mut buffer);
                self.output.extend_from_slice(encoded);
            }
        }
    }

    pub fn write_usize(&mut self, value: usize) {
        self.write_u64(value as u64);
    }

    /// Writes a float as 8 little-endian bytes
    pub fn write_f64(&mut self, value: f64) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a length-prefixed UTF-8 string, unescaped
    pub fn write_str(&mut self, value: &str) {
        self.write_usize(value.len());
        self.output.extend_from_slice(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.output
    }
}

/// Reads primitives from the front of a frame stream.
pub struct FrameReader<'a> {
    input: &'a [u8],
    consumed: usize,
    varint: VarintEncoding,
}

impl<'a> FrameReader<'a> {
    pub fn new(input: &'a [u8], varint: VarintEncoding) -> Self {
        Self {
            input,
            consumed: 0,
            varint,
        }
    }

    /// Number of bytes read so far
    pub fn offset(&self) -> usize {
        self.consumed
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn starts_with(&self, magic: &[u8]) -> bool {
        self.input.starts_with(magic)
    }

    /// Consumes `magic` if the input begins with it.
    pub fn read_magic(&mut self, magic: &[u8]) -> bool {
        if self.starts_with(magic) {
            self.advance(magic.len());
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn read_u64(&mut self) -> Option<u64> {
        let (head, tail) = match self.varint {
            VarintEncoding::Compat => compat::decode_u64(self.input)?,
            VarintEncoding::Leb128 => unsigned_varint::decode::u64(self.input).ok()?,
        };
        self.consumed += self.input.len() - tail.len();
        self.input = tail;
        Some(head)
    }

    pub fn read_usize(&mut self) -> Option<usize> {
        self.read_u64()?.try_into().ok()
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        let bytes = self.read_bytes(std::mem::size_of::<f64>())?;
        Some(f64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.input.len() < len {
            return None;
        }
        let (head, tail) = self.input.split_at(len);
        self.consumed += len;
        self.input = tail;
        Some(head)
    }

    /// Reads a length-prefixed byte string
    pub fn read_str(&mut self) -> Option<&'a [u8]> {
        let len = self.read_usize()?;
        self.read_bytes(len)
    }

    fn advance(&mut self, len: usize) {
        self.input = &self.input[len..];
        self.consumed += len;
    }
}
