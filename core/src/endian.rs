use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// The wire protocol's numeric fields are parameterised over endianness; every
/// device in the corpus negotiates little-endian today, but the codec itself
/// does not hard-code that choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
	Little,
	Big,
}

impl Endian {
	pub(crate) fn read_u64(self, buf: &[u8]) -> u64 {
		match self {
			Endian::Little => LittleEndian::read_u64(buf),
			Endian::Big => BigEndian::read_u64(buf),
		}
	}

	pub(crate) fn write_u64(self, buf: &mut [u8], value: u64) {
		match self {
			Endian::Little => LittleEndian::write_u64(buf, value),
			Endian::Big => BigEndian::write_u64(buf, value),
		}
	}

	/// Reads a plain 4-byte value, e.g. a pointer embedded in a `Result`
	/// body on the 32-bit targets this protocol drives — distinct from the
	/// 8-byte-wide wire fields [`Self::read_u64`] handles.
	pub(crate) fn read_raw_u32(self, buf: &[u8]) -> u32 {
		match self {
			Endian::Little => LittleEndian::read_u32(buf),
			Endian::Big => BigEndian::read_u32(buf),
		}
	}
}

impl Default for Endian {
	fn default() -> Self {
		Endian::Little
	}
}
