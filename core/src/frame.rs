use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::ByteChannel;
use crate::endian::Endian;
use crate::error::{ChannelError, FrameError};
use crate::opcode::Opcode;

/// Size of the fixed frame header: `size | opcode | seq_id | tag`, 8 bytes each.
pub const HEADER_SIZE: usize = 32;

/// Every numeric field is stored in 8 bytes but constrained to the low 32
/// bits. This mismatch is frozen for wire compatibility with deployed
/// firmware; do not "fix" it to `u32::MAX`-as-8-bytes or similar.
pub const MAX_FIELD_VALUE: u64 = 0xFFFF_FFFF;

fn dump_frame(banner: &str, data: &[u8], layout: &[usize]) {
	if !log::log_enabled!(log::Level::Trace) {
		return;
	}
	log::trace!("{banner}");
	let mut offset = 0;
	for &len in layout {
		let chunk = &data[offset..offset + len];
		let hex = chunk.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ");
		log::trace!("  {hex}");
		offset += len;
	}
}

/// Assembles one outbound frame's body. Returned by [`Codec::build`];
/// consumed by [`OutboundFrame::send`].
pub struct OutboundFrame<'a> {
	codec: &'a Codec,
	opcode: Opcode,
	tag: u64,
	banner: String,
	body: Vec<u8>,
	layout: Vec<usize>,
}

impl<'a> OutboundFrame<'a> {
	/// Writes a 64-bit field, rejecting anything outside the protocol's
	/// 32-bit range (see [`MAX_FIELD_VALUE`]).
	pub fn write_u32(&mut self, value: u64) -> Result<(), FrameError> {
		if value > MAX_FIELD_VALUE {
			return Err(FrameError::OutOfRange(value));
		}
		let mut buf = [0u8; 8];
		self.codec.endian.write_u64(&mut buf, value);
		self.body.extend_from_slice(&buf);
		self.layout.push(8);
		Ok(())
	}

	pub fn write_addr(&mut self, value: u64) -> Result<(), FrameError> {
		self.write_u32(value)
	}

	pub fn write_size(&mut self, value: u64) -> Result<(), FrameError> {
		self.write_u32(value)
	}

	/// Writes a size-prefixed byte string as a single logical field.
	pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), FrameError> {
		self.write_u32(data.len() as u64)?;
		self.body.extend_from_slice(data);
		if let Some(last) = self.layout.last_mut() {
			*last += data.len();
		}
		Ok(())
	}

	/// Writes an ASCII string via [`Self::write_bytes`].
	pub fn write_string(&mut self, value: &str) -> Result<(), FrameError> {
		if !value.is_ascii() {
			return Err(FrameError::NotAscii);
		}
		self.write_bytes(value.as_bytes())
	}

	/// Back-patches the header with the final size and the next sequence
	/// number, then writes the whole frame to the channel in one call.
	pub fn send(self, channel: &mut dyn ByteChannel) -> Result<(), FrameError> {
		let seq_id = self.codec.next_seq_id();
		let total_size = HEADER_SIZE + self.body.len();
		let mut buf = vec![0u8; total_size];
		self.codec.endian.write_u64(&mut buf[0..8], total_size as u64);
		self.codec.endian.write_u64(&mut buf[8..16], self.opcode as u64);
		self.codec.endian.write_u64(&mut buf[16..24], seq_id);
		self.codec.endian.write_u64(&mut buf[24..32], self.tag);
		buf[HEADER_SIZE..].copy_from_slice(&self.body);

		if self.codec.verbose {
			let mut full_layout = vec![8, 8, 8, 8];
			full_layout.extend_from_slice(&self.layout);
			dump_frame(&format!("{} ->", self.banner), &buf, &full_layout);
		}

		channel.write_all(&buf).map_err(FrameError::Channel)
	}
}

/// A fully-buffered inbound frame. Body accessors are sequential cursors;
/// see the module-level documentation on [`crate`] for the accessor
/// contract (error code first, then typed fields in wire order).
#[derive(Debug)]
pub struct InboundFrame {
	pub opcode: Opcode,
	pub seq_id: u64,
	pub tag: u64,
	size: u64,
	buffer: Vec<u8>,
	cursor: usize,
	layout: Vec<usize>,
	endian: Endian,
	verbose: bool,
}

impl InboundFrame {
	fn read_u32_tracked(&mut self) -> Result<u64, FrameError> {
		let end = self.cursor + 8;
		if end > self.buffer.len() {
			return Err(FrameError::Padding { extra: 0 });
		}
		let value = self.endian.read_u64(&self.buffer[self.cursor..end]);
		if value > MAX_FIELD_VALUE {
			return Err(FrameError::OutOfRange(value));
		}
		self.cursor = end;
		self.layout.push(8);
		Ok(value)
	}

	/// Must be the first body accessor called; every non-Setup response
	/// begins with a 1-byte error code (`memory.read.cstr` is the
	/// documented exception, decoded without calling this at all).
	pub fn read_error_code(&mut self) -> Result<u8, FrameError> {
		if self.cursor != HEADER_SIZE {
			return Err(FrameError::ErrorCodeNotFirst);
		}
		if self.cursor >= self.buffer.len() {
			return Err(FrameError::Padding { extra: 0 });
		}
		let byte = self.buffer[self.cursor];
		self.cursor += 1;
		self.layout.push(1);
		Ok(byte)
	}

	pub fn read_u32(&mut self) -> Result<u64, FrameError> {
		self.read_u32_tracked()
	}

	pub fn read_addr(&mut self) -> Result<u64, FrameError> {
		self.read_u32()
	}

	pub fn read_size(&mut self) -> Result<u64, FrameError> {
		self.read_u32()
	}

	/// Reads a size-prefixed byte string.
	pub fn read_bytes(&mut self) -> Result<Vec<u8>, FrameError> {
		let length = self.read_u32_tracked()? as usize;
		let end = self.cursor + length;
		if end > self.buffer.len() {
			return Err(FrameError::Padding { extra: 0 });
		}
		let data = self.buffer[self.cursor..end].to_vec();
		self.cursor = end;
		if let Some(last) = self.layout.last_mut() {
			*last += length;
		}
		Ok(data)
	}

	pub fn read_string(&mut self) -> Result<String, FrameError> {
		let bytes = self.read_bytes()?;
		if !bytes.is_ascii() {
			return Err(FrameError::NotAscii);
		}
		Ok(String::from_utf8(bytes).expect("validated ascii is valid utf-8"))
	}

	/// Deprecated drain-the-rest accessor, kept for firmwares that still
	/// rely on it (e.g. the `Result` message's expression value).
	pub fn read_bytes_remaining(&mut self) -> Vec<u8> {
		let length = self.size as usize - self.cursor;
		let data = self.buffer[self.cursor..self.cursor + length].to_vec();
		self.cursor += length;
		self.layout.push(length);
		data
	}

	/// True once every byte of the frame has been consumed.
	pub fn is_fully_consumed(&self) -> bool {
		self.cursor == self.size as usize
	}

	/// Consumes the frame. Fails if the cursor is short of `size` —
	/// indicates the decoder didn't read everything the device sent.
	pub fn done(&mut self) -> Result<(), FrameError> {
		if !self.is_fully_consumed() {
			return Err(FrameError::Padding { extra: self.size as usize - self.cursor });
		}
		if self.verbose {
			dump_frame(&format!("{} <-", self.opcode), &self.buffer, &self.layout);
		}
		Ok(())
	}

	/// Drains any remaining bytes and then calls [`Self::done`]; used by
	/// error paths that want to dump the whole frame regardless of how far
	/// the decoder got before failing.
	pub fn force_done(&mut self) {
		if !self.is_fully_consumed() {
			self.read_bytes_remaining();
		}
		let _ = self.done();
	}
}

/// Owns the process-wide sequence-id counter and endianness/verbosity
/// configuration; builds [`OutboundFrame`]s and parses [`InboundFrame`]s.
pub struct Codec {
	endian: Endian,
	seq_id: AtomicU64,
	verbose: bool,
}

impl Codec {
	pub fn new(endian: Endian) -> Self {
		Codec { endian, seq_id: AtomicU64::new(0), verbose: false }
	}

	pub fn set_verbose(&mut self, verbose: bool) {
		self.verbose = verbose;
	}

	pub(crate) fn endian(&self) -> Endian {
		self.endian
	}

	fn next_seq_id(&self) -> u64 {
		self.seq_id.fetch_add(1, Ordering::Relaxed) + 1
	}

	/// Starts building an outbound frame. `symbol` is only used to build the
	/// debug-dump banner (e.g. `Call __ez_clang_rpc_lookup (0x00008000)`).
	pub fn build<'a>(&'a self, opcode: Opcode, tag: u64, symbol: &str) -> OutboundFrame<'a> {
		let mut banner = opcode.name().to_owned();
		if !symbol.is_empty() {
			banner.push_str(&format!(" {symbol} (0x{tag:08x})"));
		}
		OutboundFrame { codec: self, opcode, tag, banner, body: Vec::new(), layout: Vec::new() }
	}

	/// Reads one complete frame from `channel`, parsing the header eagerly
	/// and buffering the body for sequential access.
	pub fn receive(&self, channel: &mut dyn ByteChannel) -> Result<InboundFrame, FrameError> {
		let size_bytes = channel.read_exact(8)?;
		let size = self.endian.read_u64(&size_bytes);
		if size > MAX_FIELD_VALUE {
			return Err(FrameError::OutOfRange(size));
		}
		if (size as usize) < HEADER_SIZE {
			return Err(FrameError::Channel(ChannelError::Timeout { expected: HEADER_SIZE, received: size_bytes }));
		}
		let rest = channel.read_exact(size as usize - 8)?;

		let mut buffer = Vec::with_capacity(size as usize);
		buffer.extend_from_slice(&size_bytes);
		buffer.extend_from_slice(&rest);

		let mut frame = InboundFrame {
			opcode: Opcode::Connect,
			seq_id: 0,
			tag: 0,
			size,
			buffer,
			cursor: 8,
			layout: vec![8],
			endian: self.endian,
			verbose: self.verbose,
		};

		let opcode_raw = frame.read_u32_tracked()?;
		frame.opcode = Opcode::try_from(opcode_raw)?;
		frame.seq_id = frame.read_u32_tracked()?;
		frame.tag = frame.read_u32_tracked()?;

		Ok(frame)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::channel::tests::LoopbackChannel;

	#[test]
	fn round_trip_string() {
		let codec = Codec::new(Endian::Little);
		let mut channel = LoopbackChannel::new();

		let mut out = codec.build(Opcode::Call, 0x1234, "sym");
		out.write_string("hello world").unwrap();
		out.send(&mut channel).unwrap();

		let mut inbound = codec.receive(&mut channel).unwrap();
		assert_eq!(inbound.opcode, Opcode::Call);
		assert_eq!(inbound.tag, 0x1234);
		assert_eq!(inbound.read_string().unwrap(), "hello world");
		inbound.done().unwrap();
	}

	#[test]
	fn round_trip_u32() {
		let codec = Codec::new(Endian::Little);
		let mut channel = LoopbackChannel::new();

		let mut out = codec.build(Opcode::Return, 0, "");
		out.write_u32(0xFFFF_FFFF).unwrap();
		out.send(&mut channel).unwrap();

		let mut inbound = codec.receive(&mut channel).unwrap();
		assert_eq!(inbound.read_u32().unwrap(), 0xFFFF_FFFF);
		inbound.done().unwrap();
	}

	#[test]
	fn write_u32_rejects_out_of_range() {
		let codec = Codec::new(Endian::Little);
		let mut out = codec.build(Opcode::Return, 0, "");
		let err = out.write_u32(1u64 << 32).unwrap_err();
		assert!(matches!(err, FrameError::OutOfRange(_)));
	}

	#[test]
	fn seq_id_strictly_increases() {
		let codec = Codec::new(Endian::Little);
		let mut channel = LoopbackChannel::new();
		codec.build(Opcode::Return, 0, "").send(&mut channel).unwrap();
		codec.build(Opcode::Return, 0, "").send(&mut channel).unwrap();

		let first = codec.receive(&mut channel).unwrap();
		let second = codec.receive(&mut channel).unwrap();
		assert!(second.seq_id > first.seq_id);
	}

	#[test]
	fn unknown_opcode_is_protocol_error() {
		let codec = Codec::new(Endian::Little);
		let mut channel = LoopbackChannel::new();
		let mut buf = vec![0u8; HEADER_SIZE];
		Endian::Little.write_u64(&mut buf[0..8], HEADER_SIZE as u64);
		Endian::Little.write_u64(&mut buf[8..16], 6); // opcode > 5
		channel.write_all(&buf).unwrap();

		let err = codec.receive(&mut channel).unwrap_err();
		assert!(matches!(err, FrameError::UnknownOpcode(6)));
	}

	#[test]
	fn done_rejects_short_consumption() {
		let codec = Codec::new(Endian::Little);
		let mut channel = LoopbackChannel::new();
		let mut out = codec.build(Opcode::Return, 0, "");
		out.write_u32(1).unwrap();
		out.write_u32(2).unwrap();
		out.send(&mut channel).unwrap();

		let mut inbound = codec.receive(&mut channel).unwrap();
		inbound.read_u32().unwrap();
		assert!(matches!(inbound.done(), Err(FrameError::Padding { .. })));
	}
}
