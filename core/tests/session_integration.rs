//! End-to-end session scenarios driven over a `UnixStream::pair()`, with a
//! small hand-rolled fixture playing the device side of the wire protocol.
//! This exercises `Session` exactly as a real transport would, without
//! mocking the channel trait — only `Transport::custom` is special about
//! the setup, standing in for "a channel that's already synchronised".

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use device_session_core::channel::ByteChannel;
use device_session_core::error::ChannelError;
use device_session_core::{CallInput, CallOutput, CommitSegment, Endian, HostCallbacks, ResultFormat, Session, StdRecoveryPrompt, Transport};
use device_session_core::{HardResetKind, RecoveryConfig};

const HEADER_SIZE: usize = 32;
const OP_CONNECT: u64 = 0;
const OP_DISCONNECT: u64 = 1;
const OP_RETURN: u64 = 2;
const OP_RESULT: u64 = 4;
const OP_STDOUT: u64 = 5;

struct UnixChannel(UnixStream);

impl ByteChannel for UnixChannel {
	fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
		let mut buf = vec![0u8; n];
		self.0.read_exact(&mut buf).map_err(ChannelError::Io)?;
		Ok(buf)
	}

	fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
		self.0.write_all(buf).map_err(ChannelError::Io)
	}

	fn set_timeout(&mut self, timeout: Duration) {
		let _ = self.0.set_read_timeout(Some(timeout));
	}
}

#[derive(Clone, Default)]
struct TestHost {
	jit: Arc<Mutex<Vec<String>>>,
}

impl HostCallbacks for TestHost {
	fn jit_output(&mut self, text: &str) {
		self.jit.lock().unwrap().push(text.to_owned());
	}

	fn format_result(&mut self, _type_name: Option<&str>, _raw: &[u8], _endian: Endian) -> ResultFormat {
		ResultFormat::Plain(String::new())
	}
}

fn write_frame(stream: &mut UnixStream, opcode: u64, tag: u64, body: &[u8]) {
	let total = HEADER_SIZE + body.len();
	let mut buf = Vec::with_capacity(total);
	buf.write_u64::<LittleEndian>(total as u64).unwrap();
	buf.write_u64::<LittleEndian>(opcode).unwrap();
	buf.write_u64::<LittleEndian>(0).unwrap();
	buf.write_u64::<LittleEndian>(tag).unwrap();
	buf.extend_from_slice(body);
	stream.write_all(&buf).unwrap();
}

fn read_frame(stream: &mut UnixStream) -> (u64, u64, Vec<u8>) {
	let mut header = [0u8; 8];
	stream.read_exact(&mut header).unwrap();
	let size = (&header[..]).read_u64::<LittleEndian>().unwrap();
	let mut rest = vec![0u8; size as usize - 8];
	stream.read_exact(&mut rest).unwrap();
	let mut full = header.to_vec();
	full.extend_from_slice(&rest);
	let opcode = (&full[8..16]).read_u64::<LittleEndian>().unwrap();
	let tag = (&full[24..32]).read_u64::<LittleEndian>().unwrap();
	(opcode, tag, full[32..].to_vec())
}

fn encode_u32(buf: &mut Vec<u8>, v: u64) {
	buf.write_u64::<LittleEndian>(v).unwrap();
}

fn encode_bytes(buf: &mut Vec<u8>, data: &[u8]) {
	encode_u32(buf, data.len() as u64);
	buf.extend_from_slice(data);
}

fn encode_string(buf: &mut Vec<u8>, s: &str) {
	encode_bytes(buf, s.as_bytes());
}

struct BodyReader<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> BodyReader<'a> {
	fn new(data: &'a [u8]) -> Self {
		BodyReader { data, pos: 0 }
	}

	fn u32(&mut self) -> u64 {
		let v = (&self.data[self.pos..self.pos + 8]).read_u64::<LittleEndian>().unwrap();
		self.pos += 8;
		v
	}

	fn bytes(&mut self) -> Vec<u8> {
		let len = self.u32() as usize;
		let v = self.data[self.pos..self.pos + len].to_vec();
		self.pos += len;
		v
	}

	fn string(&mut self) -> String {
		String::from_utf8(self.bytes()).unwrap()
	}
}

const LOOKUP_SYMBOL: &str = "__ez_clang_rpc_lookup";

fn setup_body() -> Vec<u8> {
	let mut body = Vec::new();
	encode_string(&mut body, "1.0-fixture");
	encode_u32(&mut body, 0x2000_2000);
	encode_u32(&mut body, 0x6000);
	encode_u32(&mut body, 1);
	encode_string(&mut body, LOOKUP_SYMBOL);
	encode_u32(&mut body, 0x8000);
	body
}

fn new_session(device: UnixStream) -> Session<TestHost> {
	// Lets `RUST_LOG=trace cargo test -- --nocapture` surface the frame
	// dumps from `core::frame`; harmless, idempotent if already set up.
	let _ = env_logger::builder().is_test(true).try_init();
	let transport = Transport::custom(Box::new(UnixChannel(device)));
	Session::new("fixture-device", transport, Endian::Little, TestHost::default())
}

fn connect_and_setup(session: &mut Session<TestHost>) {
	let recovery_cfg = RecoveryConfig {
		device_id: "fixture-device".to_owned(),
		hard_reset_kind: HardResetKind::None,
		firmware_image: None,
		reconnect_threshold: Duration::from_secs(0),
	};
	let mut prompt = StdRecoveryPrompt::new();
	session.connect(&recovery_cfg, &mut prompt, None).unwrap();
	session.read_setup().unwrap();
}

#[test]
fn connect_setup_disconnect() {
	let (host_side, device_side) = UnixStream::pair().unwrap();
	let fixture = thread::spawn(move || {
		let mut stream = device_side;
		write_frame(&mut stream, OP_CONNECT, 0, &setup_body());
		let (opcode, _tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, OP_DISCONNECT);
		write_frame(&mut stream, OP_DISCONNECT, 0, &[0u8]);
	});

	let mut session = new_session(host_side);
	connect_and_setup(&mut session);
	assert!(session.connected());
	session.disconnect().unwrap();
	assert!(!session.connected());

	// Idempotent: a second disconnect is a no-op.
	session.disconnect().unwrap();

	fixture.join().unwrap();
}

#[test]
fn lookup_batch_mixes_success_and_failure() {
	let (host_side, device_side) = UnixStream::pair().unwrap();
	let fixture = thread::spawn(move || {
		let mut stream = device_side;
		write_frame(&mut stream, OP_CONNECT, 0, &setup_body());

		let (opcode, tag, body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0x8000);
		let mut reader = BodyReader::new(&body);
		let count = reader.u32();
		assert_eq!(count, 2);
		let sym_a = reader.string();
		let sym_b = reader.string();
		assert_eq!(sym_a, "sym_ok");
		assert_eq!(sym_b, "sym_nope");

		let mut resp = Vec::new();
		resp.push(0u8);
		encode_u32(&mut resp, 2);
		encode_u32(&mut resp, 0x1234);
		encode_u32(&mut resp, 0);
		write_frame(&mut stream, OP_RETURN, 0, &resp);

		let (opcode, _tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, OP_DISCONNECT);
		write_frame(&mut stream, OP_DISCONNECT, 0, &[0u8]);
	});

	let mut session = new_session(host_side);
	connect_and_setup(&mut session);

	let output = session
		.call("lookup", CallInput::Lookup(vec!["sym_ok".to_owned(), "sym_nope".to_owned()]))
		.unwrap();
	match output {
		CallOutput::Lookup(map) => {
			assert_eq!(map.get("sym_ok"), Some(&0x1234));
			assert_eq!(map.get("sym_nope"), Some(&0));
		}
		_ => panic!("expected CallOutput::Lookup"),
	}

	session.disconnect().unwrap();
	fixture.join().unwrap();
}

#[test]
fn commit_then_read_back_cstring() {
	let (host_side, device_side) = UnixStream::pair().unwrap();
	let fixture = thread::spawn(move || {
		let mut stream = device_side;
		write_frame(&mut stream, OP_CONNECT, 0, &setup_body());

		// lookup(commit) — lazily resolved on first use of that endpoint.
		let (opcode, tag, body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0x8000);
		let mut reader = BodyReader::new(&body);
		assert_eq!(reader.u32(), 1);
		assert_eq!(reader.string(), "__ez_clang_rpc_commit");
		let mut resp = Vec::new();
		resp.push(0u8);
		encode_u32(&mut resp, 1);
		encode_u32(&mut resp, 0x9000);
		write_frame(&mut stream, OP_RETURN, 0, &resp);

		// commit
		let (opcode, tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0x9000);
		write_frame(&mut stream, OP_RETURN, 0, &[0u8]);

		// lookup(memory.read.cstr) — resolved lazily on first use, separately.
		let (opcode, tag, body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0x8000);
		let mut reader = BodyReader::new(&body);
		assert_eq!(reader.u32(), 1);
		assert_eq!(reader.string(), "__ez_clang_rpc_mem_read_cstring");
		let mut resp = Vec::new();
		resp.push(0u8);
		encode_u32(&mut resp, 1);
		encode_u32(&mut resp, 0xA000);
		write_frame(&mut stream, OP_RETURN, 0, &resp);

		// memory.read.cstr — no leading error byte.
		let (opcode, tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0xA000);
		let mut resp = Vec::new();
		encode_string(&mut resp, "endcoal");
		write_frame(&mut stream, OP_RETURN, 0, &resp);

		let (opcode, _tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, OP_DISCONNECT);
		write_frame(&mut stream, OP_DISCONNECT, 0, &[0u8]);
	});

	let mut session = new_session(host_side);
	connect_and_setup(&mut session);

	let segment = CommitSegment { addr: 0x1000, bytes: b"endcoal\0".to_vec() };
	let output = session.call("commit", CallInput::Commit(vec![segment])).unwrap();
	assert!(matches!(output, CallOutput::Commit));

	let output = session.call("memory.read.cstr", CallInput::MemReadCstr { addr: 0x1000 }).unwrap();
	match output {
		CallOutput::MemReadCstr(s) => assert_eq!(s, "endcoal"),
		_ => panic!("expected CallOutput::MemReadCstr"),
	}

	session.disconnect().unwrap();
	fixture.join().unwrap();
}

#[test]
fn commit_overwrite_keeps_segments_independent() {
	let (host_side, device_side) = UnixStream::pair().unwrap();
	let fixture = thread::spawn(move || {
		let mut stream = device_side;
		write_frame(&mut stream, OP_CONNECT, 0, &setup_body());

		// lookup(commit)
		let (_opcode, _tag, _body) = read_frame(&mut stream);
		let mut resp = Vec::new();
		resp.push(0u8);
		encode_u32(&mut resp, 1);
		encode_u32(&mut resp, 0x9000);
		write_frame(&mut stream, OP_RETURN, 0, &resp);

		// commit batch: endcars@A, endcoal@A+0x20
		let (opcode, tag, body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0x9000);
		let mut reader = BodyReader::new(&body);
		let count = reader.u32();
		assert_eq!(count, 2);
		let addr_a = reader.u32();
		let data_a = reader.bytes();
		let addr_b = reader.u32();
		let data_b = reader.bytes();
		assert_eq!(addr_a, 0x1000);
		assert_eq!(data_a, b"endcars\0");
		assert_eq!(addr_b, 0x1020);
		assert_eq!(data_b, b"endcoal\0");
		write_frame(&mut stream, OP_RETURN, 0, &[0u8]);

		let (opcode, _tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, OP_DISCONNECT);
		write_frame(&mut stream, OP_DISCONNECT, 0, &[0u8]);
	});

	let mut session = new_session(host_side);
	connect_and_setup(&mut session);

	let segments = vec![
		CommitSegment { addr: 0x1000, bytes: b"endcars\0".to_vec() },
		CommitSegment { addr: 0x1020, bytes: b"endcoal\0".to_vec() },
	];
	let output = session.call("commit", CallInput::Commit(segments)).unwrap();
	assert!(matches!(output, CallOutput::Commit));

	session.disconnect().unwrap();
	fixture.join().unwrap();
}

#[test]
fn execute_delivers_stdout_in_order_before_return() {
	let (host_side, device_side) = UnixStream::pair().unwrap();
	let fixture = thread::spawn(move || {
		let mut stream = device_side;
		write_frame(&mut stream, OP_CONNECT, 0, &setup_body());

		// lookup(execute)
		let (_opcode, _tag, _body) = read_frame(&mut stream);
		let mut resp = Vec::new();
		resp.push(0u8);
		encode_u32(&mut resp, 1);
		encode_u32(&mut resp, 0x9500);
		write_frame(&mut stream, OP_RETURN, 0, &resp);

		// execute, interleaved with StdOut frames before Return.
		let (opcode, tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0x9500);

		let mut hello = Vec::new();
		encode_string(&mut hello, "hello ");
		write_frame(&mut stream, OP_STDOUT, 0, &hello);

		let mut world = Vec::new();
		encode_string(&mut world, "world");
		write_frame(&mut stream, OP_STDOUT, 0, &world);

		write_frame(&mut stream, OP_RETURN, 0, &[0u8]);

		let (opcode, _tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, OP_DISCONNECT);
		write_frame(&mut stream, OP_DISCONNECT, 0, &[0u8]);
	});

	let mut session = new_session(host_side);
	connect_and_setup(&mut session);

	let jit_sink = session.host_mut().jit.clone();
	let output = session.call("execute", CallInput::Execute { addr: 0x4242, result_type: None }).unwrap();
	assert!(matches!(output, CallOutput::Execute));
	assert_eq!(&*jit_sink.lock().unwrap(), &["hello ".to_owned(), "world".to_owned()]);

	session.disconnect().unwrap();
	fixture.join().unwrap();
}

#[test]
fn pending_result_value_is_buffered_until_return() {
	let (host_side, device_side) = UnixStream::pair().unwrap();
	let fixture = thread::spawn(move || {
		let mut stream = device_side;
		write_frame(&mut stream, OP_CONNECT, 0, &setup_body());

		let (_opcode, _tag, _body) = read_frame(&mut stream);
		let mut resp = Vec::new();
		resp.push(0u8);
		encode_u32(&mut resp, 1);
		encode_u32(&mut resp, 0x9600);
		write_frame(&mut stream, OP_RETURN, 0, &resp);

		let (opcode, tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, device_session_core::Opcode::Call as u64);
		assert_eq!(tag, 0x9600);

		// A Result frame carrying the raw expression bytes, then Return.
		write_frame(&mut stream, OP_RESULT, 0, &[0x2a, 0x00, 0x00, 0x00]);
		write_frame(&mut stream, OP_RETURN, 0, &[0u8]);

		let (opcode, _tag, _body) = read_frame(&mut stream);
		assert_eq!(opcode, OP_DISCONNECT);
		write_frame(&mut stream, OP_DISCONNECT, 0, &[0u8]);
	});

	let mut session = new_session(host_side);
	connect_and_setup(&mut session);

	let jit_sink = session.host_mut().jit.clone();
	session.call("execute", CallInput::Execute { addr: 0x4343, result_type: Some("int".to_owned()) }).unwrap();
	// format_result in TestHost renders everything as an empty string, but
	// the important thing is it was invoked exactly once (the Result body
	// was buffered, not emitted directly as if it were StdOut).
	assert_eq!(&*jit_sink.lock().unwrap(), &[String::new()]);

	session.disconnect().unwrap();
	fixture.join().unwrap();
}
