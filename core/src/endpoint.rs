use std::collections::HashMap;

use crate::error::SessionError;
use crate::frame::{InboundFrame, OutboundFrame};

/// One named RPC target. Created with `addr = 0`; populated exactly once,
/// either from the Setup message or from a lazy `lookup` call, and
/// immutable thereafter.
#[derive(Debug, Clone)]
pub struct Endpoint {
	pub logical_name: &'static str,
	pub symbol: &'static str,
	pub addr: u64,
}

impl Endpoint {
	const fn new(logical_name: &'static str, symbol: &'static str) -> Self {
		Endpoint { logical_name, symbol, addr: 0 }
	}

	pub fn is_resolved(&self) -> bool {
		self.addr != 0
	}
}

/// A segment of bytes destined for a contiguous range of the device's code
/// buffer. No ordering or overlap guarantees are enforced here — see the
/// overlapping-commit open question.
#[derive(Debug, Clone)]
pub struct CommitSegment {
	pub addr: u64,
	pub bytes: Vec<u8>,
}

/// The fixed set of four built-in endpoints, keyed by logical name. The
/// `lookup` endpoint is special: it is never resolved lazily (its address
/// must come from Setup), so a session missing it after setup is invalid.
pub struct EndpointRegistry {
	pub lookup: Endpoint,
	pub commit: Endpoint,
	pub execute: Endpoint,
	pub memory_read_cstr: Endpoint,
}

impl EndpointRegistry {
	pub fn new() -> Self {
		EndpointRegistry {
			lookup: Endpoint::new("lookup", "__ez_clang_rpc_lookup"),
			commit: Endpoint::new("commit", "__ez_clang_rpc_commit"),
			execute: Endpoint::new("execute", "__ez_clang_rpc_execute"),
			memory_read_cstr: Endpoint::new("memory.read.cstr", "__ez_clang_rpc_mem_read_cstring"),
		}
	}

	pub fn by_logical_name(&self, name: &str) -> Option<&Endpoint> {
		match name {
			"lookup" => Some(&self.lookup),
			"commit" => Some(&self.commit),
			"execute" => Some(&self.execute),
			"memory.read.cstr" => Some(&self.memory_read_cstr),
			_ => None,
		}
	}

	pub fn by_logical_name_mut(&mut self, name: &str) -> Option<&mut Endpoint> {
		match name {
			"lookup" => Some(&mut self.lookup),
			"commit" => Some(&mut self.commit),
			"execute" => Some(&mut self.execute),
			"memory.read.cstr" => Some(&mut self.memory_read_cstr),
			_ => None,
		}
	}

	/// Called for every symbol reported in Setup (or returned from a
	/// `lookup` call). Returns `true` if `symbol` names one of the four
	/// known endpoints (and resolves it), `false` for unrecognised symbols
	/// — which is a warning at the call site, not an error.
	pub fn relocate(&mut self, symbol: &str, addr: u64) -> bool {
		for endpoint in [&mut self.lookup, &mut self.commit, &mut self.execute, &mut self.memory_read_cstr] {
			if endpoint.symbol == symbol {
				endpoint.addr = addr;
				return true;
			}
		}
		false
	}
}

impl Default for EndpointRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Request payload for one of the four built-in endpoints.
#[derive(Debug, Clone)]
pub enum CallInput {
	Lookup(Vec<String>),
	Commit(Vec<CommitSegment>),
	Execute { addr: u64, result_type: Option<String> },
	MemReadCstr { addr: u64 },
}

/// Decoded response payload.
#[derive(Debug, Clone)]
pub enum CallOutput {
	Lookup(HashMap<String, u64>),
	Commit,
	Execute,
	MemReadCstr(String),
}

/// Encodes `input` into `frame`'s body. Fails pre-send (no bytes reach the
/// wire) if the request shape is invalid, e.g. an empty lookup batch.
pub fn encode_request(frame: &mut OutboundFrame, input: &CallInput) -> Result<(), SessionError> {
	match input {
		CallInput::Lookup(symbols) => {
			if symbols.is_empty() {
				return Err(SessionError::HostApi("lookup requires at least one symbol".to_owned()));
			}
			frame.write_u32(symbols.len() as u64)?;
			for symbol in symbols {
				frame.write_string(symbol)?;
			}
		}
		CallInput::Commit(segments) => {
			if segments.is_empty() {
				return Err(SessionError::HostApi("commit requires at least one segment".to_owned()));
			}
			frame.write_u32(segments.len() as u64)?;
			for segment in segments {
				frame.write_addr(segment.addr)?;
				frame.write_bytes(&segment.bytes)?;
			}
		}
		CallInput::Execute { addr, .. } => {
			frame.write_addr(*addr)?;
		}
		CallInput::MemReadCstr { addr } => {
			frame.write_addr(*addr)?;
		}
	}
	Ok(())
}

/// Decodes `frame`'s body according to which endpoint was called. `symbols`
/// is the original request's symbol list, needed to recover the map shape
/// of a `lookup` response when the endpoint is `lookup`.
pub fn decode_response(
	logical_name: &str,
	frame: &mut InboundFrame,
	symbols: &[String],
) -> Result<CallOutput, SessionError> {
	match logical_name {
		"memory.read.cstr" => {
			// No leading error byte on this endpoint — preserved asymmetry,
			// see the design notes on the protocol's open questions.
			let value = frame.read_string()?;
			frame.done()?;
			Ok(CallOutput::MemReadCstr(value))
		}
		"lookup" => {
			let error_code = frame.read_error_code()?;
			if error_code != 0 {
				let reason = frame.read_string()?;
				frame.done()?;
				return Err(SessionError::DeviceError(reason));
			}
			let count = frame.read_u32()? as usize;
			if count != symbols.len() {
				frame.force_done();
				return Err(SessionError::Protocol(format!(
					"lookup requested {} symbol(s) but device returned {}",
					symbols.len(),
					count
				)));
			}
			let mut result = HashMap::with_capacity(count);
			for symbol in symbols.iter().take(count) {
				let addr = frame.read_addr()?;
				result.insert(symbol.clone(), addr);
			}
			frame.done()?;
			Ok(CallOutput::Lookup(result))
		}
		"commit" => {
			let error_code = frame.read_error_code()?;
			if error_code != 0 {
				let reason = frame.read_string()?;
				frame.done()?;
				return Err(SessionError::DeviceError(reason));
			}
			frame.done()?;
			Ok(CallOutput::Commit)
		}
		"execute" => {
			let error_code = frame.read_error_code()?;
			if error_code != 0 {
				let reason = frame.read_string()?;
				frame.done()?;
				return Err(SessionError::DeviceError(reason));
			}
			frame.done()?;
			Ok(CallOutput::Execute)
		}
		other => Err(SessionError::HostApi(format!("unknown endpoint `{other}`"))),
	}
}
