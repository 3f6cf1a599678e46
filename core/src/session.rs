use crate::endian::Endian;
use crate::endpoint::{decode_response, encode_request, CallInput, CallOutput, Endpoint, EndpointRegistry};
use crate::error::{ChannelError, FrameError, SessionError};
use crate::frame::Codec;
use crate::host::{HostCallbacks, RecoveryPrompt, ResultFormat};
use crate::opcode::Opcode;
use crate::recovery::{negotiate_recovery, ExternalFlasher, RecoveryConfig};
use crate::transport::Transport;

/// Decoded Setup message: the device's code-buffer extents and bootstrap
/// endpoint table, handed back to the façade instead of populating
/// compiler flags directly (those remain an external collaborator).
#[derive(Debug, Clone)]
pub struct SetupInfo {
	pub version_string: String,
	pub code_buffer_addr: u64,
	pub code_buffer_size: u64,
	pub symbols: Vec<(String, u64)>,
}

/// The central state machine: owns the transport, the codec, and the
/// endpoint registry, and drives connect → setup → call* → disconnect.
/// Generic over the host callback implementation rather than boxed, since
/// a session is built once per device and the concrete host type is known
/// at that point.
pub struct Session<H: HostCallbacks> {
	device_id: String,
	transport: Transport,
	codec: Codec,
	registry: EndpointRegistry,
	host: H,
	connected: bool,
	disconnecting: bool,
}

impl<H: HostCallbacks> Session<H> {
	pub fn new(device_id: impl Into<String>, transport: Transport, endian: Endian, host: H) -> Self {
		Session {
			device_id: device_id.into(),
			transport,
			codec: Codec::new(endian),
			registry: EndpointRegistry::new(),
			host,
			connected: false,
			disconnecting: false,
		}
	}

	pub fn set_verbose(&mut self, verbose: bool) {
		self.codec.set_verbose(verbose);
	}

	pub fn device_id(&self) -> &str {
		&self.device_id
	}

	pub fn connected(&self) -> bool {
		self.connected
	}

	pub fn host_mut(&mut self) -> &mut H {
		&mut self.host
	}

	/// Establishes the transport: reset, handshake, and — on handshake
	/// failure — the full recovery cascade. On success the transport is
	/// finalized for operational-phase timeouts; the caller still needs to
	/// call [`Self::read_setup`] before issuing `call`s.
	pub fn connect(
		&mut self,
		recovery_cfg: &RecoveryConfig,
		prompt: &mut dyn RecoveryPrompt,
		flasher: Option<&dyn ExternalFlasher>,
	) -> Result<(), SessionError> {
		self.transport.reset()?;
		if let Err(e) = self.transport.handshake() {
			log::warn!("handshake failed on first attempt: {e}");
			negotiate_recovery(&mut self.transport, recovery_cfg, prompt, flasher)?;
		}
		self.transport.finalize();
		Ok(())
	}

	/// Reads the first inbound frame (the Setup message), relocating every
	/// reported symbol into the endpoint registry. Unknown symbols produce
	/// a warning, not an error. Fails if the `lookup` endpoint is still
	/// unresolved afterwards — the session is invalid without it.
	pub fn read_setup(&mut self) -> Result<SetupInfo, SessionError> {
		let channel = self.transport.channel_mut().ok_or(SessionError::Channel(ChannelError::NotConnected))?;
		let mut frame = self.codec.receive(channel)?;

		if frame.opcode != Opcode::Connect {
			frame.force_done();
			return Err(SessionError::Protocol(format!("expected Setup (Connect) frame, got {}", frame.opcode)));
		}
		if frame.tag != 0 {
			let tag = frame.tag;
			frame.force_done();
			return Err(FrameError::TagInvariant { tag, opcode: Opcode::Connect.to_string() }.into());
		}

		let version_string = frame.read_string()?;
		let code_buffer_addr = frame.read_addr()?;
		let code_buffer_size = frame.read_size()?;
		let n_symbols = frame.read_u32()? as usize;
		let mut symbols = Vec::with_capacity(n_symbols);
		for _ in 0..n_symbols {
			let symbol = frame.read_string()?;
			let addr = frame.read_addr()?;
			if !self.registry.relocate(&symbol, addr) {
				log::warn!("unrecognised bootstrap symbol `{symbol}`");
			}
			symbols.push((symbol, addr));
		}
		frame.done()?;

		if !self.registry.lookup.is_resolved() {
			return Err(SessionError::Protocol("lookup endpoint missing from setup".to_owned()));
		}

		self.connected = true;
		Ok(SetupInfo { version_string, code_buffer_addr, code_buffer_size, symbols })
	}

	fn check_tag_invariant(&self, opcode: Opcode, tag: u64) -> Result<(), SessionError> {
		let is_call = opcode == Opcode::Call;
		if (tag != 0) != is_call {
			return Err(FrameError::TagInvariant { tag, opcode: opcode.to_string() }.into());
		}
		Ok(())
	}

	/// Resolves `logical_name` to its bootstrap or lazily-looked-up
	/// address. The `lookup` endpoint itself is never resolved lazily —
	/// its address must already be set from Setup.
	fn resolve_endpoint(&mut self, logical_name: &str) -> Result<Endpoint, SessionError> {
		let endpoint = self
			.registry
			.by_logical_name(logical_name)
			.cloned()
			.ok_or_else(|| SessionError::HostApi(format!("unknown endpoint `{logical_name}`")))?;

		if endpoint.is_resolved() {
			return Ok(endpoint);
		}
		if logical_name == "lookup" {
			return Err(SessionError::Protocol("lookup endpoint unresolved after setup".to_owned()));
		}

		let symbol = endpoint.symbol.to_owned();
		let output = self.call("lookup", CallInput::Lookup(vec![symbol.clone()]))?;
		let addr = match output {
			CallOutput::Lookup(map) => *map.get(&symbol).unwrap_or(&0),
			_ => unreachable!("a `lookup` call always decodes to CallOutput::Lookup"),
		};
		if let Some(ep) = self.registry.by_logical_name_mut(logical_name) {
			ep.addr = addr;
		}
		Ok(Endpoint { addr, ..endpoint })
	}

	/// The request/response loop: resolves the endpoint, sends a `Call`
	/// frame, then reads frames in arrival order until the matching
	/// `Return`, routing `Result`/`StdOut` to their sinks along the way.
	pub fn call(&mut self, logical_name: &str, input: CallInput) -> Result<CallOutput, SessionError> {
		let endpoint = self.resolve_endpoint(logical_name)?;

		let result_type = match &input {
			CallInput::Execute { result_type, .. } => result_type.clone(),
			_ => None,
		};
		let lookup_symbols = match &input {
			CallInput::Lookup(symbols) => symbols.clone(),
			_ => Vec::new(),
		};

		let mut builder = self.codec.build(Opcode::Call, endpoint.addr, endpoint.symbol);
		encode_request(&mut builder, &input)?;
		let channel = self.transport.channel_mut().ok_or(SessionError::Channel(ChannelError::NotConnected))?;
		builder.send(channel)?;

		let mut pending_value: Option<Vec<u8>> = None;

		loop {
			let channel = self.transport.channel_mut().ok_or(SessionError::Channel(ChannelError::NotConnected))?;
			let mut inbound = self.codec.receive(channel)?;
			self.check_tag_invariant(inbound.opcode, inbound.tag)?;

			match inbound.opcode {
				Opcode::Result => {
					pending_value = Some(inbound.read_bytes_remaining());
					inbound.done()?;
				}
				Opcode::StdOut => {
					let text = inbound.read_string()?;
					inbound.done()?;
					self.host.jit_output(&text);
				}
				Opcode::Return => {
					let output = decode_response(logical_name, &mut inbound, &lookup_symbols)?;
					if let Some(raw) = pending_value.take() {
						let format = self.host.format_result(result_type.as_deref(), &raw, self.codec.endian());
						let text = match format {
							ResultFormat::Plain(s) => s,
							ResultFormat::CStringAt(addr) => {
								match self.call("memory.read.cstr", CallInput::MemReadCstr { addr })? {
									CallOutput::MemReadCstr(s) => s,
									_ => unreachable!("`memory.read.cstr` always decodes to CallOutput::MemReadCstr"),
								}
							}
						};
						self.host.jit_output(&text);
					}
					return Ok(output);
				}
				Opcode::Call => {
					inbound.force_done();
					return Err(SessionError::Protocol("Callbacks not yet supported".to_owned()));
				}
				Opcode::Connect => {
					return Err(SessionError::UnexpectedReboot { setup_frame: inbound });
				}
				Opcode::Disconnect => {
					let error_code = inbound.read_error_code()?;
					if error_code == 0 {
						inbound.done()?;
						return Err(SessionError::Protocol("unexpected Disconnect with Success".to_owned()));
					}
					let reason = inbound.read_string()?;
					inbound.done()?;
					return Err(SessionError::UnexpectedDisconnect(reason));
				}
			}
		}
	}

	/// Idempotent: a second call (or a call after the channel is already
	/// closed) is a no-op. The `disconnecting` guard prevents re-entrant
	/// disconnection if this is ever invoked while already unwinding.
	pub fn disconnect(&mut self) -> Result<(), SessionError> {
		if self.disconnecting || !self.connected {
			return Ok(());
		}
		self.disconnecting = true;
		let result = self.disconnect_inner();
		self.disconnecting = false;
		self.connected = false;
		result
	}

	fn disconnect_inner(&mut self) -> Result<(), SessionError> {
		let channel = self.transport.channel_mut().ok_or(SessionError::Channel(ChannelError::NotConnected))?;
		let builder = self.codec.build(Opcode::Disconnect, 0, "");
		builder.send(channel)?;

		let channel = self.transport.channel_mut().ok_or(SessionError::Channel(ChannelError::NotConnected))?;
		let mut inbound = self.codec.receive(channel)?;
		self.check_tag_invariant(inbound.opcode, inbound.tag)?;

		if inbound.opcode != Opcode::Disconnect {
			inbound.force_done();
			return Err(SessionError::Protocol(format!("expected Disconnect response, got {}", inbound.opcode)));
		}
		let error_code = inbound.read_error_code()?;
		inbound.done()?;
		if error_code != 0 {
			return Err(SessionError::Protocol("device reported an error on disconnect".to_owned()));
		}

		if matches!(self.transport, Transport::Socket(_)) {
			// The TCP transport needs a second Disconnect after the response
			// to let the server side shut down cleanly.
			if let Some(channel) = self.transport.channel_mut() {
				let trailer = self.codec.build(Opcode::Disconnect, 0, "");
				let _ = trailer.send(channel);
			}
		}

		self.transport.close();
		Ok(())
	}
}

impl<H: HostCallbacks> Drop for Session<H> {
	fn drop(&mut self) {
		let _ = self.disconnect();
	}
}
