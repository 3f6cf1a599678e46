use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::error::ChannelError;

/// Default per-read timeout once a session is past the handshake. The
/// handshake itself uses a longer, caller-supplied timeout (see
/// [`crate::transport::Transport::handshake`]).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A duplex byte stream to a device: serial port, TCP socket, or a
/// subprocess's stdio pipes. [`crate::frame::Codec`] is written against this
/// trait rather than any concrete transport so the session/recovery layers
/// stay transport-agnostic.
pub trait ByteChannel: Send {
	/// Reads exactly `n` bytes, blocking up to this channel's configured
	/// timeout. Returns [`ChannelError::Timeout`] with whatever partial data
	/// arrived if the timeout elapses first.
	fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError>;

	/// Writes the entire buffer, blocking until accepted by the OS.
	fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError>;

	fn set_timeout(&mut self, timeout: Duration);

	/// Best-effort close; double-closing must be safe (the TCP transport's
	/// disconnect sequence calls this twice by design, see
	/// [`crate::transport::Transport`]).
	fn close(&mut self) {}
}

fn read_exact_with_timeout<R: Read>(
	reader: &mut R,
	n: usize,
	timeout: Duration,
) -> Result<Vec<u8>, ChannelError> {
	let mut buf = vec![0u8; n];
	let mut filled = 0;
	let deadline = std::time::Instant::now() + timeout;
	while filled < n {
		if std::time::Instant::now() >= deadline {
			buf.truncate(filled);
			return Err(ChannelError::Timeout { expected: n, received: buf });
		}
		match reader.read(&mut buf[filled..]) {
			Ok(0) => {
				buf.truncate(filled);
				return Err(ChannelError::Timeout { expected: n, received: buf });
			}
			Ok(read) => filled += read,
			Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => continue,
			Err(e) if e.kind() == ErrorKind::Interrupted => continue,
			Err(e) => return Err(ChannelError::Io(e)),
		}
	}
	Ok(buf)
}

/// A channel over a `serialport` handle (USB-CDC boards: SAM/Due, Metro M0,
/// Teensy LC). Hard-reset mechanics (DTR toggling, baud-rate tricks) live in
/// [`crate::recovery`], not here — this type is just the byte pipe.
pub struct SerialChannel {
	port: Box<dyn serialport::SerialPort>,
	timeout: Duration,
}

impl SerialChannel {
	pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, ChannelError> {
		let port = serialport::new(path, baud_rate)
			.timeout(timeout)
			.open()
			.map_err(|e| ChannelError::Io(io::Error::new(ErrorKind::Other, e)))?;
		Ok(SerialChannel { port, timeout })
	}

	/// Exposes the underlying handle so [`crate::recovery`] can toggle DTR
	/// or reopen at a different baud rate for the hard-reset sequence.
	pub fn port_mut(&mut self) -> &mut dyn serialport::SerialPort {
		&mut *self.port
	}
}

impl ByteChannel for SerialChannel {
	fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
		read_exact_with_timeout(&mut self.port, n, self.timeout)
	}

	fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
		self.port.write_all(buf).map_err(ChannelError::Io)
	}

	fn set_timeout(&mut self, timeout: Duration) {
		self.timeout = timeout;
		let _ = self.port.set_timeout(timeout);
	}
}

/// A channel over a plain TCP socket (e.g. the Raspberry Pi device family).
pub struct SocketChannel {
	stream: TcpStream,
	timeout: Duration,
}

impl SocketChannel {
	pub fn connect(addr: &str, timeout: Duration) -> Result<Self, ChannelError> {
		let stream = TcpStream::connect(addr).map_err(ChannelError::Io)?;
		stream.set_read_timeout(Some(timeout)).map_err(ChannelError::Io)?;
		Ok(SocketChannel { stream, timeout })
	}
}

impl ByteChannel for SocketChannel {
	fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
		read_exact_with_timeout(&mut self.stream, n, self.timeout)
	}

	fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
		self.stream.write_all(buf).map_err(ChannelError::Io)
	}

	fn set_timeout(&mut self, timeout: Duration) {
		self.timeout = timeout;
		let _ = self.stream.set_read_timeout(Some(timeout));
	}

	fn close(&mut self) {
		let _ = self.stream.shutdown(std::net::Shutdown::Both);
	}
}

enum ReaderMessage {
	Data(u8),
	Closed,
}

/// A channel over a child process's stdin/stdout (the QEMU-backed device
/// family). `ChildStdout` has no read timeout of its own, so a background
/// thread drains it byte-by-byte into an mpsc channel — this is the one
/// place in the crate with a spawned thread, mirroring the way a UDP socket
/// reader is split off in a blocking network client.
pub struct SubprocessChannel {
	child: Child,
	stdin: ChildStdin,
	rx: mpsc::Receiver<ReaderMessage>,
	timeout: Duration,
}

impl SubprocessChannel {
	pub fn spawn(command: &str, args: &[String], timeout: Duration) -> Result<Self, ChannelError> {
		let mut child = Command::new(command)
			.args(args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.spawn()
			.map_err(ChannelError::Io)?;

		let stdin = child.stdin.take().expect("stdin was piped");
		let mut stdout: ChildStdout = child.stdout.take().expect("stdout was piped");

		let (tx, rx) = mpsc::channel();
		thread::spawn(move || {
			let mut byte = [0u8; 1];
			loop {
				match stdout.read(&mut byte) {
					Ok(0) => {
						let _ = tx.send(ReaderMessage::Closed);
						break;
					}
					Ok(_) => {
						if tx.send(ReaderMessage::Data(byte[0])).is_err() {
							break;
						}
					}
					Err(_) => {
						let _ = tx.send(ReaderMessage::Closed);
						break;
					}
				}
			}
		});

		Ok(SubprocessChannel { child, stdin, rx, timeout })
	}

	/// Used by [`crate::recovery`] to SIGKILL the QEMU process as its
	/// hard-reset mechanism.
	pub fn kill(&mut self) -> Result<(), ChannelError> {
		self.child.kill().map_err(ChannelError::Io)
	}
}

impl ByteChannel for SubprocessChannel {
	fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
		let mut buf = Vec::with_capacity(n);
		while buf.len() < n {
			match self.rx.recv_timeout(self.timeout) {
				Ok(ReaderMessage::Data(byte)) => buf.push(byte),
				Ok(ReaderMessage::Closed) | Err(RecvTimeoutError::Disconnected) => {
					return Err(ChannelError::Timeout { expected: n, received: buf });
				}
				Err(RecvTimeoutError::Timeout) => {
					return Err(ChannelError::Timeout { expected: n, received: buf });
				}
			}
		}
		Ok(buf)
	}

	fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
		self.stdin.write_all(buf).map_err(ChannelError::Io)
	}

	fn set_timeout(&mut self, timeout: Duration) {
		self.timeout = timeout;
	}

	fn close(&mut self) {
		let _ = self.child.kill();
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use std::collections::VecDeque;

	/// An in-memory FIFO standing in for a real transport in unit tests:
	/// writes enqueue bytes, reads dequeue them. Integration tests that need
	/// a genuine full-duplex pair use `UnixStream::pair()` instead (see
	/// `tests/`).
	pub struct LoopbackChannel {
		buf: VecDeque<u8>,
	}

	impl LoopbackChannel {
		pub fn new() -> Self {
			LoopbackChannel { buf: VecDeque::new() }
		}
	}

	impl ByteChannel for LoopbackChannel {
		fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
			if self.buf.len() < n {
				let received = self.buf.drain(..).collect();
				return Err(ChannelError::Timeout { expected: n, received });
			}
			Ok(self.buf.drain(..n).collect())
		}

		fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
			self.buf.extend(buf.iter().copied());
			Ok(())
		}

		fn set_timeout(&mut self, _timeout: Duration) {}
	}

	#[test]
	fn loopback_round_trip() {
		let mut chan = LoopbackChannel::new();
		chan.write_all(&[1, 2, 3, 4]).unwrap();
		assert_eq!(chan.read_exact(2).unwrap(), vec![1, 2]);
		assert_eq!(chan.read_exact(2).unwrap(), vec![3, 4]);
	}

	#[test]
	fn loopback_short_read_times_out() {
		let mut chan = LoopbackChannel::new();
		chan.write_all(&[1]).unwrap();
		let err = chan.read_exact(2).unwrap_err();
		assert!(matches!(err, ChannelError::Timeout { expected: 2, .. }));
	}
}
