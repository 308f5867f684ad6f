// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv6Address};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Instant as StdInstant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, instrument, trace, warn};

const TCP_RX_BUFFER_SIZE: usize = 65536;
const TCP_TX_BUFFER_SIZE: usize = 65536;

/// Maximum number of packets in rx/tx queues to prevent memory exhaustion
const MAX_QUEUE_SIZE: usize = 1024;

const ACCEPT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);
const DIAL_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// Listening sockets kept armed per port. An incoming SYN that finds no
/// armed socket is refused, so this bounds how many connections can arrive
/// in one accept cycle.
const LISTEN_BACKLOG: usize = 64;

fn smoltcp_now() -> SmoltcpInstant {
	static START: std::sync::OnceLock<StdInstant> = std::sync::OnceLock::new();
	let start = START.get_or_init(StdInstant::now);
	SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

// Sequential allocation; random picks collide quickly under concurrent
// dials to the same destination.
fn next_ephemeral_port() -> u16 {
	static NEXT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(0);
	49152 + (NEXT.fetch_add(1, Ordering::Relaxed) % 16383)
}

struct QueueDevice {
	rx_queue: VecDeque<Vec<u8>>,
	tx_queue: VecDeque<Vec<u8>>,
	mtu: usize,
}

impl QueueDevice {
	fn new(mtu: u16) -> Self {
		Self {
			rx_queue: VecDeque::new(),
			tx_queue: VecDeque::new(),
			mtu: mtu as usize,
		}
	}
}

struct QueueRxToken {
	data: Vec<u8>,
}

impl RxToken for QueueRxToken {
	fn consume<R, F>(mut self, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		f(&mut self.data)
	}
}

struct QueueTxToken<'a> {
	tx_queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for QueueTxToken<'a> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut buffer = vec![0u8; len];
		let result = f(&mut buffer);
		if self.tx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "tx", "packet queue full, dropping oldest packet");
			self.tx_queue.pop_front();
		}
		self.tx_queue.push_back(buffer);
		result
	}
}

impl Device for QueueDevice {
	type RxToken<'a> = QueueRxToken;
	type TxToken<'a> = QueueTxToken<'a>;

	fn receive(
		&mut self,
		_timestamp: SmoltcpInstant,
	) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		if let Some(data) = self.rx_queue.pop_front() {
			Some((
				QueueRxToken { data },
				QueueTxToken {
					tx_queue: &mut self.tx_queue,
				},
			))
		} else {
			None
		}
	}

	fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
		Some(QueueTxToken {
			tx_queue: &mut self.tx_queue,
		})
	}

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.max_transmission_unit = self.mtu;
		caps.medium = Medium::Ip;
		caps
	}
}

struct TunInner {
	device: QueueDevice,
	iface: Interface,
	sockets: SocketSet<'static>,
	wakers: Vec<Waker>,
	// Handles of closed streams that still need their FIN flushed before the
	// socket slot can be reclaimed.
	graveyard: Vec<SocketHandle>,
}

/// A virtual TUN: a smoltcp interface with a single assigned IPv6 address,
/// fed by in-memory packet queues instead of a kernel device. Cloning is
/// cheap and shares the underlying interface.
pub struct VirtualTun {
	address: Ipv6Addr,
	mtu: u16,
	inner: Arc<Mutex<TunInner>>,
}

impl VirtualTun {
	#[instrument(skip_all, fields(%address, mtu))]
	pub fn new(address: Ipv6Addr, mtu: u16) -> Result<Self> {
		let mut device = QueueDevice::new(mtu);

		let config = Config::new(HardwareAddress::Ip);
		let mut iface = Interface::new(config, &mut device, smoltcp_now());

		let smoltcp_addr = Ipv6Address::from_bytes(&address.octets());
		iface.update_ip_addrs(|addrs| {
			addrs
				.push(IpCidr::new(IpAddress::Ipv6(smoltcp_addr), 128))
				.ok();
		});

		let sockets = SocketSet::new(vec![]);

		debug!("created virtual TUN");

		Ok(Self {
			address,
			mtu,
			inner: Arc::new(Mutex::new(TunInner {
				device,
				iface,
				sockets,
				wakers: Vec::new(),
				graveyard: Vec::new(),
			})),
		})
	}

	/// Injects a decrypted IP packet into the interface, as if it arrived on
	/// the TUN, and wakes any task blocked on socket readiness.
	pub fn receive_packet(&self, data: &[u8]) -> Result<()> {
		let mut inner = self.lock_inner()?;

		if inner.device.rx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "rx", "packet queue full, dropping oldest packet");
			inner.device.rx_queue.pop_front();
		}
		inner.device.rx_queue.push_back(data.to_vec());

		self.poll_iface(&mut inner);

		for waker in inner.wakers.drain(..) {
			waker.wake();
		}

		trace!(len = data.len(), "received packet into virtual TUN");
		Ok(())
	}

	/// Pops the next outbound IP packet produced by the interface, if any.
	pub fn transmit_packet(&self) -> Option<Vec<u8>> {
		let mut inner = self.inner.lock().ok()?;

		self.poll_iface(&mut inner);

		inner.device.tx_queue.pop_front()
	}

	pub fn poll(&self) -> bool {
		let mut inner = match self.inner.lock() {
			Ok(i) => i,
			Err(_) => return false,
		};

		self.poll_iface(&mut inner)
	}

	fn poll_iface(&self, inner: &mut TunInner) -> bool {
		let timestamp = smoltcp_now();
		let TunInner {
			device,
			iface,
			sockets,
			graveyard,
			..
		} = inner;
		let activity = iface.poll(timestamp, device, sockets);

		// Reclaim closed sockets once their shutdown has fully drained.
		if !graveyard.is_empty() {
			let pending = std::mem::take(graveyard);
			for handle in pending {
				let state = sockets.get::<TcpSocket>(handle).state();
				if state == TcpState::Closed {
					sockets.remove(handle);
				} else {
					graveyard.push(handle);
				}
			}
		}

		activity
	}

	fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, TunInner>> {
		self.inner
			.lock()
			.map_err(|e| EngineError::Device(format!("lock poisoned: {e}")))
	}

	pub fn address(&self) -> Ipv6Addr {
		self.address
	}

	pub fn mtu(&self) -> u16 {
		self.mtu
	}

	fn create_tcp_socket(&self) -> TcpSocket<'static> {
		let rx_buffer = SocketBuffer::new(vec![0u8; TCP_RX_BUFFER_SIZE]);
		let tx_buffer = SocketBuffer::new(vec![0u8; TCP_TX_BUFFER_SIZE]);
		let mut socket = TcpSocket::new(rx_buffer, tx_buffer);
		// Interactive request/response traffic; don't hold small writes.
		socket.set_nagle_enabled(false);
		socket
	}

	fn listen(&self, port: u16) -> Result<SocketHandle> {
		let mut inner = self.lock_inner()?;

		let mut socket = self.create_tcp_socket();
		socket
			.listen(port)
			.map_err(|e| EngineError::Device(format!("listen failed: {e}")))?;

		Ok(inner.sockets.add(socket))
	}

	fn connect(&self, addr: SocketAddrV6) -> Result<SocketHandle> {
		let mut inner = self.lock_inner()?;

		let mut socket = self.create_tcp_socket();

		let local_port = next_ephemeral_port();
		let local_endpoint = smoltcp::wire::IpEndpoint::new(
			IpAddress::Ipv6(Ipv6Address::from_bytes(&self.address.octets())),
			local_port,
		);
		let remote_endpoint = smoltcp::wire::IpEndpoint::new(
			IpAddress::Ipv6(Ipv6Address::from_bytes(&addr.ip().octets())),
			addr.port(),
		);

		socket
			.connect(inner.iface.context(), remote_endpoint, local_endpoint)
			.map_err(|e| EngineError::TcpConnect(format!("connect failed: {e}")))?;

		let handle = inner.sockets.add(socket);
		self.poll_iface(&mut inner);

		debug!(%addr, "connecting to remote");
		Ok(handle)
	}

	fn socket_state(&self, handle: SocketHandle) -> Option<TcpState> {
		let inner = self.inner.lock().ok()?;
		let socket = inner.sockets.get::<TcpSocket>(handle);
		Some(socket.state())
	}

	fn register_waker(&self, waker: Waker) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.wakers.push(waker);
		}
	}

	/// Begins listening on `port` and returns a listener that accepts any
	/// number of connections, keeping a pool of armed sockets so concurrent
	/// connection attempts are not refused.
	pub fn listen_tcp(&self, port: u16) -> Result<VirtualTcpListener> {
		let mut handles = Vec::with_capacity(LISTEN_BACKLOG);
		for _ in 0..LISTEN_BACKLOG {
			handles.push(self.listen(port)?);
		}
		Ok(VirtualTcpListener {
			tun: self.clone(),
			port,
			handles: Mutex::new(handles),
			closed: AtomicBool::new(false),
		})
	}

	/// Opens a TCP connection inside the virtual network. A refused attempt
	/// is retried: the remote listener re-arms between accepts, so a SYN can
	/// land in a window with no armed socket. The caller bounds the whole
	/// dial with its own timeout.
	pub async fn dial_tcp(&self, addr: SocketAddrV6) -> Result<VirtualTcpStream> {
		loop {
			let handle = self.connect(addr)?;
			let stream = VirtualTcpStream {
				tun: self.clone(),
				handle,
			};

			match stream.wait_connected().await {
				Ok(()) => return Ok(stream),
				Err(e) => {
					trace!(%addr, error = %e, "dial attempt failed, retrying");
					drop(stream);
					tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
				}
			}
		}
	}
}

impl Clone for VirtualTun {
	fn clone(&self) -> Self {
		Self {
			address: self.address,
			mtu: self.mtu,
			inner: Arc::clone(&self.inner),
		}
	}
}

pub struct VirtualTcpListener {
	tun: VirtualTun,
	port: u16,
	handles: Mutex<Vec<SocketHandle>>,
	closed: AtomicBool,
}

impl VirtualTcpListener {
	pub async fn accept(&self) -> Result<(VirtualTcpStream, SocketAddrV6)> {
		loop {
			let accepted = {
				let inner = self.tun.lock_inner()?;
				let handles = self
					.handles
					.lock()
					.map_err(|e| EngineError::Device(format!("lock poisoned: {e}")))?;

				if self.closed.load(Ordering::SeqCst) {
					return Err(EngineError::ListenerClosed);
				}

				handles.iter().enumerate().find_map(|(slot, handle)| {
					let socket = inner.sockets.get::<TcpSocket>(*handle);
					if !matches!(socket.state(), TcpState::Established | TcpState::CloseWait) {
						return None;
					}
					socket.remote_endpoint().map(|remote| {
						let IpAddress::Ipv6(v6) = remote.addr;
						(
							slot,
							*handle,
							SocketAddrV6::new(Ipv6Addr::from(v6.0), remote.port, 0, 0),
						)
					})
				})
			};

			if let Some((slot, conn_handle, remote_addr)) = accepted {
				// Re-arm the slot with a fresh listening socket so the port
				// keeps accepting while this connection is served.
				let new_handle = self.tun.listen(self.port)?;
				{
					let mut handles = self
						.handles
						.lock()
						.map_err(|e| EngineError::Device(format!("lock poisoned: {e}")))?;
					handles[slot] = new_handle;
				}

				let stream = VirtualTcpStream {
					tun: self.tun.clone(),
					handle: conn_handle,
				};
				return Ok((stream, remote_addr));
			}

			tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
			self.tun.poll();
		}
	}

	pub fn local_addr(&self) -> SocketAddrV6 {
		SocketAddrV6::new(self.tun.address(), self.port, 0, 0)
	}

	pub fn close(&self) {
		if let (Ok(mut inner), Ok(handles)) = (self.tun.inner.lock(), self.handles.lock()) {
			if self.closed.swap(true, Ordering::SeqCst) {
				return;
			}
			for handle in handles.iter() {
				inner.sockets.remove(*handle);
			}
		}
	}
}

impl Drop for VirtualTcpListener {
	fn drop(&mut self) {
		self.close();
	}
}

pub struct VirtualTcpStream {
	tun: VirtualTun,
	handle: SocketHandle,
}

impl VirtualTcpStream {
	async fn wait_connected(&self) -> Result<()> {
		loop {
			let state = self
				.tun
				.socket_state(self.handle)
				.ok_or_else(|| EngineError::TcpConnect("socket not found".to_string()))?;

			match state {
				TcpState::Established => return Ok(()),
				TcpState::Closed | TcpState::Closing | TcpState::TimeWait => {
					return Err(EngineError::TcpConnect("connection failed".to_string()))
				}
				_ => {
					tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
					self.tun.poll();
				}
			}
		}
	}

	fn poll_read_inner(&self, buf: &mut [u8]) -> io::Result<usize> {
		let mut inner = self
			.tun
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;

		self.tun.poll_iface(&mut inner);

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_recv() {
			match socket.recv_slice(buf) {
				Ok(n) => Ok(n),
				Err(e) => Err(io::Error::other(format!("{e}"))),
			}
		} else if socket.state() == TcpState::Established {
			Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
		} else {
			Ok(0)
		}
	}

	fn poll_write_inner(&self, buf: &[u8]) -> io::Result<usize> {
		let mut inner = self
			.tun
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_send() {
			match socket.send_slice(buf) {
				Ok(n) => {
					self.tun.poll_iface(&mut inner);
					Ok(n)
				}
				Err(e) => Err(io::Error::other(format!("{e}"))),
			}
		} else if matches!(socket.state(), TcpState::Established | TcpState::CloseWait) {
			Err(io::Error::new(io::ErrorKind::WouldBlock, "buffer full"))
		} else {
			Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
		}
	}
}

impl AsyncRead for VirtualTcpStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut TaskContext<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.poll_read_inner(buf.initialize_unfilled()) {
			Ok(n) => {
				buf.advance(n);
				Poll::Ready(Ok(()))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				self.tun.register_waker(cx.waker().clone());
				Poll::Pending
			}
			Err(e) => Poll::Ready(Err(e)),
		}
	}
}

impl AsyncWrite for VirtualTcpStream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut TaskContext<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		match self.poll_write_inner(buf) {
			Ok(n) => Poll::Ready(Ok(n)),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				self.tun.register_waker(cx.waker().clone());
				Poll::Pending
			}
			Err(e) => Poll::Ready(Err(e)),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
		self.tun.poll();
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
		let mut inner = self
			.tun
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
		socket.close();
		self.tun.poll_iface(&mut inner);

		Poll::Ready(Ok(()))
	}
}

impl Drop for VirtualTcpStream {
	fn drop(&mut self) {
		if let Ok(mut inner) = self.tun.inner.lock() {
			let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
			socket.close();
			inner.graveyard.push(self.handle);
			self.tun.poll_iface(&mut inner);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn virtual_tun_creation() {
		let addr: Ipv6Addr = "fcca::1".parse().unwrap();
		let tun = VirtualTun::new(addr, 1280).unwrap();

		assert_eq!(tun.address(), addr);
		assert_eq!(tun.mtu(), 1280);
	}

	#[test]
	fn virtual_tun_clone_shares_interface() {
		let addr: Ipv6Addr = "fcca::1".parse().unwrap();
		let tun1 = VirtualTun::new(addr, 1280).unwrap();
		let tun2 = tun1.clone();

		assert_eq!(tun1.address(), tun2.address());
		assert!(Arc::ptr_eq(&tun1.inner, &tun2.inner));
	}

	#[test]
	fn transmit_queue_starts_empty() {
		let tun = VirtualTun::new("fcca::1".parse().unwrap(), 1280).unwrap();
		assert!(tun.transmit_packet().is_none());
	}

	#[test]
	fn listener_close_is_idempotent() {
		let tun = VirtualTun::new("fcca::1".parse().unwrap(), 1280).unwrap();
		let listener = tun.listen_tcp(8080).unwrap();
		listener.close();
		listener.close();
	}

	#[tokio::test]
	async fn accept_after_close_errors() {
		let tun = VirtualTun::new("fcca::1".parse().unwrap(), 1280).unwrap();
		let listener = tun.listen_tcp(8080).unwrap();
		listener.close();

		assert!(matches!(
			listener.accept().await,
			Err(EngineError::ListenerClosed)
		));
	}
}
