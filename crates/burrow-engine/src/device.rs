// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use crate::ipc;
use crate::netstack::{VirtualTcpListener, VirtualTcpStream, VirtualTun};
use burrow_common::{Key, PublicKey};
use defguard_boringtun::noise::{Tunn, TunnResult};
use defguard_boringtun::x25519;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

const TRANSMIT_POLL_INTERVAL: Duration = Duration::from_millis(1);
const TIMER_TICK_INTERVAL: Duration = Duration::from_millis(250);

// Encrypted packets carry a 32 byte overhead; handshake messages need 148.
fn wg_buffer_size(payload_len: usize) -> usize {
	(payload_len + 32).max(148)
}

pub(crate) struct PeerState {
	pub(crate) public_key: PublicKey,
	pub(crate) allowed_ips: Vec<Ipv6Addr>,
	tunn: Mutex<Tunn>,
	endpoint: RwLock<Option<SocketAddr>>,
}

/// A point-in-time view of one device peer.
#[derive(Debug, Clone)]
pub struct PeerStats {
	pub public_key: PublicKey,
	pub endpoint: Option<SocketAddr>,
	pub time_since_last_handshake: Option<Duration>,
}

struct DeviceState {
	private_key: Option<Key>,
	listen_port: u16,
	peers: Vec<Arc<PeerState>>,
}

/// An in-process WireGuard device: one noise tunnel per peer, a UDP socket
/// towards the real network, and a [`VirtualTun`] towards the virtual one.
/// Configured through a textual `key=value` command channel ([`ipc_set`]),
/// mirroring the kernel implementation's UAPI.
///
/// [`ipc_set`]: WgDevice::ipc_set
pub struct WgDevice {
	tun: VirtualTun,
	state: RwLock<DeviceState>,
	socket: RwLock<Option<Arc<UdpSocket>>>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	running: AtomicBool,
}

impl WgDevice {
	pub fn new(tun: VirtualTun) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Self {
			tun,
			state: RwLock::new(DeviceState {
				private_key: None,
				listen_port: 0,
				peers: Vec::new(),
			}),
			socket: RwLock::new(None),
			shutdown_tx,
			shutdown_rx,
			running: AtomicBool::new(false),
		}
	}

	/// Applies a textual configuration. Device-level keys (`private_key`,
	/// `listen_port`) come first; each `public_key` line opens a peer section
	/// with `allowed_ip`, `endpoint`, and `persistent_keepalive_interval`
	/// lines. Adding an already-known peer replaces its configuration.
	#[instrument(skip_all)]
	pub async fn ipc_set(&self, config: &str) -> Result<()> {
		let update = ipc::parse(config)?;

		let mut state = self.state.write().await;

		if let Some(key) = update.private_key {
			state.private_key = Some(key);
		}
		if let Some(port) = update.listen_port {
			state.listen_port = port;
		}

		for peer in update.peers {
			let private_key = state
				.private_key
				.as_ref()
				.ok_or_else(|| EngineError::Ipc("private_key must be set before adding peers".to_string()))?;

			let tunn = Tunn::new(
				x25519::StaticSecret::from(*private_key.expose_bytes()),
				x25519::PublicKey::from(*peer.public_key.as_bytes()),
				None,
				peer.persistent_keepalive,
				fastrand::u32(0..(1 << 24)),
				None,
			);

			let peer_state = Arc::new(PeerState {
				public_key: peer.public_key,
				allowed_ips: peer.allowed_ips,
				tunn: Mutex::new(tunn),
				endpoint: RwLock::new(peer.endpoint),
			});

			state.peers.retain(|p| p.public_key != peer.public_key);
			state.peers.push(peer_state);
			debug!(peer = %peer.public_key, "configured peer");
		}

		Ok(())
	}

	/// Binds the UDP socket and starts the packet-processing tasks.
	#[instrument(skip(self))]
	pub async fn up(self: &Arc<Self>) -> Result<()> {
		if self.running.swap(true, Ordering::SeqCst) {
			return Err(EngineError::AlreadyRunning);
		}

		let listen_port = self.state.read().await.listen_port;
		let socket = match bind_udp_socket(listen_port) {
			Ok(socket) => Arc::new(socket),
			Err(e) => {
				self.running.store(false, Ordering::SeqCst);
				return Err(e);
			}
		};
		*self.socket.write().await = Some(Arc::clone(&socket));

		info!(listen_port, "wireguard device up");

		Arc::clone(self).spawn_recv_loop(Arc::clone(&socket));
		Arc::clone(self).spawn_transmit_loop(Arc::clone(&socket));
		Arc::clone(self).spawn_timer_loop(Arc::clone(&socket));

		// Peers with a configured endpoint (the client side) handshake
		// eagerly so the server learns our address before any data flows.
		self.initiate_handshakes(&socket).await;

		Ok(())
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// The address of the bound UDP socket, once the device is up.
	pub async fn local_addr(&self) -> Result<SocketAddr> {
		let socket = self.socket.read().await;
		let socket = socket.as_ref().ok_or(EngineError::NotRunning)?;
		Ok(socket.local_addr()?)
	}

	pub async fn lookup_peer(&self, public_key: &PublicKey) -> Option<PeerStats> {
		let state = self.state.read().await;
		let peer = state.peers.iter().find(|p| p.public_key == *public_key)?;

		let (time_since_last_handshake, ..) = peer.tunn.lock().await.stats();
		let stats = PeerStats {
			public_key: peer.public_key,
			endpoint: *peer.endpoint.read().await,
			time_since_last_handshake,
		};
		Some(stats)
	}

	#[instrument(skip(self), fields(peer = %public_key))]
	pub async fn remove_peer(&self, public_key: &PublicKey) -> bool {
		let mut state = self.state.write().await;
		let before = state.peers.len();
		state.peers.retain(|p| p.public_key != *public_key);

		let removed = state.peers.len() != before;
		if removed {
			info!("removed peer");
		}
		removed
	}

	#[instrument(skip(self))]
	pub async fn remove_all_peers(&self) {
		let mut state = self.state.write().await;
		let count = state.peers.len();
		state.peers.clear();
		if count > 0 {
			info!(count, "removed all peers");
		}
	}

	pub async fn peer_count(&self) -> usize {
		self.state.read().await.peers.len()
	}

	pub fn tun(&self) -> &VirtualTun {
		&self.tun
	}

	/// Starts a TCP listener on `port` inside the virtual network.
	pub fn tcp_listener(&self, port: u16) -> Result<VirtualTcpListener> {
		self.tun.listen_tcp(port)
	}

	/// Dials a TCP address inside the virtual network. The caller bounds the
	/// attempt with its own timeout.
	pub async fn tcp_connect(&self, addr: SocketAddrV6) -> Result<VirtualTcpStream> {
		self.tun.dial_tcp(addr).await
	}

	/// Signals every task to stop. Peers should be removed first; see the
	/// shutdown ordering note on the server and client lifecycles.
	#[instrument(skip(self))]
	pub async fn close(&self) {
		info!("shutting down wireguard device");
		let _ = self.shutdown_tx.send(true);
		self.running.store(false, Ordering::SeqCst);
		*self.socket.write().await = None;
	}

	/// Resolves once the device has been closed.
	pub async fn wait(&self) {
		let mut rx = self.shutdown_rx.clone();
		while !*rx.borrow() {
			if rx.changed().await.is_err() {
				break;
			}
		}
	}

	fn spawn_recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> tokio::task::JoinHandle<()> {
		let device = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut buf = vec![0u8; 65536];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("recv loop shutting down");
							break;
						}
					}

					result = socket.recv_from(&mut buf) => {
						match result {
							Ok((len, src)) => {
								if let Err(e) = device.handle_incoming(&socket, src, &buf[..len]).await {
									warn!(%src, error = %e, "failed to handle datagram");
								}
							}
							Err(e) => {
								warn!(error = %e, "udp recv error");
							}
						}
					}
				}
			}
		})
	}

	fn spawn_transmit_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> tokio::task::JoinHandle<()> {
		let device = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("transmit loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(TRANSMIT_POLL_INTERVAL) => {
						if let Err(e) = device.flush_outbound(&socket).await {
							warn!(error = %e, "failed to flush outbound packets");
						}
					}
				}
			}
		})
	}

	fn spawn_timer_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> tokio::task::JoinHandle<()> {
		let device = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; wg_buffer_size(0)];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("timer loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(TIMER_TICK_INTERVAL) => {
						let peers = device.state.read().await.peers.clone();
						for peer in peers {
							let (packet, endpoint) = {
								let mut tunn = peer.tunn.lock().await;
								let result = tunn.update_timers(&mut dst_buf);
								let packet = match result {
									TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
									TunnResult::Err(e) => {
										debug!(peer = %peer.public_key, ?e, "timer update error");
										None
									}
									_ => None,
								};
								(packet, *peer.endpoint.read().await)
							};

							if let (Some(packet), Some(endpoint)) = (packet, endpoint) {
								trace!(peer = %peer.public_key, len = packet.len(), "sending timer packet");
								if let Err(e) = socket.send_to(&packet, endpoint).await {
									warn!(peer = %peer.public_key, error = %e, "failed to send timer packet");
								}
							}
						}
					}
				}
			}
		})
	}

	async fn initiate_handshakes(&self, socket: &UdpSocket) {
		let peers = self.state.read().await.peers.clone();
		let mut dst_buf = vec![0u8; wg_buffer_size(0)];

		for peer in peers {
			let endpoint = *peer.endpoint.read().await;
			let Some(endpoint) = endpoint else { continue };

			let packet = {
				let mut tunn = peer.tunn.lock().await;
				match tunn.format_handshake_initiation(&mut dst_buf, false) {
					TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
					_ => None,
				}
			};

			if let Some(packet) = packet {
				debug!(peer = %peer.public_key, %endpoint, "sending handshake initiation");
				if let Err(e) = socket.send_to(&packet, endpoint).await {
					warn!(peer = %peer.public_key, error = %e, "failed to send handshake initiation");
				}
			}
		}
	}

	async fn handle_incoming(&self, socket: &UdpSocket, src: SocketAddr, data: &[u8]) -> Result<()> {
		let peers = self.state.read().await.peers.clone();

		// Try the peer we last saw at this address first; otherwise fall back
		// to trial decapsulation, which also implements endpoint roaming.
		let mut ordered: Vec<Arc<PeerState>> = Vec::with_capacity(peers.len());
		for peer in &peers {
			if *peer.endpoint.read().await == Some(src) {
				ordered.push(Arc::clone(peer));
			}
		}
		for peer in &peers {
			if !ordered.iter().any(|p| p.public_key == peer.public_key) {
				ordered.push(Arc::clone(peer));
			}
		}

		let mut dst_buf = vec![0u8; wg_buffer_size(data.len())];

		for peer in ordered {
			let mut datagrams: Vec<Vec<u8>> = Vec::new();
			let mut inbound: Vec<Vec<u8>> = Vec::new();

			let handled = {
				let mut tunn = peer.tunn.lock().await;
				let mut handled = false;
				let mut result = tunn.decapsulate(Some(src.ip()), data, &mut dst_buf);

				loop {
					match result {
						TunnResult::WriteToNetwork(packet) => {
							datagrams.push(packet.to_vec());
							handled = true;
							result = tunn.decapsulate(None, &[], &mut dst_buf);
						}
						TunnResult::WriteToTunnelV6(packet, _) => {
							inbound.push(packet.to_vec());
							handled = true;
							break;
						}
						TunnResult::WriteToTunnelV4(packet, _) => {
							inbound.push(packet.to_vec());
							handled = true;
							break;
						}
						TunnResult::Done => {
							handled = true;
							break;
						}
						TunnResult::Err(_) => break,
					}
				}

				handled
			};

			if !handled {
				continue;
			}

			*peer.endpoint.write().await = Some(src);

			for datagram in datagrams {
				socket.send_to(&datagram, src).await?;
			}
			for packet in inbound {
				trace!(peer = %peer.public_key, len = packet.len(), "decrypted packet for virtual TUN");
				self.tun.receive_packet(&packet)?;
			}

			// Responses (ACKs and the like) may be ready immediately.
			self.flush_outbound(socket).await?;
			return Ok(());
		}

		trace!(%src, len = data.len(), "datagram did not match any peer");
		Ok(())
	}

	async fn flush_outbound(&self, socket: &UdpSocket) -> Result<()> {
		let mut dst_buf: Vec<u8> = Vec::new();

		while let Some(packet) = self.tun.transmit_packet() {
			if packet.len() < 40 {
				continue;
			}
			let Some(dst) = extract_ipv6_dst(&packet) else {
				continue;
			};

			let peers = self.state.read().await.peers.clone();
			let Some(peer) = peers.iter().find(|p| p.allowed_ips.contains(&dst)) else {
				trace!(%dst, "no peer route for outbound packet");
				continue;
			};

			let needed = wg_buffer_size(packet.len());
			if dst_buf.len() < needed {
				dst_buf.resize(needed, 0);
			}

			let (out, endpoint) = {
				let mut tunn = peer.tunn.lock().await;
				let out = match tunn.encapsulate(&packet, &mut dst_buf) {
					TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
					TunnResult::Err(e) => {
						debug!(peer = %peer.public_key, ?e, "encapsulate error");
						None
					}
					_ => None,
				};
				(out, *peer.endpoint.read().await)
			};

			match (out, endpoint) {
				(Some(out), Some(endpoint)) => {
					socket.send_to(&out, endpoint).await?;
				}
				(Some(_), None) => {
					trace!(peer = %peer.public_key, "dropping packet for peer without endpoint");
				}
				_ => {}
			}
		}

		Ok(())
	}
}

fn bind_udp_socket(listen_port: u16) -> Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_only_v6(false)?;
	socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), listen_port).into())?;
	socket.set_nonblocking(true)?;
	Ok(UdpSocket::from_std(socket.into())?)
}

fn extract_ipv6_dst(packet: &[u8]) -> Option<Ipv6Addr> {
	if packet.len() < 40 {
		return None;
	}

	let version = packet[0] >> 4;
	if version != 6 {
		return None;
	}

	let mut dst_bytes = [0u8; 16];
	dst_bytes.copy_from_slice(&packet[24..40]);
	Some(Ipv6Addr::from(dst_bytes))
}

#[cfg(test)]
mod tests {
	use super::*;
	use burrow_common::Key;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[test]
	fn extract_ipv6_dst_reads_destination() {
		let mut packet = vec![0u8; 40];
		packet[0] = 0x60;

		let dst: Ipv6Addr = "fcca::2".parse().unwrap();
		packet[24..40].copy_from_slice(&dst.octets());

		assert_eq!(extract_ipv6_dst(&packet), Some(dst));
	}

	#[test]
	fn extract_ipv6_dst_rejects_short_and_v4() {
		assert!(extract_ipv6_dst(&[0u8; 20]).is_none());

		let mut packet = vec![0u8; 40];
		packet[0] = 0x45;
		assert!(extract_ipv6_dst(&packet).is_none());
	}

	#[tokio::test]
	async fn ipc_set_requires_private_key_for_peers() {
		let tun = VirtualTun::new("fcca::1".parse().unwrap(), 1280).unwrap();
		let device = WgDevice::new(tun);

		let peer = Key::generate().public();
		let err = device
			.ipc_set(&format!("public_key={}\nallowed_ip=fcca::2/128", peer.to_hex()))
			.await
			.unwrap_err();
		assert!(matches!(err, EngineError::Ipc(_)));
	}

	#[tokio::test]
	async fn ipc_set_adds_and_replaces_peers() {
		let tun = VirtualTun::new("fcca::1".parse().unwrap(), 1280).unwrap();
		let device = WgDevice::new(tun);

		let key = Key::generate();
		let peer = Key::generate().public();

		device
			.ipc_set(&format!("private_key={}\nlisten_port=0", key.to_hex()))
			.await
			.unwrap();
		device
			.ipc_set(&format!("public_key={}\nallowed_ip=fcca::2/128", peer.to_hex()))
			.await
			.unwrap();
		assert_eq!(device.peer_count().await, 1);
		assert!(device.lookup_peer(&peer).await.is_some());

		// Re-adding the same key must not create a duplicate.
		device
			.ipc_set(&format!("public_key={}\nallowed_ip=fcca::3/128", peer.to_hex()))
			.await
			.unwrap();
		assert_eq!(device.peer_count().await, 1);

		assert!(device.remove_peer(&peer).await);
		assert!(device.lookup_peer(&peer).await.is_none());
	}

	// Two devices handshake over loopback UDP and exchange bytes on a
	// virtual TCP connection.
	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn tcp_roundtrip_between_two_devices() {
		let server_key = Key::generate();
		let client_key = Key::generate();
		let server_ip: Ipv6Addr = "fcca::1".parse().unwrap();
		let client_ip: Ipv6Addr = "fcca::2".parse().unwrap();

		let server = Arc::new(WgDevice::new(VirtualTun::new(server_ip, 1280).unwrap()));
		server
			.ipc_set(&format!("private_key={}\nlisten_port=0", server_key.to_hex()))
			.await
			.unwrap();
		server
			.ipc_set(&format!(
				"public_key={}\nallowed_ip={}/128",
				client_key.public().to_hex(),
				client_ip
			))
			.await
			.unwrap();
		server.up().await.unwrap();

		let server_port = server.local_addr().await.unwrap().port();

		let client = Arc::new(WgDevice::new(VirtualTun::new(client_ip, 1280).unwrap()));
		client
			.ipc_set(&format!(
				"private_key={}\npublic_key={}\nendpoint=127.0.0.1:{}\npersistent_keepalive_interval=5\nallowed_ip={}/128",
				client_key.to_hex(),
				server_key.public().to_hex(),
				server_port,
				server_ip
			))
			.await
			.unwrap();
		client.up().await.unwrap();

		let listener = client.tcp_listener(8080).unwrap();
		let accept_task = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 4];
			stream.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"ping");
			stream.write_all(b"pong").await.unwrap();
			stream.flush().await.unwrap();
		});

		let addr = SocketAddrV6::new(client_ip, 8080, 0, 0);
		let mut stream = tokio::time::timeout(Duration::from_secs(15), server.tcp_connect(addr))
			.await
			.expect("dial timed out")
			.unwrap();

		stream.write_all(b"ping").await.unwrap();
		stream.flush().await.unwrap();

		let mut buf = [0u8; 4];
		tokio::time::timeout(Duration::from_secs(15), stream.read_exact(&mut buf))
			.await
			.expect("read timed out")
			.unwrap();
		assert_eq!(&buf, b"pong");

		accept_task.await.unwrap();

		client.remove_all_peers().await;
		client.close().await;
		server.remove_all_peers().await;
		server.close().await;
	}
}
