//! Listener side of the reliable channel
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;

use trastero_util::error::Error;

use crate::message::*;

/// Seam between the transport and the node: one handler receives every
/// inbound frame and produces the response frame.
#[async_trait]
pub trait FrameHandler: Send + Sync {
	async fn handle(self: &Arc<Self>, frame: Frame, from: SocketAddr) -> Result<Frame, Error>;
}

/// Accept loop of the reliable channel, one task per inbound connection
pub async fn run_listener<H>(
	bind_addr: SocketAddr,
	handler: Arc<H>,
	max_payload: u64,
	mut must_exit: watch::Receiver<bool>,
) -> Result<(), Error>
where
	H: FrameHandler + 'static,
{
	let listener = TcpListener::bind(bind_addr).await?;
	info!("Reliable channel listening on {}", bind_addr);

	while !*must_exit.borrow() {
		select! {
			accepted = listener.accept() => match accepted {
				Ok((socket, addr)) => {
					let handler = handler.clone();
					let must_exit = must_exit.clone();
					tokio::spawn(async move {
						handle_connection(socket, addr, handler, max_payload, must_exit).await;
					});
				}
				Err(e) => {
					warn!("Error accepting connection: {}", e);
				}
			},
			_ = must_exit.changed() => (),
		}
	}
	Ok(())
}

async fn handle_connection<H>(
	mut socket: TcpStream,
	addr: SocketAddr,
	handler: Arc<H>,
	max_payload: u64,
	mut must_exit: watch::Receiver<bool>,
) where
	H: FrameHandler + 'static,
{
	if let Err(e) = socket.set_nodelay(true) {
		warn!("Could not set TCP_NODELAY on {}: {}", addr, e);
	}

	loop {
		let frame = select! {
			frame = read_frame(&mut socket, max_payload) => frame,
			_ = must_exit.changed() => {
				if *must_exit.borrow() {
					return;
				}
				continue;
			}
		};

		let frame = match frame {
			Ok(frame) => frame,
			Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
				trace!("Connection from {} closed", addr);
				return;
			}
			Err(e) => {
				// a malformed frame poisons the stream, close it
				warn!("Closing connection from {}: {}", addr, e);
				return;
			}
		};

		let correlation = frame.correlation;
		let resp = match handler.handle(frame, addr).await {
			Ok(mut resp) => {
				resp.correlation = correlation;
				resp
			}
			Err(e) => {
				debug!("Request from {} failed: {}", addr, e);
				let payload = encode_payload(&format!("{}", e)).unwrap_or_default();
				Frame::new(OpCode::Error, correlation, payload)
			}
		};

		if let Err(e) = write_frame(&mut socket, &resp).await {
			warn!("Could not answer {}: {}", addr, e);
			return;
		}
	}
}
