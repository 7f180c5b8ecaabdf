//! UDP ingress: framed edge reports in, events out.
//!
//! Malformed datagrams are logged and dropped. A full event queue drops the
//! event — the edge's own retry loop and the re-push ticker restore
//! convergence. A socket error is fatal for the listener and reported to
//! the main task via the error channel.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use meshplane_core::wire::{decode_frame, ControlPayload};
use meshplane_core::SUPER_ID;
use meshplane_services::EventChannels;

use crate::udp_device::UdpDevice;

const MAX_DATAGRAM: usize = 2048;

pub async fn ingress_loop(
    socket: Arc<UdpSocket>,
    device: Arc<UdpDevice>,
    channels: EventChannels,
    errors: mpsc::Sender<anyhow::Error>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                let _ = errors.send(anyhow::Error::new(e).context("control socket closed")).await;
                return;
            }
        };

        let (header, payload) = match decode_frame(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "undecodable datagram dropped");
                continue;
            }
        };

        let src = header.src.get();
        if src < SUPER_ID {
            device.learn_endpoint(src, addr);
        }

        match payload {
            ControlPayload::Register(event) => {
                channels.offer_register(event);
            }
            ControlPayload::Pong(event) => {
                channels.offer_pong(event);
            }
            ControlPayload::Update(_) => {
                tracing::trace!(%addr, "server update on ingress ignored");
            }
        }
    }
}
