//! Local dialer: connects each channel the gateway opens to the local service.

use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::tunnel::{ControlPacket, VirtualConnection};

#[derive(Debug, Clone)]
pub struct LocalDialer {
    service: String,
    connect_timeout: Duration,
}

impl LocalDialer {
    pub fn new(service: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            connect_timeout,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Serve `connection` on a background task.
    pub fn spawn(&self, connection: VirtualConnection, ip: String, port: u16) -> JoinHandle<()> {
        let dialer = self.clone();
        let span = info_span!("channel", channel_id = connection.channel_id());
        tokio::spawn(async move { dialer.serve(connection, &ip, port).await }.instrument(span))
    }

    /// Dial the local service and pipe bytes both ways until either side is
    /// done. A failed dial closes the channel, which the gateway sees as
    /// `ConnectionEnd`.
    pub async fn serve(&self, mut connection: VirtualConnection, ip: &str, port: u16) {
        let channel_id = connection.channel_id();
        let connect = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.service.as_str()));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(channel_id, service = %self.service, error = %e, "Local service unreachable");
                connection.close();
                return;
            }
            Err(_) => {
                warn!(
                    channel_id,
                    service = %self.service,
                    timeout_secs = self.connect_timeout.as_secs(),
                    "Timed out connecting to local service"
                );
                connection.close();
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let ack = ControlPacket::AckConnectionOpen { channel_id };
        if let Err(e) = connection.session().send_control_packet(&ack).await {
            debug!(channel_id, error = %e, "Session ended before the channel was acknowledged");
            return;
        }
        debug!(channel_id, client_ip = %ip, client_port = port, "Bridging channel to local service");

        match copy_bidirectional(&mut connection, &mut stream).await {
            Ok((to_service, to_gateway)) => {
                debug!(channel_id, to_service, to_gateway, "Channel finished");
            }
            Err(e) => debug!(channel_id, error = %e, "Channel ended with error"),
        }
        connection.close();
    }
}
