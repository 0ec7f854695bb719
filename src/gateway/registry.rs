//! The one tunnel slot the gateway serves, plus gateway-wide counters.
//!
//! Registration goes `Vacant -> Handshaking -> Active`. A [`Reservation`]
//! holds the slot while the handshake runs and gives it back on drop unless
//! it was activated, so a failed or timed-out handshake never leaves the
//! gateway stuck in `Handshaking`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::tunnel::{TunnelError, TunnelSession, VirtualConnection};

enum Slot {
    Vacant,
    Handshaking,
    Active(TunnelSession),
}

/// Lock-free counters exposed on the health endpoint.
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub registrations: AtomicU64,
    pub rejected_registrations: AtomicU64,
    pub channels_opened: AtomicU64,
    pub channels_closed: AtomicU64,
    pub bridge_failures: AtomicU64,
}

impl TunnelStats {
    pub fn snapshot(&self) -> [(&'static str, u64); 5] {
        [
            ("registrations", self.registrations.load(Ordering::Relaxed)),
            (
                "rejected_registrations",
                self.rejected_registrations.load(Ordering::Relaxed),
            ),
            ("channels_opened", self.channels_opened.load(Ordering::Relaxed)),
            ("channels_closed", self.channels_closed.load(Ordering::Relaxed)),
            ("bridge_failures", self.bridge_failures.load(Ordering::Relaxed)),
        ]
    }
}

#[derive(Clone)]
pub struct TunnelRegistry {
    slot: Arc<Mutex<Slot>>,
    pub stats: Arc<TunnelStats>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Vacant)),
            stats: Arc::new(TunnelStats::default()),
        }
    }

    /// Claim the slot for a handshake. `None` if a tunnel is registered or
    /// another registration is in progress.
    pub fn try_reserve(&self) -> Option<Reservation> {
        let mut slot = self.slot();
        if !matches!(*slot, Slot::Vacant) {
            self.stats
                .rejected_registrations
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }
        *slot = Slot::Handshaking;
        Some(Reservation {
            registry: self.clone(),
            activated: false,
        })
    }

    /// The registered session, if it has not ended.
    pub fn current(&self) -> Option<TunnelSession> {
        match &*self.slot() {
            Slot::Active(session) if !session.is_ended() => Some(session.clone()),
            _ => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.current().is_some()
    }

    /// Open a channel on the registered tunnel for a client at `ip:port`.
    pub async fn allocate_virtual_connection(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> Result<VirtualConnection, TunnelError> {
        let session = self.current().ok_or(TunnelError::NoActiveSession)?;
        let connection = session.open_channel(&ip.to_string(), port).await?;
        self.stats.channels_opened.fetch_add(1, Ordering::Relaxed);
        Ok(connection)
    }

    /// Free the slot if it still holds `session`.
    pub fn release(&self, session: &TunnelSession) {
        let mut slot = self.slot();
        if matches!(&*slot, Slot::Active(current) if current.same_session(session)) {
            *slot = Slot::Vacant;
            info!("Tunnel unregistered");
        }
    }

    /// Close the registered session, if any.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.slot(), Slot::Vacant);
        if let Slot::Active(session) = previous {
            info!("Closing registered tunnel");
            session.close();
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the registry slot while a handshake runs.
pub struct Reservation {
    registry: TunnelRegistry,
    activated: bool,
}

impl Reservation {
    /// Install the handshaken session as the registered tunnel.
    pub fn activate(mut self, session: TunnelSession) {
        *self.registry.slot() = Slot::Active(session);
        self.registry
            .stats
            .registrations
            .fetch_add(1, Ordering::Relaxed);
        self.activated = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.activated {
            return;
        }
        let mut slot = self.registry.slot();
        if matches!(*slot, Slot::Handshaking) {
            *slot = Slot::Vacant;
        }
    }
}
