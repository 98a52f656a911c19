use std::{net::Ipv4Addr, sync::Arc};

use log::info;

use crate::{store::TelemetryStore, types::LinkAddress};

/// Events delivered by the network stack, already decoded from its callback
/// payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Station started and is trying to associate.
    Associating,
    /// Associated with the access point; no lease yet.
    Associated,
    /// DHCP lease obtained.
    AddressAssigned(Ipv4Addr),
    /// Link lost, from any state.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected(Ipv4Addr),
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected(_) => "CONNECTED",
        }
    }
}

/// Passive state machine fed by network events. Publishes the address into the
/// telemetry store on entering `Connected` and clears it on entering
/// `Disconnected`.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: ConnectivityState,
    store: Arc<TelemetryStore>,
}

impl ConnectivityMonitor {
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        store.write_address(LinkAddress::NONE);
        Self {
            state: ConnectivityState::Disconnected,
            store,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn handle(&mut self, event: ConnectivityEvent) -> ConnectivityState {
        let next = match (self.state, event) {
            (_, ConnectivityEvent::Lost) => ConnectivityState::Disconnected,
            (ConnectivityState::Connected(_), ConnectivityEvent::Associating) => {
                ConnectivityState::Connecting
            }
            (ConnectivityState::Connected(addr), ConnectivityEvent::Associated) => {
                ConnectivityState::Connected(addr)
            }
            (_, ConnectivityEvent::Associating | ConnectivityEvent::Associated) => {
                ConnectivityState::Connecting
            }
            (_, ConnectivityEvent::AddressAssigned(addr)) => ConnectivityState::Connected(addr),
        };

        if next != self.state {
            self.transition(next);
        }
        self.state
    }

    fn transition(&mut self, next: ConnectivityState) {
        match next {
            ConnectivityState::Connected(addr) => {
                info!("wifi connected, address {addr}");
                self.store.write_address(LinkAddress::from(addr));
            }
            ConnectivityState::Disconnected => {
                info!("wifi disconnected");
                self.store.write_address(LinkAddress::NONE);
            }
            ConnectivityState::Connecting => {
                info!("wifi connecting");
                if matches!(self.state, ConnectivityState::Connected(_)) {
                    self.store.write_address(LinkAddress::NONE);
                }
            }
        }
        self.state = next;
    }
}
