//! Simulated datagram network for end-to-end tests.
//!
//! Every [`Link`] pushes outbound datagrams onto one shared channel. A router
//! task applies the configured loss rule and hands surviving datagrams to the
//! destination endpoints, so tests observe the engine through the same entry
//! points a real socket loop would use.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use fragmentation::{
    Endpoint,
    FragmentationConfig,
    ReassembledMessage,
    Target,
    Transport,
    TransportError,
    fragment::{Datagram, decode_datagram},
};
use tokio::sync::mpsc;

/// Decides whether a datagram is lost. Receives the datagram and the number
/// of datagrams routed before it.
pub type LossRule = Arc<dyn Fn(&Bytes, usize) -> bool + Send + Sync>;

struct Packet {
    from: u8,
    target: Target<u8>,
    datagram: Bytes,
}

/// Transport handle owned by one simulated peer.
#[derive(Clone)]
pub struct Link {
    local: u8,
    tx: mpsc::UnboundedSender<Packet>,
}

impl Transport<u8> for Link {
    fn send(&self, target: &Target<u8>, datagram: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(Packet {
                from: self.local,
                target: target.clone(),
                datagram,
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// Transport that loses everything and counts what it was given.
#[derive(Clone, Default)]
pub struct BlackHole {
    pub sent: Arc<AtomicUsize>,
}

impl Transport<u8> for BlackHole {
    fn send(&self, _target: &Target<u8>, _datagram: Bytes) -> Result<(), TransportError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Peers joined by a lossy router.
pub struct Network {
    pub endpoints: HashMap<u8, Endpoint<u8, Link>>,
    pub inboxes: HashMap<u8, mpsc::Receiver<ReassembledMessage<u8>>>,
    pub log: Arc<Mutex<Vec<(u8, Bytes)>>>,
}

impl Network {
    /// Spawn `peers` endpoints sharing `config`, losing datagrams matched by
    /// `loss`.
    pub fn spawn(peers: &[u8], config: FragmentationConfig, loss: LossRule) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        let mut endpoints = HashMap::new();
        let mut inboxes = HashMap::new();
        for &peer in peers {
            let link = Link {
                local: peer,
                tx: tx.clone(),
            };
            let (endpoint, delivered) = Endpoint::spawn(link, config).expect("valid config");
            endpoints.insert(peer, endpoint);
            inboxes.insert(peer, delivered);
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let routes = endpoints.clone();
        let routed_log = Arc::clone(&log);
        tokio::spawn(async move {
            let mut routed = 0;
            while let Some(packet) = rx.recv().await {
                let lost = loss(&packet.datagram, routed);
                routed += 1;
                if lost {
                    continue;
                }
                routed_log
                    .lock()
                    .expect("log poisoned")
                    .push((packet.from, packet.datagram.clone()));
                let destinations: Vec<&Endpoint<u8, Link>> = match &packet.target {
                    Target::Peer(peer) => routes.get(peer).into_iter().collect(),
                    Target::Broadcast => routes
                        .iter()
                        .filter(|(peer, _)| **peer != packet.from)
                        .map(|(_, endpoint)| endpoint)
                        .collect(),
                };
                for endpoint in destinations {
                    // Malformed or saturated deliveries count as loss.
                    let _ = endpoint.handle_datagram(packet.from, packet.datagram.clone());
                }
            }
        });

        Self {
            endpoints,
            inboxes,
            log,
        }
    }

    pub fn endpoint(&self, peer: u8) -> &Endpoint<u8, Link> {
        self.endpoints.get(&peer).expect("known peer")
    }

    pub fn inbox(&mut self, peer: u8) -> &mut mpsc::Receiver<ReassembledMessage<u8>> {
        self.inboxes.get_mut(&peer).expect("known peer")
    }
}

/// Loses nothing.
pub fn lossless() -> LossRule { Arc::new(|_, _| false) }

/// Loses the first transmission of every fragment whose index is in
/// `indices`, and nothing else.
pub fn lose_first_copy_of(indices: &'static [u32]) -> LossRule {
    let seen = Arc::new(Mutex::new(Vec::new()));
    Arc::new(move |datagram, _| {
        let Ok(Some(Datagram::Fragment { header, .. })) = decode_datagram(datagram) else {
            return false;
        };
        let key = (header.message_id(), header.fragment_index().get());
        let mut seen = seen.lock().expect("seen poisoned");
        if !indices.contains(&key.1) || seen.contains(&key) {
            return false;
        }
        seen.push(key);
        true
    })
}

/// Loses every acknowledgment until `count` have been dropped.
pub fn lose_acks(count: usize) -> LossRule {
    let dropped = Arc::new(AtomicUsize::new(0));
    Arc::new(move |datagram, _| {
        let is_ack = matches!(decode_datagram(datagram), Ok(Some(Datagram::Ack(_))));
        is_ack && dropped.fetch_add(1, Ordering::SeqCst) < count
    })
}

/// Test payload with a recognisable pattern.
pub fn pattern(len: usize) -> Vec<u8> { (0..len).map(|i| (i % 239) as u8).collect() }
