//! Demo binary sending oversized messages between two simulated peers.
//!
//! Peer 1 sends `--messages` payloads to peer 2 over an in-process link that
//! drops every `--drop-every`th datagram, then prints each delivery report.

mod cli;

use std::{
    collections::HashMap,
    error::Error,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use clap::Parser;
use fragmentation::{
    DeliveryHandle,
    Endpoint,
    FragmentationConfig,
    Inbox,
    Outbox,
    Target,
    Transport,
    TransportError,
};
use futures::future::join_all;
use tokio::sync::mpsc;

const SENDER: u8 = 1;
const RECEIVER: u8 = 2;

struct Datagram {
    from: u8,
    to: u8,
    bytes: Bytes,
}

/// In-process link that forwards datagrams to a router task.
#[derive(Clone)]
struct LoopbackLink {
    local: u8,
    tx: mpsc::UnboundedSender<Datagram>,
}

impl Transport<u8> for LoopbackLink {
    fn send(&self, target: &Target<u8>, bytes: Bytes) -> Result<(), TransportError> {
        let to = match target {
            Target::Peer(peer) => *peer,
            Target::Broadcast if self.local == SENDER => RECEIVER,
            Target::Broadcast => SENDER,
        };
        self.tx
            .send(Datagram {
                from: self.local,
                to,
                bytes,
            })
            .map_err(|_| TransportError::Closed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let defaults = FragmentationConfig::default();
    let cap = defaults
        .per_sender_cap
        .max(NonZeroUsize::new(cli.messages).unwrap_or(NonZeroUsize::MIN));
    let config = FragmentationConfig {
        mtu: cli.mtu,
        window: cli.window.unwrap_or(defaults.window),
        retransmit_base: Duration::from_millis(cli.retransmit_ms),
        max_rounds: cli.max_rounds,
        per_sender_cap: cap,
        global_cap: defaults.global_cap.max(cap),
        ..defaults
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = |local| LoopbackLink {
        local,
        tx: tx.clone(),
    };
    let outbox = Outbox::with_pacing(link(SENDER), config, cli.pace)?;
    let (inbox, inbox_handle, _sender_deliveries) = Inbox::new(link(SENDER), config)?;
    inbox.spawn();
    let sender = Endpoint::new(outbox, inbox_handle);
    let (receiver, mut delivered) = Endpoint::spawn(link(RECEIVER), config)?;
    let reassembled = tokio::spawn(async move {
        let mut bytes = 0;
        while let Some(message) = delivered.recv().await {
            bytes += message.payload().len();
        }
        bytes
    });

    let endpoints: HashMap<u8, Endpoint<u8, LoopbackLink>> =
        HashMap::from([(SENDER, sender.clone()), (RECEIVER, receiver.clone())]);
    let drop_every = cli.drop_every;
    let routed = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));
    let router_dropped = Arc::clone(&dropped);
    tokio::spawn(async move {
        while let Some(datagram) = rx.recv().await {
            let seq = routed.fetch_add(1, Ordering::Relaxed) + 1;
            if drop_every > 0 && seq % drop_every == 0 {
                router_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(endpoint) = endpoints.get(&datagram.to) {
                // Malformed or refused datagrams count as loss.
                let _ = endpoint.handle_datagram(datagram.from, datagram.bytes);
            }
        }
    });

    let mut handles = Vec::with_capacity(cli.messages);
    for n in 0..cli.messages {
        let body: Vec<u8> = (0..cli.size).map(|i| ((i + n) % 251) as u8).collect();
        handles.push(sender.outbox().send(Target::Peer(RECEIVER), body)?);
    }

    let outcomes = join_all(handles.into_iter().map(DeliveryHandle::outcome)).await;
    for outcome in &outcomes {
        match outcome {
            Ok(report) => println!(
                "message {}: {} fragments, {} transmissions, {} rounds, {:?}",
                report.message_id,
                report.fragments,
                report.transmissions,
                report.rounds,
                report.elapsed
            ),
            Err(err) => println!("{err}"),
        }
    }
    println!(
        "{} datagrams dropped by the link",
        dropped.load(Ordering::Relaxed)
    );

    sender.shutdown();
    receiver.shutdown();
    println!("{} bytes reassembled by the receiver", reassembled.await?);
    Ok(())
}
