//! The daemon's reactor.
//!
//! One task owns all mutable state (the engine, the telemetry provider and
//! the client table) and multiplexes three event sources: accepts on the
//! listening socket, a 1 Hz reconciliation tick, and parsed requests
//! arriving from per-client reader tasks over a channel. Reader tasks never
//! touch state; they only turn socket records into events, so every
//! mutation happens here, run-to-completion, between awaits.

use anyhow::{Context, Result};
use gpuclaim::config::Config;
use gpuclaim::core::devices::{DevNodes, KillProbe};
use gpuclaim::core::engine::{ClaimAdmission, Engine};
use gpuclaim::net::{SeqPacketConn, SeqPacketListener};
use gpuclaim::protocol::{self, ClaimResponse, Request, MAX_RECORD};
use gpuclaim::telemetry::{NvmlProvider, Provider};
use gpuclaim::utils::{monotonic_ms, wall_ms};
use serde::Serialize;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

struct ClientConn {
    id: u64,
    conn: Rc<SeqPacketConn>,
    uid: u32,
    pid: i32,
    connected_at: Instant,
    /// Held open past the sweep window while a queued claim is undecided.
    awaiting_queue: bool,
}

enum ClientEvent {
    Request { client_id: u64, request: Request },
    Gone { client_id: u64 },
}

struct Daemon {
    config: Config,
    engine: Engine,
    provider: Box<dyn Provider>,
    clients: Vec<ClientConn>,
    next_client_id: u64,
}

pub async fn run(config: Config) -> Result<()> {
    let listener = SeqPacketListener::bind(&config.socket_path).with_context(|| {
        format!(
            "could not create unix socket at {}",
            config.socket_path.display()
        )
    })?;
    info!("listening on {}", config.socket_path.display());

    let mut provider: Box<dyn Provider> = Box::new(NvmlProvider::new());
    let cards = provider.init()?;
    info!("initialized with {} cards", cards.len());

    let idle_timeout_ms = config.idle_timeout_secs * 1000;
    let per_user_cap = config.gpu_limit_per_user;
    let engine = Engine::new(
        cards,
        Box::new(DevNodes),
        Box::new(KillProbe),
        per_user_cap,
        idle_timeout_ms,
    );

    let mut daemon = Daemon {
        config,
        engine,
        provider,
        clients: Vec::new(),
        next_client_id: 0,
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    // The first tick fires immediately, so the card table is reconciled
    // before the first client is served.
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("could not install SIGTERM handler")?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => daemon.accept_client(conn, &tx),
                Err(e) => warn!("could not accept client: {}", e),
            },
            _ = tick.tick() => daemon.tick().await?,
            Some(event) = rx.recv() => daemon.handle_event(event).await?,
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("shutting down");
    daemon.provider.shutdown();
    let _ = std::fs::remove_file(&daemon.config.socket_path);
    Ok(())
}

/// Turns records from one client into events. Runs until EOF, an error, or
/// the daemon shuts the connection down from its side.
async fn read_loop(conn: Rc<SeqPacketConn>, client_id: u64, tx: UnboundedSender<ClientEvent>) {
    let mut buf = vec![0u8; MAX_RECORD];
    loop {
        let record = match conn.recv(&mut buf).await {
            Ok(record) => record,
            Err(_) => {
                let _ = tx.send(ClientEvent::Gone { client_id });
                return;
            }
        };
        if record.len == 0 {
            let _ = tx.send(ClientEvent::Gone { client_id });
            return;
        }
        if record.truncated {
            warn!("dropping client: request record exceeded {} bytes", MAX_RECORD);
            let _ = tx.send(ClientEvent::Gone { client_id });
            return;
        }
        match protocol::decode::<Request>(&buf[..record.len]) {
            Ok(request) => {
                if tx.send(ClientEvent::Request { client_id, request }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("client sent a request that could not be parsed: {}", e);
                let _ = tx.send(ClientEvent::Gone { client_id });
                return;
            }
        }
    }
}

impl Daemon {
    fn accept_client(&mut self, conn: SeqPacketConn, tx: &UnboundedSender<ClientEvent>) {
        if self.clients.len() >= self.config.max_clients {
            warn!("dropping connection: client table is full");
            return;
        }
        let creds = match conn.peer_credentials() {
            Ok(creds) => creds,
            Err(e) => {
                warn!("could not read peer credentials: {}", e);
                return;
            }
        };

        let id = self.next_client_id;
        self.next_client_id += 1;
        let conn = Rc::new(conn);
        tokio::task::spawn_local(read_loop(conn.clone(), id, tx.clone()));
        self.clients.push(ClientConn {
            id,
            conn,
            uid: creds.uid(),
            pid: creds.pid(),
            connected_at: Instant::now(),
            awaiting_queue: false,
        });
    }

    async fn handle_event(&mut self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Gone { client_id } => {
                self.remove_client(client_id);
            }
            ClientEvent::Request { client_id, request } => {
                let Some(pos) = self.clients.iter().position(|c| c.id == client_id) else {
                    return Ok(());
                };
                let (uid, pid) = (self.clients[pos].uid, self.clients[pos].pid);

                match request {
                    Request::Status(_) => {
                        let resp = self.engine.status();
                        self.send_and_close(client_id, &resp).await;
                    }
                    Request::Claim(req) => {
                        debug!("claim for {} cards from pid {}", req.num_gpus, pid);
                        match self.engine.handle_claim(uid, pid, req.num_gpus, wall_ms()) {
                            ClaimAdmission::Rejected(resp) => {
                                self.send_and_close(client_id, &resp).await;
                            }
                            ClaimAdmission::Queued => {
                                self.clients[pos].awaiting_queue = true;
                                let replies = self.engine.admission_pass(monotonic_ms())?;
                                self.deliver_claim_replies(replies).await;
                            }
                        }
                    }
                    Request::CoRun(req) => {
                        match self.engine.handle_corun(uid, pid, &req.card_indices) {
                            Ok(resp) => {
                                // Kept open; the sweep collects it once the
                                // front-end has read the reply.
                                self.send_to(client_id, &resp).await;
                            }
                            Err(resp) => self.send_and_close(client_id, &resp).await,
                        }
                    }
                    Request::Release(req) => {
                        let resp = self.engine.handle_release(uid, pid, &req.card_indices)?;
                        self.send_and_close(client_id, &resp).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// The 1 Hz housekeeping pass: telemetry, reconciliation, maintenance
    /// flag, admission, and the sweep of lingering connections.
    async fn tick(&mut self) -> Result<()> {
        let now_ms = monotonic_ms();
        for card in self.engine.cards_mut() {
            if let Err(e) = self.provider.refresh(card, now_ms) {
                warn!("telemetry refresh failed for card {}: {:#}", card.index, e);
            }
        }

        self.engine.reconcile(now_ms)?;
        self.engine
            .set_maintenance(self.config.maintenance_path.exists());

        let replies = self.engine.admission_pass(now_ms)?;
        self.deliver_claim_replies(replies).await;

        let sweep = Duration::from_secs(self.config.client_sweep_secs);
        let stale: Vec<u64> = self
            .clients
            .iter()
            .filter(|c| !c.awaiting_queue && c.connected_at.elapsed() > sweep)
            .map(|c| c.id)
            .collect();
        for client_id in stale {
            debug!("sweeping idle client connection");
            self.remove_client(client_id);
        }
        Ok(())
    }

    async fn deliver_claim_replies(&mut self, replies: Vec<(i32, ClaimResponse)>) {
        for (pid, resp) in replies {
            let waiting = self
                .clients
                .iter()
                .find(|c| c.pid == pid && c.awaiting_queue)
                .map(|c| c.id);
            match waiting {
                Some(client_id) => self.send_and_close(client_id, &resp).await,
                // Jobs are dropped when their client goes away, so this is a
                // race with a disconnect inside the current iteration.
                None => warn!("queue decision for pid {} has no waiting client", pid),
            }
        }
    }

    async fn send_to<T: Serialize>(&mut self, client_id: u64, msg: &T) -> bool {
        let Some((conn, pid)) = self
            .clients
            .iter()
            .find(|c| c.id == client_id)
            .map(|c| (c.conn.clone(), c.pid))
        else {
            return false;
        };
        let bytes = match protocol::encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("could not encode response: {}", e);
                self.remove_client(client_id);
                return false;
            }
        };
        match conn.send(&bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!("could not send response to pid {}: {}", pid, e);
                self.remove_client(client_id);
                false
            }
        }
    }

    async fn send_and_close<T: Serialize>(&mut self, client_id: u64, msg: &T) {
        if self.send_to(client_id, msg).await {
            self.remove_client(client_id);
        }
    }

    fn remove_client(&mut self, client_id: u64) {
        let Some(pos) = self.clients.iter().position(|c| c.id == client_id) else {
            return;
        };
        let client = self.clients.remove(pos);
        self.engine.remove_client_jobs(client.pid);
        // Wake the reader task so it exits and drops its half of the fd.
        client.conn.shutdown();
    }
}
