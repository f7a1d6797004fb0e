//! The reservation engine: admission, queueing, reconciliation and release.
//!
//! The engine owns the card table and the waiting queue and is the only
//! place that mutates them. It is deliberately free of sockets, timers and
//! NVML: the daemon feeds it telemetry-refreshed cards and timestamps, and
//! device-node ownership and process probing are injected so the policy can
//! be tested against mocks.

use crate::core::card::{free_indices, reserved_count};
use crate::core::devices::{DeviceOps, ProcessProbe};
use crate::core::queue::JobQueue;
use crate::core::{FREE_OWNER_UID, RESERVED_GROUP_GID};
use crate::protocol::{Card, ClaimResponse, Job, ReleaseResponse, StatusResponse};
use crate::utils::username_for_uid;
use anyhow::Result;
use tracing::info;

pub const ERR_OVER_LIMIT: &str = "Your requested GPU count is over the per-user limit.";
pub const ERR_LIMIT_REACHED: &str = "GPU per-user limit is reached";
pub const ERR_MAINTENANCE: &str =
    "Server is undergoing maintenance and will not accept new jobs.";
pub const ERR_INVALID_GPU: &str = "Invalid GPU number";

/// Outcome of a claim request, before the admission pass has run.
#[derive(Debug)]
pub enum ClaimAdmission {
    /// Rejected up front; send the reply and drop the connection.
    Rejected(ClaimResponse),
    /// Queued; the connection is held open for the deferred reply.
    Queued,
}

pub struct Engine {
    cards: Vec<Card>,
    queue: JobQueue,
    maintenance: bool,
    per_user_cap: u32,
    devices: Box<dyn DeviceOps>,
    probe: Box<dyn ProcessProbe>,
    idle_timeout_ms: u64,
}

impl Engine {
    pub fn new(
        cards: Vec<Card>,
        devices: Box<dyn DeviceOps>,
        probe: Box<dyn ProcessProbe>,
        per_user_cap: u32,
        idle_timeout_ms: u64,
    ) -> Self {
        Self {
            cards,
            queue: JobQueue::default(),
            maintenance: false,
            per_user_cap,
            devices,
            probe,
            idle_timeout_ms,
        }
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn cards_mut(&mut self) -> &mut [Card] {
        &mut self.cards
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn set_maintenance(&mut self, maintenance: bool) {
        if maintenance != self.maintenance {
            info!(
                "maintenance mode {}",
                if maintenance { "entered" } else { "left" }
            );
        }
        self.maintenance = maintenance;
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            cards: self.cards.clone(),
            queue: self.queue.snapshot(),
            maintenance: self.maintenance,
        }
    }

    /// Validate a claim and put it on the queue. The caller must run an
    /// admission pass afterwards to produce any reply.
    pub fn handle_claim(
        &mut self,
        uid: u32,
        client_pid: i32,
        num_gpus: u32,
        submitted_ms: u64,
    ) -> ClaimAdmission {
        if num_gpus > self.per_user_cap {
            return ClaimAdmission::Rejected(ClaimResponse::rejection(ERR_OVER_LIMIT));
        }
        self.queue.push_back(Job {
            uid,
            client_pid,
            num_gpus,
            priority: 0.0,
            submitted_ms,
        });
        ClaimAdmission::Queued
    }

    /// Attach a second client session to cards the caller already owns.
    /// All-or-nothing: any bad index rejects the whole request.
    pub fn handle_corun(
        &mut self,
        uid: u32,
        client_pid: i32,
        card_indices: &[u32],
    ) -> std::result::Result<ClaimResponse, ClaimResponse> {
        for &idx in card_indices {
            let Some(card) = self.cards.get(idx as usize) else {
                return Err(ClaimResponse::rejection(ERR_INVALID_GPU));
            };
            if card.reserved_by_uid != uid {
                return Err(ClaimResponse::rejection(format!(
                    "Card {idx} is not reserved by you"
                )));
            }
        }

        let mut resp = ClaimResponse::default();
        for &idx in card_indices {
            let card = &mut self.cards[idx as usize];
            if !card.client_pids.contains(&client_pid) {
                card.client_pids.push(client_pid);
            }
            resp.claimed_cards.push(card.clone());
        }
        info!("client {} co-running on cards {:?}", client_pid, card_indices);
        Ok(resp)
    }

    /// Release the caller's cards. Validation is per card: failing cards are
    /// reported and skipped, passing cards are released, so a retry after a
    /// partial failure is idempotent.
    pub fn handle_release(
        &mut self,
        uid: u32,
        client_pid: i32,
        card_indices: &[u32],
    ) -> Result<ReleaseResponse> {
        let mut errors = String::new();
        for &idx in card_indices {
            let Some(card) = self.cards.get(idx as usize) else {
                errors.push_str(&format!("Invalid card index {idx}\n"));
                continue;
            };
            if card.reserved_by_uid != uid {
                errors.push_str(&format!("Card {idx} is not reserved by user\n"));
                continue;
            }
            if !card.client_pids.contains(&client_pid) {
                errors.push_str(&format!("Card {idx} is not reserved by your PID\n"));
                continue;
            }
            // The last client off the card must not abandon running work.
            if card.client_pids.len() == 1 {
                if let Some(proc) = card.processes.iter().find(|p| p.uid == uid) {
                    errors.push_str(&format!(
                        "Card {idx} is still in use. Maybe you want to kill the process with PID {}?\n",
                        proc.pid
                    ));
                    continue;
                }
            }
            self.release_from_client(idx as usize, client_pid)?;
        }
        Ok(ReleaseResponse { errors })
    }

    /// Drop a vanished client's queued jobs. Cards keep the pid; the
    /// liveness probe on the next tick decides whether it is gone for good.
    pub fn remove_client_jobs(&mut self, client_pid: i32) {
        self.queue.remove_pid(client_pid);
    }

    /// Walk the queue head-to-tail and grant or reject what can be decided
    /// now. Returns the replies to deliver, tagged with the client pid each
    /// belongs to. Stops at the first job that must keep waiting; later jobs
    /// are never serviced ahead of it.
    pub fn admission_pass(&mut self, now_ms: u64) -> Result<Vec<(i32, ClaimResponse)>> {
        let mut replies = Vec::new();
        loop {
            let Some(job) = self.queue.front() else {
                break;
            };
            let job = job.clone();

            if self.maintenance {
                info!("rejecting job of client {}: maintenance", job.client_pid);
                replies.push((job.client_pid, ClaimResponse::rejection(ERR_MAINTENANCE)));
                self.queue.pop_front();
                continue;
            }

            let free = free_indices(&self.cards);

            let already = reserved_count(&self.cards, job.uid) as u32;
            if already + job.num_gpus > self.per_user_cap {
                info!(
                    "rejecting job of client {}: uid {} would exceed the per-user limit",
                    job.client_pid, job.uid
                );
                replies.push((
                    job.client_pid,
                    ClaimResponse::rejection(ERR_LIMIT_REACHED),
                ));
                self.queue.pop_front();
                continue;
            }

            if job.num_gpus as usize > free.len() {
                // Head-of-line waiting: nothing behind this job may overtake.
                break;
            }

            info!(
                "starting job of client {} ({} cards)",
                job.client_pid, job.num_gpus
            );
            let mut resp = ClaimResponse::default();
            for &idx in free.iter().take(job.num_gpus as usize) {
                self.claim_card(idx, job.uid, job.client_pid, now_ms)?;
                resp.claimed_cards.push(self.cards[idx].clone());
            }
            replies.push((job.client_pid, resp));
            self.queue.pop_front();
        }
        Ok(replies)
    }

    /// Per-tick reconciliation, after telemetry has refreshed the cards:
    /// detach dead client pids and reclaim cards that went idle.
    pub fn reconcile(&mut self, now_ms: u64) -> Result<()> {
        for idx in 0..self.cards.len() {
            let dead: Vec<i32> = {
                let card = &self.cards[idx];
                if card.processes.is_empty() && !card.client_pids.is_empty() {
                    card.client_pids
                        .iter()
                        .copied()
                        .filter(|&pid| !self.probe.alive(pid))
                        .collect()
                } else {
                    Vec::new()
                }
            };
            for pid in dead {
                info!("returning card {}, client {} is not alive anymore", idx, pid);
                self.release_from_client(idx, pid)?;
            }

            let card = &self.cards[idx];
            if card.reserved_by_uid != 0
                && now_ms.saturating_sub(card.last_usage_ms) > self.idle_timeout_ms
            {
                info!("returning card {}, no usage for a long time", idx);
                self.release_card(idx)?;
            }
        }
        Ok(())
    }

    /// Hand a card to `uid`: the device node belongs to them until release.
    fn claim_card(&mut self, idx: usize, uid: u32, client_pid: i32, now_ms: u64) -> Result<()> {
        let minor_id = self.cards[idx].minor_id;
        self.devices
            .set_node_owner(minor_id, uid, RESERVED_GROUP_GID)?;
        let card = &mut self.cards[idx];
        card.reserved_by_uid = uid;
        card.client_pids = vec![client_pid];
        card.last_usage_ms = now_ms;
        info!(
            "card {} claimed by uid {} ({})",
            card.index,
            uid,
            username_for_uid(uid).unwrap_or_else(|| "unknown".into())
        );
        Ok(())
    }

    /// Detach one client from a card; the card is returned to the pool once
    /// no client and no process holds it.
    fn release_from_client(&mut self, idx: usize, client_pid: i32) -> Result<()> {
        let card = &mut self.cards[idx];
        card.client_pids.retain(|&p| p != client_pid);
        if card.client_pids.is_empty() && card.processes.is_empty() {
            self.release_card(idx)?;
        }
        Ok(())
    }

    /// Return a card to the free pool. The lock stays on until the next
    /// telemetry sample confirms the card is quiescent.
    fn release_card(&mut self, idx: usize) -> Result<()> {
        let minor_id = self.cards[idx].minor_id;
        self.devices
            .set_node_owner(minor_id, FREE_OWNER_UID, FREE_OWNER_UID)?;
        self.devices.kill_stragglers(minor_id);
        let card = &mut self.cards[idx];
        card.client_pids.clear();
        card.locked_until_update = true;
        card.reserved_by_uid = 0;
        info!("card {} released", card.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GpuProcess;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Records ownership changes instead of touching /dev.
    struct MockDevices {
        chowns: Arc<Mutex<Vec<(u32, u32, u32)>>>,
        kills: Arc<Mutex<Vec<u32>>>,
    }

    impl DeviceOps for MockDevices {
        fn set_node_owner(&mut self, minor_id: u32, uid: u32, gid: u32) -> Result<()> {
            self.chowns.lock().unwrap().push((minor_id, uid, gid));
            Ok(())
        }

        fn kill_stragglers(&mut self, minor_id: u32) {
            self.kills.lock().unwrap().push(minor_id);
        }
    }

    struct MockProbe {
        alive: Arc<Mutex<HashSet<i32>>>,
    }

    impl ProcessProbe for MockProbe {
        fn alive(&self, pid: i32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    struct Harness {
        engine: Engine,
        chowns: Arc<Mutex<Vec<(u32, u32, u32)>>>,
        kills: Arc<Mutex<Vec<u32>>>,
        alive: Arc<Mutex<HashSet<i32>>>,
    }

    fn harness(num_cards: u32) -> Harness {
        let chowns = Arc::new(Mutex::new(Vec::new()));
        let kills = Arc::new(Mutex::new(Vec::new()));
        let alive = Arc::new(Mutex::new(HashSet::new()));
        let cards = (0..num_cards)
            .map(|i| Card {
                index: i,
                minor_id: i,
                name: format!("Test GPU {i}"),
                uuid: format!("GPU-{i:08}"),
                ..Card::default()
            })
            .collect();
        let engine = Engine::new(
            cards,
            Box::new(MockDevices {
                chowns: chowns.clone(),
                kills: kills.clone(),
            }),
            Box::new(MockProbe {
                alive: alive.clone(),
            }),
            8,
            60_000,
        );
        Harness {
            engine,
            chowns,
            kills,
            alive,
        }
    }

    fn mark_alive(h: &Harness, pid: i32) {
        h.alive.lock().unwrap().insert(pid);
    }

    fn assert_invariants(engine: &Engine) {
        let mut per_uid = std::collections::HashMap::new();
        for card in engine.cards() {
            assert_eq!(
                card.reserved_by_uid == 0,
                card.client_pids.is_empty(),
                "card {} ownership and client pids disagree",
                card.index
            );
            if card.reserved_by_uid != 0 {
                *per_uid.entry(card.reserved_by_uid).or_insert(0u32) += 1;
            }
        }
        for (uid, count) in per_uid {
            assert!(count <= 8, "uid {uid} holds {count} cards");
        }
    }

    #[test]
    fn claim_grants_first_free_card_and_transfers_ownership() {
        let mut h = harness(2);
        mark_alive(&h, 100);

        assert!(matches!(
            h.engine.handle_claim(1001, 100, 1, 0),
            ClaimAdmission::Queued
        ));
        let replies = h.engine.admission_pass(1_000).unwrap();
        assert_eq!(replies.len(), 1);
        let (pid, resp) = &replies[0];
        assert_eq!(*pid, 100);
        assert!(resp.error.is_empty());
        assert_eq!(resp.claimed_cards.len(), 1);
        assert_eq!(resp.claimed_cards[0].index, 0);

        let card = &h.engine.cards()[0];
        assert_eq!(card.reserved_by_uid, 1001);
        assert_eq!(card.client_pids, vec![100]);
        assert_eq!(card.last_usage_ms, 1_000);
        assert_eq!(*h.chowns.lock().unwrap(), vec![(0, 1001, 65534)]);
        assert_invariants(&h.engine);
    }

    #[test]
    fn waiting_claim_is_served_after_release_and_refresh() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        mark_alive(&h, 200);

        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(0).unwrap();

        // Only one card is free, so a claim for two waits at the head.
        h.engine.handle_claim(1002, 200, 2, 0);
        let replies = h.engine.admission_pass(0).unwrap();
        assert!(replies.is_empty());
        assert_eq!(h.engine.queue_len(), 1);

        let resp = h.engine.handle_release(1001, 100, &[0]).unwrap();
        assert!(resp.errors.is_empty());
        assert!(h.engine.cards()[0].is_free());
        assert!(h.engine.cards()[0].locked_until_update);

        // Still blocked: the released card is locked until telemetry
        // confirms it is quiescent.
        assert!(h.engine.admission_pass(0).unwrap().is_empty());

        for card in h.engine.cards_mut() {
            card.locked_until_update = false;
        }
        let replies = h.engine.admission_pass(5_000).unwrap();
        assert_eq!(replies.len(), 1);
        let (pid, resp) = &replies[0];
        assert_eq!(*pid, 200);
        let granted: Vec<u32> = resp.claimed_cards.iter().map(|c| c.index).collect();
        assert_eq!(granted, vec![0, 1]);
        assert_eq!(h.engine.queue_len(), 0);
        assert_invariants(&h.engine);
    }

    #[test]
    fn claim_beyond_remaining_allowance_is_rejected_in_admission() {
        let mut h = harness(8);
        mark_alive(&h, 100);
        for idx in 0..7 {
            let card = &mut h.engine.cards_mut()[idx];
            card.reserved_by_uid = 42;
            card.client_pids = vec![100];
        }

        h.engine.handle_claim(42, 100, 2, 0);
        let replies = h.engine.admission_pass(0).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.error, ERR_LIMIT_REACHED);
        assert!(replies[0].1.claimed_cards.is_empty());
        assert_eq!(h.engine.queue_len(), 0);
    }

    #[test]
    fn oversized_claim_is_rejected_before_queueing() {
        let mut h = harness(2);
        match h.engine.handle_claim(1001, 100, 9, 0) {
            ClaimAdmission::Rejected(resp) => assert_eq!(resp.error, ERR_OVER_LIMIT),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(h.engine.queue_len(), 0);
    }

    #[test]
    fn zero_gpu_claim_succeeds_with_empty_grant() {
        let mut h = harness(1);
        h.engine.handle_claim(1001, 100, 0, 0);
        let replies = h.engine.admission_pass(0).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].1.error.is_empty());
        assert!(replies[0].1.claimed_cards.is_empty());
        assert!(h.engine.cards()[0].is_free());
    }

    #[test]
    fn idle_card_is_reclaimed_after_timeout() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(1_000).unwrap();

        // 60 s of silence is still fine, 61 s is not.
        h.engine.reconcile(61_000).unwrap();
        assert_eq!(h.engine.cards()[0].reserved_by_uid, 1001);

        h.engine.reconcile(62_001).unwrap();
        let card = &h.engine.cards()[0];
        assert!(card.is_free());
        assert!(card.locked_until_update);
        assert_eq!(h.chowns.lock().unwrap().last(), Some(&(0, 0, 0)));
        assert_eq!(*h.kills.lock().unwrap(), vec![0]);
        assert_invariants(&h.engine);
    }

    #[test]
    fn maintenance_rejects_queued_jobs_but_status_is_served() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.set_maintenance(true);

        let replies = h.engine.admission_pass(0).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.error, ERR_MAINTENANCE);
        assert_eq!(h.engine.queue_len(), 0);

        let status = h.engine.status();
        assert!(status.maintenance);
        assert_eq!(status.cards.len(), 2);
    }

    #[test]
    fn dead_client_with_no_processes_frees_the_card() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(0).unwrap();

        // The client process goes away without releasing.
        h.alive.lock().unwrap().remove(&100);
        h.engine.reconcile(1_000).unwrap();
        assert!(h.engine.cards()[0].is_free());
        assert_invariants(&h.engine);
    }

    #[test]
    fn live_client_keeps_idle_card_within_timeout() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(0).unwrap();

        h.engine.reconcile(30_000).unwrap();
        assert_eq!(h.engine.cards()[0].reserved_by_uid, 1001);
    }

    #[test]
    fn disconnected_waiter_never_gets_cards() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        mark_alive(&h, 200);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(0).unwrap();

        h.engine.handle_claim(1002, 200, 1, 0);
        assert_eq!(h.engine.queue_len(), 1);

        h.engine.remove_client_jobs(200);
        assert_eq!(h.engine.queue_len(), 0);

        h.engine.handle_release(1001, 100, &[0]).unwrap();
        for card in h.engine.cards_mut() {
            card.locked_until_update = false;
        }
        assert!(h.engine.admission_pass(0).unwrap().is_empty());
        assert!(h.engine.cards()[0].is_free());
    }

    #[test]
    fn claim_then_release_restores_all_cards_free() {
        let mut h = harness(3);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 2, 0);
        h.engine.admission_pass(0).unwrap();

        let resp = h.engine.handle_release(1001, 100, &[0, 1]).unwrap();
        assert!(resp.errors.is_empty());
        assert!(h.engine.cards().iter().all(|c| c.is_free()));
        assert_invariants(&h.engine);

        // Releasing again reports one error per card and changes nothing.
        let resp = h.engine.handle_release(1001, 100, &[0, 1]).unwrap();
        assert_eq!(
            resp.errors,
            "Card 0 is not reserved by user\nCard 1 is not reserved by user\n"
        );
        assert!(h.engine.cards().iter().all(|c| c.is_free()));
    }

    #[test]
    fn release_validation_reports_each_failing_card() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 2, 0);
        h.engine.admission_pass(0).unwrap();
        h.engine.cards_mut()[1].processes.push(GpuProcess {
            pid: 555,
            uid: 1001,
            memory: 1,
        });

        let resp = h.engine.handle_release(1001, 999, &[0]).unwrap();
        assert_eq!(resp.errors, "Card 0 is not reserved by your PID\n");

        let resp = h.engine.handle_release(1001, 100, &[1]).unwrap();
        assert_eq!(
            resp.errors,
            "Card 1 is still in use. Maybe you want to kill the process with PID 555?\n"
        );
        assert_eq!(h.engine.cards()[1].reserved_by_uid, 1001);

        let resp = h.engine.handle_release(1001, 100, &[9]).unwrap();
        assert_eq!(resp.errors, "Invalid card index 9\n");
    }

    #[test]
    fn release_is_partial_over_mixed_indices() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 2, 0);
        h.engine.admission_pass(0).unwrap();

        let resp = h.engine.handle_release(1001, 100, &[0, 7]).unwrap();
        assert_eq!(resp.errors, "Invalid card index 7\n");
        assert!(h.engine.cards()[0].is_free());
        assert_eq!(h.engine.cards()[1].reserved_by_uid, 1001);
    }

    #[test]
    fn head_of_line_blocking_starves_later_jobs() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        mark_alive(&h, 200);
        // Job A wants more than is free; job B behind it would fit.
        h.engine.handle_claim(1001, 100, 2, 0);
        h.engine.handle_claim(1002, 200, 1, 0);

        // A two-card cluster shrunk to one: A can never run right now, and B
        // must not overtake it.
        let replies = h.engine.admission_pass(0).unwrap();
        assert!(replies.is_empty());
        assert_eq!(h.engine.queue_len(), 2);
        assert!(h.engine.cards()[0].is_free());
    }

    #[test]
    fn one_pass_grants_several_feasible_jobs_in_order() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        mark_alive(&h, 200);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.handle_claim(1002, 200, 1, 0);

        let replies = h.engine.admission_pass(0).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, 100);
        assert_eq!(replies[0].1.claimed_cards[0].index, 0);
        assert_eq!(replies[1].0, 200);
        assert_eq!(replies[1].1.claimed_cards[0].index, 1);
        assert_invariants(&h.engine);
    }

    #[test]
    fn locked_card_is_never_granted() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        h.engine.cards_mut()[0].locked_until_update = true;

        h.engine.handle_claim(1001, 100, 1, 0);
        assert!(h.engine.admission_pass(0).unwrap().is_empty());
        assert!(h.engine.cards()[0].is_free());
        assert_eq!(h.engine.queue_len(), 1);
    }

    #[test]
    fn corun_attaches_second_client_to_owned_cards() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 2, 0);
        h.engine.admission_pass(0).unwrap();

        let resp = h.engine.handle_corun(1001, 300, &[0, 1]).unwrap();
        assert_eq!(resp.claimed_cards.len(), 2);
        assert_eq!(h.engine.cards()[0].client_pids, vec![100, 300]);
        assert_eq!(h.engine.cards()[1].client_pids, vec![100, 300]);
        assert_invariants(&h.engine);
    }

    #[test]
    fn corun_rejects_whole_request_on_any_bad_card() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(0).unwrap();

        // Card 1 is free, so the whole request fails and card 0 is not
        // touched either.
        let err = h.engine.handle_corun(1001, 300, &[0, 1]).unwrap_err();
        assert_eq!(err.error, "Card 1 is not reserved by you");
        assert_eq!(h.engine.cards()[0].client_pids, vec![100]);

        let err = h.engine.handle_corun(1001, 300, &[5]).unwrap_err();
        assert_eq!(err.error, ERR_INVALID_GPU);
    }

    #[test]
    fn shared_card_is_released_only_by_the_last_client() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        mark_alive(&h, 300);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(0).unwrap();
        h.engine.handle_corun(1001, 300, &[0]).unwrap();

        let resp = h.engine.handle_release(1001, 100, &[0]).unwrap();
        assert!(resp.errors.is_empty());
        let card = &h.engine.cards()[0];
        assert_eq!(card.reserved_by_uid, 1001);
        assert_eq!(card.client_pids, vec![300]);

        let resp = h.engine.handle_release(1001, 300, &[0]).unwrap();
        assert!(resp.errors.is_empty());
        assert!(h.engine.cards()[0].is_free());
        assert_invariants(&h.engine);
    }

    #[test]
    fn status_is_stable_between_mutations() {
        let mut h = harness(2);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 1, 7);
        h.engine.admission_pass(7).unwrap();

        let first = crate::protocol::encode(&h.engine.status()).unwrap();
        let second = crate::protocol::encode(&h.engine.status()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn busy_card_with_other_clients_detaches_without_release() {
        let mut h = harness(1);
        mark_alive(&h, 100);
        h.engine.handle_claim(1001, 100, 1, 0);
        h.engine.admission_pass(0).unwrap();
        h.engine.handle_corun(1001, 300, &[0]).unwrap();
        h.engine.cards_mut()[0].processes.push(GpuProcess {
            pid: 900,
            uid: 1001,
            memory: 1,
        });

        // Two clients attached: the in-use check does not apply yet.
        let resp = h.engine.handle_release(1001, 100, &[0]).unwrap();
        assert!(resp.errors.is_empty());
        assert_eq!(h.engine.cards()[0].client_pids, vec![300]);
        assert_eq!(h.engine.cards()[0].reserved_by_uid, 1001);
    }
}
