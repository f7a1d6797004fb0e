//! FIFO queue of claims waiting for capacity.
//!
//! Jobs carry a priority field on the wire, but admission is strictly
//! first-come-first-served with head-of-line blocking, so this is a plain
//! deque with one extra operation: dropping every job of a vanished client.

use crate::protocol::Job;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn push_back(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn front(&self) -> Option<&Job> {
        self.jobs.front()
    }

    pub fn pop_front(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// Remove every job submitted by `pid`. Called when a client is deleted.
    pub fn remove_pid(&mut self, pid: i32) {
        self.jobs.retain(|j| j.client_pid != pid);
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(pid: i32, num_gpus: u32) -> Job {
        Job {
            uid: 1000,
            client_pid: pid,
            num_gpus,
            priority: 0.0,
            submitted_ms: 0,
        }
    }

    #[test]
    fn fifo_order_is_insertion_order() {
        let mut q = JobQueue::default();
        for pid in [10, 11, 12] {
            q.push_back(job(pid, 1));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.front().unwrap().client_pid, 10);
        assert_eq!(q.pop_front().unwrap().client_pid, 10);
        assert_eq!(q.pop_front().unwrap().client_pid, 11);
        assert_eq!(q.pop_front().unwrap().client_pid, 12);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_pid_drops_all_jobs_of_that_client() {
        let mut q = JobQueue::default();
        q.push_back(job(10, 1));
        q.push_back(job(11, 2));
        q.push_back(job(10, 3));
        q.remove_pid(10);
        assert_eq!(q.len(), 1);
        assert_eq!(q.front().unwrap().client_pid, 11);
    }

    #[test]
    fn snapshot_preserves_order_without_draining() {
        let mut q = JobQueue::default();
        q.push_back(job(1, 1));
        q.push_back(job(2, 1));
        let snap = q.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].client_pid, 1);
        assert_eq!(q.len(), 2);
    }
}
