//! Pluggable per-card telemetry.

mod nvml;

pub use nvml::NvmlProvider;

use crate::protocol::Card;

/// Source of card identity and per-card metrics.
///
/// `refresh` overwrites the sampled fields of a card in place (memory,
/// utilization, temperature, minor id, the device node's current owner and
/// the observed process list), stamps `last_usage_ms` when processes are
/// present, and clears `locked_until_update`. A refresh error leaves the
/// card untouched so it keeps its previous sample.
pub trait Provider {
    fn init(&mut self) -> anyhow::Result<Vec<Card>>;
    fn refresh(&mut self, card: &mut Card, now_ms: u64) -> anyhow::Result<()>;
    fn shutdown(&mut self);
}
