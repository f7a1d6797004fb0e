use nix::time::{clock_gettime, ClockId};
use nix::unistd::{Uid, User};
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds on CLOCK_MONOTONIC. The epoch (boot) is shared by every
/// process on the host, so these values are comparable across the daemon
/// and its clients.
pub fn monotonic_ms() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000,
        Err(_) => 0,
    }
}

/// Wall-clock milliseconds since the Unix epoch, for display timestamps.
pub fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolve a uid to its account name for log lines and status output.
pub fn username_for_uid(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

/// Parse the NUL-separated `KEY=VALUE` layout of `/proc/<pid>/environ`.
///
/// Entries without a `=` are skipped; on duplicate keys the last one wins,
/// matching what `execve` would have produced.
pub fn parse_environ(raw: &[u8]) -> HashMap<OsString, OsString> {
    let mut env = HashMap::new();
    for entry in raw.split(|&b| b == 0) {
        if entry.is_empty() {
            continue;
        }
        let Some(eq) = entry.iter().position(|&b| b == b'=') else {
            continue;
        };
        if eq == 0 {
            continue;
        }
        env.insert(
            OsString::from_vec(entry[..eq].to_vec()),
            OsString::from_vec(entry[eq + 1..].to_vec()),
        );
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_advances() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn parse_environ_basic() {
        let raw = b"PATH=/usr/bin:/bin\0HOME=/home/alice\0";
        let env = parse_environ(raw);
        assert_eq!(env.len(), 2);
        assert_eq!(env[&OsString::from("PATH")], OsString::from("/usr/bin:/bin"));
        assert_eq!(env[&OsString::from("HOME")], OsString::from("/home/alice"));
    }

    #[test]
    fn parse_environ_skips_malformed_entries() {
        let raw = b"NOEQUALS\0=novar\0\0OK=1\0VALUE=a=b\0";
        let env = parse_environ(raw);
        assert_eq!(env.len(), 2);
        assert_eq!(env[&OsString::from("OK")], OsString::from("1"));
        // Only the first '=' separates key from value.
        assert_eq!(env[&OsString::from("VALUE")], OsString::from("a=b"));
    }

    #[test]
    fn parse_environ_last_duplicate_wins() {
        let raw = b"K=first\0K=second\0";
        let env = parse_environ(raw);
        assert_eq!(env[&OsString::from("K")], OsString::from("second"));
    }
}
