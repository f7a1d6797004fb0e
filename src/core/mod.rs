pub mod card;
pub mod devices;
pub mod engine;
pub mod queue;

use std::path::PathBuf;

/// Owner uid of a free device node.
pub const FREE_OWNER_UID: u32 = 0;
/// Group for reserved device nodes: nobody, so group bits grant nothing.
pub const RESERVED_GROUP_GID: u32 = 65534;

/// Character device backing the card with the given kernel minor number.
pub fn device_path(minor_id: u32) -> PathBuf {
    PathBuf::from(format!("/dev/nvidia{minor_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_uses_minor_number() {
        assert_eq!(device_path(0), PathBuf::from("/dev/nvidia0"));
        assert_eq!(device_path(13), PathBuf::from("/dev/nvidia13"));
    }
}
