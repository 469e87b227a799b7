//! Small shared helpers.

use rand::RngCore;

/// Generates a random 16-byte machine id, hex-encoded.
#[must_use]
pub fn generate_machine_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
