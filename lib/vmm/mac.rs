//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives the guest MAC address for a sandbox id.
///
/// The `06:00` prefix keeps the address in the locally administered, unicast
/// range; the remaining four octets are the big-endian sandbox id, so
/// concurrently running sandboxes can never collide.
pub fn guest_mac(sandbox_id: u32) -> String {
    let bytes = sandbox_id.to_be_bytes();
    format!(
        "06:00:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_is_deterministic_and_distinct() {
        assert_eq!(guest_mac(1), "06:00:00:00:00:01");
        assert_eq!(guest_mac(0x0a0b0c0d), "06:00:0a:0b:0c:0d");
        assert_eq!(guest_mac(42), guest_mac(42));
        assert_ne!(guest_mac(1), guest_mac(2));
    }
}
