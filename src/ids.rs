//! Short-id generation.
//!
//! Every persisted entity gets an opaque short token: a fixed literal
//! prefix, a dash, and five lowercase hex characters. Collisions are
//! possible and handled by the caller (insert retries).

use rand::Rng;

const ID_SPACE: u32 = 0x10_0000; // 16^5

fn short_id(prefix: &str) -> String {
    let n: u32 = rand::thread_rng().gen_range(0..ID_SPACE);
    format!("{prefix}-{n:05x}")
}

pub fn car_id() -> String {
    short_id("car")
}

pub fn message_id() -> String {
    short_id("msg")
}

pub fn engine_id() -> String {
    short_id("eng")
}

pub fn reindex_id() -> String {
    short_id("idx")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn car_ids_have_fixed_prefix_and_five_hex_chars() {
        for _ in 0..100 {
            let id = car_id();
            let suffix = id.strip_prefix("car-").expect("car- prefix");
            assert_eq!(suffix.len(), 5);
            assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn prefixes_distinguish_entity_families() {
        assert!(message_id().starts_with("msg-"));
        assert!(engine_id().starts_with("eng-"));
        assert!(reindex_id().starts_with("idx-"));
    }
}
