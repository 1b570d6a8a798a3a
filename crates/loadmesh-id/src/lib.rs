//! loadmesh-id — opaque short identifiers.
//!
//! Every identity in the fabric (node ids, RPC correlation ids, job
//! names, reservation tokens) is a random string over the 62-character
//! alphanumeric alphabet. Node ids are short (5 chars) because they are
//! embedded in datastore keys and channel names; everything else uses
//! 10 chars.
//!
//! Generation pulls OS entropy per call, so ids are collision-safe
//! under concurrent use and carry no process-wide ordering.

/// The 62-character id alphabet: `0-9A-Za-z`.
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of node ids.
pub const NODE_ID_LEN: usize = 5;

/// Length of correlation ids, job names, and reservation tokens.
pub const DEFAULT_ID_LEN: usize = 10;

/// Largest byte value that maps uniformly onto the alphabet.
///
/// 248 = 4 * 62; bytes at or above this are rejected so no alphabet
/// character is favored.
const REJECTION_BOUND: u8 = 248;

/// Generate a random id of `len` characters over the alphanumeric
/// alphabet.
///
/// Uses rejection sampling over OS entropy so the distribution is
/// uniform. Panics only if the OS entropy source is unavailable, which
/// is unrecoverable for this process anyway.
pub fn random_id(len: usize) -> String {
    if len == 0 {
        return String::new();
    }
    let mut out = String::with_capacity(len);
    // Over-request a little so most calls need a single syscall.
    let mut buf = vec![0u8; len + len / 2 + 4];
    loop {
        getrandom::getrandom(&mut buf).expect("OS entropy source unavailable");
        for &b in &buf {
            if b < REJECTION_BOUND {
                out.push(ALPHABET[(b % 62) as usize] as char);
                if out.len() == len {
                    return out;
                }
            }
        }
    }
}

/// Generate a node id (5 chars, short enough for key and channel names).
pub fn node_id() -> String {
    random_id(NODE_ID_LEN)
}

/// Generate an RPC correlation id (10 chars).
pub fn correlation_id() -> String {
    random_id(DEFAULT_ID_LEN)
}

/// Generate a job name (10 chars).
pub fn job_name() -> String {
    random_id(DEFAULT_ID_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_have_requested_length() {
        assert_eq!(random_id(5).len(), 5);
        assert_eq!(random_id(10).len(), 10);
        assert_eq!(random_id(32).len(), 32);
        assert_eq!(random_id(0).len(), 0);
    }

    #[test]
    fn ids_use_only_the_alphabet() {
        let id = random_id(256);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn helpers_use_documented_lengths() {
        assert_eq!(node_id().len(), NODE_ID_LEN);
        assert_eq!(correlation_id().len(), DEFAULT_ID_LEN);
        assert_eq!(job_name().len(), DEFAULT_ID_LEN);
    }

    #[test]
    fn correlation_ids_do_not_collide_in_practice() {
        let ids: HashSet<String> = (0..10_000).map(|_| correlation_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn concurrent_generation_stays_unique() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| correlation_id()).collect::<Vec<_>>()))
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id across threads");
            }
        }
    }
}
