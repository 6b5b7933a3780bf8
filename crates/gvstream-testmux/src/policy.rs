//! Receive policies
//!
//! How a connection's inbound wire buffer is cut into chunks for the
//! consumer.
//!
//! | policy      | condition        | chunk                  | repeats |
//! |-------------|------------------|------------------------|---------|
//! | `Exactly`   | `len >= n`       | first `n` bytes        | yes     |
//! | `AtLeast`   | `len >= n`       | the whole buffer       | no      |
//! | `AtMost`    | `len > 0`        | first `min(n, len)`    | yes     |

use crate::config::defaults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePolicy {
    Exactly(usize),
    AtLeast(usize),
    AtMost(usize),
}

impl Default for ReceivePolicy {
    fn default() -> Self {
        ReceivePolicy::AtMost(defaults::READ_MAX)
    }
}

impl ReceivePolicy {
    /// Sizes below 1 are raised to 1; a zero-sized chunk would never drain.
    pub fn exactly(n: usize) -> Self {
        ReceivePolicy::Exactly(n.max(1))
    }

    pub fn at_least(n: usize) -> Self {
        ReceivePolicy::AtLeast(n.max(1))
    }

    pub fn at_most(n: usize) -> Self {
        ReceivePolicy::AtMost(n.max(1))
    }

    pub fn size(&self) -> usize {
        match *self {
            ReceivePolicy::Exactly(n) | ReceivePolicy::AtLeast(n) | ReceivePolicy::AtMost(n) => {
                n.max(1)
            }
        }
    }

    /// Whether delivery keeps going after one chunk in the same read step.
    pub fn repeats(&self) -> bool {
        !matches!(self, ReceivePolicy::AtLeast(_))
    }

    /// Cut the next chunk off the front of `wire`, if the policy allows one.
    pub fn next_chunk(&self, wire: &mut Vec<u8>) -> Option<Vec<u8>> {
        let n = self.size();
        match self {
            ReceivePolicy::Exactly(_) if wire.len() >= n => Some(wire.drain(..n).collect()),
            ReceivePolicy::AtLeast(_) if wire.len() >= n => Some(std::mem::take(wire)),
            ReceivePolicy::AtMost(_) if !wire.is_empty() => {
                let take = n.min(wire.len());
                Some(wire.drain(..take).collect())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(policy: ReceivePolicy, mut wire: Vec<u8>) -> (Vec<usize>, usize) {
        let mut sizes = Vec::new();
        while let Some(chunk) = policy.next_chunk(&mut wire) {
            sizes.push(chunk.len());
            if !policy.repeats() {
                break;
            }
        }
        (sizes, wire.len())
    }

    #[test]
    fn test_seven_bytes() {
        let wire: Vec<u8> = (1..=7).collect();
        assert_eq!(drain_all(ReceivePolicy::exactly(3), wire.clone()), (vec![3, 3], 1));
        assert_eq!(drain_all(ReceivePolicy::at_least(3), wire.clone()), (vec![7], 0));
        assert_eq!(drain_all(ReceivePolicy::at_most(3), wire), (vec![3, 3, 1], 0));
    }

    #[test]
    fn test_not_enough_bytes() {
        let mut wire = vec![1u8, 2];
        assert_eq!(ReceivePolicy::exactly(3).next_chunk(&mut wire), None);
        assert_eq!(ReceivePolicy::at_least(3).next_chunk(&mut wire), None);
        assert_eq!(wire.len(), 2);
        assert_eq!(ReceivePolicy::at_most(3).next_chunk(&mut Vec::new()), None);
    }

    #[test]
    fn test_zero_size_clamped() {
        assert_eq!(ReceivePolicy::exactly(0), ReceivePolicy::Exactly(1));
        assert_eq!(ReceivePolicy::Exactly(0).size(), 1);
        let mut wire = vec![9u8, 8];
        assert_eq!(ReceivePolicy::Exactly(0).next_chunk(&mut wire), Some(vec![9]));
    }

    #[test]
    fn test_chunk_order() {
        let mut wire = b"abcdef".to_vec();
        let p = ReceivePolicy::exactly(2);
        assert_eq!(p.next_chunk(&mut wire), Some(b"ab".to_vec()));
        assert_eq!(p.next_chunk(&mut wire), Some(b"cd".to_vec()));
    }
}
