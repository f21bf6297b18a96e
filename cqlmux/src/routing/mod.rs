//! Partition-aware routing: the partition key of a request is hashed into a
//! [`Token`], and the [`TokenRing`] tells which node owns that token.

mod partition_key;
pub mod partitioner;
mod token_ring;

pub use partition_key::{PartitionKey, PartitionKeyError};
pub use token_ring::TokenRing;

/// Position of a partition on the ring.
///
/// `i64::MIN` is reserved by the server to mean "minimum token" and never
/// owns a partition, so [`Token::new`] maps it to `i64::MAX`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl std::str::FromStr for Token {
    type Err = std::num::ParseIntError;

    // system.local and system.peers report tokens as decimal strings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(Token::new)
    }
}

#[cfg(test)]
mod tests {
    use super::Token;

    #[test]
    fn min_token_is_normalized() {
        assert_eq!(Token::new(i64::MIN).value(), i64::MAX);
        assert_eq!(Token::new(-5).value(), -5);
        assert_eq!("-9223372036854775808".parse::<Token>().unwrap(), Token::new(i64::MAX));
        assert!("abc".parse::<Token>().is_err());
    }
}
