use bytes::{BufMut, Bytes};
use smallvec::SmallVec;
use thiserror::Error;

use super::partitioner::murmur3_token;
use super::Token;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionKeyError {
    #[error("Partition key component is too long for a composite key: {0} bytes")]
    ComponentTooLong(usize),
    #[error("Partition key has no components")]
    Empty,
}

/// Serialized partition key components, in partition key order.
///
/// Only used to pick a node; the server never sees it in this form. Most
/// keys have one or two components, which fit inline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionKey {
    components: SmallVec<[Bytes; 2]>,
}

impl PartitionKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(component: impl Into<Bytes>) -> Self {
        let mut key = Self::new();
        key.push(component);
        key
    }

    pub fn push(&mut self, component: impl Into<Bytes>) {
        self.components.push(component.into());
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Bytes] {
        &self.components
    }

    /// The bytes the partitioner hashes. A single component is used as is;
    /// several are joined as `<u16 len><bytes><0x00>` each.
    pub fn routing_key(&self) -> Result<Bytes, PartitionKeyError> {
        match self.components.as_slice() {
            [] => Err(PartitionKeyError::Empty),
            [single] => Ok(single.clone()),
            components => {
                let total: usize = components.iter().map(|c| c.len() + 3).sum();
                let mut buf = Vec::with_capacity(total);
                for component in components {
                    let len: u16 = component
                        .len()
                        .try_into()
                        .map_err(|_| PartitionKeyError::ComponentTooLong(component.len()))?;
                    buf.put_u16(len);
                    buf.put_slice(component);
                    buf.put_u8(0);
                }
                Ok(buf.into())
            }
        }
    }

    pub fn token(&self) -> Result<Token, PartitionKeyError> {
        Ok(murmur3_token(&self.routing_key()?))
    }
}

impl<B: Into<Bytes>> FromIterator<B> for PartitionKey {
    fn from_iter<T: IntoIterator<Item = B>>(iter: T) -> Self {
        PartitionKey {
            components: iter.into_iter().map(Into::into).collect(),
        }
    }
}
