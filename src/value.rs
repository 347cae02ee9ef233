//! Provides the immutable byte value stored by the cache.
//!
//! A [Value](Value) wraps a reference counted byte buffer. Once created, its contents
//! never change, therefore values can be handed out to any number of concurrent readers
//! without copying and without any further synchronization. Constructors which accept
//! borrowed data copy it, so that a value never aliases mutable memory owned by someone
//! else.
use bytes::Bytes;

/// An immutable byte sequence with a length measure.
///
/// Cloning a value is cheap (it only bumps a reference count) which is what permits the
/// cache to return the stored value to a caller while keeping it in the store.
///
/// # Example
///
/// ```
/// # use ganymede::value::Value;
/// let value = Value::from_slice(b"630");
/// assert_eq!(value.len(), 3);
/// assert_eq!(value.as_slice(), b"630");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    data: Bytes,
}

impl Value {
    /// Creates a value by copying the given slice.
    pub fn from_slice(data: &[u8]) -> Self {
        Value {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Returns the number of bytes stored in this value.
    ///
    /// This is the measure used by the LRU store when accounting its byte budget.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if this value is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Provides read access to the stored bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copies the stored bytes into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Renders the stored bytes as text, replacing invalid UTF-8 sequences.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<Bytes> for Value {
    fn from(data: Bytes) -> Self {
        // Bytes are already immutable and reference counted, no copy required...
        Value { data }
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Value { data: data.into() }
    }
}

impl From<&str> for Value {
    fn from(data: &str) -> Self {
        Value::from_slice(data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::Value;
    use bytes::Bytes;

    #[test]
    fn values_copy_borrowed_sources() {
        let mut source = b"Tom".to_vec();
        let value = Value::from_slice(&source);
        source[0] = b'X';

        assert_eq!(value.as_slice(), b"Tom");
    }

    #[test]
    fn clones_observe_the_same_bytes() {
        let value = Value::from("630");
        let clone = value.clone();

        assert_eq!(value, clone);
        assert_eq!(clone.to_text(), "630");
        assert_eq!(clone.to_vec(), b"630".to_vec());
        assert_eq!(clone.len(), 3);
    }

    #[test]
    fn owned_buffers_are_wrapped_without_copy() {
        let value = Value::from(Bytes::from_static(b"static"));
        assert_eq!(value.as_slice(), b"static");
        assert_eq!(value.is_empty(), false);
    }
}
