//! Conversion of cached values to and from bytes
//!
//! The byte form is used for size accounting in the auto-purging tier and
//! as the file contents of the disk tier.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

pub trait Serializer<T>: Send + Sync + 'static {
    fn to_bytes(&self, value: &T) -> Result<Vec<u8>>;
    fn from_bytes(&self, bytes: &[u8]) -> Result<T>;
}

/// Envelope so that bare scalars still encode as a JSON document
#[derive(Serialize)]
struct Envelope<'a, T> {
    object: &'a T,
}

#[derive(Deserialize)]
struct OwnedEnvelope<T> {
    object: T,
}

/// JSON encoding for any serde type
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn to_bytes(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Envelope { object: value })?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<T> {
        let envelope: OwnedEnvelope<T> = serde_json::from_slice(bytes)?;
        Ok(envelope.object)
    }
}

/// Pass-through for raw blobs
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn to_bytes(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
