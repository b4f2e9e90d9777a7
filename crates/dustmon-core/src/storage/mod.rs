//! Tagged persistence of small records across deep sleep.
//!
//! Records are addressed by a four-character [`Tag`] and serialized with
//! postcard. Reading a tag that was never written yields `Ok(None)`; callers
//! fall back to a default-constructed value, which is the first-boot path.

pub mod retained;

pub use retained::RetainedStore;

use core::fmt;

use serde::{Serialize, de::DeserializeOwned};
use thiserror_no_std::Error;

/// Four ASCII characters naming a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag([u8; 4]);

impl Tag {
    /// Build a tag from up to four ASCII characters, padded with zeros.
    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut raw = [0u8; 4];
        let mut i = 0;
        while i < bytes.len() && i < 4 {
            raw[i] = bytes[i];
            i += 1;
        }
        Self(raw)
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub const fn from_bytes(raw: [u8; 4]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.iter().take_while(|&&b| b != 0) {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

/// Wake counter, oscillator calibration and pre-sleep clock snapshot.
pub const WAKE_STATE_TAG: Tag = Tag::new("main");
/// Display state: last rendered view, refresh counter, refresh mode.
pub const DISPLAY_STATE_TAG: Tag = Tag::new("view");
/// Local and remote readings shown on screen.
pub const VIEW_DATA_TAG: Tag = Tag::new("DMC1");
/// Controller bookkeeping (particulate status, timestamps).
pub const CONTROLLER_DATA_TAG: Tag = Tag::new("DMC2");
/// Meteo sensor calibration constants.
pub const METEO_CALIBRATION_TAG: Tag = Tag::new("PTHD");
/// Link address of the companion unit.
pub const PEER_ADDRESS_TAG: Tag = Tag::new("peer");
/// Particulate measurement counter driving fan cleaning.
pub const PARTICULATE_COUNTER_TAG: Tag = Tag::new("SPSC");

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("no room left for record {0}")]
    Full(Tag),
    #[error("record {0} could not be encoded")]
    Encode(Tag),
    #[error("record {0} could not be decoded")]
    Decode(Tag),
}

/// Typed get/set by tag. Every `set` is one atomic replacement of the record.
pub trait PersistentStorage {
    fn get<T: DeserializeOwned>(&self, tag: Tag) -> Result<Option<T>, StorageError>;

    fn set<T: Serialize>(&mut self, tag: Tag, value: &T) -> Result<(), StorageError>;

    /// Read a record, treating absent or undecodable data as the default.
    fn get_or_default<T: DeserializeOwned + Default>(&self, tag: Tag) -> T {
        match self.get(tag) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                log::warn!(" {}, using defaults", e);
                T::default()
            }
        }
    }
}
