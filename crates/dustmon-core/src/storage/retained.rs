//! Record store over a fixed byte region that survives deep sleep.
//!
//! Layout (little-endian):
//!
//! | Offset | Size | Field                              |
//! |--------|------|------------------------------------|
//! | 0      | 4    | magic `DMRS`                       |
//! | 4      | 2    | bytes used by the record table     |
//! | 6      | ..   | records: tag(4), len(u16), payload |
//!
//! Retained RAM holds garbage after a reset that was not a deep-sleep wake,
//! so the caller passes a validity flag at construction. An invalid region,
//! a wrong magic or a broken record chain formats the store empty.

use alloc::vec::Vec;

use log::{debug, warn};
use serde::{Serialize, de::DeserializeOwned};

use super::{PersistentStorage, StorageError, Tag};

const MAGIC: [u8; 4] = *b"DMRS";
const HEADER_LEN: usize = 6;
const RECORD_HEADER_LEN: usize = 6;

/// Retained-RAM backed implementation of [`PersistentStorage`].
pub struct RetainedStore<B> {
    region: B,
}

struct RecordSlot {
    tag: Tag,
    start: usize,
    len: usize,
}

impl<B> RetainedStore<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Open the store. `valid` must be false whenever the region content
    /// cannot be trusted (cold power-on, watchdog or panic reset).
    pub fn new(region: B, valid: bool) -> Self {
        let mut store = Self { region };
        if !valid {
            debug!(" Retained region not valid, formatting");
            store.format();
        } else if !store.is_consistent() {
            warn!(" Retained region corrupt, formatting");
            store.format();
        }
        store
    }

    /// Drop every record.
    pub fn format(&mut self) {
        let region = self.region.as_mut();
        region[..4].copy_from_slice(&MAGIC);
        region[4..HEADER_LEN].copy_from_slice(&0u16.to_le_bytes());
    }

    fn capacity(&self) -> usize {
        self.region.as_ref().len() - HEADER_LEN
    }

    fn used(&self) -> usize {
        let region = self.region.as_ref();
        u16::from_le_bytes([region[4], region[5]]) as usize
    }

    /// Give the backing region back, e.g. to reopen it after a simulated sleep.
    pub fn into_inner(self) -> B {
        self.region
    }

    fn is_consistent(&self) -> bool {
        let region = self.region.as_ref();
        if region.len() < HEADER_LEN || region[..4] != MAGIC || self.used() > self.capacity() {
            return false;
        }
        let table = &region[HEADER_LEN..HEADER_LEN + self.used()];
        let mut offset = 0;
        while offset < table.len() {
            if offset + RECORD_HEADER_LEN > table.len() {
                return false;
            }
            let len = u16::from_le_bytes([table[offset + 4], table[offset + 5]]) as usize;
            offset += RECORD_HEADER_LEN + len;
        }
        offset == table.len()
    }

    fn records(&self) -> impl Iterator<Item = RecordSlot> + '_ {
        let table = &self.region.as_ref()[HEADER_LEN..HEADER_LEN + self.used()];
        let mut offset = 0;
        core::iter::from_fn(move || {
            if offset + RECORD_HEADER_LEN > table.len() {
                return None;
            }
            let tag = Tag::from_bytes([
                table[offset],
                table[offset + 1],
                table[offset + 2],
                table[offset + 3],
            ]);
            let len = u16::from_le_bytes([table[offset + 4], table[offset + 5]]) as usize;
            let start = HEADER_LEN + offset + RECORD_HEADER_LEN;
            offset += RECORD_HEADER_LEN + len;
            Some(RecordSlot { tag, start, len })
        })
    }

    fn find(&self, tag: Tag) -> Option<RecordSlot> {
        self.records().find(|slot| slot.tag == tag)
    }

    /// Rebuild the record table without `tag`, append the new payload and
    /// commit it with a single copy.
    fn rewrite(&mut self, tag: Tag, payload: &[u8]) -> Result<(), StorageError> {
        let mut table = Vec::with_capacity(self.used() + RECORD_HEADER_LEN + payload.len());
        for slot in self.records().filter(|slot| slot.tag != tag) {
            let region = self.region.as_ref();
            table.extend_from_slice(&region[slot.start - RECORD_HEADER_LEN..slot.start + slot.len]);
        }
        let len = u16::try_from(payload.len()).map_err(|_| StorageError::Full(tag))?;
        table.extend_from_slice(tag.as_bytes());
        table.extend_from_slice(&len.to_le_bytes());
        table.extend_from_slice(payload);

        if table.len() > self.capacity() {
            return Err(StorageError::Full(tag));
        }
        let used = table.len() as u16;
        let region = self.region.as_mut();
        region[HEADER_LEN..HEADER_LEN + table.len()].copy_from_slice(&table);
        region[4..HEADER_LEN].copy_from_slice(&used.to_le_bytes());
        Ok(())
    }
}

impl<B> PersistentStorage for RetainedStore<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    fn get<T: DeserializeOwned>(&self, tag: Tag) -> Result<Option<T>, StorageError> {
        let Some(slot) = self.find(tag) else {
            return Ok(None);
        };
        let payload = &self.region.as_ref()[slot.start..slot.start + slot.len];
        postcard::from_bytes(payload)
            .map(Some)
            .map_err(|_| StorageError::Decode(tag))
    }

    fn set<T: Serialize>(&mut self, tag: Tag, value: &T) -> Result<(), StorageError> {
        let payload = postcard::to_allocvec(value).map_err(|_| StorageError::Encode(tag))?;
        match self.find(tag) {
            Some(slot) if slot.len == payload.len() => {
                self.region.as_mut()[slot.start..slot.start + slot.len].copy_from_slice(&payload);
                Ok(())
            }
            _ => self.rewrite(tag, &payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
    struct Sample {
        counter: u32,
        offset: i16,
        enabled: bool,
    }

    fn sample(counter: u32, offset: i16) -> Sample {
        Sample {
            counter,
            offset,
            enabled: true,
        }
    }

    #[test]
    fn test_missing_tag_is_absent() {
        let store = RetainedStore::new(vec![0u8; 128], false);
        assert_eq!(store.get::<Sample>(Tag::new("none")).unwrap(), None);
        assert_eq!(store.used(), 0);
    }

    #[test]
    fn test_set_then_get() {
        let mut store = RetainedStore::new(vec![0u8; 128], false);
        store.set(Tag::new("abcd"), &sample(7, -3)).unwrap();
        assert_eq!(store.get(Tag::new("abcd")).unwrap(), Some(sample(7, -3)));
    }

    #[test]
    fn test_overwrite_same_length_in_place() {
        let mut store = RetainedStore::new(vec![0u8; 128], false);
        store.set(Tag::new("a"), &1u8).unwrap();
        store.set(Tag::new("b"), &2u8).unwrap();
        let used = store.used();
        store.set(Tag::new("a"), &3u8).unwrap();
        assert_eq!(store.used(), used);
        assert_eq!(store.get::<u8>(Tag::new("a")).unwrap(), Some(3));
        assert_eq!(store.get::<u8>(Tag::new("b")).unwrap(), Some(2));
    }

    #[test]
    fn test_overwrite_with_new_length_keeps_other_records() {
        let mut store = RetainedStore::new(vec![0u8; 128], false);
        store.set(Tag::new("a"), &sample(1, 2)).unwrap();
        store.set(Tag::new("b"), &5u32).unwrap();
        store.set(Tag::new("a"), &sample(100_000, 2)).unwrap();
        assert_eq!(store.get(Tag::new("a")).unwrap(), Some(sample(100_000, 2)));
        assert_eq!(store.get::<u32>(Tag::new("b")).unwrap(), Some(5));
    }

    #[test]
    fn test_survives_reopen_when_valid() {
        let mut store = RetainedStore::new(vec![0u8; 64], false);
        store.set(Tag::new("main"), &42u32).unwrap();
        let region = store.into_inner();
        let store = RetainedStore::new(region, true);
        assert_eq!(store.get::<u32>(Tag::new("main")).unwrap(), Some(42));
    }

    #[test]
    fn test_invalid_flag_discards_content() {
        let mut store = RetainedStore::new(vec![0u8; 64], false);
        store.set(Tag::new("main"), &42u32).unwrap();
        let store = RetainedStore::new(store.into_inner(), false);
        assert_eq!(store.get::<u32>(Tag::new("main")).unwrap(), None);
    }

    #[test]
    fn test_garbage_region_is_formatted() {
        let store = RetainedStore::new(vec![0xA5u8; 64], true);
        assert_eq!(store.used(), 0);
        assert_eq!(store.get::<u32>(Tag::new("main")).unwrap(), None);
    }

    #[test]
    fn test_full_region_rejects_record_and_keeps_old_one() {
        let mut store = RetainedStore::new(vec![0u8; 24], false);
        store.set(Tag::new("a"), &1u8).unwrap();
        let big = [0xFFu8; 32];
        assert_eq!(store.set(Tag::new("b"), &big), Err(StorageError::Full(Tag::new("b"))));
        assert_eq!(store.get::<u8>(Tag::new("a")).unwrap(), Some(1));
    }

    #[test]
    fn test_tag_display() {
        let mut s = alloc::string::String::new();
        core::fmt::write(&mut s, format_args!("{}", Tag::new("PTHD"))).unwrap();
        assert_eq!(s, "PTHD");
    }
}
