//! The tag database: named, typed storage cells shared by every
//! module, plus the byte-range primitives that mutate them.
//!
//! Tags live in two structures. The tag array is append-only and its
//! indices are the public tag identifiers, stable for the life of the
//! server (a future delete tombstones a slot, it never reuses one).
//! The name index is a parallel collection kept sorted for binary
//! search; both structures share ownership of the name string.

pub mod event;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::module::{EventSender, ModuleId};
use crate::types::{TagType, TypeRegistry};
use crate::validate_name;

use event::{EventHandle, EventKind, Subscription};

/// External tag identifier, an index into the tag array.
pub type TagIndex = u32;

/// Initial slot count of the tag array and name index.
const TAGLIST_SIZE: usize = 1024;
/// Fixed increment both structures grow by, in lockstep.
const TAGLIST_INC: usize = 1024;

/// Name of the system status tag created at startup.
pub const STATUS_TAG: &str = "_status";
const STATUS_COUNT: u32 = 1;

/// One named, typed storage cell.
#[derive(Debug)]
pub struct Tag {
    name: Arc<str>,
    tag_type: TagType,
    count: u32,
    data: Vec<u8>,
    events: Vec<Subscription>,
    next_event_id: u32,
}

impl Tag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag_type(&self) -> TagType {
        self.tag_type
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Size of the backing buffer in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

struct IndexEntry {
    name: Arc<str>,
    index: TagIndex,
}

/// The in-memory tag store. All mutation goes through `&mut self`, so
/// a write and the event matching it triggers are atomic with respect
/// to every other operation.
pub struct TagDatabase {
    types: TypeRegistry,
    tags: Vec<Tag>,
    by_name: Vec<IndexEntry>,
}

/// Orders names for the index: case-insensitive, so that a lookup and
/// the duplicate check land on the same slot regardless of case.
fn cmp_names(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

impl TagDatabase {
    /// Creates the store with the status tag at index 0 and the seeded
    /// type registry.
    pub fn new() -> TagDatabase {
        let mut db = TagDatabase {
            types: TypeRegistry::new(),
            tags: Vec::with_capacity(TAGLIST_SIZE),
            by_name: Vec::with_capacity(TAGLIST_SIZE),
        };
        db.add(STATUS_TAG, TagType::DWORD, STATUS_COUNT)
            .expect("status tag definition is well formed");
        db
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    pub fn count(&self) -> usize {
        self.tags.len()
    }

    pub fn tag(&self, index: TagIndex) -> Option<&Tag> {
        self.tags.get(index as usize)
    }

    /// Buffer size in bytes for `count` elements of `tag_type`. BOOL
    /// arrays pack eight elements per byte.
    pub fn byte_size_of(&self, tag_type: TagType, count: u32) -> Result<usize> {
        if tag_type == TagType::BOOL {
            Ok((count as usize).div_ceil(8))
        } else {
            Ok(self.types.type_size(tag_type)? * count as usize)
        }
    }

    fn search(&self, name: &str) -> std::result::Result<usize, usize> {
        self.by_name
            .binary_search_by(|entry| cmp_names(&entry.name, name))
    }

    /// Adds a tag, or revisits an existing one of the same name.
    ///
    /// An exact-name match with the same type is idempotent: the
    /// existing index is returned, and the buffer grows (zero-filled)
    /// when the new count is larger. Any other collision, including a
    /// name that differs only by case, is a duplicate.
    pub fn add(
        &mut self,
        name: &str,
        tag_type: TagType,
        count: u32,
    ) -> Result<TagIndex> {
        if count == 0 {
            log::error!("tag {name:?} requested with count = 0");
            return Err(Error::Arg("tag count must be at least 1"));
        }
        self.types.check(tag_type)?;
        validate_name(name)?;
        let size = self.byte_size_of(tag_type, count)?;

        match self.search(name) {
            Ok(slot) => {
                let index = self.by_name[slot].index;
                let tag = &mut self.tags[index as usize];
                if &*tag.name != name || tag.tag_type != tag_type {
                    log::error!("duplicate tag name {name:?}");
                    return Err(Error::Duplicate(name.to_string()));
                }
                if count > tag.count {
                    let grow_by = size - tag.data.len();
                    tag.data
                        .try_reserve_exact(grow_by)
                        .map_err(|_| Error::Alloc("tag data"))?;
                    tag.data.resize(size, 0);
                    tag.count = count;
                    log::debug!("tag {name} grown to {count} elements");
                }
                Ok(index)
            }
            Err(slot) => {
                self.reserve_slot()?;
                let mut data = Vec::new();
                data.try_reserve_exact(size)
                    .map_err(|_| Error::Alloc("tag data"))?;
                data.resize(size, 0);

                let index = self.tags.len() as TagIndex;
                let name: Arc<str> = Arc::from(name);
                self.tags.push(Tag {
                    name: Arc::clone(&name),
                    tag_type,
                    count,
                    data,
                    events: Vec::new(),
                    next_event_id: 0,
                });
                self.by_name.insert(slot, IndexEntry { name, index });
                if tag_type.is_custom() {
                    self.types.inc_refcount(tag_type);
                }
                log::debug!("added tag {index}: {tag_type:?} x {count}");
                Ok(index)
            }
        }
    }

    /// Grows both structures by the fixed increment when the next push
    /// would exceed capacity. If either reservation fails the other is
    /// rolled back and nothing is added.
    fn reserve_slot(&mut self) -> Result<()> {
        if self.tags.len() < self.tags.capacity()
            && self.by_name.len() < self.by_name.capacity()
        {
            return Ok(());
        }
        let previous = self.tags.capacity();
        self.tags
            .try_reserve_exact(TAGLIST_INC)
            .map_err(|_| Error::Alloc("tag array"))?;
        if self.by_name.try_reserve_exact(TAGLIST_INC).is_err() {
            self.tags.shrink_to(previous);
            return Err(Error::Alloc("tag name index"));
        }
        log::debug!("tag database grown to {} slots", self.tags.capacity());
        Ok(())
    }

    /// Name lookup over the sorted index. The search itself is
    /// case-insensitive but the hit must match exactly; creation
    /// guarantees at most one tag per folded name.
    pub fn get_by_name(&self, name: &str) -> Result<(TagIndex, TagType, u32)> {
        let slot = self
            .search(name)
            .map_err(|_| Error::NotFound(format!("tag {name:?}")))?;
        let entry = &self.by_name[slot];
        if &*entry.name != name {
            return Err(Error::NotFound(format!("tag {name:?}")));
        }
        let tag = &self.tags[entry.index as usize];
        Ok((entry.index, tag.tag_type, tag.count))
    }

    pub fn get_by_index(&self, index: TagIndex) -> Result<(&str, TagType, u32)> {
        let tag = self
            .tags
            .get(index as usize)
            .ok_or(Error::Arg("tag index out of range"))?;
        Ok((&tag.name, tag.tag_type, tag.count))
    }

    fn checked(&self, index: TagIndex, offset: usize, len: usize) -> Result<&Tag> {
        let tag = self
            .tags
            .get(index as usize)
            .ok_or(Error::Arg("tag index out of range"))?;
        let in_range = offset
            .checked_add(len)
            .map_or(false, |end| end <= tag.data.len());
        if !in_range {
            return Err(Error::TooBig("range exceeds tag size"));
        }
        Ok(tag)
    }

    /// Copies `data.len()` bytes out of the tag, starting at `offset`.
    pub fn read(&self, index: TagIndex, offset: usize, data: &mut [u8]) -> Result<()> {
        let tag = self.checked(index, offset, data.len())?;
        data.copy_from_slice(&tag.data[offset..offset + data.len()]);
        Ok(())
    }

    /// Copies `data` into the tag at `offset`, then runs the event
    /// matcher over the written range.
    pub fn write(&mut self, index: TagIndex, offset: usize, data: &[u8]) -> Result<()> {
        self.checked(index, offset, data.len())?;
        let tag = &mut self.tags[index as usize];
        tag.data[offset..offset + data.len()].copy_from_slice(data);
        self.check_events(index, offset, data.len());
        Ok(())
    }

    /// Writes only the bits selected by `mask`, leaving the rest of
    /// each byte untouched. This is the sole way to flip individual
    /// BOOL elements without disturbing their neighbours.
    pub fn mask_write(
        &mut self,
        index: TagIndex,
        offset: usize,
        data: &[u8],
        mask: &[u8],
    ) -> Result<()> {
        if data.len() != mask.len() {
            return Err(Error::Arg("data and mask lengths differ"));
        }
        self.checked(index, offset, data.len())?;
        let tag = &mut self.tags[index as usize];
        for (n, (byte, bits)) in data.iter().zip(mask).enumerate() {
            let cell = &mut tag.data[offset + n];
            *cell = (byte & bits) | (*cell & !bits);
        }
        self.check_events(index, offset, data.len());
        Ok(())
    }

    /// Walks the tag's subscriptions after a mutation and emits one
    /// record per subscription whose predicate fires. Delivery
    /// failures are logged and never propagate to the writer.
    fn check_events(&mut self, index: TagIndex, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        let Tag { data, events, .. } = &mut self.tags[index as usize];
        for sub in events.iter_mut() {
            if !sub.intersects(offset, size) {
                continue;
            }
            if sub.evaluate(data, offset, size) {
                let record = sub.record(index);
                if let Err(err) = sub.sender().send(&record) {
                    log::warn!(
                        "event {} on tag {index} dropped: {err}",
                        record.id
                    );
                }
            }
        }
    }

    /// Attaches a subscription to the tag named by `handle` and
    /// returns its id, unique within that tag.
    pub fn event_add(
        &mut self,
        handle: EventHandle,
        kind: EventKind,
        data: &[u8],
        sender: EventSender,
    ) -> Result<u32> {
        self.types.check(handle.datatype)?;
        let unit = self.types.type_size(handle.datatype)?;
        let tag = self
            .tags
            .get_mut(handle.index as usize)
            .ok_or(Error::Arg("tag index out of range"))?;
        let Tag {
            data: tag_data,
            events,
            next_event_id,
            ..
        } = tag;
        let id = *next_event_id;
        let sub = Subscription::new(id, handle, kind, data, tag_data, unit, sender)?;
        *next_event_id += 1;
        events.push(sub);
        log::debug!("event {id} ({kind:?}) added to tag {}", handle.index);
        Ok(id)
    }

    /// Deletes a subscription. Only the module that owns the
    /// notification channel may delete it.
    pub fn event_del(&mut self, index: TagIndex, id: u32, module: ModuleId) -> Result<()> {
        let tag = self
            .tags
            .get_mut(index as usize)
            .ok_or(Error::Arg("tag index out of range"))?;
        let slot = tag
            .events
            .iter()
            .position(|sub| sub.id() == id)
            .ok_or_else(|| Error::NotFound(format!("event {id} on tag {index}")))?;
        if tag.events[slot].sender().module() != module {
            log::error!("module {module} cannot delete another module's event");
            return Err(Error::Auth);
        }
        tag.events.remove(slot);
        log::debug!("event {id} removed from tag {index}");
        Ok(())
    }
}

impl Default for TagDatabase {
    fn default() -> TagDatabase {
        TagDatabase::new()
    }
}
