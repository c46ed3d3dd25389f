//! Event subscriptions and the per-write matcher.
//!
//! Each tag carries a list of subscriptions. After every successful
//! write or masked write the matcher walks the list, and every
//! subscription whose watched range intersects the written range gets
//! its predicate evaluated. A firing predicate emits exactly one
//! record per subscription per write, no matter how many elements
//! matched.

use std::cmp::Ordering;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};
use crate::module::EventSender;
use crate::scalar::{compare_elements, deadband_exceeded};
use crate::tagbase::TagIndex;
use crate::types::{BaseType, TagType};

/// Size of an encoded event record on the notification channel.
pub const EVENT_MSG_SIZE: usize = 25;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u32)]
pub enum EventKind {
    /// Any write into the watched range.
    Write = 1,
    /// Any write that changed a watched byte or bit.
    Change = 2,
    /// A watched bit rose, BOOL only.
    Set = 3,
    /// A watched bit fell, BOOL only.
    Reset = 4,
    /// An element became equal to the comparand, integers only.
    Equal = 5,
    /// An element rose above the comparand.
    Greater = 6,
    /// An element fell below the comparand.
    Less = 7,
    /// An element moved at least the band away from its last reported
    /// value.
    Deadband = 8,
}

/// Identifies the sub-region of a tag a subscription watches and how
/// to interpret it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventHandle {
    pub index: TagIndex,
    /// First watched byte within the tag.
    pub byte: usize,
    /// First watched bit within that byte, BOOL ranges only.
    pub bit: u8,
    /// Watched elements (bits for BOOL).
    pub count: u32,
    /// Watched bytes, the extent used for intersection tests.
    pub size: usize,
    pub datatype: TagType,
}

/// Kind-specific rolling state.
///
/// The edge-detecting kinds keep one flag bit per watched element (bit
/// for the BOOL kinds); a flag stays set while the condition holds so
/// the event cannot re-fire until the condition clears.
#[derive(Debug)]
enum EventState {
    Write,
    /// Last seen bytes of the watched range.
    Change { snapshot: Vec<u8> },
    /// Flag bits laid out parallel to the watched bits.
    Set { fired: Vec<u8> },
    Reset { fired: Vec<u8> },
    /// Raw comparand element plus one flag bit per element.
    Compare {
        target: Ordering,
        comparand: Vec<u8>,
        fired: Vec<u8>,
    },
    /// Band element plus the per-element reference values events are
    /// measured against.
    Deadband { band: Vec<u8>, reference: Vec<u8> },
}

#[derive(Debug)]
pub(crate) struct Subscription {
    id: u32,
    kind: EventKind,
    byte: usize,
    bit: u8,
    count: u32,
    size: usize,
    datatype: TagType,
    state: EventState,
    sender: EventSender,
}

/// Checks the kind against the watched datatype. SET and RESET are
/// bit edges, so BOOL only; the ordered kinds need elements the
/// comparison predicates accept.
fn verify_kind(kind: EventKind, datatype: TagType) -> Result<()> {
    let base = datatype.base();
    let allowed = match kind {
        EventKind::Write | EventKind::Change => true,
        EventKind::Set | EventKind::Reset => datatype == TagType::BOOL,
        EventKind::Equal => base.is_some_and(BaseType::is_integer),
        EventKind::Greater | EventKind::Less | EventKind::Deadband => {
            base.is_some_and(BaseType::is_numeric)
        }
    };
    if allowed {
        Ok(())
    } else {
        log::error!("{kind:?} events are not allowed on {datatype:?}");
        Err(Error::Arg("event kind does not apply to the datatype"))
    }
}

impl Subscription {
    /// Builds a subscription and initialises its rolling state from
    /// the current tag bytes. `unit` is the element size of the
    /// watched datatype in bytes, 0 for BOOL.
    pub(crate) fn new(
        id: u32,
        handle: EventHandle,
        kind: EventKind,
        data: &[u8],
        tag_data: &[u8],
        unit: usize,
        sender: EventSender,
    ) -> Result<Subscription> {
        let EventHandle {
            byte,
            bit,
            count,
            size,
            datatype,
            ..
        } = handle;
        if count == 0 || size == 0 {
            return Err(Error::Arg("event range is empty"));
        }
        if bit > 7 {
            return Err(Error::Arg("bit offset exceeds 7"));
        }
        let fits = |span: usize| {
            byte.checked_add(span)
                .map_or(false, |end| end <= tag_data.len())
        };
        if !fits(size) {
            log::error!("event range is larger than the tag");
            return Err(Error::TooBig("event range exceeds tag size"));
        }
        verify_kind(kind, datatype)?;

        let is_bool = datatype == TagType::BOOL;
        // bytes spanned by (bit, count) for the bit-granular kinds
        let bit_span = (bit as usize + count as usize).div_ceil(8);
        let elem_span = unit * count as usize;
        let watched_span = if is_bool { bit_span } else { elem_span };
        if !fits(watched_span) {
            return Err(Error::TooBig("event range exceeds tag size"));
        }

        let state = match kind {
            EventKind::Write => EventState::Write,
            EventKind::Change => EventState::Change {
                snapshot: tag_data[byte..byte + watched_span].to_vec(),
            },
            EventKind::Set => EventState::Set {
                fired: vec![0; bit_span],
            },
            EventKind::Reset => EventState::Reset {
                fired: vec![0; bit_span],
            },
            EventKind::Equal | EventKind::Greater | EventKind::Less => {
                if data.len() < unit {
                    return Err(Error::Arg("comparand is shorter than one element"));
                }
                EventState::Compare {
                    // GREATER fires when the comparand sorts below the
                    // current value, LESS when it sorts above
                    target: match kind {
                        EventKind::Equal => Ordering::Equal,
                        EventKind::Greater => Ordering::Less,
                        _ => Ordering::Greater,
                    },
                    comparand: data[..unit].to_vec(),
                    fired: vec![0; (count as usize).div_ceil(8)],
                }
            }
            EventKind::Deadband => {
                if data.len() < unit {
                    return Err(Error::Arg("deadband is shorter than one element"));
                }
                EventState::Deadband {
                    band: data[..unit].to_vec(),
                    reference: tag_data[byte..byte + elem_span].to_vec(),
                }
            }
        };

        Ok(Subscription {
            id,
            kind,
            byte,
            bit,
            count,
            size,
            datatype,
            state,
            sender,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn sender(&self) -> &EventSender {
        &self.sender
    }

    /// True when the written range touches the watched range.
    pub(crate) fn intersects(&self, offset: usize, size: usize) -> bool {
        offset <= self.byte + self.size - 1 && offset + size - 1 >= self.byte
    }

    /// Evaluates the predicate against the freshly written tag bytes
    /// and updates the rolling state. Scans are restricted to the
    /// overlap of the written and watched ranges.
    pub(crate) fn evaluate(
        &mut self,
        tag_data: &[u8],
        offset: usize,
        size: usize,
    ) -> bool {
        let byte = self.byte;
        let bit = self.bit;
        let count = self.count;
        let datatype = self.datatype;
        let lo = offset.max(byte);
        let hi = (offset + size).min(byte + self.size);

        match &mut self.state {
            EventState::Write => true,
            EventState::Change { snapshot } => {
                if datatype == TagType::BOOL {
                    let mut hit = false;
                    for n in 0..count as usize {
                        let pos = bit as usize + n;
                        let (cell, mask) = (pos / 8, 1u8 << (pos % 8));
                        let at = byte + cell;
                        if at < lo || at >= hi {
                            continue;
                        }
                        if (snapshot[cell] ^ tag_data[at]) & mask != 0 {
                            snapshot[cell] = tag_data[at];
                            hit = true;
                        }
                    }
                    hit
                } else {
                    let mut hit = false;
                    for at in lo..hi.min(byte + snapshot.len()) {
                        let rel = at - byte;
                        if snapshot[rel] != tag_data[at] {
                            snapshot[rel] = tag_data[at];
                            hit = true;
                        }
                    }
                    hit
                }
            }
            EventState::Set { fired } => {
                scan_bits(tag_data, byte, bit, count, lo, hi, fired, true)
            }
            EventState::Reset { fired } => {
                scan_bits(tag_data, byte, bit, count, lo, hi, fired, false)
            }
            EventState::Compare {
                target,
                comparand,
                fired,
            } => {
                let base = datatype.base().expect("validated numeric datatype");
                let unit = base.size();
                let mut hit = false;
                for elem in overlap_elements(byte, unit, count, lo, hi) {
                    let at = byte + elem * unit;
                    if at + unit > tag_data.len() {
                        break;
                    }
                    let (cell, mask) = (elem / 8, 1u8 << (elem % 8));
                    let current = &tag_data[at..at + unit];
                    if compare_elements(base, comparand, current) == *target {
                        if fired[cell] & mask == 0 {
                            fired[cell] |= mask;
                            hit = true;
                        }
                    } else {
                        // re-arm once the condition clears
                        fired[cell] &= !mask;
                    }
                }
                hit
            }
            EventState::Deadband { band, reference } => {
                let base = datatype.base().expect("validated numeric datatype");
                let unit = base.size();
                let mut hit = false;
                for elem in overlap_elements(byte, unit, count, lo, hi) {
                    let at = byte + elem * unit;
                    if at + unit > tag_data.len() {
                        break;
                    }
                    let rel = elem * unit;
                    let current = &tag_data[at..at + unit];
                    if deadband_exceeded(base, &reference[rel..rel + unit], current, band)
                    {
                        reference[rel..rel + unit].copy_from_slice(current);
                        hit = true;
                    }
                }
                hit
            }
        }
    }

    pub(crate) fn record(&self, index: TagIndex) -> EventRecord {
        EventRecord {
            kind: self.kind,
            index,
            id: self.id,
            byte: self.byte as u32,
            count: self.count,
            datatype: self.datatype,
            bit: self.bit,
        }
    }
}

/// Element indices (relative to the subscription) whose bytes fall in
/// the written overlap `[lo, hi)`.
fn overlap_elements(
    byte: usize,
    unit: usize,
    count: u32,
    lo: usize,
    hi: usize,
) -> std::ops::Range<usize> {
    let first = (lo - byte) / unit;
    let last = (hi - 1 - byte) / unit + 1;
    first..last.min(count as usize)
}

/// Edge scan over the watched bits. With `level` true this is the SET
/// predicate (fires on a rising edge), otherwise RESET (falling edge).
/// The flag bit holds while the level persists and clears when it
/// inverts, re-arming the event.
#[allow(clippy::too_many_arguments)]
fn scan_bits(
    tag_data: &[u8],
    byte: usize,
    bit: u8,
    count: u32,
    lo: usize,
    hi: usize,
    fired: &mut [u8],
    level: bool,
) -> bool {
    let mut hit = false;
    for n in 0..count as usize {
        let pos = bit as usize + n;
        let (cell, mask) = (pos / 8, 1u8 << (pos % 8));
        let at = byte + cell;
        if at < lo || at >= hi {
            continue;
        }
        if (tag_data[at] & mask != 0) == level {
            if fired[cell] & mask == 0 {
                fired[cell] |= mask;
                hit = true;
            }
        } else {
            fired[cell] &= !mask;
        }
    }
    hit
}

/// One event notification, as pushed to the owning module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub index: TagIndex,
    pub id: u32,
    pub byte: u32,
    pub count: u32,
    pub datatype: TagType,
    pub bit: u8,
}

impl EventRecord {
    /// Packs the record for the notification channel. Multi-byte
    /// fields are network byte order; tag payload bytes are never
    /// touched by this conversion.
    pub fn encode(&self) -> [u8; EVENT_MSG_SIZE] {
        let mut buf = [0u8; EVENT_MSG_SIZE];
        buf[0..4].copy_from_slice(&u32::from(self.kind).to_be_bytes());
        buf[4..8].copy_from_slice(&self.index.to_be_bytes());
        buf[8..12].copy_from_slice(&self.id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.byte.to_be_bytes());
        buf[16..20].copy_from_slice(&self.count.to_be_bytes());
        buf[20..24].copy_from_slice(&self.datatype.into_raw().to_be_bytes());
        buf[24] = self.bit;
        buf
    }

    pub fn decode(raw: &[u8; EVENT_MSG_SIZE]) -> Result<EventRecord> {
        let field =
            |at: usize| u32::from_be_bytes(raw[at..at + 4].try_into().expect("4 bytes"));
        let kind = EventKind::try_from_primitive(field(0))
            .map_err(|_| Error::Arg("unknown event kind"))?;
        Ok(EventRecord {
            kind,
            index: field(4),
            id: field(8),
            byte: field(12),
            count: field(16),
            datatype: TagType::from_raw(field(20)),
            bit: raw[24],
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(EventKind::Write, TagType::BOOL, true)]
    #[case(EventKind::Write, TagType::LREAL, true)]
    #[case(EventKind::Change, TagType::BOOL, true)]
    #[case(EventKind::Change, TagType::REAL, true)]
    #[case(EventKind::Set, TagType::BOOL, true)]
    #[case(EventKind::Set, TagType::INT, false)]
    #[case(EventKind::Reset, TagType::BOOL, true)]
    #[case(EventKind::Reset, TagType::REAL, false)]
    #[case(EventKind::Equal, TagType::INT, true)]
    #[case(EventKind::Equal, TagType::ULINT, true)]
    #[case(EventKind::Equal, TagType::REAL, false)]
    #[case(EventKind::Equal, TagType::BOOL, false)]
    #[case(EventKind::Greater, TagType::REAL, true)]
    #[case(EventKind::Greater, TagType::BOOL, false)]
    #[case(EventKind::Less, TagType::TIME, true)]
    #[case(EventKind::Deadband, TagType::LREAL, true)]
    #[case(EventKind::Deadband, TagType::BOOL, false)]
    fn kind_datatype_compatibility(
        #[case] kind: EventKind,
        #[case] datatype: TagType,
        #[case] allowed: bool,
    ) {
        assert_eq!(verify_kind(kind, datatype).is_ok(), allowed);
    }

    #[test]
    fn compound_datatypes_only_take_write_and_change() {
        let custom = TagType::from_cdt_index(0);
        assert!(verify_kind(EventKind::Write, custom).is_ok());
        assert!(verify_kind(EventKind::Change, custom).is_ok());
        for kind in [
            EventKind::Set,
            EventKind::Reset,
            EventKind::Equal,
            EventKind::Greater,
            EventKind::Less,
            EventKind::Deadband,
        ] {
            assert!(verify_kind(kind, custom).is_err());
        }
    }

    #[test]
    fn record_round_trips_in_network_order() {
        let record = EventRecord {
            kind: EventKind::Deadband,
            index: 3,
            id: 0x0102_0304,
            byte: 16,
            count: 2,
            datatype: TagType::REAL,
            bit: 0,
        };
        let raw = record.encode();
        assert_eq!(raw[0..4], [0, 0, 0, 8]);
        assert_eq!(raw[8..12], [1, 2, 3, 4]);
        assert_eq!(raw[12..16], [0, 0, 0, 16]);
        assert_eq!(raw[24], 0);
        assert_eq!(EventRecord::decode(&raw).unwrap(), record);
    }

    #[test]
    fn unknown_kind_fails_decode() {
        let mut raw = [0u8; EVENT_MSG_SIZE];
        raw[3] = 99;
        assert!(EventRecord::decode(&raw).is_err());
    }
}
