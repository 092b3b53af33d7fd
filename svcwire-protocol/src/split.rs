//! Splitting oversized messages into fragments and reassembling them.
//!
//! Each fragment travels in a `SPLIT` frame whose header extension is the
//! 28-byte split header:
//!
//! ```text
//! +----------------+--------------+----------+
//! | transfer uuid  | total length | index    |
//! | 16 bytes       | u64 BE       | u32 BE   |
//! +----------------+--------------+----------+
//! ```
//!
//! The receiver keeps one [`Reassembler`] per connection. A transfer moves
//! from collecting to complete when the collected bytes reach the declared
//! length, or to failed on the first inconsistent fragment. A failed
//! transfer's buffer is dropped immediately and its id is remembered, so the
//! rest of its fragments are dropped without another error.
//!
//! Besides the per-message cap, the declared lengths of all transfers still
//! collecting must fit the connection's reassembly budget.

use crate::error::ProtocolError;
use crate::message::{Progress, SplitFragment};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Size of the binary split header.
pub const SPLIT_HEADER_SIZE: usize = 28;

/// Encodes the split header for a fragment.
pub fn encode_header(fragment: &SplitFragment) -> Bytes {
    let mut buf = BytesMut::with_capacity(SPLIT_HEADER_SIZE);
    buf.put_slice(fragment.id.as_bytes());
    buf.put_u64(fragment.length);
    buf.put_u32(fragment.index);
    buf.freeze()
}

/// Decodes a split header and attaches the fragment data.
pub fn decode_header(header: &[u8], data: Bytes) -> Result<SplitFragment, ProtocolError> {
    if header.len() != SPLIT_HEADER_SIZE {
        return Err(ProtocolError::InvalidSplitHeader(header.len()));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&header[0..16]);
    let mut length = [0u8; 8];
    length.copy_from_slice(&header[16..24]);
    let mut index = [0u8; 4];
    index.copy_from_slice(&header[24..28]);

    Ok(SplitFragment {
        id: Uuid::from_bytes(id),
        index: u32::from_be_bytes(index),
        length: u64::from_be_bytes(length),
        data,
    })
}

/// Splits an encoded message into fragments of at most `chunk_size` bytes.
///
/// Fragments are returned in index order; every fragment carries the total
/// payload length. A `chunk_size` of zero is treated as one.
pub fn split(
    id: Uuid,
    payload: &Bytes,
    chunk_size: usize,
    max_message_size: u64,
) -> Result<Vec<SplitFragment>, ProtocolError> {
    let length = payload.len() as u64;
    if length > max_message_size {
        return Err(ProtocolError::MessageTooLarge {
            size: length,
            max: max_message_size,
        });
    }

    let chunk_size = chunk_size.max(1);
    if payload.is_empty() {
        return Ok(vec![SplitFragment {
            id,
            index: 0,
            length: 0,
            data: Bytes::new(),
        }]);
    }

    let mut fragments = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut start = 0;
    while start < payload.len() {
        let end = (start + chunk_size).min(payload.len());
        let index = u32::try_from(fragments.len())
            .map_err(|_| ProtocolError::Unframeable("too many fragments"))?;
        fragments.push(SplitFragment {
            id,
            index,
            length,
            data: payload.slice(start..end),
        });
        start = end;
    }
    Ok(fragments)
}

/// Outcome of accepting one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembly {
    /// More fragments are needed.
    Collecting(Progress),
    /// The fragment repeated an index already accepted; nothing changed.
    Duplicate(Progress),
    /// All bytes arrived; the assembled message payload.
    Complete { progress: Progress, payload: Bytes },
    /// The fragment belongs to a transfer that already failed.
    Discarded(Uuid),
}

impl Assembly {
    pub fn progress(&self) -> Option<Progress> {
        match self {
            Assembly::Collecting(p) | Assembly::Duplicate(p) => Some(*p),
            Assembly::Complete { progress, .. } => Some(*progress),
            Assembly::Discarded(_) => None,
        }
    }
}

struct Partial {
    length: u64,
    next_index: u32,
    buffer: BytesMut,
    last_activity: Instant,
}

impl Partial {
    fn progress(&self, id: Uuid) -> Progress {
        Progress {
            id,
            total_size: self.length,
            completed_size: self.buffer.len() as u64,
        }
    }
}

type ProgressObserver = Box<dyn Fn(Progress) + Send + Sync>;

/// Per-connection reassembly state, keyed by transfer id.
pub struct Reassembler {
    max_message_size: u64,
    /// Limit on the summed declared length of collecting transfers.
    budget: u64,
    timeout: Duration,
    partials: HashMap<Uuid, Partial>,
    /// Failed transfer ids and when a fragment of each was last seen.
    failed: HashMap<Uuid, Instant>,
    observer: Option<ProgressObserver>,
}

impl Reassembler {
    /// Creates a reassembler whose budget is twice the message cap.
    pub fn new(max_message_size: u64, timeout: Duration) -> Self {
        Self {
            max_message_size,
            budget: max_message_size.saturating_mul(2),
            timeout,
            partials: HashMap::new(),
            failed: HashMap::new(),
            observer: None,
        }
    }

    /// Sets the reassembly budget in bytes.
    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    /// Registers a callback invoked with the progress after every fragment.
    pub fn set_observer(&mut self, observer: impl Fn(Progress) + Send + Sync + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Accepts one fragment.
    ///
    /// On error the transfer fails; later fragments with the same id yield
    /// [`Assembly::Discarded`] until the id is purged.
    pub fn accept(&mut self, fragment: SplitFragment) -> Result<Assembly, ProtocolError> {
        self.accept_at(fragment, Instant::now())
    }

    /// Accepts one fragment at an explicit instant.
    pub fn accept_at(
        &mut self,
        fragment: SplitFragment,
        now: Instant,
    ) -> Result<Assembly, ProtocolError> {
        let id = fragment.id;
        if let Some(last_seen) = self.failed.get_mut(&id) {
            *last_seen = now;
            debug!(transfer = %id, index = fragment.index, "dropping fragment of failed transfer");
            return Ok(Assembly::Discarded(id));
        }

        let result = self.apply(fragment, now);
        if result.is_err() {
            self.partials.remove(&id);
            self.failed.insert(id, now);
        }
        if let (Some(observer), Ok(assembly)) = (&self.observer, &result) {
            if let Some(progress) = assembly.progress() {
                observer(progress);
            }
        }
        result
    }

    fn apply(&mut self, fragment: SplitFragment, now: Instant) -> Result<Assembly, ProtocolError> {
        let SplitFragment {
            id,
            index,
            length,
            data,
        } = fragment;

        if length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            });
        }

        let reserved = self.reserved_bytes();
        let partial = match self.partials.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if index != 0 {
                    return Err(ProtocolError::FragmentGap {
                        expected: 0,
                        got: index,
                    });
                }
                let attempted = reserved.saturating_add(length);
                if attempted > self.budget {
                    return Err(ProtocolError::BudgetExceeded {
                        attempted,
                        limit: self.budget,
                    });
                }
                debug!(transfer = %id, length, "starting reassembly");
                entry.insert(Partial {
                    length,
                    next_index: 0,
                    buffer: BytesMut::with_capacity(length as usize),
                    last_activity: now,
                })
            }
        };

        if partial.length != length {
            return Err(ProtocolError::LengthMismatch {
                recorded: partial.length,
                got: length,
            });
        }
        if index < partial.next_index {
            return Ok(Assembly::Duplicate(partial.progress(id)));
        }
        if index > partial.next_index {
            return Err(ProtocolError::FragmentGap {
                expected: partial.next_index,
                got: index,
            });
        }

        let received = partial.buffer.len() as u64 + data.len() as u64;
        if received > partial.length {
            return Err(ProtocolError::FragmentOverflow {
                received,
                total: partial.length,
            });
        }

        partial.buffer.extend_from_slice(&data);
        partial.next_index += 1;
        partial.last_activity = now;
        let progress = partial.progress(id);

        if received < length {
            return Ok(Assembly::Collecting(progress));
        }

        let payload = self
            .partials
            .remove(&id)
            .map(|p| p.buffer.freeze())
            .unwrap_or_default();
        Ok(Assembly::Complete { progress, payload })
    }

    /// Drops transfers idle for longer than the configured timeout, and
    /// forgets failed ids not seen for as long.
    ///
    /// Returns the ids of the dropped transfers.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let expired: Vec<Uuid> = self
            .partials
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.partials.remove(id);
        }
        self.failed
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) < timeout);
        expired
    }

    /// Number of transfers still collecting.
    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }

    /// Number of failed transfer ids still remembered.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Summed declared length of the transfers still collecting.
    pub fn reserved_bytes(&self) -> u64 {
        self.partials.values().map(|p| p.length).sum()
    }

    /// Bytes currently held across all partial transfers.
    pub fn buffered_bytes(&self) -> usize {
        self.partials.values().map(|p| p.buffer.len()).sum()
    }

    /// Drops every partial transfer and failed id.
    pub fn clear(&mut self) {
        self.partials.clear();
        self.failed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_MESSAGE_SIZE;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn reassembler() -> Reassembler {
        Reassembler::new(MAX_MESSAGE_SIZE, Duration::from_secs(60))
    }

    fn fragments(payload: &[u8], chunk: usize) -> Vec<SplitFragment> {
        split(
            Uuid::new_v4(),
            &Bytes::copy_from_slice(payload),
            chunk,
            MAX_MESSAGE_SIZE,
        )
        .unwrap()
    }

    #[test]
    fn test_split_header_roundtrip() {
        let fragment = SplitFragment {
            id: Uuid::new_v4(),
            index: 42,
            length: 5 * 1024 * 1024,
            data: Bytes::from_static(b"chunk"),
        };
        let header = encode_header(&fragment);
        assert_eq!(header.len(), SPLIT_HEADER_SIZE);

        let decoded = decode_header(&header, fragment.data.clone()).unwrap();
        assert_eq!(decoded, fragment);

        assert!(matches!(
            decode_header(&header[..27], Bytes::new()),
            Err(ProtocolError::InvalidSplitHeader(27))
        ));
    }

    #[test]
    fn test_split_is_ordered_and_sized() {
        let parts = fragments(b"abcdefghij", 4);
        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(parts.iter().all(|f| f.length == 10));
        assert_eq!(parts[2].data.as_ref(), b"ij");
    }

    #[test]
    fn test_split_rejects_oversized_payload() {
        let result = split(Uuid::new_v4(), &Bytes::from(vec![0u8; 11]), 4, 10);
        assert!(matches!(
            result,
            Err(ProtocolError::MessageTooLarge { size: 11, max: 10 })
        ));
    }

    #[test]
    fn test_reassemble_with_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut r = reassembler();
        let sink = seen.clone();
        r.set_observer(move |p| sink.lock().unwrap().push(p.completed_size));

        let parts = fragments(b"hello world", 4);
        let mut outcome = None;
        for part in parts {
            outcome = Some(r.accept(part).unwrap());
        }

        match outcome.unwrap() {
            Assembly::Complete { payload, progress } => {
                assert_eq!(payload.as_ref(), b"hello world");
                assert_eq!(progress.completed_size, progress.total_size);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(*seen.lock().unwrap(), vec![4, 8, 11]);
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn test_cap_enforced_before_allocation() {
        let mut r = Reassembler::new(100, Duration::from_secs(60));
        let fragment = SplitFragment {
            id: Uuid::new_v4(),
            index: 0,
            length: u64::MAX,
            data: Bytes::from_static(b"x"),
        };
        let result = r.accept(fragment);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
        assert_eq!(r.in_flight(), 0);
        assert_eq!(r.buffered_bytes(), 0);
    }

    #[test]
    fn test_gap_fails_whole_message() {
        let mut r = reassembler();
        let parts = fragments(b"abcdefghi", 3);
        assert_eq!(parts.len(), 3);

        let id = parts[0].id;
        r.accept(parts[0].clone()).unwrap();
        let result = r.accept(parts[2].clone());
        assert!(matches!(
            result,
            Err(ProtocolError::FragmentGap {
                expected: 1,
                got: 2
            })
        ));
        assert_eq!(r.in_flight(), 0);

        // The late middle fragment cannot resurrect the transfer.
        let late = r.accept(parts[1].clone()).unwrap();
        assert_eq!(late, Assembly::Discarded(id));
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn test_failed_transfer_reports_once() {
        let seen = Arc::new(Mutex::new(0));
        let mut r = reassembler();
        let sink = seen.clone();
        r.set_observer(move |_| *sink.lock().unwrap() += 1);

        let parts = fragments(&[7u8; 90], 10);
        assert_eq!(parts.len(), 9);

        let mut errors = 0;
        let mut discarded = 0;
        for (i, part) in parts.into_iter().enumerate() {
            if i == 1 {
                continue;
            }
            match r.accept(part) {
                Err(_) => errors += 1,
                Ok(Assembly::Discarded(_)) => discarded += 1,
                Ok(_) => {}
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(discarded, 6);
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(r.failed_count(), 1);
    }

    #[test]
    fn test_failed_ids_purged_after_timeout() {
        let mut r = Reassembler::new(MAX_MESSAGE_SIZE, Duration::from_secs(5));
        let start = Instant::now();
        let parts = fragments(b"abcdef", 2);
        r.accept_at(parts[0].clone(), start).unwrap();
        assert!(r.accept_at(parts[2].clone(), start).is_err());
        assert_eq!(r.failed_count(), 1);

        // A dropped fragment keeps the id alive.
        r.accept_at(parts[1].clone(), start + Duration::from_secs(3))
            .unwrap();
        r.purge_expired(start + Duration::from_secs(6));
        assert_eq!(r.failed_count(), 1);

        r.purge_expired(start + Duration::from_secs(8));
        assert_eq!(r.failed_count(), 0);
    }

    #[test]
    fn test_budget_limits_concurrent_transfers() {
        let mut r = Reassembler::new(100, Duration::from_secs(60)).with_budget(150);
        let declare = |length| SplitFragment {
            id: Uuid::new_v4(),
            index: 0,
            length,
            data: Bytes::from_static(b"x"),
        };

        r.accept(declare(100)).unwrap();
        r.accept(declare(50)).unwrap();
        assert_eq!(r.reserved_bytes(), 150);

        let result = r.accept(declare(10));
        assert!(matches!(
            result,
            Err(ProtocolError::BudgetExceeded {
                attempted: 160,
                limit: 150
            })
        ));
        assert_eq!(r.in_flight(), 2);
        assert_eq!(
            ProtocolError::BudgetExceeded {
                attempted: 1,
                limit: 0
            }
            .error_code(),
            crate::ErrorCode::SplitFailed
        );
    }

    #[test]
    fn test_budget_released_on_completion() {
        let mut r = Reassembler::new(100, Duration::from_secs(60)).with_budget(10);
        for _ in 0..3 {
            let parts = fragments(b"0123456789", 4);
            let mut last = None;
            for part in parts {
                last = Some(r.accept(part).unwrap());
            }
            assert!(matches!(last, Some(Assembly::Complete { .. })));
        }
        assert_eq!(r.reserved_bytes(), 0);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let mut r = reassembler();
        let parts = fragments(b"abcdef", 2);

        r.accept(parts[0].clone()).unwrap();
        r.accept(parts[1].clone()).unwrap();
        let dup = r.accept(parts[0].clone()).unwrap();
        assert!(matches!(dup, Assembly::Duplicate(p) if p.completed_size == 4));

        let done = r.accept(parts[2].clone()).unwrap();
        assert!(matches!(done, Assembly::Complete { payload, .. } if payload.as_ref() == b"abcdef"));
    }

    #[test]
    fn test_length_mismatch_fails() {
        let mut r = reassembler();
        let mut parts = fragments(b"abcdef", 3);
        r.accept(parts[0].clone()).unwrap();

        parts[1].length = 7;
        let result = r.accept(parts[1].clone());
        assert!(matches!(
            result,
            Err(ProtocolError::LengthMismatch {
                recorded: 6,
                got: 7
            })
        ));
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn test_overflow_fails() {
        let mut r = reassembler();
        let id = Uuid::new_v4();
        r.accept(SplitFragment {
            id,
            index: 0,
            length: 4,
            data: Bytes::from_static(b"abc"),
        })
        .unwrap();
        let result = r.accept(SplitFragment {
            id,
            index: 1,
            length: 4,
            data: Bytes::from_static(b"de"),
        });
        assert!(matches!(
            result,
            Err(ProtocolError::FragmentOverflow {
                received: 5,
                total: 4
            })
        ));
    }

    #[test]
    fn test_empty_message() {
        let mut r = reassembler();
        let parts = fragments(b"", 8);
        assert_eq!(parts.len(), 1);
        let done = r.accept(parts[0].clone()).unwrap();
        assert!(matches!(done, Assembly::Complete { payload, .. } if payload.is_empty()));
    }

    #[test]
    fn test_purge_expired() {
        let mut r = Reassembler::new(MAX_MESSAGE_SIZE, Duration::from_secs(5));
        let start = Instant::now();
        let parts = fragments(b"abcdef", 2);
        r.accept_at(parts[0].clone(), start).unwrap();

        assert!(r.purge_expired(start + Duration::from_secs(1)).is_empty());
        let purged = r.purge_expired(start + Duration::from_secs(5));
        assert_eq!(purged, vec![parts[0].id]);
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn test_interleaved_transfers() {
        let mut r = reassembler();
        let a = fragments(b"aaaaaa", 2);
        let b = fragments(b"bbbb", 2);

        r.accept(a[0].clone()).unwrap();
        r.accept(b[0].clone()).unwrap();
        r.accept(a[1].clone()).unwrap();
        let b_done = r.accept(b[1].clone()).unwrap();
        assert!(matches!(b_done, Assembly::Complete { payload, .. } if payload.as_ref() == b"bbbb"));
        assert_eq!(r.in_flight(), 1);
        let a_done = r.accept(a[2].clone()).unwrap();
        assert!(matches!(a_done, Assembly::Complete { payload, .. } if payload.as_ref() == b"aaaaaa"));
    }

    proptest! {
        #[test]
        fn prop_split_reassemble_any_chunk_size(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            chunk_seed in any::<usize>(),
        ) {
            let chunk = chunk_seed % payload.len() + 1;
            let mut r = reassembler();
            let parts = fragments(&payload, chunk);
            prop_assert_eq!(parts.len(), payload.len().div_ceil(chunk));

            let mut assembled = None;
            for part in parts {
                if let Assembly::Complete { payload, .. } = r.accept(part).unwrap() {
                    assembled = Some(payload);
                }
            }
            let assembled = assembled.unwrap();
            prop_assert_eq!(assembled.as_ref(), payload.as_slice());
            prop_assert_eq!(r.in_flight(), 0);
        }
    }
}
