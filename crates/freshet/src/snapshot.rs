//! The immutable envelope delivered to feed subscribers.
//!
//! A [`Snapshot`] carries the last produced value (or its absence), the fault
//! raised by the last failed production, an in-progress flag and a `revision`
//! number. Revisions grow monotonically per session, so subscribers can merge
//! partial updates from several contributing sources into one coherent view:
//! a [`SnapshotUpdate`] only describes the parts that changed, everything else
//! is carried over from the previous snapshot.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

// --- Fault ---

/// A captured producer error, cheap to clone and safe to re-deliver.
///
/// Faults travel inside snapshots as ordinary data; they are never unwound
/// through a subscription.
#[derive(Clone)]
pub struct Fault {
    inner: Arc<dyn Error>,
}

impl Fault {
    /// Wrap a concrete error.
    pub fn new(error: impl Error + 'static) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Create a fault from a plain message.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TextError(text.into())),
        }
    }

    /// Borrow the underlying error.
    pub fn source(&self) -> &dyn Error {
        &*self.inner
    }

    /// Two faults are the same when they share the captured error.
    pub fn same(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fault({})", self.inner)
    }
}

#[derive(Debug)]
struct TextError(String);

impl fmt::Display for TextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Error for TextError {}

// --- Snapshot ---

/// One immutable state of a feed's value.
#[derive(Clone, Debug)]
pub struct Snapshot<T> {
    value: Option<T>,
    fault: Option<Fault>,
    in_progress: bool,
    revision: u64,
}

impl<T: Clone> Snapshot<T> {
    /// The snapshot every session starts from: no value, no fault, revision 0.
    pub fn initial() -> Self {
        Self {
            value: None,
            fault: None,
            in_progress: false,
            revision: 0,
        }
    }

    /// The current value, if any has been produced.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// The fault raised by the most recent failed production, if it has not
    /// been replaced by a successful one since.
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// True while a production for this session is running.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Monotonically non-decreasing per-session version.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Merge a partial update into this snapshot, producing the next one.
    ///
    /// Parts not mentioned by the update are carried over; the revision always
    /// advances by one, so two distinct snapshots of one session are ordered.
    pub fn apply(&self, update: SnapshotUpdate<T>) -> Self {
        Self {
            value: match update.value {
                Some(value) => value,
                None => self.value.clone(),
            },
            fault: match update.fault {
                Some(fault) => fault,
                None => self.fault.clone(),
            },
            in_progress: update.in_progress.unwrap_or(self.in_progress),
            revision: self.revision + 1,
        }
    }
}

// --- SnapshotUpdate ---

/// A partial snapshot: only the parts a production actually changed.
///
/// `None` on a field means "keep what the previous snapshot had".
#[derive(Clone, Debug)]
pub struct SnapshotUpdate<T> {
    value: Option<Option<T>>,
    fault: Option<Option<Fault>>,
    in_progress: Option<bool>,
}

impl<T> SnapshotUpdate<T> {
    /// A successful production: sets the value, clears any previous fault and
    /// the in-progress flag.
    pub fn value(value: T) -> Self {
        Self {
            value: Some(Some(value)),
            fault: Some(None),
            in_progress: Some(false),
        }
    }

    /// A successful production of "no value": clears value, fault and the
    /// in-progress flag.
    pub fn absent() -> Self {
        Self {
            value: Some(None),
            fault: Some(None),
            in_progress: Some(false),
        }
    }

    /// A failed production: records the fault, keeps the previous value so
    /// subscribers can keep rendering it, clears the in-progress flag.
    pub fn fault(fault: Fault) -> Self {
        Self {
            value: None,
            fault: Some(Some(fault)),
            in_progress: Some(false),
        }
    }

    /// Only flips the in-progress flag; value and fault are retained.
    pub fn progress(in_progress: bool) -> Self {
        Self {
            value: None,
            fault: None,
            in_progress: Some(in_progress),
        }
    }

    /// Replace every part with the ones of `snapshot` (the revision is still
    /// assigned by the session applying the update, not taken from the input).
    pub fn replace(snapshot: Snapshot<T>) -> Self {
        Self {
            value: Some(snapshot.value),
            fault: Some(snapshot.fault),
            in_progress: Some(snapshot.in_progress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_snapshot() {
        let snapshot = Snapshot::<u32>::initial();
        assert!(snapshot.value().is_none());
        assert!(snapshot.fault().is_none());
        assert!(!snapshot.is_in_progress());
        assert_eq!(snapshot.revision(), 0);
    }

    #[test]
    fn test_value_update_clears_fault_and_progress() {
        let snapshot = Snapshot::initial()
            .apply(SnapshotUpdate::progress(true))
            .apply(SnapshotUpdate::fault(Fault::message("boom")))
            .apply(SnapshotUpdate::value(7));

        assert_eq!(snapshot.value(), Some(&7));
        assert!(snapshot.fault().is_none());
        assert!(!snapshot.is_in_progress());
        assert_eq!(snapshot.revision(), 3);
    }

    #[test]
    fn test_fault_retains_previous_value() {
        let snapshot = Snapshot::initial()
            .apply(SnapshotUpdate::value(42))
            .apply(SnapshotUpdate::fault(Fault::message("load failed")));

        assert_eq!(snapshot.value(), Some(&42));
        assert_eq!(snapshot.fault().unwrap().to_string(), "load failed");
    }

    #[test]
    fn test_progress_retains_value_and_fault() {
        let fault = Fault::message("late");
        let snapshot = Snapshot::initial()
            .apply(SnapshotUpdate::value("a"))
            .apply(SnapshotUpdate::fault(fault.clone()))
            .apply(SnapshotUpdate::progress(true));

        assert_eq!(snapshot.value(), Some(&"a"));
        assert!(snapshot.fault().unwrap().same(&fault));
        assert!(snapshot.is_in_progress());
    }

    #[test]
    fn test_absent_clears_value() {
        let snapshot = Snapshot::initial()
            .apply(SnapshotUpdate::value(1))
            .apply(SnapshotUpdate::absent());

        assert!(snapshot.value().is_none());
        assert!(!snapshot.has_value());
    }

    #[test]
    fn test_replace_takes_all_parts() {
        let raw = Snapshot::initial()
            .apply(SnapshotUpdate::value(9))
            .apply(SnapshotUpdate::progress(true));
        let merged = Snapshot::initial().apply(SnapshotUpdate::replace(raw));

        assert_eq!(merged.value(), Some(&9));
        assert!(merged.is_in_progress());
        // Revision is stamped by the applying session, not inherited.
        assert_eq!(merged.revision(), 1);
    }

    fn arbitrary_update() -> impl Strategy<Value = SnapshotUpdate<u8>> {
        prop_oneof![
            any::<u8>().prop_map(SnapshotUpdate::value),
            Just(SnapshotUpdate::absent()),
            Just(SnapshotUpdate::fault(Fault::message("x"))),
            any::<bool>().prop_map(SnapshotUpdate::progress),
        ]
    }

    proptest! {
        #[test]
        fn revision_is_strictly_monotonic(updates in prop::collection::vec(arbitrary_update(), 0..32)) {
            let mut snapshot = Snapshot::initial();
            for update in updates {
                let next = snapshot.apply(update);
                prop_assert!(next.revision() > snapshot.revision());
                snapshot = next;
            }
        }

        #[test]
        fn value_survives_faults_and_progress(value in any::<u8>(), updates in prop::collection::vec(
            prop_oneof![
                Just(SnapshotUpdate::<u8>::fault(Fault::message("x"))),
                any::<bool>().prop_map(SnapshotUpdate::progress),
            ],
            0..16,
        )) {
            let mut snapshot = Snapshot::initial().apply(SnapshotUpdate::value(value));
            for update in updates {
                snapshot = snapshot.apply(update);
            }
            prop_assert_eq!(snapshot.value(), Some(&value));
        }
    }
}
