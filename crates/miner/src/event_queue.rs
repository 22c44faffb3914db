//! Pending-event queue with coalescing and ordering guarantees.
//!
//! Invariants:
//! - dispatch is priority band first, FIFO within a band;
//! - pairwise coalescing keeps the queue end-state equivalent to the raw
//!   event stream (with the single documented overapproximation that a
//!   `Created` followed by `Deleted` keeps the delete);
//! - deleting a directory purges every pending event below it, and a move
//!   purges pending events below the destination;
//! - every event carries a slot into the per-root counter arena so root
//!   emptiness can be detected without scanning.

use lode_collections::{NodeHandle, OrderedQueue, Priority};
use lode_fs::FileInfo;

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	Created,
	Updated,
	Deleted,
	Moved,
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
	pub kind: EventKind,
	pub file: PathBuf,
	/// Present iff `kind == Moved`.
	pub dest_file: Option<PathBuf>,
	pub info: Option<FileInfo>,
	pub attributes_only: bool,
	pub is_dir: bool,
	/// Root the event belongs to; resolved to a counter slot on admission.
	pub root: Option<PathBuf>,
	root_slot: Option<usize>,
}

impl QueueEvent {
	#[must_use]
	pub fn new(kind: EventKind, file: PathBuf) -> Self {
		Self {
			kind,
			file,
			dest_file: None,
			info: None,
			attributes_only: false,
			is_dir: false,
			root: None,
			root_slot: None,
		}
	}

	#[must_use]
	pub fn with_dest(mut self, dest: PathBuf) -> Self {
		self.dest_file = Some(dest);
		self
	}

	#[must_use]
	pub fn with_info(mut self, info: FileInfo) -> Self {
		self.is_dir = info.is_dir();
		self.info = Some(info);
		self
	}

	#[must_use]
	pub const fn dir(mut self, is_dir: bool) -> Self {
		self.is_dir = is_dir;
		self
	}

	#[must_use]
	pub fn for_root(mut self, root: PathBuf) -> Self {
		self.root = Some(root);
		self
	}

	#[must_use]
	pub const fn attributes(mut self) -> Self {
		self.attributes_only = true;
		self
	}

	fn matches(&self, file: &Path) -> bool {
		self.file == file || self.dest_file.as_deref() == Some(file)
	}
}

struct RootCounter {
	root: PathBuf,
	pending: usize,
}

#[derive(Default)]
pub struct EventQueue {
	queue: OrderedQueue<QueueEvent>,
	by_file: HashMap<PathBuf, Vec<NodeHandle>>,
	roots: Vec<Option<RootCounter>>,
	slots_by_root: HashMap<PathBuf, usize>,
}

enum Pairing {
	KeepPending,
	ReplacePending(QueueEvent),
	Admit(QueueEvent),
}

impl EventQueue {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.queue.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	/// Pending events belonging to `root`; zero for unknown roots.
	#[must_use]
	pub fn root_pending(&self, root: &Path) -> usize {
		self.slots_by_root
			.get(root)
			.and_then(|&slot| self.roots.get(slot))
			.and_then(Option::as_ref)
			.map_or(0, |counter| counter.pending)
	}

	/// Enqueues an event, applying purge and coalescing rules.
	pub fn push(&mut self, event: QueueEvent, priority: Priority) {
		// Structural purges come first: they affect other files' events.
		if event.kind == EventKind::Deleted && event.is_dir {
			self.purge_below(&event.file);
		}
		if event.kind == EventKind::Moved {
			if let Some(dest) = event.dest_file.clone() {
				self.purge_below(&dest);
			}
		}

		match self.pair(event) {
			Pairing::KeepPending => {}
			Pairing::Admit(event) => self.admit(event, priority),
			// A replacement is a brand-new event and must run the full purge
			// and pairing machinery itself (it may land on a file that already
			// has something pending).
			Pairing::ReplacePending(event) => self.push(event, priority),
		}
	}

	pub fn pop(&mut self) -> Option<QueueEvent> {
		let event = self.queue.pop()?;
		self.forget(&event);
		Some(event)
	}

	/// Drops every pending event strictly below `dir`.
	pub fn purge_below(&mut self, dir: &Path) {
		let removed = self.queue.retain(|event| {
			let below = |path: &Path| path != dir && path.starts_with(dir);
			!(below(&event.file) || event.dest_file.as_deref().is_some_and(below))
		});

		if !removed.is_empty() {
			trace!(dir = %dir.display(), count = removed.len(), "purged descendant events");
		}

		for event in removed {
			self.forget(&event);
		}
	}

	/// Finds the most recent pending event on the new event's file and applies
	/// the pairwise coalescing table.
	fn pair(&mut self, new: QueueEvent) -> Pairing {
		use EventKind::{Created, Deleted, Moved, Updated};

		let Some(handle) = self.latest_pending(&new.file) else {
			return Pairing::Admit(new);
		};

		let pending = self.queue.get(handle).expect("handle just resolved");
		let pending_attributes_only = pending.attributes_only;

		match (pending.kind, new.kind) {
			(Created, Updated | Created) | (Deleted, Deleted) => Pairing::KeepPending,

			(Created, Moved) => {
				let pending = self.remove(handle);
				let dest = new.dest_file.clone().expect("moves carry a destination");
				let mut replacement = QueueEvent::new(Created, dest).dir(pending.is_dir);
				replacement.root = new.root.or(pending.root);
				Pairing::ReplacePending(replacement)
			}

			(Created, Deleted) => {
				// The create may not have reached the store yet, but we cannot
				// prove it; keep the delete to be safe.
				self.remove(handle);
				Pairing::Admit(new)
			}

			(Updated, Updated) => {
				if pending_attributes_only && !new.attributes_only {
					self.remove(handle);
					Pairing::Admit(new)
				} else {
					Pairing::KeepPending
				}
			}

			(Updated, Deleted) => {
				self.remove(handle);
				Pairing::Admit(new)
			}

			(Moved, Moved) => {
				let pending = self.remove(handle);
				let dest = new.dest_file.clone().expect("moves carry a destination");
				let mut replacement = QueueEvent::new(Moved, pending.file)
					.with_dest(dest)
					.dir(pending.is_dir || new.is_dir);
				replacement.root = pending.root.or(new.root);
				Pairing::ReplacePending(replacement)
			}

			(Moved, Deleted) => {
				let pending = self.remove(handle);
				let mut replacement =
					QueueEvent::new(Deleted, pending.file).dir(pending.is_dir || new.is_dir);
				replacement.root = pending.root.or(new.root);
				Pairing::ReplacePending(replacement)
			}

			_ => Pairing::Admit(new),
		}
	}

	fn latest_pending(&self, file: &Path) -> Option<NodeHandle> {
		self.by_file
			.get(file)?
			.iter()
			.rev()
			.copied()
			.find(|&handle| {
				self.queue
					.get(handle)
					.is_some_and(|event| event.matches(file))
			})
	}

	fn admit(&mut self, mut event: QueueEvent, priority: Priority) {
		event.root_slot = event.root.as_deref().map(|root| self.root_slot(root));
		if let Some(slot) = event.root_slot {
			if let Some(counter) = self.roots[slot].as_mut() {
				counter.pending += 1;
			}
		}

		let file = event.file.clone();
		let dest = event.dest_file.clone();

		let handle = self.queue.push(event, priority);
		self.by_file.entry(file).or_default().push(handle);
		if let Some(dest) = dest {
			self.by_file.entry(dest).or_default().push(handle);
		}
	}

	fn remove(&mut self, handle: NodeHandle) -> QueueEvent {
		let event = self.queue.remove(handle).expect("handle resolved by caller");
		self.forget(&event);
		event
	}

	/// Detaches an event's bookkeeping after it left the queue.
	fn forget(&mut self, event: &QueueEvent) {
		if let Some(slot) = event.root_slot {
			if let Some(counter) = self.roots.get_mut(slot).and_then(Option::as_mut) {
				counter.pending = counter.pending.saturating_sub(1);
			}
		}

		let mut drop_index = |file: &Path| {
			if let Some(handles) = self.by_file.get_mut(file) {
				handles.retain(|&handle| self.queue.get(handle).is_some());
				if handles.is_empty() {
					self.by_file.remove(file);
				}
			}
		};

		drop_index(&event.file);
		if let Some(dest) = event.dest_file.as_deref() {
			drop_index(dest);
		}
	}

	fn root_slot(&mut self, root: &Path) -> usize {
		if let Some(&slot) = self.slots_by_root.get(root) {
			return slot;
		}

		let counter = RootCounter {
			root: root.to_path_buf(),
			pending: 0,
		};

		let slot = if let Some(free) = self.roots.iter().position(Option::is_none) {
			self.roots[free] = Some(counter);
			free
		} else {
			self.roots.push(Some(counter));
			self.roots.len() - 1
		};

		self.slots_by_root.insert(root.to_path_buf(), slot);
		slot
	}

	/// Drops a root's counter slot; pending events of that root keep their
	/// (now dangling) slot and are only ever used to unlink.
	pub fn unregister_root(&mut self, root: &Path) {
		if let Some(slot) = self.slots_by_root.remove(root) {
			self.roots[slot] = None;
		}
	}

	/// Snapshot of pending counts per registered root.
	#[must_use]
	pub fn pending_by_root(&self) -> Vec<(PathBuf, usize)> {
		self.roots
			.iter()
			.flatten()
			.map(|counter| (counter.root.clone(), counter.pending))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::{EventKind, EventQueue, QueueEvent};

	use lode_collections::Priority;

	use std::path::{Path, PathBuf};

	fn created(file: &str) -> QueueEvent {
		QueueEvent::new(EventKind::Created, PathBuf::from(file)).for_root(PathBuf::from("/r"))
	}

	fn updated(file: &str) -> QueueEvent {
		QueueEvent::new(EventKind::Updated, PathBuf::from(file)).for_root(PathBuf::from("/r"))
	}

	fn deleted(file: &str, is_dir: bool) -> QueueEvent {
		QueueEvent::new(EventKind::Deleted, PathBuf::from(file))
			.dir(is_dir)
			.for_root(PathBuf::from("/r"))
	}

	fn moved(from: &str, to: &str) -> QueueEvent {
		QueueEvent::new(EventKind::Moved, PathBuf::from(from))
			.with_dest(PathBuf::from(to))
			.for_root(PathBuf::from("/r"))
	}

	fn drain(queue: &mut EventQueue) -> Vec<QueueEvent> {
		std::iter::from_fn(|| queue.pop()).collect()
	}

	#[test]
	fn created_swallows_updates_and_repeats() {
		let mut queue = EventQueue::new();
		queue.push(created("/r/a"), Priority::Normal);
		queue.push(updated("/r/a"), Priority::Normal);
		queue.push(created("/r/a"), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Created);
	}

	#[test]
	fn created_then_moved_becomes_created_at_destination() {
		let mut queue = EventQueue::new();
		queue.push(created("/r/a"), Priority::Normal);
		queue.push(moved("/r/a", "/r/b"), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Created);
		assert_eq!(events[0].file, Path::new("/r/b"));
	}

	#[test]
	fn created_then_deleted_keeps_the_delete() {
		let mut queue = EventQueue::new();
		queue.push(created("/r/a"), Priority::Normal);
		queue.push(deleted("/r/a", false), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Deleted);
	}

	#[test]
	fn content_update_beats_attribute_update() {
		let mut queue = EventQueue::new();
		queue.push(updated("/r/a").attributes(), Priority::Normal);
		queue.push(updated("/r/a"), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert!(!events[0].attributes_only);

		let mut queue = EventQueue::new();
		queue.push(updated("/r/a"), Priority::Normal);
		queue.push(updated("/r/a").attributes(), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert!(!events[0].attributes_only);
	}

	#[test]
	fn chained_moves_collapse() {
		let mut queue = EventQueue::new();
		queue.push(moved("/r/a", "/r/b"), Priority::Normal);
		queue.push(moved("/r/b", "/r/c"), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Moved);
		assert_eq!(events[0].file, Path::new("/r/a"));
		assert_eq!(events[0].dest_file.as_deref(), Some(Path::new("/r/c")));
	}

	#[test]
	fn moved_then_deleted_deletes_the_source() {
		let mut queue = EventQueue::new();
		queue.push(moved("/r/a", "/r/b"), Priority::Normal);
		queue.push(deleted("/r/b", false), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Deleted);
		assert_eq!(events[0].file, Path::new("/r/a"));
	}

	#[test]
	fn deleting_a_directory_purges_descendants() {
		let mut queue = EventQueue::new();
		queue.push(created("/r/d/x"), Priority::Normal);
		queue.push(updated("/r/d/y/z"), Priority::Normal);
		queue.push(created("/r/other"), Priority::Normal);
		queue.push(deleted("/r/d", true), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 2);
		assert_eq!(events[0].file, Path::new("/r/other"));
		assert_eq!(events[1].file, Path::new("/r/d"));
	}

	#[test]
	fn moves_purge_below_the_destination() {
		let mut queue = EventQueue::new();
		queue.push(updated("/r/dst/old"), Priority::Normal);
		queue.push(moved("/r/src", "/r/dst"), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Moved);
	}

	#[test]
	fn priority_dispatch_order_is_stable() {
		let mut queue = EventQueue::new();
		queue.push(created("/r/n1"), Priority::Normal);
		queue.push(created("/hot/h1"), Priority::High);
		queue.push(created("/r/n2"), Priority::Normal);

		let events = drain(&mut queue);
		assert_eq!(events[0].file, Path::new("/hot/h1"));
		assert_eq!(events[1].file, Path::new("/r/n1"));
		assert_eq!(events[2].file, Path::new("/r/n2"));
	}

	#[test]
	fn root_counters_track_admission_and_drain() {
		let mut queue = EventQueue::new();
		let root = Path::new("/r");

		queue.push(created("/r/a"), Priority::Normal);
		queue.push(created("/r/b"), Priority::Normal);
		assert_eq!(queue.root_pending(root), 2);

		// Coalesced push does not inflate the counter.
		queue.push(updated("/r/a"), Priority::Normal);
		assert_eq!(queue.root_pending(root), 2);

		queue.pop();
		assert_eq!(queue.root_pending(root), 1);

		queue.pop();
		assert_eq!(queue.root_pending(root), 0);

		queue.unregister_root(root);
		assert_eq!(queue.root_pending(root), 0);
	}

	#[test]
	fn coalescing_is_idempotent_in_effect() {
		// Applying the same burst twice coalesces to the same single event.
		let burst = |queue: &mut EventQueue| {
			queue.push(created("/r/a"), Priority::Normal);
			queue.push(updated("/r/a"), Priority::Normal);
			queue.push(moved("/r/a", "/r/b"), Priority::Normal);
		};

		let mut first = EventQueue::new();
		burst(&mut first);
		let first = drain(&mut first);

		let mut second = EventQueue::new();
		burst(&mut second);
		burst(&mut second);
		let second = drain(&mut second);

		assert_eq!(first.len(), 1);
		assert_eq!(second.len(), 1);
		assert_eq!(first[0].kind, second[0].kind);
		assert_eq!(first[0].file, second[0].file);
	}
}
