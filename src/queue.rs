//! Operation queue — an arena of work items with parent/child accounting,
//! covering every queue-item variant (copy, move, upload, delete, and
//! change-attributes, each with its own explore/resolve-link/file/dir
//! sub-variants).
//!
//! Grounded on `TransferQueue` (`sorng-ftp::ftp::queue`), generalized from
//! its flat `HashMap<String, TransferItem>` + `VecDeque` order list into a
//! `Vec<Item>` arena addressed by `u32` index, chosen to represent the
//! cyclic parent/child graph without fighting the borrow checker — items
//! are never removed once added (only transitioned to a terminal
//! state), so a `u32` index doubles as the item's stable, monotonic id.

use serde::{Deserialize, Serialize};

/// Every queue item variant the engine can enqueue. `ExploreDir` items are
/// placeholders: once their directory listing arrives, `replace_with_list`
/// turns them into parents of concrete file/dir/link children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    CopyResolveLink,
    MoveResolveLink,
    CopyExploreDir,
    MoveExploreDir,
    MoveExploreDirLink,
    UploadCopyExploreDir,
    UploadMoveExploreDir,
    DeleteExploreDir,
    DeleteLink,
    DeleteFile,
    DeleteDir,
    MoveDeleteDir,
    MoveDeleteDirLink,
    UploadMoveDeleteDir,
    CopyFileOrFileLink,
    MoveFileOrFileLink,
    UploadCopyFile,
    UploadMoveFile,
    ChAttrsExploreDir,
    ChAttrsExploreDirLink,
    ChAttrsResolveLink,
    ChAttrsFile,
    ChAttrsDir,
}

impl ItemKind {
    /// Whether this variant is a placeholder that must be expanded via
    /// `replace_with_list` rather than executed directly.
    pub fn is_explore(self) -> bool {
        matches!(
            self,
            ItemKind::CopyExploreDir
                | ItemKind::MoveExploreDir
                | ItemKind::MoveExploreDirLink
                | ItemKind::UploadCopyExploreDir
                | ItemKind::UploadMoveExploreDir
                | ItemKind::DeleteExploreDir
                | ItemKind::ChAttrsExploreDir
                | ItemKind::ChAttrsExploreDirLink
        )
    }

    pub fn is_resolve_link(self) -> bool {
        matches!(
            self,
            ItemKind::CopyResolveLink | ItemKind::MoveResolveLink | ItemKind::ChAttrsResolveLink
        )
    }

    /// The "parent item / finaliser" (glossary) this explore placeholder
    /// converts into once every child it spawned has reached a terminal
    /// state: the directory-level op (`RMD`, local rmdir, `SITE CHMOD`)
    /// that can only run after the directory's contents are already
    /// resolved. `CopyExploreDir`/`UploadCopyExploreDir` have none — a copy
    /// never needs a directory-level server op once its files are placed,
    /// the target directory itself having already been created as a disk-
    /// work precondition.
    pub fn finaliser_kind(self) -> Option<ItemKind> {
        match self {
            ItemKind::DeleteExploreDir => Some(ItemKind::DeleteDir),
            ItemKind::MoveExploreDir => Some(ItemKind::MoveDeleteDir),
            ItemKind::MoveExploreDirLink => Some(ItemKind::MoveDeleteDirLink),
            ItemKind::UploadMoveExploreDir => Some(ItemKind::UploadMoveDeleteDir),
            ItemKind::ChAttrsExploreDir | ItemKind::ChAttrsExploreDirLink => Some(ItemKind::ChAttrsDir),
            _ => None,
        }
    }
}

/// Per-item failure classification — a distinct, smaller layer than
/// [`crate::error::EngineError`], used for queue bookkeeping and the
/// operation's final "had skips" / "had failures" summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemCode {
    InvalidPath,
    CannotCwd,
    DirEndlessLoop,
    CannotCreateDir,
    CannotCreateFile,
    CannotOpenSource,
    CannotDeleteSource,
    CannotListDir,
    TargetAlreadyExists,
    NetworkError,
    LowMemory,
    UserSkipped,
    UnknownAttrs,
    FileHidden,
    DirHidden,
    DirNotEmpty,
    Other,
}

/// Per-item override the user (or an earlier retry) has pinned, so the
/// worker doesn't re-ask "target exists, what now?" on every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceAction {
    Overwrite,
    Skip,
    Resume,
    Retry,
    Autorename,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Waiting,
    Processing,
    Done,
    Skipped,
    Error(ProblemCode),
    /// Blocked on a policy decision (unknown chmod bits, a hidden file/dir
    /// at delete time, a disk-work collision) the operation's policy
    /// resolved to "ask-user" rather than a silent fix. Not terminal: a
    /// caller resolves it via [`OperationQueue::resolve_user_input`], which
    /// hands the item back to `Waiting` with a `force_action` set so the
    /// next attempt on any worker applies the user's choice.
    UserInputNeeded(ProblemCode),
    /// A user-input-needed item the user explicitly chose not to resolve
    /// (e.g. dismissed the whole operation rather than answering every
    /// prompt). Terminal, distinct from `Error` so the operation's summary
    /// can tell "the engine couldn't do it" apart from "the user declined".
    ForcedToFail,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Done | ItemState::Skipped | ItemState::Error(_) | ItemState::ForcedToFail
        )
    }

    pub fn is_user_input_needed(&self) -> bool {
        matches!(self, ItemState::UserInputNeeded(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: u32,
    pub parent: Option<u32>,
    pub kind: ItemKind,
    pub source_path: String,
    pub target_path: Option<String>,
    pub name: String,
    pub state: ItemState,
    pub force_action: Option<ForceAction>,
    /// Number of direct children spawned for this item (0 until an
    /// `ExploreDir` placeholder is expanded).
    pub children_total: u32,
    pub children_finished: u32,
    /// `DeleteLink`/`DeleteFile`'s `is_hidden_file`, `DeleteExploreDir`'s
    /// `is_hidden_dir` — set from the listing entry's name at explore time
    /// (a leading `.` on the dialects that report one), consulted against
    /// `OperationConfig::hidden_item_policy` before the delete is issued.
    pub is_hidden: bool,
    /// The chmod target for `ChAttrsFile`/`ChAttrsDir`/`ChAttrsResolveLink`
    /// items — carried separately from `target_path` because a chmod mode
    /// string is not a path and must not be appended-to-with-child-name
    /// the way a copy/move/upload target is.
    pub new_mode: Option<String>,
    /// `ChAttrsExploreDir`/`ChAttrsExploreDirLink`/`ChAttrsResolveLink`'s
    /// "original-rights string" — the listing's raw permissions column for
    /// this entry, needed at chmod time to detect attribute bits the
    /// configured and/or-mask would silently drop.
    pub original_rights: Option<String>,
    /// `ChAttrsFile`/`ChAttrsDir`'s attr-error flag: set when this item's
    /// `SITE CHMOD` was skipped or asked-about because applying the
    /// configured mask would have lost bits (setuid/setgid/sticky) not
    /// expressible in a plain `rwx` mask.
    pub attr_error: bool,
}

impl Item {
    fn new(id: u32, parent: Option<u32>, kind: ItemKind, source_path: String, target_path: Option<String>, name: String) -> Self {
        Self {
            id,
            parent,
            kind,
            source_path,
            target_path,
            name,
            state: ItemState::Waiting,
            force_action: None,
            children_total: 0,
            children_finished: 0,
            is_hidden: false,
            new_mode: None,
            original_rights: None,
            attr_error: false,
        }
    }
}

/// Aggregate counters for the whole operation — the all-done / had-skips /
/// had-failures terminal classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub total: u32,
    pub done: u32,
    pub skipped: u32,
    pub errors: u32,
    pub user_input_needed: u32,
}

impl QueueCounters {
    pub fn is_finished(&self) -> bool {
        self.total == self.done + self.skipped + self.errors
    }

    pub fn outcome(&self) -> OperationOutcome {
        if self.errors > 0 {
            OperationOutcome::HadFailures
        } else if self.skipped > 0 {
            OperationOutcome::HadSkips
        } else {
            OperationOutcome::AllDone
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    AllDone,
    HadSkips,
    HadFailures,
}

/// The arena-backed queue itself. Never removes items; only appends and
/// transitions state, so existing `u32` ids remain valid for the whole
/// operation's lifetime.
#[derive(Debug, Default)]
pub struct OperationQueue {
    items: Vec<Item>,
    locked: bool,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root item with no parent — one per path/name the user
    /// selected to act on.
    pub fn add_top_level(&mut self, kind: ItemKind, source_path: String, target_path: Option<String>, name: String) -> u32 {
        let id = self.items.len() as u32;
        self.items.push(Item::new(id, None, kind, source_path, target_path, name));
        id
    }

    /// Add a child of `parent`, incrementing the parent's expected count.
    /// Panics if `parent` is out of range — callers only ever pass ids this
    /// queue itself issued.
    pub fn add_child(&mut self, parent: u32, kind: ItemKind, source_path: String, target_path: Option<String>, name: String) -> u32 {
        let id = self.items.len() as u32;
        self.items.push(Item::new(id, Some(parent), kind, source_path, target_path, name));
        self.items[parent as usize].children_total += 1;
        id
    }

    /// Turn an `ExploreDir`/`ResolveLink` placeholder into a parent of
    /// concrete children once its listing (or link target) is known. The
    /// placeholder item itself never executes further; it finalises only
    /// once every spawned child reaches a terminal state.
    pub fn replace_with_list(
        &mut self,
        parent: u32,
        children: Vec<(ItemKind, String, Option<String>, String)>,
    ) -> Vec<u32> {
        if children.is_empty() {
            // An empty directory finalises immediately — there is nothing
            // to wait on.
            self.update_state(parent, ItemState::Done);
            return Vec::new();
        }
        children
            .into_iter()
            .map(|(kind, src, tgt, name)| self.add_child(parent, kind, src, tgt, name))
            .collect()
    }

    pub fn get(&self, id: u32) -> Option<&Item> {
        self.items.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Item> {
        self.items.get_mut(id as usize)
    }

    pub fn update_force_action(&mut self, id: u32, action: ForceAction) {
        if let Some(item) = self.get_mut(id) {
            item.force_action = Some(action);
        }
    }

    /// Set the target mode string on a top-level `ChAttrsFile`/
    /// `ChAttrsDir`/`ChAttrsExploreDir`/`ChAttrsExploreDirLink`/
    /// `ChAttrsResolveLink` item — there is no `new_mode` parameter on
    /// `add_top_level` because only this one `ItemKind` family needs it,
    /// and `explore_directory` copies it onto every child it spawns.
    pub fn set_chattrs_mode(&mut self, id: u32, mode: impl Into<String>) {
        if let Some(item) = self.get_mut(id) {
            item.new_mode = Some(mode.into());
        }
    }

    /// The user answered a `user-input-needed` prompt: pin their choice as
    /// this item's `force_action` and hand it back to `Waiting` so the next
    /// worker to pick it up applies it. Returns `false` if the item wasn't
    /// actually waiting on input (a stale resolution from a UI the item has
    /// since moved past).
    pub fn resolve_user_input(&mut self, id: u32, action: ForceAction) -> bool {
        match self.get_mut(id) {
            Some(item) if item.state.is_user_input_needed() => {
                item.force_action = Some(action);
                item.state = ItemState::Waiting;
                true
            }
            _ => false,
        }
    }

    /// The user declined to resolve a `user-input-needed` item (dismissed
    /// the whole operation rather than answering every prompt) — finalise
    /// it as `ForcedToFail` rather than leaving it stuck forever.
    pub fn force_to_fail(&mut self, id: u32) {
        self.update_state(id, ItemState::ForcedToFail);
    }

    /// Transition an item's state, rolling the effect up to its parent's
    /// child counters and recursively finalising ancestors whose every
    /// child has now reached a terminal state — the "parent item
    /// finaliser" the glossary describes.
    pub fn update_state(&mut self, id: u32, new_state: ItemState) {
        let Some(item) = self.get_mut(id) else { return };
        let was_terminal = item.state.is_terminal();
        item.state = new_state;
        let is_terminal_now = self.items[id as usize].state.is_terminal();

        if !was_terminal && is_terminal_now {
            self.bump_parent_chain(id);
        }
    }

    fn bump_parent_chain(&mut self, mut id: u32) {
        loop {
            let parent = match self.items.get(id as usize).and_then(|i| i.parent) {
                Some(p) => p,
                None => break,
            };
            let Some(parent_item) = self.items.get_mut(parent as usize) else {
                break;
            };
            parent_item.children_finished += 1;
            let all_children_done = parent_item.children_finished >= parent_item.children_total;
            let parent_already_terminal = parent_item.state.is_terminal();

            if all_children_done && !parent_already_terminal && parent_item.children_total > 0 {
                let any_error =
                    self.any_child_in(parent, |s| matches!(s, ItemState::Error(_) | ItemState::ForcedToFail));
                let any_skip = self.any_child_in(parent, |s| matches!(s, ItemState::Skipped));

                if !any_error && !any_skip {
                    if let Some(finaliser_kind) = parent_item.kind.finaliser_kind() {
                        // This placeholder is a finaliser-bearing explore (a
                        // directory delete, move, or change-attrs), and
                        // every child actually made it through: it doesn't
                        // roll up to a terminal state on its own — it
                        // converts into the directory-level op
                        // (`DeleteDir`/`ChAttrsDir`/...) and goes back to
                        // `Waiting` so a worker actually runs
                        // `RMD`/`SITE CHMOD`/local rmdir against it,
                        // carrying its accumulated child counters along
                        // since it keeps the same id. The chain stops here
                        // — it isn't terminal yet, so nothing above it
                        // should be bumped either.
                        let parent_item = &mut self.items[parent as usize];
                        parent_item.kind = finaliser_kind;
                        parent_item.state = ItemState::Waiting;
                        break;
                    }
                }
                // Either an ordinary explore placeholder (copy/upload-copy
                // a directory, with no directory-level op to run once
                // every file is placed) or a finaliser-bearing one that
                // isn't going to get a clean run — a child failed or was
                // skipped, so issuing `RMD`/`SITE CHMOD` against a
                // directory that still has an unfinished entry in it would
                // only fail anyway. Roll straight up instead of running it.
                let rollup = if any_error {
                    ItemState::Error(ProblemCode::Other)
                } else if any_skip {
                    ItemState::Skipped
                } else {
                    ItemState::Done
                };
                self.items[parent as usize].state = rollup;
                id = parent;
                continue;
            }
            break;
        }
    }

    fn any_child_in(&self, parent: u32, pred: impl Fn(&ItemState) -> bool) -> bool {
        self.items
            .iter()
            .filter(|i| i.parent == Some(parent))
            .any(|i| pred(&i.state))
    }

    /// True while the coordinator holds the queue open for more top-level
    /// adds (e.g. mid drag-and-drop); once locked, `find_work` is the only
    /// writer besides `update_state`/`replace_with_list`.
    pub fn lock_for_more_operations(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Find the next `Waiting`, non-explore-placeholder item a worker
    /// should execute, and mark it `Processing`. Explore/resolve-link
    /// placeholders are handed out too — the worker is what turns them
    /// into children via `replace_with_list`.
    pub fn find_work(&mut self) -> Option<u32> {
        let next = self
            .items
            .iter()
            .find(|i| i.state == ItemState::Waiting)
            .map(|i| i.id)?;
        self.items[next as usize].state = ItemState::Processing;
        Some(next)
    }

    pub fn counters(&self) -> QueueCounters {
        let mut c = QueueCounters::default();
        for item in &self.items {
            c.total += 1;
            match &item.state {
                ItemState::Done => c.done += 1,
                ItemState::Skipped => c.skipped += 1,
                ItemState::Error(_) | ItemState::ForcedToFail => c.errors += 1,
                ItemState::UserInputNeeded(_) => c.user_input_needed += 1,
                _ => {}
            }
        }
        c
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_add_and_find_work() {
        let mut q = OperationQueue::new();
        let id = q.add_top_level(ItemKind::CopyFileOrFileLink, "/a".into(), Some("/b".into()), "a".into());
        let found = q.find_work().unwrap();
        assert_eq!(found, id);
        assert_eq!(q.get(id).unwrap().state, ItemState::Processing);
        assert!(q.find_work().is_none());
    }

    #[test]
    fn explore_dir_finalises_when_all_children_done() {
        let mut q = OperationQueue::new();
        let dir = q.add_top_level(ItemKind::CopyExploreDir, "/src".into(), Some("/dst".into()), "src".into());
        let c1 = q.add_child(dir, ItemKind::CopyFileOrFileLink, "/src/a".into(), Some("/dst/a".into()), "a".into());
        let c2 = q.add_child(dir, ItemKind::CopyFileOrFileLink, "/src/b".into(), Some("/dst/b".into()), "b".into());

        q.update_state(c1, ItemState::Done);
        assert_eq!(q.get(dir).unwrap().state, ItemState::Waiting);

        q.update_state(c2, ItemState::Done);
        assert_eq!(q.get(dir).unwrap().state, ItemState::Done);
    }

    #[test]
    fn one_failed_child_marks_parent_error() {
        let mut q = OperationQueue::new();
        let dir = q.add_top_level(ItemKind::DeleteExploreDir, "/src".into(), None, "src".into());
        let c1 = q.add_child(dir, ItemKind::DeleteFile, "/src/a".into(), None, "a".into());
        let c2 = q.add_child(dir, ItemKind::DeleteFile, "/src/b".into(), None, "b".into());

        q.update_state(c1, ItemState::Done);
        q.update_state(c2, ItemState::Error(ProblemCode::CannotDeleteSource));
        assert_eq!(q.get(dir).unwrap().state, ItemState::Error(ProblemCode::Other));
    }

    #[test]
    fn replace_with_empty_list_finalises_immediately() {
        let mut q = OperationQueue::new();
        let dir = q.add_top_level(ItemKind::DeleteExploreDir, "/empty".into(), None, "empty".into());
        let children = q.replace_with_list(dir, Vec::new());
        assert!(children.is_empty());
        assert_eq!(q.get(dir).unwrap().state, ItemState::Done);
    }

    #[test]
    fn counters_tally_terminal_states() {
        let mut q = OperationQueue::new();
        let a = q.add_top_level(ItemKind::CopyFileOrFileLink, "/a".into(), None, "a".into());
        let b = q.add_top_level(ItemKind::CopyFileOrFileLink, "/b".into(), None, "b".into());
        q.update_state(a, ItemState::Done);
        q.update_state(b, ItemState::Skipped);
        let counters = q.counters();
        assert_eq!(counters.total, 2);
        assert_eq!(counters.done, 1);
        assert_eq!(counters.skipped, 1);
        assert!(counters.is_finished());
        assert_eq!(counters.outcome(), OperationOutcome::HadSkips);
    }

    #[test]
    fn force_action_sticks_on_the_item() {
        let mut q = OperationQueue::new();
        let id = q.add_top_level(ItemKind::CopyFileOrFileLink, "/a".into(), Some("/b".into()), "a".into());
        q.update_force_action(id, ForceAction::Overwrite);
        assert_eq!(q.get(id).unwrap().force_action, Some(ForceAction::Overwrite));
    }

    #[test]
    fn user_input_needed_is_not_picked_up_by_find_work() {
        let mut q = OperationQueue::new();
        let id = q.add_top_level(ItemKind::ChAttrsFile, "/a".into(), None, "a".into());
        q.update_state(id, ItemState::UserInputNeeded(ProblemCode::UnknownAttrs));
        assert!(q.find_work().is_none());
        assert!(!q.counters().is_finished());
    }

    #[test]
    fn resolve_user_input_pins_force_action_and_reopens_the_item() {
        let mut q = OperationQueue::new();
        let id = q.add_top_level(ItemKind::ChAttrsFile, "/a".into(), None, "a".into());
        q.update_state(id, ItemState::UserInputNeeded(ProblemCode::UnknownAttrs));

        assert!(q.resolve_user_input(id, ForceAction::Overwrite));
        assert_eq!(q.get(id).unwrap().state, ItemState::Waiting);
        assert_eq!(q.get(id).unwrap().force_action, Some(ForceAction::Overwrite));

        // A second resolution against an item that already moved on is a no-op.
        assert!(!q.resolve_user_input(id, ForceAction::Skip));
    }

    #[test]
    fn explore_dir_converts_to_its_finaliser_once_every_child_succeeds() {
        let mut q = OperationQueue::new();
        let dir = q.add_top_level(ItemKind::DeleteExploreDir, "/src".into(), None, "src".into());
        assert_eq!(q.find_work(), Some(dir));
        let c1 = q.add_child(dir, ItemKind::DeleteFile, "/src/a".into(), None, "a".into());
        let c2 = q.add_child(dir, ItemKind::DeleteFile, "/src/b".into(), None, "b".into());

        q.update_state(c1, ItemState::Done);
        // One child still outstanding — the placeholder must not convert yet.
        assert_eq!(q.get(dir).unwrap().kind, ItemKind::DeleteExploreDir);
        assert_eq!(q.get(dir).unwrap().state, ItemState::Processing);

        q.update_state(c2, ItemState::Done);
        assert_eq!(q.get(dir).unwrap().kind, ItemKind::DeleteDir);
        assert_eq!(q.get(dir).unwrap().state, ItemState::Waiting);
        assert!(!q.counters().is_finished());

        // The worker now actually runs `RMD` against `dir` and reports Done.
        q.update_state(dir, ItemState::Done);
        assert_eq!(q.get(dir).unwrap().state, ItemState::Done);
        assert!(q.counters().is_finished());
    }

    #[test]
    fn explore_dir_skips_its_finaliser_when_a_child_failed() {
        let mut q = OperationQueue::new();
        let dir = q.add_top_level(ItemKind::DeleteExploreDir, "/src".into(), None, "src".into());
        let c1 = q.add_child(dir, ItemKind::DeleteFile, "/src/a".into(), None, "a".into());

        q.update_state(c1, ItemState::Error(ProblemCode::CannotDeleteSource));
        // A failed child means `RMD` would just fail too — roll straight to Error
        // instead of handing the placeholder back out as a `DeleteDir` to run.
        assert_eq!(q.get(dir).unwrap().kind, ItemKind::DeleteExploreDir);
        assert_eq!(q.get(dir).unwrap().state, ItemState::Error(ProblemCode::Other));
    }

    #[test]
    fn force_to_fail_is_terminal_and_rolls_up_like_an_error() {
        let mut q = OperationQueue::new();
        let dir = q.add_top_level(ItemKind::DeleteExploreDir, "/src".into(), None, "src".into());
        let c1 = q.add_child(dir, ItemKind::DeleteFile, "/src/a".into(), None, "a".into());
        q.force_to_fail(c1);
        assert_eq!(q.get(dir).unwrap().state, ItemState::Error(ProblemCode::Other));
        assert_eq!(q.counters().outcome(), OperationOutcome::HadFailures);
    }
}
