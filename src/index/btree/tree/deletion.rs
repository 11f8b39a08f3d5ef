use log::debug;

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{
    page_type_of, HeaderPage, InternalPageMut, InternalPageRef, LeafPageMut, LeafPageRef, PageType,
};
use crate::index::btree::tree::base::{BPlusTree, Context, ParentLink};
use crate::storage::buffer::page_guard::WritePageGuard;

impl<K: IndexKey> BPlusTree<K> {
    /// Remove a key; absent keys are a silent no-op.
    ///
    /// Write descent mirrors insert, with delete-safety: a node is safe
    /// when it can lose one entry without underflowing (the root leaf when
    /// it keeps at least one entry, the root internal node when it keeps at
    /// least two children).
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = Context::new();

        let header = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = HeaderPage::root_page_id(header.data());
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        ctx.header_page = Some(header);

        let mut guard = self.bpm.fetch_page_write(root_id)?;

        loop {
            match page_type_of(guard.data()) {
                PageType::Leaf => break,
                PageType::Internal => {
                    let is_root = ctx.write_set.is_empty();
                    let (safe, child_index, child) = {
                        let node = InternalPageRef::<K>::attach(guard.data())?;
                        let safe = if is_root {
                            node.size() > 2
                        } else {
                            node.size() > node.min_size()
                        };
                        let (child_index, child) = node.lookup(key);
                        (safe, child_index, child)
                    };
                    if safe {
                        ctx.release_ancestors();
                    }
                    ctx.write_set.push(ParentLink { guard, child_index });
                    guard = self.bpm.fetch_page_write(child)?;
                }
                PageType::Invalid => {
                    return Err(BTreeError::Corrupted("descent reached an untyped page"))
                }
            }
        }

        let is_root = ctx.write_set.is_empty();
        let (safe, position) = {
            let leaf = LeafPageRef::<K>::attach(guard.data())?;
            let safe = if is_root {
                leaf.size() > 1
            } else {
                leaf.size() > leaf.min_size()
            };
            (safe, leaf.find(key))
        };
        if safe {
            ctx.release_ancestors();
        }

        let position = match position {
            Some(position) => position,
            None => return Ok(()),
        };

        let size = {
            let mut leaf = LeafPageMut::<K>::attach(guard.data_mut())?;
            leaf.remove_at(position);
            leaf.size()
        };

        if is_root {
            if size == 0 {
                // Last key gone: the tree is empty again
                let header = ctx
                    .header_page
                    .as_mut()
                    .ok_or(BTreeError::Corrupted("root change without the header latch"))?;
                HeaderPage::set_root_page_id(header.data_mut(), INVALID_PAGE_ID);
                let pid = guard.page_id();
                drop(guard);
                self.bpm.delete_page(pid)?;
                debug!("tree emptied, root leaf {} freed", pid);
            }
            return Ok(());
        }

        let min_size = LeafPageRef::<K>::attach(guard.data())?.min_size();
        if size >= min_size {
            return Ok(());
        }

        self.handle_leaf_underflow(guard, &mut ctx)
    }

    /// An underflowing non-root leaf borrows from the richer sibling when
    /// that sibling can spare an entry, else merges into the left node of
    /// the pair.
    fn handle_leaf_underflow(
        &self,
        mut leaf_guard: WritePageGuard,
        ctx: &mut Context,
    ) -> Result<(), BTreeError> {
        let ParentLink {
            guard: mut parent_guard,
            child_index,
        } = ctx
            .write_set
            .pop()
            .ok_or(BTreeError::Corrupted("leaf underflow without a retained parent"))?;

        let (mut sib_guard, sib_index) = {
            let parent = InternalPageRef::<K>::attach(parent_guard.data())?;
            self.pick_sibling(&parent, child_index, true)?
        };

        let (sib_size, sib_min) = {
            let sib = LeafPageRef::<K>::attach(sib_guard.data())?;
            (sib.size(), sib.min_size())
        };

        if sib_size - 1 >= sib_min {
            // Redistribute one entry through the shared boundary
            let mut parent = InternalPageMut::<K>::attach(parent_guard.data_mut())?;
            let mut leaf = LeafPageMut::<K>::attach(leaf_guard.data_mut())?;
            let mut sib = LeafPageMut::<K>::attach(sib_guard.data_mut())?;

            if sib_index < child_index {
                let last = sib.size() - 1;
                let (k, r) = (sib.key_at(last), sib.rid_at(last));
                sib.remove_at(last);
                leaf.insert(&k, r);
                parent.set_key_at(child_index, &leaf.key_at(0));
            } else {
                let (k, r) = (sib.key_at(0), sib.rid_at(0));
                sib.remove_at(0);
                leaf.insert(&k, r);
                parent.set_key_at(sib_index, &sib.key_at(0));
            }
            return Ok(());
        }

        // Merge right into left, splice the leaf chain, then take the
        // separator out of the parent
        let (mut left_guard, mut right_guard, sep_index) = if sib_index < child_index {
            (sib_guard, leaf_guard, child_index)
        } else {
            (leaf_guard, sib_guard, sib_index)
        };

        {
            let mut left = LeafPageMut::<K>::attach(left_guard.data_mut())?;
            let mut right = LeafPageMut::<K>::attach(right_guard.data_mut())?;
            let next = right.next_page_id();
            right.move_tail_to(&mut left, 0);
            left.set_next_page_id(next);
        }

        let right_pid = right_guard.page_id();
        drop(right_guard);
        drop(left_guard);
        self.bpm.delete_page(right_pid)?;
        debug!("merged leaf {} away", right_pid);

        self.remove_internal_entry(parent_guard, sep_index, ctx)
    }

    /// Remove a (separator, child) slot from an internal node, then fix any
    /// underflow by borrowing through the parent separator or merging, and
    /// collapse the root when it is down to a single child.
    fn remove_internal_entry(
        &self,
        mut node_guard: WritePageGuard,
        remove_index: usize,
        ctx: &mut Context,
    ) -> Result<(), BTreeError> {
        let size = {
            let mut node = InternalPageMut::<K>::attach(node_guard.data_mut())?;
            node.remove_at(remove_index);
            node.size()
        };

        if ctx.write_set.is_empty() {
            // This node is the root
            if size == 1 {
                let only_child = InternalPageRef::<K>::attach(node_guard.data())?.child_at(0);
                let header = ctx
                    .header_page
                    .as_mut()
                    .ok_or(BTreeError::Corrupted("root change without the header latch"))?;
                HeaderPage::set_root_page_id(header.data_mut(), only_child);
                let pid = node_guard.page_id();
                drop(node_guard);
                self.bpm.delete_page(pid)?;
                debug!("root {} collapsed into child {}", pid, only_child);
            }
            return Ok(());
        }

        let min_size = InternalPageRef::<K>::attach(node_guard.data())?.min_size();
        if size >= min_size {
            return Ok(());
        }

        let ParentLink {
            guard: mut parent_guard,
            child_index,
        } = ctx
            .write_set
            .pop()
            .ok_or(BTreeError::Corrupted("internal underflow without a retained parent"))?;

        let (mut sib_guard, sib_index) = {
            let parent = InternalPageRef::<K>::attach(parent_guard.data())?;
            self.pick_sibling(&parent, child_index, false)?
        };

        let (sib_size, sib_min) = {
            let sib = InternalPageRef::<K>::attach(sib_guard.data())?;
            (sib.size(), sib.min_size())
        };

        if sib_size - 1 >= sib_min {
            // Rotate one child through the parent separator
            let mut parent = InternalPageMut::<K>::attach(parent_guard.data_mut())?;
            let mut node = InternalPageMut::<K>::attach(node_guard.data_mut())?;
            let mut sib = InternalPageMut::<K>::attach(sib_guard.data_mut())?;

            if sib_index < child_index {
                let last = sib.size() - 1;
                let up_key = sib.key_at(last);
                let moved_child = sib.child_at(last);
                sib.remove_at(last);
                let down_key = parent.key_at(child_index);
                node.push_front(&down_key, moved_child);
                parent.set_key_at(child_index, &up_key);
            } else {
                let up_key = sib.key_at(1);
                let moved_child = sib.child_at(0);
                let down_key = parent.key_at(sib_index);
                let end = node.size();
                node.insert_at(end, &down_key, moved_child);
                sib.remove_at(0);
                parent.set_key_at(sib_index, &up_key);
            }
            return Ok(());
        }

        // Merge right into left, pulling the separator down
        let (mut left_guard, mut right_guard, sep_index) = if sib_index < child_index {
            (sib_guard, node_guard, child_index)
        } else {
            (node_guard, sib_guard, sib_index)
        };

        {
            let down_key = {
                let parent = InternalPageRef::<K>::attach(parent_guard.data())?;
                parent.key_at(sep_index)
            };
            let mut left = InternalPageMut::<K>::attach(left_guard.data_mut())?;
            let mut right = InternalPageMut::<K>::attach(right_guard.data_mut())?;
            left.merge_from_right(&mut right, &down_key);
        }

        let right_pid = right_guard.page_id();
        drop(right_guard);
        drop(left_guard);
        self.bpm.delete_page(right_pid)?;
        debug!("merged internal {} away", right_pid);

        self.remove_internal_entry(parent_guard, sep_index, ctx)
    }

    /// Choose the sibling to balance against: the only neighbor at either
    /// edge, otherwise the larger of the two (left wins ties). Returns the
    /// sibling's exclusive guard and its slot in the parent.
    fn pick_sibling(
        &self,
        parent: &InternalPageRef<'_, K>,
        child_index: usize,
        leaf_level: bool,
    ) -> Result<(WritePageGuard, usize), BTreeError> {
        let parent_size = parent.size();
        if child_index == 0 {
            let guard = self.bpm.fetch_page_write(parent.child_at(1))?;
            return Ok((guard, 1));
        }
        if child_index == parent_size - 1 {
            let guard = self.bpm.fetch_page_write(parent.child_at(child_index - 1))?;
            return Ok((guard, child_index - 1));
        }

        let left = self.bpm.fetch_page_write(parent.child_at(child_index - 1))?;
        let right = self.bpm.fetch_page_write(parent.child_at(child_index + 1))?;
        let (left_size, right_size) = if leaf_level {
            (
                LeafPageRef::<K>::attach(left.data())?.size(),
                LeafPageRef::<K>::attach(right.data())?.size(),
            )
        } else {
            (
                InternalPageRef::<K>::attach(left.data())?.size(),
                InternalPageRef::<K>::attach(right.data())?.size(),
            )
        };

        if left_size >= right_size {
            Ok((left, child_index - 1))
        } else {
            Ok((right, child_index + 1))
        }
    }
}
