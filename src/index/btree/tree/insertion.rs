use log::debug;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{
    page_type_of, HeaderPage, InternalPageMut, InternalPageRef, LeafPageMut, LeafPageRef, PageType,
};
use crate::index::btree::tree::base::{BPlusTree, Context, ParentLink};
use crate::storage::buffer::page_guard::WritePageGuard;

impl<K: IndexKey> BPlusTree<K> {
    /// Insert a key/rid pair. Returns false when the key is already present
    /// (unique index); the tree is unchanged in that case.
    ///
    /// Write descent: the header page is latched first so the root pointer
    /// cannot move underneath us, then exclusive latches crab down,
    /// releasing every ancestor as soon as the current node cannot split.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        let mut ctx = Context::new();

        let mut header = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = HeaderPage::root_page_id(header.data());

        if root_id == INVALID_PAGE_ID {
            // Empty tree: the first insert starts a root leaf
            let (leaf_pid, basic) = self.bpm.new_page_guarded()?;
            let mut leaf_guard = basic.upgrade_write();
            let mut leaf = LeafPageMut::<K>::init(leaf_guard.data_mut(), self.leaf_max_size);
            leaf.insert(&key, rid);
            HeaderPage::set_root_page_id(header.data_mut(), leaf_pid);
            return Ok(true);
        }

        ctx.header_page = Some(header);

        let mut guard = self.bpm.fetch_page_write(root_id)?;

        loop {
            match page_type_of(guard.data()) {
                PageType::Leaf => break,
                PageType::Internal => {
                    let (safe, child_index, child) = {
                        let node = InternalPageRef::<K>::attach(guard.data())?;
                        let (child_index, child) = node.lookup(&key);
                        (node.size() < node.max_size(), child_index, child)
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

        let (safe, duplicate, full) = {
            let leaf = LeafPageRef::<K>::attach(guard.data())?;
            (
                leaf.size() + 1 < leaf.max_size(),
                leaf.find(&key).is_some(),
                leaf.size() + 1 == leaf.max_size(),
            )
        };
        if safe {
            ctx.release_ancestors();
        }
        if duplicate {
            return Ok(false);
        }

        if full {
            self.split_leaf(guard, key, rid, &mut ctx)?;
        } else {
            let mut leaf = LeafPageMut::<K>::attach(guard.data_mut())?;
            leaf.insert(&key, rid);
        }
        Ok(true)
    }

    /// Split a full leaf around its midpoint, placing the incoming pair in
    /// whichever half owns it, and push the new sibling's first key up.
    fn split_leaf(
        &self,
        mut leaf_guard: WritePageGuard,
        key: K,
        rid: Rid,
        ctx: &mut Context,
    ) -> Result<(), BTreeError> {
        let left_pid = leaf_guard.page_id();
        let (new_pid, basic) = self.bpm.new_page_guarded()?;
        let mut new_guard = basic.upgrade_write();
        debug!("splitting leaf {} into new leaf {}", left_pid, new_pid);

        let sep_key = {
            let mut old = LeafPageMut::<K>::attach(leaf_guard.data_mut())?;
            let mut new = LeafPageMut::<K>::init(new_guard.data_mut(), self.leaf_max_size);

            let min = old.min_size();
            let put_left = key < old.key_at(min - 1);
            let split_from = if put_left { min - 1 } else { min };
            old.move_tail_to(&mut new, split_from);
            if put_left {
                old.insert(&key, rid);
            } else {
                new.insert(&key, rid);
            }

            // Splice the new leaf into the sibling chain
            new.set_next_page_id(old.next_page_id());
            old.set_next_page_id(new_pid);

            new.key_at(0)
        };

        drop(new_guard);
        drop(leaf_guard);
        self.insert_into_parent(left_pid, sep_key, new_pid, ctx)
    }

    /// Record a split in the parent: either the nearest retained ancestor
    /// absorbs the (separator, new child) pair, or it splits in turn. With
    /// no retained ancestor the split node was the root, and a new root is
    /// built under the still-held header latch.
    fn insert_into_parent(
        &self,
        left_pid: PageId,
        key: K,
        right_pid: PageId,
        ctx: &mut Context,
    ) -> Result<(), BTreeError> {
        match ctx.write_set.pop() {
            Some(ParentLink { mut guard, .. }) => {
                let (size, max_size) = {
                    let node = InternalPageRef::<K>::attach(guard.data())?;
                    (node.size(), node.max_size())
                };
                if size == max_size {
                    self.split_internal(guard, key, right_pid, ctx)
                } else {
                    let mut node = InternalPageMut::<K>::attach(guard.data_mut())?;
                    let slot = node.insert_slot(&key);
                    node.insert_at(slot, &key, right_pid);
                    Ok(())
                }
            }
            None => {
                let (root_pid, basic) = self.bpm.new_page_guarded()?;
                let mut root_guard = basic.upgrade_write();
                let mut root =
                    InternalPageMut::<K>::init(root_guard.data_mut(), self.internal_max_size);
                root.populate_new_root(left_pid, &key, right_pid);

                let header = ctx
                    .header_page
                    .as_mut()
                    .ok_or(BTreeError::Corrupted("root split without the header latch"))?;
                HeaderPage::set_root_page_id(header.data_mut(), root_pid);
                debug!("tree grew a new root {}", root_pid);
                Ok(())
            }
        }
    }

    /// Split a full internal node. The promoted pair is the median-adjacent
    /// pair chosen against the incoming key; when the incoming pair itself
    /// sits at the split point it is promoted directly and never written
    /// into either half.
    fn split_internal(
        &self,
        mut node_guard: WritePageGuard,
        key: K,
        right_pid: PageId,
        ctx: &mut Context,
    ) -> Result<(), BTreeError> {
        let this_pid = node_guard.page_id();
        let (new_pid, basic) = self.bpm.new_page_guarded()?;
        let mut new_guard = basic.upgrade_write();
        debug!("splitting internal {} into new internal {}", this_pid, new_pid);

        let up_key = {
            let mut node = InternalPageMut::<K>::attach(node_guard.data_mut())?;
            let mut new = InternalPageMut::<K>::init(new_guard.data_mut(), self.internal_max_size);

            let mut mid = node.min_size() - 1;
            let put_left;
            let incoming_promoted;
            let up_key;
            let up_child;

            if key < node.key_at(mid) {
                put_left = true;
                incoming_promoted = false;
                up_key = node.key_at(mid);
                up_child = node.child_at(mid);
            } else if key > node.key_at(mid + 1) {
                put_left = false;
                incoming_promoted = false;
                mid += 1;
                up_key = node.key_at(mid);
                up_child = node.child_at(mid);
            } else {
                put_left = false;
                incoming_promoted = true;
                mid += 1;
                up_key = key.clone();
                up_child = right_pid;
            }

            if !incoming_promoted {
                node.remove_at(mid);
            }
            node.move_tail_to_new(&mut new, mid);
            new.set_child_at(0, up_child);

            if !incoming_promoted {
                let target = if put_left { &mut node } else { &mut new };
                let slot = target.insert_slot(&key);
                target.insert_at(slot, &key, right_pid);
            }

            up_key
        };

        drop(new_guard);
        drop(node_guard);
        self.insert_into_parent(this_pid, up_key, new_pid, ctx)
    }
}
