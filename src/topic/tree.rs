//! The topic tree
//!
//! Each node holds one level ("subtopic") of the hierarchical topic
//! namespace. Nodes at the same level form a doubly linked neighbour
//! chain; each node's hierarchy link points to the chain of its
//! children. The topic `abc/x/1` becomes three chained nodes `abc`,
//! `x`, `1`; a second topic `abc/y/2` branches off as a neighbour of
//! `x`.
//!
//! Nodes are allocated from a fixed arena with an explicit free list.
//! Subtree walks use an explicit work stack rather than recursion, so
//! traversal depth stays decoupled from topic depth.

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::hooks::HookMap;
use crate::protocol::QoS;
use crate::session::ClientSet;

/// Index of a node in the tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u16);

/// Retained or will payload stored at a node
#[derive(Debug, Clone)]
pub struct NodeData {
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug)]
struct TopicNode {
    used: bool,

    dn_nhbr: Option<NodeId>,
    up_nhbr: Option<NodeId>,
    dn_hier: Option<NodeId>,
    up_hier: Option<NodeId>,

    /// Subscribers for each QoS level
    cl_map: [ClientSet; 3],

    data: Option<NodeData>,
    will_client: Option<usize>,
    hook_map: HookMap,

    subtop: CompactString,
}

impl TopicNode {
    fn unused() -> Self {
        TopicNode {
            used: false,
            dn_nhbr: None,
            up_nhbr: None,
            dn_hier: None,
            up_hier: None,
            cl_map: [ClientSet::empty(); 3],
            data: None,
            will_client: None,
            hook_map: HookMap::DEFAULT,
            subtop: CompactString::default(),
        }
    }

    fn reset(&mut self) {
        *self = TopicNode::unused();
    }

    fn has_wildcard(&self) -> bool {
        self.subtop.contains('+') || self.subtop.contains('#')
    }

    fn has_subscribers(&self) -> bool {
        self.cl_map.iter().any(|m| !m.is_empty())
    }

    /// Garbage means nothing keeps the node alive by itself
    fn is_garbage(&self) -> bool {
        !self.has_subscribers()
            && self.data.is_none()
            && self.will_client.is_none()
            && self.hook_map.is_default()
    }
}

/// Where an unmatched topic suffix gets spliced in
enum Anchor {
    /// Whole topic matched; this is the leaf
    Exact(NodeId),
    /// Append the new chain as the last neighbour of this chain head
    Neighbour { head: NodeId, consumed: usize },
    /// Hang the new chain beneath this fully matched node
    Child { parent: NodeId, consumed: usize },
    /// Tree is empty
    Root,
}

/// The subscription and retained-message topic tree
#[derive(Debug)]
pub struct TopicTree {
    nodes: Vec<TopicNode>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    max_subtop: usize,
}

impl TopicTree {
    /// Arena of `capacity` nodes; level strings bounded by `max_subtop`
    pub fn new(capacity: usize, max_subtop: usize) -> Self {
        let nodes = (0..capacity).map(|_| TopicNode::unused()).collect();
        let free = (0..capacity).rev().map(|i| NodeId(i as u16)).collect();
        TopicTree {
            nodes,
            free,
            root: None,
            max_subtop,
        }
    }

    fn node(&self, id: NodeId) -> &TopicNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TopicNode {
        &mut self.nodes[id.0 as usize]
    }

    fn alloc(&mut self, subtop: &str) -> Option<NodeId> {
        if subtop.len() > self.max_subtop {
            return None;
        }

        let id = self.free.pop()?;
        let node = self.node_mut(id);
        node.reset();
        node.used = true;
        node.subtop = CompactString::new(subtop);
        Some(id)
    }

    fn release(&mut self, id: NodeId) {
        self.node_mut(id).reset();
        self.free.push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Scan a neighbour chain for an exact subtopic match
    fn chain_find(&self, head: NodeId, subtop: &str) -> Option<NodeId> {
        let mut cur = Some(head);
        while let Some(id) = cur {
            if self.node(id).subtop.as_str() == subtop {
                return Some(id);
            }
            cur = self.node(id).dn_nhbr;
        }
        None
    }

    /// Walk subtopic by subtopic, scanning each level's neighbour chain
    /// for an exact match and descending into the matched node's child
    /// hierarchy for the next level.
    fn lowest_find(&self, levels: &[&str]) -> Anchor {
        let Some(mut chain) = self.root else {
            return Anchor::Root;
        };

        let mut li = 0;
        loop {
            match self.chain_find(chain, levels[li]) {
                None => {
                    return Anchor::Neighbour {
                        head: chain,
                        consumed: li,
                    }
                }
                Some(node) => {
                    li += 1;
                    if li == levels.len() {
                        return Anchor::Exact(node);
                    }
                    match self.node(node).dn_hier {
                        Some(child) => chain = child,
                        None => {
                            return Anchor::Child {
                                parent: node,
                                consumed: li,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Exact leaf lookup
    pub fn find(&self, topic: &str) -> Option<NodeId> {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        match self.lowest_find(&levels) {
            Anchor::Exact(id) => Some(id),
            _ => None,
        }
    }

    /// Build a child-only chain of nodes for `levels`, returning
    /// (base, leaf). Frees the partial chain on pool exhaustion.
    fn chain_create(&mut self, levels: &[&str]) -> Option<(NodeId, NodeId)> {
        let mut base = None;
        let mut prev: Option<NodeId> = None;

        for level in levels {
            let Some(node) = self.alloc(level) else {
                if let Some(p) = prev {
                    self.try_delete(p);
                }
                return None;
            };

            match prev {
                None => base = Some(node),
                Some(p) => {
                    self.node_mut(p).dn_hier = Some(node);
                    self.node_mut(node).up_hier = Some(p);
                }
            }
            prev = Some(node);
        }

        Some((base?, prev?))
    }

    /// Find or create the leaf for `topic`, splicing a freshly built
    /// chain in as a neighbour at the branch point or as the child of
    /// the deepest matched node.
    pub fn create(&mut self, topic: &str) -> Option<NodeId> {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();

        let anchor = self.lowest_find(&levels);
        let consumed = match &anchor {
            Anchor::Exact(id) => return Some(*id),
            Anchor::Root => 0,
            Anchor::Neighbour { consumed, .. } | Anchor::Child { consumed, .. } => *consumed,
        };

        let (base, leaf) = self.chain_create(&levels[consumed..])?;

        match anchor {
            Anchor::Exact(_) => unreachable!(),
            Anchor::Root => self.root = Some(base),
            Anchor::Neighbour { head, .. } => {
                let mut tail = head;
                while let Some(next) = self.node(tail).dn_nhbr {
                    tail = next;
                }
                self.node_mut(tail).dn_nhbr = Some(base);
                self.node_mut(base).up_nhbr = Some(tail);
            }
            Anchor::Child { parent, .. } => {
                self.node_mut(parent).dn_hier = Some(base);
                self.node_mut(base).up_hier = Some(parent);
            }
        }

        Some(leaf)
    }

    /// A node is destroyable only with no descendants; unlinking it may
    /// orphan its parent or previous neighbour, which the caller keeps
    /// checking via the returned id.
    fn delete_one(&mut self, id: NodeId) -> Option<NodeId> {
        let (dn_nhbr, dn_hier, up_nhbr, up_hier) = {
            let n = self.node(id);
            (n.dn_nhbr, n.dn_hier, n.up_nhbr, n.up_hier)
        };

        if dn_nhbr.is_some() || dn_hier.is_some() {
            return None;
        }

        let mut next = None;
        if let Some(up) = up_nhbr {
            self.node_mut(up).dn_nhbr = None;
            next = Some(up);
        }
        if let Some(up) = up_hier {
            self.node_mut(up).dn_hier = None;
            next = Some(up);
        }
        if up_nhbr.is_none() && up_hier.is_none() && self.root == Some(id) {
            self.root = None;
        }

        self.release(id);
        next
    }

    /// Reclaim `id` if it holds no useful state, then walk upward
    /// freeing ancestors orphaned as a side effect. Stops at the first
    /// node still holding state or descendants.
    pub fn try_delete(&mut self, id: NodeId) {
        let mut cur = Some(id);
        while let Some(node) = cur {
            if !self.node(node).used || !self.node(node).is_garbage() {
                break;
            }
            cur = self.delete_one(node);
        }
    }

    // --- per-node state ---------------------------------------------------

    /// Record a subscription: clear the client's bit at every QoS, then
    /// set it at `qos`. Returns false when the client was already
    /// subscribed at some QoS (a re-subscribe, not a new one).
    pub fn subscribe_at(&mut self, id: NodeId, qos: QoS, client: usize) -> bool {
        let node = self.node_mut(id);
        let was = node.cl_map.iter().any(|m| m.contains(client));
        for map in node.cl_map.iter_mut() {
            map.remove(client);
        }
        node.cl_map[qos as usize].insert(client);
        !was
    }

    /// Drop a client's subscription. Returns true when a bit was
    /// actually cleared. The node is GC-checked either way.
    pub fn unsubscribe_at(&mut self, id: NodeId, client: usize) -> bool {
        let node = self.node_mut(id);
        let mut cleared = false;
        for map in node.cl_map.iter_mut() {
            if map.contains(client) {
                map.remove(client);
                cleared = true;
            }
        }
        self.try_delete(id);
        cleared
    }

    pub fn subscribers(&self, id: NodeId, qos: QoS) -> ClientSet {
        self.node(id).cl_map[qos as usize]
    }

    pub fn data(&self, id: NodeId) -> Option<&NodeData> {
        self.node(id).data.as_ref()
    }

    /// Store a payload at a node, dropping any prior one
    pub fn set_data(&mut self, id: NodeId, payload: &[u8], qos: QoS, retain: bool) {
        self.node_mut(id).data = Some(NodeData {
            payload: payload.to_vec(),
            qos,
            retain,
        });
    }

    pub fn clear_data(&mut self, id: NodeId) {
        self.node_mut(id).data = None;
    }

    pub fn will_client(&self, id: NodeId) -> Option<usize> {
        self.node(id).will_client
    }

    pub fn set_will_client(&mut self, id: NodeId, client: Option<usize>) {
        self.node_mut(id).will_client = client;
    }

    pub fn hook_map(&self, id: NodeId) -> HookMap {
        self.node(id).hook_map
    }

    pub fn hook_map_mut(&mut self, id: NodeId) -> &mut HookMap {
        &mut self.node_mut(id).hook_map
    }

    /// Rebuild the concrete topic path of a node by walking back to the
    /// root: to the head of each neighbour chain, then up one level.
    pub fn path(&self, id: NodeId) -> String {
        let mut levels: SmallVec<[&str; 8]> = SmallVec::new();
        let mut cur = Some(id);

        while let Some(node) = cur {
            levels.push(self.node(node).subtop.as_str());

            let mut head = node;
            while let Some(up) = self.node(head).up_nhbr {
                head = up;
            }
            cur = self.node(head).up_hier;
        }

        levels.reverse();
        levels.join("/")
    }

    // --- matching walks ---------------------------------------------------

    /// Match a concrete published topic against the tree's subscription
    /// nodes, tolerating `+` and `#` nodes. Returns every matching
    /// leaf. A `#` node matches regardless of remaining levels; a
    /// chain must otherwise be consumed in full.
    pub fn match_topic(&self, topic: &str) -> SmallVec<[NodeId; 8]> {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let mut leaves: SmallVec<[NodeId; 8]> = SmallVec::new();

        let mut stack: Vec<(NodeId, usize)> = Vec::new();
        if let Some(root) = self.root {
            stack.push((root, 0));
        }

        while let Some((id, li)) = stack.pop() {
            let node = self.node(id);

            if let Some(nhbr) = node.dn_nhbr {
                stack.push((nhbr, li));
            }

            if node.subtop.as_str() == "#" {
                leaves.push(id);
                continue;
            }

            let matched = node.subtop.as_str() == "+" || node.subtop.as_str() == levels[li];
            if !matched {
                continue;
            }

            if li + 1 == levels.len() {
                leaves.push(id);
            } else if let Some(child) = node.dn_hier {
                stack.push((child, li + 1));
            }
        }

        leaves
    }

    /// Match a wildcard-free-or-`+` filter against the tree's concrete
    /// nodes, yielding each exact-depth match with its rebuilt topic
    /// path. Subscription nodes (wildcard subtopics) are skipped.
    pub fn match_filter(&self, filter: &str) -> SmallVec<[(NodeId, String); 4]> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let mut out: SmallVec<[(NodeId, String); 4]> = SmallVec::new();

        let mut path = String::new();
        let mut stack: Vec<(NodeId, usize, usize)> = Vec::new();
        if let Some(root) = self.root {
            stack.push((root, 0, 0));
        }

        while let Some((id, li, plen)) = stack.pop() {
            path.truncate(plen);
            let node = self.node(id);

            if let Some(nhbr) = node.dn_nhbr {
                stack.push((nhbr, li, plen));
            }

            if node.has_wildcard() {
                continue;
            }

            let matched = levels[li] == "+" || levels[li] == node.subtop.as_str();
            if !matched {
                continue;
            }

            if li > 0 {
                path.push('/');
            }
            path.push_str(node.subtop.as_str());

            if li + 1 == levels.len() {
                out.push((id, path.clone()));
            } else if let Some(child) = node.dn_hier {
                stack.push((child, li + 1, path.len()));
            }
        }

        out
    }

    /// Collect a node and its entire concrete subtree with rebuilt
    /// paths, skipping wildcard (subscription) branches. `base_path`
    /// is the path of `start` itself.
    pub fn collect_subtree(
        &self,
        start: NodeId,
        base_path: &str,
    ) -> SmallVec<[(NodeId, String); 8]> {
        let mut out: SmallVec<[(NodeId, String); 8]> = SmallVec::new();

        let mut path = String::from(base_path);
        let mut stack: Vec<(NodeId, usize, bool)> = vec![(start, path.len(), false)];

        while let Some((id, plen, follow_nhbr)) = stack.pop() {
            path.truncate(plen);
            let node = self.node(id);

            // The start node's own neighbours are outside the subtree.
            if follow_nhbr {
                if let Some(nhbr) = node.dn_nhbr {
                    stack.push((nhbr, plen, true));
                }
            }

            if node.has_wildcard() {
                continue;
            }

            // Every node below or beside the start is one level down at
            // least, so the separator is unconditional.
            if follow_nhbr {
                path.push('/');
                path.push_str(node.subtop.as_str());
            }

            out.push((id, path.clone()));

            if let Some(child) = node.dn_hier {
                stack.push((child, path.len(), true));
            }
        }

        out
    }

    /// Every concrete node in the whole tree, with paths. Used by a
    /// bare `#` subscription.
    pub fn collect_all(&self) -> SmallVec<[(NodeId, String); 8]> {
        let mut out: SmallVec<[(NodeId, String); 8]> = SmallVec::new();

        let mut path = String::new();
        let mut stack: Vec<(NodeId, usize, usize)> = Vec::new();
        if let Some(root) = self.root {
            stack.push((root, 0, 0));
        }

        while let Some((id, depth, plen)) = stack.pop() {
            path.truncate(plen);
            let node = self.node(id);

            if let Some(nhbr) = node.dn_nhbr {
                stack.push((nhbr, depth, plen));
            }

            if node.has_wildcard() {
                continue;
            }

            if depth > 0 {
                path.push('/');
            }
            path.push_str(node.subtop.as_str());

            out.push((id, path.clone()));

            if let Some(child) = node.dn_hier {
                stack.push((child, depth + 1, path.len()));
            }
        }

        out
    }

    /// Drop every subscription held by a client across the whole tree,
    /// reclaiming nodes that become garbage. Returns the number of
    /// subscriptions removed.
    pub fn remove_client(&mut self, client: usize) -> u32 {
        let mut removed = 0;
        let mut visited: Vec<NodeId> = Vec::new();

        let mut stack: Vec<NodeId> = Vec::new();
        if let Some(root) = self.root {
            stack.push(root);
        }

        while let Some(id) = stack.pop() {
            visited.push(id);

            let node = self.node_mut(id);
            for map in node.cl_map.iter_mut() {
                if map.contains(client) {
                    map.remove(client);
                    removed += 1;
                    break;
                }
            }

            let node = self.node(id);
            if let Some(nhbr) = node.dn_nhbr {
                stack.push(nhbr);
            }
            if let Some(child) = node.dn_hier {
                stack.push(child);
            }
        }

        // Deepest-first reclamation; a freed ancestor is skipped by the
        // used guard in try_delete.
        for id in visited.into_iter().rev() {
            if self.node(id).used {
                self.try_delete(id);
            }
        }

        removed
    }

    /// Is the node reachable by an exact walk from the root? Test
    /// support for the garbage-collection invariant.
    pub fn is_reachable(&self, topic: &str) -> bool {
        self.find(topic).is_some()
    }
}
