use containers::{Block, BlockNumber, Bytes32, Header, Milestone};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Oracle-attested `(number, hash)` pair that every canonical chain must pass through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalityBoundary {
    pub number: BlockNumber,
    pub hash: Bytes32,
}

impl From<&Milestone> for FinalityBoundary {
    fn from(milestone: &Milestone) -> Self {
        Self {
            number: milestone.end_block,
            hash: milestone.hash,
        }
    }
}

/// How a block attached to the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connection {
    /// Already present, nothing changed.
    Known,
    /// Extended the branch ending at the parent.
    Extended,
    /// Started a new branch off a header that already had a child.
    Forked,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    /// The root moved up to the boundary.
    pub rerooted: bool,
    /// Number of headers discarded.
    pub removed: usize,
    /// The previous head was among the discarded headers.
    pub reorg: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainBuilderError {
    #[error("block {number} is at or below the root {root}")]
    BelowRoot { number: BlockNumber, root: BlockNumber },
    #[error("parent {parent} of block {number} is unknown")]
    UnknownParent { number: BlockNumber, parent: Bytes32 },
    #[error("block {number} does not follow its parent at {parent_number}")]
    NumberMismatch {
        number: BlockNumber,
        parent_number: BlockNumber,
    },
    #[error("block {number} timestamp does not increase over its parent")]
    TimestampNotIncreasing { number: BlockNumber },
    #[error("block {number} hash {got} conflicts with milestone hash {expected}")]
    MilestoneMismatch {
        number: BlockNumber,
        expected: Bytes32,
        got: Bytes32,
    },
    #[error("finality boundary {got} at {number} conflicts with root {expected}")]
    FinalityConflict {
        number: BlockNumber,
        expected: Bytes32,
        got: Bytes32,
    },
}

#[derive(Clone, Debug)]
struct Node {
    block: Block,
    /// Blocks between the root and this node, the node included.
    depth: u64,
    /// Insertion order, used to break ties between equally long branches.
    seen: u64,
    children: Vec<Bytes32>,
}

/// Fork-choice index over verified blocks above the latest finality boundary.
///
/// Blocks are stored by hash with parent links expressed as hashes, so
/// pruning is a plain map removal. The root is the anchor (last checkpoint or
/// milestone end, or the committed head at startup) and is not itself part of
/// the index: every indexed block has a number strictly above the root.
///
/// The head is the leaf with the greatest depth; among equally deep leaves the
/// one inserted first wins, so repeated evaluation over unchanged input never
/// flips between branches. The head pointer is only ever published at the end
/// of [`evaluate_head`](Self::evaluate_head), after the graph is consistent.
#[derive(Clone, Debug)]
pub struct CanonicalChainBuilder {
    root: Header,
    root_hash: Bytes32,
    root_children: Vec<Bytes32>,
    nodes: HashMap<Bytes32, Node>,
    head: Bytes32,
    next_seen: u64,
    pending_boundary: Option<FinalityBoundary>,
}

impl CanonicalChainBuilder {
    pub fn new(root: Header) -> Self {
        let root_hash = root.hash();
        Self {
            root,
            root_hash,
            root_children: Vec::new(),
            nodes: HashMap::new(),
            head: root_hash,
            next_seen: 0,
            pending_boundary: None,
        }
    }

    /// Drop every indexed block and re-anchor at `root`.
    pub fn reset(&mut self, root: Header) {
        *self = Self::new(root);
    }

    pub fn root(&self) -> &Header {
        &self.root
    }

    pub fn root_hash(&self) -> Bytes32 {
        self.root_hash
    }

    pub fn head(&self) -> Bytes32 {
        self.head
    }

    pub fn head_header(&self) -> &Header {
        self.header(&self.head).unwrap_or(&self.root)
    }

    /// Highest boundary seen that has not been reached by any indexed block yet.
    pub fn pending_boundary(&self) -> Option<FinalityBoundary> {
        self.pending_boundary
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `hash` is an indexed block. The root is not indexed.
    pub fn contains(&self, hash: &Bytes32) -> bool {
        self.nodes.contains_key(hash)
    }

    /// Whether `hash` is the root or an indexed block.
    pub fn is_known(&self, hash: &Bytes32) -> bool {
        *hash == self.root_hash || self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &Bytes32) -> Option<&Block> {
        self.nodes.get(hash).map(|node| &node.block)
    }

    pub fn header(&self, hash: &Bytes32) -> Option<&Header> {
        if *hash == self.root_hash {
            return Some(&self.root);
        }
        self.nodes.get(hash).map(|node| &node.block.header)
    }

    pub fn headers(&self) -> impl Iterator<Item = &Header> {
        self.nodes.values().map(|node| &node.block.header)
    }

    /// Indexed headers at `number`, earliest inserted first.
    pub fn headers_at(&self, number: BlockNumber) -> Vec<&Header> {
        let mut found: Vec<&Node> = self
            .nodes
            .values()
            .filter(|node| node.block.header.number == number)
            .collect();
        found.sort_by_key(|node| node.seen);
        found.into_iter().map(|node| &node.block.header).collect()
    }

    /// Attach `block` to the index.
    ///
    /// The parent must be the root or an indexed block. Blocks at or below the
    /// root are rejected: they are final and never re-enter the index.
    pub fn connect(&mut self, block: Block) -> Result<Connection, ChainBuilderError> {
        let hash = block.hash();
        if self.nodes.contains_key(&hash) {
            return Ok(Connection::Known);
        }

        let number = block.number();
        if number <= self.root.number {
            return Err(ChainBuilderError::BelowRoot {
                number,
                root: self.root.number,
            });
        }

        let parent_hash = block.parent_hash();
        let (parent_number, parent_timestamp, parent_depth, parent_has_children) =
            if parent_hash == self.root_hash {
                (
                    self.root.number,
                    self.root.timestamp,
                    0,
                    !self.root_children.is_empty(),
                )
            } else {
                let parent = self
                    .nodes
                    .get(&parent_hash)
                    .ok_or(ChainBuilderError::UnknownParent {
                        number,
                        parent: parent_hash,
                    })?;
                (
                    parent.block.header.number,
                    parent.block.header.timestamp,
                    parent.depth,
                    !parent.children.is_empty(),
                )
            };

        if number != parent_number.next() {
            return Err(ChainBuilderError::NumberMismatch {
                number,
                parent_number,
            });
        }
        if block.header.timestamp <= parent_timestamp {
            return Err(ChainBuilderError::TimestampNotIncreasing { number });
        }
        if let Some(boundary) = self.pending_boundary {
            if boundary.number == number && boundary.hash != hash {
                return Err(ChainBuilderError::MilestoneMismatch {
                    number,
                    expected: boundary.hash,
                    got: hash,
                });
            }
        }

        if parent_hash == self.root_hash {
            self.root_children.push(hash);
        } else if let Some(parent) = self.nodes.get_mut(&parent_hash) {
            parent.children.push(hash);
        }

        let seen = self.next_seen;
        self.next_seen += 1;
        self.nodes.insert(
            hash,
            Node {
                block,
                depth: parent_depth + 1,
                seen,
                children: Vec::new(),
            },
        );

        Ok(if parent_has_children {
            Connection::Forked
        } else {
            Connection::Extended
        })
    }

    /// Connect blocks in order, stopping at the first failure.
    ///
    /// Returns how many blocks were new to the index.
    pub fn connect_all<I>(&mut self, blocks: I) -> Result<usize, ChainBuilderError>
    where
        I: IntoIterator<Item = Block>,
    {
        let mut connected = 0;
        for block in blocks {
            if self.connect(block)? != Connection::Known {
                connected += 1;
            }
        }
        Ok(connected)
    }

    /// Select and publish the canonical head.
    pub fn evaluate_head(&mut self) -> Bytes32 {
        let boundary = self.pending_boundary;
        let best = self
            .nodes
            .iter()
            .filter(|(_, node)| node.children.is_empty())
            .filter(|(hash, node)| match boundary {
                Some(b) if node.block.header.number >= b.number => {
                    self.ancestor_at(hash, b.number) == Some(b.hash)
                }
                _ => true,
            })
            .max_by_key(|(_, node)| (node.depth, Reverse(node.seen)))
            .map(|(hash, _)| *hash);

        self.head = best.unwrap_or(self.root_hash);
        self.head
    }

    /// Hash of the ancestor of `hash` (or `hash` itself) at `number`.
    pub fn ancestor_at(&self, hash: &Bytes32, number: BlockNumber) -> Option<Bytes32> {
        let mut current = *hash;
        loop {
            let header = self.header(&current)?;
            if header.number == number {
                return Some(current);
            }
            if header.number < number || current == self.root_hash {
                return None;
            }
            current = header.parent_hash;
        }
    }

    /// Blocks from just above the root up to `hash`, ascending.
    pub fn path_from_root(&self, hash: &Bytes32) -> Vec<&Block> {
        let mut path = Vec::new();
        let mut current = *hash;
        while let Some(node) = self.nodes.get(&current) {
            path.push(&node.block);
            current = node.block.header.parent_hash;
        }
        path.reverse();
        path
    }

    /// Deepest header that is an ancestor of both `a` and `b` (the root counts).
    pub fn lowest_common_ancestor(&self, a: &Bytes32, b: &Bytes32) -> Option<Bytes32> {
        let mut a_chain: HashSet<Bytes32> = HashSet::new();
        let mut current = *a;
        loop {
            self.header(&current)?;
            a_chain.insert(current);
            if current == self.root_hash {
                break;
            }
            current = self.nodes.get(&current)?.block.header.parent_hash;
        }

        let mut current = *b;
        loop {
            if a_chain.contains(&current) {
                return Some(current);
            }
            if current == self.root_hash {
                return None;
            }
            current = self.nodes.get(&current)?.block.header.parent_hash;
        }
    }

    /// Blocks strictly after `ancestor` up to and including `head`, ascending.
    pub fn blocks_after(&self, ancestor: &Bytes32, head: &Bytes32) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut current = *head;
        while current != *ancestor {
            match self.nodes.get(&current) {
                Some(node) => {
                    blocks.push(node.block.clone());
                    current = node.block.header.parent_hash;
                }
                None => break,
            }
        }
        blocks.reverse();
        blocks
    }

    /// Discard everything inconsistent with `boundary`.
    ///
    /// When the boundary block is indexed, it becomes the new root and only its
    /// descendants survive. Otherwise every block at or above the boundary
    /// number is discarded (none of them can descend from the boundary) and the
    /// boundary is kept as a pending hint until a matching block connects.
    pub fn prune(&mut self, boundary: FinalityBoundary) -> Result<PruneOutcome, ChainBuilderError> {
        if boundary.number < self.root.number {
            return Ok(PruneOutcome::default());
        }
        if boundary.number == self.root.number {
            if boundary.hash == self.root_hash {
                return Ok(PruneOutcome::default());
            }
            return Err(ChainBuilderError::FinalityConflict {
                number: boundary.number,
                expected: self.root_hash,
                got: boundary.hash,
            });
        }

        let previous_root = self.root_hash;
        let previous_head = self.head;
        let (rerooted, removed) = match self.nodes.get(&boundary.hash) {
            Some(node) if node.block.header.number == boundary.number => {
                let removed = self.reroot(boundary.hash);
                if self
                    .pending_boundary
                    .is_some_and(|pending| pending.number <= boundary.number)
                {
                    self.pending_boundary = None;
                }
                (true, removed)
            }
            _ => {
                let doomed: HashSet<Bytes32> = self
                    .nodes
                    .iter()
                    .filter(|(_, node)| node.block.header.number >= boundary.number)
                    .map(|(hash, _)| *hash)
                    .collect();
                self.remove(&doomed);
                if self
                    .pending_boundary
                    .map_or(true, |pending| pending.number <= boundary.number)
                {
                    self.pending_boundary = Some(boundary);
                }
                (false, doomed.len())
            }
        };

        let reorg = previous_head != previous_root && !self.is_known(&previous_head);
        let head = self.evaluate_head();
        debug!(
            boundary = boundary.number.0,
            rerooted,
            removed,
            reorg,
            head = %head.short(),
            "Pruned chain builder"
        );

        Ok(PruneOutcome {
            rerooted,
            removed,
            reorg,
        })
    }

    /// Move the root to the indexed block `hash`, keeping only its descendants.
    fn reroot(&mut self, hash: Bytes32) -> usize {
        let mut keep: HashSet<Bytes32> = HashSet::new();
        let mut stack = vec![hash];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for child in &node.children {
                    keep.insert(*child);
                    stack.push(*child);
                }
            }
        }

        let Some(new_root) = self.nodes.remove(&hash) else {
            return 0;
        };
        let before = self.nodes.len();
        self.nodes.retain(|hash, _| keep.contains(hash));
        let removed = before - self.nodes.len();

        for node in self.nodes.values_mut() {
            node.depth -= new_root.depth;
        }
        self.root = new_root.block.header;
        self.root_hash = hash;
        self.root_children = new_root.children;
        removed
    }

    fn remove(&mut self, doomed: &HashSet<Bytes32>) {
        if doomed.is_empty() {
            return;
        }
        self.nodes.retain(|hash, _| !doomed.contains(hash));
        self.root_children.retain(|hash| !doomed.contains(hash));
        for node in self.nodes.values_mut() {
            node.children.retain(|hash| !doomed.contains(hash));
        }
    }
}
