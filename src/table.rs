//! Fixed-capacity map from call stacks to per-site allocation statistics.
//!
//! Open hashing over a prime number of buckets, with all nodes handed out
//! from an arena preallocated at construction.  Chains are linked through
//! `u32` node indices rather than pointers.  Nothing in here allocates after
//! construction, which is what lets [`add_site`](SiteTable::add_site) run
//! while the process's allocator is being traced.

use crate::stack::CallStack;

/// Number of hash buckets.  Prime, and much larger than the distinct
/// call-site count of a typical process.
pub const TABLE_SIZE: usize = 8171;

/// Maximum number of distinct call sites tracked.  Once the arena is
/// exhausted, new sites are counted as lost instead of inserted.
pub const MAX_ENTRIES: usize = 32768;

const NO_NODE: u32 = u32::MAX;

/// Aggregated statistics for one call site.
#[derive(Clone, Copy, Debug)]
pub struct Site {
    stack: CallStack,
    invocations: u64,
    invocations_delta: u64,
    min_size: usize,
    max_size: usize,
}

impl Site {
    fn new(stack: CallStack, size: usize) -> Self {
        Site {
            stack,
            invocations: 1,
            invocations_delta: 1,
            min_size: size,
            max_size: size,
        }
    }

    /// Reconstructs a site from previously recorded counters.  Used when
    /// printing dumped snapshots; live sites are only ever created by
    /// [`SiteTable::add_site`].
    pub fn from_parts(
        stack: CallStack,
        invocations: u64,
        invocations_delta: u64,
        min_size: usize,
        max_size: usize,
    ) -> Self {
        Site {
            stack,
            invocations,
            invocations_delta,
            min_size,
            max_size,
        }
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    /// Cumulative number of allocations observed at this site.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Allocations observed since the last report.
    pub fn invocations_delta(&self) -> u64 {
        self.invocations_delta
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn record(&mut self, size: usize) {
        self.invocations += 1;
        self.invocations_delta += 1;
        if size < self.min_size {
            self.min_size = size;
        }
        if size > self.max_size {
            self.max_size = size;
        }
    }
}

struct Node {
    site: Site,
    next: u32,
}

/// Fixed-memory hash table of [`Site`]s.
///
/// Owns all nodes; nodes are never freed individually, only the whole table
/// is reset or dropped.
pub struct SiteTable {
    buckets: Vec<u32>,
    nodes: Vec<Node>,
    size: usize,
    invocations: u64,
    lost: u64,
    collisions: u64,
}

impl SiteTable {
    pub fn new() -> Self {
        SiteTable {
            buckets: vec![NO_NODE; TABLE_SIZE],
            // Reserved up front; pushes below capacity never reallocate.
            nodes: Vec::with_capacity(MAX_ENTRIES),
            size: 0,
            invocations: 0,
            lost: 0,
            collisions: 0,
        }
    }

    /// Records one allocation of `size` bytes at `stack`.
    ///
    /// The single mutating entry point; the caller must hold the trace
    /// lock.  Counts the attempt even when the site cannot be admitted.
    pub fn add_site(&mut self, stack: &CallStack, size: usize) {
        self.invocations += 1;
        let slot = stack.hash() % TABLE_SIZE;

        let mut steps = 0u64;
        let mut idx = self.buckets[slot];
        while idx != NO_NODE {
            let node = &mut self.nodes[idx as usize];
            if node.site.stack == *stack {
                self.collisions += steps;
                node.site.record(size);
                return;
            }
            steps += 1;
            idx = node.next;
        }
        self.collisions += steps;

        if self.nodes.len() == MAX_ENTRIES {
            // Arena exhausted; existing sites keep accumulating, new
            // distinct sites are dropped.
            self.lost += 1;
            return;
        }
        let node_idx = self.nodes.len() as u32;
        self.nodes.push(Node {
            site: Site::new(*stack, size),
            next: self.buckets[slot],
        });
        self.buckets[slot] = node_idx;
        self.size += 1;
    }

    /// Logically frees every node at once and zeroes all counters.  A
    /// subsequent insert behaves as on a freshly constructed table.
    pub fn reset(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = NO_NODE;
        }
        self.nodes.clear();
        self.size = 0;
        self.invocations = 0;
        self.lost = 0;
        self.collisions = 0;
    }

    /// Zeroes every site's delta counter.  Called after each report.
    pub fn reset_deltas(&mut self) {
        for node in self.nodes.iter_mut() {
            node.site.invocations_delta = 0;
        }
    }

    /// Number of distinct call sites currently tracked.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Cumulative insert attempts, including lost ones.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Inserts rejected because the arena was exhausted.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Hash-collision traversal steps.  Diagnostic only.
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.nodes.iter().map(|node| &node.site)
    }

    /// Number of buckets with at least one node.
    pub fn used_slots(&self) -> usize {
        self.buckets.iter().filter(|head| **head != NO_NODE).count()
    }

    /// Length of the longest bucket chain.
    pub fn longest_chain(&self) -> usize {
        let mut longest = 0;
        for &head in self.buckets.iter() {
            let mut len = 0;
            let mut idx = head;
            while idx != NO_NODE && len <= self.size {
                len += 1;
                idx = self.nodes[idx as usize].next;
            }
            longest = longest.max(len);
        }
        longest
    }

    /// Walks the whole table re-deriving its counters and placement,
    /// returning a description of the first mismatch found.
    ///
    /// The primary correctness oracle for tests; [`verify`](Self::verify)
    /// routes mismatches to the fatal path in debug builds.
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.size > MAX_ENTRIES {
            return Err(format!("size {} exceeds MAX_ENTRIES", self.size));
        }
        if self.nodes.len() != self.size {
            return Err(format!(
                "arena holds {} nodes but size is {}",
                self.nodes.len(),
                self.size
            ));
        }
        let mut reachable = 0usize;
        let mut invocations = 0u64;
        for (slot, &head) in self.buckets.iter().enumerate() {
            let mut chain = 0usize;
            let mut idx = head;
            while idx != NO_NODE {
                if chain > self.size {
                    return Err(format!("cycle in bucket {}", slot));
                }
                let site = &self.nodes[idx as usize].site;
                if site.stack.hash() % TABLE_SIZE != slot {
                    return Err(format!(
                        "site hashes to bucket {} but is chained in bucket {}",
                        site.stack.hash() % TABLE_SIZE,
                        slot
                    ));
                }
                if site.invocations < site.invocations_delta {
                    return Err(format!(
                        "site delta {} exceeds cumulative count {}",
                        site.invocations_delta, site.invocations
                    ));
                }
                if site.min_size > site.max_size {
                    return Err(format!(
                        "site size range inverted: {} - {}",
                        site.min_size, site.max_size
                    ));
                }
                invocations += site.invocations;
                reachable += 1;
                chain += 1;
                idx = self.nodes[idx as usize].next;
            }
        }
        if reachable != self.size {
            return Err(format!(
                "{} nodes reachable from buckets but size is {}",
                reachable, self.size
            ));
        }
        if invocations + self.lost != self.invocations {
            return Err(format!(
                "per-site invocations {} + lost {} != table invocations {}",
                invocations, self.lost, self.invocations
            ));
        }
        Ok(())
    }

    /// Structural self-check; a mismatch is an internal error.  Compiled to
    /// a no-op in release builds.
    pub fn verify(&self) {
        #[cfg(debug_assertions)]
        {
            if let Err(msg) = self.check_consistency() {
                crate::fatal::fatal_error(&msg);
            }
        }
    }
}

impl Default for SiteTable {
    fn default() -> Self {
        Self::new()
    }
}
