//! Node-alias registry.
//!
//! Every distinct node identity receives a dense `i32 >= 1` alias, assigned
//! by the authoritative back end and mirrored into the others. A
//! process-wide write-through cache holds both directions; misses read
//! through to the back end. Aliases are never recycled.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::Adapter;
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::types::{NodeAlias, NodeId};

mod pieces;

pub use pieces::{AliasPiece, AliasPieces, Piece, Pieces};

const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Cache hit counters, mirrored in a copyable snapshot.
#[derive(Default)]
pub struct AliasCacheMetrics {
    ensure_calls: AtomicU64,
    ensure_misses: AtomicU64,
    resolve_calls: AtomicU64,
    resolve_misses: AtomicU64,
}

/// Point-in-time view of [`AliasCacheMetrics`].
#[derive(Copy, Clone, Debug, Default)]
pub struct AliasCacheMetricsSnapshot {
    /// Nodes looked up through [`AliasCache::ensure`].
    pub ensure_calls: u64,
    /// Nodes that had to read through to the back end.
    pub ensure_misses: u64,
    /// Aliases looked up through [`AliasCache::resolve`].
    pub resolve_calls: u64,
    /// Aliases that had to read through to the back end.
    pub resolve_misses: u64,
}

impl AliasCacheMetrics {
    fn snapshot(&self) -> AliasCacheMetricsSnapshot {
        AliasCacheMetricsSnapshot {
            ensure_calls: self.ensure_calls.load(Ordering::Relaxed),
            ensure_misses: self.ensure_misses.load(Ordering::Relaxed),
            resolve_calls: self.resolve_calls.load(Ordering::Relaxed),
            resolve_misses: self.resolve_misses.load(Ordering::Relaxed),
        }
    }
}

/// Two-direction write-through alias cache.
pub struct AliasCache {
    forward: Mutex<LruCache<NodeId, NodeAlias>>,
    reverse: Mutex<LruCache<NodeAlias, NodeId>>,
    metrics: AliasCacheMetrics,
}

impl AliasCache {
    /// A cache holding up to `capacity` entries per direction.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap());
        AliasCache {
            forward: Mutex::new(LruCache::new(capacity)),
            reverse: Mutex::new(LruCache::new(capacity)),
            metrics: AliasCacheMetrics::default(),
        }
    }

    /// Current hit counters.
    pub fn metrics(&self) -> AliasCacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Preloads both directions, typically from a full back-end scan.
    pub fn warm(&self, pairs: &[(NodeId, NodeAlias)]) {
        let mut forward = self.forward.lock();
        let mut reverse = self.reverse.lock();
        for (node, alias) in pairs {
            forward.put(*node, *alias);
            reverse.put(*alias, *node);
        }
    }

    fn insert(&self, node: NodeId, alias: NodeAlias) {
        self.forward.lock().put(node, alias);
        self.reverse.lock().put(alias, node);
    }

    /// Returns the alias of every input node, creating missing assignments
    /// on `source` (the authoritative back end). Output order matches input
    /// order; duplicates resolve identically.
    pub fn ensure(
        &self,
        ctx: &Ctx,
        source: &dyn Adapter,
        nodes: &[NodeId],
    ) -> Result<Vec<(NodeId, NodeAlias)>> {
        self.metrics
            .ensure_calls
            .fetch_add(nodes.len() as u64, Ordering::Relaxed);

        let mut known: FxHashMap<NodeId, NodeAlias> = FxHashMap::default();
        let mut missing: Vec<NodeId> = Vec::new();
        {
            let mut forward = self.forward.lock();
            for node in nodes {
                if known.contains_key(node) {
                    continue;
                }
                match forward.get(node) {
                    Some(alias) => {
                        known.insert(*node, *alias);
                    }
                    None => {
                        if !missing.contains(node) {
                            missing.push(*node);
                        }
                    }
                }
            }
        }

        if !missing.is_empty() {
            self.metrics
                .ensure_misses
                .fetch_add(missing.len() as u64, Ordering::Relaxed);
            for (node, alias) in source.ensure_node_aliases(ctx, &missing)? {
                self.insert(node, alias);
                known.insert(node, alias);
            }
        }

        nodes
            .iter()
            .map(|node| {
                known
                    .get(node)
                    .map(|alias| (*node, *alias))
                    .ok_or_else(|| Error::Conflict(format!("alias missing for node {node}")))
            })
            .collect()
    }

    /// Resolves aliases back to node identities via `source` (the back end
    /// whose segments reference them). Unknown aliases are malformed data.
    pub fn resolve(
        &self,
        ctx: &Ctx,
        source: &dyn Adapter,
        aliases: &[NodeAlias],
    ) -> Result<Vec<NodeId>> {
        self.metrics
            .resolve_calls
            .fetch_add(aliases.len() as u64, Ordering::Relaxed);

        let mut known: FxHashMap<NodeAlias, NodeId> = FxHashMap::default();
        let mut missing: Vec<NodeAlias> = Vec::new();
        {
            let mut reverse = self.reverse.lock();
            for alias in aliases {
                if known.contains_key(alias) {
                    continue;
                }
                match reverse.get(alias) {
                    Some(node) => {
                        known.insert(*alias, *node);
                    }
                    None => {
                        if !missing.contains(alias) {
                            missing.push(*alias);
                        }
                    }
                }
            }
        }

        if !missing.is_empty() {
            self.metrics
                .resolve_misses
                .fetch_add(missing.len() as u64, Ordering::Relaxed);
            for (alias, node) in source.node_ids_for(ctx, &missing)? {
                self.insert(node, alias);
                known.insert(alias, node);
            }
        }

        aliases
            .iter()
            .map(|alias| {
                known
                    .get(alias)
                    .copied()
                    .ok_or(Error::MalformedAliasPieces("unknown node alias"))
            })
            .collect()
    }

    /// Compresses a piece list for storage.
    pub fn pieces_to_aliases(
        &self,
        ctx: &Ctx,
        source: &dyn Adapter,
        pieces: &Pieces,
    ) -> Result<AliasPieces> {
        let nodes: Vec<NodeId> = pieces.iter().map(|piece| piece.storage_node).collect();
        let resolved = self.ensure(ctx, source, &nodes)?;
        Ok(AliasPieces(
            pieces
                .iter()
                .zip(resolved)
                .map(|(piece, (_, alias))| AliasPiece {
                    number: piece.number,
                    alias,
                })
                .collect(),
        ))
    }

    /// Expands a stored piece list back to node identities.
    pub fn aliases_to_pieces(
        &self,
        ctx: &Ctx,
        source: &dyn Adapter,
        alias_pieces: &AliasPieces,
    ) -> Result<Pieces> {
        let aliases: Vec<NodeAlias> = alias_pieces.0.iter().map(|piece| piece.alias).collect();
        let nodes = self.resolve(ctx, source, &aliases)?;
        Ok(alias_pieces
            .0
            .iter()
            .zip(nodes)
            .map(|(piece, storage_node)| Piece {
                number: piece.number,
                storage_node,
            })
            .collect())
    }
}

impl std::fmt::Debug for AliasCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasCache")
            .field("forward", &self.forward.lock().len())
            .field("reverse", &self.reverse.lock().len())
            .finish()
    }
}
