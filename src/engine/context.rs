use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};

use crate::engine::guard::Guard;
use crate::slug::Slug;
use crate::value::Outcome;

/// Shared settlement of one execution.
pub(crate) type Work = Shared<BoxFuture<'static, Outcome>>;

/// Position of a [`RunContext`] in the engine's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CollectionId(usize);

/// One execution, or one reuse, of a fingerprint.
///
/// A primary context executes its job and collects the contexts it runs as
/// dependencies. A repeat only points at the context it reuses and records
/// an edge under its parent.
pub(crate) struct RunContext {
    pub(crate) slug: Slug,
    pub(crate) collection: CollectionId,
    pub(crate) index: u64,
    pub(crate) up_to_date: bool,
    pub(crate) work: Option<Work>,
    pub(crate) copy_of: Option<ContextId>,
    pub(crate) copies: Vec<ContextId>,
    /// `None` for repeats.
    pub(crate) dependencies: Option<Vec<ContextId>>,
    pub(crate) guards: Option<Vec<Arc<dyn Guard>>>,
    pub(crate) parent: Option<ContextId>,
}

impl RunContext {
    pub(crate) fn is_repeat(&self) -> bool {
        self.dependencies.is_none()
    }
}

/// Every iteration ever created for one fingerprint.
pub(crate) struct Collection {
    pub(crate) slug: Slug,
    pub(crate) main: Option<ContextId>,
    pub(crate) iterations: Vec<ContextId>,
}

/// The scheduler's memo: contexts and collections in two arenas plus the
/// fingerprint lookup.
#[derive(Default)]
pub(crate) struct State {
    contexts: Vec<RunContext>,
    collections: Vec<Collection>,
    lookup: HashMap<Slug, CollectionId>,
    next_index: u64,
}

impl State {
    pub(crate) fn context(&self, id: ContextId) -> &RunContext {
        &self.contexts[id.0]
    }

    pub(crate) fn context_mut(&mut self, id: ContextId) -> &mut RunContext {
        &mut self.contexts[id.0]
    }

    pub(crate) fn contexts(&self) -> impl Iterator<Item = (ContextId, &RunContext)> {
        self.contexts
            .iter()
            .enumerate()
            .map(|(i, ctx)| (ContextId(i), ctx))
    }

    pub(crate) fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub(crate) fn collections(&self) -> impl Iterator<Item = (CollectionId, &Collection)> {
        self.collections
            .iter()
            .enumerate()
            .map(|(i, collection)| (CollectionId(i), collection))
    }

    pub(crate) fn collection(&self, id: CollectionId) -> &Collection {
        &self.collections[id.0]
    }

    pub(crate) fn find(&self, slug: &Slug) -> Option<CollectionId> {
        self.lookup.get(slug).copied()
    }

    pub(crate) fn find_or_create(&mut self, slug: &Slug) -> CollectionId {
        if let Some(id) = self.find(slug) {
            return id;
        }

        let id = CollectionId(self.collections.len());
        self.collections.push(Collection {
            slug: slug.clone(),
            main: None,
            iterations: Vec::new(),
        });
        self.lookup.insert(slug.clone(), id);
        id
    }

    /// The work of the collection's main iteration, if it can be reused.
    pub(crate) fn fresh_work(&self, collection: CollectionId) -> Option<(ContextId, Work)> {
        let main = self.collection(collection).main?;
        let ctx = self.context(main);
        match (&ctx.work, ctx.up_to_date) {
            (Some(work), true) => Some((main, work.clone())),
            _ => None,
        }
    }

    pub(crate) fn create_primary(
        &mut self,
        slug: Slug,
        collection: CollectionId,
        parent: Option<ContextId>,
    ) -> ContextId {
        self.push(slug, collection, parent, None, Some(Vec::new()))
    }

    pub(crate) fn create_repeat(
        &mut self,
        slug: Slug,
        collection: CollectionId,
        parent: Option<ContextId>,
        copy_of: Option<ContextId>,
    ) -> ContextId {
        let id = self.push(slug, collection, parent, copy_of, None);
        if let Some(of) = copy_of {
            self.context_mut(of).copies.push(id);
        }
        id
    }

    fn push(
        &mut self,
        slug: Slug,
        collection: CollectionId,
        parent: Option<ContextId>,
        copy_of: Option<ContextId>,
        dependencies: Option<Vec<ContextId>>,
    ) -> ContextId {
        self.next_index += 1;

        let id = ContextId(self.contexts.len());
        self.contexts.push(RunContext {
            slug,
            collection,
            index: self.next_index,
            up_to_date: true,
            work: None,
            copy_of,
            copies: Vec::new(),
            dependencies,
            guards: None,
            parent,
        });
        self.collections[collection.0].iterations.push(id);

        if let Some(parent) = parent {
            self.add_dependency(parent, id);
        }

        id
    }

    /// Records `child` under `parent`. A repeat parent has no edges of its
    /// own, so the edge goes to the context it reuses.
    fn add_dependency(&mut self, parent: ContextId, child: ContextId) {
        let mut target = parent;
        let mut seen = HashSet::new();
        while seen.insert(target) {
            let ctx = self.context(target);
            if !ctx.is_repeat() {
                break;
            }
            match ctx.copy_of {
                Some(of) => target = of,
                None => return,
            }
        }

        if let Some(dependencies) = &mut self.context_mut(target).dependencies {
            dependencies.push(child);
        }
    }

    /// Makes `id` the iteration that later runs of its fingerprint reuse.
    pub(crate) fn publish(&mut self, id: ContextId) {
        let collection = self.context(id).collection;
        self.collections[collection.0].main = Some(id);
    }

    /// The recorded dependencies of `from`, flattened to contexts that have
    /// no dependencies of their own. Uncacheable contexts are skipped since
    /// they are never reused.
    pub(crate) fn leaves(&self, from: ContextId) -> Vec<ContextId> {
        let mut acc = Vec::new();
        let mut seen = HashSet::new();
        self.collect_leaves(from, &mut seen, &mut acc);
        acc
    }

    fn collect_leaves(
        &self,
        from: ContextId,
        seen: &mut HashSet<ContextId>,
        acc: &mut Vec<ContextId>,
    ) {
        let Some(dependencies) = &self.context(from).dependencies else {
            return;
        };

        for &dep in dependencies {
            if !seen.insert(dep) {
                continue;
            }

            let ctx = self.context(dep);
            if !ctx.slug.is_cacheable() {
                continue;
            }

            match &ctx.dependencies {
                Some(nested) if !nested.is_empty() => self.collect_leaves(dep, seen, acc),
                _ => acc.push(dep),
            }
        }
    }

    /// Marks every collection that transitively depends on `slug` as stale.
    ///
    /// Returns the number of collections touched, or zero when the
    /// fingerprint was never seen.
    pub(crate) fn invalidate(&mut self, slug: &Slug) -> usize {
        let Some(start) = self.find(slug) else {
            return 0;
        };

        let mut seen = HashSet::from([start]);
        let mut queue = vec![start];

        while let Some(collection) = queue.pop() {
            for &iteration in &self.collections[collection.0].iterations {
                let ctx = &mut self.contexts[iteration.0];
                ctx.up_to_date = false;

                if let Some(parent) = ctx.parent {
                    let parent = self.contexts[parent.0].collection;
                    if seen.insert(parent) {
                        queue.push(parent);
                    }
                }
            }
        }

        seen.len()
    }

    /// The nearest context, starting at `from` and walking up the parents,
    /// that already holds a guard set.
    pub(crate) fn guard_owner(&self, from: ContextId) -> Option<ContextId> {
        let mut current = Some(from);
        let mut seen = HashSet::new();

        while let Some(id) = current {
            if !seen.insert(id) {
                break;
            }
            let ctx = self.context(id);
            if ctx.guards.is_some() {
                return Some(id);
            }
            current = ctx.parent;
        }

        None
    }

    pub(crate) fn take_guards(&mut self, id: ContextId) -> Vec<Arc<dyn Guard>> {
        self.context_mut(id).guards.take().unwrap_or_default()
    }
}
